//! Persisted Raft metadata.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::Result;

/// The durable node state, written on every term bump, vote change or
/// membership change and stored under the `@State` key.
///
/// `members` always contains the local node plus its known peers. Voting
/// for nobody is encoded as the empty string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub term: i32,
    #[serde(rename = "voteFor", default)]
    pub vote_for: String,
    #[serde(default)]
    pub members: HashMap<String, String>,
}

impl State {
    /// Encode as a single-line blob.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a blob produced by [`State::encode`].
    ///
    /// Absent or unreadable input yields the zero state with an empty
    /// member map, which is what a freshly provisioned node starts from.
    pub fn decode(data: &str) -> Self {
        serde_json::from_str(data).unwrap_or_default()
    }
}

//! Shared message types for the bulletin board demo: clients post notes
//! to any server, and every replica of the targeted shards prints the
//! same board in the same order.

use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Note {
    pub author: String,
    pub body: String,
}

/// What a client sends to a server: the note, and the shards whose boards
/// it should appear on.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Post {
    pub note: Note,
    pub shards: Vec<abcast::ShardId>,
}

impl std::fmt::Display for Note {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}: {}", self.author, self.body)
    }
}

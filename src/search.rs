use crate::error::Result;
use crate::types::{NodeConfig, QueueEntry, TrackInfo, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A track resolved by a node's track loader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedTrack {
    /// Opaque encoded track handle
    pub track: String,
    pub info: TrackInfo,
}

impl LoadedTrack {
    /// Queue entry requested by `requester_id`
    pub fn into_entry(self, requester_id: UserId) -> QueueEntry {
        QueueEntry::new(requester_id, self.track, self.info)
    }
}

/// Track lookup against a node's HTTP API
///
/// The player core never searches; it only plays tokens resolved here.
#[async_trait]
pub trait TrackSearch: Send + Sync {
    async fn search(&self, node: &NodeConfig, query: &str) -> Result<Vec<LoadedTrack>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_loadtracks_entry() {
        let raw = r#"{
            "track": "QAAAjQIAJVJpY2sg",
            "info": {
                "identifier": "dQw4w9WgXcQ",
                "isSeekable": true,
                "author": "RickAstleyVEVO",
                "length": 212000,
                "isStream": false,
                "position": 0,
                "title": "Rick Astley - Never Gonna Give You Up",
                "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
            }
        }"#;

        let loaded: LoadedTrack = serde_json::from_str(raw).unwrap();
        let entry = loaded.into_entry(99);

        assert_eq!(entry.requester_id, 99);
        assert!(!entry.looping);
        assert_eq!(entry.info.duration_ms, 212000);
        assert_eq!(entry.info.id, "dQw4w9WgXcQ");
    }
}

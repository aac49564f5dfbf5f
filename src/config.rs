use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Default maximum number of simultaneous active connections.
pub const DEFAULT_SWARM_CAPACITY: usize = 4;

/// Default alignment/chunk hint for range assignment (128 KiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024;

/// Smallest interval worth splitting for parallel download (16 KiB).
pub const DEFAULT_MIN_SPLIT_SIZE: u64 = 16 * 1024;

/// Extensions classified as previewable media by default.
static DEFAULT_PREVIEWABLE_EXTENSIONS: Lazy<Vec<String>> = Lazy::new(|| {
    [
        "mp3", "mp4", "m4a", "avi", "mkv", "mov", "mpg", "mpeg", "ogg", "wav", "wmv", "flac",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
});

/// Tunables for the swarming download core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwarmConfig {
    /// Maximum simultaneous active (non-queued) workers.
    pub swarm_capacity: usize,
    /// Direct TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// How long to wait for a pushed connection before giving up.
    pub push_connect_timeout_ms: u64,
    /// Shorter push wait for sources learned from alternate-location
    /// gossip, where only a UDP push request was sent.
    pub alt_push_connect_timeout_ms: u64,
    /// Busy backoff when a source says try-again-later without a schedule
    /// and nothing else is downloading, in seconds.
    pub busy_retry_secs: u64,
    /// Raised busy backoff while other workers are active, in seconds.
    pub busy_retry_active_secs: u64,
    /// Backoff after a transfer failure, in seconds.
    pub failed_retry_secs: u64,
    /// Backoff for sources that have none of the ranges we need, in seconds.
    pub no_ranges_retry_secs: u64,
    /// Failures tolerated before a source is dropped from the mesh.
    pub max_source_failures: u32,
    /// Block-size alignment hint handed to the range selectors.
    pub block_size: u64,
    /// Smallest range worth assigning when free space runs low.
    pub min_split_size: u64,
    /// Randomized selection stops fragmenting past this many fragments.
    pub max_fragments: usize,
    /// Extensions classified as previewable media; these bias range
    /// selection toward the start of the file.
    pub previewable_extensions: Vec<String>,
    /// Whether the capability-ordered ranker may be used at all.
    pub capability_ranking: bool,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        SwarmConfig {
            swarm_capacity: DEFAULT_SWARM_CAPACITY,
            connect_timeout_ms: 10_000,
            push_connect_timeout_ms: 20_000,
            alt_push_connect_timeout_ms: 6_000,
            busy_retry_secs: 60,
            busy_retry_active_secs: 600,
            failed_retry_secs: 60,
            no_ranges_retry_secs: 300,
            max_source_failures: 2,
            block_size: DEFAULT_BLOCK_SIZE,
            min_split_size: DEFAULT_MIN_SPLIT_SIZE,
            max_fragments: 16,
            previewable_extensions: DEFAULT_PREVIEWABLE_EXTENSIONS.clone(),
            capability_ranking: true,
        }
    }
}

impl SwarmConfig {
    /// Whether a file name counts as previewable media.
    pub fn is_previewable(&self, file_name: &str) -> bool {
        match file_name.rsplit_once('.') {
            Some((_, ext)) => {
                let ext = ext.to_ascii_lowercase();
                self.previewable_extensions.iter().any(|e| *e == ext)
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_previewable_extension_matching() {
        let config = SwarmConfig::default();
        assert!(config.is_previewable("video.MP4"));
        assert!(config.is_previewable("album/track.mp3"));
        assert!(!config.is_previewable("archive.iso"));
        assert!(!config.is_previewable("noextension"));
    }

    #[test]
    fn test_config_deserializes_with_partial_fields() {
        let config: SwarmConfig =
            serde_json::from_str(r#"{"swarmCapacity": 8, "capabilityRanking": false}"#).unwrap();
        assert_eq!(config.swarm_capacity, 8);
        assert!(!config.capability_ranking);
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
    }
}

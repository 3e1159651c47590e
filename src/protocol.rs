//! Shared protocol constants for the Lynx line protocol

/// Default port of the peer transfer service
pub const SERVER_PORT: u16 = 8080;

/// Default port of the tracker service
pub const TRACKER_PORT: u16 = 9000;

/// How many times a whole fetch walk over the roster is repeated
pub const RECONN_ATTEMPTS: usize = 3;

/// Separator between keys and values in `meta.info`, `swarm.info` and `lynks.txt`
pub const RECORD_SEPARATOR: &str = ":::";

/// Terminates one file record in `meta.info`
pub const END_OF_ENTRY: &str = ":#!";

/// Placeholder stored in the reserved chunk digest field
pub const CHUNK_PLACEHOLDER: &str = "chunking not currently implemented";

/// Manifest file name inside every lynk directory
pub const META_FILE: &str = "meta.info";

/// Roster file name inside a tracker directory
pub const SWARM_FILE: &str = "swarm.info";

/// Lynk index in the node home
pub const LYNK_INDEX_FILE: &str = "lynks.txt";

/// Persisted X25519 secret in the node home
pub const IDENTITY_FILE: &str = "identity.key";

/// Prefix of in-flight download temp files; skipped by directory scans
pub const TEMP_PREFIX: &str = ".lynx-";

/// Suffix of the tracker directory inside a lynk: `<lynk>_Tracker`
pub const TRACKER_DIR_SUFFIX: &str = "_Tracker";

/// Longest accepted request line; longer lines are a syntax error
pub const MAX_REQUEST_LINE: usize = 4096;

/// Maximum sealed body (push or file payload). Whole-file transfers are buffered.
pub const MAX_BODY_SIZE: u64 = 2 * 1024 * 1024 * 1024;

// Request verbs (keep spelling stable, peers match on them verbatim)
pub mod verb {
    pub const SWARM_REQUEST: &str = "Swarm_Request";
    pub const META_REQUEST: &str = "Meta_Request";
    pub const META_PUSH: &str = "Meta_Push";
    pub const DISCONNECT: &str = "Disconnect";
    pub const HAVE_FILE: &str = "Do_You_Have_FileName";
    pub const TRACKER_REQUEST: &str = "Tracker_Request";
}

// Single-line replies of the peer service
pub mod reply {
    pub const YES: &str = "YES";
    pub const NO: &str = "NO";
}

// Centralized timeout defaults, overridable through NodeConfig
pub mod timeouts {
    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 2_000;

    // Base timeout for request-line reads and small replies (ms)
    pub const REQUEST_LINE_MS: u64 = 5_000;

    // Base timeout for body reads/writes (ms)
    pub const IO_BASE_MS: u64 = 30_000;

    // Additional timeout per MB of body (ms)
    pub const PER_MB_MS: u64 = 50;

    // Calculate a body deadline based on payload size (ms)
    // base + PER_MB_MS per started MB
    pub fn body_deadline_ms(base_ms: u64, payload_len: u64) -> u64 {
        let mb = payload_len.div_ceil(1_048_576);
        base_ms + mb * PER_MB_MS
    }
}

#[cfg(test)]
mod tests {
    use super::timeouts::*;

    #[test]
    fn body_deadline_scales_per_started_mb() {
        assert_eq!(body_deadline_ms(1000, 0), 1000);
        assert_eq!(body_deadline_ms(1000, 1), 1000 + PER_MB_MS);
        assert_eq!(body_deadline_ms(1000, 1_048_576), 1000 + PER_MB_MS);
        assert_eq!(body_deadline_ms(1000, 1_048_577), 1000 + 2 * PER_MB_MS);
    }
}

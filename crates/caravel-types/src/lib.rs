//! Shared value types and constants for the caravel transfer engine.
//!
//! This crate is intentionally minimal: the instance/chunk/bucket value
//! types that travel on the wire, the error taxonomy, and the serde
//! helpers for the string-encoded 64-bit integers of the JSON protocol.
//! No I/O, no HTTP.

pub mod bucket;
pub mod compression;
pub mod error;
pub mod instance;
pub mod wire;

pub use bucket::{Chunk, TransferBucket};
pub use compression::BucketCompression;
pub use error::{CaravelError, Result};
pub use instance::InstanceInfo;

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * 1024;

/// Job types registered with the host job scheduler.
pub const JOB_TYPE_PULL: &str = "PullTransfer";
pub const JOB_TYPE_PUSH: &str = "PushTransfer";

/// Name under which a node advertises the transfer feature on `/plugins`.
pub const PLUGIN_NAME: &str = "transfers";

// REST surface of a caravel node. The chunk prefix is baked into the
// pull URLs exchanged between peers, so it is a protocol constant rather
// than a deployment choice.
pub const URI_CHUNKS: &str = "/transfers/chunks";
pub const URI_LOOKUP: &str = "/transfers/lookup";
pub const URI_PEERS: &str = "/transfers/peers";
pub const URI_PLUGINS: &str = "/plugins";
pub const URI_PULL: &str = "/transfers/pull";
pub const URI_PUSH: &str = "/transfers/push";
pub const URI_SEND: &str = "/transfers/send";
pub const URI_JOBS: &str = "/jobs";

/// Pull GET URLs are kept below this budget so they work across common
/// client, server and proxy limits ("if you keep URLs under 2000
/// characters, they'll work in virtually any combination of client and
/// server software"). 44 characters are reserved for one more
/// hex-and-dots instance identifier.
pub const MAX_URL_LENGTH: usize = 2000 - 44;

/// Convert a byte count to whole megabytes, rounding half up.
pub fn to_megabytes(value: u64) -> u64 {
    (value + MB / 2) / MB
}

/// Convert a byte count to whole kilobytes, rounding half up.
pub fn to_kilobytes(value: u64) -> u64 {
    (value + KB / 2) / KB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_conversions_round_half_up() {
        assert_eq!(to_kilobytes(2048), 2);
        assert_eq!(to_kilobytes(1000), 1);
        assert_eq!(to_kilobytes(500), 0);

        assert_eq!(to_megabytes(2048 * 1024), 2);
        assert_eq!(to_megabytes(1000 * 1024), 1);
        assert_eq!(to_megabytes(500 * 1024), 0);
    }
}

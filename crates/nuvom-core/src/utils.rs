//! Small shared utility functions
use rand::distr::{Alphanumeric, SampleString};

/// The length of a generated job id.
pub const JOB_ID_LEN: usize = 24;

/// Generates a random alphanumeric job id.
pub fn random_id() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), JOB_ID_LEN)
}

/// Returns the current time as nanoseconds since the Unix epoch, used to
/// build lexicographically-sortable file queue filenames.
pub fn now_ns() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_nanos()
}

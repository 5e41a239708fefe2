//! Binary serialization codec for job records
//!
//! Cross-platform, deterministic for equal inputs, and total over every
//! field of [`Job`]. MessagePack (via `rmp-serde`) rather than a
//! schema-driven format: `args`/`kwargs` are `serde_json::Value`, whose
//! `Deserialize` impl is untyped and needs a self-describing wire format
//! to round-trip at all. Decode failures are always surfaced as
//! [`NuvomError::CorruptRecord`], never as a generic codec error, so
//! callers can uniformly treat them as quarantine-worthy.
use crate::error::{NuvomError, Result};
use crate::job::Job;

/// The codec version tag written ahead of every encoded record. Bumped on
/// breaking wire-format changes; `decode` rejects records whose tag
/// doesn't match.
const CODEC_VERSION: u8 = 1;

/// Encodes a job into its durable binary representation.
pub fn encode(job: &Job) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(256);
    buf.push(CODEC_VERSION);
    buf.extend_from_slice(&rmp_serde::to_vec(job)?);
    Ok(buf)
}

/// Decodes a job from its durable binary representation.
pub fn decode(bytes: &[u8]) -> Result<Job> {
    let (version, payload) = bytes
        .split_first()
        .ok_or_else(|| NuvomError::CorruptRecord("empty record".to_string()))?;
    if *version != CODEC_VERSION {
        return Err(NuvomError::CorruptRecord(format!(
            "unsupported codec version {version}"
        )));
    }
    rmp_serde::from_slice(payload)
        .map_err(|e| NuvomError::CorruptRecord(format!("decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;

    #[test]
    fn round_trips_a_job() {
        let mut job = Job::new(
            "add",
            vec![serde_json::json!(2), serde_json::json!(3)],
            serde_json::Map::new(),
            JobOptions {
                max_retries: 3,
                tags: vec!["math".to_string()],
                description: Some("adds two numbers".to_string()),
                ..Default::default()
            },
        );
        job.mark_enqueued();
        let encoded = encode(&job).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.id, job.id);
        assert_eq!(decoded.func_name, job.func_name);
        assert_eq!(decoded.args, job.args);
        assert_eq!(decoded.max_retries, job.max_retries);
        assert_eq!(decoded.retries_left, job.retries_left);
        assert_eq!(decoded.tags, job.tags);
        assert_eq!(decoded.description, job.description);
        assert_eq!(decoded.status, job.status);
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(decode(&[]), Err(NuvomError::CorruptRecord(_))));
    }

    #[test]
    fn rejects_mismatched_version() {
        let bytes = [CODEC_VERSION + 1, 0, 0, 0];
        assert!(matches!(
            decode(&bytes),
            Err(NuvomError::CorruptRecord(_))
        ));
    }

    #[test]
    fn rejects_truncated_payload() {
        let job = Job::new("add", vec![], serde_json::Map::new(), JobOptions::default());
        let mut encoded = encode(&job).unwrap();
        encoded.truncate(encoded.len() / 2);
        assert!(matches!(decode(&encoded), Err(NuvomError::CorruptRecord(_))));
    }
}

//! Uniqueness digests.
//!
//! A digest identifies "the same work": while any job holding a digest
//! is non-terminal, further enqueues with that digest are rejected.
//! The digest is computed here; enforcement (the insert-time check and
//! the terminal-state clear) is delegated to the backend, which must
//! make both atomic with the corresponding job write.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::job::{NewJob, UniquenessConfig};

/// Compute the uniqueness digest for a job class and its normalized
/// args, or from an explicit caller-supplied key.
pub fn compute_digest(class: &str, args: &[Value], key: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    match key {
        Some(key) => {
            hasher.update(b"key:");
            hasher.update(key.as_bytes());
        }
        None => {
            hasher.update(class.as_bytes());
            hasher.update(b"\0");
            // serde_json renders a Value deterministically, so equal
            // args always hash equally.
            for arg in args {
                hasher.update(arg.to_string().as_bytes());
                hasher.update(b"\0");
            }
        }
    }
    hex(&hasher.finalize())
}

/// Stamp `unique_digest` onto a job definition when a uniqueness
/// policy is present and no explicit digest was supplied.
pub fn stamp(mut new: NewJob) -> NewJob {
    if new.unique_digest.is_none() {
        if let Some(UniquenessConfig { key, .. }) = &new.uniqueness {
            new.unique_digest = Some(compute_digest(&new.class, &new.args, key.as_deref()));
        }
    }
    new
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

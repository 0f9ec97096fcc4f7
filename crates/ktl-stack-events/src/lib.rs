//! Hash-chained run event records.
//!
//! Every persisted event carries a sha256 digest computed over a canonical
//! NUL-separated preimage that includes the previous event's digest, plus a
//! CRC32-IEEE of the same preimage for cheap corruption checks. The first
//! event of a run has an empty `prev_digest`; for every later event,
//! `events[i].prev_digest == events[i-1].digest`. Ephemeral events
//! (`NODE_LOG`) never enter the chain.

use sha2::{Digest, Sha256};

use ktl_stack_types::RunEvent;

/// Version tag prefixed to every event digest preimage.
pub const EVENT_VERSION_TAG: &str = "ktl.stack-event.v1";

/// A break found while verifying a run's event chain.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("event {seq}: expected prev_digest {want:?}, found {got:?}")]
    BrokenLink { seq: u64, want: String, got: String },
    #[error("event {seq}: stored digest {got:?} does not match recomputed {want:?}")]
    DigestMismatch { seq: u64, want: String, got: String },
    #[error("event {seq}: stored crc32 {got} does not match recomputed {want}")]
    CrcMismatch { seq: u64, want: u32, got: u32 },
    #[error("event {seq}: sequence regressed (previous was {prev})")]
    SequenceRegression { seq: u64, prev: u64 },
    #[error("first event must have an empty prev_digest, found {got:?}")]
    DanglingHead { got: String },
    #[error("ephemeral event {seq} must not be part of a persisted chain")]
    EphemeralInChain { seq: u64 },
}

/// Canonical digest preimage for an event. The digest and crc fields
/// themselves are excluded; everything else that is persisted is included,
/// in fixed order.
fn preimage(event: &RunEvent, prev_digest: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    let mut push = |element: &str| {
        out.extend_from_slice(element.as_bytes());
        out.push(0);
    };
    push(EVENT_VERSION_TAG);
    push(&event.seq.to_string());
    push(&event.ts_ns().to_string());
    push(&event.run_id);
    push(event.node_id.as_deref().unwrap_or(""));
    push(event.event_type.as_str());
    push(&event.attempt.to_string());
    push(&event.message);
    // BTreeMap keys serialize sorted, so this is canonical.
    push(&serde_json::to_string(&event.fields).unwrap_or_default());
    match &event.error {
        Some(err) => {
            push(err.class.as_str());
            push(&err.message);
            push(&err.digest);
        }
        None => push(""),
    }
    push(prev_digest);
    out
}

/// Seal an event into the chain: assign `seq`, link `prev_digest`, compute
/// digest and crc32.
pub fn seal_event(event: &mut RunEvent, seq: u64, prev_digest: &str) {
    event.seq = seq;
    event.prev_digest = prev_digest.to_string();
    let bytes = preimage(event, prev_digest);
    event.digest = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
    event.crc32 = crc32fast::hash(&bytes);
}

/// Recompute one event's digest and crc and compare against the stored
/// values.
pub fn verify_event(event: &RunEvent) -> Result<(), ChainError> {
    if event.event_type.is_ephemeral() {
        return Err(ChainError::EphemeralInChain { seq: event.seq });
    }
    let bytes = preimage(event, &event.prev_digest);
    let want_digest = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
    if event.digest != want_digest {
        return Err(ChainError::DigestMismatch {
            seq: event.seq,
            want: want_digest,
            got: event.digest.clone(),
        });
    }
    let want_crc = crc32fast::hash(&bytes);
    if event.crc32 != want_crc {
        return Err(ChainError::CrcMismatch {
            seq: event.seq,
            want: want_crc,
            got: event.crc32,
        });
    }
    Ok(())
}

/// Verify a full run chain: per-event digests and crcs, link integrity, and
/// sequence monotonicity. Accepts an empty slice.
pub fn verify_run_event_chain(events: &[RunEvent]) -> Result<(), ChainError> {
    let mut prev: Option<&RunEvent> = None;
    for event in events {
        verify_event(event)?;
        match prev {
            None => {
                if !event.prev_digest.is_empty() {
                    return Err(ChainError::DanglingHead {
                        got: event.prev_digest.clone(),
                    });
                }
            }
            Some(previous) => {
                if event.seq <= previous.seq {
                    return Err(ChainError::SequenceRegression {
                        seq: event.seq,
                        prev: previous.seq,
                    });
                }
                if event.prev_digest != previous.digest {
                    return Err(ChainError::BrokenLink {
                        seq: event.seq,
                        want: previous.digest.clone(),
                        got: event.prev_digest.clone(),
                    });
                }
            }
        }
        prev = Some(event);
    }
    Ok(())
}

/// Store-owned chain head: hands out sequence numbers and links each sealed
/// event to the last digest it produced.
#[derive(Debug, Clone, Default)]
pub struct ChainHead {
    next_seq: u64,
    last_digest: String,
}

impl ChainHead {
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            last_digest: String::new(),
        }
    }

    /// Resume a chain from persisted state.
    pub fn resume(last_seq: u64, last_digest: String) -> Self {
        Self {
            next_seq: last_seq + 1,
            last_digest,
        }
    }

    pub fn last_digest(&self) -> &str {
        &self.last_digest
    }

    /// Sequence number the next sealed event will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Seal the next event in the chain.
    pub fn seal(&mut self, event: &mut RunEvent) {
        seal_event(event, self.next_seq, &self.last_digest);
        self.next_seq += 1;
        self.last_digest = event.digest.clone();
    }
}

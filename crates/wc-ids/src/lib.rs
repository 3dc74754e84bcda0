//! Identifiers and envelope model for the work coordinator.
//!
//! Every id handed across a process boundary (`message_id`, `stream_id`,
//! `event_id`, `instance_id`) is a UUIDv7: the high bits are a millisecond
//! timestamp, so ids sort naturally on insertion order without a separate
//! sequence column. This crate owns id generation/parsing and the
//! [`MessageEnvelope`]/[`Hop`] model that travels with a message end to end.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

mod clock;
mod envelope;

pub use clock::{Clock, SystemClock};
pub use envelope::{Hop, HopType, MessageEnvelope};

/// Error type for id parsing failures.
#[derive(Debug, Error)]
pub enum IdError {
    #[error("invalid id for field '{field}': {details}")]
    InvalidFormat { field: String, details: String },

    #[error("missing required id field: {field}")]
    MissingField { field: String },
}

/// Records how a [`Uuid`] was produced, for tracing and validation.
///
/// Distinguishing `Parsed` (we round-tripped a caller-supplied string) from
/// `External` (the id arrived over the wire with no local parse step) lets
/// call sites reason about provenance without re-deriving it from the
/// version bits every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provenance {
    GeneratedV7,
    GeneratedV4,
    ParsedV7,
    ExternalV7,
}

/// A [`Uuid`] alongside the [`Provenance`] tag describing how it was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedId {
    pub id: Uuid,
    pub provenance: Provenance,
}

impl TaggedId {
    pub fn new(id: Uuid, provenance: Provenance) -> Self {
        Self { id, provenance }
    }
}

/// Generates UUIDv7 ids from an injectable clock, defaulting to the system
/// clock. Tests can supply a deterministic clock to get strictly
/// increasing ids without sleeping between calls.
pub struct IdProvider<C: Clock = SystemClock> {
    clock: C,
}

impl Default for IdProvider<SystemClock> {
    fn default() -> Self {
        Self { clock: SystemClock }
    }
}

impl IdProvider<SystemClock> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C: Clock> IdProvider<C> {
    pub fn with_clock(clock: C) -> Self {
        Self { clock }
    }

    /// Generate a new time-ordered id.
    pub fn new_v7(&self) -> TaggedId {
        let millis = self.clock.now_millis();
        let ts = uuid::Timestamp::from_unix(uuid::NoContext, millis / 1000, 0);
        TaggedId::new(Uuid::new_v7(ts), Provenance::GeneratedV7)
    }

    pub fn new_message_id(&self) -> Uuid {
        self.new_v7().id
    }

    pub fn new_correlation_id(&self) -> Uuid {
        self.new_v7().id
    }
}

/// Generate a new UUIDv7 using the wall clock. Convenience wrapper around
/// [`IdProvider::default`] for call sites that don't need clock injection.
pub fn new_guid_v7() -> Uuid {
    IdProvider::new().new_v7().id
}

pub fn new_message_id() -> Uuid {
    new_guid_v7()
}

pub fn new_correlation_id() -> Uuid {
    new_guid_v7()
}

/// Parse a UUID from a string, tagging it `ParsedV7` if its version nibble
/// says so, `ExternalV7` otherwise (still a v7-shaped 128 bits, just not one
/// we can prove we generated).
pub fn parse_id(input: &str, field: &str) -> Result<TaggedId, IdError> {
    let id = Uuid::parse_str(input).map_err(|e| IdError::InvalidFormat {
        field: field.to_string(),
        details: e.to_string(),
    })?;
    let provenance = if id.get_version_num() == 7 {
        Provenance::ParsedV7
    } else {
        Provenance::ExternalV7
    };
    Ok(TaggedId::new(id, provenance))
}

/// Parse an optional id (empty string maps to `None`).
pub fn parse_id_opt(input: &str, field: &str) -> Result<Option<TaggedId>, IdError> {
    if input.trim().is_empty() {
        return Ok(None);
    }
    parse_id(input, field).map(Some)
}

/// Fold a sequence of JSON metadata maps right-biased (later entries win),
/// matching [`MessageEnvelope::get_all_metadata`]'s contract. Exposed at the
/// crate root since both the envelope and the coordinator's batch layer need
/// the identical fold when reconstructing metadata from stored rows.
pub fn fold_metadata_right_biased<'a, I>(maps: I) -> HashMap<String, Value>
where
    I: IntoIterator<Item = &'a HashMap<String, Value>>,
{
    let mut out = HashMap::new();
    for m in maps {
        for (k, v) in m {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_V7: &str = "018f4a3e-7c1a-7f20-8a3e-1234567890ab";
    const INVALID: &str = "not-a-uuid";

    #[test]
    fn parse_id_success() {
        let tagged = parse_id(VALID_V7, "message_id").unwrap();
        assert_eq!(tagged.id.to_string(), VALID_V7);
    }

    #[test]
    fn parse_id_failure_includes_field_name() {
        let err = parse_id(INVALID, "stream_id").unwrap_err();
        assert!(matches!(err, IdError::InvalidFormat { .. }));
        assert!(err.to_string().contains("stream_id"));
    }

    #[test]
    fn parse_id_opt_empty_is_none() {
        assert!(parse_id_opt("", "correlation_id").unwrap().is_none());
    }

    #[test]
    fn generated_ids_are_time_ordered() {
        let provider = IdProvider::new();
        let a = provider.new_v7();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = provider.new_v7();
        assert!(a.id.as_bytes() < b.id.as_bytes());
        assert_eq!(a.provenance, Provenance::GeneratedV7);
    }

    #[test]
    fn fold_metadata_right_biased_prefers_later() {
        let mut first = HashMap::new();
        first.insert("k".to_string(), Value::String("first".into()));
        first.insert("only_first".to_string(), Value::Bool(true));
        let mut second = HashMap::new();
        second.insert("k".to_string(), Value::String("second".into()));

        let folded = fold_metadata_right_biased([&first, &second]);
        assert_eq!(folded.get("k").unwrap(), &Value::String("second".into()));
        assert_eq!(folded.get("only_first").unwrap(), &Value::Bool(true));
    }
}

//! The status bitmask shared by outbox, inbox, and perspective-event rows.
//! Kept as a plain `i32` with named constants (never a SQL enum type), per
//! the design decision to preserve bitwise status flags as-is rather than
//! re-architect them into a richer type: transitions are OR/AND-NOT
//! operations against the same bits whether issued from SQL or Rust.

pub const STORED: i32 = 1;
pub const EVENT_STORED: i32 = 2;
pub const PUBLISHED: i32 = 4;
pub const CATCHING_UP: i32 = 8;
pub const FAILED: i32 = 32768;

pub fn has_bit(status: i32, bit: i32) -> bool {
    status & bit != 0
}

pub fn set_bit(status: i32, bit: i32) -> i32 {
    status | bit
}

pub fn clear_bit(status: i32, bit: i32) -> i32 {
    status & !bit
}

/// `failure_reason` codes, persisted as `i32` so an older reader never
/// panics on a value written by a newer process; unrecognized values map to
/// `Unknown` rather than failing to deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FailureReason {
    None = 0,
    TransportNotReady = 1,
    TransportException = 2,
    SerializationError = 3,
    ValidationError = 4,
    MaxAttemptsExceeded = 5,
    LeaseExpired = 6,
    Unknown = 99,
}

impl FailureReason {
    /// Whether a failure of this kind should count against `max_attempts`.
    /// `TransportNotReady` is the one carve-out: the spec treats a
    /// not-ready transport as retryable without burning an attempt, since
    /// the condition reflects local readiness, not a failed delivery.
    pub fn consumes_attempt(self) -> bool {
        !matches!(self, FailureReason::TransportNotReady)
    }

    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureReason::TransportNotReady
                | FailureReason::TransportException
                | FailureReason::LeaseExpired
        )
    }
}

impl From<i32> for FailureReason {
    fn from(value: i32) -> Self {
        match value {
            0 => FailureReason::None,
            1 => FailureReason::TransportNotReady,
            2 => FailureReason::TransportException,
            3 => FailureReason::SerializationError,
            4 => FailureReason::ValidationError,
            5 => FailureReason::MaxAttemptsExceeded,
            6 => FailureReason::LeaseExpired,
            _ => FailureReason::Unknown,
        }
    }
}

impl From<FailureReason> for i32 {
    fn from(value: FailureReason) -> Self {
        value as i32
    }
}

/// How a claimed work row relates to the instance that just claimed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkFlags {
    /// Created by this flush.
    NewlyStored,
    /// Claimed from a foreign instance after its lease expired.
    Reclaimed,
    /// Unfinished work left over from this instance's own prior lease.
    Inherited,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_helpers_round_trip() {
        let mut status = 0;
        status = set_bit(status, STORED);
        status = set_bit(status, PUBLISHED);
        assert!(has_bit(status, STORED));
        assert!(has_bit(status, PUBLISHED));
        assert!(!has_bit(status, FAILED));

        status = set_bit(status, FAILED);
        assert!(has_bit(status, STORED), "failure preserves prior progress bits");
        status = clear_bit(status, FAILED);
        assert!(!has_bit(status, FAILED));
    }

    #[test]
    fn failure_reason_round_trips_through_i32() {
        for reason in [
            FailureReason::None,
            FailureReason::TransportNotReady,
            FailureReason::TransportException,
            FailureReason::SerializationError,
            FailureReason::ValidationError,
            FailureReason::MaxAttemptsExceeded,
            FailureReason::LeaseExpired,
        ] {
            let code: i32 = reason.into();
            assert_eq!(FailureReason::from(code), reason);
        }
    }

    #[test]
    fn unrecognized_code_maps_to_unknown_not_a_panic() {
        assert_eq!(FailureReason::from(42), FailureReason::Unknown);
    }

    #[test]
    fn transport_not_ready_does_not_consume_an_attempt() {
        assert!(!FailureReason::TransportNotReady.consumes_attempt());
        assert!(FailureReason::TransportException.consumes_attempt());
        assert!(FailureReason::ValidationError.consumes_attempt());
    }
}

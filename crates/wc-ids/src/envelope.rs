use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Whether a [`Hop`] describes the message's own journey (`Current`) or an
/// ancestor it was caused by (`Causation`). Current-accessors on
/// [`MessageEnvelope`] only ever look at `Current` hops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopType {
    Current,
    Causation,
}

/// One entry in a message's journey log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hop {
    pub hop_type: HopType,
    pub service_instance: Uuid,
    pub timestamp: DateTime<Utc>,
    pub topic: Option<String>,
    pub stream_key: Option<String>,
    pub partition_index: Option<i32>,
    pub sequence_number: Option<i64>,
    pub execution_strategy: Option<String>,
    pub security_context: Option<String>,
    pub trail: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub policy_decision: Option<String>,
    pub caller_member: Option<String>,
    pub caller_file: Option<String>,
    pub caller_line: Option<u32>,
    pub duration_ms: Option<i64>,
    pub causation_id: Option<Uuid>,
    pub causation_type: Option<String>,
}

impl Hop {
    /// Start a `Current` hop for `service_instance` at `timestamp`, the
    /// minimum a hop needs per the envelope invariant.
    pub fn current(service_instance: Uuid, timestamp: DateTime<Utc>) -> Self {
        Self {
            hop_type: HopType::Current,
            service_instance,
            timestamp,
            topic: None,
            stream_key: None,
            partition_index: None,
            sequence_number: None,
            execution_strategy: None,
            security_context: None,
            trail: None,
            metadata: HashMap::new(),
            policy_decision: None,
            caller_member: None,
            caller_file: None,
            caller_line: None,
            duration_ms: None,
            causation_id: None,
            causation_type: None,
        }
    }

    pub fn causation(service_instance: Uuid, timestamp: DateTime<Utc>) -> Self {
        Self {
            hop_type: HopType::Causation,
            ..Self::current(service_instance, timestamp)
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_stream_key(mut self, stream_key: impl Into<String>) -> Self {
        self.stream_key = Some(stream_key.into());
        self
    }

    pub fn with_partition(mut self, partition_index: i32) -> Self {
        self.partition_index = Some(partition_index);
        self
    }

    pub fn with_sequence(mut self, sequence_number: i64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_policy_decision(mut self, decision: impl Into<String>) -> Self {
        self.policy_decision = Some(decision.into());
        self
    }
}

/// A payload wrapped with its journey log. The first hop fixes the
/// envelope's `message_timestamp`, `correlation_id`, and initial
/// `causation_id`; every subsequent hop is appended via [`Self::add_hop`].
///
/// # Invariant
/// Every envelope has at least one hop, and every hop has a non-null
/// `service_instance` and `timestamp` — enforced by construction: there is
/// no way to build a `MessageEnvelope` without supplying a first hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub message_id: Uuid,
    pub correlation_id: Uuid,
    pub payload: T,
    hops: Vec<Hop>,
}

impl<T> MessageEnvelope<T> {
    pub fn new(message_id: Uuid, correlation_id: Uuid, payload: T, first_hop: Hop) -> Self {
        Self {
            message_id,
            correlation_id,
            payload,
            hops: vec![first_hop],
        }
    }

    pub fn add_hop(&mut self, hop: Hop) {
        self.hops.push(hop);
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn message_timestamp(&self) -> DateTime<Utc> {
        self.hops[0].timestamp
    }

    fn current_hops(&self) -> impl Iterator<Item = &Hop> {
        self.hops.iter().filter(|h| h.hop_type == HopType::Current)
    }

    /// Most recent non-empty `topic` among `Current` hops.
    pub fn current_topic(&self) -> Option<&str> {
        self.current_hops()
            .rev()
            .find_map(|h| h.topic.as_deref())
    }

    pub fn current_stream_key(&self) -> Option<&str> {
        self.current_hops()
            .rev()
            .find_map(|h| h.stream_key.as_deref())
    }

    pub fn current_partition(&self) -> Option<i32> {
        self.current_hops().rev().find_map(|h| h.partition_index)
    }

    pub fn current_sequence(&self) -> Option<i64> {
        self.current_hops().rev().find_map(|h| h.sequence_number)
    }

    pub fn current_security_context(&self) -> Option<&str> {
        self.current_hops()
            .rev()
            .find_map(|h| h.security_context.as_deref())
    }

    pub fn current_metadata(&self, key: &str) -> Option<&Value> {
        self.current_hops()
            .rev()
            .find_map(|h| h.metadata.get(key))
    }

    /// Right-biased fold of every `Current` hop's metadata: later hops win
    /// on key collision. `Causation` hops never contribute.
    pub fn get_all_metadata(&self) -> HashMap<String, Value> {
        crate::fold_metadata_right_biased(self.current_hops().map(|h| &h.metadata))
    }

    /// All recorded policy decisions, in chronological hop order, across
    /// both hop types.
    pub fn get_all_policy_decisions(&self) -> Vec<String> {
        self.hops
            .iter()
            .filter_map(|h| h.policy_decision.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(hop_type: HopType, ts: DateTime<Utc>) -> Hop {
        Hop {
            hop_type,
            ..Hop::current(Uuid::new_v4(), ts)
        }
    }

    #[test]
    fn current_accessors_ignore_causation_hops() {
        let t0 = Utc::now();
        let first = Hop::current(Uuid::new_v4(), t0).with_topic("orders");
        let mut env = MessageEnvelope::new(Uuid::new_v4(), Uuid::new_v4(), "payload", first);

        let mut ancestor = hop(HopType::Causation, t0 + chrono::Duration::seconds(1));
        ancestor.topic = Some("ancestor-topic".to_string());
        env.add_hop(ancestor);

        assert_eq!(env.current_topic(), Some("orders"));
    }

    #[test]
    fn current_accessor_prefers_latest_current_hop() {
        let t0 = Utc::now();
        let first = Hop::current(Uuid::new_v4(), t0).with_topic("orders-v1");
        let mut env = MessageEnvelope::new(Uuid::new_v4(), Uuid::new_v4(), "payload", first);
        env.add_hop(Hop::current(Uuid::new_v4(), t0 + chrono::Duration::seconds(1)).with_topic("orders-v2"));

        assert_eq!(env.current_topic(), Some("orders-v2"));
    }

    #[test]
    fn get_all_metadata_right_biased_fold_excludes_causation() {
        let t0 = Utc::now();
        let first = Hop::current(Uuid::new_v4(), t0).with_metadata("k", Value::from("first"));
        let mut env = MessageEnvelope::new(Uuid::new_v4(), Uuid::new_v4(), "payload", first);
        env.add_hop(
            Hop::current(Uuid::new_v4(), t0 + chrono::Duration::seconds(1))
                .with_metadata("k", Value::from("second")),
        );
        let mut causation_metadata = hop(HopType::Causation, t0 + chrono::Duration::seconds(2));
        causation_metadata
            .metadata
            .insert("k".to_string(), Value::from("ignored"));
        env.add_hop(causation_metadata);

        let folded = env.get_all_metadata();
        assert_eq!(folded.get("k").unwrap(), &Value::from("second"));
    }

    #[test]
    fn get_all_policy_decisions_is_chronological() {
        let t0 = Utc::now();
        let first = Hop::current(Uuid::new_v4(), t0).with_policy_decision("accepted");
        let mut env = MessageEnvelope::new(Uuid::new_v4(), Uuid::new_v4(), "payload", first);
        env.add_hop(
            Hop::causation(Uuid::new_v4(), t0 + chrono::Duration::seconds(1))
                .with_policy_decision("replayed"),
        );

        assert_eq!(
            env.get_all_policy_decisions(),
            vec!["accepted".to_string(), "replayed".to_string()]
        );
    }
}

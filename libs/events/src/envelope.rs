//! Event envelope - the common wrapper for all published events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Event;

/// Metadata stamped on every event at publish time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// When the event was published.
    pub timestamp: DateTime<Utc>,

    /// Owner scope of the VM the event concerns.
    pub namespace: String,

    /// Topic the event was published on.
    pub topic: String,

    pub event: Event,
}

impl EventEnvelope {
    pub fn new(topic: impl Into<String>, event: Event) -> Self {
        Self {
            timestamp: Utc::now(),
            namespace: event.vm_id().namespace().to_string(),
            topic: topic.into(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_id::VmId;

    #[test]
    fn test_envelope_takes_namespace_from_event() {
        let id = VmId::generate("tenant-a", "web").unwrap();
        let envelope = EventEnvelope::new("vm.created", Event::MicroVmSpecCreated { id });

        assert_eq!(envelope.namespace, "tenant-a");
        assert_eq!(envelope.topic, "vm.created");
    }

    #[test]
    fn test_envelope_json_shape() {
        let id = VmId::generate("tenant-a", "web").unwrap();
        let envelope =
            EventEnvelope::new("vm.deleted", Event::MicroVmSpecDeleted { id, generation: 2 });
        let json = serde_json::to_value(&envelope).unwrap();

        assert!(json["timestamp"].is_string());
        assert_eq!(json["event"]["type"], "micro_vm_spec_deleted");
    }
}

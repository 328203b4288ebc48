//! Pool Events
//!
//! Events emitted by the FCP pool manager for in-process subscribers that
//! react to reservation, usage and template changes.

use serde::{Deserialize, Serialize};

/// Events emitted by the FCP pool manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolEvent {
    /// Devices were reserved for an assigner
    DevicesReserved {
        assigner_id: String,
        template_id: String,
        fcp_ids: Vec<String>,
    },

    /// Reserved devices with no connections were released
    DevicesReleased {
        assigner_id: String,
        template_id: String,
        fcp_ids: Vec<String>,
    },

    /// A device's connection count changed
    UsageChanged {
        fcp_id: String,
        assigner_id: String,
        connections: u32,
    },

    /// Stored device state was reconciled with the hardware
    Reconciled {
        inserted: usize,
        updated: usize,
        deleted: usize,
    },

    /// A template was created
    TemplateCreated { template_id: String },

    /// A template was edited
    TemplateEdited { template_id: String },

    /// A template was deleted
    TemplateDeleted { template_id: String },
}

impl PoolEvent {
    /// Get the template ID associated with this event
    pub fn template_id(&self) -> Option<&str> {
        match self {
            PoolEvent::DevicesReserved { template_id, .. }
            | PoolEvent::DevicesReleased { template_id, .. }
            | PoolEvent::TemplateCreated { template_id }
            | PoolEvent::TemplateEdited { template_id }
            | PoolEvent::TemplateDeleted { template_id } => Some(template_id),
            PoolEvent::UsageChanged { .. } | PoolEvent::Reconciled { .. } => None,
        }
    }

    /// Get the assigner ID if this event concerns one guest
    pub fn assigner_id(&self) -> Option<&str> {
        match self {
            PoolEvent::DevicesReserved { assigner_id, .. }
            | PoolEvent::DevicesReleased { assigner_id, .. }
            | PoolEvent::UsageChanged { assigner_id, .. } => Some(assigner_id),
            _ => None,
        }
    }

    /// Check if this is a template lifecycle event
    pub fn is_template_event(&self) -> bool {
        matches!(
            self,
            PoolEvent::TemplateCreated { .. }
                | PoolEvent::TemplateEdited { .. }
                | PoolEvent::TemplateDeleted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let event = PoolEvent::DevicesReserved {
            assigner_id: "USER1".into(),
            template_id: "t1".into(),
            fcp_ids: vec!["1a00".into(), "1b00".into()],
        };
        assert_eq!(event.template_id(), Some("t1"));
        assert_eq!(event.assigner_id(), Some("USER1"));
        assert!(!event.is_template_event());

        let event = PoolEvent::TemplateDeleted {
            template_id: "t1".into(),
        };
        assert!(event.is_template_event());
        assert_eq!(event.assigner_id(), None);
    }
}

//! Volume Actions
//!
//! Closed set of operations the orchestrator exposes, dispatched through
//! [`Orchestrator::dispatch`](super::Orchestrator::dispatch).

use crate::domain::ports::{FcpId, FcpRecord, FcpUsage, VolumeConnection};
use crate::pool::{
    CreateTemplateRequest, EditTemplateRequest, Reservation, SyncSummary, TemplateDetails,
    TemplateSummary,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Requests
// =============================================================================

/// Connector lookup for an assigner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorRequest {
    pub assigner_id: String,
    /// Reserve devices when true, otherwise report current holds
    pub reserve: bool,
    pub template_id: Option<String>,
    pub storage_provider: Option<String>,
}

/// Template listing criteria; the first one set wins
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateQuery {
    pub template_ids: Option<Vec<String>>,
    pub assigner_id: Option<String>,
    pub host_default: bool,
    pub storage_providers: Option<Vec<String>>,
}

/// Every operation the orchestrator accepts
#[derive(Debug, Clone)]
pub enum VolumeAction {
    Attach(VolumeConnection),
    Detach(VolumeConnection),
    GetVolumeConnector(ConnectorRequest),
    ReserveDevices {
        assigner_id: String,
        template_id: Option<String>,
        storage_provider: Option<String>,
    },
    UnreserveDevices {
        assigner_id: String,
        template_id: String,
    },
    CreateTemplate(CreateTemplateRequest),
    EditTemplate {
        template_id: String,
        request: EditTemplateRequest,
    },
    DeleteTemplate {
        template_id: String,
    },
    GetTemplates(TemplateQuery),
    GetTemplatesDetails {
        template_ids: Option<Vec<String>>,
        raw: bool,
        statistics: bool,
        sync_with_hardware: bool,
    },
    GetFcpUsage {
        fcp_id: FcpId,
    },
    SetFcpUsage {
        fcp_id: FcpId,
        usage: FcpUsage,
    },
    SyncWithHardware,
}

impl VolumeAction {
    /// Operation name used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            VolumeAction::Attach(_) => "attach",
            VolumeAction::Detach(_) => "detach",
            VolumeAction::GetVolumeConnector(_) => "get_volume_connector",
            VolumeAction::ReserveDevices { .. } => "reserve_devices",
            VolumeAction::UnreserveDevices { .. } => "unreserve_devices",
            VolumeAction::CreateTemplate(_) => "create_template",
            VolumeAction::EditTemplate { .. } => "edit_template",
            VolumeAction::DeleteTemplate { .. } => "delete_template",
            VolumeAction::GetTemplates(_) => "get_templates",
            VolumeAction::GetTemplatesDetails { .. } => "get_templates_details",
            VolumeAction::GetFcpUsage { .. } => "get_fcp_usage",
            VolumeAction::SetFcpUsage { .. } => "set_fcp_usage",
            VolumeAction::SyncWithHardware => "sync_with_hardware",
        }
    }
}

// =============================================================================
// Outputs
// =============================================================================

/// What a guest needs to log into its storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConnector {
    pub fcp_devices: Vec<String>,
    /// NPIV WWPNs of the devices, in device order
    pub wwpns: Vec<String>,
    /// NPIV WWPN -> physical WWPN of the same device
    pub phy_to_virt_initiators: BTreeMap<String, String>,
    /// "{lpar}_{assigner}"
    pub host: String,
    pub fcp_paths_count: usize,
    pub template_id: String,
}

impl VolumeConnector {
    pub fn from_devices(host: String, template_id: String, devices: &[FcpRecord]) -> Self {
        Self {
            fcp_devices: devices.iter().map(|r| r.fcp_id.to_string()).collect(),
            wwpns: devices.iter().map(|r| r.wwpn_npiv.clone()).collect(),
            phy_to_virt_initiators: devices
                .iter()
                .map(|r| (r.wwpn_npiv.clone(), r.wwpn_phy.clone()))
                .collect(),
            host,
            fcp_paths_count: devices.len(),
            template_id,
        }
    }
}

/// Result of a dispatched action
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ActionOutput {
    Done,
    Connector(VolumeConnector),
    Reservation(Reservation),
    Released(Vec<FcpRecord>),
    Template(TemplateSummary),
    Templates(Vec<TemplateSummary>),
    TemplateDetails(Vec<TemplateDetails>),
    Usage(FcpUsage),
    Synced(SyncSummary),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{FcpDevice, FcpStatus};

    #[test]
    fn test_connector_from_devices() {
        let devices: Vec<FcpRecord> = ["1a00", "1b00"]
            .iter()
            .map(|id| {
                FcpRecord::from_live(&FcpDevice {
                    id: FcpId::parse(id).unwrap(),
                    npiv_wwpn: format!("npiv{}", id),
                    physical_wwpn: format!("phy{}", id),
                    chpid: "27".into(),
                    status: FcpStatus::Free,
                    owner: "none".into(),
                })
            })
            .collect();

        let connector = VolumeConnector::from_devices("lpar1_USER1".into(), "t1".into(), &devices);
        assert_eq!(connector.fcp_devices, vec!["1a00", "1b00"]);
        assert_eq!(connector.wwpns, vec!["npiv1a00", "npiv1b00"]);
        assert_eq!(
            connector.phy_to_virt_initiators.get("npiv1b00").map(String::as_str),
            Some("phy1b00")
        );
        assert_eq!(connector.fcp_paths_count, 2);
    }

    #[test]
    fn test_action_names() {
        assert_eq!(VolumeAction::SyncWithHardware.name(), "sync_with_hardware");
        let action = VolumeAction::DeleteTemplate {
            template_id: "t1".into(),
        };
        assert_eq!(action.name(), "delete_template");
    }
}

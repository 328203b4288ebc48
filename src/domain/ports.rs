//! Domain Ports - Core types and trait definitions for the FCP operator
//!
//! These traits define the boundaries between the pool/orchestration logic
//! and external systems (the persistence engine, the hypervisor's device
//! query, the guest directory and the in-guest volume configuration).
//! Adapters implement these traits to provide concrete functionality.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Literal used for absent WWPN / owner values
pub const NONE_VALUE: &str = "none";

/// Returns true when a WWPN value is actually populated
pub fn wwpn_is_set(wwpn: &str) -> bool {
    !wwpn.is_empty() && wwpn != NONE_VALUE
}

/// Canonical form of a guest userid
pub fn normalize_userid(userid: &str) -> String {
    userid.trim().to_uppercase()
}

// =============================================================================
// FCP Device ID
// =============================================================================

/// 4-hex-digit FCP device address, canonical lowercase and zero-padded
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FcpId(String);

impl FcpId {
    /// Parse a 1-4 digit hex device number (case-insensitive)
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed.len() > 4
            || !trimmed.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(Error::InvalidFormat {
                input: raw.to_string(),
                reason: "FCP device number must be 1-4 hex digits".into(),
            });
        }
        let value = u16::from_str_radix(trimmed, 16).map_err(|e| Error::InvalidFormat {
            input: raw.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_u16(value))
    }

    pub fn from_u16(value: u16) -> Self {
        Self(format!("{:04x}", value))
    }

    pub fn value(&self) -> u16 {
        // Construction guarantees 4 valid hex digits
        u16::from_str_radix(&self.0, 16).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FcpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for FcpId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FcpId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<FcpId> for String {
    fn from(id: FcpId) -> Self {
        id.0
    }
}

/// Path index -> device ids of that path
pub type PathMap = BTreeMap<u32, BTreeSet<FcpId>>;

// =============================================================================
// Hardware Device State
// =============================================================================

/// Device status as reported by the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FcpStatus {
    Free,
    Active,
    Offline,
    NotFound,
}

impl std::fmt::Display for FcpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FcpStatus::Free => write!(f, "free"),
            FcpStatus::Active => write!(f, "active"),
            FcpStatus::Offline => write!(f, "offline"),
            FcpStatus::NotFound => write!(f, "notfound"),
        }
    }
}

impl std::str::FromStr for FcpStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(FcpStatus::Free),
            "active" => Ok(FcpStatus::Active),
            "offline" => Ok(FcpStatus::Offline),
            "notfound" => Ok(FcpStatus::NotFound),
            other => Err(Error::InvalidFormat {
                input: other.to_string(),
                reason: "unknown FCP device status".into(),
            }),
        }
    }
}

/// One physical FCP device as reported by a live hardware query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FcpDevice {
    pub id: FcpId,
    pub npiv_wwpn: String,
    pub physical_wwpn: String,
    pub chpid: String,
    pub status: FcpStatus,
    pub owner: String,
}

// =============================================================================
// Persisted Device Record
// =============================================================================

/// The pool's persisted view of one FCP device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FcpRecord {
    pub fcp_id: FcpId,
    /// Owning guest userid, empty when unassigned
    pub assigner_id: String,
    /// Active attach operations referencing this device
    pub connections: u32,
    /// Held for the assigner even with zero connections
    pub reserved: bool,
    pub wwpn_npiv: String,
    pub wwpn_phy: String,
    pub chpid: String,
    pub state: FcpStatus,
    /// Consumer userid reported by the hypervisor, or "none"
    pub owner: String,
    /// Template the device is pinned to, empty when unassociated
    pub template_id: String,
}

impl FcpRecord {
    /// New unassociated, unreserved record from live hardware state
    pub fn from_live(device: &FcpDevice) -> Self {
        Self {
            fcp_id: device.id.clone(),
            assigner_id: String::new(),
            connections: 0,
            reserved: false,
            wwpn_npiv: device.npiv_wwpn.clone(),
            wwpn_phy: device.physical_wwpn.clone(),
            chpid: device.chpid.clone(),
            state: device.status,
            owner: device.owner.clone(),
            template_id: String::new(),
        }
    }

    /// Record for a device known only from a template range
    pub fn placeholder(fcp_id: FcpId) -> Self {
        Self {
            fcp_id,
            assigner_id: String::new(),
            connections: 0,
            reserved: false,
            wwpn_npiv: NONE_VALUE.to_string(),
            wwpn_phy: NONE_VALUE.to_string(),
            chpid: String::new(),
            state: FcpStatus::NotFound,
            owner: NONE_VALUE.to_string(),
            template_id: String::new(),
        }
    }

    /// Refresh hardware-reported fields; NPIV WWPN is kept while in use
    pub fn refresh_from_live(&mut self, device: &FcpDevice) {
        if self.connections == 0 {
            self.wwpn_npiv = device.npiv_wwpn.clone();
        }
        self.wwpn_phy = device.physical_wwpn.clone();
        self.chpid = device.chpid.clone();
        self.state = device.status;
        self.owner = device.owner.clone();
    }

    /// Available for a fresh reservation
    pub fn is_free(&self) -> bool {
        self.connections == 0 && !self.reserved && self.state == FcpStatus::Free
    }

    /// Reserved or connected
    pub fn is_in_use(&self) -> bool {
        self.reserved || self.connections > 0
    }

    /// Held by `assigner_id` under `template_id`
    pub fn is_held_by(&self, assigner_id: &str, template_id: &str) -> bool {
        self.assigner_id == assigner_id && self.template_id == template_id && self.is_in_use()
    }

    pub fn usage(&self) -> FcpUsage {
        FcpUsage {
            assigner_id: self.assigner_id.clone(),
            reserved: self.reserved,
            connections: self.connections,
            template_id: self.template_id.clone(),
        }
    }

    /// Overwrite the ownership/usage columns
    pub fn apply_usage(&mut self, usage: &FcpUsage) {
        self.assigner_id = usage.assigner_id.clone();
        self.reserved = usage.reserved;
        self.connections = usage.connections;
        self.template_id = usage.template_id.clone();
    }
}

/// Ownership/usage columns of a record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FcpUsage {
    pub assigner_id: String,
    pub reserved: bool,
    pub connections: u32,
    pub template_id: String,
}

impl FcpUsage {
    /// Check the record invariants for a usage tuple
    pub fn validate(&self) -> Result<()> {
        if self.connections > 0 && (!self.reserved || self.assigner_id.is_empty()) {
            return Err(Error::InvalidParameter(
                "a device with connections must be reserved and have an assigner".into(),
            ));
        }
        if self.reserved && self.assigner_id.is_empty() {
            return Err(Error::InvalidParameter(
                "a reserved device must have an assigner".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// FCP Templates
// =============================================================================

/// A named, reusable device-selection policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FcpTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub host_default: bool,
    /// Minimum paths a reservation must cover; None = every path
    pub min_fcp_paths_count: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl FcpTemplate {
    /// Effective minimum path count for a template with `path_count` paths
    pub fn effective_min_paths(&self, path_count: usize) -> usize {
        self.min_fcp_paths_count
            .map(|n| n as usize)
            .unwrap_or(path_count)
    }
}

/// Template selection filter (one criterion at a time)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateFilter {
    All,
    Ids(Vec<String>),
    /// Templates the assigner currently holds devices under
    Assigner(String),
    HostDefault,
    /// Templates bound to any of these providers; "all" matches any binding
    StorageProviders(Vec<String>),
}

/// Resolved changes for a template edit
#[derive(Debug, Clone, Default)]
pub struct TemplateChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub paths: Option<PathMap>,
    pub host_default: Option<bool>,
    pub storage_providers: Option<Vec<String>>,
    pub min_fcp_paths_count: Option<u32>,
}

/// Devices of one template path, id-sorted, as seen inside a reservation
#[derive(Debug, Clone)]
pub struct PathCandidates {
    pub path: u32,
    pub devices: Vec<FcpRecord>,
}

/// Result of replacing the stored device set with the live one
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub inserted: usize,
    pub updated: usize,
    /// Records that were stored but are no longer present in hardware
    pub removed: Vec<FcpRecord>,
}

// =============================================================================
// Volume Connection
// =============================================================================

/// One attach/detach request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConnection {
    pub assigner_id: String,
    pub fcp_list: Vec<FcpId>,
    pub target_wwpns: Vec<String>,
    pub target_lun: String,
    #[serde(default)]
    pub multipath: bool,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub mount_point: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub is_root_volume: bool,
    #[serde(default)]
    pub update_connections_only: bool,
}

impl VolumeConnection {
    /// Whether dedicate and in-guest configuration steps are skipped
    pub fn skips_side_effects(&self) -> bool {
        self.is_root_volume || self.update_connections_only
    }
}

/// In-guest configuration request for an attach
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachConfig {
    pub userid: String,
    pub fcp_list: Vec<FcpId>,
    pub target_wwpns: Vec<String>,
    pub target_lun: String,
    pub multipath: bool,
    pub os_version: String,
    pub mount_point: String,
}

/// In-guest configuration request for a detach
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachConfig {
    pub userid: String,
    pub fcp_list: Vec<FcpId>,
    pub target_wwpns: Vec<String>,
    pub target_lun: String,
    pub multipath: bool,
    pub os_version: String,
    pub mount_point: String,
    /// Connections left on the request's devices after this detach
    pub remaining_connections: u32,
}

// =============================================================================
// Hardware Query Port
// =============================================================================

/// Port for the hypervisor's live FCP device table
#[async_trait]
pub trait HardwareQuery: Send + Sync {
    /// Return the free-text device listing for a named query target
    async fn query_fcp_devices(&self, target: &str) -> Result<String>;
}

// =============================================================================
// Guest Directory Port
// =============================================================================

/// Port for guest directory operations
///
/// `dedicate`/`undedicate` are idempotent when already applied and fail
/// loudly otherwise.
#[async_trait]
pub trait GuestDirectory: Send + Sync {
    async fn guest_exists(&self, userid: &str) -> Result<bool>;

    async fn dedicate(&self, fcp_id: &FcpId, userid: &str) -> Result<()>;

    async fn undedicate(&self, fcp_id: &FcpId, userid: &str) -> Result<()>;
}

// =============================================================================
// Guest Configuration Port
// =============================================================================

/// Port for volume configuration inside a guest
#[async_trait]
pub trait GuestConfigurator: Send + Sync {
    async fn configure_attach(&self, request: &AttachConfig) -> Result<()>;

    async fn configure_detach(&self, request: &DetachConfig) -> Result<()>;
}

// =============================================================================
// Persistence Port
// =============================================================================

/// Port for the FCP pool's durable state
///
/// Every multi-row mutation runs inside one transaction per call; the
/// closure-taking methods run their closure inside that transaction and
/// roll back when it returns an error.
#[async_trait]
pub trait FcpStore: Send + Sync {
    async fn get_fcp(&self, fcp_id: &FcpId) -> Result<Option<FcpRecord>>;

    async fn bulk_get_fcps(&self, fcp_ids: &[FcpId]) -> Result<Vec<FcpRecord>>;

    async fn all_fcps(&self) -> Result<Vec<FcpRecord>>;

    /// template id -> path -> records (mapped ids without a record are skipped)
    async fn get_all_fcps_grouped_by_template(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<u32, Vec<FcpRecord>>>>;

    async fn set_usage(&self, fcp_id: &FcpId, usage: &FcpUsage) -> Result<()>;

    /// Insert new devices and refresh existing ones; an existing record's
    /// NPIV WWPN is left untouched while it has connections
    async fn bulk_upsert_from_live_state(&self, devices: &[FcpDevice]) -> Result<()>;

    async fn bulk_delete(&self, fcp_ids: &[FcpId]) -> Result<()>;

    /// Upsert `devices` and delete every stored record missing from them,
    /// in a single transaction
    async fn reconcile_with_live_state(&self, devices: &[FcpDevice]) -> Result<ReconcileOutcome>;

    /// Transactional read-modify-write of one record
    async fn modify_fcp(
        &self,
        fcp_id: &FcpId,
        update: &(dyn for<'r> Fn(&'r mut FcpRecord) -> Result<()> + Send + Sync),
    ) -> Result<FcpRecord>;

    /// Transactional read-modify-write of every record matching `filter`;
    /// returns the records after modification
    async fn modify_fcps(
        &self,
        filter: &(dyn for<'r> Fn(&'r FcpRecord) -> bool + Send + Sync),
        update: &(dyn for<'r> Fn(&'r mut FcpRecord) + Send + Sync),
    ) -> Result<Vec<FcpRecord>>;

    /// Select and mark devices reserved for `assigner_id` under
    /// `template_id` in a single transaction. The selector sees every path
    /// of the template and returns the ids to hold.
    async fn reserve_with(
        &self,
        assigner_id: &str,
        template_id: &str,
        selector: &(dyn for<'c> Fn(&'c [PathCandidates]) -> Result<Vec<FcpId>> + Send + Sync),
    ) -> Result<Vec<FcpRecord>>;

    async fn create_template(
        &self,
        template: &FcpTemplate,
        paths: &PathMap,
        storage_providers: &[String],
    ) -> Result<()>;

    /// Apply changes; rejects device-range changes while any device of the
    /// template is in use
    async fn edit_template(&self, template_id: &str, changes: &TemplateChanges)
        -> Result<FcpTemplate>;

    /// Delete a template and its mappings; rejects while devices are in use
    async fn delete_template(&self, template_id: &str) -> Result<()>;

    async fn get_template(&self, template_id: &str) -> Result<Option<FcpTemplate>>;

    async fn get_templates(&self, filter: &TemplateFilter) -> Result<Vec<FcpTemplate>>;

    async fn get_template_path_mapping(&self, template_id: &str) -> Result<PathMap>;

    async fn get_storage_provider_bindings(&self, template_id: &str) -> Result<Vec<String>>;

    async fn get_storage_provider_default(&self, storage_provider: &str)
        -> Result<Option<String>>;

    async fn get_host_default(&self) -> Result<Option<String>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type FcpStoreRef = Arc<dyn FcpStore>;
pub type HardwareQueryRef = Arc<dyn HardwareQuery>;
pub type GuestDirectoryRef = Arc<dyn GuestDirectory>;
pub type GuestConfiguratorRef = Arc<dyn GuestConfigurator>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_fcp_id_canonical_form() {
        assert_eq!(FcpId::parse("1A0").unwrap().as_str(), "01a0");
        assert_eq!(FcpId::parse(" E83C ").unwrap().as_str(), "e83c");
        assert_eq!(FcpId::parse("1a00").unwrap().value(), 0x1a00);
        assert_matches!(FcpId::parse("12345"), Err(Error::InvalidFormat { .. }));
        assert_matches!(FcpId::parse("xyz"), Err(Error::InvalidFormat { .. }));
        assert_matches!(FcpId::parse(""), Err(Error::InvalidFormat { .. }));
    }

    #[test]
    fn test_fcp_id_serde() {
        let id: FcpId = serde_json::from_str("\"1B03\"").unwrap();
        assert_eq!(id.as_str(), "1b03");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"1b03\"");
        assert!(serde_json::from_str::<FcpId>("\"gggg\"").is_err());
    }

    #[test]
    fn test_status_display_and_parse() {
        assert_eq!(format!("{}", FcpStatus::NotFound), "notfound");
        assert_eq!("Active".parse::<FcpStatus>().unwrap(), FcpStatus::Active);
        assert!("busy".parse::<FcpStatus>().is_err());
    }

    #[test]
    fn test_refresh_keeps_npiv_while_in_use() {
        let live = FcpDevice {
            id: FcpId::parse("1a00").unwrap(),
            npiv_wwpn: "c05076ffffffff01".into(),
            physical_wwpn: "c05076aaaaaaaa01".into(),
            chpid: "27".into(),
            status: FcpStatus::Active,
            owner: "user1".into(),
        };
        let mut record = FcpRecord::from_live(&live);
        record.connections = 1;
        record.reserved = true;
        record.assigner_id = "USER1".into();

        let mut changed = live.clone();
        changed.npiv_wwpn = "c05076ffffffff99".into();
        changed.chpid = "28".into();
        record.refresh_from_live(&changed);

        assert_eq!(record.wwpn_npiv, "c05076ffffffff01");
        assert_eq!(record.chpid, "28");
    }

    #[test]
    fn test_usage_validation() {
        let bad = FcpUsage {
            assigner_id: "USER1".into(),
            reserved: false,
            connections: 1,
            template_id: String::new(),
        };
        assert_matches!(bad.validate(), Err(Error::InvalidParameter(_)));

        let good = FcpUsage {
            assigner_id: "USER1".into(),
            reserved: true,
            connections: 2,
            template_id: "t".into(),
        };
        assert!(good.validate().is_ok());
        assert!(FcpUsage::default().validate().is_ok());
    }
}

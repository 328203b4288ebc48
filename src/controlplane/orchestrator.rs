//! Volume Orchestrator - The "Brain"
//!
//! Drives the attach/detach workflows on top of the FCP pool manager:
//! - Usage accounting for every device of a request
//! - Dedicate/undedicate side effects in the guest directory
//! - In-guest volume configuration
//! - Compensating rollback when a later step fails
//!
//! Operations for one assigner are serialized through the named lock
//! manager; different assigners run concurrently.

use super::action::{ActionOutput, ConnectorRequest, TemplateQuery, VolumeAction, VolumeConnector};
use super::metrics::OperatorMetrics;
use crate::domain::ports::{
    normalize_userid, AttachConfig, DetachConfig, FcpId, FcpUsage, GuestConfiguratorRef,
    GuestDirectoryRef, TemplateFilter, VolumeConnection,
};
use crate::error::{Error, Result};
use crate::lock::{assigner_key, template_key, NamedLockManager};
use crate::pool::{FcpManager, UsageChange};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// LPAR name, first half of the connector host identifier
    pub lpar_name: String,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Attach/detach orchestrator and dispatcher for every volume action
pub struct Orchestrator {
    config: OrchestratorConfig,
    pool: Arc<FcpManager>,
    directory: GuestDirectoryRef,
    configurator: GuestConfiguratorRef,
    locks: NamedLockManager,
    metrics: OperatorMetrics,
}

/// Undo work collected while a workflow fails
#[derive(Default)]
struct Rollback {
    undedicate: Vec<FcpId>,
    restore: Vec<(FcpId, UsageChange)>,
    increase: Vec<FcpId>,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(
        config: OrchestratorConfig,
        pool: Arc<FcpManager>,
        directory: GuestDirectoryRef,
        configurator: GuestConfiguratorRef,
        metrics: OperatorMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            locks: pool.locks().clone(),
            pool,
            directory,
            configurator,
            metrics,
        })
    }

    pub fn pool(&self) -> &Arc<FcpManager> {
        &self.pool
    }

    pub fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    /// Operations currently holding or waiting on a lock
    pub fn active_operations(&self) -> usize {
        self.locks.active_keys()
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Run one action and record its outcome
    pub async fn dispatch(&self, action: VolumeAction) -> Result<ActionOutput> {
        let operation = action.name();
        let started = Instant::now();
        let result = self.run(action).await;

        self.metrics
            .observe(operation, result.is_ok(), started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            warn!("{} failed: {}", operation, e);
        }
        result
    }

    async fn run(&self, action: VolumeAction) -> Result<ActionOutput> {
        match action {
            VolumeAction::Attach(connection) => {
                self.attach(&connection).await?;
                Ok(ActionOutput::Done)
            }
            VolumeAction::Detach(connection) => {
                self.detach(&connection).await?;
                Ok(ActionOutput::Done)
            }
            VolumeAction::GetVolumeConnector(request) => self
                .get_volume_connector(&request)
                .await
                .map(ActionOutput::Connector),
            VolumeAction::ReserveDevices {
                assigner_id,
                template_id,
                storage_provider,
            } => {
                let assigner = required_userid(&assigner_id)?;
                self.locks
                    .with_lock(&assigner_key(&assigner), || {
                        self.pool.reserve_devices(
                            &assigner,
                            template_id.as_deref(),
                            storage_provider.as_deref(),
                        )
                    })
                    .await
                    .map(ActionOutput::Reservation)
            }
            VolumeAction::UnreserveDevices {
                assigner_id,
                template_id,
            } => {
                let assigner = required_userid(&assigner_id)?;
                self.locks
                    .with_lock(&assigner_key(&assigner), || {
                        self.pool.unreserve_devices(&assigner, &template_id)
                    })
                    .await
                    .map(ActionOutput::Released)
            }
            VolumeAction::CreateTemplate(request) => self
                .pool
                .create_template(&request)
                .await
                .map(ActionOutput::Template),
            VolumeAction::EditTemplate {
                template_id,
                request,
            } => self
                .locks
                .with_lock(&template_key(&template_id), || {
                    self.pool.edit_template(&template_id, &request)
                })
                .await
                .map(ActionOutput::Template),
            VolumeAction::DeleteTemplate { template_id } => {
                self.locks
                    .with_lock(&template_key(&template_id), || {
                        self.pool.delete_template(&template_id)
                    })
                    .await?;
                Ok(ActionOutput::Done)
            }
            VolumeAction::GetTemplates(query) => self
                .pool
                .get_templates(&template_filter(query))
                .await
                .map(ActionOutput::Templates),
            VolumeAction::GetTemplatesDetails {
                template_ids,
                raw,
                statistics,
                sync_with_hardware,
            } => self
                .pool
                .get_templates_details(
                    template_ids.as_deref(),
                    raw,
                    statistics,
                    sync_with_hardware,
                )
                .await
                .map(ActionOutput::TemplateDetails),
            VolumeAction::GetFcpUsage { fcp_id } => self
                .pool
                .get_fcp_usage(&fcp_id)
                .await
                .map(ActionOutput::Usage),
            VolumeAction::SetFcpUsage { fcp_id, usage } => {
                let usage = FcpUsage {
                    assigner_id: normalize_userid(&usage.assigner_id),
                    ..usage
                };
                self.set_fcp_usage(&fcp_id, &usage).await?;
                Ok(ActionOutput::Done)
            }
            VolumeAction::SyncWithHardware => self
                .pool
                .sync_with_hardware()
                .await
                .map(ActionOutput::Synced),
        }
    }

    /// Overwrite a device's usage under the locks of its current and new
    /// assigner
    async fn set_fcp_usage(&self, fcp_id: &FcpId, usage: &FcpUsage) -> Result<()> {
        loop {
            let owner = self.pool.get_fcp_usage(fcp_id).await?.assigner_id;
            let mut keys: Vec<String> = [owner.as_str(), usage.assigner_id.as_str()]
                .into_iter()
                .filter(|assigner| !assigner.is_empty())
                .map(assigner_key)
                .collect();
            keys.sort();
            keys.dedup();

            let mut guards = Vec::with_capacity(keys.len());
            for key in &keys {
                guards.push(self.locks.acquire(key).await);
            }
            if self.pool.get_fcp_usage(fcp_id).await?.assigner_id == owner {
                return self.pool.set_fcp_usage(fcp_id, usage).await;
            }
            debug!("Owner of FCP device {} changed while locking, retrying", fcp_id);
        }
    }

    // =========================================================================
    // Attach
    // =========================================================================

    /// Attach a volume to a guest through the request's devices
    pub async fn attach(&self, connection: &VolumeConnection) -> Result<()> {
        let assigner = required_userid(&connection.assigner_id)?;
        required_devices(connection)?;

        self.locks
            .with_lock(&assigner_key(&assigner), || {
                self.attach_locked(&assigner, connection)
            })
            .await
    }

    async fn attach_locked(&self, assigner: &str, connection: &VolumeConnection) -> Result<()> {
        info!(
            "Attaching LUN {} to {} via {}",
            connection.target_lun,
            assigner,
            join_ids(&connection.fcp_list)
        );

        if !connection.is_root_volume && !self.directory.guest_exists(assigner).await? {
            return Err(Error::GuestNotFound {
                userid: assigner.to_string(),
            });
        }

        let mut rollback = Rollback::default();
        let mut transitioned = Vec::new();
        for fcp_id in &connection.fcp_list {
            match self.pool.add_usage(fcp_id, assigner).await {
                Ok(change) => {
                    if change.is_first_connection() {
                        transitioned.push(fcp_id.clone());
                    }
                    rollback.restore.push((fcp_id.clone(), change));
                }
                Err(e) => {
                    return Err(self.roll_back("attach", assigner, connection, e, rollback).await);
                }
            }
        }

        if connection.skips_side_effects() {
            debug!("Skipping dedicate and guest configuration for {}", assigner);
            info!("Attached LUN {} to {}", connection.target_lun, assigner);
            return Ok(());
        }

        for fcp_id in &transitioned {
            if let Err(e) = self.directory.dedicate(fcp_id, assigner).await {
                return Err(self.roll_back("attach", assigner, connection, e, rollback).await);
            }
            rollback.undedicate.push(fcp_id.clone());
        }

        let request = AttachConfig {
            userid: assigner.to_string(),
            fcp_list: connection.fcp_list.clone(),
            target_wwpns: connection.target_wwpns.clone(),
            target_lun: connection.target_lun.clone(),
            multipath: connection.multipath,
            os_version: connection.os_version.clone(),
            mount_point: connection.mount_point.clone(),
        };
        if let Err(e) = self.configurator.configure_attach(&request).await {
            // Dedication stays in place, only usage is undone
            rollback.undedicate.clear();
            return Err(self.roll_back("attach", assigner, connection, e, rollback).await);
        }

        info!("Attached LUN {} to {}", connection.target_lun, assigner);
        Ok(())
    }

    // =========================================================================
    // Detach
    // =========================================================================

    /// Detach a volume from a guest
    pub async fn detach(&self, connection: &VolumeConnection) -> Result<()> {
        let assigner = required_userid(&connection.assigner_id)?;
        required_devices(connection)?;

        self.locks
            .with_lock(&assigner_key(&assigner), || {
                self.detach_locked(&assigner, connection)
            })
            .await
    }

    async fn detach_locked(&self, assigner: &str, connection: &VolumeConnection) -> Result<()> {
        info!(
            "Detaching LUN {} from {} via {}",
            connection.target_lun,
            assigner,
            join_ids(&connection.fcp_list)
        );

        let mut rollback = Rollback::default();
        let mut released = Vec::new();
        let mut remaining_connections = 0;
        for fcp_id in &connection.fcp_list {
            match self.pool.decrease_usage(fcp_id, assigner).await {
                Ok(remaining) => {
                    rollback.increase.push(fcp_id.clone());
                    remaining_connections += remaining;
                    if remaining == 0 {
                        released.push(fcp_id.clone());
                    }
                }
                Err(e) => {
                    return Err(self.roll_back("detach", assigner, connection, e, rollback).await);
                }
            }
        }

        if connection.skips_side_effects() {
            debug!("Skipping guest configuration and undedicate for {}", assigner);
            info!("Detached LUN {} from {}", connection.target_lun, assigner);
            return Ok(());
        }

        let request = DetachConfig {
            userid: assigner.to_string(),
            fcp_list: connection.fcp_list.clone(),
            target_wwpns: connection.target_wwpns.clone(),
            target_lun: connection.target_lun.clone(),
            multipath: connection.multipath,
            os_version: connection.os_version.clone(),
            mount_point: connection.mount_point.clone(),
            remaining_connections,
        };
        if let Err(e) = self.configurator.configure_detach(&request).await {
            return Err(self.roll_back("detach", assigner, connection, e, rollback).await);
        }

        // Guest configuration is gone; undedicate failures are reported as is
        let mut failed = Vec::new();
        let mut reasons = Vec::new();
        for fcp_id in &released {
            if let Err(e) = self.directory.undedicate(fcp_id, assigner).await {
                error!("Failed to undedicate {} from {}: {}", fcp_id, assigner, e);
                failed.push(fcp_id.to_string());
                reasons.push(format!("{}: {}", fcp_id, e));
            }
        }
        if !failed.is_empty() {
            return Err(Error::Operation {
                operation: "detach".into(),
                reason: format!("undedicate failed: {}", reasons.join("; ")),
                fcp_ids: failed,
                rolled_back: Vec::new(),
            });
        }

        info!("Detached LUN {} from {}", connection.target_lun, assigner);
        Ok(())
    }

    // =========================================================================
    // Rollback
    // =========================================================================

    /// Undo collected steps in reverse order and build the error to raise
    async fn roll_back(
        &self,
        operation: &str,
        assigner: &str,
        connection: &VolumeConnection,
        cause: Error,
        rollback: Rollback,
    ) -> Error {
        warn!("{} for {} failed, rolling back: {}", operation, assigner, cause);
        self.metrics.rollback(operation);

        let mut rolled_back = Vec::new();
        let mut rollback_errors = Vec::new();

        for fcp_id in rollback.undedicate.iter().rev() {
            match self.directory.undedicate(fcp_id, assigner).await {
                Ok(()) => warn!("Rolled back dedicate of {} to {}", fcp_id, assigner),
                Err(e) => rollback_errors.push(format!("undedicate {}: {}", fcp_id, e)),
            }
        }
        for (fcp_id, change) in rollback.restore.iter().rev() {
            match self.pool.restore_usage(fcp_id, change).await {
                Ok(()) => rolled_back.push(fcp_id.to_string()),
                Err(e) => rollback_errors.push(format!("restore usage {}: {}", fcp_id, e)),
            }
        }
        for fcp_id in rollback.increase.iter().rev() {
            match self.pool.add_usage(fcp_id, assigner).await {
                Ok(_) => rolled_back.push(fcp_id.to_string()),
                Err(e) => rollback_errors.push(format!("increase usage {}: {}", fcp_id, e)),
            }
        }

        if !rollback_errors.is_empty() {
            error!(
                "Rollback of {} for {} incomplete, manual intervention required: {:?}",
                operation, assigner, rollback_errors
            );
            return Error::RollbackFailed {
                operation: operation.to_string(),
                reason: cause.to_string(),
                rollback_errors,
            };
        }

        match cause {
            Error::Conflict { .. } | Error::DeviceNotFound { .. } | Error::InvalidParameter(_) => {
                cause
            }
            Error::Operation {
                operation: step,
                reason,
                ..
            } => Error::Operation {
                operation: operation.to_string(),
                reason: format!("{}: {}", step, reason),
                fcp_ids: connection.fcp_list.iter().map(FcpId::to_string).collect(),
                rolled_back,
            },
            other => Error::Operation {
                operation: operation.to_string(),
                reason: other.to_string(),
                fcp_ids: connection.fcp_list.iter().map(FcpId::to_string).collect(),
                rolled_back,
            },
        }
    }

    // =========================================================================
    // Connector
    // =========================================================================

    /// Devices, WWPNs and host identity an assigner uses for its volumes
    pub async fn get_volume_connector(&self, request: &ConnectorRequest) -> Result<VolumeConnector> {
        let assigner = required_userid(&request.assigner_id)?;

        self.locks
            .with_lock(&assigner_key(&assigner), || async {
                let template_id = request.template_id.as_deref();
                let storage_provider = request.storage_provider.as_deref();

                let (template_id, devices) = if request.reserve {
                    let reservation = self
                        .pool
                        .reserve_devices(&assigner, template_id, storage_provider)
                        .await
                        .map_err(connector_error)?;
                    (reservation.template_id, reservation.devices)
                } else {
                    let template_id = self
                        .pool
                        .resolve_template(template_id, storage_provider)
                        .await
                        .map_err(connector_error)?;
                    let devices = self.pool.held_devices(&assigner, &template_id).await?;
                    (template_id, devices)
                };

                if devices.is_empty() {
                    warn!(
                        "No FCP devices for {} in template {}",
                        assigner, template_id
                    );
                }
                let host = format!("{}_{}", self.config.lpar_name, assigner);
                Ok::<_, Error>(VolumeConnector::from_devices(host, template_id, &devices))
            })
            .await
    }
}

fn connector_error(e: Error) -> Error {
    match e {
        Error::TemplateNotFound { template_id } => Error::operation(
            "get_volume_connector",
            format!("FCP template {} does not exist", template_id),
        ),
        other => other,
    }
}

fn required_userid(userid: &str) -> Result<String> {
    let userid = normalize_userid(userid);
    if userid.is_empty() {
        return Err(Error::InvalidParameter("assigner userid is required".into()));
    }
    Ok(userid)
}

fn required_devices(connection: &VolumeConnection) -> Result<()> {
    if connection.fcp_list.is_empty() {
        return Err(Error::InvalidParameter("fcp list must not be empty".into()));
    }
    Ok(())
}

fn template_filter(query: TemplateQuery) -> TemplateFilter {
    if let Some(ids) = query.template_ids {
        TemplateFilter::Ids(ids)
    } else if let Some(assigner) = query.assigner_id {
        TemplateFilter::Assigner(normalize_userid(&assigner))
    } else if query.host_default {
        TemplateFilter::HostDefault
    } else if let Some(providers) = query.storage_providers {
        TemplateFilter::StorageProviders(providers)
    } else {
        TemplateFilter::All
    }
}

fn join_ids(ids: &[FcpId]) -> String {
    ids.iter().map(FcpId::as_str).collect::<Vec<_>>().join(",")
}

/// Orchestrator status summary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub lpar_name: String,
    pub active_operations: usize,
}

impl Orchestrator {
    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            lpar_name: self.config.lpar_name.clone(),
            active_operations: self.active_operations(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{CreateTemplateRequest, FcpManagerConfig};
    use crate::store::MemoryStore;
    use crate::testing::{free_listing, FakeGuest, FakeHardware};
    use assert_matches::assert_matches;

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        guest: Arc<FakeGuest>,
        template_id: String,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let hardware = Arc::new(FakeHardware::new(free_listing(&[
            "1a00", "1a01", "1b00", "1b01", "e83c",
        ])));
        let pool = FcpManager::new(
            FcpManagerConfig {
                query_target: "opnstk1".into(),
                ..Default::default()
            },
            store,
            hardware,
        );
        let guest = Arc::new(FakeGuest::with_guests(&["USER1"]));
        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                lpar_name: "lpar1".into(),
            },
            pool,
            guest.clone(),
            guest.clone(),
            OperatorMetrics::new().unwrap(),
        );

        orchestrator
            .dispatch(VolumeAction::SyncWithHardware)
            .await
            .unwrap();
        let created = orchestrator
            .dispatch(VolumeAction::CreateTemplate(CreateTemplateRequest {
                name: "default".into(),
                fcp_devices: "1a00-1a01;1b00-1b01".into(),
                host_default: true,
                ..Default::default()
            }))
            .await
            .unwrap();
        let summary = match created {
            ActionOutput::Template(summary) => summary,
            other => panic!("unexpected output {:?}", other),
        };

        Fixture {
            orchestrator,
            guest,
            template_id: summary.template.id,
        }
    }

    fn connection(assigner: &str, devices: &[&str]) -> VolumeConnection {
        VolumeConnection {
            assigner_id: assigner.into(),
            fcp_list: devices.iter().map(|d| FcpId::parse(d).unwrap()).collect(),
            target_wwpns: vec!["5005076802100c1b".into()],
            target_lun: "0000000000000000".into(),
            multipath: true,
            os_version: "rhel8".into(),
            mount_point: "/dev/sdz".into(),
            platform: "s390x".into(),
            is_root_volume: false,
            update_connections_only: false,
        }
    }

    async fn usage(f: &Fixture, id: &str) -> FcpUsage {
        f.orchestrator
            .pool()
            .get_fcp_usage(&FcpId::parse(id).unwrap())
            .await
            .unwrap()
    }

    async fn connections(f: &Fixture, id: &str) -> u32 {
        usage(f, id).await.connections
    }

    #[tokio::test]
    async fn test_attach_then_detach_restores_usage() {
        let f = fixture().await;
        let conn = connection("user1", &["1a00", "1b00"]);

        f.orchestrator.attach(&conn).await.unwrap();
        assert_eq!(connections(&f, "1a00").await, 1);
        assert!(f.guest.is_dedicated("1a00", "USER1"));
        assert!(f.guest.is_dedicated("1b00", "USER1"));
        assert_eq!(f.guest.attach_calls.lock().len(), 1);

        // Second volume over the same devices needs no new dedicate
        f.orchestrator.attach(&conn).await.unwrap();
        assert_eq!(connections(&f, "1a00").await, 2);

        f.orchestrator.detach(&conn).await.unwrap();
        assert_eq!(f.guest.detach_calls.lock()[0].remaining_connections, 2);
        assert!(f.guest.is_dedicated("1a00", "USER1"));

        f.orchestrator.detach(&conn).await.unwrap();
        assert_eq!(connections(&f, "1a00").await, 0);
        assert_eq!(connections(&f, "1b00").await, 0);
        assert!(!f.guest.is_dedicated("1a00", "USER1"));
        assert_eq!(f.guest.detach_calls.lock()[1].remaining_connections, 0);
    }

    #[tokio::test]
    async fn test_failed_dedicate_rolls_back_usage() {
        let f = fixture().await;
        f.guest.fail_dedicate.lock().insert("e83c".into());
        let before = usage(&f, "e83c").await;

        let err = f
            .orchestrator
            .attach(&connection("USER1", &["e83c"]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Operation { ref rolled_back, .. } if rolled_back == &vec!["e83c".to_string()]);
        assert_eq!(usage(&f, "e83c").await, before);
        assert_eq!(f.orchestrator.metrics().rollback_count("attach"), 1);

        // The device went back to the pool, not to USER1
        f.guest.fail_dedicate.lock().clear();
        f.guest.guests.lock().insert("USER2".into());
        f.orchestrator.attach(&connection("USER2", &["e83c"])).await.unwrap();
        assert_eq!(usage(&f, "e83c").await.assigner_id, "USER2");
        assert!(f.guest.is_dedicated("e83c", "USER2"));
    }

    #[tokio::test]
    async fn test_failed_attach_keeps_prior_reservation() {
        let f = fixture().await;
        f.orchestrator
            .dispatch(VolumeAction::ReserveDevices {
                assigner_id: "USER1".into(),
                template_id: Some(f.template_id.clone()),
                storage_provider: None,
            })
            .await
            .unwrap();
        let before = usage(&f, "1a00").await;
        assert!(before.reserved);

        f.guest.fail_dedicate.lock().insert("1a00".into());
        assert_matches!(
            f.orchestrator.attach(&connection("USER1", &["1a00"])).await,
            Err(Error::Operation { .. })
        );
        assert_eq!(usage(&f, "1a00").await, before);
    }

    #[tokio::test]
    async fn test_failed_dedicate_undoes_earlier_dedicates() {
        let f = fixture().await;
        f.guest.fail_dedicate.lock().insert("1b00".into());

        let err = f
            .orchestrator
            .attach(&connection("USER1", &["1a00", "1b00"]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Operation { .. });
        assert!(!f.guest.is_dedicated("1a00", "USER1"));
        assert_eq!(usage(&f, "1a00").await, FcpUsage::default());
        assert_eq!(usage(&f, "1b00").await, FcpUsage::default());
    }

    #[tokio::test]
    async fn test_incomplete_rollback_is_reported() {
        let f = fixture().await;
        f.guest.fail_dedicate.lock().insert("1b00".into());
        f.guest.fail_undedicate.lock().insert("1a00".into());

        let err = f
            .orchestrator
            .attach(&connection("USER1", &["1a00", "1b00"]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::RollbackFailed { ref rollback_errors, .. } if rollback_errors.len() == 1);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_failed_configure_keeps_dedication() {
        let f = fixture().await;
        *f.guest.fail_configure.lock() = true;

        let err = f
            .orchestrator
            .attach(&connection("USER1", &["1a00"]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Operation { .. });
        assert_eq!(usage(&f, "1a00").await, FcpUsage::default());
        assert!(f.guest.is_dedicated("1a00", "USER1"));
    }

    #[tokio::test]
    async fn test_failed_detach_configure_restores_usage() {
        let f = fixture().await;
        let conn = connection("USER1", &["1a00"]);
        f.orchestrator.attach(&conn).await.unwrap();

        *f.guest.fail_configure.lock() = true;
        assert_matches!(f.orchestrator.detach(&conn).await, Err(Error::Operation { .. }));
        assert_eq!(connections(&f, "1a00").await, 1);
        assert!(f.guest.is_dedicated("1a00", "USER1"));
    }

    #[tokio::test]
    async fn test_attach_requires_existing_guest_unless_root() {
        let f = fixture().await;
        assert_matches!(
            f.orchestrator.attach(&connection("NOBODY", &["1a00"])).await,
            Err(Error::GuestNotFound { .. })
        );

        let mut root = connection("NOBODY", &["1a00"]);
        root.is_root_volume = true;
        f.orchestrator.attach(&root).await.unwrap();
        assert_eq!(connections(&f, "1a00").await, 1);
        assert!(!f.guest.is_dedicated("1a00", "NOBODY"));
        assert!(f.guest.attach_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_device_of_other_assigner_is_rejected() {
        let f = fixture().await;
        f.orchestrator.attach(&connection("USER1", &["1a00"])).await.unwrap();
        f.guest.guests.lock().insert("USER2".into());

        assert_matches!(
            f.orchestrator.attach(&connection("USER2", &["1b00", "1a00"])).await,
            Err(Error::Conflict { .. })
        );
        assert_eq!(connections(&f, "1b00").await, 0);
        assert_eq!(connections(&f, "1a00").await, 1);
    }

    #[tokio::test]
    async fn test_set_usage_waits_for_assigner_lock() {
        let f = fixture().await;
        f.orchestrator.attach(&connection("USER1", &["1a00"])).await.unwrap();

        let guard = f.orchestrator.locks.acquire(&assigner_key("USER1")).await;
        let task = {
            let orchestrator = f.orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .dispatch(VolumeAction::SetFcpUsage {
                        fcp_id: FcpId::parse("1a00").unwrap(),
                        usage: FcpUsage::default(),
                    })
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        assert_eq!(connections(&f, "1a00").await, 1);

        drop(guard);
        task.await.unwrap().unwrap();
        assert_eq!(usage(&f, "1a00").await, FcpUsage::default());
    }

    #[tokio::test]
    async fn test_set_usage_locks_new_assigner() {
        let f = fixture().await;

        let guard = f.orchestrator.locks.acquire(&assigner_key("USER2")).await;
        let task = {
            let orchestrator = f.orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .dispatch(VolumeAction::SetFcpUsage {
                        fcp_id: FcpId::parse("1b01").unwrap(),
                        usage: FcpUsage {
                            assigner_id: "user2".into(),
                            reserved: true,
                            connections: 1,
                            template_id: String::new(),
                        },
                    })
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        drop(guard);
        task.await.unwrap().unwrap();
        assert_eq!(usage(&f, "1b01").await.assigner_id, "USER2");
    }

    #[tokio::test]
    async fn test_volume_connector() {
        let f = fixture().await;
        let request = ConnectorRequest {
            assigner_id: "user1".into(),
            reserve: true,
            ..Default::default()
        };
        let connector = f.orchestrator.get_volume_connector(&request).await.unwrap();
        assert_eq!(connector.fcp_devices, vec!["1a00", "1b00"]);
        assert_eq!(connector.host, "lpar1_USER1");
        assert_eq!(connector.template_id, f.template_id);
        assert_eq!(connector.wwpns[0], "c05076de33001a00");

        let lookup = ConnectorRequest {
            reserve: false,
            ..request.clone()
        };
        let again = f.orchestrator.get_volume_connector(&lookup).await.unwrap();
        assert_eq!(again.fcp_devices, connector.fcp_devices);

        let missing = ConnectorRequest {
            template_id: Some("missing".into()),
            ..request
        };
        assert_matches!(
            f.orchestrator.get_volume_connector(&missing).await,
            Err(Error::Operation { .. })
        );
    }

    #[tokio::test]
    async fn test_dispatch_records_metrics() {
        let f = fixture().await;
        let output = f
            .orchestrator
            .dispatch(VolumeAction::UnreserveDevices {
                assigner_id: "USER1".into(),
                template_id: String::new(),
            })
            .await;
        assert_matches!(output, Err(Error::InvalidParameter(_)));
        assert_eq!(
            f.orchestrator.metrics().operation_count("unreserve_devices", "error"),
            1
        );
        assert_eq!(
            f.orchestrator.metrics().operation_count("sync_with_hardware", "success"),
            1
        );
        assert_eq!(f.orchestrator.active_operations(), 0);
    }
}

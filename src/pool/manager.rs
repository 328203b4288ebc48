//! FCP Pool Manager
//!
//! Owns the pool's view of FCP devices: reconciliation with the live
//! hardware table, reservation and release for assigners, connection
//! counters and the template lifecycle. Every ownership change goes
//! through one store transaction.

use super::events::PoolEvent;
use super::selection::{select_devices, SelectionPolicy};
use super::statistics::{template_statistics, PathStatistics};
use crate::domain::ports::{
    FcpId, FcpRecord, FcpStoreRef, FcpTemplate, FcpUsage, HardwareQueryRef, PathMap,
    TemplateChanges, TemplateFilter,
};
use crate::error::{Error, Result};
use crate::hardware::parser::parse_fcp_devices;
use crate::hardware::range::{collapse_paths, expand_ranges};
use crate::lock::{NamedLockManager, SYNC_KEY};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// Configuration
// =============================================================================

/// Pool manager configuration
#[derive(Debug, Clone, Default)]
pub struct FcpManagerConfig {
    /// Named target for the hardware device query
    pub query_target: String,
    /// Prefer devices at the same offset of every path
    pub same_index_pairing: bool,
    /// Reconcile with hardware before each reservation
    pub sync_before_reserve: bool,
}

// =============================================================================
// Requests & Results
// =============================================================================

/// Template creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub description: String,
    /// Range expression, e.g. "1A00-1A03;1B00-1B03"
    pub fcp_devices: String,
    pub host_default: bool,
    pub storage_providers: Vec<String>,
    pub min_fcp_paths_count: Option<u32>,
}

/// Template edit request; absent fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EditTemplateRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub fcp_devices: Option<String>,
    pub host_default: Option<bool>,
    pub storage_providers: Option<Vec<String>>,
    pub min_fcp_paths_count: Option<u32>,
}

/// Devices held for an assigner under a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub template_id: String,
    pub devices: Vec<FcpRecord>,
}

/// Usage of one device around a counter change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageChange {
    pub previous: FcpUsage,
    pub current: FcpUsage,
}

impl UsageChange {
    /// The change took the device from zero connections to one
    pub fn is_first_connection(&self) -> bool {
        self.previous.connections == 0 && self.current.connections == 1
    }
}

/// Outcome of one reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Template with its bindings and device ranges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSummary {
    #[serde(flatten)]
    pub template: FcpTemplate,
    pub storage_providers: Vec<String>,
    pub fcp_devices: String,
    pub fcp_paths_count: usize,
}

/// Template summary with optional raw records and statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDetails {
    #[serde(flatten)]
    pub summary: TemplateSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<BTreeMap<u32, Vec<FcpRecord>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<BTreeMap<u32, PathStatistics>>,
}

// =============================================================================
// FCP Manager
// =============================================================================

/// FCP device pool manager
pub struct FcpManager {
    config: FcpManagerConfig,
    store: FcpStoreRef,
    hardware: HardwareQueryRef,
    locks: NamedLockManager,
    event_sender: broadcast::Sender<PoolEvent>,
}

impl FcpManager {
    pub fn new(config: FcpManagerConfig, store: FcpStoreRef, hardware: HardwareQueryRef) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(1024);
        Arc::new(Self {
            config,
            store,
            hardware,
            locks: NamedLockManager::new(),
            event_sender,
        })
    }

    /// Named locks shared with the orchestrator; reconciliation holds
    /// [`SYNC_KEY`]
    pub fn locks(&self) -> &NamedLockManager {
        &self.locks
    }

    /// Subscribe to pool events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.event_sender.subscribe()
    }

    fn emit(&self, event: PoolEvent) {
        if event.is_template_event() {
            debug!(template_id = ?event.template_id(), "Template event: {:?}", event);
        } else {
            debug!(
                template_id = ?event.template_id(),
                assigner_id = ?event.assigner_id(),
                "Pool event: {:?}",
                event
            );
        }
        let _ = self.event_sender.send(event);
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Replace the stored device set with the live hardware table
    ///
    /// Runs under [`SYNC_KEY`] so reconciliations never interleave.
    pub async fn sync_with_hardware(&self) -> Result<SyncSummary> {
        let _sync = self.locks.acquire(SYNC_KEY).await;

        let text = self
            .hardware
            .query_fcp_devices(&self.config.query_target)
            .await?;
        let live = parse_fcp_devices(&text)?;
        let outcome = self.store.reconcile_with_live_state(&live).await?;

        for r in outcome.removed.iter().filter(|r| r.is_in_use()) {
            warn!(
                "Removed FCP device {} missing from hardware while in use by {} ({} connections)",
                r.fcp_id, r.assigner_id, r.connections
            );
        }

        let summary = SyncSummary {
            inserted: outcome.inserted,
            updated: outcome.updated,
            deleted: outcome.removed.len(),
        };
        info!(
            "Reconciled FCP devices with {}: {} inserted, {} updated, {} deleted",
            self.config.query_target, summary.inserted, summary.updated, summary.deleted
        );
        self.emit(PoolEvent::Reconciled {
            inserted: summary.inserted,
            updated: summary.updated,
            deleted: summary.deleted,
        });
        Ok(summary)
    }

    // =========================================================================
    // Reservation
    // =========================================================================

    /// Resolve an explicit template, the provider's default or the host default
    pub async fn resolve_template(
        &self,
        template_id: Option<&str>,
        storage_provider: Option<&str>,
    ) -> Result<String> {
        if let Some(id) = template_id.filter(|id| !id.is_empty()) {
            return match self.store.get_template(id).await? {
                Some(_) => Ok(id.to_string()),
                None => Err(Error::TemplateNotFound {
                    template_id: id.to_string(),
                }),
            };
        }

        let storage_provider = storage_provider.filter(|sp| !sp.is_empty());
        if let Some(sp) = storage_provider {
            if let Some(id) = self.store.get_storage_provider_default(sp).await? {
                debug!("Using template {} bound to storage provider {}", id, sp);
                return Ok(id);
            }
        }
        if let Some(id) = self.store.get_host_default().await? {
            debug!("Using host default template {}", id);
            return Ok(id);
        }

        Err(Error::NoDefaultTemplate {
            storage_provider: storage_provider.map(String::from),
        })
    }

    /// Reserve one device per path for `assigner_id`
    ///
    /// Returns the devices the assigner already holds under the template
    /// when there are any. An empty device list means no reservation could
    /// be made.
    pub async fn reserve_devices(
        &self,
        assigner_id: &str,
        template_id: Option<&str>,
        storage_provider: Option<&str>,
    ) -> Result<Reservation> {
        let template_id = self.resolve_template(template_id, storage_provider).await?;
        let template = self
            .store
            .get_template(&template_id)
            .await?
            .ok_or_else(|| Error::TemplateNotFound {
                template_id: template_id.clone(),
            })?;

        if self.config.sync_before_reserve {
            self.sync_with_hardware().await?;
        }

        let same_index_pairing = self.config.same_index_pairing;
        let devices = self
            .store
            .reserve_with(assigner_id, &template_id, &|candidates| {
                let policy = SelectionPolicy {
                    same_index_pairing,
                    min_paths: template.effective_min_paths(candidates.len()),
                };
                select_devices(candidates, assigner_id, &template_id, policy)
            })
            .await?;

        if devices.is_empty() {
            warn!(
                "No FCP devices available for {} in template {}",
                assigner_id, template_id
            );
        } else {
            let fcp_ids: Vec<String> = devices.iter().map(|r| r.fcp_id.to_string()).collect();
            info!(
                "Reserved FCP devices {:?} for {} in template {}",
                fcp_ids, assigner_id, template_id
            );
            self.emit(PoolEvent::DevicesReserved {
                assigner_id: assigner_id.to_string(),
                template_id: template_id.clone(),
                fcp_ids,
            });
        }

        Ok(Reservation {
            template_id,
            devices,
        })
    }

    /// Devices the assigner holds under a template, one per path
    pub async fn held_devices(&self, assigner_id: &str, template_id: &str) -> Result<Vec<FcpRecord>> {
        let paths = self.store.get_template_path_mapping(template_id).await?;
        let mut held = Vec::new();
        for ids in paths.values() {
            let ids: Vec<FcpId> = ids.iter().cloned().collect();
            let records = self.store.bulk_get_fcps(&ids).await?;
            if let Some(r) = records
                .into_iter()
                .find(|r| r.reserved && r.is_held_by(assigner_id, template_id))
            {
                held.push(r);
            }
        }
        Ok(held)
    }

    /// Release the assigner's unconnected reservations under a template
    pub async fn unreserve_devices(
        &self,
        assigner_id: &str,
        template_id: &str,
    ) -> Result<Vec<FcpRecord>> {
        if template_id.is_empty() {
            return Err(Error::InvalidParameter(
                "a template id is required to release FCP devices".into(),
            ));
        }

        let released = self
            .store
            .modify_fcps(
                &|r| {
                    r.reserved
                        && r.connections == 0
                        && r.assigner_id == assigner_id
                        && r.template_id == template_id
                },
                &|r| {
                    r.reserved = false;
                    r.assigner_id.clear();
                    r.template_id.clear();
                },
            )
            .await?;

        if !released.is_empty() {
            let fcp_ids: Vec<String> = released.iter().map(|r| r.fcp_id.to_string()).collect();
            info!(
                "Released FCP devices {:?} of {} in template {}",
                fcp_ids, assigner_id, template_id
            );
            self.emit(PoolEvent::DevicesReleased {
                assigner_id: assigner_id.to_string(),
                template_id: template_id.to_string(),
                fcp_ids,
            });
        }
        Ok(released)
    }

    // =========================================================================
    // Usage Counters
    // =========================================================================

    /// Add one connection; returns the usage before and after
    pub async fn add_usage(&self, fcp_id: &FcpId, assigner_id: &str) -> Result<UsageChange> {
        let previous = Mutex::new(None);
        let record = self
            .store
            .modify_fcp(fcp_id, &|r| {
                if !r.assigner_id.is_empty() && r.assigner_id != assigner_id && r.is_in_use() {
                    return Err(Error::conflict(format!(
                        "FCP device {} is in use by {}",
                        r.fcp_id, r.assigner_id
                    )));
                }
                *previous.lock() = Some(r.usage());
                r.connections += 1;
                r.reserved = true;
                r.assigner_id = assigner_id.to_string();
                Ok(())
            })
            .await?;
        let previous = previous.into_inner().ok_or_else(|| {
            Error::Internal(format!("usage of FCP device {} was not captured", fcp_id))
        })?;

        debug!(
            "FCP device {} of {} now has {} connections",
            fcp_id, assigner_id, record.connections
        );
        self.emit(PoolEvent::UsageChanged {
            fcp_id: fcp_id.to_string(),
            assigner_id: assigner_id.to_string(),
            connections: record.connections,
        });
        Ok(UsageChange {
            previous,
            current: record.usage(),
        })
    }

    /// Put back the usage a device had before `change`
    ///
    /// Fails with a conflict when the device no longer carries the usage
    /// the change left on it.
    pub async fn restore_usage(&self, fcp_id: &FcpId, change: &UsageChange) -> Result<()> {
        let record = self
            .store
            .modify_fcp(fcp_id, &|r| {
                if r.usage() != change.current {
                    return Err(Error::conflict(format!(
                        "FCP device {} changed since its usage was recorded",
                        r.fcp_id
                    )));
                }
                r.apply_usage(&change.previous);
                Ok(())
            })
            .await?;

        debug!(
            "Restored usage of FCP device {}: assigner={} reserved={} connections={}",
            fcp_id, record.assigner_id, record.reserved, record.connections
        );
        self.emit(PoolEvent::UsageChanged {
            fcp_id: fcp_id.to_string(),
            assigner_id: record.assigner_id,
            connections: record.connections,
        });
        Ok(())
    }

    /// Remove one connection; returns the connections left
    pub async fn decrease_usage(&self, fcp_id: &FcpId, assigner_id: &str) -> Result<u32> {
        let record = self
            .store
            .modify_fcp(fcp_id, &|r| {
                if r.connections == 0 {
                    return Err(Error::conflict(format!(
                        "FCP device {} has no connections to remove",
                        r.fcp_id
                    )));
                }
                if r.assigner_id != assigner_id {
                    return Err(Error::conflict(format!(
                        "FCP device {} is in use by {}, not {}",
                        r.fcp_id, r.assigner_id, assigner_id
                    )));
                }
                r.connections -= 1;
                Ok(())
            })
            .await?;

        debug!(
            "FCP device {} of {} now has {} connections",
            fcp_id, assigner_id, record.connections
        );
        self.emit(PoolEvent::UsageChanged {
            fcp_id: fcp_id.to_string(),
            assigner_id: assigner_id.to_string(),
            connections: record.connections,
        });
        Ok(record.connections)
    }

    pub async fn get_fcp_usage(&self, fcp_id: &FcpId) -> Result<FcpUsage> {
        self.store
            .get_fcp(fcp_id)
            .await?
            .map(|r| r.usage())
            .ok_or_else(|| Error::DeviceNotFound {
                fcp_id: fcp_id.to_string(),
            })
    }

    /// Overwrite a device's usage columns
    pub async fn set_fcp_usage(&self, fcp_id: &FcpId, usage: &FcpUsage) -> Result<()> {
        self.store.set_usage(fcp_id, usage).await?;
        info!(
            "Set usage of FCP device {}: assigner={} reserved={} connections={} template={}",
            fcp_id, usage.assigner_id, usage.reserved, usage.connections, usage.template_id
        );
        self.emit(PoolEvent::UsageChanged {
            fcp_id: fcp_id.to_string(),
            assigner_id: usage.assigner_id.clone(),
            connections: usage.connections,
        });
        Ok(())
    }

    // =========================================================================
    // Template Lifecycle
    // =========================================================================

    pub async fn create_template(&self, request: &CreateTemplateRequest) -> Result<TemplateSummary> {
        let paths = expand_ranges(&request.fcp_devices)?;
        check_min_paths(request.min_fcp_paths_count, &paths)?;

        let template = FcpTemplate {
            id: Uuid::new_v4().to_string(),
            name: request.name.clone(),
            description: request.description.clone(),
            host_default: request.host_default,
            min_fcp_paths_count: request.min_fcp_paths_count,
            created_at: Utc::now(),
        };
        self.store
            .create_template(&template, &paths, &request.storage_providers)
            .await?;

        info!(
            "Created FCP template {} ({}) with {} paths",
            template.id,
            template.name,
            paths.len()
        );
        self.emit(PoolEvent::TemplateCreated {
            template_id: template.id.clone(),
        });
        self.summarize(template).await
    }

    pub async fn edit_template(
        &self,
        template_id: &str,
        request: &EditTemplateRequest,
    ) -> Result<TemplateSummary> {
        let paths = request
            .fcp_devices
            .as_deref()
            .map(expand_ranges)
            .transpose()?;
        let changes = TemplateChanges {
            name: request.name.clone(),
            description: request.description.clone(),
            paths,
            host_default: request.host_default,
            storage_providers: request.storage_providers.clone(),
            min_fcp_paths_count: request.min_fcp_paths_count,
        };

        let template = self.store.edit_template(template_id, &changes).await?;
        info!("Edited FCP template {}", template_id);
        self.emit(PoolEvent::TemplateEdited {
            template_id: template_id.to_string(),
        });
        self.summarize(template).await
    }

    pub async fn delete_template(&self, template_id: &str) -> Result<()> {
        self.store.delete_template(template_id).await?;
        info!("Deleted FCP template {}", template_id);
        self.emit(PoolEvent::TemplateDeleted {
            template_id: template_id.to_string(),
        });
        Ok(())
    }

    pub async fn get_templates(&self, filter: &TemplateFilter) -> Result<Vec<TemplateSummary>> {
        let templates = self.store.get_templates(filter).await?;
        let mut summaries = Vec::with_capacity(templates.len());
        for template in templates {
            summaries.push(self.summarize(template).await?);
        }
        Ok(summaries)
    }

    /// Template summaries with optional raw device records and statistics
    pub async fn get_templates_details(
        &self,
        template_ids: Option<&[String]>,
        raw: bool,
        statistics: bool,
        sync_with_hardware: bool,
    ) -> Result<Vec<TemplateDetails>> {
        if sync_with_hardware {
            self.sync_with_hardware().await?;
        }

        let filter = match template_ids {
            Some(ids) => TemplateFilter::Ids(ids.to_vec()),
            None => TemplateFilter::All,
        };
        let summaries = self.get_templates(&filter).await?;

        let records: HashMap<FcpId, FcpRecord> = if raw || statistics {
            self.store
                .all_fcps()
                .await?
                .into_iter()
                .map(|r| (r.fcp_id.clone(), r))
                .collect()
        } else {
            HashMap::new()
        };

        let mut details = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let paths = self
                .store
                .get_template_path_mapping(&summary.template.id)
                .await?;
            let raw: Option<BTreeMap<u32, Vec<FcpRecord>>> = raw.then(|| {
                paths
                    .iter()
                    .map(|(path, ids)| {
                        let list = ids.iter().filter_map(|id| records.get(id).cloned());
                        (*path, list.collect())
                    })
                    .collect()
            });
            let statistics = statistics.then(|| template_statistics(&paths, &records));
            details.push(TemplateDetails {
                summary,
                raw,
                statistics,
            });
        }
        Ok(details)
    }

    async fn summarize(&self, template: FcpTemplate) -> Result<TemplateSummary> {
        let paths = self.store.get_template_path_mapping(&template.id).await?;
        let storage_providers = self.store.get_storage_provider_bindings(&template.id).await?;
        Ok(TemplateSummary {
            fcp_devices: collapse_paths(&paths),
            fcp_paths_count: paths.len(),
            storage_providers,
            template,
        })
    }
}

fn check_min_paths(min: Option<u32>, paths: &PathMap) -> Result<()> {
    match min {
        Some(min) if min as usize > paths.len() => Err(Error::conflict(format!(
            "min_fcp_paths_count {} exceeds the {} paths of the device ranges",
            min,
            paths.len()
        ))),
        _ => Ok(()),
    }
}

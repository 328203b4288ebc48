//! In-memory FCP store
//!
//! Transactional engine behind the [`FcpStore`] port. Every mutating call
//! works on a copy of the table set and swaps it in only when the whole
//! call succeeds, so a failing call leaves no partial writes. With a
//! snapshot path configured, each commit is also written to disk as JSON
//! (synced temp file + rename) and reloaded on start.

use crate::domain::ports::{
    FcpDevice, FcpId, FcpRecord, FcpStore, FcpTemplate, FcpUsage, PathCandidates, PathMap,
    ReconcileOutcome, TemplateChanges, TemplateFilter,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Storage-provider literal that matches every bound template
const ALL_PROVIDERS: &str = "all";

// =============================================================================
// Tables
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Tables {
    fcps: BTreeMap<FcpId, FcpRecord>,
    templates: BTreeMap<String, FcpTemplate>,
    /// template id -> path -> device ids
    template_paths: BTreeMap<String, PathMap>,
    /// storage provider -> template id
    sp_bindings: BTreeMap<String, String>,
}

impl Tables {
    fn template(&self, template_id: &str) -> Result<&FcpTemplate> {
        self.templates
            .get(template_id)
            .ok_or_else(|| Error::TemplateNotFound {
                template_id: template_id.to_string(),
            })
    }

    /// Insert new devices and refresh known ones; returns (inserted, updated)
    fn upsert_live(&mut self, devices: &[FcpDevice]) -> (usize, usize) {
        let mut inserted = 0;
        let mut updated = 0;
        for device in devices {
            match self.fcps.get_mut(&device.id) {
                Some(record) => {
                    record.refresh_from_live(device);
                    updated += 1;
                }
                None => {
                    self.fcps.insert(device.id.clone(), FcpRecord::from_live(device));
                    inserted += 1;
                }
            }
        }
        (inserted, updated)
    }

    fn record_mut(&mut self, fcp_id: &FcpId) -> Result<&mut FcpRecord> {
        self.fcps.get_mut(fcp_id).ok_or_else(|| Error::DeviceNotFound {
            fcp_id: fcp_id.to_string(),
        })
    }

    /// Devices of `template_id` currently reserved or connected under it
    fn in_use_devices(&self, template_id: &str) -> Vec<FcpId> {
        self.template_paths
            .get(template_id)
            .into_iter()
            .flat_map(|paths| paths.values().flatten())
            .filter_map(|id| self.fcps.get(id))
            .filter(|r| r.template_id == template_id && r.is_in_use())
            .map(|r| r.fcp_id.clone())
            .collect()
    }

    fn add_placeholders(&mut self, paths: &PathMap) {
        for id in paths.values().flatten() {
            if !self.fcps.contains_key(id) {
                debug!("Recording placeholder for unknown FCP device {}", id);
                self.fcps.insert(id.clone(), FcpRecord::placeholder(id.clone()));
            }
        }
    }

    fn clear_host_default(&mut self) {
        for template in self.templates.values_mut() {
            template.host_default = false;
        }
    }

    fn bind_providers(&mut self, template_id: &str, providers: &[String]) {
        self.sp_bindings.retain(|_, bound| bound != template_id);
        for sp in providers {
            self.sp_bindings.insert(sp.clone(), template_id.to_string());
        }
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// Transactional in-memory implementation of [`FcpStore`]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    /// Serializes commits so snapshot writes land in commit order
    commit: Mutex<()>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Create a purely in-memory store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            commit: Mutex::new(()),
            snapshot_path: None,
        }
    }

    /// Create a store persisted to `path`, loading it when it exists
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tables = if path.exists() {
            let raw = std::fs::read(&path)?;
            let tables: Tables = serde_json::from_slice(&raw)?;
            info!(
                "Loaded FCP store snapshot from {} ({} devices, {} templates)",
                path.display(),
                tables.fcps.len(),
                tables.templates.len()
            );
            tables
        } else {
            Tables::default()
        };

        Ok(Self {
            tables: RwLock::new(tables),
            commit: Mutex::new(()),
            snapshot_path: Some(path),
        })
    }

    /// Run `f` against a working copy and commit it on success
    ///
    /// Readers keep seeing the previous tables until the snapshot is on
    /// disk and the copy is swapped in.
    async fn transact<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let _commit = self.commit.lock().await;
        let mut working = self.tables.read().clone();
        let out = f(&mut working)?;

        if let Some(path) = &self.snapshot_path {
            let data = serde_json::to_vec_pretty(&working)?;
            let path = path.clone();
            tokio::task::spawn_blocking(move || atomic_write(&path, &data))
                .await
                .map_err(|e| Error::Internal(format!("snapshot writer failed: {}", e)))??;
        }
        *self.tables.write() = working;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.tables.read())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Write `data` to a temp file next to `target`, sync it, then rename it
/// into place. The temp file is removed when any step fails.
fn atomic_write(target: &Path, data: &[u8]) -> Result<()> {
    let tmp = target.with_extension("tmp");
    let written = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp, target)
    })();

    if let Err(e) = written {
        warn!("Failed to write FCP store snapshot {}: {}", target.display(), e);
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl FcpStore for MemoryStore {
    async fn get_fcp(&self, fcp_id: &FcpId) -> Result<Option<FcpRecord>> {
        Ok(self.read(|t| t.fcps.get(fcp_id).cloned()))
    }

    async fn bulk_get_fcps(&self, fcp_ids: &[FcpId]) -> Result<Vec<FcpRecord>> {
        Ok(self.read(|t| {
            fcp_ids
                .iter()
                .filter_map(|id| t.fcps.get(id).cloned())
                .collect()
        }))
    }

    async fn all_fcps(&self) -> Result<Vec<FcpRecord>> {
        Ok(self.read(|t| t.fcps.values().cloned().collect()))
    }

    async fn get_all_fcps_grouped_by_template(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<u32, Vec<FcpRecord>>>> {
        Ok(self.read(|t| {
            t.template_paths
                .iter()
                .map(|(template_id, paths)| {
                    let grouped = paths
                        .iter()
                        .map(|(path, ids)| {
                            let records = ids.iter().filter_map(|id| t.fcps.get(id).cloned());
                            (*path, records.collect())
                        })
                        .collect();
                    (template_id.clone(), grouped)
                })
                .collect()
        }))
    }

    async fn set_usage(&self, fcp_id: &FcpId, usage: &FcpUsage) -> Result<()> {
        usage.validate()?;
        self.transact(|t| {
            t.record_mut(fcp_id)?.apply_usage(usage);
            Ok(())
        })
        .await
    }

    async fn bulk_upsert_from_live_state(&self, devices: &[FcpDevice]) -> Result<()> {
        self.transact(|t| {
            t.upsert_live(devices);
            Ok(())
        })
        .await
    }

    async fn reconcile_with_live_state(&self, devices: &[FcpDevice]) -> Result<ReconcileOutcome> {
        self.transact(|t| {
            let live: BTreeSet<&FcpId> = devices.iter().map(|d| &d.id).collect();
            let stale: Vec<FcpId> = t
                .fcps
                .keys()
                .filter(|id| !live.contains(id))
                .cloned()
                .collect();

            let (inserted, updated) = t.upsert_live(devices);
            let removed = stale
                .iter()
                .filter_map(|id| t.fcps.remove(id))
                .collect();
            Ok(ReconcileOutcome {
                inserted,
                updated,
                removed,
            })
        })
        .await
    }

    async fn bulk_delete(&self, fcp_ids: &[FcpId]) -> Result<()> {
        self.transact(|t| {
            for id in fcp_ids {
                t.fcps.remove(id);
            }
            Ok(())
        })
        .await
    }

    async fn modify_fcp(
        &self,
        fcp_id: &FcpId,
        update: &(dyn for<'r> Fn(&'r mut FcpRecord) -> Result<()> + Send + Sync),
    ) -> Result<FcpRecord> {
        self.transact(|t| {
            let record = t.record_mut(fcp_id)?;
            update(record)?;
            record.usage().validate()?;
            Ok(record.clone())
        })
        .await
    }

    async fn modify_fcps(
        &self,
        filter: &(dyn for<'r> Fn(&'r FcpRecord) -> bool + Send + Sync),
        update: &(dyn for<'r> Fn(&'r mut FcpRecord) + Send + Sync),
    ) -> Result<Vec<FcpRecord>> {
        self.transact(|t| {
            let mut modified = Vec::new();
            for record in t.fcps.values_mut().filter(|r| filter(r)) {
                update(record);
                record.usage().validate()?;
                modified.push(record.clone());
            }
            Ok(modified)
        })
        .await
    }

    async fn reserve_with(
        &self,
        assigner_id: &str,
        template_id: &str,
        selector: &(dyn for<'c> Fn(&'c [PathCandidates]) -> Result<Vec<FcpId>> + Send + Sync),
    ) -> Result<Vec<FcpRecord>> {
        self.transact(|t| {
            t.template(template_id)?;
            let candidates: Vec<PathCandidates> = t
                .template_paths
                .get(template_id)
                .into_iter()
                .flatten()
                .map(|(path, ids)| PathCandidates {
                    path: *path,
                    devices: ids.iter().filter_map(|id| t.fcps.get(id).cloned()).collect(),
                })
                .collect();

            let chosen = selector(&candidates)?;

            let mut reserved = Vec::with_capacity(chosen.len());
            for id in &chosen {
                let record = t.record_mut(id)?;
                if !record.is_held_by(assigner_id, template_id) && !record.is_free() {
                    return Err(Error::Internal(format!(
                        "selected FCP device {} is not free",
                        id
                    )));
                }
                record.reserved = true;
                record.assigner_id = assigner_id.to_string();
                record.template_id = template_id.to_string();
                reserved.push(record.clone());
            }
            Ok(reserved)
        })
        .await
    }

    async fn create_template(
        &self,
        template: &FcpTemplate,
        paths: &PathMap,
        storage_providers: &[String],
    ) -> Result<()> {
        self.transact(|t| {
            if t.templates.contains_key(&template.id) {
                return Err(Error::conflict(format!(
                    "FCP template {} already exists",
                    template.id
                )));
            }
            if template.host_default {
                t.clear_host_default();
            }
            t.add_placeholders(paths);
            t.templates.insert(template.id.clone(), template.clone());
            t.template_paths.insert(template.id.clone(), paths.clone());
            t.bind_providers(&template.id, storage_providers);
            Ok(())
        })
        .await
    }

    async fn edit_template(
        &self,
        template_id: &str,
        changes: &TemplateChanges,
    ) -> Result<FcpTemplate> {
        self.transact(|t| {
            let mut template = t.template(template_id)?.clone();

            if let Some(paths) = &changes.paths {
                let current = t.template_paths.get(template_id);
                if current != Some(paths) {
                    let in_use = t.in_use_devices(template_id);
                    if !in_use.is_empty() {
                        return Err(Error::conflict(format!(
                            "cannot change devices of FCP template {}: devices in use: {}",
                            template_id,
                            join_ids(&in_use)
                        )));
                    }
                    t.add_placeholders(paths);
                    t.template_paths.insert(template_id.to_string(), paths.clone());
                }
            }

            if let Some(name) = &changes.name {
                template.name = name.clone();
            }
            if let Some(description) = &changes.description {
                template.description = description.clone();
            }
            if let Some(min) = changes.min_fcp_paths_count {
                template.min_fcp_paths_count = Some(min);
            }
            if let Some(host_default) = changes.host_default {
                if host_default {
                    t.clear_host_default();
                }
                template.host_default = host_default;
            }
            if let Some(providers) = &changes.storage_providers {
                t.bind_providers(template_id, providers);
            }

            let path_count = t.template_paths.get(template_id).map_or(0, |p| p.len());
            if let Some(min) = template.min_fcp_paths_count {
                if min as usize > path_count {
                    return Err(Error::conflict(format!(
                        "min_fcp_paths_count {} exceeds the {} paths of FCP template {}",
                        min, path_count, template_id
                    )));
                }
            }

            t.templates.insert(template_id.to_string(), template.clone());
            Ok(template)
        })
        .await
    }

    async fn delete_template(&self, template_id: &str) -> Result<()> {
        self.transact(|t| {
            t.template(template_id)?;
            let in_use = t.in_use_devices(template_id);
            if !in_use.is_empty() {
                return Err(Error::conflict(format!(
                    "FCP template {} is in use by devices {}",
                    template_id,
                    join_ids(&in_use)
                )));
            }
            t.templates.remove(template_id);
            t.template_paths.remove(template_id);
            t.sp_bindings.retain(|_, bound| bound != template_id);
            Ok(())
        })
        .await
    }

    async fn get_template(&self, template_id: &str) -> Result<Option<FcpTemplate>> {
        Ok(self.read(|t| t.templates.get(template_id).cloned()))
    }

    async fn get_templates(&self, filter: &TemplateFilter) -> Result<Vec<FcpTemplate>> {
        Ok(self.read(|t| {
            let mut templates: Vec<FcpTemplate> = match filter {
                TemplateFilter::All => t.templates.values().cloned().collect(),
                TemplateFilter::Ids(ids) => ids
                    .iter()
                    .filter_map(|id| t.templates.get(id).cloned())
                    .collect(),
                TemplateFilter::Assigner(assigner) => {
                    let held: BTreeSet<&str> = t
                        .fcps
                        .values()
                        .filter(|r| &r.assigner_id == assigner && r.is_in_use())
                        .map(|r| r.template_id.as_str())
                        .collect();
                    t.templates
                        .values()
                        .filter(|tmpl| held.contains(tmpl.id.as_str()))
                        .cloned()
                        .collect()
                }
                TemplateFilter::HostDefault => t
                    .templates
                    .values()
                    .filter(|tmpl| tmpl.host_default)
                    .cloned()
                    .collect(),
                TemplateFilter::StorageProviders(providers) => {
                    let any = providers.iter().any(|sp| sp == ALL_PROVIDERS);
                    let bound: BTreeSet<&str> = t
                        .sp_bindings
                        .iter()
                        .filter(|(sp, _)| any || providers.contains(sp))
                        .map(|(_, id)| id.as_str())
                        .collect();
                    t.templates
                        .values()
                        .filter(|tmpl| bound.contains(tmpl.id.as_str()))
                        .cloned()
                        .collect()
                }
            };
            if !matches!(filter, TemplateFilter::Ids(_)) {
                templates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            }
            templates
        }))
    }

    async fn get_template_path_mapping(&self, template_id: &str) -> Result<PathMap> {
        self.read(|t| {
            t.template(template_id)?;
            Ok(t.template_paths.get(template_id).cloned().unwrap_or_default())
        })
    }

    async fn get_storage_provider_bindings(&self, template_id: &str) -> Result<Vec<String>> {
        Ok(self.read(|t| {
            t.sp_bindings
                .iter()
                .filter(|(_, bound)| bound.as_str() == template_id)
                .map(|(sp, _)| sp.clone())
                .collect()
        }))
    }

    async fn get_storage_provider_default(
        &self,
        storage_provider: &str,
    ) -> Result<Option<String>> {
        Ok(self.read(|t| t.sp_bindings.get(storage_provider).cloned()))
    }

    async fn get_host_default(&self) -> Result<Option<String>> {
        Ok(self.read(|t| {
            t.templates
                .values()
                .find(|tmpl| tmpl.host_default)
                .map(|tmpl| tmpl.id.clone())
        }))
    }
}

fn join_ids(ids: &[FcpId]) -> String {
    ids.iter().map(FcpId::as_str).collect::<Vec<_>>().join(",")
}

//! Reservation device selection
//!
//! Pure selection logic run by the store inside the reservation
//! transaction. It sees one [`PathCandidates`] per template path (devices
//! id-sorted) and returns the ids to hold, in path order.

use crate::domain::ports::{wwpn_is_set, FcpId, FcpRecord, PathCandidates};
use crate::error::{Error, Result};
use tracing::debug;

/// Knobs for one reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionPolicy {
    /// Prefer devices at the same offset of every path
    pub same_index_pairing: bool,
    /// Fewest paths that must get a device, else nothing is reserved
    pub min_paths: usize,
}

/// Choose devices for `assigner_id` under `template_id`
///
/// Devices the assigner already holds under the template win over fresh
/// picks. An empty result means the template cannot currently serve the
/// reservation.
pub fn select_devices(
    candidates: &[PathCandidates],
    assigner_id: &str,
    template_id: &str,
    policy: SelectionPolicy,
) -> Result<Vec<FcpId>> {
    let held: Vec<&FcpRecord> = candidates
        .iter()
        .filter_map(|path| {
            path.devices
                .iter()
                .find(|r| r.reserved && r.is_held_by(assigner_id, template_id))
        })
        .collect();
    if !held.is_empty() {
        debug!(
            "Assigner {} already holds {} devices under template {}",
            assigner_id,
            held.len(),
            template_id
        );
        return finish(held);
    }

    let picked = if policy.same_index_pairing {
        pick_same_index(candidates).unwrap_or_else(|| pick_independent(candidates))
    } else {
        pick_independent(candidates)
    };

    if picked.is_empty() || picked.len() < policy.min_paths {
        debug!(
            "Template {} has free devices on {} paths, {} required",
            template_id,
            picked.len(),
            policy.min_paths
        );
        return Ok(Vec::new());
    }

    finish(picked)
}

/// First free device of every path that has one
fn pick_independent(candidates: &[PathCandidates]) -> Vec<&FcpRecord> {
    candidates
        .iter()
        .filter_map(|path| path.devices.iter().find(|r| r.is_free()))
        .collect()
}

/// Devices at the lowest offset that is free on every path
fn pick_same_index(candidates: &[PathCandidates]) -> Option<Vec<&FcpRecord>> {
    if candidates.is_empty() {
        return None;
    }
    let shortest = candidates.iter().map(|p| p.devices.len()).min()?;
    (0..shortest).find_map(|offset| {
        candidates
            .iter()
            .map(|path| Some(&path.devices[offset]).filter(|r| r.is_free()))
            .collect::<Option<Vec<_>>>()
    })
}

/// Verify both WWPNs of every chosen device and return the ids
fn finish(chosen: Vec<&FcpRecord>) -> Result<Vec<FcpId>> {
    for record in &chosen {
        if !wwpn_is_set(&record.wwpn_npiv) {
            return Err(missing_wwpn(record, "NPIV WWPN"));
        }
        if !wwpn_is_set(&record.wwpn_phy) {
            return Err(missing_wwpn(record, "physical WWPN"));
        }
    }
    Ok(chosen.into_iter().map(|r| r.fcp_id.clone()).collect())
}

fn missing_wwpn(record: &FcpRecord, field: &str) -> Error {
    Error::Operation {
        operation: "reserve_devices".into(),
        reason: format!("FCP device {} has no {}", record.fcp_id, field),
        fcp_ids: vec![record.fcp_id.to_string()],
        rolled_back: Vec::new(),
    }
}

//! FCP Device State Parser
//!
//! Converts the hypervisor's free-text FCP device listing into structured
//! [`FcpDevice`] records. Each device is described by six labelled lines,
//! each optionally prefixed by a node name and a colon:
//!
//! ```text
//! opnstk1: FCP device number: 1A00
//! opnstk1:   Status: Free
//! opnstk1:   NPIV world wide port number: C05076DE330003C2
//! opnstk1:   Channel path ID: 27
//! opnstk1:   Physical world wide port number: C05076DE33002E41
//! opnstk1:   Owner: NONE
//! ```
//!
//! A malformed or partial block is a protocol violation and fails the
//! whole parse with [`Error::Internal`].

use crate::domain::ports::{FcpDevice, FcpId, FcpStatus, NONE_VALUE};
use crate::error::{Error, Result};
use tracing::debug;

const LABEL_DEVICE: &str = "FCP device number";
const LABEL_STATUS: &str = "Status";
const LABEL_NPIV: &str = "NPIV world wide port number";
const LABEL_CHPID: &str = "Channel path ID";
const LABEL_PHYSICAL: &str = "Physical world wide port number";
const LABEL_OWNER: &str = "Owner";

// Longer labels first so "Status" never shadows a WWPN line
const LABELS: [&str; 6] = [
    LABEL_PHYSICAL,
    LABEL_NPIV,
    LABEL_DEVICE,
    LABEL_CHPID,
    LABEL_STATUS,
    LABEL_OWNER,
];

#[derive(Debug, Default)]
struct PartialDevice {
    id: Option<String>,
    status: Option<String>,
    npiv: Option<String>,
    chpid: Option<String>,
    physical: Option<String>,
    owner: Option<String>,
}

impl PartialDevice {
    fn slot(&mut self, label: &str) -> &mut Option<String> {
        match label {
            LABEL_DEVICE => &mut self.id,
            LABEL_STATUS => &mut self.status,
            LABEL_NPIV => &mut self.npiv,
            LABEL_CHPID => &mut self.chpid,
            LABEL_PHYSICAL => &mut self.physical,
            _ => &mut self.owner,
        }
    }

    fn finish(self) -> Result<FcpDevice> {
        let id = self.id.ok_or_else(|| partial("missing device number"))?;
        let missing = |field: &str| partial(&format!("device {}: missing {}", id, field));

        let status = self.status.ok_or_else(|| missing(LABEL_STATUS))?;
        let npiv = self.npiv.ok_or_else(|| missing(LABEL_NPIV))?;
        let chpid = self.chpid.ok_or_else(|| missing(LABEL_CHPID))?;
        let physical = self.physical.ok_or_else(|| missing(LABEL_PHYSICAL))?;
        let owner = self.owner.ok_or_else(|| missing(LABEL_OWNER))?;

        let fcp_id = FcpId::parse(&id)
            .map_err(|_| partial(&format!("invalid device number '{}'", id)))?;
        let status: FcpStatus = status
            .parse()
            .map_err(|_| partial(&format!("device {}: unknown status '{}'", id, status)))?;

        Ok(FcpDevice {
            id: fcp_id,
            npiv_wwpn: or_none(npiv),
            physical_wwpn: or_none(physical),
            chpid,
            status,
            owner: or_none(owner),
        })
    }
}

/// Parse a device listing into one [`FcpDevice`] per block
pub fn parse_fcp_devices(text: &str) -> Result<Vec<FcpDevice>> {
    let mut devices = Vec::new();
    let mut current: Option<PartialDevice> = None;

    for line in text.lines() {
        let Some((label, value)) = split_labelled_line(line) else {
            if !line.trim().is_empty() {
                debug!("Ignoring unlabelled device query line: {}", line.trim());
            }
            continue;
        };

        if label == LABEL_DEVICE {
            if let Some(done) = current.take() {
                devices.push(done.finish()?);
            }
            current = Some(PartialDevice::default());
        }

        let block = current
            .as_mut()
            .ok_or_else(|| partial(&format!("'{}' line before any device number", label)))?;
        let slot = block.slot(label);
        if slot.is_some() {
            return Err(partial(&format!("duplicate '{}' line in one device block", label)));
        }
        *slot = Some(value);
    }

    if let Some(done) = current.take() {
        devices.push(done.finish()?);
    }

    Ok(devices)
}

/// Find a known label in the line and return it with its lower-cased value
fn split_labelled_line(line: &str) -> Option<(&'static str, String)> {
    LABELS.iter().find_map(|&label| {
        let pos = line.find(label)?;
        let rest = line[pos + label.len()..].trim_start().strip_prefix(':')?;
        Some((label, rest.trim().to_lowercase()))
    })
}

fn or_none(value: String) -> String {
    if value.is_empty() {
        NONE_VALUE.to_string()
    } else {
        value
    }
}

fn partial(reason: &str) -> Error {
    Error::Internal(format!("malformed FCP device query output: {}", reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const TWO_DEVICES: &str = "\
opnstk1: FCP device number: 1A00
opnstk1:   Status: Free
opnstk1:   NPIV world wide port number: C05076DE330003C2
opnstk1:   Channel path ID: 27
opnstk1:   Physical world wide port number: C05076DE33002E41
opnstk1:   Owner: NONE
opnstk1: FCP device number: 1B0E
opnstk1:   Status: Active
opnstk1:   NPIV world wide port number: NONE
opnstk1:   Channel path ID: 2A
opnstk1:   Physical world wide port number:
opnstk1:   Owner: TEST0001
";

    #[test]
    fn test_parse_two_devices() {
        let devices = parse_fcp_devices(TWO_DEVICES).unwrap();
        assert_eq!(devices.len(), 2);

        assert_eq!(devices[0].id.as_str(), "1a00");
        assert_eq!(devices[0].status, FcpStatus::Free);
        assert_eq!(devices[0].npiv_wwpn, "c05076de330003c2");
        assert_eq!(devices[0].physical_wwpn, "c05076de33002e41");
        assert_eq!(devices[0].chpid, "27");
        assert_eq!(devices[0].owner, "none");

        assert_eq!(devices[1].id.as_str(), "1b0e");
        assert_eq!(devices[1].status, FcpStatus::Active);
        assert_eq!(devices[1].npiv_wwpn, "none");
        assert_eq!(devices[1].physical_wwpn, "none");
        assert_eq!(devices[1].chpid, "2a");
        assert_eq!(devices[1].owner, "test0001");
    }

    #[test]
    fn test_parse_without_node_prefix() {
        let text = "FCP device number: 0E83\nStatus: Offline\nNPIV world wide port number: 1\n\
                    Channel path ID: 01\nPhysical world wide port number: 2\nOwner: NONE\n";
        let devices = parse_fcp_devices(text).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id.as_str(), "0e83");
        assert_eq!(devices[0].status, FcpStatus::Offline);
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_fcp_devices("").unwrap().is_empty());
        assert!(parse_fcp_devices("\n  \n").unwrap().is_empty());
    }

    #[test]
    fn test_partial_block_is_fatal() {
        let text = "FCP device number: 1A00\nStatus: Free\nOwner: NONE\n";
        assert_matches!(parse_fcp_devices(text), Err(Error::Internal(_)));
    }

    #[test]
    fn test_orphan_field_is_fatal() {
        let text = "Status: Free\nFCP device number: 1A00\n";
        assert_matches!(parse_fcp_devices(text), Err(Error::Internal(_)));
    }

    #[test]
    fn test_bad_values_are_fatal() {
        let bad_status = TWO_DEVICES.replace("Status: Free", "Status: Busy");
        assert_matches!(parse_fcp_devices(&bad_status), Err(Error::Internal(_)));

        let bad_id = TWO_DEVICES.replace("number: 1A00", "number: XYZW");
        assert_matches!(parse_fcp_devices(&bad_id), Err(Error::Internal(_)));
    }
}

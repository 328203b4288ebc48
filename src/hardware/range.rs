//! FCP Device Range Codec
//!
//! Converts between human-readable device range expressions such as
//! `"1A00-1A03;1B00-1B03"` and per-path sets of device ids.
//!
//! Grammar: paths are separated by `;`, each path is a `,`-separated list
//! of single ids or `id-id` ranges (1-4 hex digits, case-insensitive,
//! whitespace around tokens ignored).

use crate::domain::ports::{FcpId, PathMap};
use crate::error::{Error, Result};
use std::collections::BTreeSet;

/// Expand a range expression into path index -> device id set
pub fn expand_ranges(spec: &str) -> Result<PathMap> {
    let mut paths = PathMap::new();
    if spec.trim().is_empty() {
        return Ok(paths);
    }

    for (path_no, group) in spec.split(';').enumerate() {
        let mut devices = BTreeSet::new();
        for item in group.split(',') {
            let item = item.trim();
            if item.is_empty() {
                return Err(invalid(spec, format!("empty item in path {}", path_no)));
            }
            match item.split_once('-') {
                Some((start, end)) => {
                    let start = parse_id(spec, start)?;
                    let end = parse_id(spec, end)?;
                    if start.value() > end.value() {
                        return Err(invalid(
                            spec,
                            format!("range start {} is greater than end {}", start, end),
                        ));
                    }
                    devices.extend((start.value()..=end.value()).map(FcpId::from_u16));
                }
                None => {
                    devices.insert(parse_id(spec, item)?);
                }
            }
        }
        paths.insert(path_no as u32, devices);
    }

    Ok(paths)
}

/// Collapse a device set into the shortest range expression
///
/// Contiguous runs become `A-B`, singletons stand alone; uppercase hex,
/// comma-joined.
pub fn collapse_to_ranges(ids: &BTreeSet<FcpId>) -> String {
    let mut runs: Vec<(u16, u16)> = Vec::new();
    for value in ids.iter().map(FcpId::value) {
        match runs.last_mut() {
            Some((_, end)) if end.checked_add(1) == Some(value) => *end = value,
            _ => runs.push((value, value)),
        }
    }

    runs.iter()
        .map(|&(start, end)| {
            if start == end {
                format!("{:04X}", start)
            } else {
                format!("{:04X}-{:04X}", start, end)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Collapse every path of a mapping, joined with `;` in path order
pub fn collapse_paths(paths: &PathMap) -> String {
    paths
        .values()
        .map(collapse_to_ranges)
        .collect::<Vec<_>>()
        .join(";")
}

fn parse_id(spec: &str, token: &str) -> Result<FcpId> {
    FcpId::parse(token).map_err(|_| invalid(spec, format!("'{}' is not a device number", token.trim())))
}

fn invalid(spec: &str, reason: String) -> Error {
    Error::InvalidFormat {
        input: spec.to_string(),
        reason,
    }
}

//! Command-backed hardware query
//!
//! Runs a local command that prints the hypervisor's FCP device listing,
//! for hosts where the device table is reachable through a CLI rather than
//! the REST gateway.

use crate::domain::ports::HardwareQuery;
use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Hardware query that shells out to a configured program
///
/// The query target is appended as the last argument.
#[derive(Debug, Clone)]
pub struct CommandHardwareQuery {
    program: String,
    args: Vec<String>,
}

impl CommandHardwareQuery {
    /// Build from an argv list (program first)
    pub fn new(argv: &[String]) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            Error::Configuration("hardware query command must not be empty".into())
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl HardwareQuery for CommandHardwareQuery {
    async fn query_fcp_devices(&self, target: &str) -> Result<String> {
        debug!("Querying FCP devices of {} via {}", target, self.program);

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(target)
            .output()
            .await
            .map_err(|e| {
                Error::operation("query_fcp_devices", format!("{}: {}", self.program, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::operation(
                "query_fcp_devices",
                format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            ));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| Error::Internal(format!("device query output is not UTF-8: {}", e)))
    }
}

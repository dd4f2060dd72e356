//! Monitor enumeration through `xrandr --listmonitors`.

use async_trait::async_trait;

use super::ProcessRunner;
use crate::error::BridgeError;
use crate::geometry::{parse_geometry, MonitorSource, PhysicalMonitor};

pub struct XrandrMonitors {
    runner: ProcessRunner,
}

impl XrandrMonitors {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }
}

/// Parse lines such as ` 0: +*DP-1 1920/527x1080/296+0+0  DP-1`.
/// `*` marks the primary output; the `/mm` parts are physical size.
pub fn parse_listmonitors(output: &str) -> Vec<PhysicalMonitor> {
    output
        .lines()
        .filter_map(|line| {
            let (_, rest) = line.trim().split_once(':')?;
            let mut fields = rest.split_whitespace();
            let flagged = fields.next()?;
            let geometry = fields.next()?;
            let is_primary = flagged.contains('*');
            let name = fields
                .next()
                .map(str::to_string)
                .unwrap_or_else(|| flagged.trim_start_matches(['+', '*']).to_string());
            let rect = parse_geometry(&strip_physical_size(geometry))?;
            Some(PhysicalMonitor {
                name,
                rect,
                is_primary,
            })
        })
        .collect()
}

/// `1920/527x1080/296+0+0` -> `1920x1080+0+0`
fn strip_physical_size(geometry: &str) -> String {
    let mut out = String::with_capacity(geometry.len());
    let mut skipping = false;
    for c in geometry.chars() {
        match c {
            '/' => skipping = true,
            'x' | '+' | '-' => {
                skipping = false;
                out.push(c);
            }
            _ if !skipping => out.push(c),
            _ => {}
        }
    }
    out
}

#[async_trait]
impl MonitorSource for XrandrMonitors {
    async fn enumerate(&self) -> Result<Vec<PhysicalMonitor>, BridgeError> {
        let output = self
            .runner
            .run("xrandr", &["--listmonitors"])
            .await
            .map_err(|e| BridgeError::Internal(format!("monitor enumeration failed: {}", e)))?;
        if !output.success() {
            return Err(BridgeError::Internal(format!(
                "xrandr --listmonitors failed: {}",
                output.stderr.trim()
            )));
        }
        let monitors = parse_listmonitors(&output.stdout_str());
        tracing::debug!(count = monitors.len(), "Enumerated monitors");
        Ok(monitors)
    }
}

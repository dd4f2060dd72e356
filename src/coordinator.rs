//! The process-wide bridge: owns capabilities, displays, governor, router
//! and audit log, and is the single entry point for actions.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use sysinfo::System;

use crate::audit::{redact_params, AuditLog, AuditOutcome, JsonlSink};
use crate::backends::{BackendSet, ProcessRunner, XrandrMonitors};
use crate::config::{Config, ConfigError, ProbeConfig};
use crate::error::BridgeError;
use crate::geometry::{CoordinateMapper, DisplayMap, MonitorSource, StaticMonitors};
use crate::probe::{Capabilities, CapabilityProbe};
use crate::router::BackendRouter;
use crate::safety::{Decision, Policy, SafetyGovernor};
use crate::types::{ActionRequest, ActionResult, MonitorDescriptor};

pub struct Bridge {
    probe: CapabilityProbe,
    capabilities: RwLock<Arc<Capabilities>>,
    displays: Arc<DisplayMap>,
    governor: SafetyGovernor,
    router: BackendRouter,
    audit: Arc<AuditLog>,
}

impl Bridge {
    /// Probe every backend once and assemble the bridge.
    pub async fn initialize(
        backends: BackendSet,
        monitors: Arc<dyn MonitorSource>,
        policy: Policy,
        mapper: CoordinateMapper,
        attempt_timeout: Duration,
        probe_config: ProbeConfig,
        audit: Arc<AuditLog>,
    ) -> Self {
        let probe = CapabilityProbe::new(probe_config);
        let capabilities = probe.probe(&backends).await;
        let displays = Arc::new(DisplayMap::new(monitors));

        match displays.snapshot().await {
            Ok(found) => tracing::info!(
                monitors = found.iter().filter(|m| !m.is_union()).count(),
                "Display geometry loaded"
            ),
            Err(e) => tracing::warn!("Could not enumerate monitors: {}", e),
        }

        let router = BackendRouter::new(
            backends,
            mapper,
            Arc::clone(&displays),
            attempt_timeout,
            Arc::clone(&audit),
        );

        Self {
            probe,
            capabilities: RwLock::new(Arc::new(capabilities)),
            displays,
            governor: SafetyGovernor::new(policy, Arc::clone(&audit)),
            router,
            audit,
        }
    }

    /// Build the native backend set, monitor source and audit sink described
    /// by `config`, then initialize.
    pub async fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let backends = BackendSet::native(&config.display, config.attempt_timeout);

        let monitors: Arc<dyn MonitorSource> = match &config.static_monitors {
            Some(spec) => Arc::new(
                StaticMonitors::parse(spec)
                    .map_err(|e| ConfigError::InvalidValue("LILITH_MONITORS".to_string(), e))?,
            ),
            None => Arc::new(XrandrMonitors::new(ProcessRunner::new(
                config.display.clone(),
                config.probe.timeout,
            ))),
        };

        let mut audit = AuditLog::new(config.audit_capacity);
        if let Some(path) = &config.audit_log {
            let sink = JsonlSink::open(path)
                .map_err(|e| ConfigError::AuditLog(path.clone(), e.to_string()))?;
            audit = audit.with_sink(Box::new(sink));
        }

        Ok(Self::initialize(
            backends,
            monitors,
            config.policy.clone(),
            CoordinateMapper::new(config.union_policy),
            config.attempt_timeout,
            config.probe.clone(),
            Arc::new(audit),
        )
        .await)
    }

    /// Authorize, route and audit one action.
    pub async fn perform(&self, request: ActionRequest, caller: &str) -> ActionResult {
        if let Decision::Deny(err) = self.governor.authorize(&request, caller) {
            return ActionResult::failure(&err, None, Vec::new());
        }

        let caps = self.capabilities();
        let result = self.router.execute(&request, &caps, caller).await;

        let outcome = match &result.error {
            None => AuditOutcome::Completed,
            Some(err) => AuditOutcome::Failed {
                error: err.message.clone(),
            },
        };
        self.audit.append(
            request.kind.method_name(),
            redact_params(request.kind, &request.params),
            result.backend_used,
            outcome,
            caller,
        );

        match &result.error {
            None => tracing::debug!(
                action = %request.kind,
                backend = ?result.backend_used,
                "Action completed"
            ),
            Some(err) => tracing::warn!(
                action = %request.kind,
                kind = ?err.kind,
                "Action failed: {}",
                err.message
            ),
        }
        result
    }

    pub fn capabilities(&self) -> Arc<Capabilities> {
        Arc::clone(&self.capabilities.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Re-run the probe and swap in the new snapshot. The input exercises
    /// move the cursor and release keys, so they run under the input lock.
    pub async fn reprobe(&self) -> Arc<Capabilities> {
        let fresh = {
            let _input = self.router.lock_input().await;
            Arc::new(self.probe.probe(self.router.backends()).await)
        };
        *self.capabilities.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&fresh);
        fresh
    }

    pub async fn monitors(&self) -> Result<Vec<MonitorDescriptor>, BridgeError> {
        self.displays.snapshot().await
    }

    /// Re-probe backends and re-assign monitor ids.
    pub async fn refresh(&self) -> Result<Value, BridgeError> {
        let caps = self.reprobe().await;
        let monitors = self.displays.refresh().await?;
        tracing::info!("Capabilities and monitors refreshed");
        Ok(json!({
            "capabilities": &*caps,
            "monitors": monitors,
        }))
    }

    pub fn governor(&self) -> &SafetyGovernor {
        &self.governor
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Host, display and policy summary.
    pub async fn system_info(&self) -> Value {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let memory_total = sys.total_memory();
        let memory_used = sys.used_memory();
        let memory_percent = if memory_total > 0 {
            memory_used as f64 / memory_total as f64 * 100.0
        } else {
            0.0
        };

        let monitors = match self.monitors().await {
            Ok(m) => json!(m),
            Err(e) => json!({"error": e.to_string()}),
        };
        let policy = self.governor.policy();

        json!({
            "server": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": {
                "os": System::name(),
                "os_version": System::os_version(),
                "hostname": System::host_name(),
                "uptime_secs": System::uptime(),
                "cpu_count": sys.cpus().len(),
                "cpu_percent": sys.global_cpu_usage(),
                "memory_total": memory_total,
                "memory_used": memory_used,
                "memory_percent": memory_percent,
            },
            "monitors": monitors,
            "permissions": policy.permissions,
            "rate_limits": policy.rate_limits,
            "rate_status": self.governor.rate_status(),
            "capabilities": &*self.capabilities(),
        })
    }
}

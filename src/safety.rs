//! Safety governor: permission flags, fixed-window rate limits, audit.
//!
//! Every action passes through [`SafetyGovernor::authorize`] before it reaches
//! the router. Read-only classes (capture, OCR, window listing) skip the rate
//! check but still need their permission flag and are still audited.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::audit::{redact_params, AuditLog, AuditOutcome};
use crate::error::BridgeError;
use crate::types::{ActionRequest, OperationClass};

/// Per-class enable flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSet {
    pub capture: bool,
    pub mouse: bool,
    pub keyboard: bool,
    pub window: bool,
    pub ocr: bool,
}

impl Default for PermissionSet {
    fn default() -> Self {
        Self {
            capture: true,
            mouse: true,
            keyboard: true,
            window: true,
            ocr: true,
        }
    }
}

impl PermissionSet {
    pub fn allows(&self, class: OperationClass) -> bool {
        match class {
            OperationClass::Capture => self.capture,
            OperationClass::Mouse => self.mouse,
            OperationClass::Keyboard => self.keyboard,
            OperationClass::Window => self.window,
            OperationClass::Ocr => self.ocr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub max_clicks_per_minute: u32,
    pub max_keystrokes_per_minute: u32,
    pub max_window_ops_per_minute: u32,
    /// Window length; the limits above apply per window.
    pub window_secs: u64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_clicks_per_minute: 60,
            max_keystrokes_per_minute: 300,
            max_window_ops_per_minute: 60,
            window_secs: 60,
        }
    }
}

impl RateLimits {
    /// `None` for classes that are never rate-limited.
    pub fn limit_for(&self, class: OperationClass) -> Option<u32> {
        match class {
            OperationClass::Mouse => Some(self.max_clicks_per_minute),
            OperationClass::Keyboard => Some(self.max_keystrokes_per_minute),
            OperationClass::Window => Some(self.max_window_ops_per_minute),
            OperationClass::Capture | OperationClass::Ocr => None,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }
}

/// The hot-reloadable part of the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub permissions: PermissionSet,
    pub rate_limits: RateLimits,
}

/// Fixed, non-overlapping counting window for one class.
#[derive(Debug, Clone)]
pub struct RateWindow {
    pub window_start: Instant,
    pub count: u32,
    pub limit: u32,
}

impl RateWindow {
    fn new(now: Instant, limit: u32) -> Self {
        Self {
            window_start: now,
            count: 0,
            limit,
        }
    }

    /// Count one action. The counter saturates at `limit`; a full window
    /// rejects without incrementing. An elapsed window resets to zero.
    fn try_acquire(&mut self, now: Instant, length: Duration) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= length {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= self.limit {
            let elapsed = now.saturating_duration_since(self.window_start);
            return Err(length.saturating_sub(elapsed));
        }
        self.count += 1;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Decision {
    Allow,
    Deny(BridgeError),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Point-in-time view of one rate window, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RateStatus {
    pub class: OperationClass,
    pub count: u32,
    pub limit: u32,
    pub resets_in_ms: u64,
}

pub struct SafetyGovernor {
    policy: RwLock<Policy>,
    windows: Mutex<HashMap<OperationClass, RateWindow>>,
    audit: Arc<AuditLog>,
}

impl SafetyGovernor {
    pub fn new(policy: Policy, audit: Arc<AuditLog>) -> Self {
        Self {
            policy: RwLock::new(policy),
            windows: Mutex::new(HashMap::new()),
            audit,
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Swap in a new policy. Open windows keep their start time; a shrunk
    /// limit clamps the saturating counter.
    pub fn apply_policy(&self, policy: Policy) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        for (class, window) in windows.iter_mut() {
            if let Some(limit) = policy.rate_limits.limit_for(*class) {
                window.limit = limit;
                window.count = window.count.min(limit);
            }
        }
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
        tracing::info!("Safety policy updated");
    }

    /// Decide whether `request` may run. Produces exactly one audit record.
    pub fn authorize(&self, request: &ActionRequest, caller: &str) -> Decision {
        self.authorize_at(request, caller, Instant::now())
    }

    pub(crate) fn authorize_at(
        &self,
        request: &ActionRequest,
        caller: &str,
        now: Instant,
    ) -> Decision {
        let decision = self.decide(request, now);

        let outcome = match &decision {
            Decision::Allow => AuditOutcome::Allowed,
            Decision::Deny(err) => {
                tracing::warn!(
                    action = %request.kind,
                    caller = %caller,
                    "Action denied: {}",
                    err
                );
                AuditOutcome::Denied {
                    reason: err.to_string(),
                }
            }
        };
        self.audit.append(
            request.kind.method_name(),
            redact_params(request.kind, &request.params),
            request.backend_hint,
            outcome,
            caller,
        );

        decision
    }

    fn decide(&self, request: &ActionRequest, now: Instant) -> Decision {
        let class = request.kind.class();
        let policy = self.policy();

        if !policy.permissions.allows(class) {
            return Decision::Deny(BridgeError::PermissionDenied(class));
        }
        if !request.kind.is_mutating() {
            return Decision::Allow;
        }
        let Some(limit) = policy.rate_limits.limit_for(class) else {
            return Decision::Allow;
        };

        let length = policy.rate_limits.window();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows
            .entry(class)
            .or_insert_with(|| RateWindow::new(now, limit));
        window.limit = limit;

        match window.try_acquire(now, length) {
            Ok(()) => Decision::Allow,
            Err(retry_after) => Decision::Deny(BridgeError::RateLimited {
                class,
                limit,
                window_secs: length.as_secs(),
                retry_after_ms: retry_after.as_millis() as u64,
            }),
        }
    }

    pub fn rate_status(&self) -> Vec<RateStatus> {
        let length = self.policy().rate_limits.window();
        let now = Instant::now();
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let mut status: Vec<RateStatus> = windows
            .iter()
            .map(|(class, w)| {
                let elapsed = now.saturating_duration_since(w.window_start);
                let expired = elapsed >= length;
                RateStatus {
                    class: *class,
                    count: if expired { 0 } else { w.count },
                    limit: w.limit,
                    resets_in_ms: if expired {
                        0
                    } else {
                        length.saturating_sub(elapsed).as_millis() as u64
                    },
                }
            })
            .collect();
        status.sort_by_key(|s| s.class);
        status
    }
}

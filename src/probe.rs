//! Startup capability probing.
//!
//! Every registered backend is exercised for each class it claims to
//! support, in priority order. Classes are probed concurrently; backends
//! within a class are probed one after another so that, for example, two
//! input backends never fight over the cursor.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;

use crate::backends::{BackendSet, ProbeFailure, ProbeFailureReason};
use crate::config::ProbeConfig;
use crate::types::{BackendId, OperationClass};

/// Why one backend was not marked usable for one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeDiagnostic {
    pub class: OperationClass,
    pub backend: BackendId,
    pub reason: ProbeFailureReason,
    pub detail: String,
}

/// Point-in-time result of a probe run.
#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    /// Usable backends per class, in priority order. Every class is present.
    pub usable: BTreeMap<OperationClass, Vec<BackendId>>,
    pub diagnostics: Vec<ProbeDiagnostic>,
    pub probed_at: DateTime<Utc>,
}

impl Capabilities {
    /// No class has a usable backend.
    pub fn empty() -> Self {
        Self {
            usable: OperationClass::ALL.iter().map(|c| (*c, Vec::new())).collect(),
            diagnostics: Vec::new(),
            probed_at: Utc::now(),
        }
    }

    pub fn usable(&self, class: OperationClass) -> &[BackendId] {
        self.usable.get(&class).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_available(&self, class: OperationClass) -> bool {
        !self.usable(class).is_empty()
    }
}

pub struct CapabilityProbe {
    config: ProbeConfig,
}

impl CapabilityProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub async fn probe(&self, backends: &BackendSet) -> Capabilities {
        let per_class = join_all(
            OperationClass::ALL
                .iter()
                .map(|class| self.probe_class(backends, *class)),
        )
        .await;

        let mut usable = BTreeMap::new();
        let mut diagnostics = Vec::new();
        for (class, ok, failed) in per_class {
            tracing::info!(class = %class, usable = ?ok, "Probed operation class");
            usable.insert(class, ok);
            diagnostics.extend(failed);
        }

        Capabilities {
            usable,
            diagnostics,
            probed_at: Utc::now(),
        }
    }

    async fn probe_class(
        &self,
        backends: &BackendSet,
        class: OperationClass,
    ) -> (OperationClass, Vec<BackendId>, Vec<ProbeDiagnostic>) {
        let mut ok = Vec::new();
        let mut failed = Vec::new();

        for id in backends.priority(class) {
            let Some(backend) = backends.get(id) else {
                continue;
            };
            match self.probe_backend(backend.as_ref(), class).await {
                Ok(()) => {
                    tracing::debug!(backend = %id, class = %class, "Backend usable");
                    ok.push(id);
                }
                Err(failure) => {
                    tracing::info!(
                        backend = %id,
                        class = %class,
                        reason = %failure.reason,
                        "Backend unusable: {}",
                        failure.detail
                    );
                    failed.push(ProbeDiagnostic {
                        class,
                        backend: id,
                        reason: failure.reason,
                        detail: failure.detail,
                    });
                }
            }
        }
        (class, ok, failed)
    }

    /// Run the exercise, retrying transient failures. A missing binary is
    /// never retried.
    async fn probe_backend(
        &self,
        backend: &dyn crate::backends::Backend,
        class: OperationClass,
    ) -> Result<(), ProbeFailure> {
        let mut tries = 0;
        loop {
            tries += 1;
            let result = match tokio::time::timeout(self.config.timeout, backend.probe(class)).await
            {
                Ok(result) => result,
                Err(_) => Err(ProbeFailure::new(
                    ProbeFailureReason::Failed,
                    format!("probe timed out after {}ms", self.config.timeout.as_millis()),
                )),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(failure)
                    if failure.reason != ProbeFailureReason::MissingDependency
                        && tries <= self.config.retries =>
                {
                    tracing::debug!(
                        backend = %backend.id(),
                        class = %class,
                        attempt = tries,
                        "Probe failed, retrying: {}",
                        failure
                    );
                    if self.config.retry_delay > Duration::ZERO {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
                Err(failure) => return Err(failure),
            }
        }
    }
}

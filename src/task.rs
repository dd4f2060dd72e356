//! Sequential multi-step automation.
//!
//! Each step goes through [`Bridge::perform`] exactly like an RPC call, so
//! steps are authorized, rate-limited and audited individually. A failed step
//! does not stop the sequence unless the step asks for it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::coordinator::Bridge;
use crate::error::BridgeError;
use crate::types::{ActionKind, ActionRequest, ActionResult};

/// One step of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// RPC method name of the action, or one of the task-only actions
    /// `wait` and `find_and_click_text`.
    #[serde(alias = "action_kind")]
    pub action: String,
    #[serde(default)]
    pub params: Value,
    /// Pause after this step, before the next one is issued.
    #[serde(default, alias = "delay_ms")]
    pub wait_ms: Option<u64>,
    #[serde(default)]
    pub stop_on_failure: bool,
}

impl Step {
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            params,
            wait_ms: None,
            stop_on_failure: false,
        }
    }

    pub fn wait(mut self, ms: u64) -> Self {
        self.wait_ms = Some(ms);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub action: String,
    #[serde(flatten)]
    pub result: ActionResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub success: bool,
    pub results: Vec<StepReport>,
}

pub struct TaskRunner {
    bridge: Arc<Bridge>,
}

impl TaskRunner {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self { bridge }
    }

    /// Run `steps` in order and collect one result per executed step.
    pub async fn run(&self, steps: &[Step]) -> Vec<ActionResult> {
        self.execute(Uuid::new_v4(), steps)
            .await
            .into_iter()
            .map(|r| r.result)
            .collect()
    }

    pub async fn run_task(&self, description: Option<String>, steps: &[Step]) -> TaskReport {
        let task_id = Uuid::new_v4();
        tracing::info!(task_id = %task_id, steps = steps.len(), "Starting task");

        let results = self.execute(task_id, steps).await;
        let success = results.len() == steps.len() && results.iter().all(|r| r.result.ok);
        tracing::info!(
            task_id = %task_id,
            completed = results.len(),
            success,
            "Task finished"
        );

        TaskReport {
            task_id,
            description,
            total_steps: steps.len(),
            completed_steps: results.len(),
            success,
            results,
        }
    }

    async fn execute(&self, task_id: Uuid, steps: &[Step]) -> Vec<StepReport> {
        let mut reports = Vec::with_capacity(steps.len());

        for (i, step) in steps.iter().enumerate() {
            let caller = format!("task:{}#{}", task_id, i + 1);
            let result = self.run_step(step, &caller).await;
            let failed = !result.ok;
            if failed {
                tracing::warn!(
                    task_id = %task_id,
                    step = i + 1,
                    action = %step.action,
                    "Task step failed"
                );
            }
            reports.push(StepReport {
                step: i + 1,
                action: step.action.clone(),
                result,
            });

            if failed && step.stop_on_failure {
                break;
            }
            // No lock is held here, so other callers may interleave.
            if let Some(ms) = step.wait_ms.filter(|ms| *ms > 0) {
                if i + 1 < steps.len() {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
            }
        }
        reports
    }

    async fn run_step(&self, step: &Step, caller: &str) -> ActionResult {
        match step.action.as_str() {
            "wait" => {
                let ms = step
                    .params
                    .get("ms")
                    .and_then(Value::as_u64)
                    .or_else(|| {
                        step.params
                            .get("duration")
                            .and_then(Value::as_f64)
                            .map(|secs| (secs.max(0.0) * 1000.0) as u64)
                    })
                    .unwrap_or(1000);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                ActionResult {
                    ok: true,
                    backend_used: None,
                    payload: Some(json!({"waited_ms": ms})),
                    error: None,
                    attempts: Vec::new(),
                }
            }
            "find_and_click_text" => self.find_and_click(step, caller).await,
            method => match ActionKind::from_method(method) {
                Some(kind) => match ActionRequest::from_params(kind, step.params.clone()) {
                    Ok(request) => self.bridge.perform(request, caller).await,
                    Err(e) => ActionResult::failure(&e, None, Vec::new()),
                },
                None => ActionResult::failure(
                    &BridgeError::InvalidParams(format!("unknown action '{}'", method)),
                    None,
                    Vec::new(),
                ),
            },
        }
    }

    /// Locate text on screen, then click the centre of its box.
    async fn find_and_click(&self, step: &Step, caller: &str) -> ActionResult {
        let find = match ActionRequest::from_params(ActionKind::FindText, step.params.clone()) {
            Ok(r) => r,
            Err(e) => return ActionResult::failure(&e, None, Vec::new()),
        };
        let found = self.bridge.perform(find, caller).await;
        if !found.ok {
            return found;
        }

        let center = found
            .payload
            .as_ref()
            .filter(|p| p["found"] == true)
            .map(|p| p["center"].clone());
        let Some(center) = center else {
            let err = BridgeError::InvalidParams(format!(
                "text {} not found on screen",
                step.params.get("text").cloned().unwrap_or(Value::Null)
            ));
            return ActionResult::failure(&err, found.backend_used, found.attempts);
        };

        let mut params = json!({"x": center["x"], "y": center["y"]});
        if let Some(button) = step.params.get("button") {
            params["button"] = button.clone();
        }
        let click = ActionRequest::new(ActionKind::ClickScreen, params);
        self.bridge.perform(click, caller).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Operation;
    use crate::error::ErrorKind;
    use crate::safety::Policy;
    use crate::testing::{test_bridge, MockBackend, MockBehavior};
    use crate::types::{BackendId, OperationClass, Point, Rect, TextElement};
    use std::time::Instant;

    #[tokio::test]
    async fn test_failed_step_does_not_abort_sequence() {
        let xdotool = Arc::new(
            MockBackend::new(BackendId::Xdotool, &[OperationClass::Mouse])
                .with_behavior(MockBehavior::Fail("XTest missing".to_string())),
        );
        let scrot = Arc::new(MockBackend::new(BackendId::Scrot, &[OperationClass::Capture]));
        let bridge = Arc::new(test_bridge(vec![xdotool, scrot], Policy::default()).await);
        let runner = TaskRunner::new(bridge);

        let steps = vec![
            Step::new("click_screen", json!({"x": 10, "y": 10})),
            Step::new("no_such_action", json!({})),
            Step::new("capture_screen", json!({})),
        ];
        let results = runner.run(&steps).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].error_kind(), Some(ErrorKind::BackendFailure));
        assert_eq!(results[1].error_kind(), Some(ErrorKind::InvalidParams));
        assert!(results[2].ok);
        assert_eq!(results[2].backend_used, Some(BackendId::Scrot));
    }

    #[tokio::test]
    async fn test_stop_on_failure_halts() {
        let bridge = Arc::new(test_bridge(vec![], Policy::default()).await);
        let runner = TaskRunner::new(bridge);

        let mut first = Step::new("type_text", json!({"text": "x"}));
        first.stop_on_failure = true;
        let report = runner
            .run_task(None, &[first, Step::new("capture_screen", json!({}))])
            .await;

        assert_eq!(report.completed_steps, 1);
        assert!(!report.success);
        assert_eq!(
            report.results[0].result.error_kind(),
            Some(ErrorKind::Unavailable)
        );
    }

    #[tokio::test]
    async fn test_wait_applies_only_between_steps() {
        let scrot = Arc::new(MockBackend::new(BackendId::Scrot, &[OperationClass::Capture]));
        let bridge = Arc::new(test_bridge(vec![scrot], Policy::default()).await);
        let runner = TaskRunner::new(bridge);

        // A wait on the last step has nothing to delay.
        let started = Instant::now();
        runner
            .run(&[Step::new("capture_screen", json!({})).wait(2_000)])
            .await;
        assert!(started.elapsed() < Duration::from_millis(1_000));

        let started = Instant::now();
        runner
            .run(&[
                Step::new("capture_screen", json!({})).wait(150),
                Step::new("capture_screen", json!({})),
            ])
            .await;
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_find_and_click_text_clicks_center() {
        let scrot = Arc::new(MockBackend::new(BackendId::Scrot, &[OperationClass::Capture]));
        let tesseract = Arc::new(
            MockBackend::new(BackendId::Tesseract, &[OperationClass::Ocr]).with_text(vec![
                TextElement {
                    text: "OK".to_string(),
                    bbox: Rect::new(400, 300, 40, 20),
                    confidence: 91,
                },
            ]),
        );
        let xdotool = Arc::new(MockBackend::new(BackendId::Xdotool, &[OperationClass::Mouse]));
        let bridge = Arc::new(
            test_bridge(vec![scrot, tesseract, xdotool.clone()], Policy::default()).await,
        );
        let runner = TaskRunner::new(bridge);

        let results = runner
            .run(&[Step::new("find_and_click_text", json!({"text": "ok"}))])
            .await;
        assert!(results[0].ok, "{:?}", results[0].error);

        let ops = xdotool.ops();
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            ops[0],
            Operation::Click { at: Some(p), .. } if p == Point::new(420, 310)
        ));
    }

    #[test]
    fn test_step_accepts_action_kind_alias() {
        let step: Step = serde_json::from_value(json!({
            "action_kind": "press_key",
            "params": {"key": "enter"},
            "wait_ms": 250
        }))
        .unwrap();
        assert_eq!(step.action, "press_key");
        assert_eq!(step.wait_ms, Some(250));
        assert!(!step.stop_on_failure);
    }
}

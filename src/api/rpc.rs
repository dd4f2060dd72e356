//! JSON-RPC 2.0 dispatch shared by the HTTP and stdio transports.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::coordinator::Bridge;
use crate::error::{BridgeError, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR};
use crate::task::{Step, TaskRunner};
use crate::types::{ActionKind, ActionRequest};

const DEFAULT_AUDIT_LIMIT: usize = 100;

// =============================================================================
// JSON-RPC Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    /// Absent for notifications. An explicit `null` is still a request.
    #[serde(default, deserialize_with = "present_id")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

fn present_id<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self::error_with_data(id, code, message, None)
    }

    pub fn error_with_data(
        id: Value,
        code: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    fn bridge_error(id: Value, err: &BridgeError) -> Self {
        Self::error_with_data(
            id,
            err.rpc_code(),
            err.to_string(),
            Some(json!({"kind": err.kind()})),
        )
    }
}

// =============================================================================
// Methods
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Action(ActionKind),
    SystemInfo,
    Capabilities,
    Monitors,
    Refresh,
    RunTask,
    Audit,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(kind) = ActionKind::from_method(name) {
            return Some(Self::Action(kind));
        }
        let method = match name {
            "get_system_info" | "system_info" => Self::SystemInfo,
            "get_capabilities" | "capabilities" => Self::Capabilities,
            "get_monitors" | "get_monitor_info" => Self::Monitors,
            "refresh" => Self::Refresh,
            "run_task" | "automate_task" => Self::RunTask,
            "get_audit" => Self::Audit,
            _ => return None,
        };
        Some(method)
    }
}

#[derive(Debug, Deserialize)]
struct TaskParams {
    #[serde(default)]
    description: Option<String>,
    steps: Vec<Step>,
}

/// Stateless dispatcher over a shared [`Bridge`].
pub struct RpcGateway {
    bridge: Arc<Bridge>,
    tasks: TaskRunner,
    transport: &'static str,
}

impl RpcGateway {
    /// `transport` prefixes the caller context recorded in the audit log.
    pub fn new(bridge: Arc<Bridge>, transport: &'static str) -> Self {
        Self {
            tasks: TaskRunner::new(Arc::clone(&bridge)),
            bridge,
            transport,
        }
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Handle one raw message. Returns `None` for notifications.
    pub async fn handle_str(&self, raw: &str) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("JSON-RPC parse error: {}", e);
                return Some(JsonRpcResponse::error(
                    Value::Null,
                    PARSE_ERROR,
                    format!("Parse error: {}", e),
                ));
            }
        };

        let id = value.get("id").cloned().unwrap_or(Value::Null);
        match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) => self.handle(request).await,
            Err(e) => Some(JsonRpcResponse::error(
                id,
                INVALID_REQUEST,
                format!("Invalid request: {}", e),
            )),
        }
    }

    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if let Some(version) = request.jsonrpc.as_deref() {
            if version != "2.0" {
                return Some(JsonRpcResponse::error(
                    request.id.unwrap_or(Value::Null),
                    INVALID_REQUEST,
                    format!("Unsupported jsonrpc version: {}", version),
                ));
            }
        }

        let notification = request.is_notification();
        let id = request.id.clone().unwrap_or(Value::Null);
        let response = self.dispatch(&request.method, request.params, &id).await;

        if notification {
            tracing::debug!(method = %request.method, "Notification handled, no response sent");
            return None;
        }
        Some(response)
    }

    async fn dispatch(&self, method: &str, params: Value, id: &Value) -> JsonRpcResponse {
        let Some(parsed) = Method::parse(method) else {
            tracing::warn!(method = %method, "Unknown JSON-RPC method");
            return JsonRpcResponse::error(
                id.clone(),
                METHOD_NOT_FOUND,
                format!("Method not found: {}", method),
            );
        };
        let caller = format!("{}:{}", self.transport, id);

        match parsed {
            Method::Action(kind) => {
                let request = match ActionRequest::from_params(kind, params) {
                    Ok(r) => r,
                    Err(e) => return JsonRpcResponse::bridge_error(id.clone(), &e),
                };
                let result = self.bridge.perform(request, &caller).await;
                match &result.error {
                    None => JsonRpcResponse::success(id.clone(), json!(result)),
                    Some(err) => JsonRpcResponse::error_with_data(
                        id.clone(),
                        err.kind.rpc_code(),
                        err.message.clone(),
                        Some(json!(result)),
                    ),
                }
            }
            Method::SystemInfo => {
                JsonRpcResponse::success(id.clone(), self.bridge.system_info().await)
            }
            Method::Capabilities => {
                let monitors = match self.bridge.monitors().await {
                    Ok(m) => json!(m),
                    Err(e) => json!({"error": e.to_string()}),
                };
                JsonRpcResponse::success(
                    id.clone(),
                    json!({
                        "capabilities": &*self.bridge.capabilities(),
                        "monitors": monitors,
                    }),
                )
            }
            Method::Monitors => match self.bridge.monitors().await {
                Ok(m) => JsonRpcResponse::success(id.clone(), json!({"monitors": m})),
                Err(e) => JsonRpcResponse::bridge_error(id.clone(), &e),
            },
            Method::Refresh => match self.bridge.refresh().await {
                Ok(v) => JsonRpcResponse::success(id.clone(), v),
                Err(e) => JsonRpcResponse::bridge_error(id.clone(), &e),
            },
            Method::RunTask => match serde_json::from_value::<TaskParams>(params) {
                Ok(task) => {
                    let report = self.tasks.run_task(task.description, &task.steps).await;
                    JsonRpcResponse::success(id.clone(), json!(report))
                }
                Err(e) => JsonRpcResponse::error(
                    id.clone(),
                    INVALID_PARAMS,
                    format!("Invalid task: {}", e),
                ),
            },
            Method::Audit => {
                let limit = params
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_AUDIT_LIMIT);
                JsonRpcResponse::success(
                    id.clone(),
                    json!({"records": self.bridge.audit().recent(limit)}),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Operation;
    use crate::error::ErrorKind;
    use crate::safety::Policy;
    use crate::testing::{test_bridge, MockBackend};
    use crate::types::{BackendId, OperationClass, Point};

    async fn gateway(mocks: Vec<Arc<MockBackend>>) -> RpcGateway {
        RpcGateway::new(Arc::new(test_bridge(mocks, Policy::default()).await), "test")
    }

    #[tokio::test]
    async fn test_unknown_method_is_method_not_found() {
        let gw = gateway(vec![]).await;
        let resp = gw
            .handle_str(r#"{"jsonrpc":"2.0","id":7,"method":"launch_rockets"}"#)
            .await
            .unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, METHOD_NOT_FOUND);
        assert_eq!(resp.id, json!(7));
    }

    #[tokio::test]
    async fn test_malformed_json_is_parse_error() {
        let gw = gateway(vec![]).await;
        let resp = gw.handle_str("{not json").await.unwrap();
        assert_eq!(resp.error.unwrap().code, PARSE_ERROR);
        assert_eq!(resp.id, Value::Null);
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let gw = gateway(vec![]).await;
        let resp = gw
            .handle_str(r#"{"jsonrpc":"2.0","method":"get_monitors"}"#)
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn test_null_id_is_answered() {
        let gw = gateway(vec![]).await;
        let resp = gw
            .handle_str(r#"{"jsonrpc":"2.0","id":null,"method":"get_monitors"}"#)
            .await
            .expect("null id must get a response");
        assert_eq!(resp.id, Value::Null);
        assert_eq!(resp.result.unwrap()["monitors"][1]["id"], 1);
    }

    #[tokio::test]
    async fn test_mouse_position_alias() {
        let xdotool = Arc::new(MockBackend::new(BackendId::Xdotool, &[OperationClass::Mouse]));
        let gw = gateway(vec![xdotool.clone()]).await;
        let resp = gw
            .handle_str(r#"{"jsonrpc":"2.0","id":9,"method":"mouse_position"}"#)
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["payload"], json!({"x": 12, "y": 34}));
        assert!(matches!(xdotool.ops()[0], Operation::CursorPosition));
    }

    #[tokio::test]
    async fn test_capture_without_backend_reports_unavailable() {
        let gw = gateway(vec![]).await;
        let resp = gw
            .handle_str(r#"{"jsonrpc":"2.0","id":"c1","method":"capture_screen"}"#)
            .await
            .unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, ErrorKind::Unavailable.rpc_code());
        let data = err.data.unwrap();
        assert_eq!(data["ok"], false);
        assert_eq!(data["error"]["kind"], "unavailable");
    }

    #[tokio::test]
    async fn test_relative_click_resolves_to_monitor_center() {
        let xdotool = Arc::new(MockBackend::new(BackendId::Xdotool, &[OperationClass::Mouse]));
        let gw = gateway(vec![xdotool.clone()]).await;

        let resp = gw
            .handle_str(
                r#"{"jsonrpc":"2.0","id":1,"method":"click_screen",
                    "params":{"x_rel":0.5,"y_rel":0.5,"monitor_id":1}}"#,
            )
            .await
            .unwrap();
        assert!(resp.error.is_none(), "{:?}", resp.error);
        let result = resp.result.unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(result["backend_used"], "xdotool");

        let ops = xdotool.ops();
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            ops[0],
            Operation::Click { at: Some(p), clicks: 1, .. } if p == Point::new(960, 540)
        ));
    }

    #[tokio::test]
    async fn test_capabilities_include_monitors() {
        let scrot = Arc::new(MockBackend::new(BackendId::Scrot, &[OperationClass::Capture]));
        let gw = gateway(vec![scrot]).await;
        let resp = gw
            .handle_str(r#"{"jsonrpc":"2.0","id":2,"method":"get_capabilities"}"#)
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["capabilities"]["usable"]["capture"], json!(["scrot"]));
        assert_eq!(result["monitors"][0]["id"], 0);
        assert_eq!(result["monitors"][1]["width"], 1920);
    }

    #[tokio::test]
    async fn test_legacy_automate_task_alias() {
        let scrot = Arc::new(MockBackend::new(BackendId::Scrot, &[OperationClass::Capture]));
        let gw = gateway(vec![scrot]).await;
        let resp = gw
            .handle_str(
                r#"{"jsonrpc":"2.0","id":3,"method":"automate_task","params":{
                    "description":"look",
                    "steps":[{"action":"capture_screen"},{"action":"type_text","params":{"text":"hi"}}]
                }}"#,
            )
            .await
            .unwrap();
        let report = resp.result.unwrap();
        assert_eq!(report["total_steps"], 2);
        assert_eq!(report["completed_steps"], 2);
        assert_eq!(report["success"], false);
        assert_eq!(report["results"][0]["ok"], true);
        assert_eq!(report["results"][1]["error"]["kind"], "unavailable");
    }

    #[tokio::test]
    async fn test_both_coordinate_forms_is_invalid_params() {
        let xdotool = Arc::new(MockBackend::new(BackendId::Xdotool, &[OperationClass::Mouse]));
        let gw = gateway(vec![xdotool.clone()]).await;
        let resp = gw
            .handle_str(
                r#"{"jsonrpc":"2.0","id":4,"method":"move_mouse",
                    "params":{"x":5,"y":5,"x_rel":0.1,"y_rel":0.1}}"#,
            )
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
        assert!(xdotool.ops().is_empty());
    }
}

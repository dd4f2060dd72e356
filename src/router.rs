//! Backend selection, coordinate resolution and fallback execution.
//!
//! ```text
//! ActionRequest ──plan──▶ Plan ──candidates──▶ [A, B, C]
//!                          │                      │
//!                    monitors (fresh)        input lock (mutating only)
//!                          │                      │
//!                          └──resolve──▶ Operation ──▶ A ✗ ─▶ B ✗ ─▶ C ✓
//! ```
//!
//! Every attempt runs on its own task and is raced against the attempt
//! timeout. A timed-out task is detached rather than aborted, since some
//! native calls cannot be interrupted; the router just stops waiting for it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{Mutex, MutexGuard};

use crate::audit::{redact_params, AuditLog, AuditOutcome};
use crate::backends::{BackendSet, MouseButton, Operation, Output, ScrollDirection};
use crate::error::BridgeError;
use crate::geometry::{CoordinateMapper, DisplayMap};
use crate::probe::Capabilities;
use crate::types::{
    ActionKind, ActionRequest, ActionResult, AttemptOutcome, AttemptRecord, BackendId, Coordinate,
    Image, MonitorDescriptor, OperationClass, Point, Rect, TextElement,
};
use crate::vision::{self, UiElement};

/// Default similarity for `find_text` matches.
pub const DEFAULT_SIMILARITY: f64 = 0.8;

// ============================================================================
// Planning (params -> unresolved operation)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Region {
    Full,
    Pixels(Rect),
    Monitor(u32),
}

#[derive(Debug, Clone)]
enum Planned {
    Capture(Region),
    Click {
        at: Option<Coordinate>,
        button: MouseButton,
        clicks: u32,
    },
    MoveTo(Coordinate),
    Scroll {
        at: Option<Coordinate>,
        direction: ScrollDirection,
        clicks: u32,
    },
    Drag {
        from: Coordinate,
        to: Coordinate,
        button: MouseButton,
    },
    /// Needs no geometry.
    Ready(Operation),
}

#[derive(Debug, Clone)]
enum Plan {
    Single(Planned),
    ExtractText(Region),
    FindText {
        region: Region,
        target: String,
        threshold: f64,
    },
    Analyze {
        region: Region,
        parts: AnalyzeParts,
    },
    FindUiElements(Region),
    PixelColor(Coordinate),
}

/// Optional sections of an `analyze_screen` report.
#[derive(Debug, Clone, Copy)]
struct AnalyzeParts {
    ocr: bool,
    ui_elements: bool,
    windows: bool,
}

fn plan(request: &ActionRequest) -> Result<Plan, BridgeError> {
    let p = &request.params;
    let monitor_id = request.monitor_id.unwrap_or(MonitorDescriptor::UNION_ID);
    let coordinate = |prefix: &str| Coordinate::from_params(p, prefix, monitor_id);
    let required = |prefix: &str| -> Result<Coordinate, BridgeError> {
        coordinate(prefix)?.ok_or_else(|| {
            BridgeError::CoordinateInvalid(format!(
                "missing {p}x/{p}y or {p}x_rel/{p}y_rel",
                p = prefix
            ))
        })
    };

    let planned = match request.kind {
        ActionKind::CaptureScreen => Planned::Capture(region(request)?),
        ActionKind::ExtractText => return Ok(Plan::ExtractText(region(request)?)),
        ActionKind::FindText => {
            let target = str_param(p, &["text", "target_text"])?;
            let threshold = p
                .get("similarity_threshold")
                .and_then(Value::as_f64)
                .unwrap_or(DEFAULT_SIMILARITY);
            if !(0.0..=1.0).contains(&threshold) {
                return Err(BridgeError::InvalidParams(
                    "similarity_threshold must be within [0, 1]".to_string(),
                ));
            }
            return Ok(Plan::FindText {
                region: region(request)?,
                target,
                threshold,
            });
        }
        ActionKind::AnalyzeScreen => {
            return Ok(Plan::Analyze {
                region: region(request)?,
                parts: AnalyzeParts {
                    ocr: bool_param(p, "include_ocr", true)?,
                    ui_elements: bool_param(p, "include_ui_elements", true)?,
                    windows: bool_param(p, "include_windows", true)?,
                },
            })
        }
        ActionKind::FindUiElements => return Ok(Plan::FindUiElements(region(request)?)),
        ActionKind::PixelColor => return Ok(Plan::PixelColor(required("")?)),
        ActionKind::ClickScreen => Planned::Click {
            at: coordinate("")?,
            button: parsed_param(p, "button", MouseButton::Left)?,
            clicks: count_param(p, "clicks", 1)?,
        },
        ActionKind::MoveMouse => Planned::MoveTo(required("")?),
        ActionKind::Scroll => Planned::Scroll {
            at: coordinate("")?,
            direction: parsed_param(p, "direction", ScrollDirection::Up)?,
            clicks: count_param(p, "clicks", 3)?,
        },
        ActionKind::DragMouse => {
            let (from, to) = if p.get("from_x").is_some() || p.get("from_x_rel").is_some() {
                (required("from_")?, required("to_")?)
            } else {
                (required("start_")?, required("end_")?)
            };
            Planned::Drag {
                from,
                to,
                button: parsed_param(p, "button", MouseButton::Left)?,
            }
        }
        ActionKind::GetMousePosition => Planned::Ready(Operation::CursorPosition),
        ActionKind::TypeText => {
            let text = str_param(p, &["text"])?;
            let interval_ms = match p.get("interval_ms").and_then(Value::as_u64) {
                Some(ms) => ms,
                None => p
                    .get("interval")
                    .and_then(Value::as_f64)
                    .map(|secs| (secs.max(0.0) * 1000.0).round() as u64)
                    .unwrap_or(0),
            };
            Planned::Ready(Operation::TypeText { text, interval_ms })
        }
        ActionKind::PressKey => Planned::Ready(Operation::PressKey {
            key: str_param(p, &["key"])?,
            presses: count_param(p, "presses", 1)?,
        }),
        ActionKind::KeyCombo => {
            let keys: Vec<String> = p
                .get("keys")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|k| k.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            if keys.is_empty() {
                return Err(BridgeError::InvalidParams(
                    "keys must be a non-empty array of key names".to_string(),
                ));
            }
            Planned::Ready(Operation::KeyCombo { keys })
        }
        ActionKind::KeyRelease => Planned::Ready(Operation::KeyUp {
            key: str_param(p, &["key"])?,
        }),
        ActionKind::GetWindows => Planned::Ready(Operation::ListWindows),
        ActionKind::ActivateWindow => Planned::Ready(Operation::ActivateWindow {
            title: str_param(p, &["title", "title_pattern"])?,
        }),
        ActionKind::ResizeWindow => Planned::Ready(Operation::ResizeWindow {
            title: str_param(p, &["title", "title_pattern"])?,
            width: u32_param(p, "width")?,
            height: u32_param(p, "height")?,
        }),
        ActionKind::MoveWindow => Planned::Ready(Operation::MoveWindow {
            title: str_param(p, &["title", "title_pattern"])?,
            x: i32_param(p, "x")?,
            y: i32_param(p, "y")?,
        }),
    };
    Ok(Plan::Single(planned))
}

/// Capture region: explicit `region` (object or `[x, y, w, h]`), else the
/// requested monitor's frame, else the whole desktop.
fn region(request: &ActionRequest) -> Result<Region, BridgeError> {
    let invalid = || {
        BridgeError::InvalidParams(
            "region must be {x, y, width, height} or [x, y, width, height]".to_string(),
        )
    };
    match request.params.get("region") {
        None | Some(Value::Null) => Ok(match request.monitor_id {
            None | Some(MonitorDescriptor::UNION_ID) => Region::Full,
            Some(id) => Region::Monitor(id),
        }),
        Some(Value::Array(values)) => {
            let n: Vec<i64> = values.iter().filter_map(Value::as_i64).collect();
            match n.as_slice() {
                [x, y, w, h] => pixel_region(*x, *y, *w, *h).ok_or_else(invalid),
                _ => Err(invalid()),
            }
        }
        Some(obj @ Value::Object(_)) => {
            let field = |k: &str| obj.get(k).and_then(Value::as_i64);
            match (field("x"), field("y"), field("width"), field("height")) {
                (Some(x), Some(y), Some(w), Some(h)) => {
                    pixel_region(x, y, w, h).ok_or_else(invalid)
                }
                _ => Err(invalid()),
            }
        }
        Some(_) => Err(invalid()),
    }
}

fn pixel_region(x: i64, y: i64, w: i64, h: i64) -> Option<Region> {
    if w <= 0 || h <= 0 {
        return None;
    }
    Some(Region::Pixels(Rect::new(
        i32::try_from(x).ok()?,
        i32::try_from(y).ok()?,
        u32::try_from(w).ok()?,
        u32::try_from(h).ok()?,
    )))
}

fn str_param(params: &Value, names: &[&str]) -> Result<String, BridgeError> {
    names
        .iter()
        .find_map(|n| params.get(*n).and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| BridgeError::InvalidParams(format!("missing string param '{}'", names[0])))
}

fn u32_param(params: &Value, name: &str) -> Result<u32, BridgeError> {
    params
        .get(name)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| BridgeError::InvalidParams(format!("missing or invalid '{}'", name)))
}

fn i32_param(params: &Value, name: &str) -> Result<i32, BridgeError> {
    params
        .get(name)
        .and_then(Value::as_i64)
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| BridgeError::InvalidParams(format!("missing or invalid '{}'", name)))
}

fn count_param(params: &Value, name: &str, default: u32) -> Result<u32, BridgeError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n >= 1)
            .ok_or_else(|| {
                BridgeError::InvalidParams(format!("'{}' must be a positive integer", name))
            }),
    }
}

fn bool_param(params: &Value, name: &str, default: bool) -> Result<bool, BridgeError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| BridgeError::InvalidParams(format!("'{}' must be a boolean", name))),
    }
}

fn parsed_param<T>(params: &Value, name: &str, default: T) -> Result<T, BridgeError>
where
    T: std::str::FromStr<Err = String>,
{
    match params.get(name).and_then(Value::as_str) {
        None => Ok(default),
        Some(s) => s.parse().map_err(BridgeError::InvalidParams),
    }
}

impl Planned {
    fn needs_geometry(&self) -> bool {
        match self {
            Planned::Capture(region) => matches!(region, Region::Monitor(_)),
            Planned::Click { at, .. } | Planned::Scroll { at, .. } => at.is_some(),
            Planned::MoveTo(_) | Planned::Drag { .. } => true,
            Planned::Ready(_) => false,
        }
    }

    fn resolve(
        self,
        mapper: &CoordinateMapper,
        monitors: &[MonitorDescriptor],
    ) -> Result<Operation, BridgeError> {
        let point = |c: &Coordinate| mapper.resolve(c, monitors).map(|r| r.point);
        let op = match self {
            Planned::Capture(region) => Operation::Capture {
                region: resolve_region(region, monitors)?,
            },
            Planned::Click { at, button, clicks } => Operation::Click {
                at: at.as_ref().map(point).transpose()?,
                button,
                clicks,
            },
            Planned::MoveTo(to) => Operation::MoveTo { to: point(&to)? },
            Planned::Scroll {
                at,
                direction,
                clicks,
            } => Operation::Scroll {
                at: at.as_ref().map(point).transpose()?,
                direction,
                clicks,
            },
            Planned::Drag { from, to, button } => Operation::Drag {
                from: point(&from)?,
                to: point(&to)?,
                button,
            },
            Planned::Ready(op) => op,
        };
        Ok(op)
    }
}

fn resolve_region(
    region: Region,
    monitors: &[MonitorDescriptor],
) -> Result<Option<Rect>, BridgeError> {
    match region {
        Region::Full => Ok(None),
        Region::Pixels(rect) => Ok(Some(rect)),
        Region::Monitor(id) => CoordinateMapper::frame(id, monitors).map(Some),
    }
}

// ============================================================================
// Router
// ============================================================================

/// A successful routed call.
#[derive(Debug)]
pub struct Execution {
    pub output: Output,
    pub backend_used: BackendId,
    pub attempts: Vec<AttemptRecord>,
}

/// A routed call that produced no result.
#[derive(Debug)]
pub struct ExecutionFailure {
    pub error: BridgeError,
    pub backend_used: Option<BackendId>,
    pub attempts: Vec<AttemptRecord>,
}

impl ExecutionFailure {
    fn before_dispatch(error: BridgeError) -> Self {
        Self {
            error,
            backend_used: None,
            attempts: Vec::new(),
        }
    }
}

/// Payload of a finished action and the backend that produced it.
struct Completed {
    payload: Value,
    backend_used: BackendId,
    attempts: Vec<AttemptRecord>,
}

/// Identifies the action an attempt belongs to, for audit records.
struct CallContext<'a> {
    request: &'a ActionRequest,
    caller: &'a str,
}

/// Where a screenshot lands on the virtual desktop.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CaptureTarget {
    /// Handed to the backend; `None` captures the whole desktop.
    region: Option<Rect>,
    /// Desktop position of the image's top-left pixel.
    origin: Point,
}

impl CaptureTarget {
    fn rect(rect: Rect) -> Self {
        Self {
            region: Some(rect),
            origin: Point::new(rect.x, rect.y),
        }
    }
}

/// A captured image plus the chain that produced it.
struct Captured {
    image: Arc<Image>,
    backend_used: BackendId,
    attempts: Vec<AttemptRecord>,
}

impl Captured {
    fn fail(self, error: BridgeError) -> ExecutionFailure {
        ExecutionFailure {
            error,
            backend_used: Some(self.backend_used),
            attempts: self.attempts,
        }
    }
}

pub struct BackendRouter {
    backends: BackendSet,
    mapper: CoordinateMapper,
    displays: Arc<DisplayMap>,
    attempt_timeout: Duration,
    audit: Arc<AuditLog>,
    input_lock: Mutex<()>,
}

impl BackendRouter {
    pub fn new(
        backends: BackendSet,
        mapper: CoordinateMapper,
        displays: Arc<DisplayMap>,
        attempt_timeout: Duration,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            backends,
            mapper,
            displays,
            attempt_timeout,
            audit,
            input_lock: Mutex::new(()),
        }
    }

    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }

    /// Wait for in-flight mutating actions, then keep new ones out until the
    /// guard is dropped.
    pub async fn lock_input(&self) -> MutexGuard<'_, ()> {
        self.input_lock.lock().await
    }

    /// Backends to try for `class`, in order. A pinned backend replaces the
    /// probed list.
    pub fn candidates(
        &self,
        class: OperationClass,
        hint: Option<BackendId>,
        caps: &Capabilities,
    ) -> Result<Vec<BackendId>, BridgeError> {
        if let Some(id) = hint {
            let supported = self.backends.get(id).is_some_and(|b| b.supports(class));
            if !supported {
                return Err(BridgeError::InvalidParams(format!(
                    "backend {} cannot serve {} actions",
                    id, class
                )));
            }
            return Ok(vec![id]);
        }
        let usable = caps.usable(class);
        if usable.is_empty() {
            return Err(BridgeError::Unavailable(class));
        }
        Ok(usable.to_vec())
    }

    /// Execute one action with fallback. Never panics and never drops the
    /// request: every path ends in an [`ActionResult`].
    pub async fn execute(
        &self,
        request: &ActionRequest,
        caps: &Capabilities,
        caller: &str,
    ) -> ActionResult {
        match self.route(request, caps, caller).await {
            Ok(done) => ActionResult::success(done.backend_used, done.payload, done.attempts),
            Err(fail) => ActionResult::failure(&fail.error, fail.backend_used, fail.attempts),
        }
    }

    async fn route(
        &self,
        request: &ActionRequest,
        caps: &Capabilities,
        caller: &str,
    ) -> Result<Completed, ExecutionFailure> {
        let plan = plan(request).map_err(ExecutionFailure::before_dispatch)?;
        let ctx = CallContext { request, caller };

        match plan {
            Plan::Single(planned) => {
                let class = request.kind.class();
                let exec = self
                    .run(&ctx, class, request.backend_hint, planned, caps)
                    .await?;
                Ok(Completed {
                    payload: output_payload(&exec.output),
                    backend_used: exec.backend_used,
                    attempts: exec.attempts,
                })
            }
            Plan::ExtractText(region) => {
                let (elements, backend_used, attempts) =
                    self.capture_and_read(&ctx, region, caps).await?;
                let payload = json!({
                    "text_content": joined_text(&elements),
                    "count": elements.len(),
                    "elements": elements,
                });
                Ok(Completed {
                    payload,
                    backend_used,
                    attempts,
                })
            }
            Plan::FindText {
                region,
                target,
                threshold,
            } => {
                let (elements, backend_used, attempts) =
                    self.capture_and_read(&ctx, region, caps).await?;
                let payload = match find_match(&elements, &target, threshold) {
                    Some((element, score)) => json!({
                        "found": true,
                        "text": element.text,
                        "bbox": element.bbox,
                        "center": element.bbox.center(),
                        "confidence": element.confidence,
                        "similarity": score,
                    }),
                    None => json!({"found": false, "text": target}),
                };
                Ok(Completed {
                    payload,
                    backend_used,
                    attempts,
                })
            }
            Plan::Analyze { region, parts } => self.analyze(&ctx, region, parts, caps).await,
            Plan::FindUiElements(region) => {
                let hint = request.backend_hint;
                self.candidates(OperationClass::Capture, hint, caps)
                    .map_err(ExecutionFailure::before_dispatch)?;
                let target = self
                    .capture_target(region)
                    .await
                    .map_err(ExecutionFailure::before_dispatch)?;
                let captured = self.capture_image(&ctx, target, hint, caps).await?;
                let elements = match ui_elements(&captured.image, target.origin).await {
                    Ok(elements) => elements,
                    Err(e) => return Err(captured.fail(e)),
                };
                Ok(Completed {
                    payload: json!({"count": elements.len(), "elements": elements}),
                    backend_used: captured.backend_used,
                    attempts: captured.attempts,
                })
            }
            Plan::PixelColor(at) => {
                let hint = request.backend_hint;
                self.candidates(OperationClass::Capture, hint, caps)
                    .map_err(ExecutionFailure::before_dispatch)?;
                let point = self
                    .resolve_point(&at)
                    .await
                    .map_err(ExecutionFailure::before_dispatch)?;
                let target = CaptureTarget::rect(Rect::new(point.x, point.y, 1, 1));
                let captured = self.capture_image(&ctx, target, hint, caps).await?;
                let [r, g, b] = match vision::pixel_rgb(&captured.image, 0, 0) {
                    Ok(rgb) => rgb,
                    Err(e) => return Err(captured.fail(e)),
                };
                Ok(Completed {
                    payload: json!({
                        "x": point.x,
                        "y": point.y,
                        "rgb": [r, g, b],
                        "hex": format!("#{:02x}{:02x}{:02x}", r, g, b),
                    }),
                    backend_used: captured.backend_used,
                    attempts: captured.attempts,
                })
            }
        }
    }

    /// Resolve `region` against one monitor snapshot. The result is used both
    /// for the capture and to place whatever is found in the image.
    async fn capture_target(&self, region: Region) -> Result<CaptureTarget, BridgeError> {
        let monitor_id = match region {
            Region::Pixels(rect) => return Ok(CaptureTarget::rect(rect)),
            Region::Monitor(id) => id,
            Region::Full => MonitorDescriptor::UNION_ID,
        };
        let monitors = self.displays.snapshot().await?;
        let frame = CoordinateMapper::frame(monitor_id, &monitors)?;
        Ok(match region {
            Region::Full => CaptureTarget {
                region: None,
                origin: Point::new(frame.x, frame.y),
            },
            _ => CaptureTarget::rect(frame),
        })
    }

    async fn resolve_point(&self, at: &Coordinate) -> Result<Point, BridgeError> {
        let monitors = self.displays.snapshot().await?;
        Ok(self.mapper.resolve(at, &monitors)?.point)
    }

    async fn capture_image(
        &self,
        ctx: &CallContext<'_>,
        target: CaptureTarget,
        hint: Option<BackendId>,
        caps: &Capabilities,
    ) -> Result<Captured, ExecutionFailure> {
        let op = Operation::Capture {
            region: target.region,
        };
        let exec = self
            .run(ctx, OperationClass::Capture, hint, Planned::Ready(op), caps)
            .await?;
        match exec.output {
            Output::Image(image) => Ok(Captured {
                image: Arc::new(image),
                backend_used: exec.backend_used,
                attempts: exec.attempts,
            }),
            _ => Err(ExecutionFailure {
                error: BridgeError::Internal("capture backend returned no image".to_string()),
                backend_used: Some(exec.backend_used),
                attempts: exec.attempts,
            }),
        }
    }

    /// OCR `image`, appending the chain's attempts to `attempts`. Elements
    /// come back in desktop coordinates.
    async fn read_text(
        &self,
        ctx: &CallContext<'_>,
        image: Arc<Image>,
        origin: Point,
        hint: Option<BackendId>,
        caps: &Capabilities,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Result<(Vec<TextElement>, BackendId), BridgeError> {
        let ocr = self
            .run(
                ctx,
                OperationClass::Ocr,
                hint,
                Planned::Ready(Operation::Ocr { image }),
                caps,
            )
            .await;
        match ocr {
            Ok(mut exec) => {
                attempts.append(&mut exec.attempts);
                let elements = match &exec.output {
                    Output::Text(elements) => offset_elements(elements, origin),
                    _ => Vec::new(),
                };
                Ok((elements, exec.backend_used))
            }
            Err(mut fail) => {
                attempts.append(&mut fail.attempts);
                Err(fail.error)
            }
        }
    }

    /// Capture then OCR, each with its own fallback chain. Both candidate
    /// lists and the region are checked before anything runs.
    async fn capture_and_read(
        &self,
        ctx: &CallContext<'_>,
        region: Region,
        caps: &Capabilities,
    ) -> Result<(Vec<TextElement>, BackendId, Vec<AttemptRecord>), ExecutionFailure> {
        let ocr_hint = ctx.request.backend_hint.filter(|id| {
            self.backends
                .get(*id)
                .is_some_and(|b| b.supports(OperationClass::Ocr))
        });
        self.candidates(OperationClass::Capture, None, caps)
            .map_err(ExecutionFailure::before_dispatch)?;
        self.candidates(OperationClass::Ocr, ocr_hint, caps)
            .map_err(ExecutionFailure::before_dispatch)?;
        let target = self
            .capture_target(region)
            .await
            .map_err(ExecutionFailure::before_dispatch)?;

        let captured = self.capture_image(ctx, target, None, caps).await?;
        let mut attempts = captured.attempts;
        let read = self
            .read_text(ctx, captured.image, target.origin, ocr_hint, caps, &mut attempts)
            .await;
        match read {
            Ok((elements, backend_used)) => Ok((elements, backend_used, attempts)),
            Err(error) => Err(ExecutionFailure {
                error,
                backend_used: attempts.last().map(|a| a.backend),
                attempts,
            }),
        }
    }

    /// One capture, then whichever of OCR, UI detection and the window list
    /// were asked for. Only the capture is required; a section that cannot
    /// be produced is listed under `skipped` with the reason.
    async fn analyze(
        &self,
        ctx: &CallContext<'_>,
        region: Region,
        parts: AnalyzeParts,
        caps: &Capabilities,
    ) -> Result<Completed, ExecutionFailure> {
        let hint = ctx.request.backend_hint.filter(|id| {
            self.backends
                .get(*id)
                .is_some_and(|b| b.supports(OperationClass::Capture))
        });
        self.candidates(OperationClass::Capture, hint, caps)
            .map_err(ExecutionFailure::before_dispatch)?;
        let target = self
            .capture_target(region)
            .await
            .map_err(ExecutionFailure::before_dispatch)?;
        let captured = self.capture_image(ctx, target, hint, caps).await?;
        let image = captured.image;
        let mut attempts = captured.attempts;
        let mut skipped = serde_json::Map::new();

        let mut text_elements = Vec::new();
        if parts.ocr {
            let read = self
                .read_text(ctx, Arc::clone(&image), target.origin, None, caps, &mut attempts)
                .await;
            match read {
                Ok((elements, _)) => text_elements = elements,
                Err(e) => {
                    skipped.insert("text_elements".to_string(), json!(e.to_string()));
                }
            }
        }

        let mut found = Vec::new();
        if parts.ui_elements {
            match ui_elements(&image, target.origin).await {
                Ok(elements) => found = elements,
                Err(e) => {
                    skipped.insert("ui_elements".to_string(), json!(e.to_string()));
                }
            }
        }

        let mut windows = json!([]);
        if parts.windows {
            let listed = self
                .run(
                    ctx,
                    OperationClass::Window,
                    None,
                    Planned::Ready(Operation::ListWindows),
                    caps,
                )
                .await;
            match listed {
                Ok(mut exec) => {
                    attempts.append(&mut exec.attempts);
                    if let Output::Windows(list) = &exec.output {
                        windows = json!(list);
                    }
                }
                Err(mut fail) => {
                    attempts.append(&mut fail.attempts);
                    skipped.insert("windows".to_string(), json!(fail.error.to_string()));
                }
            }
        }

        let payload = json!({
            "screenshot": image.to_data_uri(),
            "resolution": {"width": image.width, "height": image.height},
            "monitor": ctx.request.monitor_id.unwrap_or(MonitorDescriptor::UNION_ID),
            "origin": target.origin,
            "timestamp": Utc::now(),
            "text_content": joined_text(&text_elements),
            "text_elements": text_elements,
            "ui_elements": found,
            "windows": windows,
            "skipped": skipped,
        });
        Ok(Completed {
            payload,
            backend_used: captured.backend_used,
            attempts,
        })
    }

    /// Resolve and run one operation through the fallback chain for `class`.
    async fn run(
        &self,
        ctx: &CallContext<'_>,
        class: OperationClass,
        hint: Option<BackendId>,
        planned: Planned,
        caps: &Capabilities,
    ) -> Result<Execution, ExecutionFailure> {
        let candidates = self
            .candidates(class, hint, caps)
            .map_err(ExecutionFailure::before_dispatch)?;

        let op = if planned.needs_geometry() {
            let monitors = self
                .displays
                .snapshot()
                .await
                .map_err(ExecutionFailure::before_dispatch)?;
            planned
                .resolve(&self.mapper, &monitors)
                .map_err(ExecutionFailure::before_dispatch)?
        } else {
            planned
                .resolve(&self.mapper, &[])
                .map_err(ExecutionFailure::before_dispatch)?
        };

        let _guard = if ctx.request.kind.is_mutating() {
            Some(self.input_lock.lock().await)
        } else {
            None
        };
        self.attempt_all(ctx, &candidates, op).await
    }

    /// Try each candidate in order until one succeeds. Every failure,
    /// including a timeout or a panicked backend task, moves on to the next.
    async fn attempt_all(
        &self,
        ctx: &CallContext<'_>,
        candidates: &[BackendId],
        op: Operation,
    ) -> Result<Execution, ExecutionFailure> {
        let mut attempts = Vec::with_capacity(candidates.len());
        let mut last_error = None;

        for id in candidates.iter().copied() {
            let Some(backend) = self.backends.get(id) else {
                continue;
            };

            let started = Instant::now();
            let task = {
                let op = op.clone();
                tokio::spawn(async move { backend.execute(op).await })
            };
            let result = tokio::time::timeout(self.attempt_timeout, task).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let (error, outcome, audit_outcome) = match result {
                Ok(Ok(Ok(output))) => {
                    attempts.push(AttemptRecord {
                        backend: id,
                        outcome: AttemptOutcome::Succeeded,
                        error: None,
                        elapsed_ms,
                    });
                    self.audit_attempt(ctx, id, AuditOutcome::AttemptSucceeded);
                    return Ok(Execution {
                        output,
                        backend_used: id,
                        attempts,
                    });
                }
                Ok(Ok(Err(e))) => failed(BridgeError::BackendFailure {
                    backend: id,
                    reason: e.0,
                }),
                Ok(Err(join_err)) => failed(BridgeError::BackendFailure {
                    backend: id,
                    reason: format!("backend task aborted: {}", join_err),
                }),
                Err(_) => {
                    let after_ms = self.attempt_timeout.as_millis() as u64;
                    (
                        BridgeError::BackendTimeout {
                            backend: id,
                            after_ms,
                        },
                        AttemptOutcome::TimedOut,
                        AuditOutcome::AttemptTimedOut { after_ms },
                    )
                }
            };

            tracing::warn!(
                backend = %id,
                operation = op.name(),
                "Backend attempt failed, trying next: {}",
                error
            );
            attempts.push(AttemptRecord {
                backend: id,
                outcome,
                error: Some(error.to_string()),
                elapsed_ms,
            });
            self.audit_attempt(ctx, id, audit_outcome);
            last_error = Some(error);
        }

        let backend_used = attempts.last().map(|a| a.backend);
        let error = last_error.unwrap_or_else(|| BridgeError::Unavailable(op.class()));
        tracing::error!(
            operation = op.name(),
            tried = attempts.len(),
            "All backends failed: {}",
            error
        );
        Err(ExecutionFailure {
            error,
            backend_used,
            attempts,
        })
    }

    fn audit_attempt(&self, ctx: &CallContext<'_>, backend: BackendId, outcome: AuditOutcome) {
        self.audit.append(
            ctx.request.kind.method_name(),
            redact_params(ctx.request.kind, &ctx.request.params),
            Some(backend),
            outcome,
            ctx.caller,
        );
    }
}

fn failed(error: BridgeError) -> (BridgeError, AttemptOutcome, AuditOutcome) {
    let audit = AuditOutcome::AttemptFailed {
        error: error.to_string(),
    };
    (error, AttemptOutcome::Failed, audit)
}

/// UI detection is CPU bound, so it runs on the blocking pool.
async fn ui_elements(image: &Arc<Image>, origin: Point) -> Result<Vec<UiElement>, BridgeError> {
    let image = Arc::clone(image);
    let found = tokio::task::spawn_blocking(move || vision::find_ui_elements(&image))
        .await
        .map_err(|e| BridgeError::Internal(format!("UI detection task failed: {}", e)))??;
    Ok(found.iter().map(|e| e.offset(origin)).collect())
}

// ============================================================================
// Payloads and text matching
// ============================================================================

fn output_payload(output: &Output) -> Value {
    match output {
        Output::Done(summary) => summary.clone(),
        Output::Image(image) => json!({
            "image": image.to_data_uri(),
            "mime_type": image.mime_type,
            "width": image.width,
            "height": image.height,
        }),
        Output::Text(elements) => json!({
            "elements": elements,
            "count": elements.len(),
        }),
        Output::Windows(windows) => json!({
            "windows": windows,
            "count": windows.len(),
        }),
    }
}

fn joined_text(elements: &[TextElement]) -> String {
    elements
        .iter()
        .map(|e| e.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

fn offset_elements(elements: &[TextElement], origin: Point) -> Vec<TextElement> {
    elements
        .iter()
        .map(|e| TextElement {
            bbox: Rect::new(
                e.bbox.x + origin.x,
                e.bbox.y + origin.y,
                e.bbox.width,
                e.bbox.height,
            ),
            ..e.clone()
        })
        .collect()
}

/// Best element for `target`: a case-insensitive substring match scores
/// 1.0, otherwise the normalized edit-distance similarity is used.
fn find_match<'a>(
    elements: &'a [TextElement],
    target: &str,
    threshold: f64,
) -> Option<(&'a TextElement, f64)> {
    let target = target.to_lowercase();
    elements
        .iter()
        .map(|e| {
            let text = e.text.to_lowercase();
            let score = if !target.is_empty() && text.contains(&target) {
                1.0
            } else {
                similarity(&text, &target)
            };
            (e, score)
        })
        .filter(|(_, score)| *score >= threshold)
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut cur = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        prev = cur;
    }
    1.0 - prev[b.len()] as f64 / longest as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::geometry::{MonitorSource, PhysicalMonitor, StaticMonitors};
    use crate::testing::{encode_png, mock_form, MockBackend, MockBehavior};
    use image::{Rgb, RgbImage};

    fn physical(name: &str, rect: Rect) -> PhysicalMonitor {
        PhysicalMonitor {
            name: name.to_string(),
            rect,
            is_primary: name == "DP-1",
        }
    }

    fn router(set: BackendSet, audit: Arc<AuditLog>) -> BackendRouter {
        router_over(
            set,
            audit,
            Arc::new(StaticMonitors::new(vec![physical(
                "DP-1",
                Rect::new(0, 0, 1920, 1080),
            )])),
        )
    }

    fn router_over(
        set: BackendSet,
        audit: Arc<AuditLog>,
        monitors: Arc<dyn MonitorSource>,
    ) -> BackendRouter {
        BackendRouter::new(
            set,
            CoordinateMapper::default(),
            Arc::new(DisplayMap::new(monitors)),
            Duration::from_millis(200),
            audit,
        )
    }

    struct BrokenMonitors;

    #[async_trait::async_trait]
    impl MonitorSource for BrokenMonitors {
        async fn enumerate(&self) -> Result<Vec<PhysicalMonitor>, BridgeError> {
            Err(BridgeError::Internal("cannot open display".to_string()))
        }
    }

    fn submit_reader() -> Arc<MockBackend> {
        Arc::new(
            MockBackend::new(BackendId::Tesseract, &[OperationClass::Ocr]).with_text(vec![
                TextElement {
                    text: "Submit".to_string(),
                    bbox: Rect::new(100, 40, 60, 20),
                    confidence: 95,
                },
            ]),
        )
    }

    fn capture_region(mock: &MockBackend) -> Option<Rect> {
        match mock.ops().first() {
            Some(Operation::Capture { region }) => *region,
            other => panic!("expected a capture, got {:?}", other),
        }
    }

    fn caps_with(class: OperationClass, ids: &[BackendId]) -> Capabilities {
        let mut caps = Capabilities::empty();
        caps.usable.insert(class, ids.to_vec());
        caps
    }

    #[tokio::test]
    async fn test_fallback_reaches_third_backend_in_order() {
        let audit = Arc::new(AuditLog::new(100));
        let a = Arc::new(
            MockBackend::new(BackendId::Scrot, &[OperationClass::Capture])
                .with_behavior(MockBehavior::Fail("scrot exploded".to_string())),
        );
        let b = Arc::new(
            MockBackend::new(BackendId::Grim, &[OperationClass::Capture])
                .with_behavior(MockBehavior::Hang),
        );
        let c = Arc::new(MockBackend::new(BackendId::Import, &[OperationClass::Capture]));
        let mut set = BackendSet::new();
        set.register(a.clone());
        set.register(b.clone());
        set.register(c.clone());
        let r = router(set, Arc::clone(&audit));

        let caps = caps_with(
            OperationClass::Capture,
            &[BackendId::Scrot, BackendId::Grim, BackendId::Import],
        );
        let req = ActionRequest::new(ActionKind::CaptureScreen, json!({}));
        let result = r.execute(&req, &caps, "fallback-test").await;

        assert!(result.ok, "{:?}", result.error);
        assert_eq!(result.backend_used, Some(BackendId::Import));
        let outcomes: Vec<_> = result.attempts.iter().map(|a| (a.backend, a.outcome)).collect();
        assert_eq!(
            outcomes,
            vec![
                (BackendId::Scrot, AttemptOutcome::Failed),
                (BackendId::Grim, AttemptOutcome::TimedOut),
                (BackendId::Import, AttemptOutcome::Succeeded),
            ]
        );

        let trail: Vec<_> = audit
            .for_caller("fallback-test")
            .into_iter()
            .map(|rec| rec.backend_used)
            .collect();
        assert_eq!(
            trail,
            vec![
                Some(BackendId::Scrot),
                Some(BackendId::Grim),
                Some(BackendId::Import)
            ]
        );
        assert!(result.payload.unwrap()["image"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn test_no_usable_backend_is_unavailable_without_native_calls() {
        let audit = Arc::new(AuditLog::new(100));
        let scrot = Arc::new(MockBackend::new(BackendId::Scrot, &[OperationClass::Capture]));
        let mut set = BackendSet::new();
        set.register(scrot.clone());
        let r = router(set, audit);

        let req = ActionRequest::new(ActionKind::CaptureScreen, json!({}));
        let result = r.execute(&req, &Capabilities::empty(), "t").await;

        assert!(!result.ok);
        assert_eq!(result.error_kind(), Some(ErrorKind::Unavailable));
        assert_eq!(result.backend_used, None);
        assert!(scrot.ops().is_empty());
    }

    #[tokio::test]
    async fn test_all_backends_failing_reports_every_reason() {
        let audit = Arc::new(AuditLog::new(100));
        let mut set = BackendSet::new();
        set.register(Arc::new(
            MockBackend::new(BackendId::Xdotool, &[OperationClass::Keyboard])
                .with_behavior(MockBehavior::Fail("no XTest".to_string())),
        ));
        set.register(Arc::new(
            MockBackend::new(BackendId::Ydotool, &[OperationClass::Keyboard])
                .with_behavior(MockBehavior::Fail("no uinput".to_string())),
        ));
        let r = router(set, audit);
        let caps = caps_with(
            OperationClass::Keyboard,
            &[BackendId::Xdotool, BackendId::Ydotool],
        );

        let req = ActionRequest::new(ActionKind::TypeText, json!({"text": "hi"}));
        let result = r.execute(&req, &caps, "t").await;

        assert!(!result.ok);
        assert_eq!(result.error_kind(), Some(ErrorKind::BackendFailure));
        assert_eq!(result.backend_used, Some(BackendId::Ydotool));
        let reasons: Vec<_> = result
            .attempts
            .iter()
            .filter_map(|a| a.error.clone())
            .collect();
        assert_eq!(reasons.len(), 2);
        assert!(reasons[0].contains("no XTest"));
        assert!(reasons[1].contains("no uinput"));
    }

    #[tokio::test]
    async fn test_click_relative_center_dispatches_one_click() {
        let audit = Arc::new(AuditLog::new(100));
        let xdotool = Arc::new(MockBackend::new(BackendId::Xdotool, &[OperationClass::Mouse]));
        let mut set = BackendSet::new();
        set.register(xdotool.clone());
        let r = router(set, audit);
        let caps = caps_with(OperationClass::Mouse, &[BackendId::Xdotool]);

        let req = ActionRequest::new(ActionKind::ClickScreen, json!({"x_rel": 0.5, "y_rel": 0.5}))
            .with_monitor(1);
        let result = r.execute(&req, &caps, "t").await;

        assert!(result.ok);
        let ops = xdotool.ops();
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            Operation::Click { at, clicks, .. } => {
                assert_eq!(*at, Some(Point::new(960, 540)));
                assert_eq!(*clicks, 1);
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_monitor_fails_before_dispatch() {
        let audit = Arc::new(AuditLog::new(100));
        let xdotool = Arc::new(MockBackend::new(BackendId::Xdotool, &[OperationClass::Mouse]));
        let mut set = BackendSet::new();
        set.register(xdotool.clone());
        let r = router(set, audit);
        let caps = caps_with(OperationClass::Mouse, &[BackendId::Xdotool]);

        let req = ActionRequest::new(ActionKind::MoveMouse, json!({"x": 10, "y": 10}))
            .with_monitor(4);
        let result = r.execute(&req, &caps, "t").await;

        assert_eq!(result.error_kind(), Some(ErrorKind::MonitorNotFound));
        assert!(xdotool.ops().is_empty());
    }

    #[tokio::test]
    async fn test_pinned_backend_bypasses_capabilities() {
        let audit = Arc::new(AuditLog::new(100));
        let wmctrl = Arc::new(MockBackend::new(BackendId::Wmctrl, &[OperationClass::Window]));
        let mut set = BackendSet::new();
        set.register(wmctrl.clone());
        let r = router(set, audit);

        let req = ActionRequest::new(ActionKind::GetWindows, json!({})).with_hint(BackendId::Wmctrl);
        let result = r.execute(&req, &Capabilities::empty(), "t").await;
        assert!(result.ok);
        assert_eq!(result.backend_used, Some(BackendId::Wmctrl));

        let bad = ActionRequest::new(ActionKind::GetWindows, json!({})).with_hint(BackendId::Scrot);
        let result = r.execute(&bad, &Capabilities::empty(), "t").await;
        assert_eq!(result.error_kind(), Some(ErrorKind::InvalidParams));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clicks_never_overlap() {
        let audit = Arc::new(AuditLog::new(100));
        let xdotool = Arc::new(
            MockBackend::new(BackendId::Xdotool, &[OperationClass::Mouse])
                .with_behavior(MockBehavior::Delay(Duration::from_millis(50))),
        );
        let mut set = BackendSet::new();
        set.register(xdotool.clone());
        let r = Arc::new(router(set, audit));
        let caps = Arc::new(caps_with(OperationClass::Mouse, &[BackendId::Xdotool]));

        let mut handles = Vec::new();
        for i in 0..2 {
            let r = Arc::clone(&r);
            let caps = Arc::clone(&caps);
            handles.push(tokio::spawn(async move {
                let req = ActionRequest::new(
                    ActionKind::ClickScreen,
                    json!({"x": 100 + i, "y": 100}),
                );
                r.execute(&req, &caps, "t").await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().ok);
        }

        let mut spans = xdotool.spans();
        assert_eq!(spans.len(), 2);
        spans.sort_by_key(|(start, _)| *start);
        assert!(spans[0].1 <= spans[1].0, "native calls overlapped");
    }

    #[tokio::test]
    async fn test_find_text_returns_center_in_desktop_coordinates() {
        let audit = Arc::new(AuditLog::new(100));
        let mut set = BackendSet::new();
        set.register(Arc::new(MockBackend::new(BackendId::Scrot, &[OperationClass::Capture])));
        set.register(Arc::new(
            MockBackend::new(BackendId::Tesseract, &[OperationClass::Ocr]).with_text(vec![
                TextElement {
                    text: "Cancel".to_string(),
                    bbox: Rect::new(10, 10, 50, 20),
                    confidence: 90,
                },
                TextElement {
                    text: "Submit".to_string(),
                    bbox: Rect::new(100, 40, 60, 20),
                    confidence: 95,
                },
            ]),
        ));
        let r = router(set, audit);
        let mut caps = caps_with(OperationClass::Capture, &[BackendId::Scrot]);
        caps.usable.insert(OperationClass::Ocr, vec![BackendId::Tesseract]);

        let req = ActionRequest::new(
            ActionKind::FindText,
            json!({"text": "submit", "region": [200, 100, 400, 300]}),
        );
        let result = r.execute(&req, &caps, "t").await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(result.backend_used, Some(BackendId::Tesseract));
        assert_eq!(result.attempts.len(), 2);

        let payload = result.payload.unwrap();
        assert_eq!(payload["found"], true);
        assert_eq!(payload["center"], json!({"x": 330, "y": 150}));
    }

    #[tokio::test]
    async fn test_extract_text_needs_ocr_before_capturing() {
        let audit = Arc::new(AuditLog::new(100));
        let scrot = Arc::new(MockBackend::new(BackendId::Scrot, &[OperationClass::Capture]));
        let mut set = BackendSet::new();
        set.register(scrot.clone());
        let r = router(set, audit);
        let caps = caps_with(OperationClass::Capture, &[BackendId::Scrot]);

        let req = ActionRequest::new(ActionKind::ExtractText, json!({}));
        let result = r.execute(&req, &caps, "t").await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Unavailable));
        assert!(scrot.ops().is_empty());
    }

    #[tokio::test]
    async fn test_find_text_on_offset_monitor_uses_its_origin() {
        let audit = Arc::new(AuditLog::new(100));
        let scrot = Arc::new(MockBackend::new(BackendId::Scrot, &[OperationClass::Capture]));
        let mut set = BackendSet::new();
        set.register(scrot.clone());
        set.register(submit_reader());
        let r = router_over(
            set,
            audit,
            Arc::new(StaticMonitors::new(vec![
                physical("DP-1", Rect::new(0, 0, 1920, 1080)),
                physical("HDMI-1", Rect::new(1920, 0, 1280, 1024)),
            ])),
        );
        let mut caps = caps_with(OperationClass::Capture, &[BackendId::Scrot]);
        caps.usable.insert(OperationClass::Ocr, vec![BackendId::Tesseract]);

        let req = ActionRequest::new(ActionKind::FindText, json!({"text": "Submit"})).with_monitor(2);
        let result = r.execute(&req, &caps, "t").await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(capture_region(&scrot), Some(Rect::new(1920, 0, 1280, 1024)));
        assert_eq!(result.payload.unwrap()["center"], json!({"x": 2050, "y": 50}));
    }

    #[tokio::test]
    async fn test_full_desktop_text_is_placed_from_union_corner() {
        let audit = Arc::new(AuditLog::new(100));
        let scrot = Arc::new(MockBackend::new(BackendId::Scrot, &[OperationClass::Capture]));
        let mut set = BackendSet::new();
        set.register(scrot.clone());
        set.register(submit_reader());
        let r = router_over(
            set,
            audit,
            Arc::new(StaticMonitors::new(vec![
                physical("DP-1", Rect::new(0, 0, 1920, 1080)),
                physical("HDMI-1", Rect::new(-1280, 0, 1280, 1024)),
            ])),
        );
        let mut caps = caps_with(OperationClass::Capture, &[BackendId::Scrot]);
        caps.usable.insert(OperationClass::Ocr, vec![BackendId::Tesseract]);

        let req = ActionRequest::new(ActionKind::ExtractText, json!({}));
        let result = r.execute(&req, &caps, "t").await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(capture_region(&scrot), None);
        let payload = result.payload.unwrap();
        assert_eq!(payload["elements"][0]["bbox"]["x"], -1180);
        assert_eq!(payload["text_content"], "Submit");
    }

    #[tokio::test]
    async fn test_monitor_enumeration_failure_fails_text_read() {
        let audit = Arc::new(AuditLog::new(100));
        let scrot = Arc::new(MockBackend::new(BackendId::Scrot, &[OperationClass::Capture]));
        let reader = submit_reader();
        let mut set = BackendSet::new();
        set.register(scrot.clone());
        set.register(reader.clone());
        let r = router_over(set, audit, Arc::new(BrokenMonitors));
        let mut caps = caps_with(OperationClass::Capture, &[BackendId::Scrot]);
        caps.usable.insert(OperationClass::Ocr, vec![BackendId::Tesseract]);

        let req = ActionRequest::new(ActionKind::FindText, json!({"text": "Submit"}));
        let result = r.execute(&req, &caps, "t").await;
        assert!(!result.ok);
        assert_eq!(result.error_kind(), Some(ErrorKind::Internal));
        assert!(scrot.ops().is_empty());
        assert!(reader.ops().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capture_runs_while_click_holds_input_lock() {
        let audit = Arc::new(AuditLog::new(100));
        let xdotool = Arc::new(
            MockBackend::new(BackendId::Xdotool, &[OperationClass::Mouse])
                .with_behavior(MockBehavior::Delay(Duration::from_millis(150))),
        );
        let scrot = Arc::new(MockBackend::new(BackendId::Scrot, &[OperationClass::Capture]));
        let mut set = BackendSet::new();
        set.register(xdotool.clone());
        set.register(scrot.clone());
        let r = Arc::new(router(set, audit));
        let mut caps = caps_with(OperationClass::Mouse, &[BackendId::Xdotool]);
        caps.usable.insert(OperationClass::Capture, vec![BackendId::Scrot]);
        let caps = Arc::new(caps);

        let click = {
            let (r, caps) = (Arc::clone(&r), Arc::clone(&caps));
            tokio::spawn(async move {
                let req = ActionRequest::new(ActionKind::ClickScreen, json!({"x": 5, "y": 5}));
                r.execute(&req, &caps, "t").await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let capture = r
            .execute(&ActionRequest::new(ActionKind::CaptureScreen, json!({})), &caps, "t")
            .await;
        assert!(capture.ok);
        assert!(click.await.unwrap().ok);

        let (_, capture_end) = scrot.spans()[0];
        let (_, click_end) = xdotool.spans()[0];
        assert!(capture_end < click_end, "capture waited for the click");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hung_click_releases_input_lock_after_timeout() {
        let audit = Arc::new(AuditLog::new(100));
        let ydotool = Arc::new(
            MockBackend::new(BackendId::Ydotool, &[OperationClass::Mouse])
                .with_behavior(MockBehavior::Hang),
        );
        let xdotool = Arc::new(MockBackend::new(BackendId::Xdotool, &[OperationClass::Mouse]));
        let mut set = BackendSet::new();
        set.register(ydotool.clone());
        set.register(xdotool.clone());
        let r = Arc::new(router(set, audit));
        let caps = Arc::new(Capabilities::empty());

        let began = Instant::now();
        let stuck = {
            let (r, caps) = (Arc::clone(&r), Arc::clone(&caps));
            tokio::spawn(async move {
                let req = ActionRequest::new(ActionKind::ClickScreen, json!({"x": 5, "y": 5}))
                    .with_hint(BackendId::Ydotool);
                r.execute(&req, &caps, "t").await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let next = ActionRequest::new(ActionKind::ClickScreen, json!({"x": 6, "y": 6}))
            .with_hint(BackendId::Xdotool);
        let second = tokio::time::timeout(Duration::from_secs(2), r.execute(&next, &caps, "t"))
            .await
            .expect("input lock was never released");
        assert!(second.ok, "{:?}", second.error);

        let first = stuck.await.unwrap();
        assert_eq!(first.error_kind(), Some(ErrorKind::BackendTimeout));
        assert_eq!(first.attempts[0].outcome, AttemptOutcome::TimedOut);
        let (second_start, _) = xdotool.spans()[0];
        assert!(second_start.duration_since(began) >= Duration::from_millis(200));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mouse_position_skips_input_lock() {
        let audit = Arc::new(AuditLog::new(100));
        let xdotool = Arc::new(
            MockBackend::new(BackendId::Xdotool, &[OperationClass::Mouse])
                .with_behavior(MockBehavior::Delay(Duration::from_millis(150))),
        );
        let mut set = BackendSet::new();
        set.register(xdotool.clone());
        let r = Arc::new(router(set, audit));
        let caps = Arc::new(caps_with(OperationClass::Mouse, &[BackendId::Xdotool]));

        let click = {
            let (r, caps) = (Arc::clone(&r), Arc::clone(&caps));
            tokio::spawn(async move {
                let req = ActionRequest::new(ActionKind::ClickScreen, json!({"x": 5, "y": 5}));
                r.execute(&req, &caps, "t").await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let position = r
            .execute(&ActionRequest::new(ActionKind::GetMousePosition, json!({})), &caps, "t")
            .await;
        assert!(click.await.unwrap().ok);
        assert_eq!(position.payload.unwrap(), json!({"x": 12, "y": 34}));

        let mut spans = xdotool.spans();
        spans.sort_by_key(|(start, _)| *start);
        assert!(spans[1].0 < spans[0].1, "position query waited for the click");
    }

    #[tokio::test]
    async fn test_find_ui_elements_reports_desktop_boxes() {
        let audit = Arc::new(AuditLog::new(100));
        let scrot = Arc::new(
            MockBackend::new(BackendId::Scrot, &[OperationClass::Capture])
                .with_image(encode_png(&mock_form().to_rgb8())),
        );
        let mut set = BackendSet::new();
        set.register(scrot.clone());
        let r = router(set, audit);
        let caps = caps_with(OperationClass::Capture, &[BackendId::Scrot]);

        let req = ActionRequest::new(
            ActionKind::FindUiElements,
            json!({"region": [100, 100, 400, 150]}),
        );
        let result = r.execute(&req, &caps, "t").await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(capture_region(&scrot), Some(Rect::new(100, 100, 400, 150)));

        let payload = result.payload.unwrap();
        assert_eq!(payload["count"], 2);
        let elements: Vec<UiElement> = serde_json::from_value(payload["elements"].clone()).unwrap();
        let button = elements
            .iter()
            .find(|e| e.kind == vision::UiElementKind::Button)
            .unwrap();
        assert!(button.bbox.contains(Point::new(430, 170)));
    }

    #[tokio::test]
    async fn test_analyze_screen_reports_missing_sections() {
        let audit = Arc::new(AuditLog::new(100));
        let mut set = BackendSet::new();
        set.register(Arc::new(
            MockBackend::new(BackendId::Scrot, &[OperationClass::Capture])
                .with_image(encode_png(&mock_form().to_rgb8())),
        ));
        set.register(submit_reader());
        let r = router(set, audit);
        let mut caps = caps_with(OperationClass::Capture, &[BackendId::Scrot]);
        caps.usable.insert(OperationClass::Ocr, vec![BackendId::Tesseract]);

        let req = ActionRequest::new(ActionKind::AnalyzeScreen, json!({}));
        let result = r.execute(&req, &caps, "t").await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(result.backend_used, Some(BackendId::Scrot));
        assert_eq!(result.attempts.len(), 2);

        let payload = result.payload.unwrap();
        assert_eq!(payload["resolution"], json!({"width": 400, "height": 150}));
        assert_eq!(payload["monitor"], 0);
        assert_eq!(payload["text_content"], "Submit");
        assert_eq!(payload["ui_elements"].as_array().unwrap().len(), 2);
        assert_eq!(payload["windows"], json!([]));
        assert!(payload["skipped"]["windows"]
            .as_str()
            .unwrap()
            .contains("window"));
        assert!(payload["screenshot"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn test_pixel_color_samples_resolved_point() {
        let audit = Arc::new(AuditLog::new(100));
        let scrot = Arc::new(
            MockBackend::new(BackendId::Scrot, &[OperationClass::Capture])
                .with_image(encode_png(&RgbImage::from_pixel(2, 2, Rgb([255, 0, 0])))),
        );
        let mut set = BackendSet::new();
        set.register(scrot.clone());
        let r = router(set, audit);
        let caps = caps_with(OperationClass::Capture, &[BackendId::Scrot]);

        let req = ActionRequest::new(ActionKind::PixelColor, json!({"x_rel": 0.5, "y_rel": 0.5}))
            .with_monitor(1);
        let result = r.execute(&req, &caps, "t").await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(capture_region(&scrot), Some(Rect::new(960, 540, 1, 1)));
        let payload = result.payload.unwrap();
        assert_eq!(payload["hex"], "#ff0000");
        assert_eq!(payload["rgb"], json!([255, 0, 0]));
    }

    #[test]
    fn test_key_release_needs_key() {
        let req = ActionRequest::new(ActionKind::KeyRelease, json!({}));
        assert_eq!(plan(&req).unwrap_err().kind(), ErrorKind::InvalidParams);

        let req = ActionRequest::new(ActionKind::KeyRelease, json!({"key": "shift"}));
        match plan(&req).unwrap() {
            Plan::Single(Planned::Ready(Operation::KeyUp { key })) => assert_eq!(key, "shift"),
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_similarity() {
        assert_eq!(similarity("submit", "submit"), 1.0);
        assert!(similarity("submlt", "submit") >= 0.8);
        assert!(similarity("cancel", "submit") < 0.5);
    }

    #[test]
    fn test_plan_rejects_zero_sized_region() {
        let req = ActionRequest::new(
            ActionKind::CaptureScreen,
            json!({"region": {"x": 0, "y": 0, "width": 0, "height": 10}}),
        );
        let err = plan(&req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
    }
}

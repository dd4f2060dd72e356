//! Core data model shared by the probe, router, governor and gateway.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{BridgeError, ErrorKind};

// ============================================================================
// Operation classes and backends
// ============================================================================

/// Granularity at which backend fallback order is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Capture,
    Mouse,
    Keyboard,
    Window,
    Ocr,
}

impl OperationClass {
    pub const ALL: [OperationClass; 5] = [
        OperationClass::Capture,
        OperationClass::Mouse,
        OperationClass::Keyboard,
        OperationClass::Window,
        OperationClass::Ocr,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Mouse => "mouse",
            Self::Keyboard => "keyboard",
            Self::Window => "window",
            Self::Ocr => "ocr",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of native mechanisms the bridge knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendId {
    Scrot,
    Grim,
    Import,
    Xdotool,
    Ydotool,
    Wmctrl,
    Tesseract,
}

impl BackendId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scrot => "scrot",
            Self::Grim => "grim",
            Self::Import => "import",
            Self::Xdotool => "xdotool",
            Self::Ydotool => "ydotool",
            Self::Wmctrl => "wmctrl",
            Self::Tesseract => "tesseract",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "scrot" => Some(Self::Scrot),
            "grim" => Some(Self::Grim),
            "import" | "imagemagick" => Some(Self::Import),
            "xdotool" => Some(Self::Xdotool),
            "ydotool" => Some(Self::Ydotool),
            "wmctrl" => Some(Self::Wmctrl),
            "tesseract" => Some(Self::Tesseract),
            _ => None,
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Action kinds
// ============================================================================

/// Every backend-routed operation a caller can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CaptureScreen,
    ExtractText,
    FindText,
    AnalyzeScreen,
    FindUiElements,
    PixelColor,
    ClickScreen,
    MoveMouse,
    Scroll,
    DragMouse,
    GetMousePosition,
    TypeText,
    PressKey,
    KeyCombo,
    KeyRelease,
    GetWindows,
    ActivateWindow,
    ResizeWindow,
    MoveWindow,
}

impl ActionKind {
    /// Map an RPC method name (including the legacy aliases) to a kind.
    pub fn from_method(method: &str) -> Option<Self> {
        let kind = match method {
            "capture_screen" | "screen_capture" | "capture_full_screen" => Self::CaptureScreen,
            "extract_text" => Self::ExtractText,
            "find_text" | "find_text_on_screen" => Self::FindText,
            "analyze_screen" => Self::AnalyzeScreen,
            "find_ui_elements" => Self::FindUiElements,
            "pixel_color" | "get_pixel_color" => Self::PixelColor,
            "click_screen" | "mouse_click" | "click" => Self::ClickScreen,
            "move_mouse" | "mouse_move" | "move" => Self::MoveMouse,
            "scroll" | "mouse_scroll" => Self::Scroll,
            "drag_mouse" | "mouse_drag" => Self::DragMouse,
            "get_mouse_position" | "mouse_position" => Self::GetMousePosition,
            "type_text" | "keyboard_type" | "type" => Self::TypeText,
            "press_key" | "keyboard_press" => Self::PressKey,
            "key_combo" | "keyboard_hotkey" | "key_combination" => Self::KeyCombo,
            "key_release" | "keyboard_release" => Self::KeyRelease,
            "get_windows" | "get_all_windows" | "get_window_list" => Self::GetWindows,
            "activate_window" => Self::ActivateWindow,
            "resize_window" => Self::ResizeWindow,
            "move_window" => Self::MoveWindow,
            _ => return None,
        };
        Some(kind)
    }

    pub fn method_name(self) -> &'static str {
        match self {
            Self::CaptureScreen => "capture_screen",
            Self::ExtractText => "extract_text",
            Self::FindText => "find_text",
            Self::AnalyzeScreen => "analyze_screen",
            Self::FindUiElements => "find_ui_elements",
            Self::PixelColor => "pixel_color",
            Self::ClickScreen => "click_screen",
            Self::MoveMouse => "move_mouse",
            Self::Scroll => "scroll",
            Self::DragMouse => "drag_mouse",
            Self::GetMousePosition => "get_mouse_position",
            Self::TypeText => "type_text",
            Self::PressKey => "press_key",
            Self::KeyCombo => "key_combo",
            Self::KeyRelease => "key_release",
            Self::GetWindows => "get_windows",
            Self::ActivateWindow => "activate_window",
            Self::ResizeWindow => "resize_window",
            Self::MoveWindow => "move_window",
        }
    }

    /// The class whose permission flag and backend list govern this kind.
    pub fn class(self) -> OperationClass {
        match self {
            Self::CaptureScreen | Self::AnalyzeScreen | Self::FindUiElements | Self::PixelColor => {
                OperationClass::Capture
            }
            Self::ExtractText | Self::FindText => OperationClass::Ocr,
            Self::ClickScreen
            | Self::MoveMouse
            | Self::Scroll
            | Self::DragMouse
            | Self::GetMousePosition => OperationClass::Mouse,
            Self::TypeText | Self::PressKey | Self::KeyCombo | Self::KeyRelease => {
                OperationClass::Keyboard
            }
            Self::GetWindows | Self::ActivateWindow | Self::ResizeWindow | Self::MoveWindow => {
                OperationClass::Window
            }
        }
    }

    /// Mutating kinds alter the shared cursor/focus state: they are
    /// rate-limited and serialized through the input lock.
    pub fn is_mutating(self) -> bool {
        matches!(
            self.class(),
            OperationClass::Mouse | OperationClass::Keyboard | OperationClass::Window
        ) && !matches!(self, Self::GetWindows | Self::GetMousePosition)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method_name())
    }
}

/// A request for one backend-routed action. Immutable once dispatched.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRequest {
    pub kind: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_hint: Option<BackendId>,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_id: Option<u32>,
}

impl ActionRequest {
    pub fn new(kind: ActionKind, params: Value) -> Self {
        Self {
            kind,
            backend_hint: None,
            params,
            monitor_id: None,
        }
    }

    /// Build a request from raw RPC params, lifting out `monitor_id`
    /// (or the legacy `monitor`) and an optional `backend` pin.
    pub fn from_params(kind: ActionKind, params: Value) -> Result<Self, BridgeError> {
        let params = match params {
            Value::Null => json!({}),
            Value::Object(_) => params,
            _ => {
                return Err(BridgeError::InvalidParams(
                    "params must be an object".to_string(),
                ))
            }
        };

        let monitor_id = match params.get("monitor_id").or_else(|| params.get("monitor")) {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .and_then(|id| u32::try_from(id).ok())
                    .ok_or_else(|| {
                        BridgeError::InvalidParams(format!("invalid monitor_id: {}", v))
                    })?,
            ),
        };

        let backend_hint = match params.get("backend").and_then(|v| v.as_str()) {
            None => None,
            Some(name) => Some(BackendId::parse(name).ok_or_else(|| {
                BridgeError::InvalidParams(format!("unknown backend: {}", name))
            })?),
        };

        Ok(Self {
            kind,
            backend_hint,
            params,
            monitor_id,
        })
    }

    pub fn with_monitor(mut self, monitor_id: u32) -> Self {
        self.monitor_id = Some(monitor_id);
        self
    }

    pub fn with_hint(mut self, backend: BackendId) -> Self {
        self.backend_hint = Some(backend);
        self
    }
}

// ============================================================================
// Geometry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    pub fn contains(&self, p: Point) -> bool {
        let (px, py) = (p.x as i64, p.y as i64);
        px >= self.x as i64 && px < self.right() && py >= self.y as i64 && py < self.bottom()
    }

    /// True when the two rectangles share at least one pixel. Edge-adjacent
    /// rectangles do not intersect.
    pub fn intersects(&self, other: &Rect) -> bool {
        (self.x as i64) < other.right()
            && (other.x as i64) < self.right()
            && (self.y as i64) < other.bottom()
            && (other.y as i64) < self.bottom()
    }

    /// Nearest pixel inside this rectangle.
    pub fn clamp(&self, p: Point) -> Point {
        let max_x = (self.right() - 1).max(self.x as i64);
        let max_y = (self.bottom() - 1).max(self.y as i64);
        Point {
            x: (p.x as i64).clamp(self.x as i64, max_x) as i32,
            y: (p.y as i64).clamp(self.y as i64, max_y) as i32,
        }
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.x + (self.width / 2) as i32,
            y: self.y + (self.height / 2) as i32,
        }
    }

    /// Bounding box of all rectangles, or `None` for an empty set.
    pub fn union_of<'a>(rects: impl IntoIterator<Item = &'a Rect>) -> Option<Rect> {
        let mut iter = rects.into_iter();
        let first = iter.next()?;
        let (mut left, mut top) = (first.x as i64, first.y as i64);
        let (mut right, mut bottom) = (first.right(), first.bottom());
        for r in iter {
            left = left.min(r.x as i64);
            top = top.min(r.y as i64);
            right = right.max(r.right());
            bottom = bottom.max(r.bottom());
        }
        Some(Rect {
            x: left as i32,
            y: top as i32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        })
    }
}

/// One physical display, or the synthetic union entry with `id == 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorDescriptor {
    pub id: u32,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub is_primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl MonitorDescriptor {
    pub const UNION_ID: u32 = 0;

    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    pub fn is_union(&self) -> bool {
        self.id == Self::UNION_ID
    }
}

/// Either representation of a screen position. A value of this type always
/// carries exactly one representation; the both/neither cases are rejected
/// when parsing caller params.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Position {
    Absolute { x: i32, y: i32 },
    Relative { x_rel: f64, y_rel: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub position: Position,
    pub monitor_id: u32,
}

impl Coordinate {
    pub fn absolute(x: i32, y: i32, monitor_id: u32) -> Self {
        Self {
            position: Position::Absolute { x, y },
            monitor_id,
        }
    }

    pub fn relative(x_rel: f64, y_rel: f64, monitor_id: u32) -> Self {
        Self {
            position: Position::Relative { x_rel, y_rel },
            monitor_id,
        }
    }

    /// Parse `{prefix}x`/`{prefix}y` or `{prefix}x_rel`/`{prefix}y_rel` from
    /// params. Returns `Ok(None)` when neither form is present.
    pub fn from_params(
        params: &Value,
        prefix: &str,
        monitor_id: u32,
    ) -> Result<Option<Self>, BridgeError> {
        let field = |name: &str| {
            params
                .get(format!("{}{}", prefix, name))
                .filter(|v| !v.is_null())
        };
        let (x, y) = (field("x"), field("y"));
        let (x_rel, y_rel) = (field("x_rel"), field("y_rel"));

        let has_abs = x.is_some() || y.is_some();
        let has_rel = x_rel.is_some() || y_rel.is_some();

        match (has_abs, has_rel) {
            (false, false) => Ok(None),
            (true, true) => Err(BridgeError::CoordinateInvalid(format!(
                "both absolute ({p}x/{p}y) and relative ({p}x_rel/{p}y_rel) given",
                p = prefix
            ))),
            (true, false) => {
                let (Some(x), Some(y)) = (x, y) else {
                    return Err(BridgeError::CoordinateInvalid(format!(
                        "{p}x and {p}y must be given together",
                        p = prefix
                    )));
                };
                Ok(Some(Self::absolute(
                    integral_pixel(x)?,
                    integral_pixel(y)?,
                    monitor_id,
                )))
            }
            (false, true) => {
                let (Some(x_rel), Some(y_rel)) = (x_rel, y_rel) else {
                    return Err(BridgeError::CoordinateInvalid(format!(
                        "{p}x_rel and {p}y_rel must be given together",
                        p = prefix
                    )));
                };
                let coord = Self::relative(fraction(x_rel)?, fraction(y_rel)?, monitor_id);
                coord.validate()?;
                Ok(Some(coord))
            }
        }
    }

    /// Relative values must be finite and inside `[0, 1]`.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if let Position::Relative { x_rel, y_rel } = self.position {
            for v in [x_rel, y_rel] {
                if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                    return Err(BridgeError::CoordinateInvalid(format!(
                        "relative value {} outside [0, 1]",
                        v
                    )));
                }
            }
        }
        Ok(())
    }
}

fn integral_pixel(v: &Value) -> Result<i32, BridgeError> {
    let n = v
        .as_i64()
        .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        .ok_or_else(|| BridgeError::CoordinateInvalid(format!("{} is not a pixel value", v)))?;
    i32::try_from(n)
        .map_err(|_| BridgeError::CoordinateInvalid(format!("{} is out of range", n)))
}

fn fraction(v: &Value) -> Result<f64, BridgeError> {
    v.as_f64()
        .ok_or_else(|| BridgeError::CoordinateInvalid(format!("{} is not a number", v)))
}

// ============================================================================
// Backend outputs
// ============================================================================

/// An encoded screenshot. Bytes are kept exactly as the capture backend
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub mime_type: &'static str,
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

impl Image {
    /// Accept a PNG only if its header is well-formed and both dimensions
    /// are non-zero.
    pub fn from_png(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() < 24 || bytes[..8] != PNG_SIGNATURE || &bytes[12..16] != b"IHDR" {
            return None;
        }
        let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self {
            mime_type: "image/png",
            bytes,
            width,
            height,
        })
    }

    pub fn to_data_uri(&self) -> String {
        use base64::Engine;
        format!(
            "data:{};base64,{}",
            self.mime_type,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextElement {
    pub text: String,
    pub bbox: Rect,
    pub confidence: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub id: String,
    pub title: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desktop: Option<i32>,
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// One try of one backend inside a fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub backend: BackendId,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&BridgeError> for ActionError {
    fn from(err: &BridgeError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one action. `backend_used` is set whenever at least one
/// backend was attempted, including on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub ok: bool,
    pub backend_used: Option<BackendId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
}

impl ActionResult {
    pub fn success(backend: BackendId, payload: Value, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            ok: true,
            backend_used: Some(backend),
            payload: Some(payload),
            error: None,
            attempts,
        }
    }

    pub fn failure(
        error: &BridgeError,
        backend_used: Option<BackendId>,
        attempts: Vec<AttemptRecord>,
    ) -> Self {
        Self {
            ok: false,
            backend_used,
            payload: None,
            error: Some(ActionError::from(error)),
            attempts,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

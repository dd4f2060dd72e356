//! Native input and capture backends.
//!
//! Each backend wraps one helper binary and implements [`Backend`] for the
//! operation classes it can serve. The [`BackendSet`] owns the instances and
//! the fixed per-class priority order the probe and the router both follow.

mod capture;
mod process;
mod tesseract;
mod wmctrl;
mod xdotool;
mod xrandr;
mod ydotool;

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{BackendId, Image, OperationClass, Point, Rect, TextElement, WindowInfo};

pub use capture::CaptureBackend;
pub use process::{
    BackendError, CommandOutput, ProbeFailure, ProbeFailureReason, ProcessRunner, RunError,
};
pub use tesseract::{parse_tsv, TesseractBackend, MIN_CONFIDENCE};
pub use wmctrl::WmctrlBackend;
pub use xdotool::XdotoolBackend;
pub use xrandr::{parse_listmonitors, XrandrMonitors};
pub use ydotool::YdotoolBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

impl MouseButton {
    /// X11 button number.
    pub fn x11_code(self) -> u8 {
        match self {
            Self::Left => 1,
            Self::Middle => 2,
            Self::Right => 3,
        }
    }
}

impl FromStr for MouseButton {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "left" | "1" => Ok(Self::Left),
            "middle" | "2" => Ok(Self::Middle),
            "right" | "3" => Ok(Self::Right),
            other => Err(format!("unknown mouse button '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    /// X11 wheel button number.
    pub fn x11_button(self) -> u8 {
        match self {
            Self::Up => 4,
            Self::Down => 5,
            Self::Left => 6,
            Self::Right => 7,
        }
    }
}

impl FromStr for ScrollDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            other => Err(format!("unknown scroll direction '{}'", other)),
        }
    }
}

/// A fully resolved native call. All pixel positions are virtual-desktop
/// coordinates.
#[derive(Debug, Clone)]
pub enum Operation {
    Capture {
        region: Option<Rect>,
    },
    Ocr {
        image: Arc<Image>,
    },
    Click {
        at: Option<Point>,
        button: MouseButton,
        clicks: u32,
    },
    MoveTo {
        to: Point,
    },
    Scroll {
        at: Option<Point>,
        direction: ScrollDirection,
        clicks: u32,
    },
    Drag {
        from: Point,
        to: Point,
        button: MouseButton,
    },
    CursorPosition,
    TypeText {
        text: String,
        interval_ms: u64,
    },
    PressKey {
        key: String,
        presses: u32,
    },
    KeyCombo {
        keys: Vec<String>,
    },
    KeyUp {
        key: String,
    },
    ListWindows,
    ActivateWindow {
        title: String,
    },
    ResizeWindow {
        title: String,
        width: u32,
        height: u32,
    },
    MoveWindow {
        title: String,
        x: i32,
        y: i32,
    },
}

impl Operation {
    pub fn class(&self) -> OperationClass {
        match self {
            Self::Capture { .. } => OperationClass::Capture,
            Self::Ocr { .. } => OperationClass::Ocr,
            Self::Click { .. }
            | Self::MoveTo { .. }
            | Self::Scroll { .. }
            | Self::Drag { .. }
            | Self::CursorPosition => OperationClass::Mouse,
            Self::TypeText { .. }
            | Self::PressKey { .. }
            | Self::KeyCombo { .. }
            | Self::KeyUp { .. } => OperationClass::Keyboard,
            Self::ListWindows
            | Self::ActivateWindow { .. }
            | Self::ResizeWindow { .. }
            | Self::MoveWindow { .. } => OperationClass::Window,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Capture { .. } => "capture",
            Self::Ocr { .. } => "ocr",
            Self::Click { .. } => "click",
            Self::MoveTo { .. } => "move_to",
            Self::Scroll { .. } => "scroll",
            Self::Drag { .. } => "drag",
            Self::CursorPosition => "cursor_position",
            Self::TypeText { .. } => "type_text",
            Self::PressKey { .. } => "press_key",
            Self::KeyCombo { .. } => "key_combo",
            Self::KeyUp { .. } => "key_up",
            Self::ListWindows => "list_windows",
            Self::ActivateWindow { .. } => "activate_window",
            Self::ResizeWindow { .. } => "resize_window",
            Self::MoveWindow { .. } => "move_window",
        }
    }
}

/// What a backend hands back.
#[derive(Debug, Clone)]
pub enum Output {
    /// Side-effect operation finished; the value summarizes what was done.
    Done(Value),
    Image(Image),
    Text(Vec<TextElement>),
    Windows(Vec<WindowInfo>),
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn id(&self) -> BackendId;

    fn supports(&self, class: OperationClass) -> bool;

    /// Run a minimal, side-effect-free (or self-reverting) exercise of
    /// `class` and report whether the result is usable.
    async fn probe(&self, class: OperationClass) -> Result<(), ProbeFailure>;

    async fn execute(&self, op: Operation) -> Result<Output, BackendError>;
}

/// Registered backends and the priority order per class.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: HashMap<BackendId, Arc<dyn Backend>>,
    priority: BTreeMap<OperationClass, Vec<BackendId>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every native backend, in the default priority order.
    pub fn native(display: &str, call_timeout: Duration) -> Self {
        let runner = ProcessRunner::new(display, call_timeout);
        let mut set = Self::new();
        set.register(Arc::new(CaptureBackend::scrot(runner.clone())));
        set.register(Arc::new(CaptureBackend::grim(runner.clone())));
        set.register(Arc::new(CaptureBackend::import(runner.clone())));
        set.register(Arc::new(XdotoolBackend::new(runner.clone())));
        set.register(Arc::new(YdotoolBackend::new(runner.clone())));
        set.register(Arc::new(WmctrlBackend::new(runner.clone())));
        set.register(Arc::new(TesseractBackend::new(runner)));

        use BackendId::*;
        set.set_priority(OperationClass::Capture, vec![Scrot, Grim, Import]);
        set.set_priority(OperationClass::Mouse, vec![Xdotool, Ydotool]);
        set.set_priority(OperationClass::Keyboard, vec![Xdotool, Ydotool]);
        set.set_priority(OperationClass::Window, vec![Wmctrl, Xdotool]);
        set.set_priority(OperationClass::Ocr, vec![Tesseract]);
        set
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.id(), backend);
    }

    pub fn set_priority(&mut self, class: OperationClass, order: Vec<BackendId>) {
        self.priority.insert(class, order);
    }

    /// Priority order for `class`, restricted to registered backends that
    /// support it.
    pub fn priority(&self, class: OperationClass) -> Vec<BackendId> {
        self.priority
            .get(&class)
            .map(|order| {
                order
                    .iter()
                    .copied()
                    .filter(|id| self.get(*id).is_some_and(|b| b.supports(class)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, id: BackendId) -> Option<Arc<dyn Backend>> {
        self.backends.get(&id).cloned()
    }
}

pub(crate) fn unsupported(backend: BackendId, op: &Operation) -> BackendError {
    BackendError(format!("{} cannot perform {}", backend, op.name()))
}

/// Read the `--shell` style `KEY=value` lines some helpers print.
pub(crate) fn shell_vars(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

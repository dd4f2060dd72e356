//! Scripted backends and a ready-made bridge for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::json;

use crate::audit::AuditLog;
use crate::backends::{Backend, BackendError, BackendSet, Operation, Output, ProbeFailure};
use crate::config::ProbeConfig;
use crate::coordinator::Bridge;
use crate::geometry::{CoordinateMapper, PhysicalMonitor, StaticMonitors};
use crate::safety::Policy;
use crate::types::{BackendId, Image, OperationClass, Rect, TextElement};

#[derive(Debug, Clone)]
pub enum MockBehavior {
    Succeed,
    Fail(String),
    Delay(Duration),
    Hang,
}

/// Smallest PNG the header check accepts: 4x3 pixels.
pub fn tiny_png() -> Vec<u8> {
    let mut png = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    png.extend_from_slice(&[0, 0, 0, 13]);
    png.extend_from_slice(b"IHDR");
    png.extend_from_slice(&4u32.to_be_bytes());
    png.extend_from_slice(&3u32.to_be_bytes());
    png.extend_from_slice(&[8, 6, 0, 0, 0]);
    png
}

pub fn encode_png(img: &RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

/// 400x150 dark screen with a 200x30 light text field at (50, 50) and a
/// 60x40 button at (300, 50).
pub fn mock_form() -> DynamicImage {
    let mut img = RgbImage::from_pixel(400, 150, Rgb([20, 20, 20]));
    for (x0, y0, w, h) in [(50, 50, 200, 30), (300, 50, 60, 40)] {
        for x in x0..x0 + w {
            for y in y0..y0 + h {
                img.put_pixel(x, y, Rgb([235, 235, 235]));
            }
        }
    }
    DynamicImage::ImageRgb8(img)
}

pub struct MockBackend {
    id: BackendId,
    classes: Vec<OperationClass>,
    behavior: MockBehavior,
    probe_behavior: MockBehavior,
    probe_result: Result<(), ProbeFailure>,
    probe_script: Mutex<VecDeque<Result<(), ProbeFailure>>>,
    probe_calls: Mutex<u32>,
    text: Vec<TextElement>,
    png: Vec<u8>,
    ops: Mutex<Vec<Operation>>,
    spans: Mutex<Vec<(Instant, Instant)>>,
    probe_spans: Mutex<Vec<(Instant, Instant)>>,
}

impl MockBackend {
    pub fn new(id: BackendId, classes: &[OperationClass]) -> Self {
        Self {
            id,
            classes: classes.to_vec(),
            behavior: MockBehavior::Succeed,
            probe_behavior: MockBehavior::Succeed,
            probe_result: Ok(()),
            probe_script: Mutex::new(VecDeque::new()),
            probe_calls: Mutex::new(0),
            text: Vec::new(),
            png: tiny_png(),
            ops: Mutex::new(Vec::new()),
            spans: Mutex::new(Vec::new()),
            probe_spans: Mutex::new(Vec::new()),
        }
    }

    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_probe(mut self, result: Result<(), ProbeFailure>) -> Self {
        self.probe_result = result;
        self
    }

    pub fn with_probe_behavior(mut self, behavior: MockBehavior) -> Self {
        self.probe_behavior = behavior;
        self
    }

    /// Results returned by the first probes, before falling back to the
    /// fixed probe result.
    pub fn with_probe_script(self, script: Vec<Result<(), ProbeFailure>>) -> Self {
        *self.probe_script.lock().unwrap() = script.into();
        self
    }

    pub fn with_text(mut self, text: Vec<TextElement>) -> Self {
        self.text = text;
        self
    }

    /// Encoded PNG returned by captures.
    pub fn with_image(mut self, png: Vec<u8>) -> Self {
        self.png = png;
        self
    }

    pub fn ops(&self) -> Vec<Operation> {
        self.ops.lock().unwrap().clone()
    }

    pub fn spans(&self) -> Vec<(Instant, Instant)> {
        self.spans.lock().unwrap().clone()
    }

    /// Entry and exit of every `probe` call.
    pub fn probe_spans(&self) -> Vec<(Instant, Instant)> {
        self.probe_spans.lock().unwrap().clone()
    }

    pub fn probe_calls(&self) -> u32 {
        *self.probe_calls.lock().unwrap()
    }

    fn output_for(&self, op: &Operation) -> Output {
        match op {
            Operation::Capture { .. } => Output::Image(Image::from_png(self.png.clone()).unwrap()),
            Operation::CursorPosition => Output::Done(json!({"x": 12, "y": 34})),
            Operation::Ocr { .. } => Output::Text(self.text.clone()),
            Operation::ListWindows => Output::Windows(Vec::new()),
            other => Output::Done(json!({"op": other.name(), "backend": self.id})),
        }
    }
}

async fn act(behavior: &MockBehavior) -> Result<(), String> {
    match behavior {
        MockBehavior::Succeed => Ok(()),
        MockBehavior::Fail(reason) => Err(reason.clone()),
        MockBehavior::Delay(d) => {
            tokio::time::sleep(*d).await;
            Ok(())
        }
        MockBehavior::Hang => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn supports(&self, class: OperationClass) -> bool {
        self.classes.contains(&class)
    }

    async fn probe(&self, _class: OperationClass) -> Result<(), ProbeFailure> {
        *self.probe_calls.lock().unwrap() += 1;
        let entered = Instant::now();
        let scripted = self.probe_script.lock().unwrap().pop_front();
        let result = match scripted {
            Some(result) => result,
            None => match act(&self.probe_behavior).await {
                Ok(()) => self.probe_result.clone(),
                Err(e) => Err(ProbeFailure::invalid_result(e)),
            },
        };
        self.probe_spans.lock().unwrap().push((entered, Instant::now()));
        result
    }

    async fn execute(&self, op: Operation) -> Result<Output, BackendError> {
        let entered = Instant::now();
        self.ops.lock().unwrap().push(op.clone());
        let result = act(&self.behavior).await;
        self.spans.lock().unwrap().push((entered, Instant::now()));
        result.map_err(BackendError)?;
        Ok(self.output_for(&op))
    }
}

pub fn single_monitor() -> Arc<StaticMonitors> {
    Arc::new(StaticMonitors::new(vec![PhysicalMonitor {
        name: "DP-1".to_string(),
        rect: Rect::new(0, 0, 1920, 1080),
        is_primary: true,
    }]))
}

/// Probe `mocks` (each registered for the classes it supports, in the order
/// given) and build a bridge over one 1920x1080 monitor.
pub async fn test_bridge(mocks: Vec<Arc<MockBackend>>, policy: Policy) -> Bridge {
    let mut set = BackendSet::new();
    for class in OperationClass::ALL {
        let order: Vec<BackendId> = mocks
            .iter()
            .filter(|m| m.supports(class))
            .map(|m| m.id())
            .collect();
        set.set_priority(class, order);
    }
    for mock in mocks {
        set.register(mock);
    }

    Bridge::initialize(
        set,
        single_monitor(),
        policy,
        CoordinateMapper::default(),
        Duration::from_millis(300),
        ProbeConfig {
            retries: 0,
            retry_delay: Duration::ZERO,
            timeout: Duration::from_millis(300),
        },
        Arc::new(AuditLog::new(1000)),
    )
    .await
}

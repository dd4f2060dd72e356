//! Monitor enumeration and coordinate resolution.
//!
//! Physical displays get ids `1..` in the order they are first seen; the ids
//! stay attached to the same output name until an explicit refresh. Id `0` is
//! the synthetic union of all displays (the virtual desktop frame).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::types::{Coordinate, MonitorDescriptor, Point, Position, Rect};

/// How a relative coordinate against the union frame is resolved when the
/// computed pixel falls outside every physical display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnionPolicy {
    /// Return the raw union-frame pixel, even if it lands in a gap.
    #[default]
    Raw,
    /// Snap to the nearest pixel of the closest physical display.
    Clamp,
}

impl FromStr for UnionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "clamp" => Ok(Self::Clamp),
            other => Err(format!("expected 'raw' or 'clamp', got '{}'", other)),
        }
    }
}

impl fmt::Display for UnionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Clamp => f.write_str("clamp"),
        }
    }
}

// ============================================================================
// Monitor sources
// ============================================================================

/// A display as reported by the host, before id assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalMonitor {
    pub name: String,
    pub rect: Rect,
    pub is_primary: bool,
}

#[async_trait]
pub trait MonitorSource: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<PhysicalMonitor>, BridgeError>;
}

/// Fixed geometry, from `LILITH_MONITORS` or tests.
pub struct StaticMonitors {
    monitors: Mutex<Vec<PhysicalMonitor>>,
}

impl StaticMonitors {
    pub fn new(monitors: Vec<PhysicalMonitor>) -> Self {
        Self {
            monitors: Mutex::new(monitors),
        }
    }

    /// Parse `WxH+X+Y[,WxH+X+Y...]`. The first entry is the primary display.
    /// Overlapping entries are rejected.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let monitors = spec
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .enumerate()
            .map(|(i, geometry)| {
                parse_geometry(geometry)
                    .map(|rect| PhysicalMonitor {
                        name: format!("static-{}", i + 1),
                        rect,
                        is_primary: i == 0,
                    })
                    .ok_or_else(|| format!("invalid monitor geometry '{}'", geometry))
            })
            .collect::<Result<Vec<_>, _>>()?;
        for (i, a) in monitors.iter().enumerate() {
            if let Some(b) = monitors[i + 1..].iter().find(|b| a.rect.intersects(&b.rect)) {
                return Err(format!("monitor {} overlaps monitor {}", a.name, b.name));
            }
        }
        Ok(Self::new(monitors))
    }

    /// Replace the geometry, as if displays were plugged or unplugged.
    pub fn set(&self, monitors: Vec<PhysicalMonitor>) {
        *self.monitors.lock().unwrap_or_else(|e| e.into_inner()) = monitors;
    }
}

#[async_trait]
impl MonitorSource for StaticMonitors {
    async fn enumerate(&self) -> Result<Vec<PhysicalMonitor>, BridgeError> {
        Ok(self
            .monitors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

/// Parse an X geometry string `WxH+X+Y` (offsets may be negative).
pub fn parse_geometry(s: &str) -> Option<Rect> {
    let (size, offsets) = match s.find(['+', '-']) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let (w, h) = size.split_once('x')?;
    let width: u32 = w.trim().parse().ok()?;
    let height: u32 = h.trim().parse().ok()?;

    let (x, y) = if offsets.is_empty() {
        (0, 0)
    } else {
        let mut values = Vec::with_capacity(2);
        let mut rest = offsets;
        while !rest.is_empty() {
            let sign_len = 1;
            let next = rest[sign_len..]
                .find(['+', '-'])
                .map(|i| i + sign_len)
                .unwrap_or(rest.len());
            let (part, tail) = rest.split_at(next);
            values.push(part.parse::<i32>().ok()?);
            rest = tail;
        }
        if values.len() != 2 {
            return None;
        }
        (values[0], values[1])
    };

    Some(Rect::new(x, y, width, height))
}

// ============================================================================
// Display map (stable ids over fresh geometry)
// ============================================================================

struct IdTable {
    ids: HashMap<String, u32>,
    next: u32,
}

impl IdTable {
    fn new() -> Self {
        Self {
            ids: HashMap::new(),
            next: 1,
        }
    }

    fn id_for(&mut self, name: &str) -> u32 {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = self.next;
        self.next += 1;
        self.ids.insert(name.to_string(), id);
        id
    }
}

/// Current monitor geometry with process-stable ids.
pub struct DisplayMap {
    source: Arc<dyn MonitorSource>,
    table: Mutex<IdTable>,
}

impl DisplayMap {
    pub fn new(source: Arc<dyn MonitorSource>) -> Self {
        Self {
            source,
            table: Mutex::new(IdTable::new()),
        }
    }

    /// Enumerate displays now. The union entry (id 0) comes first when at
    /// least one display is connected. A display overlapping one reported
    /// earlier (a mirrored output, say) is left out.
    pub async fn snapshot(&self) -> Result<Vec<MonitorDescriptor>, BridgeError> {
        let physical = without_overlaps(self.source.enumerate().await?);
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());

        let mut monitors: Vec<MonitorDescriptor> = physical
            .iter()
            .map(|m| MonitorDescriptor {
                id: table.id_for(&m.name),
                x: m.rect.x,
                y: m.rect.y,
                width: m.rect.width,
                height: m.rect.height,
                is_primary: m.is_primary,
                name: Some(m.name.clone()),
            })
            .collect();
        monitors.sort_by_key(|m| m.id);

        if let Some(union) = Rect::union_of(physical.iter().map(|m| &m.rect)) {
            monitors.insert(
                0,
                MonitorDescriptor {
                    id: MonitorDescriptor::UNION_ID,
                    x: union.x,
                    y: union.y,
                    width: union.width,
                    height: union.height,
                    is_primary: false,
                    name: None,
                },
            );
        }
        Ok(monitors)
    }

    /// Forget all id assignments and enumerate from scratch.
    pub async fn refresh(&self) -> Result<Vec<MonitorDescriptor>, BridgeError> {
        *self.table.lock().unwrap_or_else(|e| e.into_inner()) = IdTable::new();
        self.snapshot().await
    }
}

fn without_overlaps(physical: Vec<PhysicalMonitor>) -> Vec<PhysicalMonitor> {
    let mut kept: Vec<PhysicalMonitor> = Vec::with_capacity(physical.len());
    for monitor in physical {
        match kept.iter().find(|k| k.rect.intersects(&monitor.rect)) {
            Some(first) => tracing::warn!(
                monitor = %monitor.name,
                overlaps = %first.name,
                "Ignoring display that overlaps another"
            ),
            None => kept.push(monitor),
        }
    }
    kept
}

// ============================================================================
// Coordinate mapper
// ============================================================================

/// A coordinate resolved to virtual-desktop pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolved {
    pub point: Point,
    /// False for an absolute coordinate outside its reference frame. Such
    /// coordinates are still dispatched.
    pub in_frame: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinateMapper {
    pub union_policy: UnionPolicy,
}

impl CoordinateMapper {
    pub fn new(union_policy: UnionPolicy) -> Self {
        Self { union_policy }
    }

    /// Reference frame for `monitor_id`.
    pub fn frame(monitor_id: u32, monitors: &[MonitorDescriptor]) -> Result<Rect, BridgeError> {
        if let Some(m) = monitors.iter().find(|m| m.id == monitor_id) {
            return Ok(m.rect());
        }
        if monitor_id == MonitorDescriptor::UNION_ID {
            let physical: Vec<Rect> = monitors
                .iter()
                .filter(|m| !m.is_union())
                .map(|m| m.rect())
                .collect();
            if let Some(union) = Rect::union_of(&physical) {
                return Ok(union);
            }
        }
        Err(BridgeError::MonitorNotFound(monitor_id))
    }

    pub fn resolve(
        &self,
        coord: &Coordinate,
        monitors: &[MonitorDescriptor],
    ) -> Result<Resolved, BridgeError> {
        coord.validate()?;
        let frame = Self::frame(coord.monitor_id, monitors)?;

        match coord.position {
            Position::Absolute { x, y } => {
                let point = Point::new(x, y);
                let in_frame = frame.contains(point);
                if !in_frame {
                    tracing::warn!(
                        x,
                        y,
                        monitor_id = coord.monitor_id,
                        "Absolute coordinate outside its reference frame"
                    );
                }
                Ok(Resolved { point, in_frame })
            }
            Position::Relative { x_rel, y_rel } => {
                let point = Point::new(
                    scale(frame.x, frame.width, x_rel),
                    scale(frame.y, frame.height, y_rel),
                );
                let point = if coord.monitor_id == MonitorDescriptor::UNION_ID
                    && self.union_policy == UnionPolicy::Clamp
                {
                    clamp_to_nearest(point, monitors)
                } else {
                    point
                };
                Ok(Resolved {
                    point,
                    in_frame: true,
                })
            }
        }
    }
}

/// `origin + round(fraction * extent)`, kept on the last pixel at 1.0.
fn scale(origin: i32, extent: u32, fraction: f64) -> i32 {
    if extent == 0 {
        return origin;
    }
    let offset = (fraction * extent as f64).round() as i64;
    let offset = offset.clamp(0, extent as i64 - 1);
    (origin as i64 + offset) as i32
}

fn clamp_to_nearest(point: Point, monitors: &[MonitorDescriptor]) -> Point {
    let physical = monitors.iter().filter(|m| !m.is_union()).map(|m| m.rect());
    let mut best: Option<(i64, Point)> = None;
    for rect in physical {
        if rect.contains(point) {
            return point;
        }
        let candidate = rect.clamp(point);
        let (dx, dy) = (
            candidate.x as i64 - point.x as i64,
            candidate.y as i64 - point.y as i64,
        );
        let distance = dx * dx + dy * dy;
        if best.map(|(d, _)| distance < d).unwrap_or(true) {
            best = Some((distance, candidate));
        }
    }
    best.map(|(_, p)| p).unwrap_or(point)
}

//! In-process screenshot analysis: pixel sampling and bounding-box UI
//! element detection.
//!
//! Detection is edge based: Canny edges, slightly dilated to close corner
//! gaps, then the outermost contours. Each contour's bounding box is kept
//! when its size is plausible for a control and labelled by aspect ratio.

use image::{DynamicImage, GrayImage};
use imageproc::contours::{find_contours, Contour};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::morphology::dilate;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::types::{Image, Point, Rect};

const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;

/// Bounding-box area limits, exclusive.
const MIN_AREA: u32 = 100;
const MAX_AREA: u32 = 50_000;
const MIN_WIDTH: u32 = 20;
const MIN_HEIGHT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiElementKind {
    /// Wide and short.
    TextField,
    /// Roughly square.
    Button,
    Unknown,
}

impl UiElementKind {
    fn from_aspect(aspect: f64) -> Self {
        if aspect > 3.0 {
            Self::TextField
        } else if aspect > 0.5 && aspect < 2.0 {
            Self::Button
        } else {
            Self::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiElement {
    #[serde(rename = "type")]
    pub kind: UiElementKind,
    pub bbox: Rect,
    pub area: u32,
    pub aspect_ratio: f64,
}

impl UiElement {
    /// The same element with its box moved by `origin`.
    pub fn offset(&self, origin: Point) -> Self {
        Self {
            bbox: Rect::new(
                self.bbox.x + origin.x,
                self.bbox.y + origin.y,
                self.bbox.width,
                self.bbox.height,
            ),
            ..self.clone()
        }
    }
}

fn decode(image: &Image) -> Result<DynamicImage, BridgeError> {
    image::load_from_memory(&image.bytes)
        .map_err(|e| BridgeError::Internal(format!("cannot decode screenshot: {}", e)))
}

/// RGB value of the pixel at (`x`, `y`) of the image.
pub fn pixel_rgb(image: &Image, x: u32, y: u32) -> Result<[u8; 3], BridgeError> {
    let rgb = decode(image)?.to_rgb8();
    rgb.get_pixel_checked(x, y).map(|p| p.0).ok_or_else(|| {
        BridgeError::Internal(format!(
            "pixel ({}, {}) outside {}x{} screenshot",
            x,
            y,
            rgb.width(),
            rgb.height()
        ))
    })
}

/// Detect control-like boxes in an encoded screenshot. Boxes are in image
/// pixels, sorted top to bottom then left to right.
pub fn find_ui_elements(image: &Image) -> Result<Vec<UiElement>, BridgeError> {
    let gray = decode(image)?.to_luma8();
    Ok(detect(&gray))
}

pub fn detect(gray: &GrayImage) -> Vec<UiElement> {
    let edges = dilate(&canny(gray, CANNY_LOW, CANNY_HIGH), Norm::LInf, 1);
    let mut elements: Vec<UiElement> = find_contours::<u32>(&edges)
        .iter()
        .filter(|c| c.parent.is_none())
        .filter_map(bounding_box)
        .filter_map(classify)
        .collect();
    elements.sort_by_key(|e| (e.bbox.y, e.bbox.x));
    elements
}

fn bounding_box(contour: &Contour<u32>) -> Option<Rect> {
    let first = contour.points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in &contour.points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    Some(Rect::new(
        min_x as i32,
        min_y as i32,
        max_x - min_x + 1,
        max_y - min_y + 1,
    ))
}

fn classify(bbox: Rect) -> Option<UiElement> {
    let area = bbox.width * bbox.height;
    if area <= MIN_AREA || area >= MAX_AREA || bbox.width <= MIN_WIDTH || bbox.height <= MIN_HEIGHT
    {
        return None;
    }
    let aspect_ratio = bbox.width as f64 / bbox.height as f64;
    Some(UiElement {
        kind: UiElementKind::from_aspect(aspect_ratio),
        bbox,
        area,
        aspect_ratio,
    })
}

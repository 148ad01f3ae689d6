//! Bounding-box arithmetic for step cropping.
//!
//! Detector boxes are floating-point `xyxy` pixel coordinates and may be
//! inverted or run off the page. [`BBox::normalized`] repairs them against
//! the page size; [`BBox::padded`] turns the repaired box into the integer
//! crop rectangle actually cut from the page image.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Axis-aligned box in page pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Integer crop rectangle; `x2`/`y2` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from a detector's `[x1, y1, x2, y2]` record.
    ///
    /// Returns `None` unless there are exactly four finite values.
    pub fn from_xyxy(values: &[f32]) -> Option<Self> {
        match values {
            [x1, y1, x2, y2] if values.iter().all(|v| v.is_finite()) => {
                Some(Self::new(*x1, *y1, *x2, *y2))
            }
            _ => None,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Clamp to a `page_w × page_h` page and repair inverted corners.
    ///
    /// x is clamped to `[0, W-1]`, y to `[0, H-1]`. Returns `None` for an
    /// empty page.
    pub fn normalized(&self, page_w: u32, page_h: u32) -> Option<Self> {
        if page_w == 0 || page_h == 0 {
            return None;
        }
        let max_x = (page_w - 1) as f32;
        let max_y = (page_h - 1) as f32;
        let (ax, bx) = (self.x1.clamp(0.0, max_x), self.x2.clamp(0.0, max_x));
        let (ay, by) = (self.y1.clamp(0.0, max_y), self.y2.clamp(0.0, max_y));
        Some(Self {
            x1: ax.min(bx),
            y1: ay.min(by),
            x2: ax.max(bx),
            y2: ay.max(by),
        })
    }

    /// True when both edges are at least `min_edge` pixels long.
    pub fn meets_min_size(&self, min_edge: u32) -> bool {
        let min = min_edge as f32;
        self.width() >= min && self.height() >= min
    }

    /// Expand by `pad` pixels on every side and snap outward to whole pixels
    /// inside the page.
    ///
    /// The result always contains `self`. Returns `None` when the rectangle
    /// collapses to zero area.
    pub fn padded(&self, pad: u32, page_w: u32, page_h: u32) -> Option<PixelRect> {
        let pad = pad as f32;
        let x1 = (self.x1 - pad).max(0.0).floor() as u32;
        let y1 = (self.y1 - pad).max(0.0).floor() as u32;
        let x2 = ((self.x2 + pad).ceil().max(0.0) as u32).min(page_w);
        let y2 = ((self.y2 + pad).ceil().max(0.0) as u32).min(page_h);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(PixelRect { x1, y1, x2, y2 })
    }

    /// Reading order: top edge first, then left edge.
    pub fn reading_order(&self, other: &Self) -> Ordering {
        self.y1
            .total_cmp(&other.y1)
            .then_with(|| self.x1.total_cmp(&other.x1))
    }
}

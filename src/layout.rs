//! Layout engine: computes target positions for a set of canvas objects.
//!
//! DESIGN
//! ======
//! Every function here is pure. Callers snapshot objects into
//! [`LayoutItem`]s, receive [`Placement`]s in submission order, and apply
//! them through the object store themselves. Positions are top-left corners;
//! circular layout works on centers and converts back.
//!
//! Circular layout starts at angle 0 pointing right (+x) and proceeds
//! clockwise in screen space (+y down), so the second of four objects lands
//! directly below the centroid.

use std::f64::consts::TAU;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::CanvasObject;

pub const DEFAULT_SPACING: f64 = 20.0;
pub const DEFAULT_RADIUS: f64 = 200.0;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LayoutError {
    #[error("unknown layout type: {0}")]
    UnknownLayout(String),
    #[error("unknown alignment: {0}")]
    UnknownAlignment(String),
    #[error("spacing must be a finite, non-negative number (got {0})")]
    InvalidSpacing(f64),
    #[error("columns must be at least 1 (got {0})")]
    InvalidColumns(usize),
    #[error("radius must be a finite, positive number (got {0})")]
    InvalidRadius(f64),
}

impl crate::frame::ErrorCode for LayoutError {
    fn error_code(&self) -> &'static str {
        "E_VALIDATION"
    }
}

/// Closed set of arrangement algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutKind {
    Horizontal,
    Vertical,
    Grid,
    Circular,
    Stack,
}

impl LayoutKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Horizontal => "horizontal",
            Self::Vertical => "vertical",
            Self::Grid => "grid",
            Self::Circular => "circular",
            Self::Stack => "stack",
        }
    }
}

impl fmt::Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayoutKind {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "horizontal" => Ok(Self::Horizontal),
            "vertical" => Ok(Self::Vertical),
            "grid" => Ok(Self::Grid),
            "circular" => Ok(Self::Circular),
            "stack" => Ok(Self::Stack),
            other => Err(LayoutError::UnknownLayout(other.to_owned())),
        }
    }
}

/// Shared edge or center line of the set's bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    Left,
    Center,
    Right,
    Top,
    Middle,
    Bottom,
}

impl FromStr for Alignment {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "left" => Ok(Self::Left),
            "center" => Ok(Self::Center),
            "right" => Ok(Self::Right),
            "top" => Ok(Self::Top),
            "middle" => Ok(Self::Middle),
            "bottom" => Ok(Self::Bottom),
            other => Err(LayoutError::UnknownAlignment(other.to_owned())),
        }
    }
}

/// Position and bounding size of one object, as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutItem {
    pub id: Uuid,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl From<&CanvasObject> for LayoutItem {
    fn from(obj: &CanvasObject) -> Self {
        let (width, height) = obj.size();
        Self { id: obj.id, x: obj.x, y: obj.y, width, height }
    }
}

/// Target top-left position for one object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub id: Uuid,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutParams {
    pub spacing: Option<f64>,
    pub columns: Option<usize>,
    pub radius: Option<f64>,
    pub alignment: Option<Alignment>,
}

impl LayoutParams {
    /// Reject parameters no algorithm can honor.
    ///
    /// # Errors
    ///
    /// Returns the first offending parameter.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if let Some(spacing) = self.spacing {
            if !spacing.is_finite() || spacing < 0.0 {
                return Err(LayoutError::InvalidSpacing(spacing));
            }
        }
        if let Some(columns) = self.columns {
            if columns == 0 {
                return Err(LayoutError::InvalidColumns(columns));
            }
        }
        if let Some(radius) = self.radius {
            if !radius.is_finite() || radius <= 0.0 {
                return Err(LayoutError::InvalidRadius(radius));
            }
        }
        Ok(())
    }
}

// =============================================================================
// ENTRY POINT
// =============================================================================

/// Compute placements for `kind`, then run the alignment pass when one is
/// requested. Stack applies its alignment itself.
///
/// # Errors
///
/// Returns a validation error for out-of-range parameters.
pub fn arrange(kind: LayoutKind, items: &[LayoutItem], params: &LayoutParams) -> Result<Vec<Placement>, LayoutError> {
    params.validate()?;

    let placements = match kind {
        LayoutKind::Horizontal => distribute(items, params.spacing, Axis::X),
        LayoutKind::Vertical => distribute(items, params.spacing, Axis::Y),
        LayoutKind::Grid => grid(items, params.columns.unwrap_or_else(|| default_columns(items.len())), spacing_or_default(params)),
        LayoutKind::Circular => circular(items, params.radius.unwrap_or(DEFAULT_RADIUS)),
        LayoutKind::Stack => return Ok(stack(items, spacing_or_default(params), params.alignment)),
    };

    match params.alignment {
        Some(alignment) => Ok(align(&apply(items, &placements), alignment)),
        None => Ok(placements),
    }
}

fn spacing_or_default(params: &LayoutParams) -> f64 {
    params.spacing.unwrap_or(DEFAULT_SPACING)
}

/// Square-ish grid: ceil(sqrt(n)) columns.
fn default_columns(count: usize) -> usize {
    let mut columns = 1;
    while columns * columns < count {
        columns += 1;
    }
    columns
}

/// Move each item to its placement. Items without a placement keep their position.
#[must_use]
pub fn apply(items: &[LayoutItem], placements: &[Placement]) -> Vec<LayoutItem> {
    items
        .iter()
        .map(|item| {
            let Some(p) = placements.iter().find(|p| p.id == item.id) else {
                return *item;
            };
            LayoutItem { x: p.x, y: p.y, ..*item }
        })
        .collect()
}

// =============================================================================
// LINEAR DISTRIBUTION
// =============================================================================

#[derive(Clone, Copy)]
enum Axis {
    X,
    Y,
}

impl Axis {
    fn pos(self, item: &LayoutItem) -> f64 {
        match self {
            Axis::X => item.x,
            Axis::Y => item.y,
        }
    }

    fn extent(self, item: &LayoutItem) -> f64 {
        match self {
            Axis::X => item.width,
            Axis::Y => item.height,
        }
    }

    fn place(self, item: &LayoutItem, pos: f64) -> Placement {
        match self {
            Axis::X => Placement { id: item.id, x: pos, y: item.y },
            Axis::Y => Placement { id: item.id, x: item.x, y: pos },
        }
    }
}

/// Sequential placement along one axis. With a fixed spacing, items are laid
/// out in submission order from the set's leading edge. Without one, items
/// keep their spatial order and the gaps are equalized between the leading
/// and trailing extremes, which stay put.
fn distribute(items: &[LayoutItem], spacing: Option<f64>, axis: Axis) -> Vec<Placement> {
    let Some(start) = items.iter().map(|i| axis.pos(i)).reduce(f64::min) else {
        return Vec::new();
    };

    if let Some(spacing) = spacing {
        let mut cursor = start;
        return items
            .iter()
            .map(|item| {
                let placement = axis.place(item, cursor);
                cursor += axis.extent(item) + spacing;
                placement
            })
            .collect();
    }

    if items.len() < 2 {
        return items.iter().map(|i| axis.place(i, axis.pos(i))).collect();
    }

    let end = items
        .iter()
        .map(|i| axis.pos(i) + axis.extent(i))
        .fold(f64::NEG_INFINITY, f64::max);
    let occupied: f64 = items.iter().map(|i| axis.extent(i)).sum();
    #[allow(clippy::cast_precision_loss)]
    let gap = (end - start - occupied) / (items.len() - 1) as f64;

    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| axis.pos(&items[a]).total_cmp(&axis.pos(&items[b])));

    let mut positions = vec![0.0; items.len()];
    let mut cursor = start;
    for idx in order {
        positions[idx] = cursor;
        cursor += axis.extent(&items[idx]) + gap;
    }

    items
        .iter()
        .zip(positions)
        .map(|(item, pos)| axis.place(item, pos))
        .collect()
}

// =============================================================================
// GRID
// =============================================================================

/// Row-major grid anchored at the set's top-left corner. Pitch is the largest
/// width (height) in the set plus `spacing`.
fn grid(items: &[LayoutItem], columns: usize, spacing: f64) -> Vec<Placement> {
    let Some(bounds) = Bounds::of(items) else {
        return Vec::new();
    };
    let columns = columns.max(1);
    let cell_w = items.iter().map(|i| i.width).fold(0.0, f64::max);
    let cell_h = items.iter().map(|i| i.height).fold(0.0, f64::max);
    let pitch_x = cell_w + spacing;
    let pitch_y = cell_h + spacing;

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            #[allow(clippy::cast_precision_loss)]
            let (row, col) = ((i / columns) as f64, (i % columns) as f64);
            Placement { id: item.id, x: bounds.min_x + col * pitch_x, y: bounds.min_y + row * pitch_y }
        })
        .collect()
}

// =============================================================================
// CIRCULAR
// =============================================================================

fn circular(items: &[LayoutItem], radius: f64) -> Vec<Placement> {
    if items.is_empty() {
        return Vec::new();
    }
    #[allow(clippy::cast_precision_loss)]
    let n = items.len() as f64;
    let cx = items.iter().map(|i| i.x + i.width / 2.0).sum::<f64>() / n;
    let cy = items.iter().map(|i| i.y + i.height / 2.0).sum::<f64>() / n;

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            #[allow(clippy::cast_precision_loss)]
            let theta = TAU * i as f64 / n;
            let center_x = cx + radius * theta.cos();
            let center_y = cy + radius * theta.sin();
            Placement { id: item.id, x: center_x - item.width / 2.0, y: center_y - item.height / 2.0 }
        })
        .collect()
}

// =============================================================================
// STACK
// =============================================================================

fn stack(items: &[LayoutItem], spacing: f64, alignment: Option<Alignment>) -> Vec<Placement> {
    let placements = distribute(items, Some(spacing), Axis::Y);
    match alignment {
        Some(alignment) => align(&apply(items, &placements), alignment),
        None => placements,
    }
}

// =============================================================================
// ALIGNMENT
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Bounds {
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
}

impl Bounds {
    fn of(items: &[LayoutItem]) -> Option<Self> {
        let first = items.first()?;
        let init = Self { min_x: first.x, min_y: first.y, max_x: first.x + first.width, max_y: first.y + first.height };
        Some(items.iter().skip(1).fold(init, |b, i| Self {
            min_x: b.min_x.min(i.x),
            min_y: b.min_y.min(i.y),
            max_x: b.max_x.max(i.x + i.width),
            max_y: b.max_y.max(i.y + i.height),
        }))
    }
}

/// Snap one coordinate of every item to a shared edge or center line of the
/// set's bounding box; the other coordinate is untouched.
#[must_use]
pub fn align(items: &[LayoutItem], alignment: Alignment) -> Vec<Placement> {
    let Some(b) = Bounds::of(items) else {
        return Vec::new();
    };
    let center_x = (b.min_x + b.max_x) / 2.0;
    let center_y = (b.min_y + b.max_y) / 2.0;

    items
        .iter()
        .map(|item| {
            let (x, y) = match alignment {
                Alignment::Left => (b.min_x, item.y),
                Alignment::Center => (center_x - item.width / 2.0, item.y),
                Alignment::Right => (b.max_x - item.width, item.y),
                Alignment::Top => (item.x, b.min_y),
                Alignment::Middle => (item.x, center_y - item.height / 2.0),
                Alignment::Bottom => (item.x, b.max_y - item.height),
            };
            Placement { id: item.id, x, y }
        })
        .collect()
}

#[cfg(test)]
#[path = "layout_test.rs"]
mod tests;

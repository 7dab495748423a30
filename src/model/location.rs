use std::fmt;

use serde::{Deserialize, Serialize};

use super::NO_POSITION;
use crate::types::{Audit, LocationId};

/// Kind of storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    /// A site building.
    Building,
    /// A room inside a building.
    Room,
    /// A freezer or fridge.
    Freezer,
    /// A liquid nitrogen tank.
    Tank,
    /// A shelf inside a freezer or room.
    Shelf,
    /// A rack holding boxes.
    Rack,
    /// A storage box, usually gridded.
    Box,
    /// A multi-well plate.
    Plate,
}

impl LocationType {
    /// Stable lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            LocationType::Building => "building",
            LocationType::Room => "room",
            LocationType::Freezer => "freezer",
            LocationType::Tank => "tank",
            LocationType::Shelf => "shelf",
            LocationType::Rack => "rack",
            LocationType::Box => "box",
            LocationType::Plate => "plate",
        }
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Visibility of a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privacy {
    /// Same as the parent.
    #[default]
    Inherited,
    /// Visible to everyone.
    Public,
    /// Readable by everyone, editable by the owning group.
    Protected,
    /// Visible to the owning group only.
    Private,
}

impl Privacy {
    /// Whether this privacy needs an owning group.
    pub fn is_restricted(self) -> bool {
        matches!(self, Privacy::Protected | Privacy::Private)
    }
}

/// How grid positions are labelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Labeling {
    /// No position tracking.
    #[default]
    None,
    /// Row letter plus column number (`A1`, `B03`).
    Alpha,
    /// One-based running number.
    Numeric,
}

/// A hierarchical storage node, optionally laid out as a grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Row id.
    pub id: LocationId,
    /// Name, unique among siblings.
    pub name: String,
    /// Scan code; allocated on first save when missing.
    #[serde(default)]
    pub code: Option<String>,
    /// Kind of node; required.
    #[serde(default)]
    pub location_type: Option<LocationType>,
    /// Enclosing location.
    #[serde(default)]
    pub parent: Option<LocationId>,
    /// Visibility.
    #[serde(default)]
    pub privacy: Privacy,
    /// Group owning a protected or private location.
    #[serde(default)]
    pub owner_group: Option<String>,
    /// Position labelling mode.
    #[serde(default)]
    pub labeling: Labeling,
    /// Grid rows.
    #[serde(default)]
    pub rows: i32,
    /// Grid columns.
    #[serde(default)]
    pub cols: i32,
    /// Audit stamps; `None` until the first save.
    #[serde(default)]
    pub audit: Option<Audit>,
}

impl Location {
    /// Creates an unsaved, ungridded location.
    pub fn new(id: LocationId, name: impl Into<String>, location_type: LocationType) -> Self {
        Self {
            id,
            name: name.into(),
            code: None,
            location_type: Some(location_type),
            parent: None,
            privacy: Privacy::Inherited,
            owner_group: None,
            labeling: Labeling::None,
            rows: 0,
            cols: 0,
            audit: None,
        }
    }

    /// Nests the location under `parent`.
    pub fn within(mut self, parent: LocationId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Lays the location out as a `rows` x `cols` grid.
    pub fn with_grid(mut self, labeling: Labeling, rows: i32, cols: i32) -> Self {
        self.labeling = labeling;
        self.rows = rows;
        self.cols = cols;
        self
    }

    /// Restricts the location to `group`.
    pub fn owned_by(mut self, privacy: Privacy, group: impl Into<String>) -> Self {
        self.privacy = privacy;
        self.owner_group = Some(group.into());
        self
    }

    /// Whether positions are tracked.
    pub fn has_grid(&self) -> bool {
        self.labeling != Labeling::None && self.rows > 0 && self.cols > 0
    }

    /// Number of slots, zero without a grid.
    pub fn capacity(&self) -> i32 {
        if self.has_grid() {
            self.rows.saturating_mul(self.cols)
        } else {
            0
        }
    }

    /// Zero-based (row, col) of `pos`.
    pub fn row_col(&self, pos: i32) -> Option<(i32, i32)> {
        if pos < 0 || self.cols <= 0 {
            return None;
        }
        Some((pos / self.cols, pos % self.cols))
    }

    /// Slot index of (row, col), if inside the grid.
    pub fn pos_of(&self, row: i32, col: i32) -> Option<i32> {
        if row < 0 || col < 0 || row >= self.rows || col >= self.cols {
            return None;
        }
        Some(row * self.cols + col)
    }

    /// Human label of `pos` (`B03` or `8`).
    pub fn format_position(&self, pos: i32) -> String {
        if pos == NO_POSITION || !self.has_grid() {
            return String::new();
        }
        match self.labeling {
            Labeling::None => String::new(),
            Labeling::Numeric => (pos + 1).to_string(),
            Labeling::Alpha => match self.row_col(pos) {
                Some((row, col)) => {
                    let width = self.cols.to_string().len();
                    format!("{}{:0width$}", row_label(row), col + 1, width = width)
                }
                None => String::new(),
            },
        }
    }

    /// Parses a human label back into a slot index.
    pub fn parse_position(&self, label: &str) -> Option<i32> {
        let label = label.trim();
        if !self.has_grid() || label.is_empty() {
            return None;
        }
        let pos = match self.labeling {
            Labeling::None => return None,
            Labeling::Numeric => label.parse::<i32>().ok()? - 1,
            Labeling::Alpha => {
                let split = label
                    .find(|c: char| c.is_ascii_digit())
                    .filter(|&idx| idx > 0)?;
                let (letters, digits) = label.split_at(split);
                let row = parse_row_label(letters)?;
                let col = digits.parse::<i32>().ok()? - 1;
                self.pos_of(row, col)?
            }
        };
        (0..self.capacity()).contains(&pos).then_some(pos)
    }
}

fn row_label(row: i32) -> String {
    let mut n = row + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn parse_row_label(letters: &str) -> Option<i32> {
    let mut row: i32 = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        let digit = (c.to_ascii_uppercase() as u8 - b'A') as i32 + 1;
        row = row.checked_mul(26)?.checked_add(digit)?;
    }
    Some(row - 1)
}

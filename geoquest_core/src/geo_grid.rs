//! The "GRID" Engine - Planar square cells anchored at a fixed origin
//!
//! Discretizes the explored world into fixed-size square cells:
//! - Offsets from the origin are projected to local meters with a
//!   flat-earth approximation (fine at city scale)
//! - Each axis is floored by the cell edge, so every coordinate maps to
//!   exactly one cell and boundary points belong to the cell they open

use geo::{Coord, LineString, Point, Polygon};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Meters per degree of latitude (and of longitude at the equator).
pub const METERS_PER_DEGREE: f64 = 111_320.0;

// ============================================================================
// COORDINATE
// ============================================================================

/// A WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

impl From<Coordinate> for Point<f64> {
    fn from(c: Coordinate) -> Self {
        Point::new(c.lng, c.lat)
    }
}

impl From<Coordinate> for Coord<f64> {
    fn from(c: Coordinate) -> Self {
        Coord { x: c.lng, y: c.lat }
    }
}

// ============================================================================
// CELL ID
// ============================================================================

/// Integer grid indices of a cell: `x` grows eastward, `y` northward.
///
/// The canonical text form is `"x_y"`, which is also the key the durable
/// store keeps in the visited-cell list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId {
    pub x: i64,
    pub y: i64,
}

impl CellId {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.x, self.y)
    }
}

/// Returned when a stored cell key is not of the form `"x_y"`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid cell id: {0:?}")]
pub struct CellIdParseError(pub String);

impl FromStr for CellId {
    type Err = CellIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split on the last '_' so negative x indices ("-3_7") parse too.
        let (x, y) = s
            .rsplit_once('_')
            .ok_or_else(|| CellIdParseError(s.to_string()))?;
        let x = x.parse().map_err(|_| CellIdParseError(s.to_string()))?;
        let y = y.parse().map_err(|_| CellIdParseError(s.to_string()))?;
        Ok(Self { x, y })
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the GeoGrid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Anchor of cell (0, 0): its south-west corner
    pub origin: Coordinate,

    /// Cell edge length in meters (default: 50.0)
    pub cell_size_meters: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            origin: Coordinate::new(45.75372, 21.22571),
            cell_size_meters: 50.0,
        }
    }
}

// ============================================================================
// GEO GRID
// ============================================================================

/// Stateless mapping between coordinates and cells.
#[derive(Debug, Clone)]
pub struct GeoGrid {
    config: GridConfig,

    /// Longitude scale at the origin latitude, computed once
    meters_per_degree_lng: f64,
}

impl GeoGrid {
    pub fn new(config: GridConfig) -> Self {
        let meters_per_degree_lng = METERS_PER_DEGREE * config.origin.lat.to_radians().cos();
        Self {
            config,
            meters_per_degree_lng,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(GridConfig::default())
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Maps a coordinate to the cell containing it.
    ///
    /// Total: non-finite input saturates to a well-defined (if meaningless)
    /// cell instead of failing.
    pub fn cell_of(&self, p: Coordinate) -> CellId {
        let (east, north) = self.to_local_meters(p);
        let size = self.config.cell_size_meters;
        CellId {
            x: (east / size).floor() as i64,
            y: (north / size).floor() as i64,
        }
    }

    /// Geometric center of a cell.
    pub fn center_of(&self, cell: CellId) -> Coordinate {
        let size = self.config.cell_size_meters;
        self.from_local_meters((cell.x as f64 + 0.5) * size, (cell.y as f64 + 0.5) * size)
    }

    /// Corners of a cell in NW, NE, SE, SW order.
    pub fn polygon_of(&self, cell: CellId) -> [Coordinate; 4] {
        let size = self.config.cell_size_meters;
        let west = cell.x as f64 * size;
        let east = (cell.x as f64 + 1.0) * size;
        let south = cell.y as f64 * size;
        let north = (cell.y as f64 + 1.0) * size;

        [
            self.from_local_meters(west, north),
            self.from_local_meters(east, north),
            self.from_local_meters(east, south),
            self.from_local_meters(west, south),
        ]
    }

    /// Closed footprint polygon of a cell, for containment tests and rendering.
    pub fn footprint(&self, cell: CellId) -> Polygon<f64> {
        let ring: Vec<Coord<f64>> = self.polygon_of(cell).into_iter().map(Coord::from).collect();
        Polygon::new(LineString::from(ring), vec![])
    }

    /// Flat-earth projection relative to the origin: (east, north) in meters.
    fn to_local_meters(&self, p: Coordinate) -> (f64, f64) {
        let origin = self.config.origin;
        let east = (p.lng - origin.lng) * self.meters_per_degree_lng;
        let north = (p.lat - origin.lat) * METERS_PER_DEGREE;
        (east, north)
    }

    fn from_local_meters(&self, east: f64, north: f64) -> Coordinate {
        let origin = self.config.origin;
        Coordinate {
            lat: origin.lat + north / METERS_PER_DEGREE,
            lng: origin.lng + east / self.meters_per_degree_lng,
        }
    }
}

impl Default for GeoGrid {
    fn default() -> Self {
        Self::with_defaults()
    }
}

//! Polyline representation for route geometries.
//!
//! The routing service returns GeoJSON `[lng, lat]` pairs; they are decoded
//! once at the boundary into [`Coordinates`].

use serde::{Deserialize, Serialize};

use crate::model::Coordinates;

/// A route geometry as decoded coordinates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Polyline {
    points: Vec<Coordinates>,
}

impl Polyline {
    pub fn new(points: Vec<Coordinates>) -> Self {
        Self { points }
    }

    /// Builds a polyline from GeoJSON positions (`[lng, lat]`).
    pub fn from_lng_lat(positions: &[[f64; 2]]) -> Self {
        Self::new(
            positions
                .iter()
                .map(|[lng, lat]| Coordinates::new(*lat, *lng))
                .collect(),
        )
    }

    pub fn points(&self) -> &[Coordinates] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

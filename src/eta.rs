//! Per-stop arrival estimates.
//!
//! The first stop is reached at the route start time. Each later stop adds
//! the leg travel time plus a fixed dwell at the previous stop.

use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::haversine::{DEFAULT_SPEED_KMH, HaversineMatrix, haversine_km};
use crate::model::RouteStop;

pub const DEFAULT_DWELL_MINUTES: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct ArrivalEstimator {
    pub dwell_minutes: f64,
    pub speed_kmh: f64,
}

impl Default for ArrivalEstimator {
    fn default() -> Self {
        Self {
            dwell_minutes: DEFAULT_DWELL_MINUTES,
            speed_kmh: DEFAULT_SPEED_KMH,
        }
    }
}

/// Where leg durations came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegSource {
    Routing,
    Haversine,
}

#[derive(Debug, Clone)]
pub struct ArrivalPlan {
    /// One estimate per stop, in sequence order.
    pub arrivals: Vec<NaiveDateTime>,
    pub travel_minutes: f64,
    pub leg_source: LegSource,
}

impl ArrivalPlan {
    /// Travel plus dwell at every stop, rounded up to whole minutes.
    pub fn total_minutes(&self, dwell_minutes: f64) -> u32 {
        let stops = self.arrivals.len() as f64;
        let total = (self.travel_minutes + dwell_minutes * stops).ceil();
        if total <= 0.0 { 0 } else { total as u32 }
    }
}

impl ArrivalEstimator {
    /// Estimates arrivals for `stops` in order.
    ///
    /// `legs` holds minutes between consecutive stops; it is used only when
    /// it has exactly one entry per leg.
    pub fn estimate(
        &self,
        stops: &[RouteStop],
        start: NaiveDateTime,
        legs: Option<&[f64]>,
    ) -> ArrivalPlan {
        let expected_legs = stops.len().saturating_sub(1);
        let (legs, leg_source) = match legs {
            Some(legs) if legs.len() == expected_legs => (legs.to_vec(), LegSource::Routing),
            other => {
                if let Some(legs) = other {
                    warn!(
                        expected = expected_legs,
                        got = legs.len(),
                        "leg count mismatch, estimating with haversine"
                    );
                }
                (self.haversine_legs(stops), LegSource::Haversine)
            }
        };

        let mut arrivals = Vec::with_capacity(stops.len());
        let mut current = start;
        for (index, _) in stops.iter().enumerate() {
            if index > 0 {
                let minutes = legs[index - 1] + self.dwell_minutes;
                current += minutes_delta(minutes);
            }
            arrivals.push(current);
        }

        ArrivalPlan {
            arrivals,
            travel_minutes: legs.iter().sum(),
            leg_source,
        }
    }

    /// Legs touching a stop without coordinates count as zero travel.
    fn haversine_legs(&self, stops: &[RouteStop]) -> Vec<f64> {
        let speed = HaversineMatrix::new(self.speed_kmh);
        stops
            .windows(2)
            .map(|pair| match (pair[0].coordinates, pair[1].coordinates) {
                (Some(from), Some(to)) => speed.km_to_minutes(haversine_km(from, to)),
                _ => 0.0,
            })
            .collect()
    }
}

fn minutes_delta(minutes: f64) -> TimeDelta {
    TimeDelta::seconds((minutes * 60.0).round() as i64)
}

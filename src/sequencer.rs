//! Stop sequencing for a single batch.
//!
//! With a travel matrix: nearest-neighbor construction followed by
//! first-improvement 2-opt. The tour starts at the collection point when its
//! coordinates are known (closed round trip), otherwise at the first stop
//! (open path). Position 0 is never moved by 2-opt.
//!
//! Without a matrix, or when any stop lacks coordinates: ZIP-contiguous
//! lexical ordering refined by Haversine nearest-neighbor.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::haversine::haversine_km;
use crate::matrix::{MatrixService, TravelMatrix};
use crate::model::{Coordinates, RouteStop, extract_zip};

/// Moves cheaper than this are treated as no improvement.
const IMPROVEMENT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct SequenceOptions {
    /// Upper bound on accepted 2-opt moves per route.
    pub max_two_opt_moves: usize,
}

impl Default for SequenceOptions {
    fn default() -> Self {
        Self {
            max_two_opt_moves: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceMethod {
    /// Fewer than two stops; nothing to order.
    Trivial,
    Matrix,
    Fallback,
}

/// Stops in visiting order. Sequence number is the 1-based position.
#[derive(Debug, Clone)]
pub struct SequencedRoute {
    pub stops: Vec<RouteStop>,
    pub method: SequenceMethod,
    /// Minutes between consecutive stops, from the matrix when one was used.
    pub leg_minutes: Option<Vec<f64>>,
    /// Kilometers along the stop sequence, from the matrix when one was used.
    pub distance_km: Option<f64>,
}

impl SequencedRoute {
    /// `(sequence_number, stop)` pairs, numbered from 1.
    pub fn numbered(&self) -> impl Iterator<Item = (u32, &RouteStop)> {
        (1u32..).zip(self.stops.iter())
    }
}

pub struct RouteSequencer<'a> {
    matrices: &'a MatrixService,
    options: SequenceOptions,
}

impl<'a> RouteSequencer<'a> {
    pub fn new(matrices: &'a MatrixService, options: SequenceOptions) -> Self {
        Self { matrices, options }
    }

    pub fn sequence(&self, depot: Option<Coordinates>, stops: Vec<RouteStop>) -> SequencedRoute {
        if stops.len() < 2 {
            return SequencedRoute {
                stops,
                method: SequenceMethod::Trivial,
                leg_minutes: None,
                distance_km: None,
            };
        }

        let coordinates: Option<Vec<Coordinates>> =
            stops.iter().map(|stop| stop.coordinates).collect();
        let Some(coordinates) = coordinates else {
            warn!(stops = stops.len(), "stops missing coordinates, using fallback sequencing");
            return fallback_route(stops);
        };

        let offset = usize::from(depot.is_some());
        let locations: Vec<Coordinates> = depot.into_iter().chain(coordinates).collect();
        match self.matrices.matrix_for(&locations) {
            Some(matrix) => self.matrix_route(&matrix, offset, stops),
            None => fallback_route(stops),
        }
    }

    fn matrix_route(&self, matrix: &TravelMatrix, offset: usize, stops: Vec<RouteStop>) -> SequencedRoute {
        let cost = |from: usize, to: usize| matrix.duration(from, to);
        let closed = offset > 0;

        let mut tour = nearest_neighbor(matrix.size(), 0, cost);
        let initial = tour_cost(&tour, cost, closed);
        let moves = two_opt(&mut tour, cost, closed, self.options.max_two_opt_moves);
        debug!(
            stops = stops.len(),
            initial_minutes = initial,
            improved_minutes = tour_cost(&tour, cost, closed),
            moves,
            "sequenced with travel matrix"
        );

        let order: Vec<usize> = tour
            .into_iter()
            .filter(|&node| node >= offset)
            .map(|node| node - offset)
            .collect();
        let leg_minutes = order
            .windows(2)
            .map(|pair| matrix.duration(pair[0] + offset, pair[1] + offset))
            .collect();
        let distance_km = order
            .windows(2)
            .map(|pair| matrix.distance(pair[0] + offset, pair[1] + offset))
            .sum();

        SequencedRoute {
            stops: reorder(stops, &order),
            method: SequenceMethod::Matrix,
            leg_minutes: Some(leg_minutes),
            distance_km: Some(distance_km),
        }
    }
}

fn reorder(stops: Vec<RouteStop>, order: &[usize]) -> Vec<RouteStop> {
    let mut slots: Vec<Option<RouteStop>> = stops.into_iter().map(Some).collect();
    order
        .iter()
        .filter_map(|&index| slots.get_mut(index).and_then(Option::take))
        .collect()
}

/// Total cost of visiting `tour` in order, returning to the start when `closed`.
pub fn tour_cost(tour: &[usize], cost: impl Fn(usize, usize) -> f64, closed: bool) -> f64 {
    let path: f64 = tour.windows(2).map(|pair| cost(pair[0], pair[1])).sum();
    match (closed, tour.first(), tour.last()) {
        (true, Some(&first), Some(&last)) if tour.len() > 1 => path + cost(last, first),
        _ => path,
    }
}

/// Greedy tour over `0..size` starting at `start`. Ties go to the lowest index.
pub fn nearest_neighbor(size: usize, start: usize, cost: impl Fn(usize, usize) -> f64) -> Vec<usize> {
    if size == 0 || start >= size {
        return Vec::new();
    }
    let mut visited = vec![false; size];
    let mut tour = Vec::with_capacity(size);
    visited[start] = true;
    tour.push(start);
    let mut current = start;

    while tour.len() < size {
        let next = (0..size)
            .filter(|&candidate| !visited[candidate])
            .min_by(|&a, &b| cost(current, a).total_cmp(&cost(current, b)));
        let Some(next) = next else { break };
        visited[next] = true;
        tour.push(next);
        current = next;
    }

    tour
}

/// First-improvement 2-opt. Returns the number of accepted moves.
///
/// Each move reverses `tour[i + 1..=j]` and strictly lowers [`tour_cost`], so
/// the loop terminates; `max_moves` bounds it for very large tours.
pub fn two_opt(
    tour: &mut [usize],
    cost: impl Fn(usize, usize) -> f64,
    closed: bool,
    max_moves: usize,
) -> usize {
    let mut moves = 0;
    while moves < max_moves {
        let Some((i, j)) = first_improving_move(tour, &cost, closed) else {
            break;
        };
        tour[i + 1..=j].reverse();
        moves += 1;
    }
    moves
}

fn first_improving_move(
    tour: &[usize],
    cost: &impl Fn(usize, usize) -> f64,
    closed: bool,
) -> Option<(usize, usize)> {
    let n = tour.len();
    if n < 3 {
        return None;
    }
    for i in 0..n - 2 {
        for j in i + 2..n {
            if reversal_delta(tour, cost, closed, i, j) < -IMPROVEMENT_EPSILON {
                return Some((i, j));
            }
        }
    }
    None
}

/// Cost change from reversing `tour[i + 1..=j]`.
///
/// The boundary edges `(a, b)` and `(c, d)` become `(a, c)` and `(b, d)`.
/// Interior edges flip direction, which only matters for asymmetric costs.
fn reversal_delta(
    tour: &[usize],
    cost: &impl Fn(usize, usize) -> f64,
    closed: bool,
    i: usize,
    j: usize,
) -> f64 {
    let (a, b, c) = (tour[i], tour[i + 1], tour[j]);
    let d = match tour.get(j + 1) {
        Some(&next) => Some(next),
        None if closed => Some(tour[0]),
        None => None,
    };

    let mut delta = cost(a, c) - cost(a, b);
    if let Some(d) = d {
        delta += cost(b, d) - cost(c, d);
    }
    for k in i + 1..j {
        delta += cost(tour[k + 1], tour[k]) - cost(tour[k], tour[k + 1]);
    }
    delta
}

fn zip_key(stop: &RouteStop) -> Option<String> {
    stop.zip.clone().or_else(|| extract_zip(&stop.address))
}

/// Orders stops without a travel matrix.
///
/// Sorts by (ZIP, address), then walks nearest-neighbor by Haversine from the
/// first stop. A stop without coordinates is taken as soon as the scan
/// reaches it; after such a stop the next stop in sorted order follows.
pub fn fallback_order(mut stops: Vec<RouteStop>) -> Vec<RouteStop> {
    stops.sort_by(|a, b| {
        let (za, zb) = (zip_key(a), zip_key(b));
        (za.is_none(), za, &a.address).cmp(&(zb.is_none(), zb, &b.address))
    });
    if stops.len() < 2 {
        return stops;
    }

    let mut remaining = stops;
    let mut ordered = Vec::with_capacity(remaining.len());
    ordered.push(remaining.remove(0));

    while !remaining.is_empty() {
        let current = ordered.last().and_then(|stop: &RouteStop| stop.coordinates);
        let next = match current {
            Some(from) => nearest_by_haversine(from, &remaining),
            None => 0,
        };
        ordered.push(remaining.remove(next));
    }

    ordered
}

fn nearest_by_haversine(from: Coordinates, candidates: &[RouteStop]) -> usize {
    let mut best = (0, f64::INFINITY);
    for (index, candidate) in candidates.iter().enumerate() {
        match candidate.coordinates {
            None => return index,
            Some(to) => {
                let km = haversine_km(from, to);
                if km < best.1 {
                    best = (index, km);
                }
            }
        }
    }
    best.0
}

fn fallback_route(stops: Vec<RouteStop>) -> SequencedRoute {
    SequencedRoute {
        stops: fallback_order(stops),
        method: SequenceMethod::Fallback,
        leg_minutes: None,
        distance_km: None,
    }
}

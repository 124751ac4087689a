//! Travel matrices and the cached distance/duration lookup.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::model::Coordinates;
use crate::polyline::Polyline;
use crate::traits::DistanceMatrixProvider;

/// How long a fetched matrix stays reusable.
pub const MATRIX_TTL: Duration = Duration::from_secs(30 * 60);

/// Coordinate rounding applied to cache keys (about 11 m at 4 decimals).
pub const DEFAULT_KEY_PRECISION: usize = 4;

/// Square matrices of travel durations (minutes) and distances (km).
///
/// May be asymmetric; `duration(i, j)` is the trip from `i` to `j`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TravelMatrix {
    durations: Vec<Vec<f64>>,
    distances: Vec<Vec<f64>>,
}

impl TravelMatrix {
    /// Validates that both matrices are square, the same size, and finite.
    pub fn new(durations: Vec<Vec<f64>>, distances: Vec<Vec<f64>>) -> Option<Self> {
        let n = durations.len();
        let square = |m: &Vec<Vec<f64>>| {
            m.len() == n && m.iter().all(|row| row.len() == n && row.iter().all(|v| v.is_finite()))
        };
        if square(&durations) && square(&distances) {
            Some(Self::from_square(durations, distances))
        } else {
            None
        }
    }

    pub(crate) fn from_square(durations: Vec<Vec<f64>>, distances: Vec<Vec<f64>>) -> Self {
        Self {
            durations,
            distances,
        }
    }

    pub fn size(&self) -> usize {
        self.durations.len()
    }

    pub fn duration(&self, from: usize, to: usize) -> f64 {
        self.durations[from][to]
    }

    pub fn distance(&self, from: usize, to: usize) -> f64 {
        self.distances[from][to]
    }
}

/// One leg of a detailed route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteLeg {
    pub distance_km: f64,
    pub duration_minutes: f64,
}

/// A detailed route through locations in a fixed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSummary {
    pub distance_km: f64,
    pub duration_minutes: f64,
    pub geometry: Polyline,
    pub legs: Vec<RouteLeg>,
}

/// Deterministic cache key from rounded coordinates.
pub fn matrix_cache_key(locations: &[Coordinates], precision: usize) -> String {
    let coords = locations
        .iter()
        .map(|c| format!("{:.*},{:.*}", precision, c.lat, precision, c.lng))
        .collect::<Vec<_>>()
        .join(";");
    format!("matrix:{coords}")
}

/// Routing-service matrix lookup with caching.
///
/// Returns `None` on any failure; callers fall back to analytic distances.
pub struct MatrixService {
    provider: Option<Arc<dyn DistanceMatrixProvider>>,
    cache: Arc<TtlCache<TravelMatrix>>,
    ttl: Duration,
    precision: usize,
}

impl MatrixService {
    pub fn new(
        provider: Option<Arc<dyn DistanceMatrixProvider>>,
        cache: Arc<TtlCache<TravelMatrix>>,
    ) -> Self {
        Self {
            provider,
            cache,
            ttl: MATRIX_TTL,
            precision: DEFAULT_KEY_PRECISION,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    pub fn matrix_for(&self, locations: &[Coordinates]) -> Option<TravelMatrix> {
        if locations.len() < 2 {
            return None;
        }
        let provider = self.provider.as_ref()?;

        let key = matrix_cache_key(locations, self.precision);
        if let Some(matrix) = self.cache.get(&key) {
            debug!(size = matrix.size(), "matrix cache hit");
            return Some(matrix);
        }

        match provider.matrix_for(locations) {
            Ok(matrix) if matrix.size() == locations.len() => {
                self.cache.set(key, matrix.clone(), self.ttl);
                Some(matrix)
            }
            Ok(matrix) => {
                warn!(
                    expected = locations.len(),
                    got = matrix.size(),
                    "routing matrix size mismatch, using fallback"
                );
                None
            }
            Err(err) => {
                warn!(error = %err, "routing matrix unavailable, using fallback");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::ProviderError;
    use crate::haversine::HaversineMatrix;

    struct CountingProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    impl DistanceMatrixProvider for CountingProvider {
        fn matrix_for(&self, locations: &[Coordinates]) -> Result<TravelMatrix, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Code {
                    service: "routing",
                    code: "NoTable".to_string(),
                });
            }
            Ok(HaversineMatrix::default().matrix(locations))
        }
    }

    fn service(fail: bool) -> (Arc<CountingProvider>, MatrixService) {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            fail,
        });
        let service = MatrixService::new(Some(provider.clone()), Arc::new(TtlCache::new()));
        (provider, service)
    }

    fn points() -> Vec<Coordinates> {
        vec![Coordinates::new(40.71281, -74.00601), Coordinates::new(40.75, -73.99)]
    }

    #[test]
    fn new_rejects_ragged_and_non_finite() {
        assert!(TravelMatrix::new(vec![vec![0.0, 1.0]], vec![vec![0.0, 1.0]]).is_none());
        assert!(
            TravelMatrix::new(
                vec![vec![0.0, f64::NAN], vec![1.0, 0.0]],
                vec![vec![0.0, 1.0], vec![1.0, 0.0]]
            )
            .is_none()
        );
        assert!(
            TravelMatrix::new(
                vec![vec![0.0, 2.0], vec![3.0, 0.0]],
                vec![vec![0.0, 1.0], vec![1.0, 0.0]]
            )
            .is_some()
        );
    }

    #[test]
    fn cache_key_rounds_coordinates() {
        let a = matrix_cache_key(&[Coordinates::new(40.712811, -74.006012)], 4);
        let b = matrix_cache_key(&[Coordinates::new(40.712849, -74.005998)], 4);
        assert_eq!(a, b);
        assert_eq!(a, "matrix:40.7128,-74.0060");
    }

    #[test]
    fn second_lookup_hits_cache() {
        let (provider, service) = service(false);
        assert!(service.matrix_for(&points()).is_some());
        assert!(service.matrix_for(&points()).is_some());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_returns_none_and_is_not_cached() {
        let (provider, service) = service(true);
        assert!(service.matrix_for(&points()).is_none());
        assert!(service.matrix_for(&points()).is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fewer_than_two_locations_skips_provider() {
        let (provider, service) = service(false);
        assert!(service.matrix_for(&points()[..1]).is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_provider_returns_none() {
        let service = MatrixService::new(None, Arc::new(TtlCache::new()));
        assert!(service.matrix_for(&points()).is_none());
    }
}

//! OSRM HTTP adapter for travel matrices and detailed routes.
//!
//! Durations arrive in seconds and distances in meters; both are converted to
//! minutes and kilometers here so the rest of the crate never sees raw units.

use serde::Deserialize;

use crate::error::ProviderError;
use crate::matrix::{RouteLeg, RouteSummary, TravelMatrix};
use crate::model::Coordinates;
use crate::polyline::Polyline;
use crate::traits::{DistanceMatrixProvider, RouteProvider};

const SERVICE: &str = "routing";

#[derive(Debug, Clone)]
pub struct OsrmConfig {
    pub base_url: String,
    pub profile: String,
    pub timeout_secs: u64,
}

impl Default for OsrmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            profile: "car".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OsrmClient {
    config: OsrmConfig,
    client: reqwest::blocking::Client,
}

impl OsrmClient {
    pub fn new(config: OsrmConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn url(&self, service: &str, locations: &[Coordinates], query: &str) -> String {
        format!(
            "{}/{}/v1/{}/{}?{}",
            self.config.base_url.trim_end_matches('/'),
            service,
            self.config.profile,
            coordinate_path(locations),
            query
        )
    }

    fn get<T: for<'de> Deserialize<'de>>(&self, url: String) -> Result<T, ProviderError> {
        self.client
            .get(url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.json::<T>())
            .map_err(|err| ProviderError::from_reqwest(SERVICE, err))
    }
}

/// OSRM expects `lng,lat` pairs joined by semicolons.
fn coordinate_path(locations: &[Coordinates]) -> String {
    locations
        .iter()
        .map(|c| format!("{:.6},{:.6}", c.lng, c.lat))
        .collect::<Vec<_>>()
        .join(";")
}

impl DistanceMatrixProvider for OsrmClient {
    fn matrix_for(&self, locations: &[Coordinates]) -> Result<TravelMatrix, ProviderError> {
        if locations.len() < 2 {
            return Err(ProviderError::InvalidInput(
                "matrix needs at least two locations".to_string(),
            ));
        }
        let url = self.url("table", locations, "annotations=duration,distance");
        let body: TableResponse = self.get(url)?;
        body.into_matrix()
    }
}

impl RouteProvider for OsrmClient {
    fn route_for(&self, locations: &[Coordinates]) -> Result<RouteSummary, ProviderError> {
        if locations.len() < 2 {
            return Err(ProviderError::InvalidInput(
                "route needs at least two locations".to_string(),
            ));
        }
        let url = self.url("route", locations, "overview=full&geometries=geojson&steps=false");
        let body: RouteResponse = self.get(url)?;
        body.into_summary()
    }
}

#[derive(Debug, Deserialize)]
struct TableResponse {
    code: String,
    durations: Option<Vec<Vec<Option<f64>>>>,
    distances: Option<Vec<Vec<Option<f64>>>>,
}

impl TableResponse {
    fn into_matrix(self) -> Result<TravelMatrix, ProviderError> {
        if self.code != "Ok" {
            return Err(ProviderError::Code {
                service: SERVICE,
                code: self.code,
            });
        }
        let durations = self.durations.ok_or(ProviderError::Empty(SERVICE))?;
        let distances = self.distances.ok_or(ProviderError::Empty(SERVICE))?;
        let durations = convert(durations, |secs| secs / 60.0)?;
        let distances = convert(distances, |meters| meters / 1000.0)?;
        TravelMatrix::new(durations, distances).ok_or_else(|| ProviderError::Decode {
            service: SERVICE,
            message: "table is not square".to_string(),
        })
    }
}

/// Unroutable pairs come back as `null`; the whole table is rejected.
fn convert(
    rows: Vec<Vec<Option<f64>>>,
    unit: impl Fn(f64) -> f64,
) -> Result<Vec<Vec<f64>>, ProviderError> {
    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .map(|value| {
                    value.map(&unit).ok_or_else(|| ProviderError::Decode {
                        service: SERVICE,
                        message: "unroutable location pair".to_string(),
                    })
                })
                .collect()
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct RouteResponse {
    code: String,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    distance: f64,
    duration: f64,
    geometry: Option<GeoJsonLine>,
    #[serde(default)]
    legs: Vec<OsrmLeg>,
}

#[derive(Debug, Deserialize)]
struct GeoJsonLine {
    coordinates: Vec<[f64; 2]>,
}

#[derive(Debug, Deserialize)]
struct OsrmLeg {
    distance: f64,
    duration: f64,
}

impl RouteResponse {
    fn into_summary(self) -> Result<RouteSummary, ProviderError> {
        if self.code != "Ok" {
            return Err(ProviderError::Code {
                service: SERVICE,
                code: self.code,
            });
        }
        let route = self
            .routes
            .into_iter()
            .next()
            .ok_or(ProviderError::Empty(SERVICE))?;
        Ok(RouteSummary {
            distance_km: route.distance / 1000.0,
            duration_minutes: route.duration / 60.0,
            geometry: route
                .geometry
                .map(|line| Polyline::from_lng_lat(&line.coordinates))
                .unwrap_or_default(),
            legs: route
                .legs
                .into_iter()
                .map(|leg| RouteLeg {
                    distance_km: leg.distance / 1000.0,
                    duration_minutes: leg.duration / 60.0,
                })
                .collect(),
        })
    }
}

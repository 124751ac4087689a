//! Address geocoding with caching and ZIP-centroid fallback.
//!
//! Provider results are cached for [`GEOCODE_TTL`]. Fallback coordinates are
//! never written to the cache, so a recovered provider is picked up on the
//! next lookup.

use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::error::ProviderError;
use crate::model::{Coordinates, extract_zip};
use crate::traits::Geocoder;

pub const GEOCODE_TTL: Duration = Duration::from_secs(60 * 60);

/// Regional center used when a ZIP is present but not in [`ZIP_CENTROIDS`].
pub const DEFAULT_REGIONAL_CENTER: Coordinates = Coordinates::new(40.7128, -74.0060);

/// Approximate centroids for the service area's ZIP codes.
pub const ZIP_CENTROIDS: &[(&str, Coordinates)] = &[
    ("10001", Coordinates::new(40.7506, -73.9972)),
    ("10002", Coordinates::new(40.7157, -73.9863)),
    ("10003", Coordinates::new(40.7318, -73.9892)),
    ("10009", Coordinates::new(40.7262, -73.9796)),
    ("10011", Coordinates::new(40.7419, -74.0002)),
    ("10012", Coordinates::new(40.7255, -73.9983)),
    ("10013", Coordinates::new(40.7201, -74.0050)),
    ("10014", Coordinates::new(40.7341, -74.0054)),
    ("10016", Coordinates::new(40.7459, -73.9781)),
    ("10019", Coordinates::new(40.7651, -73.9858)),
    ("10025", Coordinates::new(40.7985, -73.9668)),
    ("11201", Coordinates::new(40.6944, -73.9906)),
    ("11211", Coordinates::new(40.7123, -73.9536)),
    ("11215", Coordinates::new(40.6628, -73.9862)),
    ("11217", Coordinates::new(40.6826, -73.9789)),
];

pub fn zip_centroid(zip: &str) -> Option<Coordinates> {
    ZIP_CENTROIDS
        .iter()
        .find(|(candidate, _)| *candidate == zip)
        .map(|(_, coordinates)| *coordinates)
}

/// Where a resolved coordinate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeocodeSource {
    Provider,
    Cache,
    ZipCentroid,
    RegionalDefault,
}

impl GeocodeSource {
    /// Approximate coordinates from the centroid table or regional default.
    pub fn is_fallback(self) -> bool {
        matches!(self, Self::ZipCentroid | Self::RegionalDefault)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geocoded {
    pub coordinates: Coordinates,
    pub source: GeocodeSource,
}

/// Resolves addresses through the provider, the cache, and the centroid table.
pub struct GeocodingResolver {
    geocoder: Option<Arc<dyn Geocoder>>,
    cache: Arc<TtlCache<Coordinates>>,
    ttl: Duration,
    regional_default: Option<Coordinates>,
}

impl GeocodingResolver {
    pub fn new(geocoder: Option<Arc<dyn Geocoder>>, cache: Arc<TtlCache<Coordinates>>) -> Self {
        Self {
            geocoder,
            cache,
            ttl: GEOCODE_TTL,
            regional_default: Some(DEFAULT_REGIONAL_CENTER),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// `None` disables the regional default for unknown ZIPs.
    pub fn with_regional_default(mut self, regional_default: Option<Coordinates>) -> Self {
        self.regional_default = regional_default;
        self
    }

    /// Resolves one address. `None` only when no provider result and no ZIP
    /// is available.
    pub fn resolve(&self, address: &str, zip: Option<&str>) -> Option<Geocoded> {
        let key = cache_key(address, zip);
        if let Some(coordinates) = self.cache.get(&key) {
            return Some(Geocoded {
                coordinates,
                source: GeocodeSource::Cache,
            });
        }

        match self.call_provider(address) {
            Ok(coordinates) => {
                self.cache.set(key, coordinates, self.ttl);
                return Some(Geocoded {
                    coordinates,
                    source: GeocodeSource::Provider,
                });
            }
            Err(ProviderError::Unconfigured(_)) => {
                debug!("geocoding provider not configured, using ZIP fallback");
            }
            Err(err) => {
                warn!(error = %err, "geocoding failed, using ZIP fallback");
            }
        }

        self.fallback(address, zip)
    }

    fn call_provider(&self, address: &str) -> Result<Coordinates, ProviderError> {
        if address.trim().is_empty() {
            return Err(ProviderError::InvalidInput("empty address".to_string()));
        }
        match &self.geocoder {
            Some(geocoder) => geocoder.geocode(address),
            None => Err(ProviderError::Unconfigured("geocoding")),
        }
    }

    fn fallback(&self, address: &str, zip: Option<&str>) -> Option<Geocoded> {
        let zip = zip
            .map(str::trim)
            .filter(|zip| !zip.is_empty())
            .map(str::to_string)
            .or_else(|| extract_zip(address))?;

        if let Some(coordinates) = zip_centroid(&zip) {
            return Some(Geocoded {
                coordinates,
                source: GeocodeSource::ZipCentroid,
            });
        }
        self.regional_default.map(|coordinates| Geocoded {
            coordinates,
            source: GeocodeSource::RegionalDefault,
        })
    }

    /// Resolves many addresses with at most `concurrency` requests in flight.
    ///
    /// Results are returned in input order once every lookup has finished.
    pub fn resolve_all(
        &self,
        requests: &[(String, Option<String>)],
        concurrency: usize,
    ) -> Vec<Option<Geocoded>> {
        let mut results = Vec::with_capacity(requests.len());
        for chunk in requests.chunks(concurrency.max(1)) {
            let resolved: Vec<_> = chunk
                .par_iter()
                .map(|(address, zip)| self.resolve(address, zip.as_deref()))
                .collect();
            results.extend(resolved);
        }
        results
    }
}

fn cache_key(address: &str, zip: Option<&str>) -> String {
    format!(
        "geocode:{}|{}",
        address.trim().to_lowercase(),
        zip.map(str::trim).unwrap_or_default()
    )
}

#[derive(Debug, Clone)]
pub struct MapboxConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    pub country: String,
    pub timeout_secs: u64,
}

impl Default for MapboxConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.mapbox.com".to_string(),
            access_token: None,
            country: "us".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Mapbox forward-geocoding adapter.
#[derive(Debug, Clone)]
pub struct MapboxGeocoder {
    config: MapboxConfig,
    client: reqwest::blocking::Client,
}

const SERVICE: &str = "geocoding";

impl MapboxGeocoder {
    pub fn new(config: MapboxConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    fn url(&self, address: &str) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|err| ProviderError::InvalidInput(err.to_string()))?;
        let query = format!("{address}.json");
        url.path_segments_mut()
            .map_err(|()| ProviderError::InvalidInput("geocoding base URL".to_string()))?
            .pop_if_empty()
            .extend(["geocoding", "v5", "mapbox.places", query.as_str()]);
        Ok(url)
    }
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    /// `[lng, lat]`
    center: [f64; 2],
}

impl Geocoder for MapboxGeocoder {
    fn geocode(&self, address: &str) -> Result<Coordinates, ProviderError> {
        let token = self
            .config
            .access_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or(ProviderError::Unconfigured(SERVICE))?;
        let url = self.url(address)?;

        let body: GeocodeResponse = self
            .client
            .get(url)
            .query(&[
                ("access_token", token),
                ("limit", "1"),
                ("country", self.config.country.as_str()),
            ])
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.json())
            .map_err(|err| ProviderError::from_reqwest(SERVICE, err))?;

        let [lng, lat] = body
            .features
            .first()
            .map(|feature| feature.center)
            .ok_or(ProviderError::Empty(SERVICE))?;
        Ok(Coordinates::new(lat, lng))
    }
}

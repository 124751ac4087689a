//! Planner configuration.
//!
//! Every value has a default; [`PlannerConfig::from_env`] overrides them from
//! `BATCH_PLANNER_*` variables. Unparseable values keep the default.

use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;
use tracing::warn;

use crate::clustering::{BatchConstraints, DEFAULT_PROMPT_SAMPLE};
use crate::eta::DEFAULT_DWELL_MINUTES;
use crate::gateway::GatewayConfig;
use crate::geocode::{GEOCODE_TTL, MapboxConfig};
use crate::haversine::DEFAULT_SPEED_KMH;
use crate::matrix::{DEFAULT_KEY_PRECISION, MATRIX_TTL};
use crate::osrm::OsrmConfig;
use crate::persistence::DEFAULT_VISIBLE_STOPS;

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub osrm: OsrmConfig,
    pub geocoding: MapboxConfig,
    pub gateway: GatewayConfig,
    pub constraints: BatchConstraints,
    pub dwell_minutes: f64,
    pub fallback_speed_kmh: f64,
    pub route_start: NaiveTime,
    pub geocode_concurrency: usize,
    pub max_parallel_runs: usize,
    pub prompt_sample_size: usize,
    pub visible_stops: usize,
    pub run_deadline: Duration,
    pub geocode_ttl: Duration,
    pub matrix_ttl: Duration,
    pub matrix_key_precision: usize,
    pub max_two_opt_moves: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            osrm: OsrmConfig::default(),
            geocoding: MapboxConfig::default(),
            gateway: GatewayConfig::default(),
            constraints: BatchConstraints::default(),
            dwell_minutes: DEFAULT_DWELL_MINUTES,
            fallback_speed_kmh: DEFAULT_SPEED_KMH,
            route_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            geocode_concurrency: 5,
            max_parallel_runs: 4,
            prompt_sample_size: DEFAULT_PROMPT_SAMPLE,
            visible_stops: DEFAULT_VISIBLE_STOPS,
            run_deadline: Duration::from_secs(10 * 60),
            geocode_ttl: GEOCODE_TTL,
            matrix_ttl: MATRIX_TTL,
            matrix_key_precision: DEFAULT_KEY_PRECISION,
            max_two_opt_moves: 10_000,
        }
    }
}

impl PlannerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = get("BATCH_PLANNER_OSRM_URL") {
            config.osrm.base_url = url;
        }
        if let Some(profile) = get("BATCH_PLANNER_OSRM_PROFILE") {
            config.osrm.profile = profile;
        }
        parse_into(&get, "BATCH_PLANNER_OSRM_TIMEOUT_SECS", &mut config.osrm.timeout_secs);

        if let Some(url) = get("BATCH_PLANNER_GEOCODING_URL") {
            config.geocoding.base_url = url;
        }
        config.geocoding.access_token = get("BATCH_PLANNER_GEOCODING_TOKEN");

        if let Some(url) = get("BATCH_PLANNER_AI_URL") {
            config.gateway.url = url;
        }
        if let Some(model) = get("BATCH_PLANNER_AI_MODEL") {
            config.gateway.model = model;
        }
        config.gateway.api_key = get("BATCH_PLANNER_AI_KEY");
        parse_into(&get, "BATCH_PLANNER_AI_TIMEOUT_SECS", &mut config.gateway.timeout_secs);

        parse_into(&get, "BATCH_PLANNER_TARGET_BATCH_SIZE", &mut config.constraints.target);
        parse_into(&get, "BATCH_PLANNER_MIN_BATCH_SIZE", &mut config.constraints.min);
        parse_into(&get, "BATCH_PLANNER_MAX_BATCH_SIZE", &mut config.constraints.max);
        parse_into(&get, "BATCH_PLANNER_MAX_ROUTE_HOURS", &mut config.constraints.max_route_hours);
        config.constraints = config.constraints.normalized();

        parse_into(&get, "BATCH_PLANNER_DWELL_MINUTES", &mut config.dwell_minutes);
        parse_into(&get, "BATCH_PLANNER_FALLBACK_SPEED_KMH", &mut config.fallback_speed_kmh);
        if let Some(start) = get("BATCH_PLANNER_ROUTE_START") {
            match NaiveTime::parse_from_str(start.trim(), "%H:%M") {
                Ok(time) => config.route_start = time,
                Err(err) => warn!(value = %start, error = %err, "invalid BATCH_PLANNER_ROUTE_START"),
            }
        }
        parse_into(&get, "BATCH_PLANNER_GEOCODE_CONCURRENCY", &mut config.geocode_concurrency);
        parse_into(&get, "BATCH_PLANNER_MAX_PARALLEL_RUNS", &mut config.max_parallel_runs);
        parse_into(&get, "BATCH_PLANNER_PROMPT_SAMPLE_SIZE", &mut config.prompt_sample_size);
        parse_into(&get, "BATCH_PLANNER_VISIBLE_STOPS", &mut config.visible_stops);
        parse_into(&get, "BATCH_PLANNER_MAX_TWO_OPT_MOVES", &mut config.max_two_opt_moves);

        let mut deadline_secs = config.run_deadline.as_secs();
        parse_into(&get, "BATCH_PLANNER_RUN_DEADLINE_SECS", &mut deadline_secs);
        config.run_deadline = Duration::from_secs(deadline_secs);

        config.geocode_concurrency = config.geocode_concurrency.max(1);
        config.max_parallel_runs = config.max_parallel_runs.max(1);
        config
    }
}

fn parse_into<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(raw) = get(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "ignoring unparseable configuration value"),
        }
    }
}

//! Batch generation run.
//!
//! [`BatchPlanner::optimize_batches`] reads pending orders for a date, groups
//! them by collection point and plans each group independently: geocode,
//! cluster, sequence, estimate arrivals, write. Groups run in parallel on a
//! dedicated pool. A failure while writing one batch is reported and does
//! not stop its siblings; only an unreadable order store fails the run.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::TtlCache;
use crate::clustering::{BatchConstraints, ClusteringMethod, ClusteringOptimizer, ProposedBatch};
use crate::config::PlannerConfig;
use crate::error::PlannerError;
use crate::eta::{ArrivalEstimator, LegSource};
use crate::gateway::HttpClusteringGateway;
use crate::geocode::{GeocodingResolver, MapboxGeocoder};
use crate::matrix::{MatrixService, RouteSummary, TravelMatrix};
use crate::model::{CollectionPoint, CollectionPointId, Coordinates, Order, OrderId, RouteStop};
use crate::notify::{DispatchSummary, dispatch_all};
use crate::osrm::OsrmClient;
use crate::persistence::{BatchWriter, PlannedBatch, PostCommitEvent};
use crate::polyline::Polyline;
use crate::sequencer::{RouteSequencer, SequenceMethod, SequenceOptions, SequencedRoute};
use crate::traits::{
    BatchStore, ClusteringGateway, CollectionPointStore, DistanceMatrixProvider, Geocoder,
    MarketConfigStore, NotificationDispatcher, OrderStore, RouteProvider,
};

/// Why an order was left out of batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    WrongDate,
    MissingAddress,
    MissingZip,
    NoCollectionPoint,
    UnknownCollectionPoint,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExcludedOrder {
    pub order_id: OrderId,
    pub collection_point_id: Option<CollectionPointId>,
    pub reason: ExclusionReason,
}

/// A batch (or whole collection point) that could not be written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchError {
    pub collection_point_id: CollectionPointId,
    pub zip_codes: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub batch_number: u32,
    pub collection_point_id: CollectionPointId,
    pub zip_codes: Vec<String>,
    pub order_count: usize,
    pub subsidized: bool,
    pub estimated_duration_minutes: u32,
    pub distance_km: Option<f64>,
    pub sequence_method: SequenceMethod,
    pub leg_source: LegSource,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Polyline>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMethod {
    Ai,
    Fallback,
    /// Some collection points clustered with AI, others by fallback.
    Mixed,
    /// Nothing was clustered.
    None,
}

impl OptimizationMethod {
    fn from_methods(methods: impl IntoIterator<Item = ClusteringMethod>) -> Self {
        let mut ai = false;
        let mut fallback = false;
        for method in methods {
            match method {
                ClusteringMethod::Ai => ai = true,
                ClusteringMethod::Fallback => fallback = true,
            }
        }
        match (ai, fallback) {
            (true, true) => Self::Mixed,
            (true, false) => Self::Ai,
            (false, true) => Self::Fallback,
            (false, false) => Self::None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub success: bool,
    pub delivery_date: NaiveDate,
    pub batches_created: usize,
    /// Orders that entered clustering in the collection points processed.
    pub total_orders: usize,
    pub optimization_method: OptimizationMethod,
    pub batches: Vec<BatchSummary>,
    pub errors: Vec<BatchError>,
    pub excluded_orders: Vec<ExcludedOrder>,
    /// Not started before the run deadline; picked up by the next run.
    pub deferred_collection_points: Vec<CollectionPointId>,
    /// Stops and depots placed by ZIP centroid or regional default.
    pub fallback_geocodes: usize,
    /// Post-commit events of every written batch.
    pub events: Vec<PostCommitEvent>,
    pub notifications: DispatchSummary,
}

/// Result of planning one collection point.
#[derive(Debug, Default)]
struct PointOutcome {
    total_orders: usize,
    method: Option<ClusteringMethod>,
    batches: Vec<BatchSummary>,
    errors: Vec<BatchError>,
    excluded: Vec<ExcludedOrder>,
    fallback_geocodes: usize,
    events: Vec<PostCommitEvent>,
    notifications: DispatchSummary,
}

enum PointRun {
    Deferred(CollectionPointId),
    Planned(PointOutcome),
}

/// Components shared by every collection point in one run.
struct RunContext<'a> {
    date: NaiveDate,
    deadline: Instant,
    resolver: GeocodingResolver,
    matrices: MatrixService,
    optimizer: ClusteringOptimizer,
    estimator: ArrivalEstimator,
    writer: BatchWriter<'a>,
}

pub struct BatchPlanner {
    orders: Arc<dyn OrderStore>,
    collection_points: Arc<dyn CollectionPointStore>,
    markets: Arc<dyn MarketConfigStore>,
    batches: Arc<dyn BatchStore>,
    geocoder: Option<Arc<dyn Geocoder>>,
    matrix_provider: Option<Arc<dyn DistanceMatrixProvider>>,
    route_provider: Option<Arc<dyn RouteProvider>>,
    gateway: Option<Arc<dyn ClusteringGateway>>,
    dispatcher: Option<Arc<dyn NotificationDispatcher>>,
    geocode_cache: Arc<TtlCache<Coordinates>>,
    matrix_cache: Arc<TtlCache<TravelMatrix>>,
    config: PlannerConfig,
}

impl BatchPlanner {
    /// Planner with no external services: every provider uses its fallback.
    pub fn new(
        orders: Arc<dyn OrderStore>,
        collection_points: Arc<dyn CollectionPointStore>,
        markets: Arc<dyn MarketConfigStore>,
        batches: Arc<dyn BatchStore>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            orders,
            collection_points,
            markets,
            batches,
            geocoder: None,
            matrix_provider: None,
            route_provider: None,
            gateway: None,
            dispatcher: None,
            geocode_cache: Arc::new(TtlCache::new()),
            matrix_cache: Arc::new(TtlCache::new()),
            config,
        }
    }

    /// Attaches the HTTP routing, geocoding and AI clients described by the
    /// configuration. Geocoding and AI are skipped when their credentials
    /// are absent.
    pub fn with_http_providers(mut self) -> Result<Self, reqwest::Error> {
        let osrm = Arc::new(OsrmClient::new(self.config.osrm.clone())?);
        self.matrix_provider = Some(osrm.clone());
        self.route_provider = Some(osrm);
        if self.config.geocoding.access_token.is_some() {
            self.geocoder = Some(Arc::new(MapboxGeocoder::new(self.config.geocoding.clone())?));
        }
        if self.config.gateway.api_key.is_some() {
            self.gateway = Some(Arc::new(HttpClusteringGateway::new(self.config.gateway.clone())?));
        }
        Ok(self)
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn with_matrix_provider(mut self, provider: Arc<dyn DistanceMatrixProvider>) -> Self {
        self.matrix_provider = Some(provider);
        self
    }

    pub fn with_route_provider(mut self, provider: Arc<dyn RouteProvider>) -> Self {
        self.route_provider = Some(provider);
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn ClusteringGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Shares caches with other planners or across runs.
    pub fn with_caches(
        mut self,
        geocode_cache: Arc<TtlCache<Coordinates>>,
        matrix_cache: Arc<TtlCache<TravelMatrix>>,
    ) -> Self {
        self.geocode_cache = geocode_cache;
        self.matrix_cache = matrix_cache;
        self
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plans every pending order for `date` (tomorrow, UTC, when `None`).
    ///
    /// Orders that already carry a batch are never returned by the store, so
    /// repeated runs only pick up what is left.
    pub fn optimize_batches(&self, date: Option<NaiveDate>) -> Result<OptimizationReport, PlannerError> {
        let started = Instant::now();
        let date = date.unwrap_or_else(default_delivery_date);
        let pending = self
            .orders
            .pending_orders(date)
            .map_err(PlannerError::PendingOrders)?;
        info!(%date, pending = pending.len(), "batch optimization started");

        let evicted = self.geocode_cache.cleanup() + self.matrix_cache.cleanup();
        if evicted > 0 {
            debug!(evicted, "expired cache entries removed");
        }

        let (groups, mut excluded_orders) = group_by_collection_point(pending, date);
        let context = self.run_context(date, started);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_parallel_runs.max(1))
            .thread_name(|index| format!("batch-planner-{index}"))
            .build()?;

        let groups: Vec<(CollectionPointId, Vec<Order>)> = groups.into_iter().collect();
        let runs: Vec<PointRun> = pool.install(|| {
            groups
                .into_par_iter()
                .map(|(collection_point_id, orders)| {
                    if Instant::now() >= context.deadline {
                        warn!(
                            collection_point = %collection_point_id,
                            orders = orders.len(),
                            "run deadline reached, deferring collection point"
                        );
                        return PointRun::Deferred(collection_point_id);
                    }
                    PointRun::Planned(self.plan_collection_point(&context, &collection_point_id, orders))
                })
                .collect()
        });

        let mut report = OptimizationReport {
            success: true,
            delivery_date: date,
            batches_created: 0,
            total_orders: 0,
            optimization_method: OptimizationMethod::None,
            batches: Vec::new(),
            errors: Vec::new(),
            excluded_orders: Vec::new(),
            deferred_collection_points: Vec::new(),
            fallback_geocodes: 0,
            events: Vec::new(),
            notifications: DispatchSummary::default(),
        };
        let mut methods = Vec::new();
        for run in runs {
            match run {
                PointRun::Deferred(id) => report.deferred_collection_points.push(id),
                PointRun::Planned(outcome) => {
                    report.total_orders += outcome.total_orders;
                    methods.extend(outcome.method);
                    report.batches.extend(outcome.batches);
                    report.errors.extend(outcome.errors);
                    excluded_orders.extend(outcome.excluded);
                    report.fallback_geocodes += outcome.fallback_geocodes;
                    report.events.extend(outcome.events);
                    report.notifications.sent += outcome.notifications.sent;
                    report.notifications.failed += outcome.notifications.failed;
                }
            }
        }
        report.batches_created = report.batches.len();
        report.optimization_method = OptimizationMethod::from_methods(methods);
        report.excluded_orders = excluded_orders;

        info!(
            %date,
            batches_created = report.batches_created,
            total_orders = report.total_orders,
            errors = report.errors.len(),
            excluded = report.excluded_orders.len(),
            deferred = report.deferred_collection_points.len(),
            fallback_geocodes = report.fallback_geocodes,
            method = ?report.optimization_method,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch optimization finished"
        );
        Ok(report)
    }

    fn run_context(&self, date: NaiveDate, started: Instant) -> RunContext<'_> {
        let config = &self.config;
        RunContext {
            date,
            deadline: started + config.run_deadline,
            resolver: GeocodingResolver::new(self.geocoder.clone(), self.geocode_cache.clone())
                .with_ttl(config.geocode_ttl),
            matrices: MatrixService::new(self.matrix_provider.clone(), self.matrix_cache.clone())
                .with_ttl(config.matrix_ttl)
                .with_precision(config.matrix_key_precision),
            optimizer: ClusteringOptimizer::new(self.gateway.clone())
                .with_sample_size(config.prompt_sample_size),
            estimator: ArrivalEstimator {
                dwell_minutes: config.dwell_minutes,
                speed_kmh: config.fallback_speed_kmh,
            },
            writer: BatchWriter::new(self.batches.as_ref(), self.orders.as_ref())
                .with_visible_stops(config.visible_stops),
        }
    }

    fn plan_collection_point(
        &self,
        context: &RunContext<'_>,
        collection_point_id: &str,
        orders: Vec<Order>,
    ) -> PointOutcome {
        let mut outcome = PointOutcome::default();

        let collection_point = match self.collection_points.collection_point(collection_point_id) {
            Ok(Some(point)) => point,
            Ok(None) => {
                warn!(
                    collection_point = collection_point_id,
                    orders = orders.len(),
                    "collection point not found, excluding its orders"
                );
                outcome.excluded = orders
                    .iter()
                    .map(|order| ExcludedOrder {
                        order_id: order.id.clone(),
                        collection_point_id: Some(collection_point_id.to_string()),
                        reason: ExclusionReason::UnknownCollectionPoint,
                    })
                    .collect();
                return outcome;
            }
            Err(err) => {
                error!(collection_point = collection_point_id, error = %err, "cannot read collection point");
                outcome.errors.push(BatchError {
                    collection_point_id: collection_point_id.to_string(),
                    zip_codes: distinct_zips(&orders),
                    message: err.to_string(),
                });
                return outcome;
            }
        };

        outcome.total_orders = orders.len();
        let constraints = self.constraints_for(&orders);
        let depot = context.resolver.resolve(&collection_point.address, None);
        match depot {
            Some(geocoded) if geocoded.source.is_fallback() => {
                outcome.fallback_geocodes += 1;
                warn!(
                    collection_point = collection_point_id,
                    source = ?geocoded.source,
                    "collection point placed approximately"
                );
            }
            Some(_) => {}
            None => warn!(
                collection_point = collection_point_id,
                "collection point not geocoded, routes start at first stop"
            ),
        }
        let depot = depot.map(|geocoded| geocoded.coordinates);

        let requests: Vec<(String, Option<String>)> = orders
            .iter()
            .map(|order| (order.address.one_line(), order.zip()))
            .collect();
        let resolved = context
            .resolver
            .resolve_all(&requests, self.config.geocode_concurrency);
        let approximate = resolved
            .iter()
            .flatten()
            .filter(|geocoded| geocoded.source.is_fallback())
            .count();
        if approximate > 0 {
            warn!(
                collection_point = collection_point_id,
                approximate,
                orders = orders.len(),
                "stops placed by ZIP fallback"
            );
        }
        outcome.fallback_geocodes += approximate;
        let coordinates: HashMap<&str, Coordinates> = orders
            .iter()
            .zip(resolved)
            .filter_map(|(order, geocoded)| Some((order.id.as_str(), geocoded?.coordinates)))
            .collect();

        let clustering = context.optimizer.cluster(&orders, &constraints);
        outcome.method = Some(clustering.method);

        let by_id: HashMap<&str, &Order> = orders.iter().map(|order| (order.id.as_str(), order)).collect();
        for proposed in &clustering.batches {
            let stops: Vec<RouteStop> = proposed
                .order_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()))
                .map(|order| {
                    RouteStop::from_order(order).with_coordinates(coordinates.get(order.id.as_str()).copied())
                })
                .collect();
            let planned = self.plan_batch(context, &collection_point, &constraints, proposed, depot, stops);

            match context.writer.write(&planned.batch, &by_id, &collection_point, Utc::now()) {
                Ok(written) => {
                    if let Some(dispatcher) = &self.dispatcher {
                        let sent = dispatch_all(&written.events, dispatcher.as_ref());
                        outcome.notifications.sent += sent.sent;
                        outcome.notifications.failed += sent.failed;
                    }
                    outcome.batches.push(BatchSummary {
                        batch_id: written.batch.id.clone(),
                        batch_number: written.batch.batch_number,
                        collection_point_id: collection_point.id.clone(),
                        zip_codes: written.batch.zip_codes.clone(),
                        order_count: written.stops.len(),
                        subsidized: written.batch.subsidized,
                        estimated_duration_minutes: written.batch.estimated_duration_minutes,
                        distance_km: planned.distance_km,
                        sequence_method: planned.sequence_method,
                        leg_source: planned.leg_source,
                        rationale: proposed.rationale.clone(),
                        geometry: planned.geometry,
                    });
                    outcome.events.extend(written.events);
                }
                Err(err) => {
                    error!(
                        collection_point = %collection_point.id,
                        zip_codes = ?proposed.zip_codes,
                        error = %err,
                        "batch write failed"
                    );
                    outcome.errors.push(BatchError {
                        collection_point_id: collection_point.id.clone(),
                        zip_codes: proposed.zip_codes.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        outcome
    }

    fn plan_batch(
        &self,
        context: &RunContext<'_>,
        collection_point: &CollectionPoint,
        constraints: &BatchConstraints,
        proposed: &ProposedBatch,
        depot: Option<Coordinates>,
        stops: Vec<RouteStop>,
    ) -> BatchPlan {
        let sequencer = RouteSequencer::new(
            &context.matrices,
            SequenceOptions {
                max_two_opt_moves: self.config.max_two_opt_moves,
            },
        );
        let route = sequencer.sequence(depot, stops);
        let detail = self.route_detail(&route);

        let legs: Option<Vec<f64>> = match &detail {
            Some(summary) => Some(summary.legs.iter().map(|leg| leg.duration_minutes).collect()),
            None => route.leg_minutes.clone(),
        };
        let start = NaiveDateTime::new(context.date, self.config.route_start);
        let arrivals = context.estimator.estimate(&route.stops, start, legs.as_deref());
        let duration = arrivals.total_minutes(self.config.dwell_minutes);
        if f64::from(duration) > constraints.max_route_hours * 60.0 {
            warn!(
                collection_point = %collection_point.id,
                estimated_minutes = duration,
                max_route_hours = constraints.max_route_hours,
                "batch exceeds maximum route duration"
            );
        }

        let (distance_km, geometry) = match detail {
            Some(summary) => (
                Some(summary.distance_km),
                Some(summary.geometry).filter(|geometry| !geometry.is_empty()),
            ),
            None => (route.distance_km, None),
        };
        BatchPlan {
            batch: PlannedBatch {
                delivery_date: context.date,
                collection_point_id: collection_point.id.clone(),
                zip_codes: proposed.zip_codes.clone(),
                subsidized: proposed.subsidized,
                estimated_duration_minutes: duration,
                stops: route.stops,
                arrivals: arrivals.arrivals,
            },
            sequence_method: route.method,
            leg_source: arrivals.leg_source,
            distance_km,
            geometry,
        }
    }

    /// Detailed route over the final stop order, when every stop is located.
    fn route_detail(&self, route: &SequencedRoute) -> Option<RouteSummary> {
        let provider = self.route_provider.as_ref()?;
        if route.stops.len() < 2 {
            return None;
        }
        let locations: Vec<Coordinates> = route.stops.iter().map(|stop| stop.coordinates).collect::<Option<_>>()?;
        match provider.route_for(&locations) {
            Ok(summary) if summary.legs.len() == locations.len() - 1 => Some(summary),
            Ok(summary) => {
                warn!(
                    expected = locations.len() - 1,
                    got = summary.legs.len(),
                    "route leg count mismatch, using matrix legs"
                );
                None
            }
            Err(err) => {
                warn!(error = %err, "route detail unavailable, using matrix legs");
                None
            }
        }
    }

    /// Constraints from the market of the most common ZIP, else defaults.
    fn constraints_for(&self, orders: &[Order]) -> BatchConstraints {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for zip in orders.iter().filter_map(Order::zip) {
            *counts.entry(zip).or_default() += 1;
        }
        // Ties resolve to the lowest ZIP.
        let Some(zip) = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(zip, _)| zip.clone())
        else {
            return self.config.constraints.clone();
        };

        match self.markets.market_for_zip(&zip) {
            Ok(Some(market)) => BatchConstraints::from(&market),
            Ok(None) => self.config.constraints.clone(),
            Err(err) => {
                warn!(%zip, error = %err, "market configuration unavailable, using defaults");
                self.config.constraints.clone()
            }
        }
    }
}

struct BatchPlan {
    batch: PlannedBatch,
    sequence_method: SequenceMethod,
    leg_source: LegSource,
    distance_km: Option<f64>,
    geometry: Option<Polyline>,
}

fn default_delivery_date() -> NaiveDate {
    let today = Utc::now().date_naive();
    today.succ_opt().unwrap_or(today)
}

/// Splits valid orders by collection point; everything else is excluded.
fn group_by_collection_point(
    orders: Vec<Order>,
    date: NaiveDate,
) -> (BTreeMap<CollectionPointId, Vec<Order>>, Vec<ExcludedOrder>) {
    let mut groups: BTreeMap<CollectionPointId, Vec<Order>> = BTreeMap::new();
    let mut excluded = Vec::new();
    for order in orders {
        let collection_point_id = order
            .collection_point_id
            .clone()
            .filter(|id| !id.trim().is_empty());
        let reason = if order.delivery_date != date {
            Some(ExclusionReason::WrongDate)
        } else if order.address.is_blank() {
            Some(ExclusionReason::MissingAddress)
        } else if order.zip().is_none() {
            Some(ExclusionReason::MissingZip)
        } else if collection_point_id.is_none() {
            Some(ExclusionReason::NoCollectionPoint)
        } else {
            None
        };

        match (reason, collection_point_id) {
            (None, Some(id)) => groups.entry(id).or_default().push(order),
            (reason, collection_point_id) => {
                let reason = reason.unwrap_or(ExclusionReason::NoCollectionPoint);
                warn!(order = %order.id, ?reason, "order excluded from batching");
                excluded.push(ExcludedOrder {
                    order_id: order.id,
                    collection_point_id,
                    reason,
                });
            }
        }
    }
    (groups, excluded)
}

fn distinct_zips(orders: &[Order]) -> Vec<String> {
    orders
        .iter()
        .filter_map(Order::zip)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

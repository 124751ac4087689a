//! End-to-end planner tests
//!
//! Drives `BatchPlanner::optimize_batches` through the in-memory store with
//! stub geocoding, routing, AI and notification collaborators.

mod fixtures;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use batch_planner::cache::TtlCache;
use batch_planner::config::PlannerConfig;
use batch_planner::error::{PlannerError, StoreError};
use batch_planner::eta::LegSource;
use batch_planner::geocode::{GeocodeSource, GeocodingResolver, zip_centroid};
use batch_planner::haversine::HaversineMatrix;
use batch_planner::memory::InMemoryStore;
use batch_planner::model::{CollectionPoint, MarketConfig, Order, OrderStatus};
use batch_planner::persistence::DELIVERY_SCHEDULED;
use batch_planner::planner::{ExclusionReason, OptimizationMethod};
use batch_planner::sequencer::SequenceMethod;
use chrono::{NaiveDateTime, NaiveTime, Utc};
use rstest::rstest;
use rust_decimal_macros::dec;

use fixtures::{
    CHELSEA, FailingGateway, OrderBuilder, PARK_SLOPE_HUB, RecordingDispatcher, ScriptedGateway,
    StraightLineRoutes, TableGeocoder, WILLIAMSBURG_HUB, collection_point, delivery_date,
    orders_in_zip, planner, store_with,
};

// ============================================================================
// Helpers
// ============================================================================

const HUB: &str = "cp-williamsburg";

fn hub() -> CollectionPoint {
    collection_point(HUB, &WILLIAMSBURG_HUB, Some(dec!(0.10)))
}

fn config() -> PlannerConfig {
    PlannerConfig {
        max_parallel_runs: 2,
        ..PlannerConfig::default()
    }
}

fn chelsea_orders() -> Vec<Order> {
    CHELSEA
        .iter()
        .enumerate()
        .map(|(n, location)| OrderBuilder::new(&format!("chelsea-{n}")).at(location).build())
        .collect()
}

fn stored_order(store: &InMemoryStore, id: &str) -> Order {
    store
        .orders()
        .into_iter()
        .find(|order| order.id == id)
        .unwrap_or_else(|| panic!("order {id} missing"))
}

fn route_start() -> NaiveDateTime {
    NaiveDateTime::new(delivery_date(), NaiveTime::from_hms_opt(9, 0, 0).unwrap())
}

// ============================================================================
// Batch materialization
// ============================================================================

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(4)]
#[case(7)]
fn test_address_visibility_limited_to_first_three_stops(#[case] stop_count: usize) {
    let store = store_with(orders_in_zip("v", "10001", stop_count, HUB), vec![hub()]);

    let report = planner(&store, config()).optimize_batches(Some(delivery_date())).unwrap();

    assert_eq!(report.batches_created, 1);
    let stops = store.stops_for(&report.batches[0].batch_id);
    assert_eq!(stops.len(), stop_count);
    let visible: Vec<u32> = stops
        .iter()
        .filter(|stop| stop.address_visible_at.is_some())
        .map(|stop| stop.sequence_number)
        .collect();
    let expected: Vec<u32> = (1..=stop_count.min(3) as u32).collect();
    assert_eq!(visible, expected);
}

#[test]
fn test_batch_writes_box_codes_and_confirms_orders() {
    let store = store_with(chelsea_orders(), vec![hub()]);
    let planner = planner(&store, config())
        .with_geocoder(Arc::new(TableGeocoder::nyc()))
        .with_matrix_provider(Arc::new(HaversineMatrix::default()))
        .with_route_provider(Arc::new(StraightLineRoutes::default()));

    let report = planner.optimize_batches(Some(delivery_date())).unwrap();

    assert!(report.success);
    assert_eq!(report.batches_created, 1);
    let summary = &report.batches[0];
    assert_eq!(summary.batch_number, 1);
    assert_eq!(summary.sequence_method, SequenceMethod::Matrix);
    assert_eq!(summary.leg_source, LegSource::Routing);
    assert!(summary.geometry.is_some());
    assert!(summary.distance_km.unwrap() > 0.0);
    assert!(summary.estimated_duration_minutes >= 6 * 10);

    let stops = store.stops_for(&summary.batch_id);
    let numbers: Vec<u32> = stops.iter().map(|stop| stop.sequence_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(stops[0].estimated_arrival, route_start());
    assert!(stops.windows(2).all(|pair| pair[0].estimated_arrival < pair[1].estimated_arrival));

    for stop in &stops {
        assert_eq!(stop.box_code, format!("B1-{}", stop.sequence_number));
        assert!(stop.coordinates.is_some());
        let order = stored_order(&store, &stop.order_id);
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert_eq!(order.batch_id.as_deref(), Some(summary.batch_id.as_str()));
        assert_eq!(order.box_code.as_deref(), Some(stop.box_code.as_str()));
    }
}

#[test]
fn test_commission_excludes_lead_farm_goods() {
    let orders = vec![
        OrderBuilder::new("a")
            .zip("11211")
            .total(dec!(50.00))
            .farm_line(HUB, dec!(20.00))
            .farm_line("farm-other", dec!(30.00))
            .build(),
        OrderBuilder::new("b")
            .zip("11211")
            .total(dec!(40.00))
            .farm_line("farm-other", dec!(40.00))
            .build(),
    ];
    let store = store_with(orders, vec![hub()]);

    let report = planner(&store, config()).optimize_batches(Some(delivery_date())).unwrap();

    let payouts = store.payouts();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].batch_id, report.batches[0].batch_id);
    assert_eq!(payouts[0].lead_farmer_id, HUB);
    assert_eq!(payouts[0].commissionable_subtotal, dec!(70.00));
    assert_eq!(payouts[0].amount, dec!(7.00));
}

#[test]
fn test_no_commission_rate_records_no_payout() {
    let point = collection_point(HUB, &WILLIAMSBURG_HUB, None);
    let store = store_with(orders_in_zip("a", "11211", 3, HUB), vec![point]);

    planner(&store, config()).optimize_batches(Some(delivery_date())).unwrap();

    assert!(store.payouts().is_empty());
}

#[test]
fn test_notifications_dispatched_after_commit() {
    let store = store_with(orders_in_zip("n", "10002", 4, HUB), vec![hub()]);
    let dispatcher = Arc::new(RecordingDispatcher {
        bounce: vec!["consumer-n-2".to_string()],
        ..RecordingDispatcher::default()
    });

    let report = planner(&store, config())
        .with_dispatcher(dispatcher.clone())
        .optimize_batches(Some(delivery_date()))
        .unwrap();

    assert_eq!(report.batches_created, 1);
    assert_eq!(report.events.len(), 4);
    assert_eq!(report.notifications.sent, 3);
    assert_eq!(report.notifications.failed, 1);
    let sent = dispatcher.sent.lock().unwrap();
    assert!(sent.iter().all(|(event_type, _, _)| event_type == DELIVERY_SCHEDULED));
    assert!(sent.iter().all(|(_, _, payload)| payload["box_code"].is_string()));
}

// ============================================================================
// Failure isolation
// ============================================================================

#[test]
fn test_stop_insert_failure_is_isolated_to_its_batch() {
    let mut orders = orders_in_zip("chelsea", "10001", 3, HUB);
    orders.extend(orders_in_zip("les", "10002", 3, HUB));
    let store = store_with(orders, vec![hub()]);
    store.fail_stop_insert_for("les-2");

    let report = planner(&store, config()).optimize_batches(Some(delivery_date())).unwrap();

    assert!(report.success);
    assert_eq!(report.total_orders, 6);
    assert_eq!(report.batches_created, 1);
    assert_eq!(report.batches[0].zip_codes, vec!["10001"]);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].collection_point_id, HUB);
    assert_eq!(report.errors[0].zip_codes, vec!["10002"]);
    assert!(report.errors[0].message.contains("les-2"));

    for n in 1..=3 {
        assert!(stored_order(&store, &format!("chelsea-{n}")).batch_id.is_some());
        assert!(stored_order(&store, &format!("les-{n}")).batch_id.is_none());
    }
}

#[test]
fn test_assignment_failure_stops_at_failing_order() {
    let store = store_with(orders_in_zip("les", "10002", 3, HUB), vec![hub()]);
    store.fail_assignment_for("les-2");

    let report = planner(&store, config()).optimize_batches(Some(delivery_date())).unwrap();

    assert_eq!(report.batches_created, 0);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].message.contains("les-2"));
    assert!(report.events.is_empty());

    // Stops are already written; orders after the failure stay pending and
    // are picked up again by the next run.
    let batch = &store.batches()[0];
    assert_eq!(store.stops_for(&batch.id).len(), 3);
    assert_eq!(stored_order(&store, "les-1").batch_id.as_deref(), Some(batch.id.as_str()));
    assert!(stored_order(&store, "les-2").batch_id.is_none());
    assert!(stored_order(&store, "les-3").batch_id.is_none());
    assert!(store.payouts().is_empty());
}

#[test]
fn test_unreadable_pending_orders_fail_the_run() {
    let store = store_with(orders_in_zip("a", "10001", 2, HUB), vec![hub()]);
    store.fail_pending_reads();

    let result = planner(&store, config()).optimize_batches(Some(delivery_date()));

    assert!(matches!(
        result,
        Err(PlannerError::PendingOrders(StoreError::Backend { .. }))
    ));
}

#[test]
fn test_deadline_defers_unstarted_collection_points() {
    let mut orders = orders_in_zip("w", "11211", 3, HUB);
    orders.extend(orders_in_zip("p", "11215", 3, "cp-park-slope"));
    let store = store_with(
        orders,
        vec![hub(), collection_point("cp-park-slope", &PARK_SLOPE_HUB, None)],
    );
    let config = PlannerConfig {
        run_deadline: Duration::ZERO,
        ..config()
    };

    let report = planner(&store, config).optimize_batches(Some(delivery_date())).unwrap();

    assert!(report.success);
    assert_eq!(report.deferred_collection_points, vec!["cp-park-slope", HUB]);
    assert_eq!(report.batches_created, 0);
    assert_eq!(report.total_orders, 0);
    assert_eq!(report.optimization_method, OptimizationMethod::None);
    assert!(store.orders().iter().all(|order| order.batch_id.is_none()));
}

#[test]
fn test_invalid_orders_are_excluded_and_reported() {
    let orders = vec![
        OrderBuilder::new("good").zip("10001").build(),
        OrderBuilder::new("no-street").street("").zip("10001").build(),
        OrderBuilder::new("orphan").zip("10001").without_collection_point().build(),
        OrderBuilder::new("lost").zip("10001").collection_point("cp-missing").build(),
    ];
    let store = store_with(orders, vec![hub()]);

    let report = planner(&store, config()).optimize_batches(Some(delivery_date())).unwrap();

    assert_eq!(report.total_orders, 1);
    let mut reasons: Vec<(String, ExclusionReason)> = report
        .excluded_orders
        .iter()
        .map(|excluded| (excluded.order_id.clone(), excluded.reason))
        .collect();
    reasons.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        reasons,
        vec![
            ("lost".to_string(), ExclusionReason::UnknownCollectionPoint),
            ("no-street".to_string(), ExclusionReason::MissingAddress),
            ("orphan".to_string(), ExclusionReason::NoCollectionPoint),
        ]
    );
}

// ============================================================================
// Clustering through the planner
// ============================================================================

#[test]
fn test_82_orders_with_ai_error_fall_back_by_zip() {
    let mut orders = orders_in_zip("chelsea", "10001", 50, HUB);
    orders.extend(orders_in_zip("les", "10002", 20, HUB));
    orders.extend(orders_in_zip("village", "10003", 12, HUB));
    let store = store_with(orders, vec![hub()]);
    let gateway = Arc::new(FailingGateway::default());

    let report = planner(&store, config())
        .with_gateway(gateway.clone())
        .optimize_batches(Some(delivery_date()))
        .unwrap();

    assert!(report.success);
    assert!(report.errors.is_empty());
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.total_orders, 82);
    assert_eq!(report.optimization_method, OptimizationMethod::Fallback);
    assert_eq!(report.batches_created, 4);
    for batch in &report.batches {
        assert!(batch.order_count <= 45);
        if batch.order_count < 30 {
            assert!(batch.subsidized);
        }
        assert_eq!(batch.zip_codes.len(), 1);
    }
    assert_eq!(report.batches.iter().map(|b| b.order_count).sum::<usize>(), 82);
    assert!(store.orders().iter().all(|order| order.batch_id.is_some()));
}

#[test]
fn test_ai_partition_is_used_when_valid() {
    let orders = orders_in_zip("a", "10001", 6, HUB);
    let groups = vec![
        vec!["a-1".to_string(), "a-3".to_string(), "a-5".to_string()],
        vec!["a-2".to_string(), "a-4".to_string(), "a-6".to_string()],
    ];
    let store = store_with(orders, vec![hub()]);

    let report = planner(&store, config())
        .with_gateway(Arc::new(ScriptedGateway::batches(&groups)))
        .optimize_batches(Some(delivery_date()))
        .unwrap();

    assert_eq!(report.optimization_method, OptimizationMethod::Ai);
    assert_eq!(report.batches_created, 2);
    assert!(report.batches.iter().all(|batch| batch.subsidized));
    let numbers: HashSet<u32> = report.batches.iter().map(|batch| batch.batch_number).collect();
    assert_eq!(numbers, HashSet::from([1, 2]));
}

#[test]
fn test_mixed_method_across_collection_points() {
    let mut orders = orders_in_zip("w", "11211", 2, HUB);
    orders.extend(orders_in_zip("p", "11215", 2, "cp-park-slope"));
    let store = store_with(
        orders,
        vec![hub(), collection_point("cp-park-slope", &PARK_SLOPE_HUB, None)],
    );
    // Valid for the Williamsburg run only; the Park Slope run rejects it.
    let groups = vec![vec!["w-1".to_string(), "w-2".to_string()]];

    let report = planner(&store, config())
        .with_gateway(Arc::new(ScriptedGateway::batches(&groups)))
        .optimize_batches(Some(delivery_date()))
        .unwrap();

    assert_eq!(report.optimization_method, OptimizationMethod::Mixed);
    assert_eq!(report.batches_created, 2);
}

#[test]
fn test_market_config_overrides_default_constraints() {
    let store = store_with(orders_in_zip("m", "10001", 12, HUB), vec![hub()]);
    store.add_market(MarketConfig {
        zip: "10001".to_string(),
        target_batch_size: 5,
        min_batch_size: 3,
        max_batch_size: 10,
        max_route_hours: 2.0,
    });

    let report = planner(&store, config()).optimize_batches(Some(delivery_date())).unwrap();

    let sizes: Vec<(usize, bool)> = report
        .batches
        .iter()
        .map(|batch| (batch.order_count, batch.subsidized))
        .collect();
    assert_eq!(sizes, vec![(5, false), (5, false), (2, true)]);
}

#[test]
fn test_batch_numbers_unique_across_parallel_runs() {
    let mut orders = orders_in_zip("w", "11211", 3, HUB);
    orders.extend(orders_in_zip("p", "11215", 3, "cp-park-slope"));
    orders.extend(orders_in_zip("c", "10001", 3, "cp-chelsea"));
    let store = store_with(
        orders,
        vec![
            hub(),
            collection_point("cp-park-slope", &PARK_SLOPE_HUB, None),
            collection_point("cp-chelsea", &CHELSEA[0], None),
        ],
    );

    let report = planner(&store, PlannerConfig { max_parallel_runs: 3, ..config() })
        .optimize_batches(Some(delivery_date()))
        .unwrap();

    assert_eq!(report.batches_created, 3);
    let numbers: HashSet<u32> = store.batches().iter().map(|batch| batch.batch_number).collect();
    assert_eq!(numbers, HashSet::from([1, 2, 3]));
}

// ============================================================================
// Reruns, caching and geocoding fallback
// ============================================================================

#[test]
fn test_rerun_skips_assigned_orders() {
    let store = store_with(orders_in_zip("r", "10001", 4, HUB), vec![hub()]);
    let planner = planner(&store, config());

    let first = planner.optimize_batches(Some(delivery_date())).unwrap();
    let second = planner.optimize_batches(Some(delivery_date())).unwrap();

    assert_eq!(first.batches_created, 1);
    assert_eq!(second.batches_created, 0);
    assert_eq!(second.total_orders, 0);
    assert_eq!(store.batches().len(), 1);
}

#[test]
fn test_shared_caches_avoid_repeat_geocoding() {
    let geocode_cache = Arc::new(TtlCache::new());
    let matrix_cache = Arc::new(TtlCache::new());
    let geocoder = Arc::new(TableGeocoder::nyc());
    let store = store_with(chelsea_orders(), vec![hub()]);
    let planner = planner(&store, config())
        .with_geocoder(geocoder.clone())
        .with_caches(geocode_cache.clone(), matrix_cache.clone());

    planner.optimize_batches(Some(delivery_date())).unwrap();
    let calls_after_first = geocoder.calls();
    // Same addresses again, under new order ids.
    for (n, location) in CHELSEA.iter().enumerate() {
        store.add_order(OrderBuilder::new(&format!("repeat-{n}")).at(location).build());
    }
    let report = planner.optimize_batches(Some(delivery_date())).unwrap();

    assert_eq!(calls_after_first, CHELSEA.len() + 1);
    assert_eq!(geocoder.calls(), calls_after_first);
    assert_eq!(report.batches_created, 1);
    assert_eq!(geocode_cache.len(), CHELSEA.len() + 1);
}

#[test]
fn test_unconfigured_geocoder_uses_zip_table() {
    let cache = Arc::new(TtlCache::new());
    let resolver = GeocodingResolver::new(None, cache.clone());

    let geocoded = resolver
        .resolve("1 Test St, New York, NY 10001", Some("10001"))
        .expect("10001 is in the fallback table");

    assert_eq!(Some(geocoded.coordinates), zip_centroid("10001"));
    assert_eq!(geocoded.source, GeocodeSource::ZipCentroid);
    assert!(cache.is_empty(), "fallback coordinates must not be cached");
}

#[test]
fn test_report_counts_fallback_geocodes() {
    let store = store_with(orders_in_zip("z", "10002", 4, HUB), vec![hub()]);
    let report = planner(&store, config())
        .optimize_batches(Some(delivery_date()))
        .unwrap();

    // Four stops plus the hub, all from the centroid table.
    assert_eq!(report.fallback_geocodes, 5);
    assert_eq!(report.batches_created, 1);
}

#[test]
fn test_provider_geocodes_are_not_counted_as_fallback() {
    let store = store_with(chelsea_orders(), vec![hub()]);
    let report = planner(&store, config())
        .with_geocoder(Arc::new(TableGeocoder::nyc()))
        .optimize_batches(Some(delivery_date()))
        .unwrap();

    assert_eq!(report.fallback_geocodes, 0);
}

#[test]
fn test_default_date_is_tomorrow() {
    let today = Utc::now().date_naive();
    let tomorrow = today.succ_opt().unwrap();
    let order = OrderBuilder::new("t").zip("10001").build();
    let store = Arc::new(InMemoryStore::new());
    store.add_order(Order {
        delivery_date: tomorrow,
        ..order
    });
    store.add_collection_point(hub());

    let report = planner(&store, config()).optimize_batches(None).unwrap();

    assert_eq!(report.delivery_date, tomorrow);
    assert_eq!(report.batches_created, 1);
}

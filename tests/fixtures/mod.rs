//! Test fixtures for batch-planner.
//!
//! Provides realistic test data including:
//! - Real New York City addresses
//! - Builders for orders and collection points
//! - Stub collaborators (geocoder, routing, AI gateway, notifier)

#![allow(dead_code)]

pub mod nyc_locations;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use batch_planner::config::PlannerConfig;
use batch_planner::error::ProviderError;
use batch_planner::haversine::{HaversineMatrix, haversine_km};
use batch_planner::matrix::{RouteLeg, RouteSummary};
use batch_planner::memory::InMemoryStore;
use batch_planner::model::{
    Address, CollectionPoint, Coordinates, FarmSubtotal, Order, OrderStatus,
};
use batch_planner::planner::BatchPlanner;
use batch_planner::polyline::Polyline;
use batch_planner::traits::{ClusteringGateway, Geocoder, NotificationDispatcher, RouteProvider};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;

pub use nyc_locations::*;

pub fn delivery_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
}

// ============================================================================
// Builders
// ============================================================================

/// Builder for test orders with sensible defaults.
#[derive(Clone, Debug)]
pub struct OrderBuilder {
    order: Order,
}

impl OrderBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            order: Order {
                id: id.to_string(),
                consumer_id: format!("consumer-{id}"),
                total_amount: Decimal::new(4500, 2),
                delivery_date: delivery_date(),
                address: Address::new("1 Test St", "New York", "NY", "10001"),
                collection_point_id: Some("cp-williamsburg".to_string()),
                farm_subtotals: Vec::new(),
                status: OrderStatus::Pending,
                batch_id: None,
                box_code: None,
            },
        }
    }

    pub fn at(mut self, location: &Location) -> Self {
        self.order.address = Address::new(location.street, "New York", "NY", location.zip);
        self
    }

    pub fn street(mut self, street: &str) -> Self {
        self.order.address.street = street.to_string();
        self
    }

    pub fn zip(mut self, zip: &str) -> Self {
        self.order.address.zip = zip.to_string();
        self
    }

    pub fn collection_point(mut self, id: &str) -> Self {
        self.order.collection_point_id = Some(id.to_string());
        self
    }

    pub fn without_collection_point(mut self) -> Self {
        self.order.collection_point_id = None;
        self
    }

    pub fn total(mut self, total: Decimal) -> Self {
        self.order.total_amount = total;
        self
    }

    pub fn farm_line(mut self, farmer_id: &str, subtotal: Decimal) -> Self {
        self.order.farm_subtotals.push(FarmSubtotal {
            farmer_id: farmer_id.to_string(),
            subtotal,
        });
        self
    }

    pub fn build(self) -> Order {
        self.order
    }
}

/// `count` orders in `zip` with synthetic street numbers.
pub fn orders_in_zip(prefix: &str, zip: &str, count: usize, collection_point: &str) -> Vec<Order> {
    (1..=count)
        .map(|n| {
            OrderBuilder::new(&format!("{prefix}-{n}"))
                .street(&format!("{n} Test St"))
                .zip(zip)
                .collection_point(collection_point)
                .build()
        })
        .collect()
}

pub fn collection_point(id: &str, location: &Location, commission_rate: Option<Decimal>) -> CollectionPoint {
    CollectionPoint {
        id: id.to_string(),
        address: format!("{}, Brooklyn, NY {}", location.street, location.zip),
        commission_rate,
    }
}

pub fn store_with(orders: Vec<Order>, points: Vec<CollectionPoint>) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    for order in orders {
        store.add_order(order);
    }
    for point in points {
        store.add_collection_point(point);
    }
    store
}

pub fn planner(store: &Arc<InMemoryStore>, config: PlannerConfig) -> BatchPlanner {
    BatchPlanner::new(store.clone(), store.clone(), store.clone(), store.clone(), config)
}

// ============================================================================
// Stub collaborators
// ============================================================================

/// Geocodes addresses that contain one of the known streets.
#[derive(Debug)]
pub struct TableGeocoder {
    locations: Vec<Location>,
    pub calls: AtomicUsize,
}

impl TableGeocoder {
    pub fn new(locations: Vec<Location>) -> Self {
        Self {
            locations,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn nyc() -> Self {
        Self::new(all_locations())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Geocoder for TableGeocoder {
    fn geocode(&self, address: &str) -> Result<Coordinates, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.locations
            .iter()
            .find(|location| address.contains(location.street))
            .map(Location::coordinates)
            .ok_or(ProviderError::Empty("geocoding"))
    }
}

/// Straight-line routes at a fixed speed.
#[derive(Debug, Default)]
pub struct StraightLineRoutes {
    pub calls: AtomicUsize,
}

impl RouteProvider for StraightLineRoutes {
    fn route_for(&self, locations: &[Coordinates]) -> Result<RouteSummary, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let speed = HaversineMatrix::new(30.0);
        let legs: Vec<RouteLeg> = locations
            .windows(2)
            .map(|pair| {
                let km = haversine_km(pair[0], pair[1]);
                RouteLeg {
                    distance_km: km,
                    duration_minutes: speed.km_to_minutes(km),
                }
            })
            .collect();
        Ok(RouteSummary {
            distance_km: legs.iter().map(|leg| leg.distance_km).sum(),
            duration_minutes: legs.iter().map(|leg| leg.duration_minutes).sum(),
            geometry: Polyline::new(locations.to_vec()),
            legs,
        })
    }
}

/// AI gateway that is always down.
#[derive(Debug, Default)]
pub struct FailingGateway {
    pub calls: AtomicUsize,
}

impl ClusteringGateway for FailingGateway {
    fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Status {
            service: "ai_gateway",
            status: 503,
        })
    }
}

/// AI gateway that always returns the same reply.
#[derive(Debug)]
pub struct ScriptedGateway {
    reply: String,
}

impl ScriptedGateway {
    pub fn new(reply: impl Into<String>) -> Self {
        Self { reply: reply.into() }
    }

    /// A well-formed reply grouping the given order ids.
    pub fn batches(groups: &[Vec<String>]) -> Self {
        let batches: Vec<Value> = groups
            .iter()
            .enumerate()
            .map(|(index, ids)| {
                serde_json::json!({
                    "order_ids": ids,
                    "zip_codes": [],
                    "rationale": format!("cluster {}", index + 1),
                    "subsidized": false,
                })
            })
            .collect();
        let body = serde_json::json!({ "batches": batches });
        Self::new(format!("```json\n{body}\n```"))
    }
}

impl ClusteringGateway for ScriptedGateway {
    fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
        Ok(self.reply.clone())
    }
}

/// Records every notification; fails for recipients listed in `bounce`.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    pub sent: Mutex<Vec<(String, String, Value)>>,
    pub bounce: Vec<String>,
}

impl NotificationDispatcher for RecordingDispatcher {
    fn notify(&self, event_type: &str, recipient: &str, payload: &Value) -> Result<(), ProviderError> {
        if self.bounce.iter().any(|r| r == recipient) {
            return Err(ProviderError::Status {
                service: "notifications",
                status: 500,
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((event_type.to_string(), recipient.to_string(), payload.clone()));
        Ok(())
    }
}

//! In-memory implementation of every store trait.
//!
//! Useful for tests and local runs. Failure injection hooks let callers
//! exercise the per-batch and run-level error paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::model::{Batch, BatchStatus, CollectionPoint, MarketConfig, Order, Stop};
use crate::persistence::{NewBatch, OrderAssignment, PendingPayout};
use crate::traits::{BatchStore, CollectionPointStore, MarketConfigStore, OrderStore};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    orders: Mutex<Vec<Order>>,
    collection_points: Mutex<HashMap<String, CollectionPoint>>,
    markets: Mutex<HashMap<String, MarketConfig>>,
    batches: Mutex<Vec<Batch>>,
    batch_numbers: Mutex<HashMap<NaiveDate, u32>>,
    stops: Mutex<Vec<Stop>>,
    payouts: Mutex<Vec<PendingPayout>>,
    fail_pending_reads: AtomicBool,
    fail_stop_inserts: Mutex<HashSet<String>>,
    fail_assignments: Mutex<HashSet<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_order(&self, order: Order) {
        self.orders.lock().push(order);
    }

    pub fn add_collection_point(&self, point: CollectionPoint) {
        self.collection_points.lock().insert(point.id.clone(), point);
    }

    pub fn add_market(&self, market: MarketConfig) {
        self.markets.lock().insert(market.zip.clone(), market);
    }

    /// Makes [`OrderStore::pending_orders`] fail.
    pub fn fail_pending_reads(&self) {
        self.fail_pending_reads.store(true, Ordering::SeqCst);
    }

    /// Makes any stop insert containing `order_id` fail.
    pub fn fail_stop_insert_for(&self, order_id: impl Into<String>) {
        self.fail_stop_inserts.lock().insert(order_id.into());
    }

    /// Makes [`OrderStore::assign_order`] fail for `order_id`.
    pub fn fail_assignment_for(&self, order_id: impl Into<String>) {
        self.fail_assignments.lock().insert(order_id.into());
    }

    pub fn orders(&self) -> Vec<Order> {
        self.orders.lock().clone()
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().clone()
    }

    pub fn stops(&self) -> Vec<Stop> {
        self.stops.lock().clone()
    }

    pub fn stops_for(&self, batch_id: &str) -> Vec<Stop> {
        let mut stops: Vec<Stop> = self
            .stops
            .lock()
            .iter()
            .filter(|stop| stop.batch_id == batch_id)
            .cloned()
            .collect();
        stops.sort_by_key(|stop| stop.sequence_number);
        stops
    }

    pub fn payouts(&self) -> Vec<PendingPayout> {
        self.payouts.lock().clone()
    }
}

impl OrderStore for InMemoryStore {
    fn pending_orders(&self, date: NaiveDate) -> Result<Vec<Order>, StoreError> {
        if self.fail_pending_reads.load(Ordering::SeqCst) {
            return Err(StoreError::backend("pending_orders", "store unavailable"));
        }
        Ok(self
            .orders
            .lock()
            .iter()
            .filter(|order| order.delivery_date == date && order.batch_id.is_none())
            .cloned()
            .collect())
    }

    fn assign_order(&self, order_id: &str, assignment: &OrderAssignment) -> Result<(), StoreError> {
        if self.fail_assignments.lock().contains(order_id) {
            return Err(StoreError::backend(
                "assign_order",
                format!("rejected assignment for order {order_id}"),
            ));
        }
        let mut orders = self.orders.lock();
        let order = orders
            .iter_mut()
            .find(|order| order.id == order_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "order",
                id: order_id.to_string(),
            })?;
        order.batch_id = Some(assignment.batch_id.clone());
        order.box_code = Some(assignment.box_code.clone());
        order.status = assignment.status;
        Ok(())
    }
}

impl CollectionPointStore for InMemoryStore {
    fn collection_point(&self, id: &str) -> Result<Option<CollectionPoint>, StoreError> {
        Ok(self.collection_points.lock().get(id).cloned())
    }
}

impl MarketConfigStore for InMemoryStore {
    fn market_for_zip(&self, zip: &str) -> Result<Option<MarketConfig>, StoreError> {
        Ok(self.markets.lock().get(zip).cloned())
    }
}

impl BatchStore for InMemoryStore {
    fn create_batch(&self, batch: &NewBatch) -> Result<Batch, StoreError> {
        let batch_number = {
            let mut numbers = self.batch_numbers.lock();
            let next = numbers.entry(batch.delivery_date).or_insert(0);
            *next += 1;
            *next
        };
        let created = Batch {
            id: format!("batch-{}-{batch_number}", batch.delivery_date),
            batch_number,
            delivery_date: batch.delivery_date,
            status: BatchStatus::Pending,
            zip_codes: batch.zip_codes.clone(),
            collection_point_id: batch.collection_point_id.clone(),
            estimated_duration_minutes: batch.estimated_duration_minutes,
            subsidized: batch.subsidized,
        };
        self.batches.lock().push(created.clone());
        Ok(created)
    }

    fn insert_stops(&self, stops: &[Stop]) -> Result<(), StoreError> {
        {
            let failing = self.fail_stop_inserts.lock();
            if let Some(stop) = stops.iter().find(|stop| failing.contains(&stop.order_id)) {
                return Err(StoreError::backend(
                    "insert_stops",
                    format!("rejected stop for order {}", stop.order_id),
                ));
            }
        }
        self.stops.lock().extend_from_slice(stops);
        Ok(())
    }

    fn record_payout(&self, payout: &PendingPayout) -> Result<(), StoreError> {
        self.payouts.lock().push(payout.clone());
        Ok(())
    }
}

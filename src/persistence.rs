//! Materializes a planned batch: batch record, stops, box codes, order
//! confirmation, lead-farmer payout.
//!
//! Notifications are not sent here. The writer returns them as
//! [`PostCommitEvent`]s for a dispatcher to deliver after the batch is saved.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{
    Batch, BatchId, CollectionPoint, CollectionPointId, Order, OrderStatus, RouteStop, Stop,
    StopStatus,
};
use crate::traits::{BatchStore, OrderStore};

/// Drivers see at most this many upcoming addresses.
pub const DEFAULT_VISIBLE_STOPS: usize = 3;

pub const DELIVERY_SCHEDULED: &str = "delivery_scheduled";

/// Batch fields supplied by the planner; the store assigns id and number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBatch {
    pub delivery_date: NaiveDate,
    pub collection_point_id: CollectionPointId,
    pub zip_codes: Vec<String>,
    pub estimated_duration_minutes: u32,
    pub subsidized: bool,
}

/// Written onto each covered order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAssignment {
    pub batch_id: BatchId,
    pub box_code: String,
    pub status: OrderStatus,
}

/// Commission owed to a collection point's lead farmer for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPayout {
    pub lead_farmer_id: CollectionPointId,
    pub batch_id: BatchId,
    pub commissionable_subtotal: Decimal,
    pub commission_rate: Decimal,
    pub amount: Decimal,
}

/// A notification to deliver once the batch is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostCommitEvent {
    pub event_type: String,
    pub recipient: String,
    pub payload: Value,
}

/// A sequenced, timed batch ready to be written.
#[derive(Debug, Clone)]
pub struct PlannedBatch {
    pub delivery_date: NaiveDate,
    pub collection_point_id: CollectionPointId,
    pub zip_codes: Vec<String>,
    pub subsidized: bool,
    pub estimated_duration_minutes: u32,
    /// Stops in visiting order.
    pub stops: Vec<RouteStop>,
    /// Arrival estimate per stop, same order as `stops`.
    pub arrivals: Vec<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct WrittenBatch {
    pub batch: Batch,
    pub stops: Vec<Stop>,
    pub payout: Option<PendingPayout>,
    pub events: Vec<PostCommitEvent>,
}

pub fn box_code(batch_number: u32, sequence_number: u32) -> String {
    format!("B{batch_number}-{sequence_number}")
}

/// Subtotal of `orders` not supplied by the lead farmer's own farm.
pub fn commissionable_subtotal<'a>(
    orders: impl IntoIterator<Item = &'a Order>,
    lead_farmer_id: &str,
) -> Decimal {
    orders
        .into_iter()
        .map(|order| {
            let own: Decimal = order
                .farm_subtotals
                .iter()
                .filter(|line| line.farmer_id == lead_farmer_id)
                .map(|line| line.subtotal)
                .sum();
            (order.total_amount - own).max(Decimal::ZERO)
        })
        .sum()
}

pub struct BatchWriter<'a> {
    batches: &'a dyn BatchStore,
    orders: &'a dyn OrderStore,
    visible_stops: usize,
}

impl<'a> BatchWriter<'a> {
    pub fn new(batches: &'a dyn BatchStore, orders: &'a dyn OrderStore) -> Self {
        Self {
            batches,
            orders,
            visible_stops: DEFAULT_VISIBLE_STOPS,
        }
    }

    pub fn with_visible_stops(mut self, visible_stops: usize) -> Self {
        self.visible_stops = visible_stops;
        self
    }

    /// Writes the batch. The first failing write aborts this batch only.
    ///
    /// `orders` must contain every order referenced by `plan.stops`.
    pub fn write(
        &self,
        plan: &PlannedBatch,
        orders: &HashMap<&str, &Order>,
        collection_point: &CollectionPoint,
        now: DateTime<Utc>,
    ) -> Result<WrittenBatch, StoreError> {
        let batch = self.batches.create_batch(&NewBatch {
            delivery_date: plan.delivery_date,
            collection_point_id: plan.collection_point_id.clone(),
            zip_codes: plan.zip_codes.clone(),
            estimated_duration_minutes: plan.estimated_duration_minutes,
            subsidized: plan.subsidized,
        })?;

        let stops: Vec<Stop> = (1u32..)
            .zip(plan.stops.iter().zip(&plan.arrivals))
            .map(|(sequence_number, (stop, arrival))| Stop {
                batch_id: batch.id.clone(),
                order_id: stop.order_id.clone(),
                address: stop.address.clone(),
                coordinates: stop.coordinates,
                status: StopStatus::Pending,
                sequence_number,
                box_code: box_code(batch.batch_number, sequence_number),
                estimated_arrival: *arrival,
                address_visible_at: ((sequence_number as usize) <= self.visible_stops)
                    .then_some(now),
            })
            .collect();
        self.batches.insert_stops(&stops)?;

        let mut events = Vec::with_capacity(stops.len());
        for stop in &stops {
            self.orders.assign_order(
                &stop.order_id,
                &OrderAssignment {
                    batch_id: batch.id.clone(),
                    box_code: stop.box_code.clone(),
                    status: OrderStatus::Confirmed,
                },
            )?;
            if let Some(order) = orders.get(stop.order_id.as_str()) {
                events.push(scheduled_event(order, &batch, stop));
            }
        }
        debug!(batch = %batch.id, stops = stops.len(), "orders confirmed");

        let payout = self.payout(&batch, &stops, orders, collection_point)?;

        info!(
            batch = %batch.id,
            batch_number = batch.batch_number,
            stops = stops.len(),
            subsidized = batch.subsidized,
            "batch written"
        );
        Ok(WrittenBatch {
            batch,
            stops,
            payout,
            events,
        })
    }

    fn payout(
        &self,
        batch: &Batch,
        stops: &[Stop],
        orders: &HashMap<&str, &Order>,
        collection_point: &CollectionPoint,
    ) -> Result<Option<PendingPayout>, StoreError> {
        let Some(rate) = collection_point.commission_rate.filter(|rate| *rate > Decimal::ZERO) else {
            return Ok(None);
        };
        let members = stops
            .iter()
            .filter_map(|stop| orders.get(stop.order_id.as_str()).copied());
        let subtotal = commissionable_subtotal(members, &collection_point.id);
        if subtotal.is_zero() {
            return Ok(None);
        }
        let payout = PendingPayout {
            lead_farmer_id: collection_point.id.clone(),
            batch_id: batch.id.clone(),
            commissionable_subtotal: subtotal,
            commission_rate: rate,
            amount: (subtotal * rate).round_dp(2),
        };
        self.batches.record_payout(&payout)?;
        Ok(Some(payout))
    }
}

fn scheduled_event(order: &Order, batch: &Batch, stop: &Stop) -> PostCommitEvent {
    PostCommitEvent {
        event_type: DELIVERY_SCHEDULED.to_string(),
        recipient: order.consumer_id.clone(),
        payload: json!({
            "order_id": order.id,
            "batch_number": batch.batch_number,
            "box_code": stop.box_code,
            "delivery_date": batch.delivery_date,
            "estimated_arrival": stop.estimated_arrival,
        }),
    }
}

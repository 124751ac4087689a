//! Flat data model shared by every component.
//!
//! Store adapters normalize whatever nested shape their backend returns into
//! these records at the ingestion boundary.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type OrderId = String;
pub type BatchId = String;
pub type CollectionPointId = String;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// A consumer's postal address.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

impl Address {
    pub fn new(
        street: impl Into<String>,
        city: impl Into<String>,
        state: impl Into<String>,
        zip: impl Into<String>,
    ) -> Self {
        Self {
            street: street.into(),
            city: city.into(),
            state: state.into(),
            zip: zip.into(),
        }
    }

    /// Single-line form used for geocoding and stop records.
    pub fn one_line(&self) -> String {
        let parts = [
            self.street.trim(),
            self.city.trim(),
            self.state.trim(),
            self.zip.trim(),
        ];
        parts
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn is_blank(&self) -> bool {
        self.street.trim().is_empty()
    }
}

/// Extracts the last standalone 5-digit ZIP code from free text.
///
/// ZIP+4 suffixes are ignored; digit runs longer than five are not ZIPs.
pub fn extract_zip(text: &str) -> Option<String> {
    let mut found = None;
    let mut run = String::new();
    for ch in text.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_digit() {
            run.push(ch);
        } else {
            if run.len() == 5 {
                found = Some(run.clone());
            }
            run.clear();
        }
    }
    found
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
}

/// Portion of an order's total supplied by a single farmer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmSubtotal {
    pub farmer_id: String,
    pub subtotal: Decimal,
}

/// An order awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub consumer_id: String,
    pub total_amount: Decimal,
    pub delivery_date: NaiveDate,
    pub address: Address,
    pub collection_point_id: Option<CollectionPointId>,
    #[serde(default)]
    pub farm_subtotals: Vec<FarmSubtotal>,
    pub status: OrderStatus,
    pub batch_id: Option<BatchId>,
    pub box_code: Option<String>,
}

impl Order {
    /// ZIP from the structured address, else extracted from the street line.
    pub fn zip(&self) -> Option<String> {
        let zip = self.address.zip.trim();
        if zip.is_empty() {
            extract_zip(&self.address.street)
        } else {
            Some(zip.to_string())
        }
    }
}

/// A consolidation location, identified by its lead farmer's profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionPoint {
    pub id: CollectionPointId,
    pub address: String,
    /// Commission paid to the lead farmer on other farms' goods.
    pub commission_rate: Option<Decimal>,
}

/// Per-ZIP batch sizing from market configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketConfig {
    pub zip: String,
    pub target_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub max_route_hours: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Pending,
    InProgress,
    Delivered,
}

/// A persisted delivery batch: one driver, one route, one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub batch_number: u32,
    pub delivery_date: NaiveDate,
    pub status: BatchStatus,
    pub zip_codes: Vec<String>,
    pub collection_point_id: CollectionPointId,
    pub estimated_duration_minutes: u32,
    pub subsidized: bool,
}

/// A persisted stop, owned by its batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub batch_id: BatchId,
    pub order_id: OrderId,
    pub address: String,
    pub coordinates: Option<Coordinates>,
    pub status: StopStatus,
    pub sequence_number: u32,
    pub box_code: String,
    pub estimated_arrival: NaiveDateTime,
    pub address_visible_at: Option<DateTime<Utc>>,
}

/// A stop being planned, before it belongs to a persisted batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStop {
    pub order_id: OrderId,
    pub consumer_id: String,
    pub address: String,
    pub zip: Option<String>,
    pub coordinates: Option<Coordinates>,
}

impl RouteStop {
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.id.clone(),
            consumer_id: order.consumer_id.clone(),
            address: order.address.one_line(),
            zip: order.zip(),
            coordinates: None,
        }
    }

    pub fn with_coordinates(mut self, coordinates: Option<Coordinates>) -> Self {
        self.coordinates = coordinates;
        self
    }
}

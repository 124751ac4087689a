//! Collaborator seams.
//!
//! The planner core reads and writes only through these traits. Concrete
//! backends (databases, HTTP services) implement them; [`crate::memory`]
//! provides an in-process implementation of every store.

use chrono::NaiveDate;
use serde_json::Value;

use crate::error::{ProviderError, StoreError};
use crate::matrix::{RouteSummary, TravelMatrix};
use crate::model::{Batch, CollectionPoint, Coordinates, MarketConfig, Order, Stop};
use crate::persistence::{NewBatch, OrderAssignment, PendingPayout};

/// Reads pending orders and records their batch assignment.
pub trait OrderStore: Send + Sync {
    /// Orders for `date` that have not yet been assigned a batch.
    fn pending_orders(&self, date: NaiveDate) -> Result<Vec<Order>, StoreError>;

    fn assign_order(&self, order_id: &str, assignment: &OrderAssignment) -> Result<(), StoreError>;
}

pub trait CollectionPointStore: Send + Sync {
    fn collection_point(&self, id: &str) -> Result<Option<CollectionPoint>, StoreError>;
}

pub trait MarketConfigStore: Send + Sync {
    fn market_for_zip(&self, zip: &str) -> Result<Option<MarketConfig>, StoreError>;
}

/// Writes batches, their stops, and lead-farmer payouts.
pub trait BatchStore: Send + Sync {
    /// Creates the batch record. The store assigns the id and a batch number
    /// that is unique and increasing per delivery date.
    fn create_batch(&self, batch: &NewBatch) -> Result<Batch, StoreError>;

    fn insert_stops(&self, stops: &[Stop]) -> Result<(), StoreError>;

    fn record_payout(&self, payout: &PendingPayout) -> Result<(), StoreError>;
}

/// Resolves a free-text address to coordinates.
pub trait Geocoder: Send + Sync {
    fn geocode(&self, address: &str) -> Result<Coordinates, ProviderError>;
}

/// Provides pairwise travel durations and distances for a set of locations.
///
/// The matrix is indexed by the provided location order.
pub trait DistanceMatrixProvider: Send + Sync {
    fn matrix_for(&self, locations: &[Coordinates]) -> Result<TravelMatrix, ProviderError>;
}

/// Provides a detailed route through locations in the given order.
pub trait RouteProvider: Send + Sync {
    fn route_for(&self, locations: &[Coordinates]) -> Result<RouteSummary, ProviderError>;
}

/// Language-model completion endpoint used for clustering.
pub trait ClusteringGateway: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Fire-and-forget notification delivery.
pub trait NotificationDispatcher: Send + Sync {
    fn notify(&self, event_type: &str, recipient: &str, payload: &Value) -> Result<(), ProviderError>;
}

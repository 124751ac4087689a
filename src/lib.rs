//! batch-planner core
//!
//! Partitions a day's pending orders into delivery batches per collection
//! point, sequences each batch's stops and writes the result through
//! collaborator traits. External services (geocoding, routing, AI
//! clustering) are optional; every one of them has a local fallback.

pub mod model;
pub mod traits;
pub mod error;
pub mod cache;
pub mod geocode;
pub mod haversine;
pub mod osrm;
pub mod matrix;
pub mod polyline;
pub mod sequencer;
pub mod eta;
pub mod clustering;
pub mod gateway;
pub mod persistence;
pub mod notify;
pub mod planner;
pub mod memory;
pub mod config;

pub use config::PlannerConfig;
pub use error::{PlannerError, ProviderError, StoreError};
pub use planner::{BatchPlanner, OptimizationReport};

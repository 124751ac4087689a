//! Partitions a collection point's orders into delivery batches.
//!
//! The AI gateway is asked first. Its reply is untrusted: it must parse
//! against the batch schema and form an exact partition of the input orders
//! before it is used. Anything else falls through to the deterministic
//! ZIP-based split, so batch generation never waits on the gateway.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{MarketConfig, Order, OrderId};
use crate::traits::ClusteringGateway;

/// Orders included verbatim in the prompt.
pub const DEFAULT_PROMPT_SAMPLE: usize = 100;

/// Batch sizing. Defaults reflect per-delivery economics and a 7.5 hour route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConstraints {
    pub target: usize,
    pub min: usize,
    pub max: usize,
    pub max_route_hours: f64,
}

impl Default for BatchConstraints {
    fn default() -> Self {
        Self {
            target: 37,
            min: 30,
            max: 45,
            max_route_hours: 7.5,
        }
    }
}

impl BatchConstraints {
    /// Repairs inconsistent values: `1 <= target <= max` and `min <= max`.
    pub fn normalized(mut self) -> Self {
        self.max = self.max.max(1);
        self.target = self.target.clamp(1, self.max);
        self.min = self.min.min(self.max);
        self
    }
}

impl From<&MarketConfig> for BatchConstraints {
    fn from(market: &MarketConfig) -> Self {
        Self {
            target: market.target_batch_size,
            min: market.min_batch_size,
            max: market.max_batch_size,
            max_route_hours: market.max_route_hours,
        }
        .normalized()
    }
}

/// One proposed batch, before routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedBatch {
    pub order_ids: Vec<OrderId>,
    pub zip_codes: Vec<String>,
    pub rationale: String,
    pub subsidized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringMethod {
    Ai,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct ClusteringOutcome {
    pub batches: Vec<ProposedBatch>,
    pub method: ClusteringMethod,
}

/// Why an AI reply was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("response is not valid batch JSON: {0}")]
    InvalidJson(String),
    #[error("response contains no batches")]
    NoBatches,
    #[error("batch {0} is empty")]
    EmptyBatch(usize),
    #[error("batch {index} has {size} orders, above the maximum of {max}")]
    Oversized { index: usize, size: usize, max: usize },
    #[error("unknown order id {0}")]
    UnknownOrder(String),
    #[error("order {0} assigned more than once")]
    DuplicateOrder(String),
    #[error("{0} orders left unassigned")]
    MissingOrders(usize),
}

/// Outcome of reading a gateway reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedClustering {
    Batches(Vec<ProposedBatch>),
    Failure(ParseFailure),
}

#[derive(Debug, Deserialize)]
struct AiResponse {
    batches: Vec<AiBatch>,
}

#[derive(Debug, Deserialize)]
struct AiBatch {
    order_ids: Vec<String>,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    subsidized: bool,
}

/// Locates the JSON payload in a reply.
///
/// Takes the body of the first Markdown code fence when there is one, else
/// the outermost `{...}` span, else the trimmed text.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some((_, after)) = trimmed.split_once("```") {
        // Drop the info string ("json") on the opening line.
        let body = after.split_once('\n').map_or("", |(_, rest)| rest);
        let body = body.split_once("```").map_or(body, |(inside, _)| inside);
        return body.trim();
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(open), Some(close)) if open < close => &trimmed[open..=close],
        _ => trimmed,
    }
}

/// Parses and validates a gateway reply against `orders`.
///
/// ZIP codes are recomputed from the member orders and `subsidized` is forced
/// on for batches below `constraints.min`.
pub fn parse_response(text: &str, orders: &[Order], constraints: &BatchConstraints) -> ParsedClustering {
    let response: AiResponse = match serde_json::from_str(extract_json(text)) {
        Ok(response) => response,
        Err(err) => return ParsedClustering::Failure(ParseFailure::InvalidJson(err.to_string())),
    };
    match validate(response, orders, constraints) {
        Ok(batches) => ParsedClustering::Batches(batches),
        Err(failure) => ParsedClustering::Failure(failure),
    }
}

fn validate(
    response: AiResponse,
    orders: &[Order],
    constraints: &BatchConstraints,
) -> Result<Vec<ProposedBatch>, ParseFailure> {
    if response.batches.is_empty() {
        return Err(ParseFailure::NoBatches);
    }
    let zips: BTreeMap<&str, Option<String>> =
        orders.iter().map(|order| (order.id.as_str(), order.zip())).collect();
    let mut seen: HashSet<String> = HashSet::with_capacity(orders.len());
    let mut batches = Vec::with_capacity(response.batches.len());

    for (index, batch) in response.batches.into_iter().enumerate() {
        let size = batch.order_ids.len();
        if size == 0 {
            return Err(ParseFailure::EmptyBatch(index));
        }
        if size > constraints.max {
            return Err(ParseFailure::Oversized {
                index,
                size,
                max: constraints.max,
            });
        }
        let mut zip_codes = BTreeSet::new();
        for id in &batch.order_ids {
            let zip = zips
                .get(id.as_str())
                .ok_or_else(|| ParseFailure::UnknownOrder(id.clone()))?;
            if !seen.insert(id.clone()) {
                return Err(ParseFailure::DuplicateOrder(id.clone()));
            }
            zip_codes.extend(zip.clone());
        }
        batches.push(ProposedBatch {
            subsidized: batch.subsidized || size < constraints.min,
            order_ids: batch.order_ids,
            zip_codes: zip_codes.into_iter().collect(),
            rationale: batch.rationale,
        });
    }

    let missing = orders.len() - seen.len();
    if missing > 0 {
        return Err(ParseFailure::MissingOrders(missing));
    }
    Ok(batches)
}

/// Builds the clustering prompt: ZIP counts, every order id with its ZIP,
/// an address sample, the constraints, and the required output schema.
///
/// Only addresses are bounded by `sample_size`; ids are always listed in
/// full because the reply must assign each of them.
pub fn build_prompt(orders: &[Order], constraints: &BatchConstraints, sample_size: usize) -> String {
    let mut ids_by_zip: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for order in orders {
        ids_by_zip
            .entry(order.zip().unwrap_or_default())
            .or_default()
            .push(order.id.as_str());
    }
    let zip_label = |zip: &str| if zip.is_empty() { "unknown".to_string() } else { zip.to_string() };

    let mut lines = vec![
        format!(
            "Partition {} delivery orders into driver batches for one collection point.",
            orders.len()
        ),
        String::new(),
        "Orders per ZIP code:".to_string(),
    ];
    lines.extend(
        ids_by_zip
            .iter()
            .map(|(zip, ids)| format!("- {}: {}", zip_label(zip), ids.len())),
    );

    lines.push(String::new());
    lines.push("Order ids by ZIP code (every id must be assigned):".to_string());
    lines.extend(
        ids_by_zip
            .iter()
            .map(|(zip, ids)| format!("- {}: {}", zip_label(zip), ids.join(", "))),
    );

    lines.push(String::new());
    lines.push("Sample addresses (id | zip | address):".to_string());
    lines.extend(orders.iter().take(sample_size).map(|order| {
        format!(
            "- {} | {} | {}",
            order.id,
            order.zip().unwrap_or_default(),
            order.address.one_line()
        )
    }));
    if orders.len() > sample_size {
        lines.push(format!(
            "- ... {} more addresses not listed",
            orders.len() - sample_size
        ));
    }

    lines.push(String::new());
    lines.push("Constraints:".to_string());
    lines.push(format!("- target batch size: {}", constraints.target));
    lines.push(format!(
        "- minimum viable size: {} (smaller batches are subsidized)",
        constraints.min
    ));
    lines.push(format!("- maximum batch size: {}", constraints.max));
    lines.push(format!("- maximum route duration: {} hours", constraints.max_route_hours));
    lines.push("- keep ZIP codes together where possible".to_string());
    lines.push("- every order id must appear in exactly one batch".to_string());

    lines.push(String::new());
    lines.push("Respond with JSON only, matching:".to_string());
    lines.push(
        r#"{"batches": [{"order_ids": ["..."], "zip_codes": ["..."], "rationale": "...", "subsidized": false}]}"#
            .to_string(),
    );
    lines.join("\n")
}

/// Deterministic split: one batch per ZIP, or `ceil(count / target)`
/// sequential slices when a ZIP exceeds `max`.
pub fn fallback_batches(orders: &[Order], constraints: &BatchConstraints) -> Vec<ProposedBatch> {
    let constraints = constraints.clone().normalized();
    let mut by_zip: BTreeMap<String, Vec<&Order>> = BTreeMap::new();
    for order in orders {
        by_zip.entry(order.zip().unwrap_or_default()).or_default().push(order);
    }

    let mut batches = Vec::new();
    for (zip, members) in by_zip {
        let zip_codes: Vec<String> = if zip.is_empty() { Vec::new() } else { vec![zip.clone()] };
        let label = if zip.is_empty() { "unknown ZIP" } else { zip.as_str() };
        if members.len() <= constraints.max {
            batches.push(ProposedBatch {
                subsidized: members.len() < constraints.min,
                order_ids: members.iter().map(|order| order.id.clone()).collect(),
                zip_codes,
                rationale: format!("all {} orders in {label}", members.len()),
            });
            continue;
        }

        let slices = members.len().div_ceil(constraints.target);
        for (index, slice) in members.chunks(constraints.target).enumerate() {
            batches.push(ProposedBatch {
                subsidized: slice.len() < constraints.min,
                order_ids: slice.iter().map(|order| order.id.clone()).collect(),
                zip_codes: zip_codes.clone(),
                rationale: format!("{label} split {} of {slices}", index + 1),
            });
        }
    }
    batches
}

/// AI-first clustering with the deterministic fallback.
pub struct ClusteringOptimizer {
    gateway: Option<Arc<dyn ClusteringGateway>>,
    sample_size: usize,
}

impl ClusteringOptimizer {
    pub fn new(gateway: Option<Arc<dyn ClusteringGateway>>) -> Self {
        Self {
            gateway,
            sample_size: DEFAULT_PROMPT_SAMPLE,
        }
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn cluster(&self, orders: &[Order], constraints: &BatchConstraints) -> ClusteringOutcome {
        if let Some(batches) = self.try_gateway(orders, constraints) {
            info!(orders = orders.len(), batches = batches.len(), "clustered with AI gateway");
            return ClusteringOutcome {
                batches,
                method: ClusteringMethod::Ai,
            };
        }
        let batches = fallback_batches(orders, constraints);
        info!(orders = orders.len(), batches = batches.len(), "clustered by ZIP fallback");
        ClusteringOutcome {
            batches,
            method: ClusteringMethod::Fallback,
        }
    }

    fn try_gateway(&self, orders: &[Order], constraints: &BatchConstraints) -> Option<Vec<ProposedBatch>> {
        if orders.is_empty() {
            return None;
        }
        let gateway = self.gateway.as_ref()?;
        let prompt = build_prompt(orders, constraints, self.sample_size);
        let reply = match gateway.complete(&prompt) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "AI gateway unavailable, using fallback");
                return None;
            }
        };
        match parse_response(&reply, orders, constraints) {
            ParsedClustering::Batches(batches) => Some(batches),
            ParsedClustering::Failure(failure) => {
                warn!(reason = %failure, "AI clustering rejected, using fallback");
                None
            }
        }
    }
}

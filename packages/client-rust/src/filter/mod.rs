//! Interceptors that run at paired points of the call lifecycle.
//!
//! - [`registry`]: global (process-wide) filter tier
//! - [`chain`]: the two-tier chain engine with pre/post pairing
//! - [`timing`]: built-in call timing filter

pub mod chain;
pub mod registry;
pub mod timing;

use std::sync::Arc;

use tailrpc_core::{FilterPoint, RequestContext, NUM_POINT_PAIRS};

pub use chain::{run_filters, FilterChain};
pub use registry::FilterRegistry;
pub use timing::TimingFilter;

/// Upper bound on filters per point in one tier. Two full tiers still fit the
/// `i8` exec index slot.
pub const MAX_FILTERS_PER_TIER: usize = 63;

// ---------------------------------------------------------------------------
// Filter trait
// ---------------------------------------------------------------------------

/// Verdict of a filter invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    Reject,
}

/// A named unit of pre/post logic.
///
/// Global filters are shared singletons invoked concurrently by every call,
/// so per-call state belongs in `RequestContext::set_filter_data`, never in
/// the filter itself.
pub trait Filter: Send + Sync + 'static {
    /// Stable, unique name. Also the key for this filter's context data.
    fn name(&self) -> &str;

    /// Points this filter fires on. Must contain both members of each pair.
    fn points(&self) -> Vec<FilterPoint>;

    /// One-time initialization, called by the registry at runtime startup.
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs the filter at `point`. A rejecting filter may set a status on the
    /// context; otherwise the orchestration reports `FilterRejected`.
    fn invoke(&self, point: FilterPoint, ctx: &mut RequestContext) -> FilterStatus;

    /// Creates a per-service instance from a config blob. `None` means the
    /// shared instance is used for the service tier as well.
    fn create(&self, _config: &serde_json::Value) -> Option<SharedFilter> {
        None
    }

    /// Called once at runtime shutdown, in reverse registration order.
    fn destroy(&self) {}
}

/// Filters are shared between the registry, chains and in-flight calls.
pub type SharedFilter = Arc<dyn Filter>;

// ---------------------------------------------------------------------------
// FilterError
// ---------------------------------------------------------------------------

/// Registration and lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("filter {name} is already registered")]
    Duplicate { name: String },
    #[error("filter {name} declares {point:?} without its partner point")]
    UnpairedPoint { name: String, point: FilterPoint },
    #[error("filter {name} declares no points")]
    NoPoints { name: String },
    #[error("unknown filter: {name}")]
    Unknown { name: String },
    #[error("too many filters at {point:?}, limit is {limit}")]
    TooMany { point: FilterPoint, limit: usize },
    #[error("filter {name} registered after the global filters were initialized")]
    Sealed { name: String },
}

/// Checks that every declared point comes with its partner.
///
/// # Errors
///
/// Returns `FilterError::NoPoints` or `FilterError::UnpairedPoint`.
pub fn validate_points(filter: &dyn Filter) -> Result<Vec<FilterPoint>, FilterError> {
    let mut points = filter.points();
    if points.is_empty() {
        return Err(FilterError::NoPoints {
            name: filter.name().to_string(),
        });
    }
    points.sort_unstable();
    points.dedup();
    for point in &points {
        if points.binary_search(&point.partner()).is_err() {
            return Err(FilterError::UnpairedPoint {
                name: filter.name().to_string(),
                point: *point,
            });
        }
    }
    Ok(points)
}

// ---------------------------------------------------------------------------
// FilterQueues
// ---------------------------------------------------------------------------

/// Per-point filter queues of one tier.
///
/// Filters added at a pre point go to the back of its queue, filters added
/// at a post point go to the front, so post queues are the pre queues
/// reversed.
#[derive(Clone, Default)]
pub struct FilterQueues {
    queues: [Vec<SharedFilter>; NUM_POINT_PAIRS * 2],
}

impl FilterQueues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `filter` at every point it declares.
    ///
    /// # Errors
    ///
    /// Fails on unpaired points or when a queue is full; nothing is added then.
    pub fn add(&mut self, filter: SharedFilter) -> Result<(), FilterError> {
        let points = validate_points(filter.as_ref())?;
        if let Some(full) = points
            .iter()
            .find(|p| self.queues[p.ordinal()].len() >= MAX_FILTERS_PER_TIER)
        {
            return Err(FilterError::TooMany {
                point: *full,
                limit: MAX_FILTERS_PER_TIER,
            });
        }
        for point in points {
            let queue = &mut self.queues[point.ordinal()];
            if point.is_pre() {
                queue.push(Arc::clone(&filter));
            } else {
                queue.insert(0, Arc::clone(&filter));
            }
        }
        Ok(())
    }

    /// Filters registered at `point`, in execution order.
    #[must_use]
    pub fn get(&self, point: FilterPoint) -> &[SharedFilter] {
        &self.queues[point.ordinal()]
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(Vec::is_empty)
    }
}

impl std::fmt::Debug for FilterQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for point in FilterPoint::ALL {
            let names: Vec<&str> = self.get(point).iter().map(|f| f.name()).collect();
            if !names.is_empty() {
                map.entry(&point, &names);
            }
        }
        map.finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

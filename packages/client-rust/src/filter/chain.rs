//! Two-tier filter chain engine.
//!
//! Pre and post hooks of one call run at different call sites, often a
//! network round trip apart. The only link between them is the exec index
//! slot in the request context: a rejecting pre point records the absolute
//! position of the rejecting filter, and the matching post point uses it to
//! resume exactly the post hooks whose pre hook ran, in reverse order.

use std::sync::Arc;

use tailrpc_core::{FilterPoint, RequestContext};

use super::registry::FilterRegistry;
use super::{FilterError, FilterQueues, FilterStatus, SharedFilter};

// ---------------------------------------------------------------------------
// FilterChain
// ---------------------------------------------------------------------------

/// Global tier (shared registry) plus one proxy's service tier.
#[derive(Debug)]
pub struct FilterChain {
    global: Arc<FilterRegistry>,
    service: FilterQueues,
}

impl FilterChain {
    /// Creates a chain with an empty service tier.
    #[must_use]
    pub fn new(global: Arc<FilterRegistry>) -> Self {
        Self {
            global,
            service: FilterQueues::new(),
        }
    }

    /// Adds a service-level filter. Only done while building a proxy.
    ///
    /// # Errors
    ///
    /// Propagates queue validation errors.
    pub fn add_service_filter(&mut self, filter: SharedFilter) -> Result<(), FilterError> {
        self.service.add(filter)
    }

    #[must_use]
    pub fn service_filters(&self) -> &FilterQueues {
        &self.service
    }

    /// Runs both tiers at `point`.
    pub fn run(&self, point: FilterPoint, ctx: &mut RequestContext) -> FilterStatus {
        let global = self.global.snapshot();
        run_filters(point, ctx, global.get(point), self.service.get(point))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs the filters registered at `point`.
///
/// Pre points stop at the first reject. Post points run the post hooks of
/// every filter whose pre hook ran before the reject (the rejecting filter
/// itself excluded), or of every filter when nothing rejected.
pub fn run_filters(
    point: FilterPoint,
    ctx: &mut RequestContext,
    global: &[SharedFilter],
    service: &[SharedFilter],
) -> FilterStatus {
    if point.is_pre() {
        run_pre(point, ctx, global, service)
    } else {
        run_post(point, ctx, global, service)
    }
}

fn run_pre(
    point: FilterPoint,
    ctx: &mut RequestContext,
    global: &[SharedFilter],
    service: &[SharedFilter],
) -> FilterStatus {
    let tiers = global.iter().chain(service.iter());
    for (index, filter) in tiers.enumerate() {
        if filter.invoke(point, ctx) == FilterStatus::Reject {
            tracing::debug!(
                filter = filter.name(),
                ?point,
                index,
                "filter rejected call"
            );
            // Tier sizes are capped well below i8::MAX.
            let slot = i8::try_from(index).unwrap_or(i8::MAX);
            ctx.set_filter_exec_index(point, slot);
            return FilterStatus::Reject;
        }
    }
    FilterStatus::Continue
}

fn run_post(
    point: FilterPoint,
    ctx: &mut RequestContext,
    global: &[SharedFilter],
    service: &[SharedFilter],
) -> FilterStatus {
    let global_count = global.len();
    let service_count = service.len();

    let recorded = ctx.filter_exec_index(point);
    ctx.reset_filter_exec_index(point);
    let mut exec_index = usize::try_from(recorded).unwrap_or(global_count + service_count);

    let mut status = FilterStatus::Continue;
    if exec_index > global_count {
        let ran = exec_index - global_count;
        let start = service_count.saturating_sub(ran);
        for filter in &service[start..] {
            if filter.invoke(point, ctx) == FilterStatus::Reject {
                status = FilterStatus::Reject;
            }
        }
        exec_index = global_count;
    }

    let start = global_count - exec_index;
    for filter in &global[start..] {
        if filter.invoke(point, ctx) == FilterStatus::Reject {
            status = FilterStatus::Reject;
        }
    }
    status
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

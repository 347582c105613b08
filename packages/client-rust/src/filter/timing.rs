//! Built-in filter that measures end-to-end call latency.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tailrpc_core::{FilterPoint, RequestContext};
use tokio::time::Instant;

use super::{Filter, FilterStatus, SharedFilter};

/// Default threshold above which a call is logged as slow.
const DEFAULT_SLOW_THRESHOLD_MS: u64 = 1000;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TimingConfig {
    slow_threshold_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            slow_threshold_ms: DEFAULT_SLOW_THRESHOLD_MS,
        }
    }
}

/// Records the duration of every call between `PRE_RPC_INVOKE` and
/// `POST_RPC_INVOKE` into the `tailrpc_client_call_duration_seconds`
/// histogram and warns about calls slower than its threshold.
///
/// Service-level instances take `{"slow_threshold_ms": N}`.
#[derive(Debug, Clone)]
pub struct TimingFilter {
    slow_threshold: Duration,
}

impl TimingFilter {
    pub const NAME: &'static str = "call_timing";

    #[must_use]
    pub fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }

    #[must_use]
    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }
}

impl Default for TimingFilter {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_SLOW_THRESHOLD_MS))
    }
}

impl Filter for TimingFilter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn points(&self) -> Vec<FilterPoint> {
        vec![FilterPoint::ClientPreRpcInvoke, FilterPoint::ClientPostRpcInvoke]
    }

    fn invoke(&self, point: FilterPoint, ctx: &mut RequestContext) -> FilterStatus {
        match point {
            FilterPoint::ClientPreRpcInvoke => {
                ctx.set_filter_data(Self::NAME, Instant::now());
            }
            FilterPoint::ClientPostRpcInvoke => {
                let Some(started) = ctx.take_filter_data::<Instant>(Self::NAME) else {
                    return FilterStatus::Continue;
                };
                let elapsed = started.elapsed();
                metrics::histogram!(
                    "tailrpc_client_call_duration_seconds",
                    "callee" => ctx.callee_name().to_string(),
                )
                .record(elapsed.as_secs_f64());

                if elapsed > self.slow_threshold {
                    #[allow(clippy::cast_possible_truncation)]
                    let elapsed_ms = elapsed.as_millis() as u64;
                    tracing::warn!(
                        callee = ctx.callee_name(),
                        func = ctx.func_name(),
                        request_id = ctx.request_id(),
                        elapsed_ms,
                        code = ctx.status().framework_code(),
                        "slow call"
                    );
                }
            }
            _ => {}
        }
        FilterStatus::Continue
    }

    fn create(&self, config: &serde_json::Value) -> Option<SharedFilter> {
        if config.is_null() {
            return None;
        }
        match TimingConfig::deserialize(config) {
            Ok(parsed) => Some(Arc::new(Self::new(Duration::from_millis(
                parsed.slow_threshold_ms,
            )))),
            Err(e) => {
                tracing::warn!(error = %e, "invalid call_timing config, using shared instance");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Reference selectors.
//!
//! - [`DirectSelector`]: the target itself is a comma-separated address list
//! - [`StaticSelector`]: fixed endpoint lists per service, round robin, with
//!   per-endpoint outcome accounting fed by `report`

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tailrpc_core::{Endpoint, InvokeResult, Selector, SelectorError};

/// Picks up to `count` distinct entries of `endpoints`, starting at `start`.
fn pick(endpoints: &[Endpoint], start: usize, count: usize) -> Vec<Endpoint> {
    let len = endpoints.len();
    (0..count.min(len))
        .map(|offset| endpoints[(start + offset) % len].clone())
        .collect()
}

// ---------------------------------------------------------------------------
// DirectSelector
// ---------------------------------------------------------------------------

/// Resolves targets written as `ip:port[,ip:port...]`.
#[derive(Debug, Default)]
pub struct DirectSelector {
    cursor: AtomicUsize,
}

impl DirectSelector {
    pub const NAME: &'static str = "direct";

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn parse(target: &str) -> Result<Vec<Endpoint>, SelectorError> {
        let endpoints: Vec<Endpoint> = target
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|addr| {
                Endpoint::parse(addr)
                    .ok_or_else(|| SelectorError::Other(format!("invalid address: {addr}")))
            })
            .collect::<Result<_, _>>()?;
        if endpoints.is_empty() {
            return Err(SelectorError::NoEndpoint {
                service: target.to_string(),
            });
        }
        Ok(endpoints)
    }
}

#[async_trait]
impl Selector for DirectSelector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn select(&self, service: &str) -> Result<Endpoint, SelectorError> {
        let endpoints = Self::parse(service)?;
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(endpoints[start % endpoints.len()].clone())
    }

    async fn select_batch(
        &self,
        service: &str,
        count: usize,
    ) -> Result<Vec<Endpoint>, SelectorError> {
        let endpoints = Self::parse(service)?;
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(pick(&endpoints, start, count))
    }
}

// ---------------------------------------------------------------------------
// StaticSelector
// ---------------------------------------------------------------------------

/// Outcome counters for one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub successes: u64,
    pub failures: u64,
    pub total_cost_us: u64,
}

/// Fixed service -> endpoints table with round-robin selection.
#[derive(Debug)]
pub struct StaticSelector {
    services: DashMap<String, Vec<Endpoint>>,
    cursor: AtomicUsize,
    stats: DashMap<String, EndpointStats>,
}

impl StaticSelector {
    pub const NAME: &'static str = "static";

    /// Creates an empty table. The round-robin cursor starts at a random
    /// offset so that many clients do not all hit the first endpoint.
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            cursor: AtomicUsize::new(rand::random::<u16>().into()),
            stats: DashMap::new(),
        }
    }

    /// Replaces the endpoints of `service`.
    pub fn set_endpoints(&self, service: impl Into<String>, endpoints: Vec<Endpoint>) {
        self.services.insert(service.into(), endpoints);
    }

    #[must_use]
    pub fn with_endpoints(self, service: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        self.set_endpoints(service, endpoints);
        self
    }

    /// Reported outcomes for an endpoint address (`ip:port`).
    #[must_use]
    pub fn endpoint_stats(&self, address: &str) -> EndpointStats {
        self.stats.get(address).map(|s| *s).unwrap_or_default()
    }

    fn endpoints(&self, service: &str) -> Result<Vec<Endpoint>, SelectorError> {
        match self.services.get(service) {
            Some(list) if !list.is_empty() => Ok(list.clone()),
            _ => Err(SelectorError::NoEndpoint {
                service: service.to_string(),
            }),
        }
    }
}

impl Default for StaticSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Selector for StaticSelector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn select(&self, service: &str) -> Result<Endpoint, SelectorError> {
        let endpoints = self.endpoints(service)?;
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(endpoints[start % endpoints.len()].clone())
    }

    async fn select_batch(
        &self,
        service: &str,
        count: usize,
    ) -> Result<Vec<Endpoint>, SelectorError> {
        let endpoints = self.endpoints(service)?;
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(pick(&endpoints, start, count))
    }

    fn report(&self, result: &InvokeResult) {
        let cost_us = u64::try_from(result.cost.as_micros()).unwrap_or(u64::MAX);
        let mut entry = self.stats.entry(result.endpoint.address()).or_default();
        if result.framework_code == 0 {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        entry.total_cost_us = entry.total_cost_us.saturating_add(cost_us);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint::new("10.0.0.1", 8000),
            Endpoint::new("10.0.0.2", 8000),
            Endpoint::new("10.0.0.3", 8000),
        ]
    }

    #[tokio::test]
    async fn round_robin_visits_every_endpoint() {
        let selector = StaticSelector::new().with_endpoints("ledger", endpoints());
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(selector.select("ledger").await.unwrap().address());
        }
        seen.sort();
        assert_eq!(seen, ["10.0.0.1:8000", "10.0.0.2:8000", "10.0.0.3:8000"]);
    }

    #[tokio::test]
    async fn batch_returns_distinct_endpoints() {
        let selector = StaticSelector::new().with_endpoints("ledger", endpoints());
        let batch = selector.select_batch("ledger", 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_ne!(batch[0], batch[1]);

        let capped = selector.select_batch("ledger", 10).await.unwrap();
        assert_eq!(capped.len(), 3);
    }

    #[tokio::test]
    async fn unknown_service_has_no_endpoint() {
        let selector = StaticSelector::new();
        let err = selector.select("ghost").await.unwrap_err();
        assert_eq!(err, SelectorError::NoEndpoint { service: "ghost".into() });
    }

    #[test]
    fn reports_accumulate_per_endpoint() {
        let selector = StaticSelector::new();
        let endpoint = Endpoint::new("10.0.0.1", 8000);
        for code in [0, 0, 141] {
            selector.report(&InvokeResult {
                service: "ledger".into(),
                endpoint: endpoint.clone(),
                framework_code: code,
                cost: Duration::from_millis(2),
            });
        }
        assert_eq!(
            selector.endpoint_stats("10.0.0.1:8000"),
            EndpointStats {
                successes: 2,
                failures: 1,
                total_cost_us: 6000,
            }
        );
    }

    #[tokio::test]
    async fn direct_selector_parses_address_lists() {
        let selector = DirectSelector::new();
        let endpoint = selector.select("127.0.0.1:9000").await.unwrap();
        assert_eq!(endpoint.port, 9000);

        let pair = selector
            .select_batch("127.0.0.1:9000, 127.0.0.1:9001", 2)
            .await
            .unwrap();
        assert_eq!(pair.len(), 2);

        assert!(selector.select("not-an-address").await.is_err());
        assert!(matches!(
            selector.select("").await,
            Err(SelectorError::NoEndpoint { .. })
        ));
    }
}

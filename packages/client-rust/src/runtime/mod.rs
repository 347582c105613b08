//! Client runtime: owns the registries, the transport and the lifecycle,
//! and builds service proxies.
//!
//! Follows a deferred startup pattern:
//! 1. `new()` -- allocates registries and registers the built-in codec and
//!    selector
//! 2. `register_*()` -- the host adds filters, codecs and selectors
//! 3. `init()` -- initializes global filters and starts accepting calls
//! 4. `proxy()` -- builds (or returns the cached) proxy for a service
//! 5. `shutdown()` -- drains in-flight calls and destroys filters

pub mod lifecycle;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tailrpc_core::{ErrorKind, Selector, Status, Transport};
use tracing::{info, warn};

use crate::codec::{CodecRegistry, SharedCodec};
use crate::config::{ClientConfig, ProxyConfig};
use crate::filter::{FilterChain, FilterError, FilterRegistry, SharedFilter};
use crate::proxy::{ProxyParts, ServiceProxy};
use crate::selector::DirectSelector;
use lifecycle::{LifecycleController, LifecycleState};

// ---------------------------------------------------------------------------
// RuntimeError
// ---------------------------------------------------------------------------

/// Failures while assembling proxies or gating calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("unknown codec: {name}")]
    UnknownCodec { name: String },
    #[error("unknown selector: {name}")]
    UnknownSelector { name: String },
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("runtime not ready")]
    NotReady,
}

impl From<RuntimeError> for Status {
    fn from(err: RuntimeError) -> Self {
        Status::from_kind(ErrorKind::Unknown, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// ClientRuntime
// ---------------------------------------------------------------------------

/// Entry point of the client: every proxy is built through it.
pub struct ClientRuntime {
    config: ClientConfig,
    filters: Arc<FilterRegistry>,
    codecs: CodecRegistry,
    selectors: DashMap<String, Arc<dyn Selector>>,
    transport: Arc<dyn Transport>,
    lifecycle: Arc<LifecycleController>,
    proxies: DashMap<String, Arc<ServiceProxy>>,
}

impl ClientRuntime {
    /// Creates a runtime in the `Starting` state.
    #[must_use]
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let selectors: DashMap<String, Arc<dyn Selector>> = DashMap::new();
        selectors.insert(DirectSelector::NAME.to_string(), Arc::new(DirectSelector::new()));
        Self {
            config,
            filters: Arc::new(FilterRegistry::new()),
            codecs: CodecRegistry::with_defaults(),
            selectors,
            transport,
            lifecycle: Arc::new(LifecycleController::new()),
            proxies: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Global filter registry, shared by every proxy's chain.
    #[must_use]
    pub fn filters(&self) -> Arc<FilterRegistry> {
        Arc::clone(&self.filters)
    }

    #[must_use]
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Registers a global filter. Only possible before [`init`](Self::init).
    ///
    /// # Errors
    ///
    /// Returns `FilterError::Sealed` once the runtime was initialized, or a
    /// `FilterError` on a duplicate name or invalid points.
    pub fn register_filter(&self, filter: SharedFilter) -> Result<(), FilterError> {
        self.filters.register(filter)
    }

    /// Registers a codec, replacing any codec with the same name.
    pub fn register_codec(&self, codec: SharedCodec) {
        let name = codec.name();
        if self.codecs.register(codec).is_some() {
            warn!(codec = name, "codec replaced");
        }
    }

    /// Registers a selector under its name, replacing any previous one.
    pub fn register_selector(&self, selector: Arc<dyn Selector>) {
        let name = selector.name().to_string();
        if self.selectors.insert(name.clone(), selector).is_some() {
            warn!(selector = %name, "selector replaced");
        }
    }

    /// Initializes global filters in registration order and starts
    /// accepting calls.
    ///
    /// # Errors
    ///
    /// Fails if the runtime was already initialized, a configured global
    /// filter is missing, or a filter's `init()` fails.
    pub fn init(&self) -> anyhow::Result<()> {
        let state = self.lifecycle.state();
        if state != LifecycleState::Starting {
            anyhow::bail!("runtime cannot be initialized from state {state:?}");
        }
        for name in &self.config.global_filters {
            if self.filters.get(name).is_none() {
                return Err(RuntimeError::from(FilterError::Unknown { name: name.clone() }).into());
            }
        }
        self.filters.init_all()?;
        self.lifecycle.set_ready();
        info!(
            filters = self.filters.len(),
            transport = self.transport.name(),
            "client runtime ready"
        );
        Ok(())
    }

    /// Returns the proxy for `config.service_name`, building it on first
    /// use. Later calls with the same name return the cached proxy and
    /// ignore the rest of `config`.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError` if the runtime is shutting down, the config
    /// names an unknown codec, selector or filter, or has no service name.
    pub fn proxy(&self, config: ProxyConfig) -> Result<Arc<ServiceProxy>, RuntimeError> {
        if matches!(
            self.lifecycle.state(),
            LifecycleState::Draining | LifecycleState::Stopped
        ) {
            return Err(RuntimeError::NotReady);
        }
        if config.service_name.is_empty() {
            return Err(RuntimeError::InvalidConfig("service_name is empty".into()));
        }
        if let Some(proxy) = self.proxies.get(&config.service_name) {
            return Ok(Arc::clone(proxy.value()));
        }

        let proxy = Arc::new(self.build_proxy(config)?);
        let entry = self
            .proxies
            .entry(proxy.name().to_string())
            .or_insert_with(|| Arc::clone(&proxy));
        Ok(Arc::clone(entry.value()))
    }

    fn build_proxy(&self, config: ProxyConfig) -> Result<ServiceProxy, RuntimeError> {
        let codec_name = config.codec.as_deref().unwrap_or(&self.config.default_codec);
        let codec = self
            .codecs
            .get(codec_name)
            .ok_or_else(|| RuntimeError::UnknownCodec {
                name: codec_name.to_string(),
            })?;

        let selector_name = config
            .selector
            .as_deref()
            .unwrap_or(&self.config.default_selector);
        let selector = self
            .selectors
            .get(selector_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RuntimeError::UnknownSelector {
                name: selector_name.to_string(),
            })?;

        let mut filters = FilterChain::new(Arc::clone(&self.filters));
        for filter in &config.filters {
            let instance = self
                .filters
                .create_service_filter(&filter.name, &filter.config)?;
            filters.add_service_filter(instance)?;
        }

        let max_in_flight = config
            .max_in_flight
            .unwrap_or(self.config.max_concurrent_dispatches);
        info!(
            service = %config.service_name,
            codec = codec.name(),
            selector = selector.name(),
            service_filters = config.filters.len(),
            max_in_flight,
            "service proxy created"
        );

        Ok(ServiceProxy::new(ProxyParts {
            config,
            filters,
            codec,
            selector,
            transport: Arc::clone(&self.transport),
            max_in_flight,
            lifecycle: Arc::clone(&self.lifecycle),
        }))
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Calls (and open streams) currently holding an in-flight guard.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.lifecycle.in_flight_count()
    }

    /// Refuses new calls, waits for in-flight ones up to the configured
    /// drain timeout, then destroys filters in reverse registration order.
    ///
    /// # Errors
    ///
    /// Fails if the runtime is already stopped.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.lifecycle.state() == LifecycleState::Stopped {
            anyhow::bail!("runtime already stopped");
        }
        self.lifecycle.trigger_drain();
        info!(in_flight = self.in_flight(), "client runtime draining");

        let timeout = Duration::from_millis(self.config.shutdown_drain_timeout_ms);
        if !self.lifecycle.wait_for_drain(timeout).await {
            warn!(
                in_flight = self.in_flight(),
                "drain timed out, stopping with calls still in flight"
            );
            self.lifecycle.set_stopped();
        }

        self.filters.destroy_all();
        self.proxies.clear();
        info!("client runtime stopped");
        Ok(())
    }
}

impl std::fmt::Debug for ClientRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRuntime")
            .field("state", &self.lifecycle.state())
            .field("filters", &self.filters)
            .field("codecs", &self.codecs)
            .field("proxies", &self.proxies.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tailrpc_core::{FilterPoint, Payload, RequestContext};

    use super::*;
    use crate::config::FilterConfig;
    use crate::filter::TimingFilter;
    use crate::testing::{CallLog, MockTransport, RecordingFilter, Script};

    fn runtime_with(config: ClientConfig) -> (ClientRuntime, Arc<MockTransport>) {
        let transport = MockTransport::new();
        (ClientRuntime::new(config, transport.clone()), transport)
    }

    #[test]
    fn init_runs_filters_in_order_and_marks_ready() {
        let (runtime, _) = runtime_with(ClientConfig::default());
        let log = CallLog::default();
        runtime.register_filter(RecordingFilter::shared("a", log.clone())).unwrap();
        runtime.register_filter(RecordingFilter::shared("b", log.clone())).unwrap();

        runtime.init().unwrap();
        assert_eq!(runtime.state(), LifecycleState::Ready);
        assert_eq!(log.entries(), ["a.init", "b.init"]);
        assert!(runtime.init().is_err());
    }

    #[test]
    fn init_requires_configured_global_filters() {
        let config = ClientConfig {
            global_filters: vec!["auth".into()],
            ..ClientConfig::default()
        };
        let (runtime, _) = runtime_with(config);
        let err = runtime.init().unwrap_err();
        assert!(err.to_string().contains("unknown filter: auth"));
        assert_eq!(runtime.state(), LifecycleState::Starting);
    }

    #[test]
    fn failing_filter_init_keeps_runtime_starting() {
        let (runtime, _) = runtime_with(ClientConfig::default());
        let filter = RecordingFilter::new("broken", CallLog::default()).failing_init();
        runtime.register_filter(Arc::new(filter)).unwrap();

        assert!(runtime.init().is_err());
        assert_eq!(runtime.state(), LifecycleState::Starting);
    }

    #[test]
    fn proxies_are_cached_by_service_name() {
        let (runtime, _) = runtime_with(ClientConfig::default());
        runtime.init().unwrap();

        let first = runtime.proxy(ProxyConfig::new("ledger")).unwrap();
        let second = runtime
            .proxy(ProxyConfig::new("ledger").with_timeout(10))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().timeout_ms, None);
    }

    #[test]
    fn proxy_rejects_unknown_collaborators() {
        let (runtime, _) = runtime_with(ClientConfig::default());
        runtime.init().unwrap();

        assert_eq!(
            runtime
                .proxy(ProxyConfig::new("a").with_codec("thrift"))
                .unwrap_err(),
            RuntimeError::UnknownCodec {
                name: "thrift".into()
            }
        );
        assert_eq!(
            runtime
                .proxy(ProxyConfig::new("b").with_selector("consul"))
                .unwrap_err(),
            RuntimeError::UnknownSelector {
                name: "consul".into()
            }
        );
        assert_eq!(
            runtime
                .proxy(ProxyConfig::new("c").with_filter(FilterConfig::new("auth")))
                .unwrap_err(),
            RuntimeError::Filter(FilterError::Unknown {
                name: "auth".into()
            })
        );
        assert!(matches!(
            runtime.proxy(ProxyConfig::default()),
            Err(RuntimeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn service_filters_are_created_from_their_config() {
        let (runtime, _) = runtime_with(ClientConfig::default());
        runtime
            .register_filter(Arc::new(TimingFilter::default()))
            .unwrap();
        runtime.init().unwrap();

        let config = ProxyConfig::new("ledger").with_filter(
            FilterConfig::new(TimingFilter::NAME)
                .with_config(serde_json::json!({"slow_threshold_ms": 5})),
        );
        let proxy = runtime.proxy(config).unwrap();
        let service_tier = proxy.filters().service_filters();
        assert!(!service_tier.is_empty());
        let global = runtime.filters().get(TimingFilter::NAME).unwrap();
        let instance = service_tier.get(FilterPoint::ClientPreRpcInvoke)[0].clone();
        assert!(!Arc::ptr_eq(&global, &instance));
    }

    #[tokio::test]
    async fn calls_before_init_are_refused() {
        let (runtime, transport) = runtime_with(ClientConfig::default());
        let proxy = runtime
            .proxy(ProxyConfig::new("ledger").with_target("10.0.0.1:8000"))
            .unwrap();

        let mut ctx = RequestContext::new();
        let err = proxy
            .unary_invoke(&mut ctx, &Payload::Bytes(Bytes::from_static(b"hi")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Unknown));
        assert_eq!(err.message(), "runtime not ready");
        assert_eq!(ctx.status(), &err);
        assert_eq!(transport.send_recv_calls(), 0);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work_and_destroys_filters_in_reverse() {
        let (runtime, transport) = runtime_with(ClientConfig::default());
        let log = CallLog::default();
        runtime.register_filter(RecordingFilter::shared("a", log.clone())).unwrap();
        runtime.register_filter(RecordingFilter::shared("b", log.clone())).unwrap();
        runtime.init().unwrap();
        let proxy = runtime
            .proxy(ProxyConfig::new("ledger").with_target("10.0.0.1:8000"))
            .unwrap();

        runtime.shutdown().await.unwrap();
        assert_eq!(runtime.state(), LifecycleState::Stopped);
        let entries = log.entries();
        assert_eq!(&entries[entries.len() - 2..], ["b.destroy", "a.destroy"]);

        let mut ctx = RequestContext::new();
        let err = proxy
            .oneway_invoke(&mut ctx, &Payload::Bytes(Bytes::new()))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "runtime not ready");
        assert_eq!(transport.send_only_calls(), 0);
        assert_eq!(
            runtime.proxy(ProxyConfig::new("other")).unwrap_err(),
            RuntimeError::NotReady
        );
        assert!(runtime.shutdown().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_calls() {
        let (runtime, transport) = runtime_with(ClientConfig::default());
        transport.script("10.0.0.1:8000", Script::echo(200));
        runtime.init().unwrap();
        let proxy = runtime
            .proxy(ProxyConfig::new("ledger").with_target("10.0.0.1:8000"))
            .unwrap();

        let call = proxy.async_unary_invoke(
            RequestContext::new(),
            Payload::Bytes(Bytes::from_static(b"slow")),
        );
        tokio::task::yield_now().await;
        assert_eq!(runtime.in_flight(), 1);

        runtime.shutdown().await.unwrap();
        assert_eq!(runtime.in_flight(), 0);
        let (_, result) = call.await;
        assert_eq!(result.unwrap(), Payload::Bytes(Bytes::from_static(b"slow")));
    }

    #[tokio::test(start_paused = true)]
    async fn filters_registered_mid_call_are_refused() {
        let (runtime, transport) = runtime_with(ClientConfig::default());
        transport.script("10.0.0.1:8000", Script::echo(200));
        let log = CallLog::default();
        runtime.register_filter(RecordingFilter::shared("early", log.clone())).unwrap();
        runtime.init().unwrap();
        let proxy = runtime
            .proxy(ProxyConfig::new("ledger").with_target("10.0.0.1:8000"))
            .unwrap();

        let call = proxy.async_unary_invoke(
            RequestContext::new(),
            Payload::Bytes(Bytes::from_static(b"hi")),
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let err = runtime
            .register_filter(RecordingFilter::shared("late", log.clone()))
            .unwrap_err();
        assert_eq!(err, FilterError::Sealed { name: "late".into() });

        let (_, result) = call.await;
        assert!(result.is_ok());
        assert_eq!(log.entries(), ["early.init", "early.pre", "early.post"]);
    }
}

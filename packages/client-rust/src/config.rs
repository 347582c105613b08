//! Runtime and per-proxy configuration.
//!
//! Both structs deserialize from any `serde` format with every field
//! optional; locating and reading config files is left to the host.

use serde::{Deserialize, Serialize};
use tailrpc_core::EncodeType;

use crate::codec::MsgPackCodec;
use crate::selector::DirectSelector;

/// Runtime-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Global filters that must be registered before `init()`.
    pub global_filters: Vec<String>,
    /// Codec for proxies that do not name one.
    pub default_codec: String,
    /// Selector for proxies that do not name one.
    pub default_selector: String,
    /// Per-proxy in-flight dispatch limit unless the proxy overrides it.
    pub max_concurrent_dispatches: u32,
    /// How long `shutdown()` waits for in-flight calls.
    pub shutdown_drain_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            global_filters: Vec::new(),
            default_codec: MsgPackCodec::NAME.to_string(),
            default_selector: DirectSelector::NAME.to_string(),
            max_concurrent_dispatches: 10_000,
            shutdown_drain_timeout_ms: 5_000,
        }
    }
}

/// A service-level filter and the config blob its instance is created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl FilterConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// Configuration of one service proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Service name; proxies are cached under it.
    pub service_name: String,
    /// What the selector resolves. Empty means `service_name`.
    pub target: String,
    /// Name this client reports as caller.
    pub caller_name: String,
    pub codec: Option<String>,
    pub selector: Option<String>,
    /// Proxy-level timeout, composed with the caller's budget.
    pub timeout_ms: Option<u32>,
    /// Request encoding for callers that leave it unset. `None` derives it
    /// from the payload.
    pub encode_type: Option<EncodeType>,
    pub compress_type: u8,
    pub compress_level: u8,
    /// Service-level filters, run after the global tier.
    pub filters: Vec<FilterConfig>,
    pub max_in_flight: Option<u32>,
}

impl ProxyConfig {
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn with_encode_type(mut self, encode_type: EncodeType) -> Self {
        self.encode_type = Some(encode_type);
        self
    }

    #[must_use]
    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = Some(codec.into());
        self
    }

    #[must_use]
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: FilterConfig) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn with_max_in_flight(mut self, limit: u32) -> Self {
        self.max_in_flight = Some(limit);
        self
    }

    /// The name handed to the selector.
    #[must_use]
    pub fn resolved_target(&self) -> &str {
        if self.target.is_empty() {
            &self.service_name
        } else {
            &self.target
        }
    }
}

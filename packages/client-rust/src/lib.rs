//! `tailrpc` client: invocation pipeline, filter chain, backup requests and
//! the runtime that assembles service proxies.

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod filter;
pub mod logging;
pub mod proxy;
pub mod runtime;
pub mod selector;
pub mod stats;

#[cfg(test)]
mod testing;

pub use codec::{CodecRegistry, MsgPackCodec, SerializationError, SharedCodec};
pub use config::{ClientConfig, FilterConfig, ProxyConfig};
pub use filter::{Filter, FilterChain, FilterError, FilterRegistry, FilterStatus, SharedFilter};
pub use logging::{init_tracing, LogFormat};
pub use proxy::{ResponseFuture, ServiceProxy, StreamReader, StreamWriter};
pub use runtime::lifecycle::LifecycleState;
pub use runtime::{ClientRuntime, RuntimeError};
pub use selector::{DirectSelector, StaticSelector};
pub use stats::ProxyStatsSnapshot;

//! Protocol codecs and payload body serialization.
//!
//! - [`msgpack`]: reference envelope codec
//! - [`serialization`]: payload <-> body bytes per encode/data type

pub mod msgpack;
pub mod serialization;

use std::sync::Arc;

use dashmap::DashMap;
use tailrpc_core::Codec;

pub use msgpack::MsgPackCodec;
pub use serialization::{deserialize, serialize, SerializationError};

/// Codecs shared between proxies.
pub type SharedCodec = Arc<dyn Codec>;

// ---------------------------------------------------------------------------
// CodecRegistry
// ---------------------------------------------------------------------------

/// Codecs keyed by protocol name.
///
/// Proxies resolve their codec once at construction, so later registrations
/// only affect proxies built afterwards.
pub struct CodecRegistry {
    by_name: DashMap<String, SharedCodec>,
}

impl CodecRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
        }
    }

    /// Creates a registry holding the built-in [`MsgPackCodec`].
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(MsgPackCodec));
        registry
    }

    /// Registers `codec` under its name, replacing any previous codec.
    pub fn register(&self, codec: SharedCodec) -> Option<SharedCodec> {
        let name = codec.name().to_string();
        tracing::debug!(codec = %name, "codec registered");
        self.by_name.insert(name, codec)
    }

    pub fn get(&self, name: &str) -> Option<SharedCodec> {
        self.by_name.get(name).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FailingCodec;

    #[test]
    fn defaults_include_msgpack() {
        let registry = CodecRegistry::default();
        assert_eq!(registry.get("msgpack").unwrap().name(), "msgpack");
        assert!(registry.get("thrift").is_none());
    }

    #[test]
    fn register_replaces_by_name() {
        let registry = CodecRegistry::new();
        assert!(registry.register(Arc::new(FailingCodec)).is_none());
        assert!(registry.register(Arc::new(FailingCodec)).is_some());
        assert_eq!(registry.names(), ["failing"]);
    }
}

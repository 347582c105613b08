use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{validate_points, FilterError, FilterQueues, SharedFilter};

// ---------------------------------------------------------------------------
// FilterRegistry
// ---------------------------------------------------------------------------

/// Process-wide registry of global filters.
///
/// Provides two views:
/// - **By name** (`get`): prototype lookup when proxies build their service tier
/// - **By point** (`snapshot`): the global tier queues, read lock-free by every call
///
/// Filters are registered during startup, initialized in registration order
/// and destroyed in reverse order. A successful `init_all` seals the
/// registry: the global tier never changes while calls are in flight, so a
/// post point always walks the filters whose pre point ran.
pub struct FilterRegistry {
    /// Name-based lookup: filter name -> shared filter.
    by_name: DashMap<String, SharedFilter>,
    /// Global tier queues, swapped wholesale on registration.
    queues: ArcSwap<FilterQueues>,
    /// Registration order; the write lock also serializes registrations
    /// against `init_all`.
    init_order: RwLock<Vec<String>>,
    sealed: AtomicBool,
}

impl FilterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            queues: ArcSwap::from_pointee(FilterQueues::new()),
            init_order: RwLock::new(Vec::new()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Register a global filter at every point it declares.
    ///
    /// # Errors
    ///
    /// Returns `FilterError::Sealed` once the registry was initialized,
    /// `FilterError::Duplicate` for a name already in use, or a validation
    /// error for malformed point lists.
    pub fn register(&self, filter: SharedFilter) -> Result<(), FilterError> {
        validate_points(filter.as_ref())?;
        let mut order = self.init_order.write();
        let name = filter.name().to_string();
        if self.is_sealed() {
            return Err(FilterError::Sealed { name });
        }
        if self.by_name.contains_key(&name) {
            return Err(FilterError::Duplicate { name });
        }

        let mut next = FilterQueues::clone(&self.queues.load());
        next.add(Arc::clone(&filter))?;
        self.queues.store(Arc::new(next));

        self.by_name.insert(name.clone(), filter);
        tracing::debug!(filter = %name, "global filter registered");
        order.push(name);
        Ok(())
    }

    /// Retrieve a filter by its name.
    pub fn get(&self, name: &str) -> Option<SharedFilter> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// Builds the service-level instance of the named filter from its config
    /// blob, falling back to the shared instance.
    ///
    /// # Errors
    ///
    /// Returns `FilterError::Unknown` if no filter has that name.
    pub fn create_service_filter(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<SharedFilter, FilterError> {
        let prototype = self.get(name).ok_or_else(|| FilterError::Unknown {
            name: name.to_string(),
        })?;
        Ok(prototype.create(config).unwrap_or(prototype))
    }

    /// Current global tier queues.
    #[must_use]
    pub fn snapshot(&self) -> Arc<FilterQueues> {
        self.queues.load_full()
    }

    /// Names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.init_order.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Initialize all registered filters in registration order, then seal
    /// the registry against further registrations.
    ///
    /// # Errors
    ///
    /// Returns the first `init()` failure; later filters are not initialized
    /// and the registry stays open.
    pub fn init_all(&self) -> anyhow::Result<()> {
        let order = self.init_order.write();
        for name in order.iter() {
            if let Some(filter) = self.get(name) {
                filter
                    .init()
                    .map_err(|e| e.context(format!("initializing filter {name}")))?;
            }
        }
        self.sealed.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether `init_all` has succeeded.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Destroy all registered filters in reverse registration order.
    pub fn destroy_all(&self) {
        let order = self.init_order.read().clone();
        for name in order.iter().rev() {
            if let Some(filter) = self.get(name) {
                filter.destroy();
            }
        }
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("filters", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tailrpc_core::FilterPoint;

    use super::*;
    use crate::testing::{CallLog, RecordingFilter};

    #[test]
    fn register_and_get_by_name() {
        let registry = FilterRegistry::new();
        registry
            .register(RecordingFilter::shared("auth", CallLog::default()))
            .unwrap();

        let filter = registry.get("auth");
        assert!(filter.is_some());
        assert_eq!(filter.unwrap().name(), "auth");
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let registry = FilterRegistry::new();
        let log = CallLog::default();
        registry
            .register(RecordingFilter::shared("auth", log.clone()))
            .unwrap();
        let err = registry
            .register(RecordingFilter::shared("auth", log))
            .unwrap_err();
        assert_eq!(err, FilterError::Duplicate { name: "auth".into() });
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot().get(FilterPoint::ClientPreRpcInvoke).len(), 1);
    }

    #[test]
    fn snapshot_taken_before_registration_is_stable() {
        let registry = FilterRegistry::new();
        let log = CallLog::default();
        registry
            .register(RecordingFilter::shared("first", log.clone()))
            .unwrap();
        let before = registry.snapshot();
        registry
            .register(RecordingFilter::shared("second", log))
            .unwrap();

        assert_eq!(before.get(FilterPoint::ClientPreRpcInvoke).len(), 1);
        assert_eq!(registry.snapshot().get(FilterPoint::ClientPreRpcInvoke).len(), 2);
    }

    #[test]
    fn init_all_in_order_and_destroy_in_reverse() {
        let log = CallLog::default();
        let registry = FilterRegistry::new();
        registry.register(RecordingFilter::shared("first", log.clone())).unwrap();
        registry.register(RecordingFilter::shared("second", log.clone())).unwrap();
        registry.register(RecordingFilter::shared("third", log.clone())).unwrap();

        registry.init_all().unwrap();
        registry.destroy_all();

        assert_eq!(
            log.entries(),
            [
                "first.init",
                "second.init",
                "third.init",
                "third.destroy",
                "second.destroy",
                "first.destroy"
            ]
        );
    }

    #[test]
    fn registration_after_init_is_refused() {
        let log = CallLog::default();
        let registry = FilterRegistry::new();
        registry.register(RecordingFilter::shared("early", log.clone())).unwrap();
        registry.init_all().unwrap();
        assert!(registry.is_sealed());

        let err = registry
            .register(RecordingFilter::shared("late", log.clone()))
            .unwrap_err();
        assert_eq!(err, FilterError::Sealed { name: "late".into() });
        assert!(registry.get("late").is_none());
        assert_eq!(registry.snapshot().get(FilterPoint::ClientPostRpcInvoke).len(), 1);
        assert_eq!(log.entries(), ["early.init"]);
    }

    #[test]
    fn init_failure_names_the_filter() {
        let registry = FilterRegistry::new();
        registry
            .register(Arc::new(
                RecordingFilter::new("broken", CallLog::default()).failing_init(),
            ))
            .unwrap();
        let err = registry.init_all().unwrap_err();
        assert!(format!("{err:#}").contains("broken"));
        assert!(!registry.is_sealed());
    }

    #[test]
    fn service_filter_falls_back_to_shared_instance() {
        let registry = FilterRegistry::new();
        let shared = RecordingFilter::shared("plain", CallLog::default());
        registry.register(Arc::clone(&shared)).unwrap();

        let service = registry
            .create_service_filter("plain", &serde_json::Value::Null)
            .unwrap();
        assert!(Arc::ptr_eq(&shared, &service));

        let err = registry
            .create_service_filter("missing", &serde_json::Value::Null)
            .err()
            .unwrap();
        assert!(matches!(err, FilterError::Unknown { .. }));
    }
}

//! Thread-safe store tracking every (domain, identifier) pair through its
//! setup lifecycle.
//!
//! All mutation and query happens under one lock; events are dispatched and
//! setup functions invoked only after the lock is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use argus_types::{topics, CameraId, Domain};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::domains::{Camera, DomainInstance, FailedCamera, MotionScanner, ObjectScanner};
use crate::errors::{DomainError, SetupError};
use crate::events::{EventDispatcher, EventKind};
use crate::Argus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    /// Configured, waiting for setup.
    Pending,
    /// Currently being set up.
    Loading,
    /// Successfully loaded.
    Loaded,
    /// Failed to load.
    Failed,
    /// Failed but will retry.
    Retrying,
}

impl DomainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::Pending => "pending",
            DomainState::Loading => "loading",
            DomainState::Loaded => "loaded",
            DomainState::Failed => "failed",
            DomainState::Retrying => "retrying",
        }
    }
}

/// Reference to a (domain, identifier) pair, used for dependency edges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainRef {
    pub domain: Domain,
    pub identifier: String,
}

impl DomainRef {
    pub fn new<S: Into<String>>(domain: Domain, identifier: S) -> Self {
        DomainRef {
            domain,
            identifier: identifier.into(),
        }
    }
}

pub type DomainSetupFn =
    Arc<dyn Fn(&Arc<Argus>) -> Result<DomainInstance, SetupError> + Send + Sync>;

/// Registration request handed to [`DomainRegistry::register`].
pub struct DomainSetup {
    pub component: String,
    pub domain: Domain,
    pub identifier: String,
    pub setup: DomainSetupFn,
    pub require: Vec<DomainRef>,
    pub optional: Vec<DomainRef>,
}

/// Completion signal for `wait_for_domain`. Fulfilled exactly once, on the
/// first terminal transition.
pub(crate) struct SetupSignal {
    state: Mutex<Option<bool>>,
    cond: Condvar,
}

impl SetupSignal {
    fn new() -> Arc<Self> {
        Arc::new(SetupSignal {
            state: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn fulfill(&self, loaded: bool) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(loaded);
            self.cond.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> Option<bool> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.is_none() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            if self.cond.wait_for(&mut state, deadline - now).timed_out() && state.is_none() {
                return None;
            }
        }
        *state
    }
}

#[derive(Clone)]
pub struct DomainEntry {
    pub component: String,
    pub domain: Domain,
    pub identifier: String,
    pub require_domains: Vec<DomainRef>,
    pub optional_domains: Vec<DomainRef>,
    pub state: DomainState,
    pub instance: Option<DomainInstance>,
    pub error: Option<String>,
    pub error_instance: Option<Arc<FailedCamera>>,
    pub attempts: u32,
    pub(crate) setup: DomainSetupFn,
    pub(crate) signal: Arc<SetupSignal>,
}

impl DomainEntry {
    pub fn domain_ref(&self) -> DomainRef {
        DomainRef::new(self.domain, self.identifier.clone())
    }
}

pub struct DomainRegistry {
    events: EventDispatcher,
    inner: Mutex<HashMap<(Domain, String), DomainEntry>>,
}

impl DomainRegistry {
    pub fn new(events: EventDispatcher) -> Self {
        DomainRegistry {
            events,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a domain for setup; it starts in PENDING. Re-registration
    /// while LOADED or LOADING is a no-op with a warning.
    pub fn register(&self, setup: DomainSetup) {
        let key = (setup.domain, setup.identifier.clone());
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.get(&key) {
            if matches!(existing.state, DomainState::Loaded | DomainState::Loading) {
                warn!(
                    "domain {} with identifier {} already registered (state: {}), skipping",
                    setup.domain,
                    setup.identifier,
                    existing.state.as_str()
                );
                return;
            }
        }
        debug!(
            "registered domain {} with identifier {} for component {}",
            setup.domain, setup.identifier, setup.component
        );
        inner.insert(
            key,
            DomainEntry {
                component: setup.component,
                domain: setup.domain,
                identifier: setup.identifier,
                require_domains: setup.require,
                optional_domains: setup.optional,
                state: DomainState::Pending,
                instance: None,
                error: None,
                error_instance: None,
                attempts: 0,
                setup: setup.setup,
                signal: SetupSignal::new(),
            },
        );
    }

    /// Update an entry's state, dispatching the status event (and on LOADED
    /// the `domain_registered` event) outside the lock.
    pub fn set_state(
        &self,
        domain: Domain,
        identifier: &str,
        state: DomainState,
        error: Option<String>,
    ) {
        let info = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.get_mut(&(domain, identifier.to_string())) else {
                warn!("cannot set state for missing domain {domain} with identifier {identifier}");
                return;
            };
            let old_state = entry.state;
            entry.state = state;
            if error.is_some() {
                entry.error = error.clone();
            }
            debug!(
                "domain {} with identifier {}: {} -> {}",
                domain,
                identifier,
                old_state.as_str(),
                state.as_str()
            );
            (
                entry.component.clone(),
                entry.instance.is_some(),
                entry.signal.clone(),
            )
        };
        let (component, has_instance, signal) = info;

        self.events.dispatch(
            &topics::domain_state(state.as_str(), domain, identifier),
            EventKind::DomainSetupStatus {
                component,
                domain,
                identifier: identifier.to_string(),
                state,
                error,
            },
            false,
        );

        match state {
            DomainState::Loaded => {
                if has_instance {
                    self.events.dispatch(
                        &topics::domain_registered(domain),
                        EventKind::DomainRegistered {
                            domain,
                            identifier: identifier.to_string(),
                        },
                        false,
                    );
                    signal.fulfill(true);
                } else {
                    warn!(
                        "domain {domain} with identifier {identifier} loaded \
                         but the instance has not been set"
                    );
                }
            }
            DomainState::Failed => signal.fulfill(false),
            _ => {}
        }
    }

    pub fn set_instance(&self, domain: Domain, identifier: &str, instance: DomainInstance) {
        let mut inner = self.inner.lock();
        match inner.get_mut(&(domain, identifier.to_string())) {
            Some(entry) => entry.instance = Some(instance),
            None => warn!(
                "cannot set instance for missing domain {domain} with identifier {identifier}"
            ),
        }
    }

    pub fn set_error_instance(&self, domain: Domain, identifier: &str, failed: FailedCamera) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(&(domain, identifier.to_string())) {
            entry.error_instance = Some(Arc::new(failed));
        }
    }

    /// Increment and return the entry's setup attempt counter.
    pub fn bump_attempts(&self, domain: Domain, identifier: &str) -> u32 {
        let mut inner = self.inner.lock();
        match inner.get_mut(&(domain, identifier.to_string())) {
            Some(entry) => {
                entry.attempts += 1;
                entry.attempts
            }
            None => 0,
        }
    }

    /// Remove an entry completely. Returns it for cleanup.
    pub fn unregister(&self, domain: Domain, identifier: &str) -> Option<DomainEntry> {
        let entry = self.inner.lock().remove(&(domain, identifier.to_string()));
        if let Some(ref entry) = entry {
            debug!(
                "unregistered domain {} with identifier {} for component {}",
                domain, identifier, entry.component
            );
            self.events.dispatch(
                &topics::domain_unregistered(domain),
                EventKind::DomainUnregistered {
                    domain,
                    identifier: identifier.to_string(),
                },
                false,
            );
        }
        entry
    }

    pub fn get(&self, domain: Domain, identifier: &str) -> Option<DomainEntry> {
        self.inner
            .lock()
            .get(&(domain, identifier.to_string()))
            .cloned()
    }

    /// The instance for a loaded domain; errors unless state is LOADED and
    /// the instance is set.
    pub fn get_instance(
        &self,
        domain: Domain,
        identifier: &str,
    ) -> Result<DomainInstance, DomainError> {
        let inner = self.inner.lock();
        if let Some(entry) = inner.get(&(domain, identifier.to_string())) {
            if entry.state == DomainState::Loaded {
                if let Some(instance) = &entry.instance {
                    return Ok(instance.clone());
                }
            }
        }
        Err(DomainError::NotRegistered {
            domain,
            identifier: identifier.to_string(),
        })
    }

    pub fn get_camera(&self, identifier: &CameraId) -> Result<Arc<dyn Camera>, DomainError> {
        self.get_instance(Domain::Camera, identifier.as_str())?
            .as_camera()
            .ok_or_else(|| DomainError::NotRegistered {
                domain: Domain::Camera,
                identifier: identifier.as_str().to_string(),
            })
    }

    pub fn get_motion_scanner(
        &self,
        identifier: &CameraId,
    ) -> Result<Arc<dyn MotionScanner>, DomainError> {
        self.get_instance(Domain::MotionDetector, identifier.as_str())?
            .as_motion_scanner()
            .ok_or_else(|| DomainError::NotRegistered {
                domain: Domain::MotionDetector,
                identifier: identifier.as_str().to_string(),
            })
    }

    pub fn get_object_scanner(
        &self,
        identifier: &CameraId,
    ) -> Result<Arc<dyn ObjectScanner>, DomainError> {
        self.get_instance(Domain::ObjectDetector, identifier.as_str())?
            .as_object_scanner()
            .ok_or_else(|| DomainError::NotRegistered {
                domain: Domain::ObjectDetector,
                identifier: identifier.as_str().to_string(),
            })
    }

    /// All loaded instances for a domain, keyed by identifier.
    pub fn get_all_instances(&self, domain: Domain) -> HashMap<String, DomainInstance> {
        self.inner
            .lock()
            .values()
            .filter(|e| e.domain == domain && e.state == DomainState::Loaded)
            .filter_map(|e| Some((e.identifier.clone(), e.instance.clone()?)))
            .collect()
    }

    pub fn get_identifiers(&self, domain: Domain) -> Vec<String> {
        self.inner
            .lock()
            .values()
            .filter(|e| e.domain == domain)
            .map(|e| e.identifier.clone())
            .collect()
    }

    pub fn all_entries(&self) -> Vec<DomainEntry> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn get_by_state(&self, state: DomainState) -> Vec<DomainEntry> {
        self.inner
            .lock()
            .values()
            .filter(|e| e.state == state)
            .cloned()
            .collect()
    }

    pub fn get_pending(&self) -> Vec<DomainEntry> {
        self.get_by_state(DomainState::Pending)
    }

    pub fn get_loaded(&self, domain: Domain) -> HashMap<String, DomainEntry> {
        self.inner
            .lock()
            .values()
            .filter(|e| e.domain == domain && e.state == DomainState::Loaded)
            .map(|e| (e.identifier.clone(), e.clone()))
            .collect()
    }

    pub fn get_failed(&self, domain: Domain) -> HashMap<String, DomainEntry> {
        self.inner
            .lock()
            .values()
            .filter(|e| {
                e.domain == domain
                    && matches!(e.state, DomainState::Failed | DomainState::Retrying)
            })
            .map(|e| (e.identifier.clone(), e.clone()))
            .collect()
    }

    pub fn is_loaded(&self, domain: Domain, identifier: &str) -> bool {
        self.inner
            .lock()
            .get(&(domain, identifier.to_string()))
            .map(|e| e.state == DomainState::Loaded)
            .unwrap_or(false)
    }

    pub fn is_configured(&self, domain: Domain, identifier: &str) -> bool {
        self.inner
            .lock()
            .contains_key(&(domain, identifier.to_string()))
    }

    /// Loaded entries whose required-or-optional list names the target.
    pub fn get_dependents(&self, domain: Domain, identifier: &str) -> Vec<DomainEntry> {
        let target = DomainRef::new(domain, identifier);
        self.inner
            .lock()
            .values()
            .filter(|e| e.state == DomainState::Loaded)
            .filter(|e| {
                e.require_domains.contains(&target) || e.optional_domains.contains(&target)
            })
            .cloned()
            .collect()
    }

    /// Fail every PENDING entry whose required dependencies are not
    /// registered at all. Returns the failed refs.
    pub fn validate_dependencies(&self) -> Vec<DomainRef> {
        let mut missing: Vec<(DomainRef, String)> = Vec::new();
        {
            let inner = self.inner.lock();
            for entry in inner.values() {
                if entry.state != DomainState::Pending {
                    continue;
                }
                for req in &entry.require_domains {
                    if !inner.contains_key(&(req.domain, req.identifier.clone())) {
                        missing.push((
                            entry.domain_ref(),
                            format!(
                                "required domain {} with identifier {} not configured",
                                req.domain, req.identifier
                            ),
                        ));
                        break;
                    }
                }
            }
        }
        let mut failed = Vec::with_capacity(missing.len());
        for (domain_ref, error) in missing {
            self.set_state(
                domain_ref.domain,
                &domain_ref.identifier,
                DomainState::Failed,
                Some(error),
            );
            failed.push(domain_ref);
        }
        failed
    }

    /// Block until the entry reaches LOADED, FAILED, or the timeout expires.
    pub fn wait_for_domain(
        &self,
        domain: Domain,
        identifier: &str,
        timeout: Duration,
    ) -> Result<DomainInstance, DomainError> {
        let signal = {
            let inner = self.inner.lock();
            inner
                .get(&(domain, identifier.to_string()))
                .map(|e| e.signal.clone())
                .ok_or(DomainError::NotRegistered {
                    domain,
                    identifier: identifier.to_string(),
                })?
        };
        match signal.wait(timeout) {
            Some(true) => self.get_instance(domain, identifier),
            Some(false) => Err(DomainError::LoadFailed {
                domain,
                identifier: identifier.to_string(),
            }),
            None => Err(DomainError::WaitTimeout {
                domain,
                identifier: identifier.to_string(),
                timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::PostProcessor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubInstance;
    impl PostProcessor for StubInstance {
        fn shutdown(&self) {}
    }

    fn stub_instance() -> DomainInstance {
        DomainInstance::PostProcessor(Arc::new(StubInstance))
    }

    fn stub_setup(
        registry_domain: Domain,
        identifier: &str,
        require: Vec<DomainRef>,
    ) -> DomainSetup {
        DomainSetup {
            component: "test".into(),
            domain: registry_domain,
            identifier: identifier.into(),
            setup: Arc::new(|_| Ok(stub_instance())),
            require,
            optional: vec![],
        }
    }

    fn registry() -> DomainRegistry {
        DomainRegistry::new(EventDispatcher::new())
    }

    fn load(registry: &DomainRegistry, domain: Domain, identifier: &str) {
        registry.set_instance(domain, identifier, stub_instance());
        registry.set_state(domain, identifier, DomainState::Loaded, None);
    }

    #[test]
    fn get_instance_only_when_loaded_with_instance() {
        let reg = registry();
        reg.register(stub_setup(Domain::Camera, "cam_1", vec![]));
        assert!(reg.get_instance(Domain::Camera, "cam_1").is_err());

        // Loaded without instance: still an error.
        reg.set_state(Domain::Camera, "cam_1", DomainState::Loaded, None);
        assert!(reg.get_instance(Domain::Camera, "cam_1").is_err());

        reg.set_instance(Domain::Camera, "cam_1", stub_instance());
        reg.set_state(Domain::Camera, "cam_1", DomainState::Loaded, None);
        assert!(reg.get_instance(Domain::Camera, "cam_1").is_ok());
    }

    #[test]
    fn reregistration_while_loaded_is_a_noop() {
        let reg = registry();
        reg.register(stub_setup(Domain::Camera, "cam_1", vec![]));
        load(&reg, Domain::Camera, "cam_1");
        // Attempt to re-register; the loaded entry must survive.
        reg.register(stub_setup(Domain::Camera, "cam_1", vec![]));
        let entry = reg.get(Domain::Camera, "cam_1").unwrap();
        assert_eq!(entry.state, DomainState::Loaded);
        assert!(entry.instance.is_some());
    }

    #[test]
    fn register_unregister_register_leaves_no_residue() {
        let reg = registry();
        reg.register(stub_setup(Domain::Camera, "cam_1", vec![]));
        load(&reg, Domain::Camera, "cam_1");
        assert!(reg.unregister(Domain::Camera, "cam_1").is_some());
        assert!(!reg.is_configured(Domain::Camera, "cam_1"));

        reg.register(stub_setup(Domain::Camera, "cam_1", vec![]));
        let entry = reg.get(Domain::Camera, "cam_1").unwrap();
        assert_eq!(entry.state, DomainState::Pending);
        assert!(entry.instance.is_none());
        assert!(entry.error.is_none());
        assert_eq!(entry.attempts, 0);
    }

    #[test]
    fn dependents_walk_loaded_entries() {
        let reg = registry();
        reg.register(stub_setup(Domain::Camera, "cam_1", vec![]));
        reg.register(stub_setup(
            Domain::ObjectDetector,
            "cam_1",
            vec![DomainRef::new(Domain::Camera, "cam_1")],
        ));
        reg.register(stub_setup(
            Domain::Nvr,
            "cam_1",
            vec![DomainRef::new(Domain::ObjectDetector, "cam_1")],
        ));
        load(&reg, Domain::Camera, "cam_1");
        load(&reg, Domain::ObjectDetector, "cam_1");
        load(&reg, Domain::Nvr, "cam_1");

        let deps = reg.get_dependents(Domain::Camera, "cam_1");
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].domain, Domain::ObjectDetector);
    }

    #[test]
    fn validate_dependencies_fails_unconfigured_requirements() {
        let reg = registry();
        reg.register(stub_setup(
            Domain::Nvr,
            "cam_1",
            vec![DomainRef::new(Domain::Camera, "cam_1")],
        ));
        let failed = reg.validate_dependencies();
        assert_eq!(failed.len(), 1);
        let entry = reg.get(Domain::Nvr, "cam_1").unwrap();
        assert_eq!(entry.state, DomainState::Failed);
        assert!(entry.error.unwrap().contains("not configured"));
    }

    #[test]
    fn state_transitions_dispatch_events() {
        let events = EventDispatcher::new();
        let reg = DomainRegistry::new(events.clone());
        let status_count = Arc::new(AtomicUsize::new(0));
        let registered_count = Arc::new(AtomicUsize::new(0));
        let sc = status_count.clone();
        let rc = registered_count.clone();
        events.listen_all(move |event| match event.kind {
            EventKind::DomainSetupStatus { .. } => {
                sc.fetch_add(1, Ordering::SeqCst);
            }
            EventKind::DomainRegistered { .. } => {
                rc.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        });

        reg.register(stub_setup(Domain::Camera, "cam_1", vec![]));
        reg.set_state(Domain::Camera, "cam_1", DomainState::Loading, None);
        reg.set_instance(Domain::Camera, "cam_1", stub_instance());
        reg.set_state(Domain::Camera, "cam_1", DomainState::Loaded, None);

        assert_eq!(status_count.load(Ordering::SeqCst), 2);
        assert_eq!(registered_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_for_domain_observes_load_and_failure() {
        let reg = Arc::new(registry());
        reg.register(stub_setup(Domain::Camera, "cam_1", vec![]));

        let reg2 = reg.clone();
        let waiter = std::thread::spawn(move || {
            reg2.wait_for_domain(Domain::Camera, "cam_1", Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(50));
        load(&reg, Domain::Camera, "cam_1");
        assert!(waiter.join().unwrap().is_ok());

        reg.register(stub_setup(Domain::Camera, "cam_2", vec![]));
        reg.set_state(Domain::Camera, "cam_2", DomainState::Failed, Some("x".into()));
        let result = reg.wait_for_domain(Domain::Camera, "cam_2", Duration::from_millis(100));
        assert!(matches!(result, Err(DomainError::LoadFailed { .. })));

        // Timeout on an entry that never resolves.
        reg.register(stub_setup(Domain::Camera, "cam_3", vec![]));
        let result = reg.wait_for_domain(Domain::Camera, "cam_3", Duration::from_millis(50));
        assert!(matches!(result, Err(DomainError::WaitTimeout { .. })));
    }
}

//! Dependency-ordered concurrent domain setup and reverse-ordered teardown.
//!
//! Components are plain constructors kept in an explicit registry. During
//! setup each component registers its domains as PENDING; a fixed worker
//! pool then claims entries whose required dependencies are LOADED and runs
//! their setup functions. One domain failing never aborts the process.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use tracing::{debug, error, info, warn};

use crate::errors::SetupError;
use crate::registry::{DomainRef, DomainState};
use crate::Argus;

pub type ComponentSetupFn = Box<dyn FnOnce(&Arc<Argus>) -> eyre::Result<()> + Send>;

/// Explicit mapping of component name to constructor, assembled at program
/// initialization.
#[derive(Default)]
pub struct ComponentRegistry {
    components: Vec<(String, ComponentSetupFn)>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, setup: F)
    where
        F: FnOnce(&Arc<Argus>) -> eyre::Result<()> + Send + 'static,
    {
        self.components.push((name.to_string(), Box::new(setup)));
    }

    pub fn names(&self) -> Vec<&str> {
        self.components.iter().map(|(n, _)| n.as_str()).collect()
    }
}

pub struct SetupManager {
    /// Size of the domain setup worker pool.
    pub workers: usize,
    /// NotReady attempts before an entry goes FAILED.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt, capped at 30 s.
    pub retry_base: Duration,
}

impl Default for SetupManager {
    fn default() -> Self {
        SetupManager {
            workers: 10,
            max_attempts: 5,
            retry_base: Duration::from_secs(1),
        }
    }
}

fn backoff(base: Duration, attempts: u32) -> Duration {
    let factor = 1u32 << attempts.saturating_sub(1).min(10);
    (base * factor).min(Duration::from_secs(30))
}

impl SetupManager {
    /// Run component setup, dependency validation, and the domain setup pool
    /// to completion.
    pub fn run(&self, argus: &Arc<Argus>, components: ComponentRegistry) {
        for (name, setup) in components.components {
            info!("setting up component {name}");
            if let Err(error) = setup(argus) {
                error!("failed setup of component {name}: {error:#}");
            }
        }

        for failed in argus.registry.validate_dependencies() {
            error!(
                "domain {} with identifier {} has unconfigured required dependencies",
                failed.domain, failed.identifier
            );
        }

        self.setup_domains(argus);
        info!("domain setup finished");
    }

    fn setup_domains(&self, argus: &Arc<Argus>) {
        let (job_tx, job_rx) = unbounded::<DomainRef>();
        let (done_tx, done_rx) = unbounded::<()>();

        let mut workers = Vec::with_capacity(self.workers);
        for i in 0..self.workers {
            let argus = argus.clone();
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let max_attempts = self.max_attempts;
            let handle = std::thread::Builder::new()
                .name(format!("domain-setup-{i}"))
                .spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        execute_setup(&argus, &job, max_attempts);
                        let _ = done_tx.send(());
                    }
                })
                .expect("spawn domain setup worker");
            workers.push(handle);
        }
        drop(done_tx);

        let mut retries: Vec<(Instant, DomainRef)> = Vec::new();
        let mut retry_scheduled: HashSet<DomainRef> = HashSet::new();

        loop {
            let mut progress = false;
            let now = Instant::now();

            let mut due = Vec::new();
            retries.retain(|(at, domain_ref)| {
                if *at <= now {
                    due.push(domain_ref.clone());
                    false
                } else {
                    true
                }
            });
            for domain_ref in due {
                retry_scheduled.remove(&domain_ref);
                argus.registry.set_state(
                    domain_ref.domain,
                    &domain_ref.identifier,
                    DomainState::Pending,
                    None,
                );
                progress = true;
            }

            for entry in argus.registry.get_pending() {
                let mut ready = true;
                let mut failed_dep: Option<DomainRef> = None;
                for req in &entry.require_domains {
                    match argus.registry.get(req.domain, &req.identifier) {
                        Some(dep) if dep.state == DomainState::Loaded => {}
                        Some(dep) if dep.state == DomainState::Failed => {
                            failed_dep = Some(req.clone());
                            ready = false;
                            break;
                        }
                        Some(_) => {
                            ready = false;
                            break;
                        }
                        None => {
                            failed_dep = Some(req.clone());
                            ready = false;
                            break;
                        }
                    }
                }
                if let Some(req) = failed_dep {
                    argus.registry.set_state(
                        entry.domain,
                        &entry.identifier,
                        DomainState::Failed,
                        Some(format!(
                            "required domain {} with identifier {} failed to load",
                            req.domain, req.identifier
                        )),
                    );
                    progress = true;
                    continue;
                }
                // A configured optional dependency holds scheduling only
                // until it settles; failed or unconfigured optionals never
                // block.
                for opt in &entry.optional_domains {
                    if let Some(dep) = argus.registry.get(opt.domain, &opt.identifier) {
                        if matches!(
                            dep.state,
                            DomainState::Pending | DomainState::Loading | DomainState::Retrying
                        ) {
                            ready = false;
                            break;
                        }
                    }
                }
                if ready {
                    argus.registry.set_state(
                        entry.domain,
                        &entry.identifier,
                        DomainState::Loading,
                        None,
                    );
                    let _ = job_tx.send(entry.domain_ref());
                    progress = true;
                }
            }

            for entry in argus.registry.get_by_state(DomainState::Retrying) {
                let domain_ref = entry.domain_ref();
                if retry_scheduled.insert(domain_ref.clone()) {
                    let delay = backoff(self.retry_base, entry.attempts);
                    debug!(
                        "retrying domain {} with identifier {} in {:?}",
                        domain_ref.domain, domain_ref.identifier, delay
                    );
                    retries.push((Instant::now() + delay, domain_ref));
                }
            }

            let pending = argus.registry.get_by_state(DomainState::Pending);
            let loading = argus.registry.get_by_state(DomainState::Loading);
            let retrying = argus.registry.get_by_state(DomainState::Retrying);

            if pending.is_empty() && loading.is_empty() && retrying.is_empty() && retries.is_empty()
            {
                break;
            }

            // Nothing runnable and nothing in flight: the remaining PENDING
            // entries form an unsatisfiable (cyclic) dependency graph.
            if !progress && loading.is_empty() && retrying.is_empty() && retries.is_empty() {
                let stuck = pending;
                if !stuck.is_empty() {
                    for entry in stuck {
                        argus.registry.set_state(
                            entry.domain,
                            &entry.identifier,
                            DomainState::Failed,
                            Some("unsatisfiable dependency graph".to_string()),
                        );
                    }
                    continue;
                }
            }

            let _ = done_rx.recv_timeout(Duration::from_millis(100));
        }

        drop(job_tx);
        for handle in workers {
            let _ = handle.join();
        }
    }
}

fn execute_setup(argus: &Arc<Argus>, job: &DomainRef, max_attempts: u32) {
    let Some(entry) = argus.registry.get(job.domain, &job.identifier) else {
        return;
    };

    for opt in &entry.optional_domains {
        if !argus.registry.is_loaded(opt.domain, &opt.identifier) {
            debug!(
                "optional dependency {} with identifier {} not loaded for domain {} \
                 with identifier {}",
                opt.domain, opt.identifier, job.domain, job.identifier
            );
        }
    }

    info!(
        "setting up domain {} with identifier {}",
        job.domain, job.identifier
    );
    let setup = entry.setup.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| setup(argus)))
        .unwrap_or_else(|_| Err(SetupError::Failed("domain setup panicked".to_string())));

    match result {
        Ok(instance) => {
            argus
                .registry
                .set_instance(job.domain, &job.identifier, instance);
            argus
                .registry
                .set_state(job.domain, &job.identifier, DomainState::Loaded, None);
            info!(
                "domain {} with identifier {} loaded",
                job.domain, job.identifier
            );
        }
        Err(SetupError::NotReady(msg)) => {
            let attempts = argus.registry.bump_attempts(job.domain, &job.identifier);
            if attempts >= max_attempts {
                error!(
                    "domain {} with identifier {} failed after {attempts} attempts: {msg}",
                    job.domain, job.identifier
                );
                argus.registry.set_state(
                    job.domain,
                    &job.identifier,
                    DomainState::Failed,
                    Some(msg),
                );
            } else {
                warn!(
                    "domain {} with identifier {} not ready (attempt {attempts}): {msg}",
                    job.domain, job.identifier
                );
                argus.registry.set_state(
                    job.domain,
                    &job.identifier,
                    DomainState::Retrying,
                    Some(msg),
                );
            }
        }
        Err(SetupError::Failed(msg)) => {
            error!(
                "failed setup of domain {} with identifier {}: {msg}",
                job.domain, job.identifier
            );
            argus
                .registry
                .set_state(job.domain, &job.identifier, DomainState::Failed, Some(msg));
        }
    }
}

/// Order in which a domain and everything depending on it must be unloaded:
/// dependents first, the target last.
pub fn get_unload_order(
    argus: &Argus,
    domain: argus_types::Domain,
    identifier: &str,
) -> Vec<DomainRef> {
    fn visit(
        argus: &Argus,
        target: DomainRef,
        order: &mut Vec<DomainRef>,
        seen: &mut HashSet<DomainRef>,
    ) {
        if !seen.insert(target.clone()) {
            return;
        }
        for dependent in argus
            .registry
            .get_dependents(target.domain, &target.identifier)
        {
            visit(argus, dependent.domain_ref(), order, seen);
        }
        order.push(target);
    }

    let mut order = Vec::new();
    let mut seen = HashSet::new();
    visit(
        argus,
        DomainRef::new(domain, identifier),
        &mut order,
        &mut seen,
    );
    order
}

/// Tear down a domain and its dependents, unregistering each exactly once.
pub fn teardown_domain(argus: &Argus, domain: argus_types::Domain, identifier: &str) {
    for domain_ref in get_unload_order(argus, domain, identifier) {
        let Some(entry) = argus
            .registry
            .unregister(domain_ref.domain, &domain_ref.identifier)
        else {
            continue;
        };
        if let Some(instance) = entry.instance {
            info!(
                "tearing down domain {} with identifier {}",
                domain_ref.domain, domain_ref.identifier
            );
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| instance.shutdown()));
            if result.is_err() {
                error!(
                    "teardown of domain {} with identifier {} panicked",
                    domain_ref.domain, domain_ref.identifier
                );
            }
        }
    }
}

/// Tear down every registered domain, dependents before dependencies.
pub fn teardown_all(argus: &Argus) {
    for entry in argus.registry.all_entries() {
        if argus.registry.is_configured(entry.domain, &entry.identifier) {
            teardown_domain(argus, entry.domain, &entry.identifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::{DomainInstance, PostProcessor};
    use crate::registry::DomainSetup;
    use argus_types::Domain;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Tracked {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }
    impl PostProcessor for Tracked {
        fn shutdown(&self) {
            self.log.lock().push(self.name.clone());
        }
    }

    fn tracked(name: &str, log: &Arc<Mutex<Vec<String>>>) -> DomainInstance {
        DomainInstance::PostProcessor(Arc::new(Tracked {
            name: name.to_string(),
            log: log.clone(),
        }))
    }

    fn quick_manager() -> SetupManager {
        SetupManager {
            workers: 4,
            max_attempts: 3,
            retry_base: Duration::from_millis(10),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff(base, 1), Duration::from_secs(1));
        assert_eq!(backoff(base, 2), Duration::from_secs(2));
        assert_eq!(backoff(base, 3), Duration::from_secs(4));
        assert_eq!(backoff(base, 10), Duration::from_secs(30));
    }

    #[test]
    fn domains_load_in_dependency_order() {
        let argus = Argus::new();
        let order = Arc::new(Mutex::new(Vec::<String>::new()));
        let log = Arc::new(Mutex::new(Vec::new()));

        for (domain, identifier, require) in [
            (
                Domain::Nvr,
                "cam_1",
                vec![DomainRef::new(Domain::ObjectDetector, "cam_1")],
            ),
            (
                Domain::ObjectDetector,
                "cam_1",
                vec![DomainRef::new(Domain::Camera, "cam_1")],
            ),
            (Domain::Camera, "cam_1", vec![]),
        ] {
            let order = order.clone();
            let log = log.clone();
            let name = format!("{domain}");
            argus.registry.register(DomainSetup {
                component: "test".into(),
                domain,
                identifier: identifier.into(),
                setup: Arc::new(move |_| {
                    order.lock().push(name.clone());
                    Ok(tracked(&name, &log))
                }),
                require,
                optional: vec![],
            });
        }

        quick_manager().setup_domains(&argus);

        let order = order.lock().clone();
        assert_eq!(order, vec!["camera", "object_detector", "nvr"]);
        assert!(argus.registry.is_loaded(Domain::Nvr, "cam_1"));
        argus.stop_core();
    }

    #[test]
    fn not_ready_is_retried_until_success() {
        let argus = Argus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let l = log.clone();
        argus.registry.register(DomainSetup {
            component: "test".into(),
            domain: Domain::Camera,
            identifier: "cam_1".into(),
            setup: Arc::new(move |_| {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SetupError::not_ready("stream not up"))
                } else {
                    Ok(tracked("camera", &l))
                }
            }),
            require: vec![],
            optional: vec![],
        });

        quick_manager().setup_domains(&argus);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(argus.registry.is_loaded(Domain::Camera, "cam_1"));
        argus.stop_core();
    }

    #[test]
    fn not_ready_exhausts_attempts_then_fails() {
        let argus = Argus::new();
        argus.registry.register(DomainSetup {
            component: "test".into(),
            domain: Domain::Camera,
            identifier: "cam_1".into(),
            setup: Arc::new(|_| Err(SetupError::not_ready("never"))),
            require: vec![],
            optional: vec![],
        });

        quick_manager().setup_domains(&argus);
        let entry = argus.registry.get(Domain::Camera, "cam_1").unwrap();
        assert_eq!(entry.state, DomainState::Failed);
        assert_eq!(entry.attempts, 3);
        argus.stop_core();
    }

    #[test]
    fn dependent_of_failed_domain_fails() {
        let argus = Argus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        argus.registry.register(DomainSetup {
            component: "test".into(),
            domain: Domain::Camera,
            identifier: "cam_1".into(),
            setup: Arc::new(|_| Err(SetupError::failed("no stream"))),
            require: vec![],
            optional: vec![],
        });
        let l = log.clone();
        argus.registry.register(DomainSetup {
            component: "test".into(),
            domain: Domain::Nvr,
            identifier: "cam_1".into(),
            setup: Arc::new(move |_| Ok(tracked("nvr", &l))),
            require: vec![DomainRef::new(Domain::Camera, "cam_1")],
            optional: vec![],
        });

        quick_manager().setup_domains(&argus);
        let entry = argus.registry.get(Domain::Nvr, "cam_1").unwrap();
        assert_eq!(entry.state, DomainState::Failed);
        assert!(entry.error.unwrap().contains("failed to load"));
        argus.stop_core();
    }

    fn load_chain(argus: &Arc<Argus>, log: &Arc<Mutex<Vec<String>>>) {
        for (domain, identifier, require) in [
            (Domain::Camera, "cam_1", vec![]),
            (
                Domain::ObjectDetector,
                "cam_1",
                vec![DomainRef::new(Domain::Camera, "cam_1")],
            ),
            (
                Domain::Nvr,
                "cam_1",
                vec![DomainRef::new(Domain::ObjectDetector, "cam_1")],
            ),
        ] {
            let log = log.clone();
            let name = format!("{domain}");
            argus.registry.register(DomainSetup {
                component: "test".into(),
                domain,
                identifier: identifier.into(),
                setup: Arc::new(move |_| Ok(tracked(&name, &log))),
                require,
                optional: vec![],
            });
        }
        quick_manager().setup_domains(argus);
    }

    #[test]
    fn unload_order_is_dependents_first() {
        let argus = Argus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        load_chain(&argus, &log);

        let order = get_unload_order(&argus, Domain::Camera, "cam_1");
        let domains: Vec<Domain> = order.iter().map(|r| r.domain).collect();
        assert_eq!(
            domains,
            vec![Domain::Nvr, Domain::ObjectDetector, Domain::Camera]
        );
        argus.stop_core();
    }

    #[test]
    fn teardown_visits_dependents_first_and_unregisters_once() {
        let argus = Argus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        load_chain(&argus, &log);

        teardown_domain(&argus, Domain::Camera, "cam_1");
        assert_eq!(
            log.lock().clone(),
            vec!["nvr", "object_detector", "camera"]
        );
        assert!(!argus.registry.is_configured(Domain::Camera, "cam_1"));
        assert!(!argus.registry.is_configured(Domain::Nvr, "cam_1"));

        // Idempotent: nothing left to tear down.
        teardown_domain(&argus, Domain::Camera, "cam_1");
        assert_eq!(log.lock().len(), 3);
        argus.stop_core();
    }
}

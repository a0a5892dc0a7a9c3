use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::builder::ServiceBuilder;
use crate::controller::{ContainerRuntime, Controller};
use crate::error::InstallError;
use crate::handle::{ControllerDirectory, ControllerId, ControllerIdGenerator};
use crate::link::DependencyLink;
use crate::name::ServiceName;
use crate::registration::Registration;
use crate::substate::Substate;
use crate::value::ValueCell;

/// Raised by `await_stability`/`await_termination` when the requested
/// timeout elapses before the condition holds.
#[derive(Debug, Clone, Copy)]
pub struct AwaitTimeoutError;

impl fmt::Display for AwaitTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timed out waiting for the container to reach the requested condition")
    }
}

impl std::error::Error for AwaitTimeoutError {}

/// Snapshot returned by `await_stability`: the services currently blocked on
/// a dependency problem, and those whose last start attempt failed (§6's
/// `failedOut`/`problemOut` out-parameters, returned by value rather than
/// written through references).
#[derive(Debug, Clone, Default)]
pub struct StabilityReport {
    pub failed: Vec<ServiceName>,
    pub problem: Vec<ServiceName>,
}

/// Observes the container reaching full shutdown (every installed controller
/// at REMOVED).
pub trait ShutdownListener: Send + Sync + 'static {
    fn on_shutdown_complete(&self);
}

/// A container-owned, fire-and-forget worker pool (§4.6, §5). `submit` never
/// blocks the caller: once shutdown has been requested the submitting
/// thread runs the job inline instead (caller-runs), matching the
/// executor-rejection fallback the spec requires so fan-out keeps draining
/// while the container is going down.
struct WorkerPool {
    handle: tokio::runtime::Handle,
    cancel: CancellationToken,
}

impl WorkerPool {
    fn new() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
            cancel: CancellationToken::new(),
        }
    }

    fn submit(&self, job: Box<dyn FnOnce() + Send>) {
        if self.cancel.is_cancelled() {
            job();
            return;
        }
        self.handle.spawn_blocking(move || job());
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// The global registry, worker pool, stability tracker and install/shutdown
/// orchestrator (§4.6). Owns every `Registration` and `Controller` strongly;
/// everything else in the crate refers to them only by handle (§9).
pub struct Container {
    registrations: DashMap<ServiceName, Arc<Registration>>,
    controllers: DashMap<ControllerId, Arc<Controller>>,
    id_gen: ControllerIdGenerator,
    unstable_services: AtomicI64,
    stability_notify: tokio::sync::Notify,
    shutdown_requested: AtomicBool,
    shutdown_complete: AtomicBool,
    termination_notify: tokio::sync::Notify,
    shutdown_listeners: Mutex<Vec<Arc<dyn ShutdownListener>>>,
    worker_pool: WorkerPool,
    self_weak: Mutex<Weak<Container>>,
}

impl Container {
    /// Must be called from within a Tokio runtime: the worker pool captures
    /// `Handle::current()` to spawn fan-out and `start`/`stop` callbacks on
    /// blocking threads outside any container lock (§5).
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Container {
            registrations: DashMap::new(),
            controllers: DashMap::new(),
            id_gen: ControllerIdGenerator::default(),
            unstable_services: AtomicI64::new(0),
            stability_notify: tokio::sync::Notify::new(),
            shutdown_requested: AtomicBool::new(false),
            shutdown_complete: AtomicBool::new(false),
            termination_notify: tokio::sync::Notify::new(),
            shutdown_listeners: Mutex::new(Vec::new()),
            worker_pool: WorkerPool::new(),
            self_weak: Mutex::new(weak.clone()),
        })
    }

    fn self_arc(&self) -> Arc<Container> {
        self.self_weak.lock().expect("container lock poisoned").upgrade().expect("container outlives its own Arc")
    }

    // ── Install ──────────────────────────────────────────────────────────

    /// Wires a new service into the graph (§4.6): get-or-create its
    /// registrations, construct its controller, bind it as provider and
    /// dependent, run cycle detection, then commit it out of NEW. Any
    /// failure rolls the partially-wired registrations back to their
    /// pre-install shape.
    #[instrument(level = "debug", skip_all)]
    pub fn install(&self, mut builder: ServiceBuilder) -> Result<Arc<Controller>, InstallError> {
        builder.check_thread()?;
        builder.validate_names()?;
        let service = builder.take_instance()?;

        let provide_regs: Vec<(ServiceName, Arc<Registration>)> = builder
            .provides_names()
            .iter()
            .map(|name| (name.clone(), self.get_or_create_for_provide(name)))
            .collect();

        let require_regs: Vec<(ServiceName, Arc<Registration>, crate::link::LinkKind)> = builder
            .requires_links()
            .iter()
            .map(|(name, kind)| (name.clone(), self.get_or_create_for_require(name), *kind))
            .collect();

        let id = self.id_gen.next();
        let provide_slots = provide_regs
            .iter()
            .map(|(name, reg)| (name.clone(), Arc::clone(reg), Arc::new(ValueCell::new(name.clone()))))
            .collect();
        let links: Vec<DependencyLink> =
            require_regs.iter().map(|(_, reg, kind)| DependencyLink::new(Arc::clone(reg), *kind)).collect();

        let directory: Weak<dyn ControllerDirectory> = self.directory_weak();
        let runtime: Weak<dyn ContainerRuntime> = self.runtime_weak();
        let controller = Controller::new(id, service, provide_slots, links, directory, runtime);
        self.controllers.insert(id, Arc::clone(&controller));

        if let Err(duplicate_name) = self.bind_providers(&controller, &provide_regs) {
            self.rollback(&controller, &provide_regs, &[]);
            return Err(InstallError::DuplicateProvider(duplicate_name));
        }

        for (_, reg, _) in &require_regs {
            reg.add_dependent(id);
        }

        if let Some(cycle) = detect_cycle(self, &controller) {
            warn!(cycle = ?cycle, "installation would close a dependency cycle; rolling back");
            self.rollback(&controller, &provide_regs, &require_regs);
            return Err(InstallError::CycleDetected { cycle });
        }

        for listener in builder.take_listeners() {
            controller.add_listener(listener);
        }
        debug!(id = ?id, provides = ?controller.provides(), requires = ?controller.requires(), "committing installation");
        controller.commit_installation(builder.mode_value());

        Ok(controller)
    }

    fn bind_providers(
        &self,
        controller: &Arc<Controller>,
        provide_regs: &[(ServiceName, Arc<Registration>)],
    ) -> Result<(), ServiceName> {
        for (name, reg) in provide_regs {
            if reg.set_provider(controller.id()).is_err() {
                return Err(name.clone());
            }
        }
        Ok(())
    }

    /// Undoes a partially-completed install: unbinds any providers this
    /// controller managed to claim, cancels the pending-installation count
    /// on the rest, detaches any dependent links already attached, and drops
    /// the controller from the directory. The registration returns to
    /// exactly the ref-counted shape it had before this install began (§4.6).
    fn rollback(
        &self,
        controller: &Arc<Controller>,
        provide_regs: &[(ServiceName, Arc<Registration>)],
        require_regs: &[(ServiceName, Arc<Registration>, crate::link::LinkKind)],
    ) {
        for (_, reg) in provide_regs {
            if reg.provider() == Some(controller.id()) {
                reg.clear_provider(controller.id());
            } else {
                reg.cancel_installation();
            }
        }
        for (_, reg, _) in require_regs {
            reg.remove_dependent(controller.id());
        }
        self.controllers.remove(&controller.id());
    }

    fn get_or_create_for_provide(&self, name: &ServiceName) -> Arc<Registration> {
        loop {
            let reg = self
                .registrations
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Registration::new(name.clone(), self.directory_weak())))
                .clone();
            if reg.begin_installation() {
                return reg;
            }
            // The existing slot was already fully removed; replace it with a
            // fresh registration and retry (§4.1).
            self.registrations.insert(name.clone(), Arc::new(Registration::new(name.clone(), self.directory_weak())));
        }
    }

    fn get_or_create_for_require(&self, name: &ServiceName) -> Arc<Registration> {
        self.registrations
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Registration::new(name.clone(), self.directory_weak())))
            .clone()
    }

    fn directory_weak(&self) -> Weak<dyn ControllerDirectory> {
        Arc::downgrade(&self.self_arc()) as Weak<dyn ControllerDirectory>
    }

    fn runtime_weak(&self) -> Weak<dyn ContainerRuntime> {
        Arc::downgrade(&self.self_arc()) as Weak<dyn ContainerRuntime>
    }

    // ── Lookups ──────────────────────────────────────────────────────────

    pub fn controller_of_value(&self, name: &ServiceName) -> Option<Arc<Controller>> {
        let reg = self.registrations.get(name)?;
        let provider_id = reg.provider()?;
        self.controllers.get(&provider_id).map(|r| r.clone())
    }

    pub fn value_names(&self) -> Vec<ServiceName> {
        self.registrations.iter().filter(|e| !e.value().is_removed()).map(|e| e.key().clone()).collect()
    }

    fn get_registration(&self, name: &ServiceName) -> Option<Arc<Registration>> {
        self.registrations.get(name).map(|r| r.clone())
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::Acquire)
    }

    pub fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) {
        self.shutdown_listeners.lock().expect("container lock poisoned").push(listener);
    }

    /// Monotonic: the first call drives every currently-installed provider's
    /// mode to REMOVE; later calls are no-ops (§4.6).
    #[instrument(level = "debug", skip_all)]
    pub fn shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pending = self.controllers.len(), "shutdown requested");
        if self.controllers.is_empty() {
            self.finish_shutdown();
            return;
        }
        let ids: Vec<ControllerId> = self.controllers.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some(controller) = self.controllers.get(&id).map(|r| r.clone()) {
                controller.set_mode(crate::mode::Mode::Remove);
            }
        }
    }

    fn finish_shutdown(&self) {
        self.worker_pool.shutdown();
        self.shutdown_complete.store(true, Ordering::Release);
        self.termination_notify.notify_waiters();
        info!("shutdown complete");
        for listener in self.shutdown_listeners.lock().expect("container lock poisoned").iter() {
            listener.on_shutdown_complete();
        }
    }

    // ── Stability & termination waits ───────────────────────────────────

    pub async fn await_stability(&self, timeout: Option<Duration>) -> Result<StabilityReport, AwaitTimeoutError> {
        self.wait_for(|| self.unstable_services.load(Ordering::SeqCst) <= 0, &self.stability_notify, timeout)
            .await?;
        Ok(self.stability_report())
    }

    pub async fn await_termination(&self, timeout: Option<Duration>) -> Result<(), AwaitTimeoutError> {
        self.wait_for(|| self.is_shutdown_complete(), &self.termination_notify, timeout).await
    }

    async fn wait_for(
        &self,
        condition: impl Fn() -> bool,
        notify: &tokio::sync::Notify,
        timeout: Option<Duration>,
    ) -> Result<(), AwaitTimeoutError> {
        loop {
            let notified = notify.notified();
            if condition() {
                return Ok(());
            }
            tokio::pin!(notified);
            match timeout {
                Some(duration) => {
                    if tokio::time::timeout(duration, notified.as_mut()).await.is_err() {
                        return Err(AwaitTimeoutError);
                    }
                }
                None => notified.as_mut().await,
            }
        }
    }

    fn stability_report(&self) -> StabilityReport {
        let mut report = StabilityReport::default();
        for entry in self.controllers.iter() {
            match entry.value().state() {
                Substate::StartFailed => report.failed.extend(entry.value().provides()),
                Substate::Problem => report.problem.extend(entry.value().provides()),
                _ => {}
            }
        }
        report
    }
}

impl ControllerDirectory for Container {
    fn controller(&self, id: ControllerId) -> Option<Arc<Controller>> {
        self.controllers.get(&id).map(|r| r.clone())
    }
}

impl ContainerRuntime for Container {
    fn submit(&self, job: Box<dyn FnOnce() + Send>) {
        self.worker_pool.submit(job);
    }

    fn note_stability_delta(&self, now_unstable: bool) {
        let delta = if now_unstable { 1 } else { -1 };
        let previous = self.unstable_services.fetch_add(delta, Ordering::SeqCst);
        if previous + delta <= 0 {
            self.stability_notify.notify_waiters();
        }
    }

    fn on_removed(&self, id: ControllerId) {
        self.controllers.remove(&id);
        if self.shutdown_requested.load(Ordering::Acquire) && self.controllers.is_empty() {
            self.finish_shutdown();
        }
    }
}

/// DFS from `start`, walking `provides -> registration.dependents` edges
/// (§4.6). If the walk re-encounters `start`'s own id, the visited path
/// spells the cycle in dependency order. REMOVED controllers are pruned:
/// they can neither provide nor depend on anything live.
fn detect_cycle(container: &Container, start: &Arc<Controller>) -> Option<Vec<ServiceName>> {
    let target = start.id();
    let mut visited: HashSet<ControllerId> = HashSet::from([target]);
    let mut path = Vec::new();
    walk_dependents(container, start, target, &mut visited, &mut path)
}

fn walk_dependents(
    container: &Container,
    current: &Arc<Controller>,
    target: ControllerId,
    visited: &mut HashSet<ControllerId>,
    path: &mut Vec<ServiceName>,
) -> Option<Vec<ServiceName>> {
    for name in current.provides() {
        let Some(registration) = container.get_registration(&name) else { continue };
        for dependent_id in registration.dependents_snapshot() {
            path.push(name.clone());
            if dependent_id == target {
                return Some(path.clone());
            }
            if visited.insert(dependent_id) {
                if let Some(dependent) = container.controllers.get(&dependent_id).map(|r| r.clone()) {
                    if dependent.state() != Substate::Removed {
                        if let Some(cycle) = walk_dependents(container, &dependent, target, visited, path) {
                            return Some(cycle);
                        }
                    }
                }
            }
            path.pop();
        }
    }
    None
}

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace, warn};

use crate::error::StartCause;
use crate::flags::{ExecFlags, NotificationKind};
use crate::handle::{ControllerDirectory, ControllerId};
use crate::link::DependencyLink;
use crate::listener::{LifecycleEvent, Listener};
use crate::mode::Mode;
use crate::name::ServiceName;
use crate::registration::Registration;
use crate::service::{
    LifecycleShared, Service, StartCompletion, StartContext, StopCompletion, StopContext,
};
use crate::substate::{select_transition, SelectorInputs, Substate};
use crate::value::ValueCell;

/// Hooks the container gives every controller it creates, kept as a trait so
/// this module never names `Container` directly (§5, §9).
pub(crate) trait ContainerRuntime: Send + Sync {
    fn submit(&self, job: Box<dyn FnOnce() + Send>);
    /// Called whenever a controller's rest/unstable bit flips, to keep the
    /// container's stability counter in sync (§4.6).
    fn note_stability_delta(&self, now_unstable: bool);
    fn on_removed(&self, id: ControllerId);
}

struct ProvideSlot {
    name: ServiceName,
    registration: Arc<Registration>,
    cell: Arc<ValueCell>,
}

struct RequireSlot {
    link: DependencyLink,
}

/// Mutable per-link runtime state, indexed in parallel with `requires`
/// (see `link::DependencyLink`'s doc comment). `seen_up_once` is a one-way
/// latch: `stopping_dependencies` only ever decrements, never re-increments,
/// once a link has reported started for the first time.
#[derive(Default, Clone, Copy)]
struct LinkRuntime {
    unavailable: bool,
    failed: bool,
    seen_up_once: bool,
}

/// Status a provider replays to a newly-attached dependent, combining the
/// three visibility predicates of §4.3. Not mutually exclusive: a provider
/// mid-retry in DOWN can be both unavailable- and failed-visible at once.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct VisibleStatus {
    pub unavailable: bool,
    pub up: bool,
    pub failed: bool,
}

struct Inner {
    mode: Mode,
    state: Substate,
    committed: bool,
    dependencies_demanded: bool,
    unavailable_dependencies: u32,
    stopping_dependencies: u32,
    fail_count: u32,
    demanded_by_count: u32,
    running_dependents: u32,
    start_exception: Option<StartCause>,
    async_tasks: u32,
    exec_flags: ExecFlags,
    listener_transition_tasks: Vec<LifecycleEvent>,
    require_runtime: Vec<LinkRuntime>,
}

/// One side effect the transition loop decided to enqueue, executed after
/// the controller's own lock is released (§4.5, §5's acquisition order).
enum Work {
    Demand,
    Undemand,
    DependentStarted,
    DependentStopped,
    NotifyDependents(NotificationKind),
    RunStart,
    RunStop,
    Detach,
}

/// The per-installation state machine (§4). Owns exactly one `Service`
/// instance and every counter the selector consults; every mutation happens
/// under `inner`, the innermost lock in the container's acquisition order.
pub struct Controller {
    id: ControllerId,
    service: Arc<dyn Service>,
    provides: Vec<ProvideSlot>,
    requires: Vec<RequireSlot>,
    directory: Weak<dyn ControllerDirectory>,
    runtime: Weak<dyn ContainerRuntime>,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    inner: Mutex<Inner>,
    self_weak: Mutex<Weak<Controller>>,
}

impl Controller {
    pub(crate) fn new(
        id: ControllerId,
        service: Arc<dyn Service>,
        provides: Vec<(ServiceName, Arc<Registration>, Arc<ValueCell>)>,
        requires: Vec<DependencyLink>,
        directory: Weak<dyn ControllerDirectory>,
        runtime: Weak<dyn ContainerRuntime>,
    ) -> Arc<Self> {
        let require_runtime = vec![LinkRuntime::default(); requires.len()];
        // Every direct link starts "stopping" until its first DependencyUp
        // latches it open (§3, §4.2): a dependent may not reach UP while any
        // direct dependency has yet to report started even once.
        let stopping_dependencies = requires.iter().filter(|link| link.counts_toward_aggregates()).count() as u32;
        let controller = Arc::new_cyclic(|weak| Controller {
            id,
            service,
            provides: provides
                .into_iter()
                .map(|(name, registration, cell)| ProvideSlot { name, registration, cell })
                .collect(),
            requires: requires.into_iter().map(|link| RequireSlot { link }).collect(),
            directory,
            runtime,
            listeners: Mutex::new(Vec::new()),
            inner: Mutex::new(Inner {
                mode: Mode::Never,
                state: Substate::New,
                committed: false,
                dependencies_demanded: false,
                unavailable_dependencies: 0,
                stopping_dependencies,
                fail_count: 0,
                demanded_by_count: 0,
                running_dependents: 0,
                start_exception: None,
                async_tasks: 0,
                exec_flags: ExecFlags::default(),
                listener_transition_tasks: Vec::new(),
                require_runtime,
            }),
            self_weak: Mutex::new(weak.clone()),
        });
        controller
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.inner.lock().expect("controller lock poisoned").mode
    }

    pub fn state(&self) -> Substate {
        self.inner.lock().expect("controller lock poisoned").state
    }

    pub fn reason(&self) -> Option<StartCause> {
        self.inner.lock().expect("controller lock poisoned").start_exception.clone()
    }

    pub fn provides(&self) -> Vec<ServiceName> {
        self.provides.iter().map(|s| s.name.clone()).collect()
    }

    /// Read back a value this controller provides. `name` must be one of
    /// `provides()`; the cell is only defined while the controller is UP
    /// (§4.4) — reading outside that window reports
    /// `ContractError::ValueWrittenOutsideWindow`.
    pub fn value<V: Clone + std::any::Any + Send + Sync>(
        &self,
        name: &ServiceName,
    ) -> Result<V, crate::error::ContractError> {
        self.provides
            .iter()
            .find(|slot| &slot.name == name)
            .ok_or_else(|| crate::error::ContractError::ValueWrittenOutsideWindow(name.clone()))?
            .cell
            .get()
    }

    pub fn requires(&self) -> Vec<ServiceName> {
        self.requires.iter().map(|s| s.link.target().name().clone()).collect()
    }

    /// Names of currently-unavailable direct dependencies (§6).
    pub fn missing(&self) -> Vec<ServiceName> {
        let g = self.inner.lock().expect("controller lock poisoned");
        self.requires
            .iter()
            .zip(g.require_runtime.iter())
            .filter(|(slot, rt)| slot.link.counts_toward_aggregates() && rt.unavailable)
            .map(|(slot, _)| slot.link.target().name().clone())
            .collect()
    }

    fn self_arc(&self) -> Arc<Controller> {
        self.self_weak
            .lock()
            .expect("controller lock poisoned")
            .upgrade()
            .expect("controller outlives its own Arc")
    }

    fn primary_name(&self) -> ServiceName {
        self.provides
            .first()
            .map(|s| s.name.clone())
            .or_else(|| self.requires.first().map(|s| s.link.target().name().clone()))
            .unwrap_or_else(|| ServiceName::single("service"))
    }

    fn any_dependents(&self) -> bool {
        self.provides.iter().any(|s| s.registration.has_any_dependents())
    }

    fn find_link(&self, name: &ServiceName) -> Option<usize> {
        self.requires.iter().position(|s| s.link.target().name() == name)
    }

    // ── Installation lifecycle, called by the container ────────────────────

    pub(crate) fn replay_initial_counts(&self, demanded_by_count: u32, running_dependents: u32) {
        let mut g = self.inner.lock().expect("controller lock poisoned");
        g.demanded_by_count = demanded_by_count;
        g.running_dependents = running_dependents;
    }

    /// Commits `mode` and releases the controller from NEW, driving the
    /// transition loop for the first time (§4.1, §4.2).
    pub(crate) fn commit_installation(&self, mode: Mode) {
        {
            let mut g = self.inner.lock().expect("controller lock poisoned");
            g.mode = mode;
            g.committed = true;
        }
        for slot in &self.provides {
            slot.registration.mark_committed();
        }
        self.run_transitions();
    }

    pub fn set_mode(&self, mode: Mode) {
        {
            let mut g = self.inner.lock().expect("controller lock poisoned");
            if g.mode == mode {
                return;
            }
            g.mode = mode;
        }
        self.run_transitions();
    }

    /// Explicit retry from START_FAILED, bypassing the selector (§9: this
    /// implementation exposes START_FAILED -> STARTING only through an
    /// explicit call, never automatically).
    pub fn retry(&self) {
        let mut work = Vec::new();
        {
            let mut g = self.inner.lock().expect("controller lock poisoned");
            if g.state != Substate::StartFailed || g.async_tasks > 0 {
                return;
            }
            g.exec_flags.reset();
            g.start_exception = None;
            g.state = Substate::Starting;
            if self.any_dependents() {
                g.exec_flags.mark_scheduled(NotificationKind::DependencyRetrying);
                work.push(Work::NotifyDependents(NotificationKind::DependencyRetrying));
            }
            work.push(Work::RunStart);
            g.async_tasks += work.len() as u32;
        }
        debug!(service = %self.primary_name(), "retrying failed start");
        self.dispatch_work(work);
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        let synthetic = {
            let g = self.inner.lock().expect("controller lock poisoned");
            self.synthetic_event(g.state, &g.start_exception)
        };
        self.listeners.lock().expect("controller lock poisoned").push(Arc::clone(&listener));
        if let Some(event) = synthetic {
            listener.on_event(&self.primary_name(), &event);
        }
    }

    fn synthetic_event(&self, state: Substate, start_exception: &Option<StartCause>) -> Option<LifecycleEvent> {
        match state {
            Substate::Down => Some(LifecycleEvent::Down),
            Substate::Up => Some(LifecycleEvent::Up),
            Substate::StartFailed => start_exception.clone().map(LifecycleEvent::Failed),
            Substate::Removed => Some(LifecycleEvent::Removed),
            _ => None,
        }
    }

    // ── Notifications from the dependency side (this controller as a
    // dependent of the named registration) ─────────────────────────────────

    pub(crate) fn notify_dependency_unavailable(&self, name: &ServiceName) {
        let mut g = self.inner.lock().expect("controller lock poisoned");
        if let Some(idx) = self.find_link(name) {
            let counts = self.requires[idx].link.counts_toward_aggregates();
            let rt = &mut g.require_runtime[idx];
            if !rt.unavailable {
                rt.unavailable = true;
                if counts {
                    g.unavailable_dependencies += 1;
                }
            }
        }
        drop(g);
        self.run_transitions();
    }

    pub(crate) fn notify_dependency_available(&self, name: &ServiceName) {
        let mut g = self.inner.lock().expect("controller lock poisoned");
        if let Some(idx) = self.find_link(name) {
            let counts = self.requires[idx].link.counts_toward_aggregates();
            let rt = &mut g.require_runtime[idx];
            if rt.unavailable {
                rt.unavailable = false;
                if counts {
                    g.unavailable_dependencies = g.unavailable_dependencies.saturating_sub(1);
                }
            }
        }
        drop(g);
        self.run_transitions();
    }

    pub(crate) fn notify_dependency_started(&self, name: &ServiceName) {
        let mut g = self.inner.lock().expect("controller lock poisoned");
        if let Some(idx) = self.find_link(name) {
            let counts = self.requires[idx].link.counts_toward_aggregates();
            let rt = &mut g.require_runtime[idx];
            if !rt.seen_up_once {
                rt.seen_up_once = true;
                if counts {
                    g.stopping_dependencies = g.stopping_dependencies.saturating_sub(1);
                }
            }
            if rt.failed {
                rt.failed = false;
                if counts {
                    g.fail_count = g.fail_count.saturating_sub(1);
                }
            }
        }
        drop(g);
        self.run_transitions();
    }

    pub(crate) fn notify_dependency_stopped(&self, _name: &ServiceName) {
        // No counter reacts to a dependency stopping: stopping_dependencies
        // is a one-way latch, and a dependency going down again is observed
        // as a later dependencyUnavailable instead (§4.3).
        self.run_transitions();
    }

    pub(crate) fn notify_dependency_failed(&self, name: &ServiceName) {
        let mut g = self.inner.lock().expect("controller lock poisoned");
        if let Some(idx) = self.find_link(name) {
            let counts = self.requires[idx].link.counts_toward_aggregates();
            let rt = &mut g.require_runtime[idx];
            if !rt.failed {
                rt.failed = true;
                if counts {
                    g.fail_count += 1;
                }
            }
        }
        drop(g);
        self.run_transitions();
    }

    pub(crate) fn notify_dependency_retrying(&self, _name: &ServiceName) {
        // Informational only; the provider's own exec flags carry the
        // in-flight window dependents observe via visible_status().
    }

    pub(crate) fn replay_new_dependent(&self, name: &ServiceName, status: VisibleStatus) {
        if status.unavailable {
            self.notify_dependency_unavailable(name);
        } else {
            self.notify_dependency_available(name);
        }
        if status.up {
            self.notify_dependency_started(name);
        }
        if status.failed {
            self.notify_dependency_failed(name);
        }
    }

    pub(crate) fn on_demand_delta(&self, delta: i32) {
        {
            let mut g = self.inner.lock().expect("controller lock poisoned");
            g.demanded_by_count = apply_delta(g.demanded_by_count, delta);
        }
        self.run_transitions();
    }

    pub(crate) fn on_running_dependents_delta(&self, delta: i32) {
        {
            let mut g = self.inner.lock().expect("controller lock poisoned");
            g.running_dependents = apply_delta(g.running_dependents, delta);
        }
        self.run_transitions();
    }

    /// The status this controller, as a provider, currently exposes to a
    /// newly-attaching dependent (§4.3).
    pub(crate) fn visible_status(&self) -> VisibleStatus {
        let g = self.inner.lock().expect("controller lock poisoned");
        // DOWN/UP/START_FAILED are rest states (`Substate::is_rest`): the
        // controller may have reached one of them without ever having had a
        // dependent to fan out to, so exec_flags was never marked for it.
        // Their visibility is unambiguous from the state itself and must not
        // depend on whether a notification happened to run (§4.3).
        let failed = match g.state {
            Substate::StartFailed => true,
            Substate::Starting | Substate::Down => {
                g.exec_flags.is_in_flight(NotificationKind::DependencyRetrying)
            }
            _ => false,
        };
        let unavailable = match g.state {
            Substate::New | Substate::Down | Substate::Problem | Substate::Removing | Substate::Removed => true,
            Substate::StartRequested => !g.exec_flags.is_completed(NotificationKind::DependencyAvailable),
            _ => false,
        };
        let up = match g.state {
            Substate::Up => true,
            Substate::StopRequested => !g.exec_flags.is_completed(NotificationKind::DependencyStopped),
            _ => false,
        };
        VisibleStatus { unavailable, up, failed }
    }

    // ── The transition loop (§4.2) ──────────────────────────────────────────

    fn run_transitions(&self) {
        let mut work = Vec::new();
        let mut flush: Option<(ServiceName, Vec<Arc<dyn Listener>>, Vec<LifecycleEvent>)> = None;
        let was_unstable;
        let is_unstable;
        {
            let mut g = self.inner.lock().expect("controller lock poisoned");
            was_unstable = !g.state.is_rest() || g.async_tasks > 0;

            if g.committed && g.async_tasks == 0 {
                loop {
                    let is_up = g.state == Substate::Up;
                    let want = g.mode.wants_demand(g.demanded_by_count, is_up);
                    if want != g.dependencies_demanded {
                        g.dependencies_demanded = want;
                        if !self.requires.is_empty() {
                            work.push(if want { Work::Demand } else { Work::Undemand });
                        }
                    }
                    if !work.is_empty() {
                        break;
                    }

                    let inputs = SelectorInputs {
                        mode: g.mode,
                        state: g.state,
                        unavailable_dependencies: g.unavailable_dependencies,
                        stopping_dependencies: g.stopping_dependencies,
                        fail_count: g.fail_count,
                        demanded_by_count: g.demanded_by_count,
                        running_dependents: g.running_dependents,
                        has_start_exception: g.start_exception.is_some(),
                    };
                    match select_transition(inputs) {
                        Some(next) => {
                            self.enter_state(&mut g, next, &mut work);
                            if !work.is_empty() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                g.async_tasks += work.len() as u32;
                if work.is_empty() && !g.listener_transition_tasks.is_empty() {
                    let events = std::mem::take(&mut g.listener_transition_tasks);
                    let listeners = self.listeners.lock().expect("controller lock poisoned").clone();
                    flush = Some((self.primary_name(), listeners, events));
                }
            }
            is_unstable = !g.state.is_rest() || g.async_tasks > 0;
        }

        if was_unstable != is_unstable {
            if let Some(rt) = self.runtime.upgrade() {
                rt.note_stability_delta(is_unstable);
            }
        }

        self.dispatch_work(work);

        if let Some((name, listeners, events)) = flush {
            for event in events {
                trace!(service = %name, event = event.label(), "delivering lifecycle event");
                for listener in &listeners {
                    listener.on_event(&name, &event);
                }
            }
        }
    }

    fn enter_state(&self, g: &mut Inner, next: Substate, work: &mut Vec<Work>) {
        trace!(service = %self.primary_name(), from = ?g.state, to = ?next, "entering substate");
        g.state = next;
        g.exec_flags.reset();
        match next {
            Substate::New => unreachable!("the selector never re-enters NEW"),
            Substate::Down => {
                if self.any_dependents() {
                    g.exec_flags.mark_scheduled(NotificationKind::DependencyUnavailable);
                    work.push(Work::NotifyDependents(NotificationKind::DependencyUnavailable));
                }
                g.listener_transition_tasks.push(LifecycleEvent::Down);
            }
            Substate::StartRequested => {
                if self.any_dependents() {
                    g.exec_flags.mark_scheduled(NotificationKind::DependencyAvailable);
                    work.push(Work::NotifyDependents(NotificationKind::DependencyAvailable));
                }
            }
            Substate::Starting => {
                g.start_exception = None;
                work.push(Work::RunStart);
            }
            Substate::Up => {
                if self.any_dependents() {
                    g.exec_flags.mark_scheduled(NotificationKind::DependencyStarted);
                    work.push(Work::NotifyDependents(NotificationKind::DependencyStarted));
                }
                if !self.requires.is_empty() {
                    work.push(Work::DependentStarted);
                }
                g.listener_transition_tasks.push(LifecycleEvent::Up);
            }
            Substate::Problem => {
                // NEW/PROBLEM/REMOVING/REMOVED are unconditionally
                // unavailable-visible (§4.3); no fan-out needed, dependents
                // are still seeing the Unavailable delivered on entering DOWN.
            }
            Substate::StopRequested => {
                if self.any_dependents() {
                    g.exec_flags.mark_scheduled(NotificationKind::DependencyStopped);
                    work.push(Work::NotifyDependents(NotificationKind::DependencyStopped));
                }
            }
            Substate::Stopping => {
                if !self.requires.is_empty() {
                    work.push(Work::DependentStopped);
                }
                work.push(Work::RunStop);
            }
            Substate::StartFailed => {
                if self.any_dependents() {
                    g.exec_flags.mark_scheduled(NotificationKind::DependencyFailed);
                    work.push(Work::NotifyDependents(NotificationKind::DependencyFailed));
                }
                let cause = g
                    .start_exception
                    .clone()
                    .expect("START_FAILED is only entered with a recorded cause");
                g.listener_transition_tasks.push(LifecycleEvent::Failed(cause));
            }
            Substate::Removing => {
                work.push(Work::Detach);
            }
            Substate::Removed => {
                g.listener_transition_tasks.push(LifecycleEvent::Removed);
            }
        }
    }

    fn dispatch_work(&self, work: Vec<Work>) {
        for item in work {
            let this = self.self_arc();
            let job: Box<dyn FnOnce() + Send> = Box::new(move || this.run_work_item(item));
            match self.runtime.upgrade() {
                Some(rt) => rt.submit(job),
                None => job(),
            }
        }
    }

    /// Decrements the in-flight task count and, once it reaches zero,
    /// re-enters the transition loop (§4.2: "the loop is only entered when
    /// async_tasks == 0").
    fn task_complete(&self) {
        let should_continue = {
            let mut g = self.inner.lock().expect("controller lock poisoned");
            g.async_tasks = g.async_tasks.saturating_sub(1);
            g.async_tasks == 0
        };
        if should_continue {
            self.run_transitions();
        }
    }

    fn run_work_item(&self, item: Work) {
        match item {
            Work::Demand => {
                for slot in &self.requires {
                    slot.link.target().add_demand();
                }
                self.task_complete();
            }
            Work::Undemand => {
                for slot in &self.requires {
                    slot.link.target().remove_demand();
                }
                self.task_complete();
            }
            Work::DependentStarted => {
                for slot in &self.requires {
                    slot.link.target().dependent_started();
                }
                self.task_complete();
            }
            Work::DependentStopped => {
                for slot in &self.requires {
                    slot.link.target().dependent_stopped();
                }
                self.task_complete();
            }
            Work::NotifyDependents(kind) => {
                self.notify_dependents(kind);
                self.task_complete();
            }
            Work::RunStart => self.execute_start(),
            Work::RunStop => self.execute_stop(),
            Work::Detach => {
                self.execute_detach();
                self.task_complete();
            }
        }
    }

    fn notify_dependents(&self, kind: NotificationKind) {
        for slot in &self.provides {
            for dep_id in slot.registration.dependents_snapshot() {
                let Some(directory) = self.directory.upgrade() else { continue };
                let Some(dependent) = directory.controller(dep_id) else { continue };
                match kind {
                    NotificationKind::DependencyUnavailable => {
                        dependent.notify_dependency_unavailable(&slot.name)
                    }
                    NotificationKind::DependencyAvailable => {
                        dependent.notify_dependency_available(&slot.name)
                    }
                    NotificationKind::DependencyStarted => dependent.notify_dependency_started(&slot.name),
                    NotificationKind::DependencyStopped => dependent.notify_dependency_stopped(&slot.name),
                    NotificationKind::DependencyFailed => dependent.notify_dependency_failed(&slot.name),
                    NotificationKind::DependencyRetrying => dependent.notify_dependency_retrying(&slot.name),
                }
            }
        }
        let mut g = self.inner.lock().expect("controller lock poisoned");
        g.exec_flags.mark_completed(kind);
    }

    fn execute_start(&self) {
        let provides_for_ctx: Vec<(ServiceName, Arc<ValueCell>)> =
            self.provides.iter().map(|s| (s.name.clone(), Arc::clone(&s.cell))).collect();
        let shared = LifecycleShared::new();
        let completion: Arc<dyn StartCompletion> = self.self_arc();
        let ctx = StartContext::new(provides_for_ctx, shared, completion);
        let service = Arc::clone(&self.service);

        trace!(service = %self.primary_name(), "running start callback");
        let outcome = service.start(&ctx);
        if !ctx.is_asynchronous() {
            let _ = match outcome {
                Ok(()) => ctx.complete(),
                Err(cause) => ctx.fail(cause),
            };
        }
    }

    fn execute_stop(&self) {
        let names: Vec<ServiceName> = self.provides.iter().map(|s| s.name.clone()).collect();
        let completion: Arc<dyn StopCompletion> = self.self_arc();
        let ctx = StopContext::new(names, completion);
        let service = Arc::clone(&self.service);

        trace!(service = %self.primary_name(), "running stop callback");
        if let Err(err) = service.stop(&ctx) {
            warn!(service = %self.primary_name(), error = %err, "stop callback returned an error; lifecycle proceeds regardless");
        }
        if !ctx.is_asynchronous() {
            let _ = ctx.complete();
        }
    }

    fn execute_detach(&self) {
        for slot in &self.provides {
            slot.registration.clear_provider(self.id);
        }
        for slot in &self.requires {
            slot.link.target().remove_dependent(self.id);
        }
        if let Some(rt) = self.runtime.upgrade() {
            rt.on_removed(self.id);
        }
    }
}

impl StartCompletion for Controller {
    fn on_start_outcome(&self, outcome: Result<(), StartCause>) {
        let cause = match outcome {
            Ok(()) => {
                let all_defined = self.provides.iter().all(|s| s.cell.is_defined());
                if all_defined {
                    None
                } else {
                    let missing = self
                        .provides
                        .iter()
                        .find(|s| !s.cell.is_defined())
                        .map(|s| s.name.clone())
                        .unwrap_or_else(|| self.primary_name());
                    Some(Arc::new(crate::error::ContractError::MissingProvidedValue(missing))
                        as StartCause)
                }
            }
            Err(cause) => Some(cause),
        };
        if cause.is_some() {
            for s in &self.provides {
                s.cell.clear();
            }
        }
        {
            let mut g = self.inner.lock().expect("controller lock poisoned");
            g.start_exception = cause;
        }
        self.task_complete();
    }
}

impl StopCompletion for Controller {
    fn on_stop_complete(&self) {
        for s in &self.provides {
            s.cell.clear();
        }
        self.task_complete();
    }
}

fn apply_delta(v: u32, delta: i32) -> u32 {
    if delta >= 0 {
        v + delta as u32
    } else {
        v.saturating_sub((-delta) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ControllerIdGenerator;
    use crate::link::LinkKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex as StdMutex, OnceLock};

    /// An inline "executor" that runs jobs synchronously on the calling
    /// thread, so tests can drive the state machine without tokio.
    struct InlineRuntime {
        controllers: StdMutex<std::collections::HashMap<ControllerId, Arc<Controller>>>,
        unstable: AtomicUsize,
        removed: StdMutex<Vec<ControllerId>>,
    }

    impl InlineRuntime {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                controllers: StdMutex::new(std::collections::HashMap::new()),
                unstable: AtomicUsize::new(0),
                removed: StdMutex::new(Vec::new()),
            })
        }

        fn register(&self, controller: &Arc<Controller>) {
            self.controllers.lock().unwrap().insert(controller.id, Arc::clone(controller));
        }
    }

    impl ControllerDirectory for InlineRuntime {
        fn controller(&self, id: ControllerId) -> Option<Arc<Controller>> {
            self.controllers.lock().unwrap().get(&id).cloned()
        }
    }

    impl ContainerRuntime for InlineRuntime {
        fn submit(&self, job: Box<dyn FnOnce() + Send>) {
            job();
        }
        fn note_stability_delta(&self, now_unstable: bool) {
            if now_unstable {
                self.unstable.fetch_add(1, Ordering::SeqCst);
            } else {
                self.unstable.fetch_sub(1, Ordering::SeqCst);
            }
        }
        fn on_removed(&self, id: ControllerId) {
            self.removed.lock().unwrap().push(id);
        }
    }

    struct OkService;
    impl Service for OkService {
        fn start(&self, ctx: &StartContext) -> Result<(), StartCause> {
            let names: Vec<_> = ctx.provided_names().cloned().collect();
            for name in names {
                ctx.provide(&name, ()).expect("declared name");
            }
            Ok(())
        }
    }

    struct FailingService;
    impl Service for FailingService {
        fn start(&self, _ctx: &StartContext) -> Result<(), StartCause> {
            Err(Arc::new(std::io::Error::other("boom")))
        }
    }

    fn new_controller(
        rt: &Arc<InlineRuntime>,
        ids: &ControllerIdGenerator,
        service: Arc<dyn Service>,
        provides: Vec<ServiceName>,
        requires: Vec<Arc<Registration>>,
    ) -> Arc<Controller> {
        let directory: Weak<dyn ControllerDirectory> = Arc::downgrade(rt) as Weak<dyn ControllerDirectory>;
        let runtime: Weak<dyn ContainerRuntime> = Arc::downgrade(rt) as Weak<dyn ContainerRuntime>;
        let id = ids.next();
        let provide_slots = provides
            .into_iter()
            .map(|name| {
                let reg = Arc::new(Registration::new(name.clone(), directory.clone()));
                let cell = Arc::new(ValueCell::new(name.clone()));
                (name, reg, cell)
            })
            .collect();
        let links = requires.into_iter().map(|reg| DependencyLink::new(reg, LinkKind::Direct)).collect();
        let controller = Controller::new(id, service, provide_slots, links, directory, runtime);
        rt.register(&controller);
        controller
    }

    #[test]
    fn trivial_service_reaches_up_with_no_dependencies() {
        let rt = InlineRuntime::new();
        let ids = ControllerIdGenerator::default();
        let ctrl = new_controller(&rt, &ids, Arc::new(OkService), vec![ServiceName::single("a")], vec![]);
        for slot in &ctrl.provides {
            slot.registration.set_provider(ctrl.id).unwrap();
        }
        ctrl.commit_installation(Mode::Active);
        assert_eq!(ctrl.state(), Substate::Up);
    }

    #[test]
    fn failing_service_lands_in_start_failed_with_a_reason() {
        let rt = InlineRuntime::new();
        let ids = ControllerIdGenerator::default();
        let ctrl =
            new_controller(&rt, &ids, Arc::new(FailingService), vec![ServiceName::single("b")], vec![]);
        for slot in &ctrl.provides {
            slot.registration.set_provider(ctrl.id).unwrap();
        }
        ctrl.commit_installation(Mode::Active);
        assert_eq!(ctrl.state(), Substate::StartFailed);
        assert!(ctrl.reason().is_some());
    }

    #[test]
    fn on_demand_only_starts_once_demanded() {
        let rt = InlineRuntime::new();
        let ids = ControllerIdGenerator::default();
        let ctrl = new_controller(&rt, &ids, Arc::new(OkService), vec![ServiceName::single("c")], vec![]);
        for slot in &ctrl.provides {
            slot.registration.set_provider(ctrl.id).unwrap();
        }
        ctrl.commit_installation(Mode::OnDemand);
        assert_eq!(ctrl.state(), Substate::Down);
        ctrl.on_demand_delta(1);
        assert_eq!(ctrl.state(), Substate::Up);
        ctrl.on_demand_delta(-1);
        assert_eq!(ctrl.state(), Substate::Down);
    }

    #[test]
    fn dependent_sees_provider_missing_then_up() {
        let rt = InlineRuntime::new();
        let ids = ControllerIdGenerator::default();

        let provider =
            new_controller(&rt, &ids, Arc::new(OkService), vec![ServiceName::single("db")], vec![]);
        let db_registration = Arc::clone(&provider.provides[0].registration);

        let dependent = new_controller(
            &rt,
            &ids,
            Arc::new(OkService),
            vec![ServiceName::single("api")],
            vec![Arc::clone(&db_registration)],
        );
        db_registration.add_dependent(dependent.id);
        for slot in &dependent.provides {
            slot.registration.set_provider(dependent.id).unwrap();
        }
        dependent.commit_installation(Mode::Active);
        assert_eq!(dependent.state(), Substate::Problem);
        assert_eq!(dependent.missing(), vec![ServiceName::single("db")]);

        for slot in &provider.provides {
            slot.registration.set_provider(provider.id).unwrap();
        }
        provider.commit_installation(Mode::Active);
        assert_eq!(provider.state(), Substate::Up);
        assert_eq!(dependent.state(), Substate::Up);
        assert!(dependent.missing().is_empty());
    }

    #[test]
    fn late_listener_gets_synthetic_event_for_current_state() {
        let rt = InlineRuntime::new();
        let ids = ControllerIdGenerator::default();
        let ctrl = new_controller(&rt, &ids, Arc::new(OkService), vec![ServiceName::single("d")], vec![]);
        for slot in &ctrl.provides {
            slot.registration.set_provider(ctrl.id).unwrap();
        }
        ctrl.commit_installation(Mode::Active);

        static SEEN: OnceLock<StdMutex<Vec<&'static str>>> = OnceLock::new();
        SEEN.get_or_init(|| StdMutex::new(Vec::new()));
        struct Recorder;
        impl Listener for Recorder {
            fn on_event(&self, _service: &ServiceName, event: &LifecycleEvent) {
                SEEN.get().unwrap().lock().unwrap().push(event.label());
            }
        }
        ctrl.add_listener(Arc::new(Recorder));
        assert_eq!(SEEN.get().unwrap().lock().unwrap().as_slice(), &["UP"]);
    }

    #[test]
    fn remove_mode_detaches_and_notifies_container() {
        let rt = InlineRuntime::new();
        let ids = ControllerIdGenerator::default();
        let ctrl = new_controller(&rt, &ids, Arc::new(OkService), vec![ServiceName::single("e")], vec![]);
        for slot in &ctrl.provides {
            slot.registration.set_provider(ctrl.id).unwrap();
        }
        ctrl.commit_installation(Mode::Active);
        assert_eq!(ctrl.state(), Substate::Up);
        ctrl.set_mode(Mode::Remove);
        assert_eq!(ctrl.state(), Substate::Removed);
        assert_eq!(rt.removed.lock().unwrap().as_slice(), &[ctrl.id]);
    }
}

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ContractError, StartCause};
use crate::name::ServiceName;
use crate::value::ValueCell;

/// A user-supplied unit of behavior: something with a `start`/`stop`
/// lifecycle that produces and consumes named values (§1, §6).
///
/// Both callbacks run on a worker thread, outside every container lock
/// (§4.4, §5). The default implementations suit an aggregation service
/// (Glossary) that provides no value and merely groups dependencies.
pub trait Service: Send + Sync + 'static {
    fn start(&self, ctx: &StartContext) -> Result<(), StartCause> {
        let _ = ctx;
        Ok(())
    }

    fn stop(&self, ctx: &StopContext) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let _ = ctx;
        Ok(())
    }
}

/// Callback the controller implements so [`StartContext`] can settle a start
/// attempt without `service.rs` depending on `controller.rs` directly.
pub(crate) trait StartCompletion: Send + Sync + 'static {
    fn on_start_outcome(&self, outcome: Result<(), StartCause>);
}

/// Mirror of [`StartCompletion`] for the stop side, which never carries a
/// failure cause (§4.4, §7: stop cannot fail the lifecycle).
pub(crate) trait StopCompletion: Send + Sync + 'static {
    fn on_stop_complete(&self);
}

/// Shared "settled at most once" guard for a start attempt. `asynchronous`
/// tracks whether the callback deferred completion; `settled` guards against
/// a second `complete()`/`fail()` call (§4.4, §7's AlreadyCompleted case).
pub(crate) struct LifecycleShared {
    asynchronous: AtomicBool,
    settled: AtomicBool,
}

impl LifecycleShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            asynchronous: AtomicBool::new(false),
            settled: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_asynchronous(&self) -> bool {
        self.asynchronous.load(Ordering::Acquire)
    }

    /// Claims the single completion slot. Returns `false` if it was already
    /// claimed by a prior `complete()`/`fail()` call.
    fn claim(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }
}

/// Where a `Service::start` implementation writes its provided values and
/// signals completion (§4.4).
///
/// Cloneable so a `start` implementation that calls [`StartContext::asynchronous`]
/// can move a clone into a spawned task and call `complete()`/`fail()` from
/// there once the real work finishes.
#[derive(Clone)]
pub struct StartContext {
    provides: Vec<(ServiceName, Arc<ValueCell>)>,
    shared: Arc<LifecycleShared>,
    completion: Arc<dyn StartCompletion>,
}

impl StartContext {
    pub(crate) fn new(
        provides: Vec<(ServiceName, Arc<ValueCell>)>,
        shared: Arc<LifecycleShared>,
        completion: Arc<dyn StartCompletion>,
    ) -> Self {
        Self { provides, shared, completion }
    }

    /// The names this controller declared in `provides()`, in declaration
    /// order. A `start()` implementation that provides every declared name
    /// can iterate this instead of hardcoding them.
    pub fn provided_names(&self) -> impl Iterator<Item = &ServiceName> {
        self.provides.iter().map(|(name, _)| name)
    }

    /// Write a provided value. `name` must be one of the names this
    /// controller declared in `provides()`.
    pub fn provide<V: Any + Send + Sync>(&self, name: &ServiceName, value: V) -> Result<(), ContractError> {
        for (cell_name, cell) in &self.provides {
            if cell_name == name {
                cell.set(value);
                return Ok(());
            }
        }
        Err(ContractError::ValueWrittenOutsideWindow(name.clone()))
    }

    /// Defer completion: the worker thread must not auto-complete on
    /// return from `start()`; the caller will later invoke `complete()` or
    /// `fail()`, possibly from a different thread.
    pub fn asynchronous(&self) {
        self.shared.asynchronous.store(true, Ordering::Release);
    }

    pub fn is_asynchronous(&self) -> bool {
        self.shared.is_asynchronous()
    }

    pub fn complete(&self) -> Result<(), ContractError> {
        if !self.shared.claim() {
            return Err(ContractError::AlreadyCompleted);
        }
        self.completion.on_start_outcome(Ok(()));
        Ok(())
    }

    pub fn fail(&self, cause: StartCause) -> Result<(), ContractError> {
        if !self.shared.claim() {
            return Err(ContractError::AlreadyCompleted);
        }
        self.completion.on_start_outcome(Err(cause));
        Ok(())
    }
}

/// Mirror of [`LifecycleShared`] for stop attempts: no failure cause, since
/// a stop can never fail the lifecycle (§4.4, §7).
struct StopShared {
    asynchronous: AtomicBool,
    settled: AtomicBool,
}

impl StopShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            asynchronous: AtomicBool::new(false),
            settled: AtomicBool::new(false),
        })
    }
}

/// Where a `Service::stop` implementation observes provided-value cleanup
/// and, if it needs to finish asynchronously, defers completion the same
/// way [`StartContext`] does.
#[derive(Clone)]
pub struct StopContext {
    provides: Vec<ServiceName>,
    shared: Arc<StopShared>,
    completion: Arc<dyn StopCompletion>,
}

impl StopContext {
    pub(crate) fn new(provides: Vec<ServiceName>, completion: Arc<dyn StopCompletion>) -> Self {
        Self { provides, shared: StopShared::new(), completion }
    }

    pub fn provided_names(&self) -> impl Iterator<Item = &ServiceName> {
        self.provides.iter()
    }

    pub fn asynchronous(&self) {
        self.shared.asynchronous.store(true, Ordering::Release);
    }

    pub fn is_asynchronous(&self) -> bool {
        self.shared.asynchronous.load(Ordering::Acquire)
    }

    pub fn complete(&self) -> Result<(), ContractError> {
        if self.shared.settled.swap(true, Ordering::AcqRel) {
            return Err(ContractError::AlreadyCompleted);
        }
        self.completion.on_stop_complete();
        Ok(())
    }
}

impl fmt::Debug for StartContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartContext")
            .field("provides", &self.provides.iter().map(|(n, _)| n.to_string()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingCompletion(Mutex<Vec<Result<(), StartCause>>>);
    impl StartCompletion for RecordingCompletion {
        fn on_start_outcome(&self, outcome: Result<(), StartCause>) {
            self.0.lock().unwrap().push(outcome);
        }
    }

    fn ctx_with(provides: Vec<(ServiceName, Arc<ValueCell>)>) -> (StartContext, Arc<RecordingCompletion>) {
        let completion = Arc::new(RecordingCompletion(Mutex::new(Vec::new())));
        let ctx = StartContext::new(provides, LifecycleShared::new(), completion.clone());
        (ctx, completion)
    }

    #[test]
    fn double_complete_is_a_contract_violation() {
        let (ctx, completion) = ctx_with(Vec::new());
        assert!(ctx.complete().is_ok());
        assert!(matches!(ctx.complete(), Err(ContractError::AlreadyCompleted)));
        assert_eq!(completion.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn provide_rejects_undeclared_names() {
        let cell = Arc::new(ValueCell::new(ServiceName::single("a")));
        let (ctx, _completion) = ctx_with(vec![(ServiceName::single("a"), cell)]);
        assert!(ctx.provide(&ServiceName::single("b"), 1i32).is_err());
        assert!(ctx.provide(&ServiceName::single("a"), 1i32).is_ok());
    }

    struct RecordingStopCompletion(Mutex<u32>);
    impl StopCompletion for RecordingStopCompletion {
        fn on_stop_complete(&self) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn stop_completion_fires_exactly_once() {
        let completion = Arc::new(RecordingStopCompletion(Mutex::new(0)));
        let ctx = StopContext::new(vec![ServiceName::single("a")], completion.clone());
        assert!(ctx.complete().is_ok());
        assert!(matches!(ctx.complete(), Err(ContractError::AlreadyCompleted)));
        assert_eq!(*completion.0.lock().unwrap(), 1);
    }
}

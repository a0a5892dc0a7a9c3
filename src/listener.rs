use crate::error::StartCause;
use crate::name::ServiceName;

/// Terminal lifecycle events delivered to listeners (§6). Exactly one event
/// is observed per terminal substate entry, in transition order; a
/// late-registering listener receives a single synthetic event matching the
/// controller's current rest state so subscription order never loses the
/// steady state.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Up,
    Down,
    Failed(StartCause),
    Removed,
}

impl LifecycleEvent {
    pub fn label(&self) -> &'static str {
        match self {
            LifecycleEvent::Up => "UP",
            LifecycleEvent::Down => "DOWN",
            LifecycleEvent::Failed(_) => "FAILED",
            LifecycleEvent::Removed => "REMOVED",
        }
    }
}

/// Observes lifecycle events for a single controller.
pub trait Listener: Send + Sync + 'static {
    fn on_event(&self, service: &ServiceName, event: &LifecycleEvent);
}

impl<F> Listener for F
where
    F: Fn(&ServiceName, &LifecycleEvent) + Send + Sync + 'static,
{
    fn on_event(&self, service: &ServiceName, event: &LifecycleEvent) {
        (self)(service, event)
    }
}

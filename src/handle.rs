use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::controller::Controller;

/// Opaque, non-owning reference to a controller (§9: "arena-allocated
/// entities identified by opaque handles; cross-entity references are
/// handles, never owning references"). Registrations store the handles of
/// their provider and dependents rather than `Arc<Controller>`, so the
/// ownership graph stays acyclic: the container's controller map is the only
/// strong owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerId(u64);

impl ControllerId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Default)]
pub(crate) struct ControllerIdGenerator(AtomicU64);

impl ControllerIdGenerator {
    pub(crate) fn next(&self) -> ControllerId {
        ControllerId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Resolves handles back to their strongly-owned controller. Implemented by
/// the container, which is the sole strong owner of every `Controller`.
pub trait ControllerDirectory: Send + Sync {
    fn controller(&self, id: ControllerId) -> Option<Arc<Controller>>;
}

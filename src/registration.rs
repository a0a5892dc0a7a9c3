use std::collections::HashSet;
use std::sync::{Arc, RwLock, Weak};

use crate::handle::{ControllerDirectory, ControllerId};
use crate::name::ServiceName;

struct RegistrationInner {
    provider: Option<ControllerId>,
    /// Whether the provider's installation has left NEW. Dependents attaching
    /// before this point synchronously see `dependencyUnavailable` (§4.1).
    provider_committed: bool,
    dependents: HashSet<ControllerId>,
    demanded_by_count: u32,
    dependents_started_count: u32,
    pending_installations: u32,
    removed: bool,
}

impl RegistrationInner {
    fn recompute_removed(&mut self) {
        self.removed =
            self.provider.is_none() && self.dependents.is_empty() && self.pending_installations == 0;
    }
}

/// Per-name slot mediating a provider and its dependents (§3, §4.1).
///
/// A registration outlives any single controller: it is reused whenever a
/// new provider for the same name installs. Every mutation happens under
/// `inner`'s write lock, matching the tier-2 registration lock in the
/// container's acquisition order (§5).
pub struct Registration {
    name: ServiceName,
    inner: RwLock<RegistrationInner>,
    directory: Weak<dyn ControllerDirectory>,
}

impl Registration {
    pub fn new(name: ServiceName, directory: Weak<dyn ControllerDirectory>) -> Self {
        Self {
            name,
            inner: RwLock::new(RegistrationInner {
                provider: None,
                provider_committed: false,
                dependents: HashSet::new(),
                demanded_by_count: 0,
                dependents_started_count: 0,
                pending_installations: 0,
                removed: false,
            }),
            directory,
        }
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn is_removed(&self) -> bool {
        self.inner.read().expect("registration lock poisoned").removed
    }

    pub fn has_provider(&self) -> bool {
        self.inner.read().expect("registration lock poisoned").provider.is_some()
    }

    pub fn provider(&self) -> Option<ControllerId> {
        self.inner.read().expect("registration lock poisoned").provider
    }

    pub fn has_any_dependents(&self) -> bool {
        !self.inner.read().expect("registration lock poisoned").dependents.is_empty()
    }

    pub fn dependents_snapshot(&self) -> Vec<ControllerId> {
        self.inner
            .read()
            .expect("registration lock poisoned")
            .dependents
            .iter()
            .copied()
            .collect()
    }

    fn resolve(&self, id: ControllerId) -> Option<Arc<crate::controller::Controller>> {
        self.directory.upgrade()?.controller(id)
    }

    /// Either retrieves an already-non-removed registration (the common
    /// case, handled by the container's map lookup) or is freshly
    /// constructed; in both cases the caller then calls this to claim a
    /// pending-installation slot. Returns `false` if the registration was
    /// concurrently marked removed and the caller must retry against a new
    /// instance (§4.1).
    pub fn begin_installation(&self) -> bool {
        let mut inner = self.inner.write().expect("registration lock poisoned");
        if inner.removed {
            return false;
        }
        inner.pending_installations += 1;
        true
    }

    pub fn cancel_installation(&self) {
        let mut inner = self.inner.write().expect("registration lock poisoned");
        inner.pending_installations = inner.pending_installations.saturating_sub(1);
        inner.recompute_removed();
    }

    /// Binds `id` as this registration's provider, replaying any
    /// accumulated demand and started-dependent counts onto it so a late
    /// provider observes the same net state as if it had been first.
    ///
    /// Returns `Err(())` if a provider is already bound (duplicate-provider,
    /// surfaced by the container as [`crate::error::InstallError::DuplicateProvider`]).
    pub fn set_provider(&self, id: ControllerId) -> Result<(), ()> {
        let (demanded_by_count, dependents_started_count) = {
            let mut inner = self.inner.write().expect("registration lock poisoned");
            if inner.provider.is_some() {
                return Err(());
            }
            inner.provider = Some(id);
            inner.provider_committed = false;
            inner.pending_installations = inner.pending_installations.saturating_sub(1);
            (inner.demanded_by_count, inner.dependents_started_count)
        };
        if let Some(controller) = self.resolve(id) {
            controller.replay_initial_counts(demanded_by_count, dependents_started_count);
        }
        Ok(())
    }

    /// Marks the provider's installation as having left NEW; from this
    /// point on, new dependents see a status replay instead of a synchronous
    /// unavailable (§4.1).
    pub fn mark_committed(&self) {
        self.inner.write().expect("registration lock poisoned").provider_committed = true;
    }

    /// Only the matching provider may clear itself. Returns whether the
    /// registration is now fully removed.
    pub fn clear_provider(&self, id: ControllerId) -> bool {
        let mut inner = self.inner.write().expect("registration lock poisoned");
        if inner.provider != Some(id) {
            return inner.removed;
        }
        inner.provider = None;
        inner.provider_committed = false;
        inner.recompute_removed();
        inner.removed
    }

    /// Attaches `dependent` and synchronously delivers its initial view of
    /// this registration's status (§4.1).
    pub fn add_dependent(&self, dependent: ControllerId) {
        enum Delivery {
            Unavailable,
            Replay(ControllerId),
        }

        let delivery = {
            let mut inner = self.inner.write().expect("registration lock poisoned");
            inner.dependents.insert(dependent);
            inner.removed = false;
            match inner.provider {
                Some(provider_id) if inner.provider_committed => Delivery::Replay(provider_id),
                _ => Delivery::Unavailable,
            }
        };

        match delivery {
            Delivery::Unavailable => {
                if let Some(dep_ctrl) = self.resolve(dependent) {
                    dep_ctrl.notify_dependency_unavailable(&self.name);
                }
            }
            Delivery::Replay(provider_id) => {
                if let (Some(provider_ctrl), Some(dep_ctrl)) =
                    (self.resolve(provider_id), self.resolve(dependent))
                {
                    let status = provider_ctrl.visible_status();
                    dep_ctrl.replay_new_dependent(&self.name, status);
                }
            }
        }
    }

    pub fn remove_dependent(&self, dependent: ControllerId) {
        let mut inner = self.inner.write().expect("registration lock poisoned");
        inner.dependents.remove(&dependent);
        inner.recompute_removed();
    }

    /// Raises net demand by one, forwarding live to the provider if bound.
    pub fn add_demand(&self) {
        let provider = {
            let mut inner = self.inner.write().expect("registration lock poisoned");
            inner.demanded_by_count += 1;
            inner.provider.filter(|_| inner.provider_committed)
        };
        if let Some(id) = provider {
            if let Some(ctrl) = self.resolve(id) {
                ctrl.on_demand_delta(1);
            }
        }
    }

    pub fn remove_demand(&self) {
        let provider = {
            let mut inner = self.inner.write().expect("registration lock poisoned");
            inner.demanded_by_count = inner.demanded_by_count.saturating_sub(1);
            inner.provider.filter(|_| inner.provider_committed)
        };
        if let Some(id) = provider {
            if let Some(ctrl) = self.resolve(id) {
                ctrl.on_demand_delta(-1);
            }
        }
    }

    pub fn dependent_started(&self) {
        let provider = {
            let mut inner = self.inner.write().expect("registration lock poisoned");
            inner.dependents_started_count += 1;
            inner.provider.filter(|_| inner.provider_committed)
        };
        if let Some(id) = provider {
            if let Some(ctrl) = self.resolve(id) {
                ctrl.on_running_dependents_delta(1);
            }
        }
    }

    pub fn dependent_stopped(&self) {
        let provider = {
            let mut inner = self.inner.write().expect("registration lock poisoned");
            inner.dependents_started_count = inner.dependents_started_count.saturating_sub(1);
            inner.provider.filter(|_| inner.provider_committed)
        };
        if let Some(id) = provider {
            if let Some(ctrl) = self.resolve(id) {
                ctrl.on_running_dependents_delta(-1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyDirectory;
    impl ControllerDirectory for EmptyDirectory {
        fn controller(&self, _id: ControllerId) -> Option<Arc<crate::controller::Controller>> {
            None
        }
    }

    fn registration() -> Registration {
        let directory: Weak<dyn ControllerDirectory> = Weak::<EmptyDirectory>::new();
        Registration::new(ServiceName::single("db"), directory)
    }

    #[test]
    fn fresh_registration_is_not_removed_and_has_no_provider() {
        let reg = registration();
        assert!(!reg.is_removed());
        assert!(!reg.has_provider());
    }

    #[test]
    fn begin_installation_tracks_pending_count_until_cancelled() {
        let reg = registration();
        assert!(reg.begin_installation());
        reg.cancel_installation();
        assert!(reg.is_removed());
    }

    #[test]
    fn set_provider_twice_is_a_duplicate() {
        let reg = registration();
        let a = ControllerId::from_raw(1);
        let b = ControllerId::from_raw(2);
        assert!(reg.set_provider(a).is_ok());
        assert!(reg.set_provider(b).is_err());
    }

    #[test]
    fn clear_provider_by_non_owner_is_ignored() {
        let reg = registration();
        let a = ControllerId::from_raw(1);
        let b = ControllerId::from_raw(2);
        reg.set_provider(a).unwrap();
        reg.clear_provider(b);
        assert!(reg.has_provider());
    }

    #[test]
    fn removed_only_once_provider_and_dependents_and_pending_all_clear() {
        let reg = registration();
        let provider = ControllerId::from_raw(1);
        let dependent = ControllerId::from_raw(2);
        reg.set_provider(provider).unwrap();
        reg.add_dependent(dependent);
        assert!(!reg.clear_provider(provider));
        reg.remove_dependent(dependent);
        assert!(reg.is_removed());
    }
}

use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::error::InstallError;
use crate::link::LinkKind;
use crate::listener::Listener;
use crate::mode::Mode;
use crate::name::ServiceName;
use crate::service::Service;

/// Declares a single service's `requires`/`provides`/`instance`/`mode` edges
/// before handing them to [`crate::container::Container::install`] (§6).
///
/// `install()` consumes the builder, so re-installing the same builder twice
/// is a move error the compiler catches at compile time rather than the
/// `AlreadyInstalled` runtime error the corpus raises for its mutable,
/// re-usable builder shape (see DESIGN.md). The thread-affinity check is
/// kept: a builder handed across threads before `install()` is rejected with
/// [`InstallError::ForeignThreadAccess`], mirroring the corpus's guard
/// against a builder being touched by more than one thread.
pub struct ServiceBuilder {
    provides: Vec<ServiceName>,
    requires: Vec<(ServiceName, LinkKind)>,
    instance: Option<Arc<dyn Service>>,
    mode: Mode,
    listeners: Vec<Arc<dyn Listener>>,
    owner_thread: ThreadId,
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self {
            provides: Vec::new(),
            requires: Vec::new(),
            instance: None,
            mode: Mode::Active,
            listeners: Vec::new(),
            owner_thread: thread::current().id(),
        }
    }

    pub fn provides(mut self, name: impl Into<ServiceName>) -> Self {
        self.provides.push(name.into());
        self
    }

    pub fn requires(mut self, name: impl Into<ServiceName>) -> Self {
        self.requires.push((name.into(), LinkKind::Direct));
        self
    }

    /// A dependency whose absence never blocks this service from starting;
    /// "missing" is equivalent to "present but DOWN" (§3).
    pub fn requires_optional(mut self, name: impl Into<ServiceName>) -> Self {
        self.requires.push((name.into(), LinkKind::Optional));
        self
    }

    pub fn instance(mut self, service: impl Service) -> Self {
        self.instance = Some(Arc::new(service));
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn add_listener(mut self, listener: impl Listener) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub(crate) fn check_thread(&self) -> Result<(), InstallError> {
        if thread::current().id() != self.owner_thread {
            Err(InstallError::ForeignThreadAccess)
        } else {
            Ok(())
        }
    }

    pub(crate) fn validate_names(&self) -> Result<(), InstallError> {
        for (require_name, _) in &self.requires {
            if self.provides.contains(require_name) {
                return Err(InstallError::RequireAndProvideSameName(require_name.clone()));
            }
        }
        Ok(())
    }

    pub(crate) fn take_instance(&mut self) -> Result<Arc<dyn Service>, InstallError> {
        self.instance.take().ok_or(InstallError::NullArgument("instance"))
    }

    pub(crate) fn provides_names(&self) -> &[ServiceName] {
        &self.provides
    }

    pub(crate) fn requires_links(&self) -> &[(ServiceName, LinkKind)] {
        &self.requires
    }

    pub(crate) fn mode_value(&self) -> Mode {
        self.mode
    }

    pub(crate) fn take_listeners(&mut self) -> Vec<Arc<dyn Listener>> {
        std::mem::take(&mut self.listeners)
    }
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_and_provides_the_same_name_is_rejected() {
        let builder = ServiceBuilder::new().provides("a").requires("a");
        assert!(matches!(
            builder.validate_names(),
            Err(InstallError::RequireAndProvideSameName(_))
        ));
    }

    #[test]
    fn distinct_names_validate_cleanly() {
        let builder = ServiceBuilder::new().provides("a").requires("b");
        assert!(builder.validate_names().is_ok());
    }

    #[test]
    fn missing_instance_is_a_null_argument() {
        let mut builder = ServiceBuilder::new().provides("a");
        assert!(matches!(builder.take_instance(), Err(InstallError::NullArgument(_))));
    }
}

use std::fmt;
use std::sync::Arc;

use crate::name::ServiceName;

/// Configuration-kind failures: synchronous to the installer, recoverable by
/// fixing the builder call and retrying.
#[derive(Debug, Clone)]
pub enum InstallError {
    /// A registration already has a provider bound to it.
    DuplicateProvider(ServiceName),
    /// Installing this service would close a cycle in the dependency graph.
    /// `cycle` spells the path in dependency order.
    CycleDetected { cycle: Vec<ServiceName> },
    /// The same name was declared in both `requires` and `provides`.
    RequireAndProvideSameName(ServiceName),
    /// The builder was used again after `install()` already consumed it.
    AlreadyInstalled,
    /// The builder was shared across threads and accessed from one that did
    /// not create it.
    ForeignThreadAccess,
    /// A required argument was missing (e.g. no instance or no names).
    NullArgument(&'static str),
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallError::DuplicateProvider(name) => {
                write!(f, "a provider is already registered for '{name}'")
            }
            InstallError::CycleDetected { cycle } => {
                let path = cycle
                    .iter()
                    .map(|n| n.to_string())
                    .collect::<Vec<_>>()
                    .join(" -> ");
                write!(f, "installing would close a dependency cycle: {path}")
            }
            InstallError::RequireAndProvideSameName(name) => {
                write!(f, "'{name}' cannot be both required and provided by the same service")
            }
            InstallError::AlreadyInstalled => {
                write!(f, "builder was already consumed by a prior install() call")
            }
            InstallError::ForeignThreadAccess => {
                write!(f, "builder was accessed from a thread that did not create it")
            }
            InstallError::NullArgument(what) => write!(f, "missing required argument: {what}"),
        }
    }
}

impl std::error::Error for InstallError {}

/// Internal contract violations: programmer errors raised back to the caller
/// rather than routed through the lifecycle state machine.
#[derive(Debug, Clone)]
pub enum ContractError {
    /// `complete()` or `fail()` was called more than once on the same context.
    AlreadyCompleted,
    /// A value cell was written to outside its owner's start/stop window.
    ValueWrittenOutsideWindow(ServiceName),
    /// A value cell was read as a type it does not hold.
    ValueTypeMismatch { name: ServiceName, expected: &'static str },
    /// A provided name was declared but never written before `complete()`.
    MissingProvidedValue(ServiceName),
}

impl fmt::Display for ContractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractError::AlreadyCompleted => {
                write!(f, "lifecycle context was already completed or failed")
            }
            ContractError::ValueWrittenOutsideWindow(name) => write!(
                f,
                "value cell '{name}' was written outside its owner's start/stop window"
            ),
            ContractError::ValueTypeMismatch { name, expected } => write!(
                f,
                "value cell '{name}' does not hold the expected type {expected}"
            ),
            ContractError::MissingProvidedValue(name) => {
                write!(f, "provided value '{name}' was never set before start completed")
            }
        }
    }
}

impl std::error::Error for ContractError {}

/// The cause a `Service::start` implementation attaches to a failed start.
/// Wrapped in `Arc` so the same cause can be cloned into every dependent
/// notification without re-boxing.
pub type StartCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

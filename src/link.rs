use std::sync::Arc;

use crate::registration::Registration;

/// Whether a dependency link is required for the dependent to ever start,
/// or merely consulted for its availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Direct,
    /// Masks the underlying provider's existence so that "missing target"
    /// is equivalent to "present but DOWN" (§3). An optional link never
    /// contributes to `unavailable_dependencies` or `stopping_dependencies`
    /// (see DESIGN.md for this Open Question resolution); its runtime
    /// `available` projection lives alongside the owning controller's other
    /// per-link state, not here, so every mutation is serialized by the same
    /// lock as the counters it can never perturb.
    Optional,
}

/// An immutable edge descriptor from a dependent controller to a
/// registration it requires (§3). Mutable per-link runtime state (the
/// optional `available` flag, and whether a first `DependencyStarted` has
/// been observed) is tracked by the owning controller, indexed in parallel
/// with its `requires` vector — see `controller::LinkRuntime`.
pub struct DependencyLink {
    target: Arc<Registration>,
    kind: LinkKind,
}

impl DependencyLink {
    pub fn new(target: Arc<Registration>, kind: LinkKind) -> Self {
        Self { target, kind }
    }

    pub fn target(&self) -> &Arc<Registration> {
        &self.target
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn is_optional(&self) -> bool {
        self.kind == LinkKind::Optional
    }

    /// Whether this link counts toward the owning controller's
    /// `unavailable_dependencies`/`stopping_dependencies` aggregates.
    /// Direct links always do; optional links never do.
    pub fn counts_toward_aggregates(&self) -> bool {
        self.kind == LinkKind::Direct
    }
}

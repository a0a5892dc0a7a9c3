/// Governs whether a controller wants to be started and whether it
/// propagates demand to the services it requires (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Terminal: drives the controller to REMOVED regardless of demand.
    Remove,
    /// Never starts; stops as soon as it is up.
    Never,
    /// Starts only while demanded by at least one dependent.
    OnDemand,
    /// Starts while demanded; once UP, stays UP even if demand later drops
    /// to zero (demand is only consulted to start LAZY, never to stop it —
    /// see DESIGN.md for this Open Question resolution).
    Lazy,
    /// Starts unconditionally once its dependencies are not mid-stop.
    Passive,
    /// Starts unconditionally and always propagates demand downward.
    Active,
}

impl Mode {
    /// `shouldStart()` from §4.2.
    pub fn should_start(self, demanded_by_count: u32, stopping_dependencies: u32) -> bool {
        match self {
            Mode::Active => true,
            Mode::Passive => stopping_dependencies == 0,
            Mode::OnDemand | Mode::Lazy => demanded_by_count > 0,
            Mode::Never | Mode::Remove => false,
        }
    }

    /// `shouldStop()` from §4.2.
    pub fn should_stop(self, demanded_by_count: u32) -> bool {
        match self {
            Mode::Remove | Mode::Never => true,
            Mode::OnDemand => demanded_by_count == 0,
            Mode::Lazy | Mode::Passive | Mode::Active => false,
        }
    }

    /// Whether this mode currently wants demand raised on its required
    /// links, given whether the controller is presently UP.
    pub fn wants_demand(self, demanded_by_count: u32, is_up: bool) -> bool {
        match self {
            Mode::Active => true,
            Mode::OnDemand | Mode::Passive => demanded_by_count > 0,
            Mode::Lazy => is_up || demanded_by_count > 0,
            Mode::Never | Mode::Remove => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_always_starts_and_never_stops() {
        assert!(Mode::Active.should_start(0, 5));
        assert!(!Mode::Active.should_stop(0));
    }

    #[test]
    fn on_demand_tracks_demand_count() {
        assert!(!Mode::OnDemand.should_start(0, 0));
        assert!(Mode::OnDemand.should_start(1, 0));
        assert!(Mode::OnDemand.should_stop(0));
        assert!(!Mode::OnDemand.should_stop(1));
    }

    #[test]
    fn lazy_demands_while_up_even_with_no_dependents() {
        assert!(Mode::Lazy.wants_demand(0, true));
        assert!(!Mode::Lazy.wants_demand(0, false));
    }

    #[test]
    fn passive_requires_no_stopping_dependencies() {
        assert!(Mode::Passive.should_start(0, 0));
        assert!(!Mode::Passive.should_start(0, 1));
    }
}

use crate::mode::Mode;

/// The collapsed substate set this implementation treats as canonical
/// (§4.2, §9): richer corpora additionally expose WAITING, WONT_START,
/// START_INITIATING, CANCELLED, TERMINATED, but every observable
/// notification below is preserved without them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Substate {
    New,
    Down,
    StartRequested,
    Starting,
    Up,
    Problem,
    Removing,
    Removed,
    StopRequested,
    Stopping,
    StartFailed,
}

impl Substate {
    /// A rest state is one where the controller may quiesce with no pending
    /// work: DOWN, UP, PROBLEM, START_FAILED, REMOVED.
    pub fn is_rest(self) -> bool {
        matches!(
            self,
            Substate::Down | Substate::Up | Substate::Problem | Substate::StartFailed | Substate::Removed
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Substate::Removed)
    }
}

/// The inputs the transition selector consults (§4.2). Carries no behavior
/// of its own beyond grouping the counters the selector reads under one
/// name; the controller is the sole owner of the underlying fields.
#[derive(Debug, Clone, Copy)]
pub struct SelectorInputs {
    pub mode: Mode,
    pub state: Substate,
    pub unavailable_dependencies: u32,
    pub stopping_dependencies: u32,
    pub fail_count: u32,
    pub demanded_by_count: u32,
    pub running_dependents: u32,
    pub has_start_exception: bool,
}

/// A pure function of `(state, mode, counters, start_exception)` (§9):
/// returns the next substate to enter, or `None` if the controller should
/// remain in `state`.
///
/// Called only under the controller's own lock; never blocks, never
/// allocates, never touches any other entity.
pub fn select_transition(inputs: SelectorInputs) -> Option<Substate> {
    let SelectorInputs {
        mode,
        state,
        unavailable_dependencies,
        stopping_dependencies,
        fail_count,
        demanded_by_count,
        running_dependents,
        has_start_exception,
    } = inputs;

    let should_start = mode.should_start(demanded_by_count, stopping_dependencies);
    let should_stop = mode.should_stop(demanded_by_count);

    match state {
        Substate::New => Some(Substate::Down),
        Substate::Down => {
            if mode == Mode::Remove {
                Some(Substate::Removing)
            } else if should_start && (unavailable_dependencies > 0 || fail_count > 0) {
                Some(Substate::Problem)
            } else if should_start && stopping_dependencies == 0 {
                Some(Substate::StartRequested)
            } else {
                None
            }
        }
        Substate::Problem => {
            if !should_start || (unavailable_dependencies == 0 && fail_count == 0) {
                Some(Substate::Down)
            } else {
                None
            }
        }
        Substate::StartRequested => {
            if should_start && stopping_dependencies == 0 {
                Some(Substate::Starting)
            } else {
                Some(Substate::Down)
            }
        }
        Substate::Starting => {
            if has_start_exception {
                Some(Substate::StartFailed)
            } else {
                Some(Substate::Up)
            }
        }
        Substate::Up => {
            if should_stop || stopping_dependencies > 0 {
                Some(Substate::StopRequested)
            } else {
                None
            }
        }
        Substate::StopRequested => {
            if should_start && stopping_dependencies == 0 {
                Some(Substate::Up)
            } else if running_dependents == 0 {
                Some(Substate::Stopping)
            } else {
                None
            }
        }
        Substate::Stopping => Some(Substate::Down),
        Substate::StartFailed => {
            if stopping_dependencies > 0 {
                Some(Substate::Down)
            } else {
                None
            }
        }
        Substate::Removing => Some(Substate::Removed),
        Substate::Removed => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SelectorInputs {
        SelectorInputs {
            mode: Mode::Active,
            state: Substate::Down,
            unavailable_dependencies: 0,
            stopping_dependencies: 0,
            fail_count: 0,
            demanded_by_count: 0,
            running_dependents: 0,
            has_start_exception: false,
        }
    }

    #[test]
    fn active_with_no_deps_chains_down_to_start_requested() {
        let inputs = base();
        assert_eq!(select_transition(inputs), Some(Substate::StartRequested));
    }

    #[test]
    fn unavailable_dependency_routes_to_problem_before_start() {
        let mut inputs = base();
        inputs.unavailable_dependencies = 1;
        assert_eq!(select_transition(inputs), Some(Substate::Problem));
    }

    #[test]
    fn problem_clears_once_blockers_drop_to_zero() {
        let mut inputs = base();
        inputs.state = Substate::Problem;
        assert_eq!(select_transition(inputs), Some(Substate::Down));
    }

    #[test]
    fn remove_mode_overrides_everything_from_down() {
        let mut inputs = base();
        inputs.mode = Mode::Remove;
        assert_eq!(select_transition(inputs), Some(Substate::Removing));
    }

    #[test]
    fn starting_with_exception_goes_to_start_failed() {
        let mut inputs = base();
        inputs.state = Substate::Starting;
        inputs.has_start_exception = true;
        assert_eq!(select_transition(inputs), Some(Substate::StartFailed));
    }

    #[test]
    fn up_stays_put_while_nothing_demands_stop() {
        let mut inputs = base();
        inputs.mode = Mode::Active;
        inputs.state = Substate::Up;
        assert_eq!(select_transition(inputs), None);
    }

    #[test]
    fn stop_requested_waits_for_running_dependents() {
        let mut inputs = base();
        inputs.mode = Mode::Never;
        inputs.state = Substate::StopRequested;
        inputs.running_dependents = 2;
        assert_eq!(select_transition(inputs), None);
        inputs.running_dependents = 0;
        assert_eq!(select_transition(inputs), Some(Substate::Stopping));
    }

    #[test]
    fn start_failed_is_a_rest_state_until_stopping_dependencies_or_retry() {
        let mut inputs = base();
        inputs.state = Substate::StartFailed;
        assert_eq!(select_transition(inputs), None);
        inputs.stopping_dependencies = 1;
        assert_eq!(select_transition(inputs), Some(Substate::Down));
    }
}

/// The kinds of dependents-fan-out notifications tracked for late-join
/// visibility (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    DependencyAvailable,
    DependencyUnavailable,
    DependencyStarted,
    DependencyStopped,
    DependencyFailed,
    DependencyRetrying,
}

const KIND_COUNT: usize = 6;

fn index(kind: NotificationKind) -> usize {
    match kind {
        NotificationKind::DependencyAvailable => 0,
        NotificationKind::DependencyUnavailable => 1,
        NotificationKind::DependencyStarted => 2,
        NotificationKind::DependencyStopped => 3,
        NotificationKind::DependencyFailed => 4,
        NotificationKind::DependencyRetrying => 5,
    }
}

/// Bitset of (scheduled | completed) per [`NotificationKind`] (§3, §4.3).
///
/// Reset at the start of each transition cycle. `scheduled` is set the
/// moment a fan-out task for that kind is enqueued; `completed` is set when
/// the task finishes running. Late-joining dependents consult both bits to
/// answer "is this controller visibly FAILED/UNAVAILABLE/UP right now" even
/// while a fan-out batch is still draining.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecFlags {
    scheduled: [bool; KIND_COUNT],
    completed: [bool; KIND_COUNT],
}

impl ExecFlags {
    pub fn reset(&mut self) {
        *self = ExecFlags::default();
    }

    pub fn mark_scheduled(&mut self, kind: NotificationKind) {
        self.scheduled[index(kind)] = true;
    }

    pub fn mark_completed(&mut self, kind: NotificationKind) {
        self.completed[index(kind)] = true;
    }

    pub fn is_scheduled(&self, kind: NotificationKind) -> bool {
        self.scheduled[index(kind)]
    }

    pub fn is_completed(&self, kind: NotificationKind) -> bool {
        self.completed[index(kind)]
    }

    /// `scheduled ∨ completed` for the given kind.
    pub fn is_pending_or_done(&self, kind: NotificationKind) -> bool {
        self.is_scheduled(kind) || self.is_completed(kind)
    }

    /// Scheduled but not yet completed: the notification is still in flight.
    pub fn is_in_flight(&self, kind: NotificationKind) -> bool {
        self.is_scheduled(kind) && !self.is_completed(kind)
    }
}

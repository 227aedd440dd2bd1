use std::collections::VecDeque;

/// A boolean edge and its count, as confirmed by the server, plus the local
/// mutations still in flight
///
/// Each in-flight mutation carries the value it sets the edge to, so that the
/// visible value is always the last one requested.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Overlay {
    confirmed: bool,
    confirmed_count: u64,
    pending: VecDeque<(u64, bool)>,
}

impl Overlay {
    pub fn new(confirmed: bool, confirmed_count: u64) -> Overlay {
        Overlay {
            confirmed,
            confirmed_count,
            pending: VecDeque::new(),
        }
    }

    pub fn active(&self) -> bool {
        self.pending
            .back()
            .map(|(_, target)| *target)
            .unwrap_or(self.confirmed)
    }

    pub fn count(&self) -> u64 {
        match (self.confirmed, self.active()) {
            (false, true) => self.confirmed_count + 1,
            (true, false) => self.confirmed_count.saturating_sub(1),
            _ => self.confirmed_count,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Records a toggle, returning the value it sets the edge to
    pub fn push(&mut self, op: u64) -> bool {
        let target = !self.active();
        self.pending.push_back((op, target));
        target
    }

    /// Records the server's answer to `op`
    ///
    /// `count` is the server count if it could be read, otherwise the
    /// confirmed count is adjusted by the flag change.
    pub fn confirm(&mut self, op: u64, active: bool, count: Option<u64>) {
        self.pending.retain(|(o, _)| *o != op);
        self.confirmed_count = match count {
            Some(c) => c,
            None => match (self.confirmed, active) {
                (false, true) => self.confirmed_count + 1,
                (true, false) => self.confirmed_count.saturating_sub(1),
                _ => self.confirmed_count,
            },
        };
        self.confirmed = active;
    }

    pub fn roll_back(&mut self, op: u64) {
        self.pending.retain(|(o, _)| *o != op);
    }

    /// Replaces the confirmed state with freshly loaded server truth, keeping
    /// the mutations still in flight on top of it
    pub fn reload(&mut self, active: bool, count: u64) {
        self.confirmed = active;
        self.confirmed_count = count;
    }
}

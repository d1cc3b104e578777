/// Coalesces reconciliation passes while the backend signals that more
/// replies are imminent.
#[derive(Debug)]
pub struct FlowController {
    more_coming: bool,
    pending: usize,
    threshold: usize,
}

impl FlowController {
    pub fn new(threshold: usize) -> Self {
        Self {
            more_coming: false,
            pending: 0,
            threshold: threshold.max(1),
        }
    }

    /// Records the hint carried by the reply just processed.
    pub fn observe(&mut self, more_coming: bool) {
        self.more_coming = more_coming;
    }

    /// Records that a reply left some browser with work for the next pass.
    pub fn note_pending(&mut self) {
        self.pending += 1;
    }

    /// True at a quiescent point, or once enough work has queued up that
    /// holding it back any longer would leave the visible list too stale.
    pub fn should_reconcile(&self) -> bool {
        self.pending > 0 && (!self.more_coming || self.pending >= self.threshold)
    }

    /// The last reply promised more that has not arrived yet.
    pub fn is_waiting(&self) -> bool {
        self.more_coming && self.pending > 0
    }

    pub fn reconciled(&mut self) {
        self.pending = 0;
    }

    /// Called when a poll came back empty: whatever was promised is not coming.
    pub fn quiesce(&mut self) {
        self.more_coming = false;
    }
}

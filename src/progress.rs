/// Monotonic byte-progress meter for one direction of one attempt.
///
/// `total` is `None` while the transport has not reported an expected
/// length. Both meters on a request are reset to zero before a retry
/// attempt begins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed: u64,
    pub total: Option<u64>,
}

impl Progress {
    pub fn new(completed: u64, total: Option<u64>) -> Self {
        Self { completed, total }
    }

    /// Completed fraction in `0.0..=1.0`, or `0.0` while the total is
    /// unknown or zero.
    pub fn fraction(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => (self.completed as f64 / total as f64).min(1.0),
            _ => 0.0,
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        self.total.is_none()
    }
}

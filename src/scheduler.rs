//! Per-root-hub timers.
//!
//! Nothing runs on its own thread. A root hub keeps two deadlines, one for the next frame pass of
//! the transfer engine and one for the next root hub status poll, and [`Hcd::poll`] runs whatever
//! has come due according to the link's clock.
//!
//! [`Hcd::poll`]: crate::hcd::Hcd::poll

/// One emulated frame.
pub const FRAME_INTERVAL_MS: u64 = 1;

pub(crate) struct Scheduler {
    frame: Option<u64>,
    status_poll: Option<u64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            frame: None,
            status_poll: None,
        }
    }

    /// Sets the frame deadline, replacing any earlier one.
    pub fn arm(&mut self, at: u64) {
        self.frame = Some(at);
    }

    /// Arms the frame timer for the next frame unless it is already pending.
    pub fn kick(&mut self, now: u64) {
        if self.frame.is_none() {
            self.frame = Some(now + FRAME_INTERVAL_MS);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.frame.is_some()
    }

    pub fn cancel(&mut self) {
        self.frame = None;
    }

    /// Consumes the frame deadline if it has passed.
    pub fn take_due(&mut self, now: u64) -> bool {
        match self.frame {
            Some(at) if at <= now => {
                self.frame = None;
                true
            }
            _ => false,
        }
    }

    /// Asks for a root hub status poll at `at`.
    pub fn poll_status_at(&mut self, at: u64) {
        self.status_poll = Some(match self.status_poll {
            Some(earlier) => earlier.min(at),
            None => at,
        });
    }

    /// Consumes the status poll deadline if it has passed.
    pub fn take_status_poll(&mut self, now: u64) -> bool {
        match self.status_poll {
            Some(at) if at <= now => {
                self.status_poll = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kick_keeps_earlier_deadline() {
        let mut timer = Scheduler::new();
        timer.kick(10);
        timer.kick(15);
        assert!(!timer.take_due(10));
        assert!(timer.take_due(11));
        assert!(!timer.is_pending());
    }

    #[test]
    fn status_poll_fires_once() {
        let mut timer = Scheduler::new();
        timer.poll_status_at(20);
        assert!(!timer.take_status_poll(19));
        assert!(timer.take_status_poll(20));
        assert!(!timer.take_status_poll(21));
    }
}

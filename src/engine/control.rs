//! Run lifecycle shared between the control thread and the stage threads.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{AppResult, CaptureError};

/// Engine lifecycle state.
///
/// Queues are empty and every worker is quiesced only in `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlState {
    /// Idle; configuration may change
    Stopped,
    /// All stages active
    Running,
    /// No new frames are accepted; queued frames are draining
    Stopping,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlState::Stopped => write!(f, "Stopped"),
            ControlState::Running => write!(f, "Running"),
            ControlState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Bound on the number of frames acquired in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameLimit {
    /// Acquire until stopped
    #[default]
    Unbounded,
    /// Acquire exactly this many frames, then stop by itself
    Frames(u64),
}

impl FrameLimit {
    /// Sentinel used by the raw integer form.
    pub const UNBOUNDED_RAW: i64 = -1;

    /// Parse the raw form: `-1` is unbounded, `>= 0` a count, anything else is rejected.
    pub fn from_raw(raw: i64) -> AppResult<Self> {
        match raw {
            Self::UNBOUNDED_RAW => Ok(FrameLimit::Unbounded),
            n if n >= 0 => Ok(FrameLimit::Frames(n as u64)),
            n => Err(CaptureError::InvalidFrameLimit(n)),
        }
    }

    /// Raw integer form.
    pub fn as_raw(self) -> i64 {
        match self {
            FrameLimit::Unbounded => Self::UNBOUNDED_RAW,
            FrameLimit::Frames(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }

    /// Whether `acquired` frames exhaust the limit.
    pub fn is_reached(self, acquired: u64) -> bool {
        matches!(self, FrameLimit::Frames(n) if acquired >= n)
    }
}

impl fmt::Display for FrameLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameLimit::Unbounded => write!(f, "unbounded"),
            FrameLimit::Frames(n) => write!(f, "{n} frames"),
        }
    }
}

/// Lifecycle state plus the stop flag and accept gate for one engine.
///
/// Lock order is `state` before `accept_gate`. The acquisition stage only ever takes the
/// gate, so a stop request can never interleave with a frame being numbered.
#[derive(Debug)]
pub struct RunControl {
    state: Mutex<ControlState>,
    changed: Condvar,
    stop_requested: AtomicBool,
    accept_gate: Mutex<()>,
    verbose: AtomicBool,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new(false)
    }
}

impl RunControl {
    /// New control block in `Stopped`.
    pub fn new(verbose: bool) -> Self {
        Self {
            state: Mutex::new(ControlState::Stopped),
            changed: Condvar::new(),
            stop_requested: AtomicBool::new(false),
            accept_gate: Mutex::new(()),
            verbose: AtomicBool::new(verbose),
        }
    }

    /// Current state.
    pub fn state(&self) -> ControlState {
        *self.state.lock()
    }

    /// Lock the state for a compound check-and-act.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock()
    }

    /// Enter `Running` with a cleared stop flag. Caller holds the state lock.
    pub(crate) fn begin_run(&self, state: &mut ControlState) {
        self.stop_requested.store(false, Ordering::Release);
        *state = ControlState::Running;
        self.changed.notify_all();
    }

    /// Ask every stage to wind down.
    ///
    /// `Running` becomes `Stopping`; the flag is raised under the accept gate so no frame is
    /// numbered after this returns. Returns whether this call changed the state.
    pub fn request_stop(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ControlState::Stopped {
            return false;
        }
        {
            let _gate = self.accept_gate.lock();
            self.stop_requested.store(true, Ordering::Release);
        }
        if *state == ControlState::Running {
            *state = ControlState::Stopping;
            self.changed.notify_all();
            true
        } else {
            false
        }
    }

    /// Whether a stop has been requested in this run.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Hold the accept gate while deciding whether to take a frame.
    pub(crate) fn accept_gate(&self) -> MutexGuard<'_, ()> {
        self.accept_gate.lock()
    }

    /// Acquisition ended by itself: `Running` becomes `Stopping`.
    pub(crate) fn acquisition_finished(&self) {
        let mut state = self.state.lock();
        if *state == ControlState::Running {
            *state = ControlState::Stopping;
            self.changed.notify_all();
        }
    }

    /// Drain complete: enter `Stopped` and wake waiters.
    pub(crate) fn finish_run(&self) {
        let mut state = self.state.lock();
        *state = ControlState::Stopped;
        self.changed.notify_all();
    }

    /// Block until `Stopped` or until `timeout` elapses. Returns whether stopped.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while *state != ControlState::Stopped {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return *state == ControlState::Stopped;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        true
    }

    /// Whether diagnostic output is promoted to INFO.
    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    /// Toggle diagnostic output.
    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn frame_limit_raw_form() {
        assert_eq!(FrameLimit::from_raw(-1).unwrap(), FrameLimit::Unbounded);
        assert_eq!(FrameLimit::from_raw(0).unwrap(), FrameLimit::Frames(0));
        assert_eq!(FrameLimit::from_raw(10).unwrap().as_raw(), 10);
        assert!(matches!(FrameLimit::from_raw(-2), Err(CaptureError::InvalidFrameLimit(-2))));
    }

    #[test]
    fn zero_limit_is_reached_immediately() {
        assert!(FrameLimit::Frames(0).is_reached(0));
        assert!(!FrameLimit::Unbounded.is_reached(u64::MAX));
    }

    #[test]
    fn stop_request_is_ignored_when_stopped() {
        let control = RunControl::default();
        assert!(!control.request_stop());
        assert!(!control.stop_requested());
    }

    #[test]
    fn only_first_stop_request_transitions() {
        let control = RunControl::default();
        control.begin_run(&mut control.lock_state());
        assert!(control.request_stop());
        assert!(!control.request_stop());
        assert_eq!(control.state(), ControlState::Stopping);
        assert!(control.stop_requested());
    }

    #[test]
    fn wait_stopped_wakes_on_finish() {
        let control = Arc::new(RunControl::default());
        control.begin_run(&mut control.lock_state());
        assert!(!control.wait_stopped(Duration::from_millis(10)));

        let finisher = {
            let control = Arc::clone(&control);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                control.finish_run();
            })
        };
        assert!(control.wait_stopped(Duration::from_secs(5)));
        finisher.join().unwrap();
    }
}

//! Stage fault records.
//!
//! Stage threads never propagate errors across thread boundaries. Every failure that a
//! stage handles (a camera timeout, a frame the transform rejected, a failed disk write) is
//! recorded here instead, logged at the moment it is recorded, and kept for the control
//! thread to query.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;

use crate::limits::MAX_FAULT_HISTORY;

/// Pipeline stage that reported a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Camera acquisition
    Acquire,
    /// Frame transform
    Process,
    /// Output writing
    Write,
    /// Supervisor / monitor thread
    Monitor,
}

impl Stage {
    /// Short lowercase name used in logs and thread names.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Acquire => "acquire",
            Stage::Process => "process",
            Stage::Write => "write",
            Stage::Monitor => "monitor",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a recorded fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FaultSeverity {
    /// Recovered without losing a frame
    Warning = 0,
    /// A frame was lost or a stage ended early; the run continues
    Error = 1,
    /// The run cannot continue; a stop was requested
    Fatal = 2,
}

impl fmt::Display for FaultSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultSeverity::Warning => write!(f, "WARNING"),
            FaultSeverity::Error => write!(f, "ERROR"),
            FaultSeverity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// A fault reported by a stage thread.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineFault {
    /// Stage that reported the fault
    pub stage: Stage,
    /// Fault severity
    pub severity: FaultSeverity,
    /// Sequence number of the affected frame, if any
    pub sequence: Option<u64>,
    /// Human-readable description
    pub message: String,
    /// When the fault was recorded
    pub at: DateTime<Utc>,
}

impl PipelineFault {
    /// Create a fault stamped with the current time.
    pub fn new(
        stage: Stage,
        severity: FaultSeverity,
        sequence: Option<u64>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            severity,
            sequence,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for PipelineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sequence {
            Some(seq) => write!(
                f,
                "[{}] {} stage, frame {}: {}",
                self.severity, self.stage, seq, self.message
            ),
            None => write!(f, "[{}] {} stage: {}", self.severity, self.stage, self.message),
        }
    }
}

struct FaultLogState {
    history: VecDeque<PipelineFault>,
    first_fatal: Option<PipelineFault>,
    total: u64,
}

/// Bounded fault history shared by all stage threads.
///
/// The first fatal fault of a run is kept separately, so it survives history eviction and
/// `take()`.
pub struct FaultLog {
    state: Mutex<FaultLogState>,
    max_history: usize,
}

impl Default for FaultLog {
    fn default() -> Self {
        Self::new(MAX_FAULT_HISTORY)
    }
}

impl FaultLog {
    /// Create a log retaining at most `max_history` faults.
    pub fn new(max_history: usize) -> Self {
        Self {
            state: Mutex::new(FaultLogState {
                history: VecDeque::new(),
                first_fatal: None,
                total: 0,
            }),
            max_history: max_history.max(1),
        }
    }

    /// Record and log a fault.
    pub fn record(&self, fault: PipelineFault) {
        match fault.severity {
            FaultSeverity::Warning => tracing::warn!(
                stage = %fault.stage,
                sequence = ?fault.sequence,
                "{}",
                fault.message
            ),
            FaultSeverity::Error | FaultSeverity::Fatal => tracing::error!(
                stage = %fault.stage,
                severity = %fault.severity,
                sequence = ?fault.sequence,
                "{}",
                fault.message
            ),
        }

        let mut state = self.state.lock();
        state.total += 1;
        if fault.severity == FaultSeverity::Fatal && state.first_fatal.is_none() {
            state.first_fatal = Some(fault.clone());
        }
        if state.history.len() >= self.max_history {
            state.history.pop_front();
        }
        state.history.push_back(fault);
    }

    /// Copy of the retained history, oldest first.
    pub fn snapshot(&self) -> Vec<PipelineFault> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Drain the retained history. The first fatal fault is kept.
    pub fn take(&self) -> Vec<PipelineFault> {
        self.state.lock().history.drain(..).collect()
    }

    /// First fatal fault of the run, if any.
    pub fn first_fatal(&self) -> Option<PipelineFault> {
        self.state.lock().first_fatal.clone()
    }

    /// Number of faults recorded since the last reset, including evicted ones.
    pub fn total(&self) -> u64 {
        self.state.lock().total
    }

    /// Forget everything. Called at the start of each run.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.first_fatal = None;
        state.total = 0;
    }
}

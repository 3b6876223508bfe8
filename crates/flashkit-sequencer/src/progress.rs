//! Progress reporting and cancellation

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Coarse state of a sequencer run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    FlashloaderActivation,
    DeviceInfoRead,
    SystemUpdate,
    SystemReset,
}

/// Sub-step inside a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Broadcast,
    EnterFlashloader,
    ActivateRouting,
    WaitAfterReset,
    ReadDeviceName,
    ReadFlashloaderInfo,
    ReadFlashBlocks,
    ReadLegacyDeviceInfo,
    ReadChecksum,
    CheckName,
    CheckMemory,
    Fingerprint,
    TransferFiles,
    WriteNvm,
    WritePem,
    WriteSecurityState,
    WriteDebuggerState,
    Reset,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepResult {
    Started,
    Running,
    Succeeded,
    Warning,
    Failed,
    Aborted,
}

/// One progress notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressReport {
    pub phase: Phase,
    pub step: Step,
    /// Node index in the system definition, if the step concerns one node
    pub node: Option<usize>,
    pub result: StepResult,
    /// Phase progress, 0..=100
    pub progress: u8,
    pub message: String,
}

/// Receives progress notifications
pub trait ProgressObserver: Send {
    fn report(&mut self, report: &ProgressReport);
}

impl<F> ProgressObserver for F
where
    F: FnMut(&ProgressReport) + Send,
{
    fn report(&mut self, report: &ProgressReport) {
        self(report)
    }
}

/// Observer that drops every report
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn report(&mut self, _report: &ProgressReport) {}
}

/// Cancellation flag shared between the caller and a running sequencer
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag before starting a new run
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Position inside a phase made of equally weighted units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseProgress {
    pub done: usize,
    pub total: usize,
}

impl PhaseProgress {
    pub fn new(total: usize) -> Self {
        Self { done: 0, total }
    }

    /// Progress as percentage
    pub fn percent(&self) -> u8 {
        self.percent_within(0, 1)
    }

    /// Percentage when the current unit is `part / whole` complete
    pub fn percent_within(&self, part: u64, whole: u64) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let whole = whole.max(1);
        let part = part.min(whole);
        let scaled = (self.done as u64 * whole + part) * 100 / (self.total as u64 * whole);
        scaled.min(100) as u8
    }

    pub fn advance(&mut self) {
        self.done = (self.done + 1).min(self.total);
    }
}

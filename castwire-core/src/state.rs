//! Pipeline state and the read-only handle shared with components

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::error;

use crate::clock::Clock;
use crate::error::CastError;
use crate::stats::PipelineMetrics;

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    /// Not running
    #[default]
    Idle,
    /// Components are being built and started
    Starting,
    /// All stages running
    Streaming,
    /// Draining in-flight units before shutdown
    Stopping,
    /// An unrecoverable error tore the pipeline down; a new start is required
    Faulted,
}

impl PipelineState {
    /// Whether workers may be running in this state
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Streaming | Self::Stopping)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Streaming => write!(f, "streaming"),
            Self::Stopping => write!(f, "stopping"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// Read-only view of the pipeline state
///
/// Only the controller holds the matching sender; components can observe
/// transitions but never cause one.
#[derive(Debug, Clone)]
pub struct StateHandle {
    rx: watch::Receiver<PipelineState>,
}

impl StateHandle {
    pub(crate) fn new(rx: watch::Receiver<PipelineState>) -> Self {
        Self { rx }
    }

    /// Current state
    pub fn get(&self) -> PipelineState {
        *self.rx.borrow()
    }

    /// Wait until the state changes and return the new value
    ///
    /// Returns `None` once the controller has been dropped.
    pub async fn changed(&mut self) -> Option<PipelineState> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    /// Wait until the state satisfies `pred`
    pub async fn wait_for(&mut self, pred: impl FnMut(&PipelineState) -> bool) -> Option<PipelineState> {
        self.rx.wait_for(pred).await.ok().map(|state| *state)
    }
}

/// A lifecycle error raised by a stage
#[derive(Debug)]
pub struct Fault {
    /// Stage that failed
    pub stage: &'static str,
    /// What went wrong
    pub error: CastError,
}

/// Sending half of the fault channel
///
/// Stages report errors that end their lifecycle here; the controller reacts
/// by tearing the whole pipeline down.
#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: mpsc::UnboundedSender<Fault>,
}

impl FaultReporter {
    /// Create a reporter and the receiver the controller listens on
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Fault>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report a fatal stage error
    pub fn report(&self, stage: &'static str, error: CastError) {
        error!("{} failed: {}", stage, error);
        // The controller may already be tearing down
        let _ = self.tx.send(Fault { stage, error });
    }
}

/// Shared context handed to every component at construction
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Shared clock
    pub clock: Arc<Clock>,
    /// Read-only pipeline state
    pub state: StateHandle,
    /// Shared counters
    pub metrics: Arc<PipelineMetrics>,
    /// Where stages report lifecycle errors
    pub faults: FaultReporter,
}

impl PipelineContext {
    /// Context for running stages outside a controller
    ///
    /// The state handle reads `Streaming` forever and faults arrive on the
    /// returned receiver.
    pub fn standalone() -> (Self, mpsc::UnboundedReceiver<Fault>) {
        let (_tx, rx) = watch::channel(PipelineState::Streaming);
        let (faults, fault_rx) = FaultReporter::channel();
        let ctx = Self {
            clock: Arc::new(Clock::start()),
            state: StateHandle::new(rx),
            metrics: Arc::new(PipelineMetrics::new()),
            faults,
        };
        (ctx, fault_rx)
    }
}

//! Orchestrator states

use bitcoin::Amount;
use sweep_common::{Error, SignedOutcome, SweepBatch, UnsignedSweep};

/// Cause and progress of a failed sweep attempt
#[derive(Debug, Clone, PartialEq)]
pub struct SweepFailure {
    /// First error encountered
    pub cause: Error,
    /// Sweeps broadcast before the failure
    pub completed: Vec<SignedOutcome>,
    /// Sweep that failed, carrying the signatures it had gathered
    pub failed_sweep: Option<Box<UnsignedSweep>>,
}

/// Every sweep of the batch broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSummary {
    /// One outcome per sweep, in batch order
    pub outcomes: Vec<SignedOutcome>,
    /// Sum of every sweep's fee
    pub total_fee: Amount,
}

/// Sweep orchestration state.
///
/// ```text
/// GeneratingPsbts ──► NoFundsFound
///        │  ▲    ├──► GeneratePsbtsFailed ── retry ──┐
///        │  └────┼───────────────────────────────────┘
///        ▼       │
/// PsbtsGenerated ── start ──► AwaitingHardwareSignedSweeps ── submit ──┐
///        │                                                            ▼
///        └───────────────── start (no hardware) ──────────────► SignAndBroadcast
///                                                                     │
///                                          SweepFailed ◄──────────────┤
///                                     (retry ► GeneratingPsbts)       ▼
///                                                               SweepComplete
/// ```
///
/// `Cancelled` is reachable from every state before `SignAndBroadcast`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SweepState {
    /// Generating the sweep batch
    #[default]
    GeneratingPsbts,
    /// Nothing to sweep
    NoFundsFound,
    /// Generation failed
    GeneratePsbtsFailed {
        /// Failure cause
        cause: Error,
    },
    /// Batch ready, waiting for the user to start the sweep
    PsbtsGenerated {
        /// Generated batch
        batch: SweepBatch,
    },
    /// Waiting for hardware-signed payloads of the batch's hardware subset
    AwaitingHardwareSignedSweeps {
        /// Batch to sign
        batch: SweepBatch,
    },
    /// App signing, co-signing and broadcasting sweep by sweep
    SignAndBroadcast {
        /// Batch being processed
        batch: SweepBatch,
        /// Outcomes broadcast so far
        completed: Vec<SignedOutcome>,
    },
    /// An attempt failed
    SweepFailed(SweepFailure),
    /// Every sweep broadcast
    SweepComplete(SweepSummary),
    /// Abandoned before anything was broadcast
    Cancelled,
}

impl SweepState {
    /// State name for logging and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::GeneratingPsbts => "generating_psbts",
            Self::NoFundsFound => "no_funds_found",
            Self::GeneratePsbtsFailed { .. } => "generate_psbts_failed",
            Self::PsbtsGenerated { .. } => "psbts_generated",
            Self::AwaitingHardwareSignedSweeps { .. } => "awaiting_hardware_signed_sweeps",
            Self::SignAndBroadcast { .. } => "sign_and_broadcast",
            Self::SweepFailed(_) => "sweep_failed",
            Self::SweepComplete(_) => "sweep_complete",
            Self::Cancelled => "cancelled",
        }
    }

    /// No further event is accepted
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NoFundsFound | Self::SweepComplete(_) | Self::Cancelled
        )
    }

    /// Waiting for the caller rather than doing work
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::GeneratingPsbts | Self::SignAndBroadcast { .. })
    }

    /// Nothing external was mutated yet
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            Self::GeneratingPsbts
                | Self::GeneratePsbtsFailed { .. }
                | Self::PsbtsGenerated { .. }
                | Self::AwaitingHardwareSignedSweeps { .. }
        )
    }

    /// Failure cause of a failed state
    pub fn cause(&self) -> Option<&Error> {
        match self {
            Self::GeneratePsbtsFailed { cause } => Some(cause),
            Self::SweepFailed(failure) => Some(&failure.cause),
            _ => None,
        }
    }

    /// Batch held by the state, if any
    pub fn batch(&self) -> Option<&SweepBatch> {
        match self {
            Self::PsbtsGenerated { batch }
            | Self::AwaitingHardwareSignedSweeps { batch }
            | Self::SignAndBroadcast { batch, .. } => Some(batch),
            _ => None,
        }
    }
}

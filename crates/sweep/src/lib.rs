//! Recovery sweep engine
//!
//! Moves the residual funds of an account's retired key sets to its active
//! key set, coordinating the app key, an optional hardware device and the
//! co-signing server.

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod generator;
pub mod hardware;
#[cfg(feature = "http")]
pub mod http;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod settings;

// re-exporting external crates
pub use sweep_common;
pub use sweep_common::{bitcoin, Error};

pub use self::generator::SweepGenerator;
pub use self::hardware::{AutoConfirm, SessionGuard, TapDriver, TapPrompter};
#[cfg(feature = "http")]
pub use self::http::{EsploraClient, HttpCoSigner};
pub use self::ledger::LedgerWriter;
pub use self::orchestrator::{
    AccountLocks, SweepActor, SweepFailure, SweepHandle, SweepOrchestrator, SweepServices,
    SweepState, SweepSummary,
};
pub use self::settings::Settings;

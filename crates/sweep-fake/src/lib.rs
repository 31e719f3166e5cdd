//! Fake sweep collaborators
//!
//! Used for testing and development builds where no device, server or
//! network is available.

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod broadcast;
pub mod chain;
pub mod hardware;
pub mod server;
pub mod signature;
pub mod wallet;

pub use self::broadcast::{FakeBroadcaster, FixedExchangeRate, MemoryTransactionRepository};
pub use self::chain::FakeChain;
pub use self::hardware::{ConfirmationMode, FakeHardware, FakeSession};
pub use self::server::FakeCoSigner;
pub use self::signature::Party;
pub use self::wallet::{fake_key_set, FakeSpendingWallet, FakeWalletProvider, FixedFeeEstimator};

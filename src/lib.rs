//! Driver core for daisy-chained pinball I/O board sets.
//!
//! Each chain is one serial link carrying a framed binary protocol to a
//! string of addressed boards: Gen2 boards whose wings provide switch
//! inputs and solenoid drivers, dedicated incandescent boards, and pixel
//! driver boards. The [`ChainManager`] enumerates each chain at connect
//! time, polls inputs on a paced schedule, reports logical switch changes
//! to the host, and pushes driver, rule, and light commands down the wire.
//!
//! # Usage
//!
//! ```rust,ignore
//! use opp_chain::{ChainConfig, ChainManager};
//!
//! let (mut manager, mut events) = ChainManager::new();
//! manager.connect("main", ChainConfig::new("/dev/ttyACM0")).await?;
//! manager.start();
//! while let Some(change) = events.recv().await {
//!     println!("{} -> {}", change.number, change.active);
//! }
//! ```

pub mod chain;
pub mod config;
pub mod error;
pub mod lights;
pub mod protocol;
pub mod registry;
pub mod topology;
pub mod transport;

pub use chain::ChainManager;
pub use config::{
    ChainConfig, DeviceNumber, DriverSettings, HoldSettings, LightNumber, PulseSettings,
    SwitchConfig,
};
pub use error::{OppError, Result};
pub use registry::{RulePolicy, SwitchChange};
pub use topology::{BoardKind, InventoryState};

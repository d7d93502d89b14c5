//! Crate error types.
//!
//! Errors fall into the three families the driver distinguishes at runtime:
//! configuration errors (fatal at setup, returned to the caller that asked
//! for the change), transport/timing errors (logged and contained in the
//! poll path), and framing errors (handled by resynchronizing the receive
//! buffer, never surfaced past the receive loop).

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, OppError>;

#[derive(Error, Debug)]
pub enum OppError {
    #[error("invalid device number '{0}': expected 'chain-card-index'")]
    BadNumber(String),

    #[error("a request was made to configure an OPP {kind} with number '{number}' which doesn't exist")]
    UnknownNumber { kind: &'static str, number: String },

    #[error("unknown light subtype '{0}'")]
    UnknownSubtype(String),

    #[error("a request was made to configure an OPP {kind}, but no connection to chain '{chain}' is available")]
    NotConnected { kind: &'static str, chain: String },

    #[error("cannot bind hardware rule to inverted switch '{0}'")]
    InvertedSwitch(String),

    #[error("driver '{0}' carries hold settings but the requested rule policy does not hold")]
    HoldNotUsed(String),

    #[error("rule policy '{0}' is not supported by this hardware generation")]
    UnsupportedPolicy(&'static str),

    #[error(
        "invalid switch being configured for driver: driver = {driver}, switch = {switch}; \
         for firmware 0.2.0+ driver and switch have to be on the same board"
    )]
    PlacementMismatch { driver: String, switch: String },

    #[error(
        "invalid switch being configured for driver: driver = {driver}, switch = {switch}; \
         for firmware below 0.2.0 they have to be on the same board and follow the fixed \
         solenoid-to-input wiring pairing"
    )]
    LegacyPlacementMismatch { driver: String, switch: String },

    #[error("inventory handshake on chain '{0}' did not complete")]
    InventoryIncomplete(String),

    #[error("light card {card} on chain '{chain}' is claimed by more than one board")]
    AmbiguousLightCard { chain: String, card: u8 },

    #[error("chain '{0}' is already connected")]
    AlreadyConnected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

//! Configuration types and device-number parsing.
//!
//! The host configuration collaborator hands this crate structured string
//! numbers (`"chain-card-index"`, lights append a fourth sub-channel
//! component), pulse/hold settings, and per-chain connection parameters.
//! Parsing and validation of those inputs happens here so the registry and
//! light layer operate on typed identifiers only.

use std::fmt;

use anyhow::Context;
use serde::Deserialize;

use crate::error::{OppError, Result};

fn default_baud() -> u32 {
    115_200
}

fn default_poll_hz() -> f64 {
    100.0
}

/// Connection settings for one chain.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Serial device path (e.g. "/dev/ttyACM0").
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    /// Input poll rate. Polling back-to-back overruns board firmware, so
    /// requests are paced at this rate.
    #[serde(default = "default_poll_hz")]
    pub poll_hz: f64,
    /// Incandescent batching cadence; defaults to the poll rate.
    #[serde(default)]
    pub incand_hz: Option<f64>,
}

impl ChainConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud(),
            poll_hz: default_poll_hz(),
            incand_hz: None,
        }
    }

    /// Deserialize from a TOML value handed over by the configuration
    /// collaborator.
    pub fn from_toml(value: toml::Value) -> anyhow::Result<Self> {
        value.try_into().context("invalid chain config")
    }

    pub fn incand_hz(&self) -> f64 {
        self.incand_hz.unwrap_or(self.poll_hz)
    }
}

/// Pulse power and duration applied when a driver fires.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PulseSettings {
    /// 0.0..=1.0
    pub power: f32,
    pub duration_ms: u8,
}

/// Hold power applied after the pulse for hold-capable rules.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct HoldSettings {
    /// 0.0..=1.0
    pub power: f32,
}

impl HoldSettings {
    /// Hold power as the PWM byte the solenoid config command carries.
    pub fn pwm(&self) -> u8 {
        (self.power.clamp(0.0, 1.0) * 255.0).round() as u8
    }
}

/// Per-driver defaults stored at configure time.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    pub default_pulse: PulseSettings,
    pub default_hold: Option<HoldSettings>,
    /// Retrigger lockout: when false the board re-arms immediately.
    pub recycle: bool,
}

/// Per-switch configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchConfig {
    /// Logical inversion requested by the host. Inverted switches cannot
    /// participate in hardware rules.
    pub invert: bool,
}

/// Typed `"chain-card-index"` identifier for switches and drivers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceNumber {
    pub chain: String,
    pub card: u8,
    pub index: u8,
}

impl DeviceNumber {
    pub fn parse(number: &str) -> Result<Self> {
        let mut parts = number.split('-');
        let (Some(chain), Some(card), Some(index), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(OppError::BadNumber(number.to_string()));
        };
        if chain.is_empty() {
            return Err(OppError::BadNumber(number.to_string()));
        }
        let card = card
            .parse()
            .map_err(|_| OppError::BadNumber(number.to_string()))?;
        let index = index
            .parse()
            .map_err(|_| OppError::BadNumber(number.to_string()))?;
        Ok(Self {
            chain: chain.to_string(),
            card,
            index,
        })
    }
}

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.chain, self.card, self.index)
    }
}

/// Typed `"chain-card-index-channel"` identifier for light channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LightNumber {
    pub chain: String,
    pub card: u8,
    pub index: u8,
    pub channel: u8,
}

impl LightNumber {
    pub fn parse(number: &str) -> Result<Self> {
        let mut parts = number.split('-');
        let (Some(chain), Some(card), Some(index), Some(channel), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(OppError::BadNumber(number.to_string()));
        };
        if chain.is_empty() {
            return Err(OppError::BadNumber(number.to_string()));
        }
        let card = card
            .parse()
            .map_err(|_| OppError::BadNumber(number.to_string()))?;
        let index = index
            .parse()
            .map_err(|_| OppError::BadNumber(number.to_string()))?;
        let channel = channel
            .parse()
            .map_err(|_| OppError::BadNumber(number.to_string()))?;
        Ok(Self {
            chain: chain.to_string(),
            card,
            index,
            channel,
        })
    }
}

impl fmt::Display for LightNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.chain, self.card, self.index, self.channel
        )
    }
}

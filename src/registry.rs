//! Switch/driver registry and hardware-rule engine.
//!
//! The registry owns the per-chain switch and driver tables derived from
//! the enumerated topology and validates every input-to-output binding
//! before it reaches firmware. Operations return the encoded commands to
//! put on the wire rather than writing to the transport themselves; the
//! chain manager owns the write path.
//!
//! A driver's binding set and its firmware-side rule state move together:
//! every install adds a mapping, every clear removes one, and the rule is
//! disabled on the board exactly when the set becomes empty.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::config::{DeviceNumber, DriverSettings, SwitchConfig};
use crate::error::{OppError, Result};
use crate::protocol::{self, sol_flags, MIN_FW_INPUT_MAPPING};
use crate::topology::{BoardKind, ChainTopology};

/// Rule policies a board can execute autonomously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePolicy {
    /// Pulse when the switch goes active; release is ignored. Typical for
    /// pop bumpers.
    PulseOnHit,
    /// Pulse on hit, cancel the pulse when the switch is released.
    PulseOnHitAndRelease,
    /// Pulse on hit, then hold at hold power until release. Typical for
    /// single-coil flippers.
    PulseOnHitAndEnableAndRelease,
    /// Dual-coil flipper variant with a second disable switch. Recognized
    /// but not supported by this hardware generation.
    PulseOnHitAndEnableAndReleaseAndDisable,
}

impl RulePolicy {
    pub fn uses_hold(self) -> bool {
        matches!(
            self,
            Self::PulseOnHitAndEnableAndRelease | Self::PulseOnHitAndEnableAndReleaseAndDisable
        )
    }

    pub fn can_cancel(self) -> bool {
        !matches!(self, Self::PulseOnHit)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::PulseOnHit => "pulse_on_hit",
            Self::PulseOnHitAndRelease => "pulse_on_hit_and_release",
            Self::PulseOnHitAndEnableAndRelease => "pulse_on_hit_and_enable_and_release",
            Self::PulseOnHitAndEnableAndReleaseAndDisable => {
                "pulse_on_hit_and_enable_and_release_and_disable"
            }
        }
    }
}

/// A switch slot in the registry.
#[derive(Debug, Clone)]
pub struct OppSwitch {
    pub number: DeviceNumber,
    pub config: SwitchConfig,
    /// Last-known logical state, active-high.
    pub active: bool,
}

/// A driver slot in the registry.
#[derive(Debug, Clone)]
pub struct OppDriver {
    pub number: DeviceNumber,
    /// Board address on the chain.
    pub addr: u8,
    pub settings: Option<DriverSettings>,
    /// Switches currently bound via hardware rules.
    pub switches: BTreeSet<DeviceNumber>,
}

/// A logical switch state change reported to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchChange {
    pub number: DeviceNumber,
    pub active: bool,
}

/// Per-chain switch and driver tables.
#[derive(Debug, Default)]
pub struct Registry {
    chain: String,
    switches: HashMap<DeviceNumber, OppSwitch>,
    drivers: HashMap<DeviceNumber, OppDriver>,
    min_firmware: u32,
}

impl Registry {
    /// Derive the identifier spaces from an enumerated topology.
    pub fn from_topology(topology: &ChainTopology) -> Self {
        let mut registry = Registry {
            chain: topology.serial.clone(),
            min_firmware: topology.min_firmware(),
            ..Default::default()
        };
        for board in &topology.boards {
            if board.kind != BoardKind::Gen2 {
                continue;
            }
            for index in 0..board.inputs {
                let number = DeviceNumber {
                    chain: topology.serial.clone(),
                    card: board.card(),
                    index: index as u8,
                };
                registry.switches.insert(
                    number.clone(),
                    OppSwitch {
                        number,
                        config: SwitchConfig::default(),
                        active: false,
                    },
                );
            }
            for index in 0..board.solenoids {
                let number = DeviceNumber {
                    chain: topology.serial.clone(),
                    card: board.card(),
                    index: index as u8,
                };
                registry.drivers.insert(
                    number.clone(),
                    OppDriver {
                        number,
                        addr: board.addr,
                        settings: None,
                        switches: BTreeSet::new(),
                    },
                );
            }
        }
        registry
    }

    /// Test-only constructor building the identifier space directly.
    #[cfg(test)]
    pub fn with_space(chain: &str, cards: &[(u8, u32, u32)], min_firmware: u32) -> Self {
        use crate::topology::CARD_GEN2;

        let mut topo = ChainTopology::new(chain);
        let addrs: Vec<u8> = cards.iter().map(|(card, _, _)| CARD_GEN2 | card).collect();
        topo.apply_inventory(&addrs).unwrap();
        for &(card, inputs, solenoids) in cards {
            let addr = CARD_GEN2 | card;
            let board = topo.board_mut(addr).unwrap();
            board.inputs = inputs;
            board.solenoids = solenoids;
            board.firmware = min_firmware;
        }
        Registry::from_topology(&topo)
    }

    pub fn min_firmware(&self) -> u32 {
        self.min_firmware
    }

    /// Store pulse/hold defaults for a driver and build the reconfigure
    /// command reflecting them.
    pub fn configure_driver(
        &mut self,
        number: &DeviceNumber,
        settings: DriverSettings,
    ) -> Result<Vec<u8>> {
        let driver = self
            .drivers
            .get_mut(number)
            .ok_or_else(|| OppError::UnknownNumber {
                kind: "solenoid",
                number: number.to_string(),
            })?;
        debug!(driver = %number, "configure driver");
        driver.settings = Some(settings);
        Ok(Self::driver_config_msg(driver, 0))
    }

    /// Store a switch configuration and return the handle used for rule
    /// binding.
    pub fn configure_switch(
        &mut self,
        number: &DeviceNumber,
        config: SwitchConfig,
    ) -> Result<DeviceNumber> {
        let switch = self
            .switches
            .get_mut(number)
            .ok_or_else(|| OppError::UnknownNumber {
                kind: "switch",
                number: number.to_string(),
            })?;
        switch.config = config;
        Ok(switch.number.clone())
    }

    /// Bind a switch to a driver in firmware.
    ///
    /// Returns the commands to emit: a rule reconfigure, plus an
    /// add-input-mapping for firmware 0.2.0+. For older firmware the
    /// mapping is fixed by wiring convention and no mapping command exists;
    /// firmware-side state is never mutated for that range.
    pub fn install_rule(
        &mut self,
        switch: &DeviceNumber,
        driver: &DeviceNumber,
        policy: RulePolicy,
    ) -> Result<Vec<Vec<u8>>> {
        if policy == RulePolicy::PulseOnHitAndEnableAndReleaseAndDisable {
            return Err(OppError::UnsupportedPolicy(policy.name()));
        }

        let sw = self
            .switches
            .get(switch)
            .ok_or_else(|| OppError::UnknownNumber {
                kind: "switch",
                number: switch.to_string(),
            })?;
        if sw.config.invert {
            return Err(OppError::InvertedSwitch(switch.to_string()));
        }

        let drv = self
            .drivers
            .get(driver)
            .ok_or_else(|| OppError::UnknownNumber {
                kind: "solenoid",
                number: driver.to_string(),
            })?;
        let settings = drv.settings.as_ref().ok_or_else(|| OppError::UnknownNumber {
            kind: "configured solenoid",
            number: driver.to_string(),
        })?;
        if settings.default_hold.is_some() && !policy.uses_hold() {
            return Err(OppError::HoldNotUsed(driver.to_string()));
        }

        self.verify_coil_and_switch_fit(switch, driver)?;

        debug!(driver = %driver, switch = %switch, policy = policy.name(), "setting hardware rule");

        let drv = self
            .drivers
            .get_mut(driver)
            .expect("driver presence checked above");
        drv.switches.insert(switch.clone());

        let mut flags = sol_flags::USE_SWITCH;
        if policy.uses_hold() {
            flags |= sol_flags::ON_OFF;
        }
        if policy.can_cancel() {
            flags |= sol_flags::CAN_CANCEL;
        }

        let mut msgs = vec![Self::driver_config_msg(drv, flags)];
        if self.min_firmware >= MIN_FW_INPUT_MAPPING {
            msgs.push(protocol::build_solenoid_input(
                drv.addr,
                switch.index,
                driver.index,
                false,
            ));
        }
        Ok(msgs)
    }

    /// Remove a switch from a driver's binding set.
    ///
    /// Removing a switch that is not bound is a no-op, not an error. When
    /// the last binding goes away, the returned commands end with the
    /// disable reconfigure that stops autonomous firing.
    pub fn clear_rule(
        &mut self,
        switch: &DeviceNumber,
        driver: &DeviceNumber,
    ) -> Result<Vec<Vec<u8>>> {
        let drv = self
            .drivers
            .get_mut(driver)
            .ok_or_else(|| OppError::UnknownNumber {
                kind: "solenoid",
                number: driver.to_string(),
            })?;

        let mut msgs = Vec::new();
        if drv.switches.remove(switch) {
            debug!(driver = %driver, switch = %switch, "clearing hardware rule");
            if self.min_firmware >= MIN_FW_INPUT_MAPPING {
                msgs.push(protocol::build_solenoid_input(
                    drv.addr,
                    switch.index,
                    driver.index,
                    true,
                ));
            }
        }
        if drv.switches.is_empty() {
            msgs.push(Self::driver_config_msg(drv, 0));
        }
        Ok(msgs)
    }

    /// Switches currently bound to a driver.
    pub fn bound_switches(&self, driver: &DeviceNumber) -> Option<&BTreeSet<DeviceNumber>> {
        self.drivers.get(driver).map(|d| &d.switches)
    }

    pub fn switch(&self, number: &DeviceNumber) -> Option<&OppSwitch> {
        self.switches.get(number)
    }

    /// Snapshot of every switch's logical state, keyed by number string.
    /// States are active-high, already inverted from the raw level.
    pub fn switch_states(&self) -> HashMap<String, bool> {
        self.switches
            .values()
            .map(|sw| (sw.number.to_string(), sw.active))
            .collect()
    }

    /// Update a switch's logical state from a poll response. Returns the
    /// change to report, or `None` when the state is unchanged or the
    /// index is outside the declared space.
    pub fn set_switch_state(&mut self, card: u8, index: u8, active: bool) -> Option<SwitchChange> {
        let number = DeviceNumber {
            chain: self.chain.clone(),
            card,
            index,
        };
        let switch = self.switches.get_mut(&number)?;
        let logical = active != switch.config.invert;
        if switch.active == logical {
            return None;
        }
        switch.active = logical;
        Some(SwitchChange {
            number,
            active: logical,
        })
    }

    /// Seed a switch's logical state without reporting a change.
    pub fn seed_switch_state(&mut self, card: u8, index: u8, active: bool) {
        let number = DeviceNumber {
            chain: self.chain.clone(),
            card,
            index,
        };
        if let Some(switch) = self.switches.get_mut(&number) {
            switch.active = active != switch.config.invert;
        }
    }

    fn driver_config_msg(driver: &OppDriver, rule_flags: u8) -> Vec<u8> {
        let (kick_ms, hold_pwm, recycle) = match &driver.settings {
            Some(s) => (
                s.default_pulse.duration_ms,
                s.default_hold.map(|h| h.pwm()).unwrap_or(0),
                s.recycle,
            ),
            None => (0, 0, false),
        };
        let mut flags = rule_flags;
        if !recycle {
            flags |= sol_flags::AUTO_CLEAR;
        }
        protocol::build_solenoid_config(driver.addr, driver.number.index, flags, kick_ms, hold_pwm)
    }

    /// Placement validation for one switch/driver pair.
    ///
    /// Firmware 0.2.0+ requires both to share chain and card. Older
    /// firmware additionally fixes the pairing by wiring convention: the
    /// switch index must equal the bit-swizzled solenoid index
    /// `((sol & 0b1100) << 1) | (sol & 0b0011)`.
    fn verify_coil_and_switch_fit(
        &self,
        switch: &DeviceNumber,
        driver: &DeviceNumber,
    ) -> Result<()> {
        if self.min_firmware >= MIN_FW_INPUT_MAPPING {
            if switch.chain != driver.chain || switch.card != driver.card {
                return Err(OppError::PlacementMismatch {
                    driver: driver.to_string(),
                    switch: switch.to_string(),
                });
            }
        } else {
            let matching = ((driver.index & 0x0C) << 1) | (driver.index & 0x03);
            if switch.chain != driver.chain
                || switch.card != driver.card
                || switch.index != matching
            {
                return Err(OppError::LegacyPlacementMismatch {
                    driver: driver.to_string(),
                    switch: switch.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HoldSettings, PulseSettings};
    use crate::protocol::{OpCode, SOL_INPUT_REMOVE};
    use crate::topology::CARD_GEN2;

    fn num(number: &str) -> DeviceNumber {
        DeviceNumber::parse(number).unwrap()
    }

    fn settings(hold: bool) -> DriverSettings {
        DriverSettings {
            default_pulse: PulseSettings {
                power: 1.0,
                duration_ms: 20,
            },
            default_hold: hold.then_some(HoldSettings { power: 0.5 }),
            recycle: false,
        }
    }

    /// One chain "A", two cards, 32 inputs and 16 solenoids each.
    fn registry(min_firmware: u32) -> Registry {
        Registry::with_space("A", &[(1, 32, 16), (2, 32, 16)], min_firmware)
    }

    fn opcode_of(msg: &[u8]) -> OpCode {
        OpCode::from_u8(msg[1]).unwrap()
    }

    #[test]
    fn configure_driver_requires_known_number() {
        let mut reg = registry(0x0002_0000);
        let err = reg
            .configure_driver(&num("A-9-0"), settings(false))
            .unwrap_err();
        assert!(matches!(err, OppError::UnknownNumber { kind: "solenoid", .. }));
    }

    #[test]
    fn configure_driver_emits_reconfigure() {
        let mut reg = registry(0x0002_0000);
        let msg = reg.configure_driver(&num("A-1-5"), settings(true)).unwrap();
        assert_eq!(opcode_of(&msg), OpCode::ConfigSolenoid);
        assert_eq!(msg[0], CARD_GEN2 | 1);
        // payload: [solenoid, flags, kick_ms, hold_pwm]
        assert_eq!(msg[2], 5);
        assert_eq!(msg[4], 20);
        assert_eq!(msg[5], 128);
    }

    #[test]
    fn same_card_rule_succeeds_on_new_firmware() {
        let mut reg = registry(0x0002_0000);
        reg.configure_driver(&num("A-1-5"), settings(false)).unwrap();
        let sw = reg.configure_switch(&num("A-1-5"), SwitchConfig::default()).unwrap();
        let msgs = reg
            .install_rule(&sw, &num("A-1-5"), RulePolicy::PulseOnHit)
            .unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(opcode_of(&msgs[0]), OpCode::ConfigSolenoid);
        assert_eq!(opcode_of(&msgs[1]), OpCode::SolenoidInput);
        assert_eq!(&msgs[1][2..4], &[5, 5]);
    }

    #[test]
    fn cross_card_rule_fails_on_new_firmware() {
        let mut reg = registry(0x0002_0000);
        reg.configure_driver(&num("A-1-5"), settings(false)).unwrap();
        let sw = reg.configure_switch(&num("A-2-5"), SwitchConfig::default()).unwrap();
        let err = reg
            .install_rule(&sw, &num("A-1-5"), RulePolicy::PulseOnHit)
            .unwrap_err();
        assert!(matches!(err, OppError::PlacementMismatch { .. }));
    }

    #[test]
    fn legacy_firmware_requires_swizzled_switch_index() {
        // Driver index 5 = 0b0101 maps to switch ((5 & 0b1100) << 1) | (5 & 0b0011) = 9.
        let mut reg = registry(0x0001_0000);
        reg.configure_driver(&num("A-1-5"), settings(false)).unwrap();

        let good = reg.configure_switch(&num("A-1-9"), SwitchConfig::default()).unwrap();
        let msgs = reg
            .install_rule(&good, &num("A-1-5"), RulePolicy::PulseOnHit)
            .unwrap();
        // No mapping command exists below 0.2.0; only the rule reconfigure.
        assert_eq!(msgs.len(), 1);
        assert_eq!(opcode_of(&msgs[0]), OpCode::ConfigSolenoid);

        let bad = reg.configure_switch(&num("A-1-5"), SwitchConfig::default()).unwrap();
        let err = reg
            .install_rule(&bad, &num("A-1-5"), RulePolicy::PulseOnHit)
            .unwrap_err();
        assert!(matches!(err, OppError::LegacyPlacementMismatch { .. }));
    }

    #[test]
    fn inverted_switches_cannot_bind() {
        let mut reg = registry(0x0002_0000);
        reg.configure_driver(&num("A-1-5"), settings(false)).unwrap();
        let sw = reg
            .configure_switch(&num("A-1-5"), SwitchConfig { invert: true })
            .unwrap();
        let err = reg
            .install_rule(&sw, &num("A-1-5"), RulePolicy::PulseOnHit)
            .unwrap_err();
        assert!(matches!(err, OppError::InvertedSwitch(_)));
    }

    #[test]
    fn hold_settings_require_a_hold_policy() {
        let mut reg = registry(0x0002_0000);
        reg.configure_driver(&num("A-1-5"), settings(true)).unwrap();
        let sw = reg.configure_switch(&num("A-1-5"), SwitchConfig::default()).unwrap();
        let err = reg
            .install_rule(&sw, &num("A-1-5"), RulePolicy::PulseOnHit)
            .unwrap_err();
        assert!(matches!(err, OppError::HoldNotUsed(_)));

        let msgs = reg
            .install_rule(&sw, &num("A-1-5"), RulePolicy::PulseOnHitAndEnableAndRelease)
            .unwrap();
        // Hold policy sets the on/off and cancel flags.
        let flags = msgs[0][3];
        assert_ne!(flags & sol_flags::ON_OFF, 0);
        assert_ne!(flags & sol_flags::CAN_CANCEL, 0);
    }

    #[test]
    fn second_disable_switch_policy_is_unsupported() {
        let mut reg = registry(0x0002_0000);
        reg.configure_driver(&num("A-1-5"), settings(true)).unwrap();
        let sw = reg.configure_switch(&num("A-1-5"), SwitchConfig::default()).unwrap();
        let err = reg
            .install_rule(
                &sw,
                &num("A-1-5"),
                RulePolicy::PulseOnHitAndEnableAndReleaseAndDisable,
            )
            .unwrap_err();
        assert!(matches!(err, OppError::UnsupportedPolicy(_)));
    }

    #[test]
    fn install_then_clear_disables_the_rule_last() {
        let mut reg = registry(0x0002_0000);
        reg.configure_driver(&num("A-1-5"), settings(false)).unwrap();
        let sw = reg.configure_switch(&num("A-1-5"), SwitchConfig::default()).unwrap();
        let drv = num("A-1-5");

        reg.install_rule(&sw, &drv, RulePolicy::PulseOnHit).unwrap();
        assert_eq!(reg.bound_switches(&drv).unwrap().len(), 1);

        let msgs = reg.clear_rule(&sw, &drv).unwrap();
        assert!(reg.bound_switches(&drv).unwrap().is_empty());
        // Mapping removal first, disable reconfigure last.
        assert_eq!(msgs.len(), 2);
        assert_eq!(opcode_of(&msgs[0]), OpCode::SolenoidInput);
        assert_eq!(msgs[0][3], 5 + SOL_INPUT_REMOVE);
        let last = msgs.last().unwrap();
        assert_eq!(opcode_of(last), OpCode::ConfigSolenoid);
        assert_eq!(last[3] & sol_flags::USE_SWITCH, 0);
    }

    #[test]
    fn install_is_idempotent_per_switch() {
        let mut reg = registry(0x0002_0000);
        reg.configure_driver(&num("A-1-5"), settings(false)).unwrap();
        let sw = reg.configure_switch(&num("A-1-5"), SwitchConfig::default()).unwrap();
        let drv = num("A-1-5");
        reg.install_rule(&sw, &drv, RulePolicy::PulseOnHit).unwrap();
        reg.install_rule(&sw, &drv, RulePolicy::PulseOnHit).unwrap();
        assert_eq!(reg.bound_switches(&drv).unwrap().len(), 1);
    }

    #[test]
    fn two_bindings_only_disable_after_the_second_clear() {
        let mut reg = registry(0x0002_0000);
        reg.configure_driver(&num("A-1-5"), settings(false)).unwrap();
        let sw_a = reg.configure_switch(&num("A-1-5"), SwitchConfig::default()).unwrap();
        let sw_b = reg.configure_switch(&num("A-1-7"), SwitchConfig::default()).unwrap();
        let drv = num("A-1-5");

        reg.install_rule(&sw_a, &drv, RulePolicy::PulseOnHit).unwrap();
        reg.install_rule(&sw_b, &drv, RulePolicy::PulseOnHit).unwrap();
        assert_eq!(reg.bound_switches(&drv).unwrap().len(), 2);

        let msgs = reg.clear_rule(&sw_a, &drv).unwrap();
        assert!(!reg.bound_switches(&drv).unwrap().is_empty());
        assert!(msgs.iter().all(|m| opcode_of(m) != OpCode::ConfigSolenoid));

        let msgs = reg.clear_rule(&sw_b, &drv).unwrap();
        assert_eq!(opcode_of(msgs.last().unwrap()), OpCode::ConfigSolenoid);
    }

    #[test]
    fn clearing_an_unbound_switch_is_a_quiet_noop() {
        let mut reg = registry(0x0002_0000);
        reg.configure_driver(&num("A-1-5"), settings(false)).unwrap();
        let sw_a = reg.configure_switch(&num("A-1-5"), SwitchConfig::default()).unwrap();
        let sw_b = reg.configure_switch(&num("A-1-7"), SwitchConfig::default()).unwrap();
        let drv = num("A-1-5");
        reg.install_rule(&sw_a, &drv, RulePolicy::PulseOnHit).unwrap();

        // sw_b was never bound; the binding set must survive untouched.
        let msgs = reg.clear_rule(&sw_b, &drv).unwrap();
        assert!(msgs.is_empty());
        assert_eq!(reg.bound_switches(&drv).unwrap().len(), 1);
    }

    #[test]
    fn switch_state_changes_invert_raw_level_and_dedupe() {
        let mut reg = registry(0x0002_0000);
        // Raw active-low: raw low (true at the driver layer) reports active.
        let change = reg.set_switch_state(1, 3, true).unwrap();
        assert_eq!(change.number, num("A-1-3"));
        assert!(change.active);
        assert!(reg.set_switch_state(1, 3, true).is_none());
        let change = reg.set_switch_state(1, 3, false).unwrap();
        assert!(!change.active);
    }

    #[test]
    fn switch_state_snapshot_reflects_seeds() {
        let mut reg = registry(0x0002_0000);
        reg.seed_switch_state(1, 3, true);
        let states = reg.switch_states();
        assert_eq!(states.len(), 2 * 32);
        assert!(states["A-1-3"]);
        assert!(!states["A-1-4"]);
    }

    #[test]
    fn unknown_switch_index_is_ignored() {
        let mut reg = registry(0x0002_0000);
        assert!(reg.set_switch_state(7, 3, true).is_none());
    }
}

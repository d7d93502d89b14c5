//! Chain topology model.
//!
//! A chain is an ordered set of addressed boards discovered by the
//! inventory handshake at connect time. The address type nibble tags the
//! board kind; Gen2 boards additionally report four wing-type bytes and a
//! packed firmware version, from which the registry derives the switch,
//! driver, and light identifier spaces.

use crate::error::{OppError, Result};
use crate::protocol::format_version;

/// High nibble of a board address encodes its kind.
pub const CARD_TYPE_MASK: u8 = 0xF0;
pub const CARD_GEN2: u8 = 0x20;
pub const CARD_INCAND: u8 = 0x10;
pub const CARD_PIXEL: u8 = 0x40;

/// Wing-type bytes reported in a Gen2 config response.
pub mod wing {
    pub const NONE: u8 = 0x00;
    pub const SOLENOID: u8 = 0x01;
    pub const INPUT: u8 = 0x02;
    pub const INCAND: u8 = 0x03;
    pub const PIXEL: u8 = 0x06;

    pub const INPUTS_PER_INPUT_WING: u32 = 8;
    pub const INPUTS_PER_SOL_WING: u32 = 8;
    pub const SOLENOIDS_PER_WING: u32 = 4;
    pub const INCANDS_PER_WING: u32 = 8;
}

/// The closed set of board kinds in this hardware family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardKind {
    Gen2,
    Incand,
    PixelDriver,
}

impl BoardKind {
    pub fn from_addr(addr: u8) -> Option<Self> {
        match addr & CARD_TYPE_MASK {
            CARD_GEN2 => Some(Self::Gen2),
            CARD_INCAND => Some(Self::Incand),
            CARD_PIXEL => Some(Self::PixelDriver),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Gen2 => "gen2",
            Self::Incand => "incand",
            Self::PixelDriver => "pixel",
        }
    }
}

/// One addressed board on a chain.
///
/// Immutable once enumerated except for the firmware version (filled in by
/// the version response) and the declared counts (filled in by the Gen2
/// config response).
#[derive(Debug, Clone)]
pub struct Board {
    pub addr: u8,
    pub kind: BoardKind,
    /// Packed major.minor.patch; 0 until the version response arrives.
    pub firmware: u32,
    pub inputs: u32,
    pub solenoids: u32,
    pub incands: u32,
    pub has_pixels: bool,
}

impl Board {
    fn new(addr: u8, kind: BoardKind) -> Self {
        let incands = match kind {
            // Dedicated incandescent boards drive a fixed 32-lamp bank.
            BoardKind::Incand => 32,
            _ => 0,
        };
        Self {
            addr,
            kind,
            firmware: 0,
            inputs: 0,
            solenoids: 0,
            incands,
            has_pixels: kind == BoardKind::PixelDriver,
        }
    }

    /// Chain-relative card number used in device number strings.
    pub fn card(&self) -> u8 {
        self.addr & !CARD_TYPE_MASK
    }

    /// Apply the four wing-type bytes of a Gen2 config response.
    pub fn apply_gen2_config(&mut self, wings: [u8; 4]) -> Result<()> {
        let mut inputs = 0;
        let mut solenoids = 0;
        let mut incands = 0;
        let mut has_pixels = false;
        for &w in &wings {
            match w {
                wing::NONE => {}
                wing::SOLENOID => {
                    solenoids += wing::SOLENOIDS_PER_WING;
                    inputs += wing::INPUTS_PER_SOL_WING;
                }
                wing::INPUT => inputs += wing::INPUTS_PER_INPUT_WING,
                wing::INCAND => incands += wing::INCANDS_PER_WING,
                wing::PIXEL => has_pixels = true,
                other => {
                    return Err(OppError::UnknownSubtype(format!(
                        "wing type 0x{other:02x} on board 0x{:02x}",
                        self.addr
                    )))
                }
            }
        }
        self.inputs = inputs;
        self.solenoids = solenoids;
        self.incands = incands;
        self.has_pixels = has_pixels;
        Ok(())
    }
}

/// Progress of the connect-time handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryState {
    /// No inventory response yet.
    Pending,
    /// Boards enumerated; waiting for config/version responses.
    Enumerated,
    /// All boards described; polling may start.
    Ready,
    /// An unparseable or out-of-order response arrived.
    Failed,
}

/// Ordered board list plus handshake state for one chain.
#[derive(Debug)]
pub struct ChainTopology {
    pub serial: String,
    pub boards: Vec<Board>,
    state: InventoryState,
}

impl ChainTopology {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            boards: Vec::new(),
            state: InventoryState::Pending,
        }
    }

    pub fn state(&self) -> InventoryState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == InventoryState::Ready
    }

    /// Record the inventory response: one address byte per board, in
    /// physical order. An unknown address type nibble or a second
    /// inventory response marks the chain failed.
    pub fn apply_inventory(&mut self, addrs: &[u8]) -> Result<()> {
        if self.state != InventoryState::Pending {
            self.state = InventoryState::Failed;
            return Err(OppError::InventoryIncomplete(self.serial.clone()));
        }
        let mut boards = Vec::with_capacity(addrs.len());
        for &addr in addrs {
            let Some(kind) = BoardKind::from_addr(addr) else {
                self.state = InventoryState::Failed;
                return Err(OppError::UnknownSubtype(format!(
                    "board address 0x{addr:02x} on chain '{}'",
                    self.serial
                )));
            };
            boards.push(Board::new(addr, kind));
        }
        self.boards = boards;
        self.state = InventoryState::Enumerated;
        self.refresh_ready();
        Ok(())
    }

    pub fn board_mut(&mut self, addr: u8) -> Option<&mut Board> {
        self.boards.iter_mut().find(|b| b.addr == addr)
    }

    pub fn board(&self, addr: u8) -> Option<&Board> {
        self.boards.iter().find(|b| b.addr == addr)
    }

    /// Record a version response for a board. Out-of-order responses
    /// (unknown address, or arriving before the inventory) fail the chain.
    pub fn apply_version(&mut self, addr: u8, version: u32) -> Result<()> {
        if self.state == InventoryState::Pending {
            self.state = InventoryState::Failed;
            return Err(OppError::InventoryIncomplete(self.serial.clone()));
        }
        let serial = self.serial.clone();
        match self.board_mut(addr) {
            Some(board) => {
                board.firmware = version;
                self.refresh_ready();
                Ok(())
            }
            None => {
                self.state = InventoryState::Failed;
                Err(OppError::InventoryIncomplete(serial))
            }
        }
    }

    /// Record a Gen2 config response for a board.
    pub fn apply_gen2_config(&mut self, addr: u8, wings: [u8; 4]) -> Result<()> {
        if self.state == InventoryState::Pending {
            self.state = InventoryState::Failed;
            return Err(OppError::InventoryIncomplete(self.serial.clone()));
        }
        let serial = self.serial.clone();
        match self.board_mut(addr) {
            Some(board) => {
                board.apply_gen2_config(wings)?;
                self.refresh_ready();
                Ok(())
            }
            None => {
                self.state = InventoryState::Failed;
                Err(OppError::InventoryIncomplete(serial))
            }
        }
    }

    /// Lowest firmware version across Gen2 boards; governs which mapping
    /// commands the rule engine may emit for this chain.
    pub fn min_firmware(&self) -> u32 {
        self.boards
            .iter()
            .filter(|b| b.kind == BoardKind::Gen2)
            .map(|b| b.firmware)
            .min()
            .unwrap_or(0)
    }

    fn refresh_ready(&mut self) {
        if self.state != InventoryState::Enumerated {
            return;
        }
        let described = self
            .boards
            .iter()
            .filter(|b| b.kind == BoardKind::Gen2)
            .all(|b| b.firmware != 0 && ((b.inputs + b.solenoids + b.incands) > 0 || b.has_pixels));
        if described {
            self.state = InventoryState::Ready;
        }
    }

    /// Human-readable inventory summary for diagnostics.
    pub fn info_string(&self) -> String {
        let mut info = format!("Chain '{}': {} board(s)\n", self.serial, self.boards.len());
        for board in &self.boards {
            info.push_str(&format!(
                "  card {} (0x{:02x}) {}: firmware {}, {} input(s), {} driver(s), {} incand(s){}\n",
                board.card(),
                board.addr,
                board.kind.name(),
                format_version(board.firmware),
                board.inputs,
                board.solenoids,
                board.incands,
                if board.has_pixels { ", pixels" } else { "" },
            ));
        }
        info
    }
}

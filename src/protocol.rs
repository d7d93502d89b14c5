//! Wire codec for the Gen2 board chain protocol.
//!
//! Every frame on the chain has the shape
//! `[address][opcode][payload][crc8][EOM]` where the CRC-8 covers every byte
//! from the address through the payload and `EOM` is the fixed two-byte
//! end-of-message marker. The marker is reserved on the wire and doubles as
//! the resynchronization point after a framing loss: a receiver that sees a
//! bad checksum drops bytes through the next marker and carries on.
//!
//! Everything in this module is pure and stateless; the receive buffer is
//! the caller's `BytesMut`.

use bytes::{Buf, Bytes, BytesMut};

/// Fixed end-of-message marker terminating every frame.
pub const EOM: [u8; 2] = [0xFF, 0xF7];

/// Firmware version threshold (0.2.0) above which boards accept explicit
/// switch-to-solenoid input mappings.
pub const MIN_FW_INPUT_MAPPING: u32 = 0x0002_0000;

/// Upper bound on a sane frame; anything longer without a marker is garbage.
const MAX_FRAME: usize = 64;

/// Command opcodes understood by the board family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Firmware version get/response (4-byte packed version).
    GetVersion = 0x02,
    /// Solenoid reconfigure: `[solenoid, flags, kick_ms, hold_pwm]`.
    ConfigSolenoid = 0x06,
    /// Input state read request/response (4-byte raw mask).
    ReadInputs = 0x08,
    /// Gen2 config get/response (4 wing-type bytes).
    GetGen2Config = 0x0D,
    /// Pixel update: `[pixel, r, g, b]`.
    PixelColor = 0x10,
    /// Incandescent update: `[sub-command, 4-byte on/off mask]`.
    IncandCmd = 0x13,
    /// Add/remove solenoid input mapping: `[switch, solenoid (+0x80 = remove)]`.
    SolenoidInput = 0x17,
    /// Inventory broadcast; the response carries one address byte per board.
    Inventory = 0xF0,
}

impl OpCode {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x02 => Some(Self::GetVersion),
            0x06 => Some(Self::ConfigSolenoid),
            0x08 => Some(Self::ReadInputs),
            0x0D => Some(Self::GetGen2Config),
            0x10 => Some(Self::PixelColor),
            0x13 => Some(Self::IncandCmd),
            0x17 => Some(Self::SolenoidInput),
            0xF0 => Some(Self::Inventory),
            _ => None,
        }
    }

    /// Payload length of an addressed frame. Inventory is variable-length
    /// and framed by the EOM marker instead.
    pub fn payload_len(self) -> Option<usize> {
        match self {
            Self::GetVersion => Some(4),
            Self::ConfigSolenoid => Some(4),
            Self::ReadInputs => Some(4),
            Self::GetGen2Config => Some(4),
            Self::PixelColor => Some(4),
            Self::IncandCmd => Some(5),
            Self::SolenoidInput => Some(2),
            Self::Inventory => None,
        }
    }
}

/// Solenoid configuration flag bits carried in [`OpCode::ConfigSolenoid`].
pub mod sol_flags {
    /// Fire the solenoid autonomously when the bound input goes active.
    pub const USE_SWITCH: u8 = 0x01;
    /// Re-arm automatically after firing (no retrigger lockout).
    pub const AUTO_CLEAR: u8 = 0x02;
    /// Keep the solenoid energized at hold power after the kick.
    pub const ON_OFF: u8 = 0x04;
    /// Cancel the kick when the bound input is released.
    pub const CAN_CANCEL: u8 = 0x20;
}

/// Marker added to the solenoid byte of a [`OpCode::SolenoidInput`] payload
/// to request removal of the mapping.
pub const SOL_INPUT_REMOVE: u8 = 0x80;

/// Incandescent sub-command setting the full on/off mask of a card.
pub const INCAND_SET_ON_OFF: u8 = 0x07;

/// CRC-8 over the given bytes, MSB-first, polynomial 0x07, zero init.
///
/// Matches the lookup-table CRC the board firmware uses.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Encode one addressed frame.
pub fn encode(addr: u8, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(payload.len() + 5);
    msg.push(addr);
    msg.push(opcode as u8);
    msg.extend_from_slice(payload);
    msg.push(crc8(&msg));
    msg.extend_from_slice(&EOM);
    msg
}

/// One decoded unit from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A well-formed addressed message.
    Message {
        addr: u8,
        opcode: OpCode,
        payload: Bytes,
    },
    /// Inventory response: board addresses in physical chain order.
    Inventory(Vec<u8>),
    /// Checksum mismatch or malformed frame; the caller should
    /// [`resync`] the buffer and try again.
    ResyncNeeded,
}

/// Decode the next frame from `buf`, consuming its bytes.
///
/// Returns `None` when the buffer holds no complete frame yet. A checksum
/// mismatch, unknown opcode, or missing terminator consumes nothing beyond
/// what is known-bad and reports [`Frame::ResyncNeeded`].
pub fn decode(buf: &mut BytesMut) -> Option<Frame> {
    // Stray markers between frames are legal padding.
    while buf.len() >= EOM.len() && buf[..EOM.len()] == EOM {
        buf.advance(EOM.len());
    }

    if buf.is_empty() {
        return None;
    }

    if buf[0] == OpCode::Inventory as u8 {
        return decode_inventory(buf);
    }

    if buf.len() < 2 {
        return None;
    }

    let Some(opcode) = OpCode::from_u8(buf[1]) else {
        buf.advance(1);
        return Some(Frame::ResyncNeeded);
    };
    let plen = opcode
        .payload_len()
        .expect("addressed opcodes have fixed payload lengths");

    // addr + opcode + payload + crc + marker
    let total = 2 + plen + 1 + EOM.len();
    if buf.len() < total {
        return None;
    }

    let body = &buf[..2 + plen];
    let crc = buf[2 + plen];
    if crc8(body) != crc || buf[2 + plen + 1..total] != EOM {
        buf.advance(1);
        return Some(Frame::ResyncNeeded);
    }

    let addr = buf[0];
    let mut frame = buf.split_to(total);
    frame.advance(2);
    frame.truncate(plen);
    Some(Frame::Message {
        addr,
        opcode,
        payload: frame.freeze(),
    })
}

fn decode_inventory(buf: &mut BytesMut) -> Option<Frame> {
    let Some(end) = find_eom(buf) else {
        if buf.len() > MAX_FRAME {
            buf.advance(1);
            return Some(Frame::ResyncNeeded);
        }
        return None;
    };

    // opcode + at least the CRC byte
    if end < 2 {
        buf.advance(end + EOM.len());
        return Some(Frame::ResyncNeeded);
    }

    let body = buf.split_to(end);
    buf.advance(EOM.len());

    let (data, crc) = body.split_at(body.len() - 1);
    if crc8(data) != crc[0] {
        return Some(Frame::ResyncNeeded);
    }
    Some(Frame::Inventory(data[1..].to_vec()))
}

/// Drop buffered bytes through the next EOM marker.
///
/// Returns `true` when a marker was found and consumed; `false` leaves at
/// most `EOM.len() - 1` trailing bytes in place (a marker may be split
/// across reads).
pub fn resync(buf: &mut BytesMut) -> bool {
    if let Some(pos) = find_eom(buf) {
        buf.advance(pos + EOM.len());
        true
    } else {
        let keep = buf.len().min(EOM.len() - 1);
        buf.advance(buf.len() - keep);
        false
    }
}

fn find_eom(buf: &[u8]) -> Option<usize> {
    buf.windows(EOM.len()).position(|w| w == EOM)
}

/// Enumerate ascending set-bit positions of a state mask.
///
/// The mask carries a sentinel as its top set bit, which terminates the
/// scan and is never reported. Zero and sentinel-only masks yield nothing.
pub fn set_bits(mask: u64) -> Vec<u8> {
    let mut result = Vec::new();
    if mask == 0 {
        return result;
    }
    let sentinel = 63 - mask.leading_zeros() as u8;
    let mut number: u8 = 0;
    let mut reference: u64 = 1;
    while number < sentinel {
        if mask & reference != 0 {
            result.push(number);
        }
        number += 1;
        reference <<= 1;
    }
    result
}

/// Render a packed firmware version (`0x00020000` = "0.2.0").
pub fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        (version >> 24) & 0xFF,
        (version >> 16) & 0xFF,
        version & 0xFFFF
    )
}

// =============================================================================
// Typed builders for every command the core sends
// =============================================================================

/// Inventory broadcast request. Not addressed; boards append their address
/// byte as the frame passes down the chain.
pub fn build_inventory_request() -> Vec<u8> {
    let body = [OpCode::Inventory as u8];
    let mut msg = body.to_vec();
    msg.push(crc8(&body));
    msg.extend_from_slice(&EOM);
    msg
}

pub fn build_get_version(addr: u8) -> Vec<u8> {
    encode(addr, OpCode::GetVersion, &[0, 0, 0, 0])
}

pub fn build_get_gen2_config(addr: u8) -> Vec<u8> {
    encode(addr, OpCode::GetGen2Config, &[0, 0, 0, 0])
}

pub fn build_read_inputs(addr: u8) -> Vec<u8> {
    encode(addr, OpCode::ReadInputs, &[0, 0, 0, 0])
}

pub fn build_solenoid_config(addr: u8, solenoid: u8, flags: u8, kick_ms: u8, hold_pwm: u8) -> Vec<u8> {
    encode(addr, OpCode::ConfigSolenoid, &[solenoid, flags, kick_ms, hold_pwm])
}

pub fn build_solenoid_input(addr: u8, switch: u8, solenoid: u8, remove: bool) -> Vec<u8> {
    let sol = if remove {
        solenoid + SOL_INPUT_REMOVE
    } else {
        solenoid
    };
    encode(addr, OpCode::SolenoidInput, &[switch, sol])
}

pub fn build_incand_set(addr: u8, mask: u32) -> Vec<u8> {
    let m = mask.to_be_bytes();
    encode(addr, OpCode::IncandCmd, &[INCAND_SET_ON_OFF, m[0], m[1], m[2], m[3]])
}

pub fn build_pixel_color(addr: u8, pixel: u8, rgb: [u8; 3]) -> Vec<u8> {
    encode(addr, OpCode::PixelColor, &[pixel, rgb[0], rgb[1], rgb[2]])
}

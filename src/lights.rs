//! Light batching layer.
//!
//! Pixel channels are written synchronously but only flagged dirty; a
//! periodic sync pass flushes dirty pixels into consolidated color
//! commands. Incandescent lamps batch per card into a 32-bit on/off mask
//! flushed by a separately scheduled pass. UART oversampling makes
//! eventual consistency of incandescent state acceptable, so only changed
//! cards are sent.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::debug;

use crate::config::LightNumber;
use crate::error::{OppError, Result};
use crate::protocol;

/// Sub-channel count of an RGB pixel.
const PIXEL_CHANNELS: u8 = 3;

#[derive(Debug, Clone)]
struct Pixel {
    addr: u8,
    color: [u8; 3],
    dirty: bool,
}

#[derive(Debug, Clone)]
struct IncandBank {
    addr: u8,
    mask: u32,
    dirty: bool,
}

/// Per-chain pixel and incandescent state.
#[derive(Debug, Default)]
pub struct Lights {
    chain: String,
    /// Pixel-capable cards discovered at enumeration, keyed by card.
    pixel_cards: HashMap<u8, u8>,
    /// Pixels created at configure time, keyed by (card, pixel index);
    /// sub-channels share the entry.
    pixels: HashMap<(u8, u8), Pixel>,
    /// Keyed by card.
    incands: HashMap<u8, IncandBank>,
}

impl Lights {
    pub fn new(chain: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            ..Default::default()
        }
    }

    /// Register a pixel-capable board; pixels themselves are created when
    /// the host configures them.
    ///
    /// Card numbers address a board uniquely within a light namespace, so
    /// a second board claiming the same card is a topology error.
    pub fn add_pixel_card(&mut self, card: u8, addr: u8) -> Result<()> {
        match self.pixel_cards.entry(card) {
            Entry::Occupied(slot) if *slot.get() != addr => Err(OppError::AmbiguousLightCard {
                chain: self.chain.clone(),
                card,
            }),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(addr);
                Ok(())
            }
        }
    }

    /// Register an incandescent bank on a board. Same uniqueness rule as
    /// [`Self::add_pixel_card`].
    pub fn add_incand_card(&mut self, card: u8, addr: u8) -> Result<()> {
        match self.incands.entry(card) {
            Entry::Occupied(slot) if slot.get().addr != addr => {
                Err(OppError::AmbiguousLightCard {
                    chain: self.chain.clone(),
                    card,
                })
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(IncandBank {
                    addr,
                    mask: 0,
                    dirty: false,
                });
                Ok(())
            }
        }
    }

    /// Create a pixel on a previously enumerated pixel-capable card.
    pub fn configure_pixel(&mut self, number: &LightNumber) -> Result<()> {
        let addr = *self
            .pixel_cards
            .get(&number.card)
            .ok_or_else(|| OppError::UnknownNumber {
                kind: "neopixel",
                number: number.to_string(),
            })?;
        self.pixels.entry((number.card, number.index)).or_insert(Pixel {
            addr,
            color: [0; 3],
            dirty: false,
        });
        Ok(())
    }

    /// Whether a card carries an incandescent bank.
    pub fn has_incand_card(&self, card: u8) -> bool {
        self.incands.contains_key(&card)
    }

    /// Expand a host light number into its channel numbers.
    ///
    /// LED pixels expose three sub-channels (`number-0` .. `number-2`);
    /// matrix (incandescent) lights expose a single channel.
    pub fn parse_light_number_to_channels(
        number: &str,
        subtype: &str,
    ) -> Result<Vec<String>> {
        match subtype {
            "" | "led" => Ok((0..PIXEL_CHANNELS)
                .map(|ch| format!("{number}-{ch}"))
                .collect()),
            "matrix" => Ok(vec![format!("{number}-0")]),
            other => Err(OppError::UnknownSubtype(other.to_string())),
        }
    }

    /// Write one pixel sub-channel, marking the pixel dirty on change.
    pub fn set_pixel_channel(&mut self, number: &LightNumber, value: u8) -> Result<()> {
        let pixel = self
            .pixels
            .get_mut(&(number.card, number.index))
            .ok_or_else(|| OppError::UnknownNumber {
                kind: "neopixel",
                number: number.to_string(),
            })?;
        let channel = usize::from(number.channel.min(PIXEL_CHANNELS - 1));
        if pixel.color[channel] != value {
            pixel.color[channel] = value;
            pixel.dirty = true;
        }
        Ok(())
    }

    /// Switch one incandescent lamp, marking its card dirty on change.
    pub fn set_incand(&mut self, number: &LightNumber, on: bool) -> Result<()> {
        let bank = self
            .incands
            .get_mut(&number.card)
            .ok_or_else(|| OppError::UnknownNumber {
                kind: "matrix light",
                number: number.to_string(),
            })?;
        let bit = 1u32 << number.index;
        let mask = if on { bank.mask | bit } else { bank.mask & !bit };
        if mask != bank.mask {
            bank.mask = mask;
            bank.dirty = true;
        }
        Ok(())
    }

    /// Flush dirty pixels, clearing their flags.
    pub fn light_sync(&mut self) -> Vec<Vec<u8>> {
        let mut msgs = Vec::new();
        let mut keys: Vec<_> = self.pixels.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            let pixel = self.pixels.get_mut(&key).expect("key from map");
            if pixel.dirty {
                pixel.dirty = false;
                msgs.push(protocol::build_pixel_color(pixel.addr, key.1, pixel.color));
            }
        }
        if !msgs.is_empty() {
            debug!(chain = %self.chain, updates = msgs.len(), "pixel sync");
        }
        msgs
    }

    /// Flush dirty incandescent banks, clearing their flags.
    pub fn update_incand(&mut self) -> Vec<Vec<u8>> {
        let mut msgs = Vec::new();
        let mut cards: Vec<_> = self.incands.keys().copied().collect();
        cards.sort_unstable();
        for card in cards {
            let bank = self.incands.get_mut(&card).expect("key from map");
            if bank.dirty {
                bank.dirty = false;
                msgs.push(protocol::build_incand_set(bank.addr, bank.mask));
            }
        }
        if !msgs.is_empty() {
            debug!(chain = %self.chain, updates = msgs.len(), "incand update");
        }
        msgs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpCode;

    fn light(number: &str) -> LightNumber {
        LightNumber::parse(number).unwrap()
    }

    fn lights() -> Lights {
        let mut l = Lights::new("A");
        l.add_pixel_card(3, 0x43).unwrap();
        l.add_incand_card(4, 0x14).unwrap();
        for pixel in ["A-3-7-0", "A-3-2-0"] {
            l.configure_pixel(&light(pixel)).unwrap();
        }
        l
    }

    #[test]
    fn led_numbers_expand_to_three_channels() {
        let channels = Lights::parse_light_number_to_channels("A-3-7", "led").unwrap();
        assert_eq!(channels, vec!["A-3-7-0", "A-3-7-1", "A-3-7-2"]);
        let matrix = Lights::parse_light_number_to_channels("A-4-2", "matrix").unwrap();
        assert_eq!(matrix, vec!["A-4-2-0"]);
        assert!(Lights::parse_light_number_to_channels("A-4-2", "strobe").is_err());
    }

    #[test]
    fn pixel_writes_batch_until_sync() {
        let mut l = lights();
        l.set_pixel_channel(&light("A-3-7-0"), 255).unwrap();
        l.set_pixel_channel(&light("A-3-7-2"), 64).unwrap();
        l.set_pixel_channel(&light("A-3-2-1"), 9).unwrap();

        let msgs = l.light_sync();
        // Two dirty pixels, one consolidated command each.
        assert_eq!(msgs.len(), 2);
        assert!(msgs
            .iter()
            .all(|m| OpCode::from_u8(m[1]) == Some(OpCode::PixelColor)));
        // Sorted by (card, pixel): pixel 2 first, then pixel 7.
        assert_eq!(&msgs[0][2..6], &[2, 0, 9, 0]);
        assert_eq!(&msgs[1][2..6], &[7, 255, 0, 64]);

        // Flags cleared: nothing further to flush.
        assert!(l.light_sync().is_empty());
    }

    #[test]
    fn rewriting_the_same_color_stays_clean() {
        let mut l = lights();
        l.set_pixel_channel(&light("A-3-7-0"), 10).unwrap();
        l.light_sync();
        l.set_pixel_channel(&light("A-3-7-0"), 10).unwrap();
        assert!(l.light_sync().is_empty());
    }

    #[test]
    fn incand_lamps_batch_into_a_card_mask() {
        let mut l = lights();
        l.set_incand(&light("A-4-0-0"), true).unwrap();
        l.set_incand(&light("A-4-5-0"), true).unwrap();

        let msgs = l.update_incand();
        assert_eq!(msgs.len(), 1);
        assert_eq!(OpCode::from_u8(msgs[0][1]), Some(OpCode::IncandCmd));
        let mask = u32::from_be_bytes(msgs[0][3..7].try_into().unwrap());
        assert_eq!(mask, 0b100001);

        l.set_incand(&light("A-4-5-0"), false).unwrap();
        let msgs = l.update_incand();
        let mask = u32::from_be_bytes(msgs[0][3..7].try_into().unwrap());
        assert_eq!(mask, 0b000001);
        assert!(l.update_incand().is_empty());
    }

    #[test]
    fn a_card_number_cannot_span_two_boards() {
        let mut l = lights();
        // Card 4's incand bank already belongs to the board at 0x14; a
        // gen2 board with an incand wing may not claim the same card.
        assert!(matches!(
            l.add_incand_card(4, 0x24),
            Err(OppError::AmbiguousLightCard { card: 4, .. })
        ));
        assert!(matches!(
            l.add_pixel_card(3, 0x23),
            Err(OppError::AmbiguousLightCard { card: 3, .. })
        ));
        // Re-registering the same board is idempotent.
        l.add_incand_card(4, 0x14).unwrap();
        l.add_pixel_card(3, 0x43).unwrap();

        // The original bank still routes to its own board.
        l.set_incand(&light("A-4-0-0"), true).unwrap();
        let msgs = l.update_incand();
        assert_eq!(msgs[0][0], 0x14);
    }

    #[test]
    fn unknown_cards_are_configuration_errors() {
        let mut l = lights();
        assert!(matches!(
            l.configure_pixel(&light("A-9-0-0")),
            Err(OppError::UnknownNumber { .. })
        ));
        assert!(matches!(
            l.set_pixel_channel(&light("A-3-9-0"), 1),
            Err(OppError::UnknownNumber { .. })
        ));
        assert!(matches!(
            l.set_incand(&light("A-9-0-0"), true),
            Err(OppError::UnknownNumber { .. })
        ));
    }
}

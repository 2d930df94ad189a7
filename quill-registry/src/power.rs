//! Power rounds: per-slot (staker, weight, produced?) records used to judge
//! whether the chain commands enough producing weight to keep running.

use quill_core::{CodecError, Decodable, Encodable, Reader};

use crate::TRIL;

const POWER_VERSION: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerElement {
    pub version: i32,
    pub staker_id: u32,
    pub weight: u32,
    pub did_produce: bool,
}

impl PowerElement {
    pub fn new(staker_id: u32, weight: u32, did_produce: bool) -> Self {
        PowerElement {
            version: POWER_VERSION,
            staker_id,
            weight,
            did_produce,
        }
    }
}

impl Encodable for PowerElement {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        self.staker_id.encode(out);
        self.weight.encode(out);
        self.did_produce.encode(out);
    }
}

impl Decodable for PowerElement {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(PowerElement {
            version: i32::decode(r)?,
            staker_id: u32::decode(r)?,
            weight: u32::decode(r)?,
            did_produce: bool::decode(r)?,
        })
    }
}

/// One round's worth of slot outcomes, in slot order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerRound {
    pub version: i32,
    elements: Vec<PowerElement>,
}

impl Default for PowerRound {
    fn default() -> Self {
        PowerRound {
            version: POWER_VERSION,
            elements: Vec::new(),
        }
    }
}

impl PowerRound {
    pub fn set_null(&mut self) {
        self.version = POWER_VERSION;
        self.elements.clear();
    }

    pub fn push(&mut self, staker_id: u32, weight: u32, did_produce: bool) {
        self.elements
            .push(PowerElement::new(staker_id, weight, did_produce));
    }

    /// Weight of slots whose block was produced.
    pub fn weight(&self) -> u64 {
        self.elements
            .iter()
            .filter(|e| e.did_produce)
            .map(|e| e.weight as u64)
            .sum()
    }

    pub fn total_weight(&self) -> u64 {
        self.elements.iter().map(|e| e.weight as u64).sum()
    }

    pub fn pico_power(&self) -> u64 {
        let total = self.total_weight();
        if total == 0 {
            return 0;
        }
        self.weight() * TRIL / total
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &[PowerElement] {
        &self.elements
    }
}

impl Encodable for PowerRound {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        self.elements.encode(out);
    }
}

impl Decodable for PowerRound {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(PowerRound {
            version: i32::decode(r)?,
            elements: Vec::<PowerElement>::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pico_power_extremes() {
        let mut all = PowerRound::default();
        let mut none = PowerRound::default();
        for id in 1..=4u32 {
            all.push(id, 10 * id, true);
            none.push(id, 10 * id, false);
        }
        assert_eq!(all.pico_power(), TRIL);
        assert_eq!(none.pico_power(), 0);
        assert_eq!(PowerRound::default().pico_power(), 0);
    }

    #[test]
    fn partial_production() {
        let mut round = PowerRound::default();
        round.push(1, 30, true);
        round.push(2, 70, false);
        assert_eq!(round.pico_power(), 30 * TRIL / 100);
    }

    #[test]
    fn codec_roundtrip() {
        let mut round = PowerRound::default();
        round.push(1, 5, true);
        round.push(2, 9, false);
        let bytes = round.to_bytes();
        assert_eq!(PowerRound::from_bytes(&bytes).unwrap(), round);
    }
}

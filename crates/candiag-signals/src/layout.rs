//! Bit layout of a signal inside a payload
//!
//! A layout is a list of byte-local bit spans computed once from the start
//! bit, length and byte order. Extraction and packing walk the same spans,
//! so they are exact inverses.

use crate::types::{ByteOrder, SignalDef};

/// Consecutive bits inside one payload byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitSpan {
    pub byte_index: usize,
    /// Lowest bit inside the byte (0..=7)
    pub bit_offset: u8,
    /// Number of bits (1..=8)
    pub num_bits: u8,
    /// Position of these bits in the raw value
    pub value_shift: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalLayout {
    pub spans: Vec<BitSpan>,
    pub bit_length: u16,
}

impl SignalLayout {
    pub fn for_signal(signal: &SignalDef) -> Self {
        let mut spans = Vec::new();
        let mut byte_index = usize::from(signal.start_bit / 8);
        let mut bit_index = (signal.start_bit % 8) as u8;
        let mut remaining = u32::from(signal.bit_length.clamp(1, 64));

        match signal.byte_order {
            ByteOrder::BigEndian => {
                // start bit is the MSB; walk down, then continue at bit 7 of the next byte
                while remaining > 0 {
                    let num_bits = (u32::from(bit_index) + 1).min(remaining) as u8;
                    remaining -= u32::from(num_bits);
                    spans.push(BitSpan {
                        byte_index,
                        bit_offset: bit_index + 1 - num_bits,
                        num_bits,
                        value_shift: remaining as u8,
                    });
                    byte_index += 1;
                    bit_index = 7;
                }
            }
            ByteOrder::LittleEndian => {
                let mut value_shift = 0u32;
                while remaining > 0 {
                    let num_bits = (8 - u32::from(bit_index)).min(remaining) as u8;
                    spans.push(BitSpan {
                        byte_index,
                        bit_offset: bit_index,
                        num_bits,
                        value_shift: value_shift as u8,
                    });
                    value_shift += u32::from(num_bits);
                    remaining -= u32::from(num_bits);
                    byte_index += 1;
                    bit_index = 0;
                }
            }
        }

        Self {
            spans,
            bit_length: signal.bit_length.clamp(1, 64),
        }
    }

    /// Number of payload bytes needed to hold every span
    pub fn required_len(&self) -> usize {
        self.spans
            .iter()
            .map(|s| s.byte_index + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn fits(&self, len: usize) -> bool {
        self.required_len() <= len
    }

    /// Extract the raw unsigned value; caller checks [`fits`](Self::fits)
    pub fn extract(&self, data: &[u8]) -> u64 {
        let mut raw = 0u64;
        for span in &self.spans {
            let mask = ((1u16 << span.num_bits) - 1) as u8;
            let bits = (data[span.byte_index] >> span.bit_offset) & mask;
            raw |= u64::from(bits) << span.value_shift;
        }
        raw
    }

    /// Extract and sign-extend
    pub fn extract_signed(&self, data: &[u8]) -> i64 {
        let raw = self.extract(data);
        let shift = 64 - u32::from(self.bit_length);
        ((raw << shift) as i64) >> shift
    }

    /// Write a raw value, clearing the target bits first
    pub fn pack(&self, data: &mut [u8], raw: u64) {
        for span in &self.spans {
            let mask = ((1u16 << span.num_bits) - 1) as u8;
            let bits = ((raw >> span.value_shift) as u8) & mask;
            data[span.byte_index] &= !(mask << span.bit_offset);
            data[span.byte_index] |= bits << span.bit_offset;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_spans() {
        let sig = SignalDef::new("rpm", 4, 12);
        let layout = SignalLayout::for_signal(&sig);
        assert_eq!(layout.spans.len(), 2);
        assert_eq!(layout.required_len(), 2);

        // raw 0xABC: low nibble C lands in bits 4..8 of byte 0, AB in byte 1
        let data = [0xC0, 0xAB];
        assert_eq!(layout.extract(&data), 0xABC);
    }

    #[test]
    fn test_big_endian_spans() {
        // Motorola 16-bit starting at bit 7: byte 0 is MSB, byte 1 LSB
        let sig = SignalDef::new("speed", 7, 16).with_byte_order(ByteOrder::BigEndian);
        let layout = SignalLayout::for_signal(&sig);
        assert_eq!(layout.extract(&[0x12, 0x34]), 0x1234);
    }

    #[test]
    fn test_big_endian_unaligned() {
        // 12 bits starting at bit 3 of byte 0: 4 bits from byte 0, 8 from byte 1
        let sig = SignalDef::new("x", 3, 12).with_byte_order(ByteOrder::BigEndian);
        let layout = SignalLayout::for_signal(&sig);
        assert_eq!(layout.extract(&[0x0A, 0xBC]), 0xABC);
    }

    #[test]
    fn test_signed_extraction() {
        let sig = SignalDef::new("temp", 0, 8).signed();
        let layout = SignalLayout::for_signal(&sig);
        assert_eq!(layout.extract_signed(&[0xFE]), -2);
        assert_eq!(layout.extract_signed(&[0x7F]), 127);
    }

    #[test]
    fn test_pack_preserves_neighbours() {
        let sig = SignalDef::new("mid", 4, 8);
        let layout = SignalLayout::for_signal(&sig);
        let mut data = [0xFF, 0xFF];
        layout.pack(&mut data, 0x00);
        assert_eq!(data, [0x0F, 0xF0]);
        layout.pack(&mut data, 0xA5);
        assert_eq!(layout.extract(&data), 0xA5);
    }
}

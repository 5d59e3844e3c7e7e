//! Scaled integer encoding for register values

use byteorder::{BigEndian, ByteOrder};

use super::schema::{RegisterDef, Width};

/// Scale, round to nearest and saturate into the register's raw range.
/// NaN encodes as 0.
pub fn encode_raw(value: f64, def: &RegisterDef) -> u32 {
    let scaled = (value * def.scale).round();
    if scaled.is_nan() || scaled <= 0.0 {
        return 0;
    }
    let max = def.width.max_raw();
    if scaled >= max as f64 {
        max
    } else {
        scaled as u32
    }
}

/// Raw value to register words, high word first
pub fn to_words(raw: u32, width: Width) -> Vec<u16> {
    match width {
        Width::U16 => vec![raw.min(u16::MAX as u32) as u16],
        Width::U32 => {
            let mut buf = [0u8; 4];
            BigEndian::write_u32(&mut buf, raw);
            vec![BigEndian::read_u16(&buf[..2]), BigEndian::read_u16(&buf[2..])]
        }
    }
}

/// Register words back to the raw value. `words` must hold exactly
/// `width.words()` entries.
pub fn from_words(words: &[u16], width: Width) -> Option<u32> {
    match (width, words) {
        (Width::U16, [word]) => Some(*word as u32),
        (Width::U32, [high, low]) => {
            let mut buf = [0u8; 4];
            BigEndian::write_u16(&mut buf[..2], *high);
            BigEndian::write_u16(&mut buf[2..], *low);
            Some(BigEndian::read_u32(&buf))
        }
        _ => None,
    }
}

pub fn encode(value: f64, def: &RegisterDef) -> Vec<u16> {
    to_words(encode_raw(value, def), def.width)
}

/// Engineering value of a raw register value
pub fn decode_raw(raw: u32, def: &RegisterDef) -> f64 {
    raw as f64 / def.scale
}

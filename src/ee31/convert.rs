// src/ee31/convert.rs
//
// Endian-aware primitive conversion for EE31 payloads.
// EE31 native fields are little-endian, Modbus-derived fields big-endian,
// so the byte order is chosen per converter rather than globally.

use chrono::NaiveDate;

/// Byte order of multi-byte fields
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

/// Reads and writes fixed-offset primitives. Reads past the end of the
/// buffer yield zero/default values; callers validate lengths first.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryConverter {
    pub order: ByteOrder,
}

impl BinaryConverter {
    pub const LE: BinaryConverter = BinaryConverter {
        order: ByteOrder::LittleEndian,
    };
    pub const BE: BinaryConverter = BinaryConverter {
        order: ByteOrder::BigEndian,
    };

    pub fn new(order: ByteOrder) -> Self {
        Self { order }
    }

    fn array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
        bytes
            .get(offset..offset + N)
            .and_then(|s| s.try_into().ok())
            .unwrap_or([0; N])
    }

    pub fn to_u8(&self, bytes: &[u8], offset: usize) -> u8 {
        bytes.get(offset).copied().unwrap_or(0)
    }

    pub fn to_u16(&self, bytes: &[u8], offset: usize) -> u16 {
        let a = Self::array::<2>(bytes, offset);
        match self.order {
            ByteOrder::LittleEndian => u16::from_le_bytes(a),
            ByteOrder::BigEndian => u16::from_be_bytes(a),
        }
    }

    pub fn to_u32(&self, bytes: &[u8], offset: usize) -> u32 {
        let a = Self::array::<4>(bytes, offset);
        match self.order {
            ByteOrder::LittleEndian => u32::from_le_bytes(a),
            ByteOrder::BigEndian => u32::from_be_bytes(a),
        }
    }

    pub fn to_u64(&self, bytes: &[u8], offset: usize) -> u64 {
        let a = Self::array::<8>(bytes, offset);
        match self.order {
            ByteOrder::LittleEndian => u64::from_le_bytes(a),
            ByteOrder::BigEndian => u64::from_be_bytes(a),
        }
    }

    /// IEEE-754 single precision
    pub fn to_f32(&self, bytes: &[u8], offset: usize) -> f32 {
        f32::from_bits(self.to_u32(bytes, offset))
    }

    pub fn put_u16(&self, out: &mut Vec<u8>, value: u16) {
        match self.order {
            ByteOrder::LittleEndian => out.extend_from_slice(&value.to_le_bytes()),
            ByteOrder::BigEndian => out.extend_from_slice(&value.to_be_bytes()),
        }
    }

    pub fn put_u32(&self, out: &mut Vec<u8>, value: u32) {
        match self.order {
            ByteOrder::LittleEndian => out.extend_from_slice(&value.to_le_bytes()),
            ByteOrder::BigEndian => out.extend_from_slice(&value.to_be_bytes()),
        }
    }

    pub fn put_u64(&self, out: &mut Vec<u8>, value: u64) {
        match self.order {
            ByteOrder::LittleEndian => out.extend_from_slice(&value.to_le_bytes()),
            ByteOrder::BigEndian => out.extend_from_slice(&value.to_be_bytes()),
        }
    }

    pub fn put_f32(&self, out: &mut Vec<u8>, value: f32) {
        self.put_u32(out, value.to_bits());
    }

    /// Extract a fixed-length C string from `len` bytes at `offset`.
    /// 0x00 and 0xFF both terminate; anything after the terminator is ignored.
    pub fn to_cstring(&self, bytes: &[u8], offset: usize, len: usize) -> String {
        let end = (offset + len).min(bytes.len());
        let region = bytes.get(offset..end).unwrap_or(&[]);
        let mut normalised: Vec<u8> = region
            .iter()
            .map(|&b| if b == 0xFF { 0x00 } else { b })
            .collect();
        if let Some(pos) = normalised.iter().position(|&b| b == 0x00) {
            normalised.truncate(pos);
        }
        String::from_utf8_lossy(&normalised).into_owned()
    }

    /// Write `s` into a zero-padded field of exactly `len` bytes, truncating
    /// at the last whole character that fits.
    pub fn put_cstring(&self, out: &mut Vec<u8>, s: &str, len: usize) {
        let n = s
            .char_indices()
            .map(|(i, ch)| i + ch.len_utf8())
            .take_while(|end| *end <= len)
            .last()
            .unwrap_or(0);
        out.extend_from_slice(&s.as_bytes()[..n]);
        out.extend(std::iter::repeat(0u8).take(len - n));
    }

    /// Packed date: day byte, month byte, 16-bit year.
    /// Day and month are floored to 1 so an erased record still builds a date.
    pub fn to_date(&self, bytes: &[u8], offset: usize) -> Option<NaiveDate> {
        let day = self.to_u8(bytes, offset).max(1);
        let month = self.to_u8(bytes, offset + 1).max(1);
        let year = self.to_u16(bytes, offset + 2);
        NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
    }

    pub fn put_date(&self, out: &mut Vec<u8>, date: Option<NaiveDate>) {
        use chrono::Datelike;
        match date {
            Some(d) => {
                out.push(d.day() as u8);
                out.push(d.month() as u8);
                self.put_u16(out, d.year().clamp(0, u16::MAX as i32) as u16);
            }
            None => out.extend_from_slice(&[0, 0, 0, 0]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_byte_orders() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(BinaryConverter::LE.to_u16(&bytes, 0), 0x0201);
        assert_eq!(BinaryConverter::BE.to_u16(&bytes, 0), 0x0102);
        assert_eq!(BinaryConverter::LE.to_u32(&bytes, 4), 0x0807_0605);
        assert_eq!(BinaryConverter::BE.to_u32(&bytes, 4), 0x0506_0708);
        assert_eq!(BinaryConverter::LE.to_u64(&bytes, 0), 0x0807_0605_0403_0201);
        assert_eq!(BinaryConverter::BE.to_u64(&bytes, 0), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_out_of_range_reads_are_zero() {
        let bytes = [0xAA];
        assert_eq!(BinaryConverter::LE.to_u16(&bytes, 0), 0);
        assert_eq!(BinaryConverter::LE.to_u8(&bytes, 5), 0);
        assert_eq!(BinaryConverter::BE.to_f32(&bytes, 0), 0.0);
    }

    #[test]
    fn test_f32_both_orders() {
        let mut le = Vec::new();
        BinaryConverter::LE.put_f32(&mut le, 21.5);
        assert_eq!(le, 21.5f32.to_le_bytes().to_vec());
        assert_eq!(BinaryConverter::LE.to_f32(&le, 0), 21.5);

        let mut be = Vec::new();
        BinaryConverter::BE.put_f32(&mut be, -40.0);
        assert_eq!(be, (-40.0f32).to_be_bytes().to_vec());
        assert_eq!(BinaryConverter::BE.to_f32(&be, 0), -40.0);
    }

    #[test]
    fn test_cstring_terminators() {
        let c = BinaryConverter::LE;
        assert_eq!(c.to_cstring(b"EE210\0\0\0", 0, 8), "EE210");
        assert_eq!(c.to_cstring(&[b'A', b'B', 0xFF, b'C', 0x00], 0, 5), "AB");
        assert_eq!(c.to_cstring(&[0xFF; 16], 0, 16), "");
        // no terminator: whole region
        assert_eq!(c.to_cstring(b"XXSigmaYY", 2, 5), "Sigma");
        // region longer than buffer
        assert_eq!(c.to_cstring(b"abc", 1, 10), "bc");
    }

    #[test]
    fn test_put_cstring_pads_and_truncates() {
        let c = BinaryConverter::LE;
        let mut out = Vec::new();
        c.put_cstring(&mut out, "Sigma10", 16);
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..7], b"Sigma10");
        assert!(out[7..].iter().all(|&b| b == 0));

        let mut out = Vec::new();
        c.put_cstring(&mut out, "ABCDEFGHIJKLMNOPQRST", 16);
        assert_eq!(out, b"ABCDEFGHIJKLMNOP".to_vec());
    }

    #[test]
    fn test_put_cstring_keeps_whole_characters() {
        let c = BinaryConverter::LE;
        // the second ü occupies bytes 15 and 16 and cannot fit
        let mut out = Vec::new();
        c.put_cstring(&mut out, "Kühlhaus Nordtür", 16);
        assert_eq!(out.len(), 16);
        assert_eq!(out[15], 0);
        assert_eq!(c.to_cstring(&out, 0, 16), "Kühlhaus Nordt");
    }

    #[test]
    fn test_date_floors_day_and_month() {
        let c = BinaryConverter::LE;
        let bytes = [15, 6, 0xE9, 0x07];
        assert_eq!(c.to_date(&bytes, 0), NaiveDate::from_ymd_opt(2025, 6, 15));

        let erased = [0, 0, 0xE8, 0x07];
        assert_eq!(c.to_date(&erased, 0), NaiveDate::from_ymd_opt(2024, 1, 1));

        let impossible = [31, 2, 0xE8, 0x07];
        assert_eq!(c.to_date(&impossible, 0), None);
    }

    #[test]
    fn test_put_date() {
        let mut out = Vec::new();
        BinaryConverter::LE.put_date(&mut out, NaiveDate::from_ymd_opt(2025, 6, 15));
        assert_eq!(out, vec![15, 6, 0xE9, 0x07]);
        let mut out = Vec::new();
        BinaryConverter::LE.put_date(&mut out, None);
        assert_eq!(out, vec![0, 0, 0, 0]);
    }
}

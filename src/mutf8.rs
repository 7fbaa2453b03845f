use std::fmt;

use crate::error::Error;

/// A Java string value: a sequence of UTF-16 code units. Lone surrogates are
/// legal here, which is why this isn't a `String`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JavaString(Vec<u16>);

impl JavaString {
    pub fn from_units(units: Vec<u16>) -> JavaString {
        JavaString(units)
    }

    pub fn units(&self) -> &[u16] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes the modified UTF-8 encoding used by the constant pool.
    pub fn from_modified_utf8(bytes: &[u8]) -> Result<JavaString, Error> {
        let mut units = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if b & 0x80 == 0 {
                units.push(b as u16);
                i += 1;
            } else if b & 0xE0 == 0xC0 {
                let b2 = *bytes.get(i + 1).ok_or(Error::InvalidModifiedUtf8(i))?;
                if b2 & 0xC0 != 0x80 {
                    return Err(Error::InvalidModifiedUtf8(i));
                }
                units.push((((b & 0x1F) as u16) << 6) | (b2 & 0x3F) as u16);
                i += 2;
            } else if b & 0xF0 == 0xE0 {
                let (b2, b3) = match (bytes.get(i + 1), bytes.get(i + 2)) {
                    (Some(b2), Some(b3)) => (*b2, *b3),
                    _ => return Err(Error::InvalidModifiedUtf8(i)),
                };
                if b2 & 0xC0 != 0x80 || b3 & 0xC0 != 0x80 {
                    return Err(Error::InvalidModifiedUtf8(i));
                }
                units.push(
                    (((b & 0x0F) as u16) << 12) | (((b2 & 0x3F) as u16) << 6) | (b3 & 0x3F) as u16,
                );
                i += 3;
            } else {
                return Err(Error::InvalidModifiedUtf8(i));
            }
        }

        Ok(JavaString(units))
    }

    pub fn to_modified_utf8(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len());
        for &unit in &self.0 {
            match unit {
                0x0001..=0x007F => out.push(unit as u8),
                0x0000 | 0x0080..=0x07FF => {
                    out.push(0xC0 | (unit >> 6) as u8);
                    out.push(0x80 | (unit & 0x3F) as u8);
                }
                _ => {
                    out.push(0xE0 | (unit >> 12) as u8);
                    out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                    out.push(0x80 | (unit & 0x3F) as u8);
                }
            }
        }

        out
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }
}

impl From<&str> for JavaString {
    fn from(s: &str) -> Self {
        JavaString(s.encode_utf16().collect())
    }
}

impl From<String> for JavaString {
    fn from(s: String) -> Self {
        JavaString::from(s.as_str())
    }
}

impl fmt::Display for JavaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nul_uses_two_byte_form() {
        let s = JavaString::from("a\0b");
        assert_eq!(s.to_modified_utf8(), vec![b'a', 0xC0, 0x80, b'b']);
        assert_eq!(JavaString::from_modified_utf8(&s.to_modified_utf8()).unwrap(), s);
    }

    #[test]
    fn supplementary_characters_are_surrogate_pairs() {
        let s = JavaString::from("\u{1F600}");
        let encoded = s.to_modified_utf8();
        // two 3-byte surrogates, never a 4-byte sequence
        assert_eq!(encoded.len(), 6);
        assert_eq!(encoded[0], 0xED);
        assert_eq!(JavaString::from_modified_utf8(&encoded).unwrap().to_string_lossy(), "\u{1F600}");
    }

    #[test]
    fn lone_surrogate_survives() {
        let s = JavaString::from_units(vec![0xD800, 'x' as u16]);
        let decoded = JavaString::from_modified_utf8(&s.to_modified_utf8()).unwrap();
        assert_eq!(decoded.units(), &[0xD800, 'x' as u16]);
    }

    #[test]
    fn truncated_sequence_is_rejected() {
        assert!(JavaString::from_modified_utf8(&[b'a', 0xE2, 0x82]).is_err());
    }
}

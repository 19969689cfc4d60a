//! Bluetooth UUIDs ([Vol 3] Part B, Section 2.5.1).

use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use structbuf::Packer;

/// A 16-bit or 128-bit UUID stored in little-endian byte order.
///
/// Equality is byte-exact and length-preserving. The two widths never
/// compare equal, even when one is the 16-bit alias of the other.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub enum Uuid {
    /// 16-bit assigned number.
    U16([u8; 2]),
    /// Full 128-bit UUID.
    U128([u8; 16]),
}

impl Uuid {
    /// Primary Service declaration.
    pub const PRIMARY_SERVICE: Self = Self::u16(0x2800);
    /// Secondary Service declaration.
    pub const SECONDARY_SERVICE: Self = Self::u16(0x2801);
    /// Include declaration.
    pub const INCLUDE: Self = Self::u16(0x2802);
    /// Characteristic declaration.
    pub const CHARACTERISTIC: Self = Self::u16(0x2803);
    /// Client Characteristic Configuration descriptor.
    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Self = Self::u16(0x2902);
    /// Generic Access service.
    pub const GAP_SERVICE: Self = Self::u16(0x1800);
    /// Generic Attribute service.
    pub const GATT_SERVICE: Self = Self::u16(0x1801);
    /// Device Name characteristic.
    pub const DEVICE_NAME: Self = Self::u16(0x2A00);
    /// Appearance characteristic.
    pub const APPEARANCE: Self = Self::u16(0x2A01);

    /// Creates a UUID from a 16-bit assigned number.
    #[inline]
    #[must_use]
    pub const fn u16(v: u16) -> Self {
        Self::U16(v.to_le_bytes())
    }

    /// Creates a UUID from a 128-bit value.
    #[inline]
    #[must_use]
    pub const fn u128(v: u128) -> Self {
        Self::U128(v.to_le_bytes())
    }

    /// Creates a UUID from little-endian wire bytes. Returns `None` unless
    /// the slice is exactly 2 or 16 bytes long.
    #[must_use]
    pub fn from_le_bytes(b: &[u8]) -> Option<Self> {
        match *b {
            [a, b] => Some(Self::U16([a, b])),
            _ => Some(Self::U128(<[u8; 16]>::try_from(b).ok()?)),
        }
    }

    /// Returns the wire length in bytes (2 or 16).
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        match *self {
            Self::U16(_) => 2,
            Self::U128(_) => 16,
        }
    }

    /// Returns the little-endian wire bytes.
    #[inline]
    #[must_use]
    pub fn as_le_bytes(&self) -> &[u8] {
        match *self {
            Self::U16(ref b) => b,
            Self::U128(ref b) => b,
        }
    }

    /// Returns the 16-bit assigned number or `None` for a 128-bit UUID.
    #[inline]
    #[must_use]
    pub const fn as_u16(&self) -> Option<u16> {
        match *self {
            Self::U16(b) => Some(u16::from_le_bytes(b)),
            Self::U128(_) => None,
        }
    }

    /// Appends the little-endian wire bytes to `p`.
    #[inline]
    pub fn pack(&self, p: &mut Packer) {
        p.put(self.as_le_bytes());
    }
}

impl Debug for Uuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Big-endian hex, the standard printed form
        match *self {
            Self::U16(b) => write!(f, "{:04X}", u16::from_le_bytes(b)),
            Self::U128(b) => {
                for v in b.iter().rev() {
                    write!(f, "{v:02X}")?;
                }
                Ok(())
            }
        }
    }
}

impl Display for Uuid {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl From<u16> for Uuid {
    #[inline]
    fn from(v: u16) -> Self {
        Self::u16(v)
    }
}

impl From<u128> for Uuid {
    #[inline]
    fn from(v: u128) -> Self {
        Self::u128(v)
    }
}

/// Error returned when parsing an invalid UUID string.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("invalid UUID string")]
pub struct ParseUuidError;

impl FromStr for Uuid {
    type Err = ParseUuidError;

    /// Parses `"2902"` and `"09fc95c0-c111-11e3-9904-0002a5d5c51b"` forms,
    /// with or without hyphens.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|&c| c != '-').collect();
        let parse = |s: &str| u8::from_str_radix(s, 16).map_err(|_| ParseUuidError);
        match hex.len() {
            4 => {
                let mut b = [0; 2];
                for (i, v) in b.iter_mut().enumerate() {
                    *v = parse(&hex[i * 2..i * 2 + 2])?;
                }
                // String form is big-endian
                Ok(Self::U16([b[1], b[0]]))
            }
            32 => {
                let mut b = [0; 16];
                for (i, v) in b.iter_mut().enumerate() {
                    // Reverse to little-endian storage
                    *v = parse(&hex[(15 - i) * 2..(15 - i) * 2 + 2])?;
                }
                Ok(Self::U128(b))
            }
            _ => Err(ParseUuidError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_never_equal() {
        // 0x1800 promoted to 128 bits via the Bluetooth base UUID
        let short = Uuid::u16(0x1800);
        let long = Uuid::u128(0x0000_1800_0000_1000_8000_0080_5F9B_34FB);
        assert_ne!(short, long);
        assert_eq!(short.len(), 2);
        assert_eq!(long.len(), 16);
    }

    #[test]
    fn wire_order() {
        assert_eq!(Uuid::u16(0x2902).as_le_bytes(), &[0x02, 0x29]);
        assert_eq!(Uuid::from_le_bytes(&[0x02, 0x29]), Some(Uuid::u16(0x2902)));
        assert_eq!(Uuid::from_le_bytes(&[1, 2, 3]), None);
    }

    #[test]
    fn parse() {
        assert_eq!("2902".parse(), Ok(Uuid::u16(0x2902)));
        let u: Uuid = "09fc95c0-c111-11e3-9904-0002a5d5c51b".parse().unwrap();
        assert_eq!(u.len(), 16);
        assert_eq!(u.to_string(), "09FC95C0C11111E399040002A5D5C51B");
        assert!("29".parse::<Uuid>().is_err());
    }
}

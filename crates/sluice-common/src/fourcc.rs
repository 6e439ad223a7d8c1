use std::fmt;

use serde::Serialize;

/// A four-character code, the compact key used for builtin properties
/// and capability values.
///
/// Codes are stored big-endian so that `FourCC::new(*b"vide")` prints
/// as `vide` and compares in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FourCC(pub u32);

impl FourCC {
    pub const fn new(tag: [u8; 4]) -> Self {
        FourCC(u32::from_be_bytes(tag))
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Parse a 4-character ASCII tag, e.g. from a source-ID fragment.
    pub fn parse(s: &str) -> Option<Self> {
        let b = s.as_bytes();
        if b.len() != 4 || !b.iter().all(|c| c.is_ascii_graphic() || *c == b' ') {
            return None;
        }
        Some(FourCC::new([b[0], b[1], b[2], b[3]]))
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.to_bytes() {
            let c = if c.is_ascii_graphic() || c == b' ' {
                c as char
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let cc = FourCC::new(*b"vide");
        assert_eq!(cc.to_bytes(), *b"vide");
        assert_eq!(cc.to_string(), "vide");
    }

    #[test]
    fn parse_valid() {
        assert_eq!(FourCC::parse("auds"), Some(FourCC::new(*b"auds")));
        assert_eq!(FourCC::parse("au"), None);
        assert_eq!(FourCC::parse("toolong"), None);
    }

    #[test]
    fn ordering_is_declaration_order() {
        assert!(FourCC::new(*b"aaaa") < FourCC::new(*b"aaab"));
    }
}

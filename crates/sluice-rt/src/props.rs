//! Typed property values and their keys.
//!
//! Properties are attached to PIDs and packets through shared maps
//! ([`crate::prop_map::PropMap`]). A key is either a four-character
//! code (builtin properties, capability keys) or a free-form string
//! name; both live in the same namespace.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use sluice_common::{FourCC, Fraction, Fraction64};

/// Builtin property codes understood by the runtime itself.
///
/// Filter authors are free to define additional codes; only these have
/// runtime-side behavior attached (timescale shortcut, decoder-input
/// detection, source-ID stream selectors, PID naming).
pub mod keys {
    use sluice_common::FourCC;

    /// `u32` identifier of the pipe within its source filter.
    pub const PID_ID: FourCC = FourCC::new(*b"plid");
    /// `u32` timescale in ticks per second for all packet timestamps.
    pub const TIMESCALE: FourCC = FourCC::new(*b"tmcs");
    /// `u32` stream classification, see [`sluice_common::StreamType`].
    pub const STREAM_TYPE: FourCC = FourCC::new(*b"styp");
    /// `u32` coding format identifier; `0` means uncompressed.
    pub const CODEC_ID: FourCC = FourCC::new(*b"codi");
    /// `u32` ID of the pipe this one depends on (e.g. enhancement layers).
    pub const DEPENDENCY_ID: FourCC = FourCC::new(*b"depi");
    /// String MIME type of the stream.
    pub const MIME: FourCC = FourCC::new(*b"mime");
    /// String file extension hint for file pipes.
    pub const FILE_EXT: FourCC = FourCC::new(*b"fext");
    /// String source or destination URL.
    pub const URL: FourCC = FourCC::new(*b"furl");
    /// Fraction media duration.
    pub const DURATION: FourCC = FourCC::new(*b"pdur");
    /// `u64` average bit rate in bits per second.
    pub const BITRATE: FourCC = FourCC::new(*b"brat");

    /// Resolve a human name (as used in source-ID fragments) to a code.
    pub fn by_name(name: &str) -> Option<FourCC> {
        match name {
            "ID" | "id" => Some(PID_ID),
            "Timescale" | "timescale" => Some(TIMESCALE),
            "StreamType" | "streamtype" => Some(STREAM_TYPE),
            "CodecID" | "codecid" => Some(CODEC_ID),
            "DependencyID" | "dependencyid" => Some(DEPENDENCY_ID),
            "MIMEType" | "mime" => Some(MIME),
            "Extension" | "ext" => Some(FILE_EXT),
            "URL" | "url" => Some(URL),
            "Duration" | "duration" => Some(DURATION),
            "Bitrate" | "bitrate" => Some(BITRATE),
            _ => None,
        }
    }
}

/// Key of a property: a builtin/registered 4CC or a string name.
///
/// Codes and names share one namespace: every name-based entry point
/// resolves through [`PropKey::resolve`], so `"Timescale"`, `"tmcs"`
/// and [`keys::TIMESCALE`] all address the same property.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropKey {
    Code(FourCC),
    Name(Arc<str>),
}

impl PropKey {
    /// Raw string key, no builtin resolution. Prefer
    /// [`PropKey::resolve`] for anything user-supplied.
    pub fn name(name: &str) -> Self {
        PropKey::Name(Arc::from(name))
    }

    /// Resolve a textual key into the shared namespace: builtin names
    /// map to their code, 4-character tags are codes, anything else is
    /// a string key.
    pub fn resolve(name: &str) -> Self {
        match keys::by_name(name).or_else(|| FourCC::parse(name)) {
            Some(code) => PropKey::Code(code),
            None => PropKey::name(name),
        }
    }

    pub fn as_code(&self) -> Option<FourCC> {
        match self {
            PropKey::Code(c) => Some(*c),
            PropKey::Name(_) => None,
        }
    }
}

impl From<FourCC> for PropKey {
    fn from(c: FourCC) -> Self {
        PropKey::Code(c)
    }
}

impl From<&str> for PropKey {
    fn from(name: &str) -> Self {
        PropKey::resolve(name)
    }
}

impl fmt::Display for PropKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropKey::Code(c) => write!(f, "{c}"),
            PropKey::Name(n) => f.write_str(n),
        }
    }
}

/// Integer 2-component vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vec2i {
    pub x: i32,
    pub y: i32,
}

/// Integer 3-component vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vec3i {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

/// Integer 4-component vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vec4i {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub w: i32,
}

/// Float 2-component vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec2f {
    pub x: f64,
    pub y: f64,
}

/// Float 3-component vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec3f {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// A property value. Equality is elementwise; strings and data blobs
/// compare by content.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Bool(bool),
    Sint(i32),
    Uint(u32),
    Long(i64),
    Ulong(u64),
    Float(f32),
    Double(f64),
    Fraction(Fraction),
    Fraction64(Fraction64),
    Vec2i(Vec2i),
    Vec3i(Vec3i),
    Vec4i(Vec4i),
    Vec2(Vec2f),
    Vec3(Vec3f),
    FourCC(FourCC),
    /// Owning and borrowed strings collapse into one owning variant;
    /// names interned by the caller use `Name`.
    String(String),
    Name(&'static str),
    /// Byte payload; `Bytes` covers both owning and shared slices.
    Data(Bytes),
    /// Opaque pointer-sized value for out-of-band exchanges.
    Pointer(usize),
    UintList(Vec<u32>),
    SintList(Vec<i32>),
    FourCCList(Vec<FourCC>),
    StringList(Vec<String>),
    Vec2iList(Vec<Vec2i>),
}

impl PropValue {
    pub fn as_uint(&self) -> Option<u32> {
        match self {
            PropValue::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::String(s) => Some(s),
            PropValue::Name(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ulong(&self) -> Option<u64> {
        match self {
            PropValue::Ulong(v) => Some(*v),
            PropValue::Uint(v) => Some(*v as u64),
            _ => None,
        }
    }

    /// Parse `text` as the same variant as `self`. Used by source-ID
    /// property tests (`name=value`, `name-value`, `name+value`) where
    /// the expected type comes from the property already on the PID.
    pub fn parse_like(&self, text: &str) -> Option<PropValue> {
        let v = match self {
            PropValue::Bool(_) => PropValue::Bool(matches!(text, "1" | "true" | "yes")),
            PropValue::Sint(_) => PropValue::Sint(text.parse().ok()?),
            PropValue::Uint(_) => PropValue::Uint(text.parse().ok()?),
            PropValue::Long(_) => PropValue::Long(text.parse().ok()?),
            PropValue::Ulong(_) => PropValue::Ulong(text.parse().ok()?),
            PropValue::Float(_) => PropValue::Float(text.parse().ok()?),
            PropValue::Double(_) => PropValue::Double(text.parse().ok()?),
            PropValue::Fraction(_) => {
                let (num, den) = match text.split_once('/') {
                    Some((n, d)) => (n.parse().ok()?, d.parse().ok()?),
                    None => (text.parse().ok()?, 1),
                };
                PropValue::Fraction(Fraction::new(num, den))
            }
            PropValue::FourCC(_) => PropValue::FourCC(FourCC::parse(text)?),
            PropValue::String(_) | PropValue::Name(_) => PropValue::String(text.to_string()),
            _ => return None,
        };
        Some(v)
    }

    /// Numeric less-than across the ordered variants, used by the `-`
    /// and `+` source-ID comparators. Non-numeric variants compare as
    /// always-less (callers treat that as a match, mirroring the
    /// permissive original behavior).
    pub fn less_than(&self, other: &PropValue) -> bool {
        match (self, other) {
            (PropValue::Sint(a), PropValue::Sint(b)) => a < b,
            (PropValue::Uint(a), PropValue::Uint(b)) => a < b,
            (PropValue::Long(a), PropValue::Long(b)) => a < b,
            (PropValue::Ulong(a), PropValue::Ulong(b)) => a < b,
            (PropValue::Float(a), PropValue::Float(b)) => a < b,
            (PropValue::Double(a), PropValue::Double(b)) => a < b,
            (PropValue::Fraction(a), PropValue::Fraction(b)) => {
                a.cmp_value(*b) == std::cmp::Ordering::Less
            }
            _ => true,
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Bool(v) => write!(f, "{v}"),
            PropValue::Sint(v) => write!(f, "{v}"),
            PropValue::Uint(v) => write!(f, "{v}"),
            PropValue::Long(v) => write!(f, "{v}"),
            PropValue::Ulong(v) => write!(f, "{v}"),
            PropValue::Float(v) => write!(f, "{v}"),
            PropValue::Double(v) => write!(f, "{v}"),
            PropValue::Fraction(v) => write!(f, "{v}"),
            PropValue::Fraction64(v) => write!(f, "{v}"),
            PropValue::Vec2i(v) => write!(f, "{}x{}", v.x, v.y),
            PropValue::Vec3i(v) => write!(f, "{}x{}x{}", v.x, v.y, v.z),
            PropValue::Vec4i(v) => write!(f, "{}x{}x{}x{}", v.x, v.y, v.z, v.w),
            PropValue::Vec2(v) => write!(f, "{}x{}", v.x, v.y),
            PropValue::Vec3(v) => write!(f, "{}x{}x{}", v.x, v.y, v.z),
            PropValue::FourCC(v) => write!(f, "{v}"),
            PropValue::String(v) => f.write_str(v),
            PropValue::Name(v) => f.write_str(v),
            PropValue::Data(v) => write!(f, "{} bytes", v.len()),
            PropValue::Pointer(v) => write!(f, "{v:#x}"),
            PropValue::UintList(v) => write!(f, "{v:?}"),
            PropValue::SintList(v) => write!(f, "{v:?}"),
            PropValue::FourCCList(v) => {
                let names: Vec<String> = v.iter().map(|c| c.to_string()).collect();
                write!(f, "[{}]", names.join(","))
            }
            PropValue::StringList(v) => write!(f, "{v:?}"),
            PropValue::Vec2iList(v) => {
                let items: Vec<String> = v.iter().map(|p| format!("{}x{}", p.x, p.y)).collect();
                write!(f, "[{}]", items.join(","))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_elementwise() {
        assert_eq!(PropValue::Uint(3), PropValue::Uint(3));
        assert_ne!(PropValue::Uint(3), PropValue::Sint(3));
        assert_eq!(
            PropValue::UintList(vec![1, 2, 3]),
            PropValue::UintList(vec![1, 2, 3])
        );
        assert_ne!(
            PropValue::UintList(vec![1, 2, 3]),
            PropValue::UintList(vec![1, 2])
        );
    }

    #[test]
    fn string_and_data_compare_by_content() {
        assert_eq!(
            PropValue::String("h264".into()),
            PropValue::String("h264".into())
        );
        assert_eq!(
            PropValue::Data(Bytes::from_static(b"abc")),
            PropValue::Data(Bytes::copy_from_slice(b"abc"))
        );
    }

    #[test]
    fn parse_like_follows_variant() {
        let p = PropValue::Uint(0).parse_like("42").unwrap();
        assert_eq!(p, PropValue::Uint(42));
        let p = PropValue::Fraction(Fraction::new(1, 1))
            .parse_like("30000/1001")
            .unwrap();
        assert_eq!(p, PropValue::Fraction(Fraction::new(30000, 1001)));
        assert!(PropValue::Uint(0).parse_like("nope").is_none());
    }

    #[test]
    fn less_than_numeric() {
        assert!(PropValue::Uint(1).less_than(&PropValue::Uint(2)));
        assert!(!PropValue::Uint(2).less_than(&PropValue::Uint(1)));
        assert!(PropValue::Fraction(Fraction::new(1, 2))
            .less_than(&PropValue::Fraction(Fraction::new(2, 3))));
    }

    #[test]
    fn key_namespace_is_shared() {
        // builtin names, their 4CC tags and the code constants all
        // resolve to the same key
        assert_eq!(
            PropKey::resolve("timescale"),
            PropKey::Code(keys::TIMESCALE)
        );
        assert_eq!(
            PropKey::resolve("Timescale"),
            PropKey::Code(keys::TIMESCALE)
        );
        assert_eq!(PropKey::resolve("tmcs"), PropKey::Code(keys::TIMESCALE));
        assert_eq!(PropKey::from("CodecID"), PropKey::Code(keys::CODEC_ID));
        // longer free-form names stay string keys
        assert_eq!(
            PropKey::resolve("custom-flag"),
            PropKey::name("custom-flag")
        );
    }
}

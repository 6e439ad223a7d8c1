use std::fmt;

use serde::Serialize;

/// Builtin stream classification carried in the `StreamType` PID
/// property and used by source-ID selectors (`#audio`, `#video2`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum StreamType {
    Unknown = 0,
    /// Multiplexed or not-yet-demultiplexed byte stream.
    File = 1,
    Audio = 2,
    Visual = 3,
    Scene = 4,
    Text = 5,
    Font = 6,
    Metadata = 7,
}

impl StreamType {
    pub fn from_u32(v: u32) -> StreamType {
        match v {
            1 => StreamType::File,
            2 => StreamType::Audio,
            3 => StreamType::Visual,
            4 => StreamType::Scene,
            5 => StreamType::Text,
            6 => StreamType::Font,
            7 => StreamType::Metadata,
            _ => StreamType::Unknown,
        }
    }

    /// Match a source-ID selector prefix. Returns the matched prefix
    /// length so callers can parse a trailing 1-based index.
    pub fn from_selector(name: &str) -> Option<(StreamType, usize)> {
        const SELECTORS: [(&str, StreamType); 5] = [
            ("audio", StreamType::Audio),
            ("video", StreamType::Visual),
            ("scene", StreamType::Scene),
            ("text", StreamType::Text),
            ("font", StreamType::Font),
        ];
        for (prefix, ty) in SELECTORS {
            if name.len() >= prefix.len() && name[..prefix.len()].eq_ignore_ascii_case(prefix) {
                return Some((ty, prefix.len()));
            }
        }
        None
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamType::Unknown => "unknown",
            StreamType::File => "file",
            StreamType::Audio => "audio",
            StreamType::Visual => "video",
            StreamType::Scene => "scene",
            StreamType::Text => "text",
            StreamType::Font => "font",
            StreamType::Metadata => "metadata",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_roundtrip() {
        for v in 0..=8 {
            let ty = StreamType::from_u32(v);
            if v >= 1 && v <= 7 {
                assert_eq!(ty as u32, v);
            } else {
                assert_eq!(ty, StreamType::Unknown);
            }
        }
    }

    #[test]
    fn selector_parsing() {
        assert_eq!(
            StreamType::from_selector("video2"),
            Some((StreamType::Visual, 5))
        );
        assert_eq!(
            StreamType::from_selector("audio"),
            Some((StreamType::Audio, 5))
        );
        assert_eq!(StreamType::from_selector("subtitle"), None);
    }
}

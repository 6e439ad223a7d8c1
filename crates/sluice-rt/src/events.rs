//! Events routed across the graph.
//!
//! Events travel **downstream** (toward sources: a sink posts `Play`,
//! every upstream filter sees it on its input PIDs) or **upstream**
//! (toward sinks, from a source filter's outputs). Any filter may
//! cancel propagation by returning `true` from
//! [`crate::filter::FilterImpl::process_event`].
//!
//! Dispatch itself is task-based and lives with the session; this
//! module only defines the payload.

use std::sync::Arc;

use crate::pid::Pid;

/// Flags of a `Play` request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayFlags {
    /// Resume from a paused state without reset.
    pub initial_broadcast_play: bool,
    /// Timestamps need no rescaling to the new range.
    pub no_timestamp_rebase: bool,
}

/// The event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Play {
        start_range: f64,
        speed: f64,
        flags: PlayFlags,
    },
    Stop,
    Pause,
    Resume,
    SetSpeed {
        speed: f64,
    },
    SourceSeek {
        start_offset: u64,
        end_offset: u64,
        switch_url: Option<String>,
        skip_cache_expiration: bool,
        hint_block_size: u32,
    },
    SourceSwitch {
        url: String,
    },
    SegmentSize {
        seg_url: Option<String>,
        media_range_start: u64,
        media_range_end: u64,
        is_init: bool,
    },
    QualitySwitch {
        up: bool,
        dependent_group_index: u32,
        quality_index: i32,
        tile_mode: u32,
        quality_degradation: u32,
    },
    VisibilityHint {
        min_x: u32,
        min_y: u32,
        max_x: u32,
        max_y: u32,
        is_gaze: bool,
    },
    InfoUpdate,
    BufferReq {
        max_buffer_us: u64,
        max_playout_us: u64,
        min_playout_us: u64,
        /// Apply to the target PID only, do not propagate further.
        pid_only: bool,
    },
    /// Interaction event forwarded from the embedding application; the
    /// runtime routes it without interpreting the code.
    User {
        code: u32,
        payload: Option<String>,
    },
    CapsChange,
    ConnectFail,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Play { .. } => "Play",
            EventKind::Stop => "Stop",
            EventKind::Pause => "Pause",
            EventKind::Resume => "Resume",
            EventKind::SetSpeed { .. } => "SetSpeed",
            EventKind::SourceSeek { .. } => "SourceSeek",
            EventKind::SourceSwitch { .. } => "SourceSwitch",
            EventKind::SegmentSize { .. } => "SegmentSize",
            EventKind::QualitySwitch { .. } => "QualitySwitch",
            EventKind::VisibilityHint { .. } => "VisibilityHint",
            EventKind::InfoUpdate => "InfoUpdate",
            EventKind::BufferReq { .. } => "BufferReq",
            EventKind::User { .. } => "User",
            EventKind::CapsChange => "CapsChange",
            EventKind::ConnectFail => "ConnectFail",
        }
    }
}

/// An event plus its optional target PID (output side).
#[derive(Debug, Clone)]
pub struct Event {
    pub on_pid: Option<Arc<Pid>>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Event { on_pid: None, kind }
    }

    pub fn on(pid: Arc<Pid>, kind: EventKind) -> Self {
        Event {
            on_pid: Some(pid),
            kind,
        }
    }

    /// Play helper with default flags.
    pub fn play(start_range: f64, speed: f64) -> EventKind {
        EventKind::Play {
            start_range,
            speed,
            flags: PlayFlags::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(Event::play(0.0, 1.0).name(), "Play");
        assert_eq!(EventKind::Stop.name(), "Stop");
        assert_eq!(
            EventKind::BufferReq {
                max_buffer_us: 1,
                max_playout_us: 0,
                min_playout_us: 0,
                pid_only: false
            }
            .name(),
            "BufferReq"
        );
    }
}

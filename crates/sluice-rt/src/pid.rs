//! Output PIDs and their per-consumer instances.
//!
//! The output side of a pipe ([`Pid`]) belongs to exactly one filter.
//! Each consuming filter sees it through a [`PidInstance`] holding the
//! instance's packet FIFO, reassembly state, property snapshot and
//! buffer accounting. Blocking is decided on the output side: a PID
//! blocks its producer when a destination buffer exceeds the unit or
//! duration budget, scaled by the playback speed.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use sluice_common::Result;

use crate::events::{Event, EventKind};
use crate::filter::Filter;
use crate::packet::{
    self, ClockType, CommandType, Packet, PacketCore, PacketInstance, PacketRef, PckFlags,
    PckPayload, NO_TS,
};
use crate::prop_map::PropMap;
use crate::props::{keys, PropKey, PropValue};
use crate::queue::FilterQueue;

/// Playback speed is stored in thousandths so the blocking predicate
/// stays in integer arithmetic.
pub const SPEED_SCALER: u64 = 1000;

/// Timestamp-reconstruction state, touched only by the dispatch path.
#[derive(Debug, Default)]
pub(crate) struct PidTiming {
    pub last_pck_dts: u64,
    pub last_pck_cts: u64,
    pub min_pck_cts: u64,
    pub max_pck_cts: u64,
    pub min_pck_duration: u64,
    pub nb_unreliable_dts: u32,
    pub duration_init: bool,
    pub recompute_dts: bool,
}

impl PidTiming {
    pub(crate) fn reset_for_discontinuity(&mut self) {
        self.duration_init = false;
        self.min_pck_cts = 0;
        self.max_pck_cts = 0;
        self.nb_unreliable_dts = 0;
    }
}

/// Last clock reference consumed on an instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockInfo {
    pub value: u64,
    pub timescale: u32,
    pub clock_type: ClockType,
}

/// Consumption statistics of a PID instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct PidInstStats {
    pub nb_processed: u64,
    pub bytes_processed: u64,
    pub nb_sap_processed: u64,
    pub avg_bit_rate: u64,
    pub max_bit_rate: u64,
    pub first_pck_time_us: u64,
    pub last_pck_time_us: u64,
}

/// The output side of a pipe.
pub struct Pid {
    pub(crate) name: Mutex<String>,
    pub(crate) filter: Weak<Filter>,
    pub(crate) destinations: RwLock<Vec<Arc<PidInstance>>>,
    /// Property maps, most recent last. Maps are purged when their
    /// regular refcount dies.
    pub(crate) properties: Mutex<Vec<Arc<PropMap>>>,
    pub(crate) request_property_map: AtomicBool,
    pub(crate) props_changed_since_connect: AtomicBool,
    pub(crate) pid_info_changed: AtomicBool,
    pub(crate) nb_shared_packets_out: AtomicU32,
    pub(crate) nb_buffer_unit: AtomicU32,
    pub(crate) buffer_duration: AtomicI64,
    pub(crate) max_buffer_unit: AtomicU32,
    pub(crate) max_buffer_time: AtomicU64,
    pub(crate) user_max_buffer_time: AtomicU64,
    pub(crate) would_block_flag: AtomicU32,
    pub(crate) playback_speed_scaler: AtomicU64,
    pub(crate) has_seen_eos: AtomicBool,
    pub(crate) is_playing: AtomicBool,
    pub(crate) initial_play_done: AtomicBool,
    pub(crate) discard_input_packets: AtomicU32,
    pub(crate) init_task_pending: AtomicU32,
    pub(crate) destroyed: AtomicBool,
    pub(crate) raw_media: AtomicBool,
    pub(crate) nb_decoder_inputs: AtomicU32,
    pub(crate) nb_pck_sent: AtomicU64,
    pub(crate) nb_reaggregation_pending: AtomicU32,
    pub(crate) not_connected_ok: AtomicBool,
    pub(crate) timing: Mutex<PidTiming>,
    /// Registry names excluded as adaptation filters for this pid.
    pub(crate) adapters_blacklist: Mutex<Vec<String>>,
    /// Properties requested by a consumer, applied through the owner's
    /// `reconfigure_output` before the next connection pass.
    pub(crate) caps_negotiate: Mutex<Option<Arc<PropMap>>>,
}

impl Pid {
    pub(crate) fn new(filter: &Arc<Filter>, name: String) -> Arc<Pid> {
        Arc::new(Pid {
            name: Mutex::new(name),
            filter: Arc::downgrade(filter),
            destinations: RwLock::new(Vec::new()),
            properties: Mutex::new(Vec::new()),
            request_property_map: AtomicBool::new(true),
            props_changed_since_connect: AtomicBool::new(false),
            pid_info_changed: AtomicBool::new(false),
            nb_shared_packets_out: AtomicU32::new(0),
            nb_buffer_unit: AtomicU32::new(0),
            buffer_duration: AtomicI64::new(0),
            max_buffer_unit: AtomicU32::new(0),
            max_buffer_time: AtomicU64::new(0),
            user_max_buffer_time: AtomicU64::new(0),
            would_block_flag: AtomicU32::new(0),
            playback_speed_scaler: AtomicU64::new(SPEED_SCALER),
            has_seen_eos: AtomicBool::new(false),
            is_playing: AtomicBool::new(false),
            initial_play_done: AtomicBool::new(false),
            discard_input_packets: AtomicU32::new(0),
            init_task_pending: AtomicU32::new(0),
            destroyed: AtomicBool::new(false),
            raw_media: AtomicBool::new(false),
            nb_decoder_inputs: AtomicU32::new(0),
            nb_pck_sent: AtomicU64::new(0),
            nb_reaggregation_pending: AtomicU32::new(0),
            not_connected_ok: AtomicBool::new(false),
            timing: Mutex::new(PidTiming::default()),
            adapters_blacklist: Mutex::new(Vec::new()),
            caps_negotiate: Mutex::new(None),
        })
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = name.into();
    }

    pub fn filter(&self) -> Option<Arc<Filter>> {
        self.filter.upgrade()
    }

    pub fn num_destinations(&self) -> usize {
        self.destinations.read().len()
    }

    // -----------------------------------------------------------------
    // properties (copy-on-write at map granularity)
    // -----------------------------------------------------------------

    /// Most recent property map, if any.
    pub(crate) fn current_props(&self) -> Option<Arc<PropMap>> {
        self.properties.lock().last().cloned()
    }

    /// Map receiving the next write: the current one, or a fresh map
    /// (carrying over the old entries) when a dispatch has frozen it.
    pub(crate) fn check_new_props(&self, merge: bool) -> Arc<PropMap> {
        self.props_changed_since_connect.store(true, Ordering::Release);
        let mut list = self.properties.lock();
        if !self.request_property_map.swap(false, Ordering::AcqRel) {
            if let Some(last) = list.last() {
                return Arc::clone(last);
            }
        }
        self.pid_info_changed.store(true, Ordering::Release);
        let map = Arc::new(PropMap::new());
        let old = list.last().cloned();
        list.push(Arc::clone(&map));
        if let Some(old_map) = old {
            if merge {
                map.merge_from(&old_map, None);
            }
            if old_map.release() {
                list.retain(|m| !Arc::ptr_eq(m, &old_map));
            }
        }
        map
    }

    /// Set a property, opening a new map when the previous one was
    /// already dispatched.
    pub fn set_property(&self, key: impl Into<PropKey>, value: Option<PropValue>) -> Result<()> {
        let key = key.into();
        let map = self.check_new_props(true);
        if let (PropKey::Code(code), Some(v)) = (&key, &value) {
            if *code == keys::PID_ID {
                if let Some(id) = v.as_uint() {
                    self.set_name(format!("PID{id}"));
                }
            }
        }
        map.set(key, value);
        Ok(())
    }

    pub fn set_property_str(&self, name: &str, value: Option<PropValue>) -> Result<()> {
        self.set_property(PropKey::resolve(name), value)
    }

    /// Set an info property in place; never opens a new map and never
    /// triggers reconfiguration.
    pub fn set_info(&self, key: impl Into<PropKey>, value: Option<PropValue>) -> Result<()> {
        let map = {
            let mut list = self.properties.lock();
            if let Some(last) = list.last() {
                Arc::clone(last)
            } else {
                let map = Arc::new(PropMap::new());
                list.push(Arc::clone(&map));
                map
            }
        };
        self.pid_info_changed.store(true, Ordering::Release);
        map.set(key.into(), value);
        Ok(())
    }

    /// Drop every property of the upcoming map.
    pub fn reset_properties(&self) -> Result<()> {
        let map = self.check_new_props(false);
        map.reset();
        Ok(())
    }

    /// Copy all current properties of `src` into this pid's next map.
    pub fn copy_properties(&self, src: &Pid) -> Result<()> {
        let map = self.check_new_props(false);
        map.reset();
        if let Some(src_map) = src.current_props() {
            map.merge_from(&src_map, None);
        }
        Ok(())
    }

    pub fn get_property(&self, code: sluice_common::FourCC) -> Option<PropValue> {
        self.get_property_key(&PropKey::Code(code))
    }

    pub fn get_property_str(&self, name: &str) -> Option<PropValue> {
        self.get_property_key(&PropKey::resolve(name))
    }

    pub fn get_property_key(&self, key: &PropKey) -> Option<PropValue> {
        self.current_props().and_then(|m| m.get(key))
    }

    /// Info lookup: recurses into the parent chain when the property
    /// is not set locally.
    pub fn get_info(&self, key: &PropKey) -> Option<PropValue> {
        if let Some(v) = self.get_property_key(key) {
            return Some(v);
        }
        let filter = self.filter()?;
        for inst in filter.inputs.lock().iter() {
            if let Some(pid) = inst.pid() {
                if let Some(v) = pid.get_info(key) {
                    return Some(v);
                }
            }
        }
        None
    }

    pub fn enum_properties(&self, idx: usize) -> Option<(PropKey, PropValue)> {
        self.current_props().and_then(|m| m.nth(idx))
    }

    /// Remove a dead map from the property list.
    pub(crate) fn purge_property_map(&self, map: &Arc<PropMap>) {
        self.properties.lock().retain(|m| !Arc::ptr_eq(m, map));
    }

    /// Property value requested by a consumer renegotiation, read by
    /// `reconfigure_output` implementations.
    pub fn caps_query(&self, key: &PropKey) -> Option<PropValue> {
        self.caps_negotiate.lock().as_ref().and_then(|m| m.get(key))
    }

    pub fn timescale(&self) -> u32 {
        self.current_props().map(|m| m.timescale()).unwrap_or(0)
    }

    // -----------------------------------------------------------------
    // packet allocation
    // -----------------------------------------------------------------

    pub fn new_packet_alloc(self: &Arc<Pid>, size: usize) -> Option<Packet> {
        let filter = self.filter()?;
        filter.new_packet_alloc(self, size)
    }

    /// Wrap caller-shared bytes; `on_release` fires when the last
    /// reference dies so the producer can recycle its memory.
    pub fn new_packet_shared(
        self: &Arc<Pid>,
        data: bytes::Bytes,
        on_release: Option<Box<dyn FnOnce(&Arc<Pid>) + Send>>,
    ) -> Packet {
        let len = data.len();
        let mut pck = Packet::new(Arc::clone(self), PckPayload::Shared(data), len);
        *pck.core.destructor.lock() = on_release;
        pck.core.counts_as_shared = true;
        self.nb_shared_packets_out.fetch_add(1, Ordering::AcqRel);
        pck
    }

    /// Re-emit a byte range of a received packet without copying.
    pub fn new_packet_ref(self: &Arc<Pid>, source: &PacketRef, range: Option<(usize, usize)>) -> Packet {
        let (offset, len) = range.unwrap_or((0, source.data().len()));
        let mut pck = Packet::new(
            Arc::clone(self),
            PckPayload::RefView { offset, len },
            len,
        );
        pck.core.counts_as_shared = true;
        self.nb_shared_packets_out.fetch_add(1, Ordering::AcqRel);
        source.core.add_ref();
        source
            .core
            .pid
            .nb_shared_packets_out
            .fetch_add(1, Ordering::AcqRel);
        pck.core.reference = Some(Arc::clone(&source.core));
        pck
    }

    /// Wrap a decoded-frame interface.
    pub fn new_packet_frame_interface(
        self: &Arc<Pid>,
        ifce: Box<dyn packet::FrameInterface>,
        on_release: Option<Box<dyn FnOnce(&Arc<Pid>) + Send>>,
    ) -> Packet {
        let mut pck = Packet::new(Arc::clone(self), PckPayload::Frame(ifce), 0);
        *pck.core.destructor.lock() = on_release;
        pck.core.counts_as_shared = true;
        pck.core.readonly.store(true, Ordering::Release);
        self.nb_shared_packets_out.fetch_add(1, Ordering::AcqRel);
        pck
    }

    /// Copy-or-reference clone: deep-copies when any packet of the
    /// reference chain is shared by more than one holder or read-only,
    /// otherwise produces a lightweight reference.
    pub fn new_packet_clone(self: &Arc<Pid>, source: &PacketRef) -> Option<Packet> {
        if source.core.frame_interface().is_some() || source.core.len == 0 {
            return None;
        }
        let mut max_ref = 0u32;
        let mut readonly = false;
        let mut cur = Some(Arc::clone(&source.core));
        while let Some(core) = cur {
            if core.readonly.load(Ordering::Acquire) {
                readonly = true;
                break;
            }
            let rc = core.ref_count.load(Ordering::Acquire);
            if rc > max_ref {
                max_ref = rc;
            }
            cur = core.reference.clone();
        }
        if readonly || max_ref > 1 {
            let mut dst = self.new_packet_alloc(source.core.len)?;
            dst.data_mut().copy_from_slice(source.data());
            dst.merge_properties(&source.core);
            Some(dst)
        } else {
            let mut dst = self.new_packet_ref(source, None);
            dst.merge_properties(&source.core);
            Some(dst)
        }
    }

    /// Re-send a received packet on this pid, sharing its payload.
    pub fn forward_packet(self: &Arc<Pid>, source: &PacketRef) -> Result<()> {
        let mut pck = self.new_packet_ref(source, None);
        pck.merge_properties(&source.core);
        pck.core.info = source.core.info;
        pck.core.info.flags.remove(PckFlags::PROPS_CHANGED | PckFlags::INFO_CHANGED);
        pck.send()
    }

    // -----------------------------------------------------------------
    // end of stream
    // -----------------------------------------------------------------

    /// Signal end of stream in-band behind any buffered packets.
    pub fn set_eos(self: &Arc<Pid>) {
        if self.has_seen_eos.load(Ordering::Acquire) {
            return;
        }
        let Some(filter) = self.filter() else { return };
        info!("eos signaled on pid {} in filter {}", self.name(), filter.name());
        let mut pck = Packet::new(Arc::clone(self), PckPayload::Empty, 0);
        pck.set_framing(true, true);
        pck.core.info.flags.set_command(CommandType::Eos);
        let _ = pck.send();
    }

    pub fn has_seen_eos(&self) -> bool {
        if self.has_seen_eos.load(Ordering::Acquire) {
            return true;
        }
        if let Some(filter) = self.filter() {
            for inst in filter.inputs.lock().iter() {
                if inst.has_seen_eos() {
                    return true;
                }
            }
        }
        false
    }

    pub fn clear_eos(&self) {
        self.has_seen_eos.store(false, Ordering::Release);
    }

    // -----------------------------------------------------------------
    // blocking
    // -----------------------------------------------------------------

    /// Evaluate the blocking predicate, transitioning to blocked when
    /// a buffer budget is exceeded. Idempotent while blocked.
    pub fn update_would_block(&self) -> bool {
        let Some(filter) = self.filter() else {
            return false;
        };
        if filter.session_disable_blocking() {
            return false;
        }
        let speed = self.playback_speed_scaler.load(Ordering::Acquire);
        let max_unit = self.max_buffer_unit.load(Ordering::Acquire);
        let max_time = self.max_buffer_time.load(Ordering::Acquire);
        let mut would_block = false;
        if max_unit > 0 {
            let units = self.nb_buffer_unit.load(Ordering::Acquire) as u64;
            if units * SPEED_SCALER >= max_unit as u64 * speed {
                would_block = true;
            }
        } else if max_time > 0 {
            let dur = self.buffer_duration.load(Ordering::Acquire).max(0) as u64;
            if dur * SPEED_SCALER > max_time * speed {
                would_block = true;
            }
        }
        if would_block && self.would_block_flag.load(Ordering::Acquire) == 0 {
            self.would_block_flag.fetch_add(1, Ordering::AcqRel);
            filter.would_block.fetch_add(1, Ordering::AcqRel);
            debug!(
                "filter {} pid {} blocked ({} blocked pids on filter)",
                filter.name(),
                self.name(),
                filter.would_block.load(Ordering::Acquire)
            );
        }
        would_block
    }

    /// Inverse transition; reposts a process task when the producer
    /// regains at least one writable output.
    pub(crate) fn check_unblock(&self) {
        let Some(filter) = self.filter() else { return };
        let speed = self.playback_speed_scaler.load(Ordering::Acquire);
        let max_unit = self.max_buffer_unit.load(Ordering::Acquire);
        let max_time = self.max_buffer_time.load(Ordering::Acquire);
        let mut unblock = false;
        if max_unit > 0 {
            let units = self.nb_buffer_unit.load(Ordering::Acquire) as u64;
            if units * SPEED_SCALER < max_unit as u64 * speed {
                unblock = true;
            }
        } else {
            let dur = self.buffer_duration.load(Ordering::Acquire).max(0) as u64;
            if dur * SPEED_SCALER < max_time * speed {
                unblock = true;
            }
        }
        if unblock && self.would_block_flag.load(Ordering::Acquire) > 0 {
            self.would_block_flag.fetch_sub(1, Ordering::AcqRel);
            let was = filter.would_block.fetch_sub(1, Ordering::AcqRel);
            debug!("filter {} pid {} unblocked", filter.name(), self.name());
            if (was - 1) < filter.num_output_pids() as u32 {
                filter.post_process_task();
            }
        }
    }

    pub fn would_block(&self) -> bool {
        self.would_block_flag.load(Ordering::Acquire) > 0
    }

    pub fn set_max_buffer_us(&self, us: u64) {
        self.user_max_buffer_time.store(us, Ordering::Release);
        self.max_buffer_time.store(us, Ordering::Release);
    }

    pub fn max_buffer_us(&self) -> u64 {
        self.max_buffer_time.load(Ordering::Acquire)
    }

    /// Force DTS recomputation from CTS patterns (streams with open
    /// GOPs and no DTS signaling).
    pub fn set_recompute_dts(&self, recompute: bool) {
        self.timing.lock().recompute_dts = recompute;
    }

    /// Tolerate this pid finding no destination (probe/auxiliary
    /// outputs).
    pub fn set_loose_connect(&self) {
        self.not_connected_ok.store(true, Ordering::Release);
    }

    // -----------------------------------------------------------------
    // events
    // -----------------------------------------------------------------

    /// Send an event from this output pid toward the sinks (upstream
    /// propagation).
    pub fn send_event(self: &Arc<Pid>, kind: EventKind) {
        let Some(filter) = self.filter() else { return };
        filter.queue_upstream_event(Event::on(Arc::clone(self), kind));
    }

    /// Resolve `$num$`-style template fragments against an index.
    pub fn resolve_file_template(&self, template: &str, index: u32) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find('$') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            if let Some(end) = after.find('$') {
                let token = &after[..end];
                if token.eq_ignore_ascii_case("num") || token.eq_ignore_ascii_case("number") {
                    out.push_str(&index.to_string());
                } else if let Some(width) = token
                    .to_ascii_lowercase()
                    .strip_prefix("num%")
                    .and_then(|w| w.trim_end_matches('d').parse::<usize>().ok())
                {
                    out.push_str(&format!("{index:0width$}"));
                } else {
                    // unknown token, keep as-is
                    out.push('$');
                    out.push_str(token);
                    out.push('$');
                }
                rest = &after[end + 1..];
            } else {
                out.push('$');
                rest = after;
            }
        }
        out.push_str(rest);
        out
    }

    /// Tear this pid down on every destination: the removal travels
    /// in-band so consumers see buffered data first.
    pub fn remove(self: &Arc<Pid>) {
        if self.filter().is_none() {
            return;
        }
        let mut pck = Packet::new(Arc::clone(self), PckPayload::Empty, 0);
        pck.set_framing(true, true);
        pck.core.info.flags.set_command(CommandType::PidRemove);
        let _ = pck.send();
    }
}

// ---------------------------------------------------------------------------
// PID instance
// ---------------------------------------------------------------------------

/// The receiving side of a pid on one particular consumer filter.
pub struct PidInstance {
    pub(crate) pid: Mutex<Option<Arc<Pid>>>,
    pub(crate) filter: Mutex<Weak<Filter>>,
    pub(crate) packets: FilterQueue<Box<PacketInstance>>,
    pub(crate) reassembly: Mutex<Vec<Box<PacketInstance>>>,
    pub(crate) props: Mutex<Option<Arc<PropMap>>>,
    pub(crate) buffer_duration: AtomicI64,
    pub(crate) last_block_ended: AtomicBool,
    pub(crate) first_block_started: AtomicBool,
    pub(crate) requires_full_data_block: AtomicBool,
    pub(crate) is_decoder_input: AtomicBool,
    pub(crate) discard_packets: AtomicBool,
    pub(crate) discard_inputs: AtomicBool,
    pub(crate) handles_clock_references: AtomicBool,
    pub(crate) is_end_of_stream: AtomicBool,
    pub(crate) nb_eos_signaled: AtomicU32,
    pub(crate) nb_clocks_signaled: AtomicU32,
    pub(crate) last_clock: Mutex<ClockInfo>,
    pub(crate) stats: Mutex<PidInstStats>,
}

impl PidInstance {
    pub(crate) fn new(filter: &Arc<Filter>, pid: &Arc<Pid>, lock_free: bool) -> Arc<PidInstance> {
        Arc::new(PidInstance {
            pid: Mutex::new(Some(Arc::clone(pid))),
            filter: Mutex::new(Arc::downgrade(filter)),
            packets: FilterQueue::new(!lock_free),
            reassembly: Mutex::new(Vec::new()),
            props: Mutex::new(None),
            buffer_duration: AtomicI64::new(0),
            last_block_ended: AtomicBool::new(true),
            first_block_started: AtomicBool::new(false),
            requires_full_data_block: AtomicBool::new(false),
            is_decoder_input: AtomicBool::new(false),
            discard_packets: AtomicBool::new(false),
            discard_inputs: AtomicBool::new(false),
            handles_clock_references: AtomicBool::new(false),
            is_end_of_stream: AtomicBool::new(false),
            nb_eos_signaled: AtomicU32::new(0),
            nb_clocks_signaled: AtomicU32::new(0),
            last_clock: Mutex::new(ClockInfo::default()),
            stats: Mutex::new(PidInstStats::default()),
        })
    }

    pub fn pid(&self) -> Option<Arc<Pid>> {
        self.pid.lock().clone()
    }

    pub fn filter(&self) -> Option<Arc<Filter>> {
        self.filter.lock().upgrade()
    }

    pub fn name(&self) -> String {
        self.pid().map(|p| p.name()).unwrap_or_default()
    }

    /// Request aggregation of fragmented blocks into single packets.
    pub fn set_framing_mode(&self, full_blocks: bool) {
        self.requires_full_data_block.store(full_blocks, Ordering::Release);
    }

    /// Declare that this filter consumes clock references itself.
    pub fn set_clock_mode(&self, handles_clocks: bool) {
        self.handles_clock_references.store(handles_clocks, Ordering::Release);
    }

    pub fn set_discard_inputs(&self, discard: bool) {
        self.discard_inputs.store(discard, Ordering::Release);
    }

    pub fn last_clock(&self) -> ClockInfo {
        *self.last_clock.lock()
    }

    pub fn statistics(&self) -> PidInstStats {
        *self.stats.lock()
    }

    // -----------------------------------------------------------------
    // property views
    // -----------------------------------------------------------------

    pub fn get_property(&self, code: sluice_common::FourCC) -> Option<PropValue> {
        self.get_property_key(&PropKey::Code(code))
    }

    pub fn get_property_str(&self, name: &str) -> Option<PropValue> {
        self.get_property_key(&PropKey::resolve(name))
    }

    pub fn get_property_key(&self, key: &PropKey) -> Option<PropValue> {
        if let Some(props) = &*self.props.lock() {
            if let Some(v) = props.get(key) {
                return Some(v);
            }
        }
        self.pid().and_then(|p| p.get_property_key(key))
    }

    pub fn get_info(&self, key: &PropKey) -> Option<PropValue> {
        self.pid().and_then(|p| p.get_info(key))
    }

    /// Swap the property snapshot, releasing the previous map.
    pub(crate) fn swap_props(&self, new_props: Arc<PropMap>) {
        let mut cur = self.props.lock();
        if let Some(old) = cur.take() {
            if old.release() {
                if let Some(pid) = &*self.pid.lock() {
                    pid.purge_property_map(&old);
                }
            }
        }
        new_props.acquire();
        *cur = Some(new_props);
    }

    // -----------------------------------------------------------------
    // packet consumption
    // -----------------------------------------------------------------

    /// Fetch the head packet, filtering internal command and clock
    /// packets and applying pending property changes. Only valid from
    /// the owning filter's process callback.
    pub fn get_packet(self: &Arc<PidInstance>) -> Option<PacketRef> {
        if self.discard_packets.load(Ordering::Acquire) {
            return None;
        }
        let head = self
            .packets
            .peek_head(|inst| {
                let core = Arc::clone(inst.pck.as_ref().expect("queued instance holds packet"));
                let props_done = inst.pid_props_change_done.load(Ordering::Acquire);
                let info_done = inst.pid_info_change_done.load(Ordering::Acquire);
                let force = inst.force_full_block.load(Ordering::Acquire);
                (core, props_done, info_done, force)
            })?;
        let (core, props_done, info_done, force_full_block) = head;

        if self.filter_internal_packet(&core) {
            return self.get_packet();
        }
        self.is_end_of_stream.store(false, Ordering::Release);

        // a pending property change must be applied (reconfigure) before
        // the packet becomes visible; that runs on the next process task
        if core.info.flags.contains(PckFlags::PROPS_CHANGED) && !props_done {
            info!(
                "pid {} property change at this packet, deferring to reconfigure",
                self.name()
            );
            if let Some(filter) = self.filter() {
                filter.post_process_task();
            }
            return None;
        }

        if core.info.flags.contains(PckFlags::INFO_CHANGED) && !info_done {
            let _ = self
                .packets
                .peek_head(|inst| inst.pid_info_change_done.store(true, Ordering::Release));
            if let Some(filter) = self.filter() {
                filter.queue_info_event(Event {
                    on_pid: self.pid(),
                    kind: EventKind::InfoUpdate,
                });
            }
        }

        Some(PacketRef {
            core,
            full_block_override: force_full_block,
        })
    }

    /// Handle EOS / pid-remove / clock command packets. Returns `true`
    /// when the head packet was internal and consumed.
    fn filter_internal_packet(self: &Arc<PidInstance>, core: &Arc<PacketCore>) -> bool {
        let mut internal = false;
        match core.info.flags.command() {
            CommandType::Eos => {
                let at_eos = self
                    .pid()
                    .map(|p| p.has_seen_eos.load(Ordering::Acquire))
                    .unwrap_or(true);
                self.is_end_of_stream.store(at_eos, Ordering::Release);
                info!("eos packet on pid {} (eos {})", self.name(), at_eos);
                self.nb_eos_signaled.fetch_sub(1, Ordering::AcqRel);
                internal = true;
            }
            CommandType::PidRemove => {
                if let (Some(filter), Some(pid)) = (self.filter(), self.pid()) {
                    filter.post_disconnect_task(&pid);
                }
                internal = true;
            }
            CommandType::None => {}
        }
        let cktype = core.info.flags.clock_type();
        if cktype != ClockType::None {
            if self.handles_clock_references.load(Ordering::Acquire) {
                return false;
            }
            self.nb_clocks_signaled.fetch_sub(1, Ordering::AcqRel);
            let timescale = core.timescale();
            {
                let mut clock = self.last_clock.lock();
                clock.value = core.info.cts;
                clock.timescale = timescale;
                if clock.clock_type != ClockType::Discontinuity {
                    clock.clock_type = cktype;
                }
            }
            if let Some(filter) = self.filter() {
                filter.stage_clock_dispatch(core.info.cts, timescale, cktype);
            }
            debug!(
                "clock reference packet filtered on pid {} value {}",
                self.name(),
                core.info.cts
            );
            internal = true;
        }
        if internal {
            self.drop_packet();
        }
        internal
    }

    /// Drop the head packet, updating buffer accounting and the
    /// blocking state of the source pid.
    pub fn drop_packet(self: &Arc<PidInstance>) {
        let Some(mut inst) = self.packets.pop() else {
            warn!("attempt to drop an already dropped packet on pid {}", self.name());
            return;
        };
        let core = inst.pck.take().expect("queued instance holds packet");
        let Some(pid) = self.pid() else {
            PacketCore::unref(core);
            return;
        };

        let nb_pck = self.packets.count();
        self.update_stats(&core);

        if nb_pck < pid.nb_buffer_unit.load(Ordering::Acquire) {
            pid.nb_buffer_unit.store(nb_pck, Ordering::Release);
        }

        if nb_pck == 0 {
            self.buffer_duration.store(0, Ordering::Release);
        } else if core.info.duration != 0
            && core.info.flags.contains(PckFlags::BLOCK_START)
            && core.timescale() != 0
        {
            let d = (core.info.duration as i64 * 1_000_000) / core.timescale() as i64;
            self.buffer_duration.fetch_sub(d, Ordering::AcqRel);
        }

        let inst_dur = self.buffer_duration.load(Ordering::Acquire);
        let pid_dur = pid.buffer_duration.load(Ordering::Acquire);
        if pid_dur == 0 || inst_dur < pid_dur {
            pid.buffer_duration.store(inst_dur.max(0), Ordering::Release);
        }

        pid.check_unblock();

        if let Some(filter) = self.filter() {
            filter.recycle_packet_instance(inst);
            filter.pending_packets.fetch_sub(1, Ordering::AcqRel);
            PacketCore::unref(core);
            filter.forward_clock();
        } else {
            PacketCore::unref(core);
        }
    }

    fn update_stats(&self, core: &Arc<PacketCore>) {
        let now = now_us();
        let mut stats = self.stats.lock();
        stats.nb_processed += 1;
        stats.bytes_processed += core.len as u64;
        if core.info.flags.sap() > 0 {
            stats.nb_sap_processed += 1;
        }
        if stats.first_pck_time_us == 0 {
            stats.first_pck_time_us = now;
        }
        stats.last_pck_time_us = now;
        let elapsed = now.saturating_sub(stats.first_pck_time_us);
        if elapsed > 0 {
            stats.avg_bit_rate = stats.bytes_processed * 8 * 1_000_000 / elapsed;
            if stats.avg_bit_rate > stats.max_bit_rate {
                stats.max_bit_rate = stats.avg_bit_rate;
            }
        }
    }

    pub(crate) fn reset_stats(&self) {
        *self.stats.lock() = PidInstStats::default();
    }

    /// EOS is observed once the in-band EOS packet reaches the head of
    /// the queue and no data remains before it.
    pub fn is_eos(self: &Arc<PidInstance>) -> bool {
        let Some(pid) = self.pid() else {
            return true;
        };
        if !pid.has_seen_eos.load(Ordering::Acquire) {
            self.is_end_of_stream.store(false, Ordering::Release);
            return false;
        }
        if let Some(core) = self
            .packets
            .peek_head(|inst| Arc::clone(inst.pck.as_ref().expect("queued instance holds packet")))
        {
            self.filter_internal_packet(&core);
        }
        self.is_end_of_stream.load(Ordering::Acquire)
    }

    pub fn has_seen_eos(&self) -> bool {
        self.pid().map(|p| p.has_seen_eos()).unwrap_or(false)
    }

    pub fn num_queued_packets(&self) -> u32 {
        self.packets.count()
    }

    pub fn first_packet_cts(self: &Arc<PidInstance>) -> Option<u64> {
        if self.discard_packets.load(Ordering::Acquire) {
            return None;
        }
        let core = self
            .packets
            .peek_head(|inst| Arc::clone(inst.pck.as_ref().expect("queued instance holds packet")))?;
        if self.filter_internal_packet(&core) {
            return self.first_packet_cts();
        }
        if self.requires_full_data_block.load(Ordering::Acquire)
            && !core.info.flags.contains(PckFlags::BLOCK_END)
        {
            return None;
        }
        if core.info.cts == NO_TS {
            None
        } else {
            Some(core.info.cts)
        }
    }

    /// Request a property value from the producer: stored on the
    /// source pid and applied through its filter's
    /// `reconfigure_output` before the next connection pass.
    pub fn negotiate_property(
        self: &Arc<PidInstance>,
        key: impl Into<PropKey>,
        value: PropValue,
    ) -> Result<()> {
        let pid = self.pid().ok_or(sluice_common::Error::BadParam)?;
        let mut negotiated = pid.caps_negotiate.lock();
        let map = negotiated.get_or_insert_with(|| Arc::new(PropMap::new()));
        map.set(key.into(), Some(value));
        if let Some(filter) = pid.filter() {
            filter.nb_caps_renegotiate.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Send an event from this consumer toward the source (downstream
    /// propagation on the owning chain).
    pub fn send_event(self: &Arc<PidInstance>, kind: EventKind) {
        let Some(pid) = self.pid() else { return };
        let Some(src_filter) = pid.filter() else { return };

        match &kind {
            EventKind::Stop | EventKind::SourceSeek { .. } => {
                for dst in pid.destinations.read().iter() {
                    dst.discard_packets.store(true, Ordering::Release);
                    pid.discard_input_packets.fetch_add(1, Ordering::AcqRel);
                }
            }
            EventKind::Play { .. } => {
                for dst in pid.destinations.read().iter() {
                    dst.is_end_of_stream.store(false, Ordering::Release);
                }
            }
            _ => {}
        }
        src_filter.queue_downstream_event(Event::on(Arc::clone(&pid), kind));
    }

    /// Total buffered duration up the chain from this instance.
    pub fn query_buffer_duration(self: &Arc<PidInstance>) -> u64 {
        let mut duration = 0u64;
        if let Some(pid) = self.pid() {
            if let Some(filter) = pid.filter() {
                let inputs: Vec<Arc<PidInstance>> = filter.inputs.lock().clone();
                for up in inputs {
                    let d = up.query_buffer_duration();
                    if d > duration {
                        duration = d;
                    }
                }
            }
        }
        duration + self.buffer_duration.load(Ordering::Acquire).max(0) as u64
    }

    pub(crate) fn detach(&self) {
        *self.pid.lock() = None;
    }
}

pub(crate) fn now_us() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl std::fmt::Debug for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pid")
            .field("name", &self.name())
            .field("destinations", &self.num_destinations())
            .field("would_block", &self.would_block())
            .finish()
    }
}

impl std::fmt::Debug for PidInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidInstance")
            .field("pid", &self.name())
            .field("queued", &self.packets.count())
            .finish()
    }
}

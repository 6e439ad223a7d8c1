//! Packets: the unit of data traveling through PIDs.
//!
//! A packet carries a byte payload (owned, shared, reference-backed or
//! frame-interface-backed), an optional per-packet property map, the
//! PID property map active at send time, and timing info. Packets are
//! explicitly reference counted: each destination instance and each
//! retained handle owns one count, and the destruction path runs when
//! the count returns to zero, recycling owned buffers through the
//! source filter's reservoir.
//!
//! Producer side: [`Pid::new_packet_alloc`] and friends hand out a
//! [`Packet`], uniquely owned and mutable until [`Packet::send`]
//! freezes it and fans it out to every destination instance.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use sluice_common::{Error, Result};

use crate::pid::{Pid, PidInstance};
use crate::prop_map::PropMap;
use crate::props::{PropKey, PropValue};

/// Sentinel for an unset timestamp.
pub const NO_TS: u64 = u64::MAX;
/// Sentinel for an unset byte offset.
pub const NO_BO: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// flags
// ---------------------------------------------------------------------------

/// Packed per-packet flags and small enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PckFlags(pub u32);

impl PckFlags {
    pub const BLOCK_START: u32 = 1 << 0;
    pub const BLOCK_END: u32 = 1 << 1;
    pub const SEEK: u32 = 1 << 2;
    pub const CORRUPTED: u32 = 1 << 3;
    /// Duration was set explicitly, do not infer it.
    pub const DUR_SET: u32 = 1 << 4;
    /// PID properties changed with this packet.
    pub const PROPS_CHANGED: u32 = 1 << 5;
    /// PID info changed with this packet.
    pub const INFO_CHANGED: u32 = 1 << 6;
    /// Properties-only packet, carries no data and may outlive its PID.
    pub const PROPS_REFERENCE: u32 = 1 << 7;

    const SAP_SHIFT: u32 = 8; // 3 bits
    const CRYPT_SHIFT: u32 = 11; // 2 bits
    const CLOCK_SHIFT: u32 = 13; // 2 bits
    const CMD_SHIFT: u32 = 15; // 2 bits

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    pub fn insert(&mut self, bits: u32) {
        self.0 |= bits;
    }

    pub fn remove(&mut self, bits: u32) {
        self.0 &= !bits;
    }

    pub fn sap(self) -> u8 {
        ((self.0 >> Self::SAP_SHIFT) & 0x7) as u8
    }

    pub fn set_sap(&mut self, sap: u8) {
        let sap = sap.min(4) as u32;
        self.0 = (self.0 & !(0x7 << Self::SAP_SHIFT)) | (sap << Self::SAP_SHIFT);
    }

    pub fn crypt(self) -> u8 {
        ((self.0 >> Self::CRYPT_SHIFT) & 0x3) as u8
    }

    pub fn set_crypt(&mut self, crypt: u8) {
        let crypt = (crypt & 0x3) as u32;
        self.0 = (self.0 & !(0x3 << Self::CRYPT_SHIFT)) | (crypt << Self::CRYPT_SHIFT);
    }

    pub fn clock_type(self) -> ClockType {
        match (self.0 >> Self::CLOCK_SHIFT) & 0x3 {
            1 => ClockType::Clock,
            2 => ClockType::Discontinuity,
            _ => ClockType::None,
        }
    }

    pub fn set_clock_type(&mut self, ct: ClockType) {
        self.0 = (self.0 & !(0x3 << Self::CLOCK_SHIFT)) | ((ct as u32) << Self::CLOCK_SHIFT);
    }

    pub fn command(self) -> CommandType {
        match (self.0 >> Self::CMD_SHIFT) & 0x3 {
            1 => CommandType::Eos,
            2 => CommandType::PidRemove,
            _ => CommandType::None,
        }
    }

    pub fn set_command(&mut self, cmd: CommandType) {
        self.0 = (self.0 & !(0x3 << Self::CMD_SHIFT)) | ((cmd as u32) << Self::CMD_SHIFT);
    }

    pub fn is_command(self) -> bool {
        self.command() != CommandType::None
    }

    /// Union used by block aggregation.
    pub fn union(self, other: PckFlags) -> PckFlags {
        PckFlags(self.0 | other.0)
    }
}

/// Clock reference carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ClockType {
    #[default]
    None = 0,
    Clock = 1,
    /// Clock with a discontinuity at this point.
    Discontinuity = 2,
}

/// Internal command packets travel in-band behind data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum CommandType {
    #[default]
    None = 0,
    Eos = 1,
    PidRemove = 2,
}

/// Timing and framing info of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PckInfo {
    pub dts: u64,
    pub cts: u64,
    pub duration: u32,
    pub byte_offset: u64,
    pub seq_num: u32,
    pub carousel_version: u8,
    pub dependency_flags: u8,
    pub roll: i16,
    pub flags: PckFlags,
}

impl Default for PckInfo {
    fn default() -> Self {
        PckInfo {
            dts: NO_TS,
            cts: NO_TS,
            duration: 0,
            byte_offset: NO_BO,
            seq_num: 0,
            carousel_version: 0,
            dependency_flags: 0,
            roll: 0,
            flags: PckFlags::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// payload
// ---------------------------------------------------------------------------

/// Decoded-frame indirection (GPU textures, planar frames) exposed in
/// place of a byte payload.
pub trait FrameInterface: Send + Sync {
    /// Borrow the bytes of one plane, if CPU-accessible.
    fn plane_data(&self, plane: usize) -> Option<&[u8]>;
    /// Frame lives in GPU memory; consumers must be scheduled on the
    /// thread owning the GL/graphics context.
    fn is_gpu(&self) -> bool {
        false
    }
}

pub(crate) enum PckPayload {
    /// No data (command and properties-reference packets).
    Empty,
    /// Buffer owned by the packet, recycled through the source
    /// filter's alloc reservoir. Capacity is the reservoir slot size.
    Alloc(Vec<u8>),
    /// Caller-shared memory; the destructor notifies the producer on
    /// release.
    Shared(Bytes),
    /// Byte range borrowed from the referenced packet.
    RefView { offset: usize, len: usize },
    /// Frame-interface payload.
    Frame(Box<dyn FrameInterface>),
}

type PckDestructor = Box<dyn FnOnce(&Arc<Pid>) + Send>;

// ---------------------------------------------------------------------------
// core
// ---------------------------------------------------------------------------

/// Shared packet state. Frozen once dispatched; only the reference
/// count and the destructor slot remain live.
pub struct PacketCore {
    pub(crate) payload: PckPayload,
    pub(crate) len: usize,
    pub(crate) info: PckInfo,
    pub(crate) props: Option<Arc<PropMap>>,
    pub(crate) pid_props: Option<Arc<PropMap>>,
    pub(crate) ref_count: AtomicU32,
    pub(crate) reference: Option<Arc<PacketCore>>,
    pub(crate) pid: Arc<Pid>,
    pub(crate) destructor: Mutex<Option<PckDestructor>>,
    /// Shared payloads count against the source PID until released.
    pub(crate) counts_as_shared: bool,
    pub(crate) readonly: AtomicBool,
}

impl PacketCore {
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            PckPayload::Empty | PckPayload::Frame(_) => &[],
            PckPayload::Alloc(buf) => &buf[..self.len],
            PckPayload::Shared(bytes) => &bytes[..self.len],
            PckPayload::RefView { offset, len } => {
                let parent = self
                    .reference
                    .as_ref()
                    .expect("reference-backed packet without reference");
                &parent.data()[*offset..*offset + *len]
            }
        }
    }

    pub fn info(&self) -> &PckInfo {
        &self.info
    }

    pub fn frame_interface(&self) -> Option<&dyn FrameInterface> {
        match &self.payload {
            PckPayload::Frame(f) => Some(&**f),
            _ => self
                .reference
                .as_ref()
                .and_then(|r| r.frame_interface_inner()),
        }
    }

    fn frame_interface_inner(&self) -> Option<&dyn FrameInterface> {
        match &self.payload {
            PckPayload::Frame(f) => Some(&**f),
            _ => None,
        }
    }

    pub fn get_property(&self, key: &PropKey) -> Option<PropValue> {
        self.props.as_ref().and_then(|p| p.get(key))
    }

    pub(crate) fn timescale(&self) -> u32 {
        self.pid_props.as_ref().map(|p| p.timescale()).unwrap_or(0)
    }

    pub(crate) fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference, running the destruction path at zero.
    pub(crate) fn unref(core: Arc<PacketCore>) {
        if core.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            PacketCore::destroy(core);
        }
    }

    /// The destruction path: release property maps, shared-packet
    /// accounting, chained references, then recycle the buffer.
    pub(crate) fn destroy(core: Arc<PacketCore>) {
        let is_ref_props = core.info.flags.contains(PckFlags::PROPS_REFERENCE);

        if let Some(dtor) = core.destructor.lock().take() {
            dtor(&core.pid);
        }

        if let Some(pid_props) = &core.pid_props {
            if is_ref_props {
                let _ = pid_props.release_pck();
            } else if pid_props.release() {
                core.pid.purge_property_map(pid_props);
            }
        }
        if let Some(props) = &core.props {
            let _ = props.release();
        }

        if core.counts_as_shared && !core.info.flags.is_command() {
            core.pid
                .nb_shared_packets_out
                .fetch_sub(1, Ordering::AcqRel);
        }

        if let Some(reference) = &core.reference {
            reference
                .pid
                .nb_shared_packets_out
                .fetch_sub(1, Ordering::AcqRel);
            PacketCore::unref(Arc::clone(reference));
        }

        // recycle the owned buffer when we are the last holder
        if let Ok(core) = Arc::try_unwrap(core) {
            if let PckPayload::Alloc(buf) = core.payload {
                if let Some(filter) = core.pid.filter() {
                    filter.recycle_pck_buffer(buf);
                }
            }
        }
    }
}

/// A packet instance: the per-destination handle queued on a PID
/// instance. Recycled through the destination-side filter reservoir.
pub(crate) struct PacketInstance {
    pub(crate) pck: Option<Arc<PacketCore>>,
    pub(crate) pid_props_change_done: AtomicBool,
    pub(crate) pid_info_change_done: AtomicBool,
    /// A lone reassembly fragment is served as a complete block even
    /// when its own framing flags say otherwise.
    pub(crate) force_full_block: AtomicBool,
}

impl PacketInstance {
    pub(crate) fn reset(&mut self, pck: Arc<PacketCore>) {
        self.pck = Some(pck);
        self.pid_props_change_done.store(false, Ordering::Relaxed);
        self.pid_info_change_done.store(false, Ordering::Relaxed);
        self.force_full_block.store(false, Ordering::Relaxed);
    }

    pub(crate) fn new(pck: Arc<PacketCore>) -> Box<PacketInstance> {
        Box::new(PacketInstance {
            pck: Some(pck),
            pid_props_change_done: AtomicBool::new(false),
            pid_info_change_done: AtomicBool::new(false),
            force_full_block: AtomicBool::new(false),
        })
    }
}

// ---------------------------------------------------------------------------
// producer handle
// ---------------------------------------------------------------------------

/// A packet under construction on an output PID. Uniquely owned;
/// consumed by [`Packet::send`] or [`Packet::discard`].
pub struct Packet {
    pub(crate) core: PacketCore,
}

impl Packet {
    pub(crate) fn new(pid: Arc<Pid>, payload: PckPayload, len: usize) -> Packet {
        Packet {
            core: PacketCore {
                payload,
                len,
                info: PckInfo::default(),
                props: None,
                pid_props: None,
                ref_count: AtomicU32::new(0),
                reference: None,
                pid,
                destructor: Mutex::new(None),
                counts_as_shared: false,
                readonly: AtomicBool::new(false),
            },
        }
    }

    /// Mutable view of an allocated payload. Empty for other classes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let len = self.core.len;
        match &mut self.core.payload {
            PckPayload::Alloc(buf) => &mut buf[..len],
            _ => &mut [],
        }
    }

    pub fn data(&self) -> &[u8] {
        self.core.data()
    }

    /// Grow an allocated packet by `extra` bytes, returning the new
    /// writable tail.
    pub fn expand(&mut self, extra: usize) -> Result<&mut [u8]> {
        let old_len = self.core.len;
        match &mut self.core.payload {
            PckPayload::Alloc(buf) => {
                buf.resize(old_len + extra, 0);
                self.core.len = old_len + extra;
                Ok(&mut buf[old_len..])
            }
            _ => Err(Error::BadParam),
        }
    }

    /// Shrink the packet to `size` bytes.
    pub fn truncate(&mut self, size: usize) -> Result<()> {
        match &mut self.core.payload {
            PckPayload::Alloc(_) | PckPayload::Shared(_) => {
                if size < self.core.len {
                    self.core.len = size;
                }
                Ok(())
            }
            _ => Err(Error::BadParam),
        }
    }

    pub fn set_dts(&mut self, dts: u64) {
        self.core.info.dts = dts;
    }

    pub fn set_cts(&mut self, cts: u64) {
        self.core.info.cts = cts;
    }

    pub fn set_duration(&mut self, duration: u32) {
        self.core.info.duration = duration;
        self.core.info.flags.insert(PckFlags::DUR_SET);
    }

    pub fn set_sap(&mut self, sap: u8) {
        self.core.info.flags.set_sap(sap);
    }

    pub fn set_framing(&mut self, start: bool, end: bool) {
        let flags = &mut self.core.info.flags;
        flags.remove(PckFlags::BLOCK_START | PckFlags::BLOCK_END);
        if start {
            flags.insert(PckFlags::BLOCK_START);
        }
        if end {
            flags.insert(PckFlags::BLOCK_END);
        }
    }

    pub fn set_seek(&mut self, seek: bool) {
        if seek {
            self.core.info.flags.insert(PckFlags::SEEK);
        } else {
            self.core.info.flags.remove(PckFlags::SEEK);
        }
    }

    pub fn set_corrupted(&mut self, corrupted: bool) {
        if corrupted {
            self.core.info.flags.insert(PckFlags::CORRUPTED);
        } else {
            self.core.info.flags.remove(PckFlags::CORRUPTED);
        }
    }

    pub fn set_byte_offset(&mut self, offset: u64) {
        self.core.info.byte_offset = offset;
    }

    pub fn set_roll(&mut self, roll: i16) {
        self.core.info.roll = roll;
    }

    pub fn set_crypt(&mut self, crypt: u8) {
        self.core.info.flags.set_crypt(crypt);
    }

    pub fn set_clock_type(&mut self, ct: ClockType) {
        self.core.info.flags.set_clock_type(ct);
    }

    pub fn set_carousel(&mut self, version: u8) {
        self.core.info.carousel_version = version;
    }

    pub fn set_seq_num(&mut self, seq: u32) {
        self.core.info.seq_num = seq;
    }

    pub fn set_dependency_flags(&mut self, flags: u8) {
        self.core.info.dependency_flags = flags;
    }

    /// Mark caller memory as immutable so clones never copy it back.
    pub fn set_readonly(&mut self) {
        self.core.readonly.store(true, Ordering::Release);
    }

    pub fn info(&self) -> &PckInfo {
        &self.core.info
    }

    pub fn set_property(&mut self, key: impl Into<PropKey>, value: Option<PropValue>) {
        let props = self.core.props.get_or_insert_with(|| Arc::new(PropMap::new()));
        props.set(key.into(), value);
    }

    pub fn get_property(&self, key: &PropKey) -> Option<PropValue> {
        self.core.props.as_ref().and_then(|p| p.get(key))
    }

    /// Copy the source packet's per-packet properties into this one.
    pub fn merge_properties(&mut self, src: &PacketCore) {
        if let Some(src_props) = &src.props {
            let props = self.core.props.get_or_insert_with(|| Arc::new(PropMap::new()));
            props.merge_from(src_props, None);
        }
    }

    /// Destroy a packet that was allocated but never sent.
    pub fn discard(self) {
        PacketCore::destroy(Arc::new(self.core));
    }

    /// Dispatch the packet to every destination of its PID. See module
    /// docs for the state machine.
    pub fn send(self) -> Result<()> {
        send_internal(self, true)
    }
}

// ---------------------------------------------------------------------------
// consumer handles
// ---------------------------------------------------------------------------

/// Read view of the head packet of a PID instance, returned by
/// [`PidInstance::get_packet`]. The view does not own a reference; the
/// queued instance does. Use [`PacketRef::retain`] to keep the packet
/// beyond the matching `drop_packet`.
#[derive(Clone)]
pub struct PacketRef {
    pub(crate) core: Arc<PacketCore>,
    pub(crate) full_block_override: bool,
}

impl PacketRef {
    pub fn data(&self) -> &[u8] {
        self.core.data()
    }

    pub fn info(&self) -> &PckInfo {
        &self.core.info
    }

    pub fn dts(&self) -> u64 {
        self.core.info.dts
    }

    pub fn cts(&self) -> u64 {
        self.core.info.cts
    }

    pub fn duration(&self) -> u32 {
        self.core.info.duration
    }

    pub fn timescale(&self) -> u32 {
        self.core.timescale()
    }

    pub fn framing(&self) -> (bool, bool) {
        let f = self.core.info.flags;
        (
            self.full_block_override || f.contains(PckFlags::BLOCK_START),
            self.full_block_override || f.contains(PckFlags::BLOCK_END),
        )
    }

    pub fn sap(&self) -> u8 {
        self.core.info.flags.sap()
    }

    pub fn is_seek(&self) -> bool {
        self.core.info.flags.contains(PckFlags::SEEK)
    }

    pub fn is_corrupted(&self) -> bool {
        self.core.info.flags.contains(PckFlags::CORRUPTED)
    }

    pub fn byte_offset(&self) -> u64 {
        self.core.info.byte_offset
    }

    pub fn clock_type(&self) -> ClockType {
        self.core.info.flags.clock_type()
    }

    pub fn roll(&self) -> i16 {
        self.core.info.roll
    }

    pub fn crypt(&self) -> u8 {
        self.core.info.flags.crypt()
    }

    pub fn seq_num(&self) -> u32 {
        self.core.info.seq_num
    }

    pub fn carousel_version(&self) -> u8 {
        self.core.info.carousel_version
    }

    pub fn dependency_flags(&self) -> u8 {
        self.core.info.dependency_flags
    }

    pub fn get_property(&self, key: &PropKey) -> Option<PropValue> {
        self.core.get_property(key)
    }

    pub fn enum_properties(&self, idx: usize) -> Option<(PropKey, PropValue)> {
        self.core.props.as_ref().and_then(|p| p.nth(idx))
    }

    pub fn frame_interface(&self) -> Option<&dyn FrameInterface> {
        self.core.frame_interface()
    }

    /// Keep the packet alive past `drop_packet`.
    pub fn retain(&self) -> RetainedPacket {
        self.core.add_ref();
        RetainedPacket {
            core: Some(Arc::clone(&self.core)),
        }
    }

    /// Build a properties-reference packet: timing and property maps
    /// only, valid even after the source filter and PID are gone.
    pub fn retain_props(&self) -> RetainedPacket {
        let mut info = self.core.info;
        info.flags = PckFlags(
            info.flags.0 & !(PckFlags::BLOCK_START | PckFlags::BLOCK_END),
        );
        info.flags.insert(PckFlags::PROPS_REFERENCE);
        if let Some(props) = &self.core.props {
            props.acquire();
        }
        if let Some(pid_props) = &self.core.pid_props {
            pid_props.acquire_pck();
        }
        let core = PacketCore {
            payload: PckPayload::Empty,
            len: 0,
            info,
            props: self.core.props.clone(),
            pid_props: self.core.pid_props.clone(),
            ref_count: AtomicU32::new(1),
            reference: None,
            pid: Arc::clone(&self.core.pid),
            destructor: Mutex::new(None),
            counts_as_shared: false,
            readonly: AtomicBool::new(false),
        };
        RetainedPacket {
            core: Some(Arc::new(core)),
        }
    }
}

/// An owning packet reference; releases its count on drop.
pub struct RetainedPacket {
    core: Option<Arc<PacketCore>>,
}

impl RetainedPacket {
    pub fn as_ref(&self) -> PacketRef {
        PacketRef {
            core: Arc::clone(self.core.as_ref().expect("retained packet already released")),
            full_block_override: false,
        }
    }
}

impl Drop for RetainedPacket {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            PacketCore::unref(core);
        }
    }
}

// ---------------------------------------------------------------------------
// send path
// ---------------------------------------------------------------------------

/// Microsecond duration of a packet at the PID timescale.
fn buffer_us(duration: u32, timescale: u32) -> i64 {
    if duration == 0 || timescale == 0 {
        return 0;
    }
    (duration as i64 * 1_000_000) / timescale as i64
}

pub(crate) fn send_internal(mut packet: Packet, from_filter: bool) -> Result<()> {
    let pid = Arc::clone(&packet.core.pid);
    let Some(filter) = pid.filter() else {
        packet.discard();
        return Err(Error::BadParam);
    };

    // reset pending on this pid: drop without dispatching
    if pid.discard_input_packets.load(Ordering::Acquire) > 0 {
        debug!(
            "filter {} pid {} reset pending, discarding input packet",
            filter.name(),
            pid.name()
        );
        packet.discard();
        return Ok(());
    }

    // source filters start playing implicitly on first dispatch
    if filter.num_input_pids() == 0
        && !pid.initial_play_done.swap(true, Ordering::AcqRel)
        && !pid.is_playing.load(Ordering::Acquire)
    {
        pid.is_playing.store(true, Ordering::Release);
        filter.nb_pids_playing.fetch_add(1, Ordering::AcqRel);
    }

    let is_cmd = packet.core.info.flags.is_command();
    let cktype = packet.core.info.flags.clock_type();

    if from_filter {
        if !is_cmd && cktype == ClockType::None {
            filter.forward_clock();
        }
        if packet.core.info.flags.command() == CommandType::Eos {
            if !pid.has_seen_eos.swap(true, Ordering::AcqRel) {
                info!("filter {} pid {} end of stream", filter.name(), pid.name());
            }
        } else if !is_cmd {
            pid.has_seen_eos.store(false, Ordering::Release);
        }

        // flag property changes since the last dispatch
        packet.core.info.flags.remove(PckFlags::PROPS_CHANGED);
        if !pid.request_property_map.load(Ordering::Acquire)
            && !is_cmd
            && (pid.nb_pck_sent.load(Ordering::Acquire) > 0
                || pid.props_changed_since_connect.load(Ordering::Acquire))
        {
            debug!(
                "filter {} pid {} properties modified, marking packet",
                filter.name(),
                pid.name()
            );
            packet.core.info.flags.insert(PckFlags::PROPS_CHANGED);
        }
        // any property write after this packet opens a new map
        if !is_cmd {
            pid.request_property_map.store(true, Ordering::Release);
            pid.props_changed_since_connect.store(false, Ordering::Release);
        }
        if pid.pid_info_changed.swap(false, Ordering::AcqRel) {
            packet.core.info.flags.insert(PckFlags::INFO_CHANGED);
        }
    }

    // attach the active property map
    let timescale;
    if let Some(props) = &packet.core.pid_props {
        timescale = props.timescale();
    } else {
        let props = pid.current_props();
        timescale = props.as_ref().map(|p| p.timescale()).unwrap_or(0);
        if let Some(props) = props {
            props.acquire();
            packet.core.pid_props = Some(props);
        }
    }

    // connection pending on the source filter: park the packet
    if filter.out_pid_connection_pending.load(Ordering::Acquire) > 0
        || filter.has_pending_pids.load(Ordering::Acquire)
        || pid.init_task_pending.load(Ordering::Acquire) > 0
    {
        info!(
            "filter {} pid {} connection pending, postponing packet",
            filter.name(),
            pid.name()
        );
        filter.postponed_packets.lock().push(packet);
        return Err(Error::PendingPacket);
    }

    filter.nb_pck_io.fetch_add(1, Ordering::AcqRel);
    if !is_cmd {
        pid.nb_pck_sent.fetch_add(1, Ordering::AcqRel);
        if packet.core.len > 0 {
            filter.nb_pck_sent.fetch_add(1, Ordering::AcqRel);
            filter
                .nb_bytes_sent
                .fetch_add(packet.core.len as u64, Ordering::AcqRel);
        }
    }

    if cktype == ClockType::Discontinuity {
        pid.timing.lock().reset_for_discontinuity();
    }

    if cktype == ClockType::None {
        reconstruct_timing(&pid, &mut packet.core.info);
    } else {
        packet.core.info.duration = 0;
        debug!(
            "filter {} pid {} sent clock reference {}",
            filter.name(),
            pid.name(),
            packet.core.info.cts
        );
    }

    // freeze and fan out
    let core = Arc::new(packet.core);
    // protect from destruction while dispatching
    core.add_ref();

    let destinations: Vec<Arc<PidInstance>> = pid.destinations.read().clone();
    let mut nb_dispatch = 0u32;
    let mut nb_discard = 0u32;

    for dst in &destinations {
        let Some(dst_filter) = dst.filter() else {
            continue;
        };
        if dst_filter.finalized.load(Ordering::Acquire) || dst_filter.removed.load(Ordering::Acquire)
        {
            continue;
        }

        if dst.discard_inputs.load(Ordering::Acquire) {
            // drop, but surface property changes as a reconfigure
            if core.info.flags.contains(PckFlags::PROPS_CHANGED) {
                let new_props = core.pid_props.clone();
                let changed = {
                    let cur = dst.props.lock();
                    match (&*cur, &new_props) {
                        (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                        (None, Some(_)) => true,
                        _ => false,
                    }
                };
                if changed {
                    dst.swap_props(new_props.expect("checked above"));
                    dst_filter.blacklist.lock().clear();
                    dst_filter.post_reconfigure_task(&pid);
                }
            }
            nb_discard += 1;
            continue;
        }

        let inst = filter.new_packet_instance(Arc::clone(&core));
        core.add_ref();
        nb_dispatch += 1;

        if core.info.flags.command() == CommandType::Eos {
            dst.nb_eos_signaled.fetch_add(1, Ordering::AcqRel);
        }
        if cktype != ClockType::None && !dst.handles_clock_references.load(Ordering::Acquire) {
            dst.nb_clocks_signaled.fetch_add(1, Ordering::AcqRel);
        }

        debug!(
            "dispatching packet from filter {} to filter {} ({} queued on pid {})",
            filter.name(),
            dst_filter.name(),
            dst.packets.count(),
            pid.name()
        );

        let mut post_task = false;
        if cktype != ClockType::None {
            dst_filter.pending_packets.fetch_add(1, Ordering::AcqRel);
            dst.packets.add(inst);
            post_task = true;
        } else if dst.requires_full_data_block.load(Ordering::Acquire) {
            post_task = dispatch_full_block(&pid, dst, &dst_filter, &filter, inst, &core, timescale);
        } else {
            // plain enqueue; count buffered duration once per block
            let mut duration = 0u32;
            if core.info.flags.contains(PckFlags::BLOCK_START) {
                dst.first_block_started.store(true, Ordering::Release);
                duration = core.info.duration;
            }
            if core.info.flags.contains(PckFlags::BLOCK_END) {
                if !dst.first_block_started.load(Ordering::Acquire) {
                    duration = core.info.duration;
                }
                dst.first_block_started.store(false, Ordering::Release);
            }
            let us = buffer_us(duration, timescale);
            if us != 0 {
                dst.buffer_duration.fetch_add(us, Ordering::AcqRel);
            }
            dst_filter.pending_packets.fetch_add(1, Ordering::AcqRel);
            dst.packets.add(inst);
            post_task = true;
        }

        if post_task {
            // hold the source tasks lock so buffer occupancy and the
            // consumer's concurrent drops cannot interleave badly
            {
                let _guard = filter.tasks_mx.lock();
                let nb_pck = dst.packets.count();
                if pid.nb_buffer_unit.load(Ordering::Acquire) < nb_pck {
                    pid.nb_buffer_unit.store(nb_pck, Ordering::Release);
                }
                let dst_dur = dst.buffer_duration.load(Ordering::Acquire);
                if pid.buffer_duration.load(Ordering::Acquire) < dst_dur {
                    pid.buffer_duration.store(dst_dur, Ordering::Release);
                }
            }
            dst_filter.post_process_task();
        }
    }

    pid.update_would_block();

    // release the dispatch protection
    if core.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
        if nb_dispatch == 0 {
            if nb_discard > 0 {
                debug!(
                    "all pid destinations on filter {} in discard mode, discarding",
                    filter.name()
                );
            } else {
                debug!("no pid destination on filter {}, discarding packet", filter.name());
            }
        }
        PacketCore::destroy(core);
    }
    Ok(())
}

/// DTS/CTS reconstruction at dispatch, clamping unreliable DTS runs.
fn reconstruct_timing(pid: &Arc<Pid>, info: &mut PckInfo) {
    let mut t = pid.timing.lock();
    let mut unreliable_dts = false;

    if info.dts == NO_TS {
        info.dts = info.cts;
        if t.recompute_dts && info.cts != NO_TS {
            if info.cts == t.last_pck_cts {
                info.dts = t.last_pck_dts;
            } else {
                let mut min_dur = (info.cts as i64 - t.min_pck_cts as i64).abs() as u64;
                if min_dur > t.min_pck_duration {
                    min_dur = t.min_pck_duration;
                }
                if min_dur == 0 {
                    min_dur = 1;
                    unreliable_dts = true;
                    t.nb_unreliable_dts += 1;
                } else if t.nb_unreliable_dts > 0 {
                    let n = t.nb_unreliable_dts as u64;
                    t.last_pck_dts = t.last_pck_dts.saturating_sub(n) + min_dur * n;
                    t.nb_unreliable_dts = 0;
                    if t.last_pck_dts + min_dur > info.cts {
                        t.last_pck_dts = info.cts.saturating_sub(min_dur);
                    }
                }
                if t.last_pck_dts > 0 {
                    info.dts = t.last_pck_dts + min_dur;
                }
            }
        }
    } else if info.cts == NO_TS {
        info.cts = info.dts;
    }

    let mut duration: u64 = 0;
    if info.cts != NO_TS {
        if !t.duration_init {
            t.last_pck_dts = info.dts;
            t.last_pck_cts = info.cts;
            t.max_pck_cts = info.cts;
            t.min_pck_cts = info.cts;
            t.duration_init = true;
        } else if info.duration == 0 && !info.flags.contains(PckFlags::DUR_SET) {
            if !unreliable_dts && info.dts != NO_TS {
                duration = (info.dts as i64 - t.last_pck_dts as i64).unsigned_abs();
            } else {
                duration = (info.cts as i64 - t.last_pck_cts as i64).unsigned_abs();
            }
            if t.recompute_dts {
                if info.cts > t.max_pck_cts {
                    t.max_pck_cts = info.cts;
                }
                if info.cts < t.max_pck_cts
                    && (info.cts <= t.min_pck_cts || info.cts > t.last_pck_cts)
                {
                    t.min_pck_cts = info.cts;
                }
            }
            t.last_pck_dts = info.dts;
            t.last_pck_cts = info.cts;
        } else {
            duration = info.duration as u64;
            t.last_pck_dts = info.dts;
            t.last_pck_cts = info.cts;
        }
    } else {
        duration = info.duration as u64;
    }

    if duration != 0 {
        if t.min_pck_duration == 0 || duration < t.min_pck_duration {
            t.min_pck_duration = duration;
        }
    }
    if info.duration == 0 && t.min_pck_duration > 0 {
        info.duration = duration as u32;
    }
}

/// Dispatch one packet to a full-data-block destination, reassembling
/// fragment runs into aggregate packets.
fn dispatch_full_block(
    pid: &Arc<Pid>,
    dst: &Arc<PidInstance>,
    dst_filter: &Arc<crate::filter::Filter>,
    src_filter: &Arc<crate::filter::Filter>,
    mut inst: Box<PacketInstance>,
    core: &Arc<PacketCore>,
    timescale: u32,
) -> bool {
    let flags = core.info.flags;
    let mut post_task = false;

    if flags.contains(PckFlags::BLOCK_START) {
        // missed end of the previous block: aggregate what we have
        if !dst.last_block_ended.load(Ordering::Acquire) {
            debug!(
                "filter {}: missed end of block but got block start, aggregating previous",
                src_filter.name()
            );
            post_task = aggregate_packets(pid, dst, dst_filter, src_filter);
            if post_task {
                let _ =
                    pid.nb_reaggregation_pending
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                            v.checked_sub(1)
                        });
            }
        }
        dst.last_block_ended.store(true, Ordering::Release);
    }

    if flags.contains(PckFlags::BLOCK_END) {
        let has_pending = !dst.reassembly.lock().is_empty();
        if !flags.contains(PckFlags::BLOCK_START) && has_pending {
            // closes an open block: append then aggregate
            dst.reassembly.lock().push(inst);
            aggregate_packets(pid, dst, dst_filter, src_filter);
            let _ = pid
                .nb_reaggregation_pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        } else {
            // complete block in one packet, direct dispatch
            let us = buffer_us(core.info.duration, timescale);
            if us != 0 {
                dst.buffer_duration.fetch_add(us, Ordering::AcqRel);
            }
            dst_filter.pending_packets.fetch_add(1, Ordering::AcqRel);
            dst.packets.add(inst);
        }
        dst.last_block_ended.store(true, Ordering::Release);
        post_task = true;
    } else {
        // block start or continuation: buffer for reassembly
        if flags.contains(PckFlags::BLOCK_START) {
            pid.nb_reaggregation_pending.fetch_add(1, Ordering::AcqRel);
        }
        // shared caller memory cannot be held across the block, copy it
        if core.counts_as_shared {
            let mut copy = match src_filter.new_packet_alloc(pid, core.len) {
                Some(p) => p,
                None => {
                    warn!(
                        "filter {}: failed to copy shared packet for reassembly",
                        src_filter.name()
                    );
                    PacketCore::unref(Arc::clone(core));
                    return false;
                }
            };
            copy.data_mut().copy_from_slice(core.data());
            copy.core.info = core.info;
            copy.merge_properties(core);
            copy.core.pid_props = core.pid_props.clone();
            if let Some(p) = &copy.core.pid_props {
                p.acquire();
            }
            let copy_core = Arc::new(copy.core);
            copy_core.add_ref();
            PacketCore::unref(Arc::clone(core));
            inst.reset(copy_core);
        }
        dst.reassembly.lock().push(inst);
        dst.last_block_ended.store(false, Ordering::Release);
        // block incomplete: no process task yet
    }
    post_task
}

/// Aggregate the reassembly list of `dst` into one packet pushed on
/// its input queue. Returns `true` when a packet was dispatched.
pub(crate) fn aggregate_packets(
    pid: &Arc<Pid>,
    dst: &Arc<PidInstance>,
    dst_filter: &Arc<crate::filter::Filter>,
    src_filter: &Arc<crate::filter::Filter>,
) -> bool {
    let mut frags = {
        let mut lock = dst.reassembly.lock();
        std::mem::take(&mut *lock)
    };
    if frags.is_empty() {
        return false;
    }

    // single fragment: serve it as a complete block as-is
    if frags.len() == 1 {
        let inst = frags.pop().expect("one fragment");
        {
            let core = inst.pck.as_ref().expect("queued instance holds packet");
            let us = buffer_us(core.info.duration, core.timescale());
            if us != 0 {
                dst.buffer_duration.fetch_add(us, Ordering::AcqRel);
            }
        }
        inst.force_full_block.store(true, Ordering::Release);
        dst_filter.pending_packets.fetch_add(1, Ordering::AcqRel);
        dst.packets.add(inst);
        return true;
    }

    let mut size = 0usize;
    let mut byte_offset: u64 = 0;
    let mut first_offset: u64 = 0;
    for (i, frag) in frags.iter().enumerate() {
        let core = frag.pck.as_ref().expect("queued instance holds packet");
        size += core.len;
        if i == 0 {
            first_offset = core.info.byte_offset;
            byte_offset = core.info.byte_offset;
            if byte_offset != NO_BO {
                byte_offset += core.len as u64;
            }
        } else if byte_offset == core.info.byte_offset {
            byte_offset += core.len as u64;
        } else {
            byte_offset = NO_BO;
        }
    }

    let Some(mut final_pck) = src_filter.new_packet_alloc(pid, size) else {
        warn!(
            "filter {}: failed to allocate {} bytes for reassembly",
            src_filter.name(),
            size
        );
        for frag in frags {
            if let Some(core) = frag.pck {
                PacketCore::unref(core);
            }
        }
        return false;
    };

    let mut info = PckInfo::default();
    let mut pos = 0usize;
    let mut timescale = 0u32;
    let count = frags.len();
    let mut last_inst: Option<Box<PacketInstance>> = None;
    for (i, mut frag) in frags.into_iter().enumerate() {
        let core = frag.pck.take().expect("queued instance holds packet");
        if i == 0 {
            info = core.info;
        } else {
            if core.info.duration > info.duration {
                info.duration = core.info.duration;
            }
            if core.info.dts != NO_TS && (info.dts == NO_TS || core.info.dts > info.dts) {
                info.dts = core.info.dts;
            }
            if core.info.cts != NO_TS && (info.cts == NO_TS || core.info.cts > info.cts) {
                info.cts = core.info.cts;
            }
            info.flags = info.flags.union(core.info.flags);
            if core.info.carousel_version > info.carousel_version {
                info.carousel_version = core.info.carousel_version;
            }
        }
        final_pck.data_mut()[pos..pos + core.len].copy_from_slice(core.data());
        pos += core.len;

        final_pck.merge_properties(&core);
        if final_pck.core.pid_props.is_none() {
            if let Some(p) = &core.pid_props {
                p.acquire();
                final_pck.core.pid_props = Some(Arc::clone(p));
            }
        }

        timescale = core.timescale();
        PacketCore::unref(core);

        if i + 1 == count {
            last_inst = Some(frag);
        } else {
            src_filter.recycle_packet_instance(frag);
        }
    }

    // finalize the aggregate and hand it to the last instance
    info.flags.insert(PckFlags::BLOCK_START | PckFlags::BLOCK_END);
    info.byte_offset = if byte_offset == NO_BO { NO_BO } else { first_offset };
    final_pck.core.info = info;

    let us = buffer_us(info.duration, timescale);
    if us != 0 {
        dst.buffer_duration.fetch_add(us, Ordering::AcqRel);
    }
    let agg_core = Arc::new(final_pck.core);
    agg_core.add_ref();
    let mut inst = last_inst.expect("multi-fragment list has a last instance");
    inst.reset(agg_core);
    dst_filter.pending_packets.fetch_add(1, Ordering::AcqRel);
    dst.packets.add(inst);
    true
}

//! Filter instances and the registration descriptor.
//!
//! A [`FilterRegister`] is the static description of a filter type:
//! capability bundles (plain data the resolver walks without invoking
//! behavior), arguments, priority, and a factory producing the boxed
//! [`FilterImpl`] carrying the behavior. A [`Filter`] is one loaded
//! instance with its PID lists, reservoirs and connection state.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use sluice_common::{Error, Result};

use crate::caps::CapSlot;
use crate::events::{Event, EventKind};
use crate::packet::{ClockType, CommandType, Packet, PacketCore, PacketInstance, PckPayload};
use crate::pid::{Pid, PidInstance};
use crate::queue::FilterQueue;
use crate::sched::TaskKind;
use crate::session::SessionShared;

/// Behavior of a filter type. One boxed instance lives on each loaded
/// filter; all callbacks run on the owning filter's task, serialized
/// by the implementation lock.
pub trait FilterImpl: Send {
    /// One-time setup after the filter is created and its arguments
    /// are applied.
    fn initialize(&mut self, _filter: &Arc<Filter>) -> Result<()> {
        Ok(())
    }

    /// Teardown before destruction.
    fn finalize(&mut self, _filter: &Arc<Filter>) {}

    /// Connect, reconfigure or remove an input pid.
    fn configure_pid(
        &mut self,
        filter: &Arc<Filter>,
        inst: &Arc<PidInstance>,
        is_remove: bool,
    ) -> Result<()>;

    /// Consume input packets / produce output packets. Returning an
    /// error records it as the filter's last error but keeps the
    /// filter scheduled; return `Err(Error::Eos)` when fully done.
    fn process(&mut self, filter: &Arc<Filter>) -> Result<()>;

    /// Handle an event; returning `true` cancels further propagation.
    fn process_event(&mut self, _filter: &Arc<Filter>, _event: &Event) -> bool {
        false
    }

    /// Adapt an output pid to negotiated capabilities.
    fn reconfigure_output(&mut self, _filter: &Arc<Filter>, _pid: &Arc<Pid>) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Live update of one argument.
    fn update_arg(&mut self, _name: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    /// Can this filter type handle the given URL? (source/sink probing)
    fn probe_url(&self, _url: &str) -> bool {
        false
    }

    /// Score raw data sniffing for demultiplexer selection.
    fn probe_data(&self, _data: &[u8]) -> bool {
        false
    }
}

/// Declared argument of a filter type.
#[derive(Debug, Clone)]
pub struct FilterArgDesc {
    pub name: &'static str,
    pub description: &'static str,
    pub default: Option<&'static str>,
}

type FilterFactory = Box<dyn Fn() -> Box<dyn FilterImpl> + Send + Sync>;

/// Static descriptor of a filter type.
pub struct FilterRegister {
    pub name: String,
    pub description: String,
    /// Capability bundles, delimited by [`CapSlot::Break`].
    pub caps: Vec<CapSlot>,
    /// 0 is best; the resolver weights links by `255 - priority`.
    pub priority: u8,
    /// Never loaded by the resolver, only on user request.
    pub explicit_only: bool,
    /// Source-only types (no input pids) set this to `false`.
    pub accepts_inputs: bool,
    /// Supports output reconfiguration for capability negotiation.
    pub can_reconfigure_output: bool,
    /// Needs the main/UI thread (GPU-backed filters).
    pub main_thread: bool,
    /// May be cloned to accept extra inputs when saturated.
    pub clonable: bool,
    /// Extra inputs accepted beyond the first (0 = single input).
    pub max_extra_pids: u32,
    pub args: Vec<FilterArgDesc>,
    pub factory: FilterFactory,
}

impl FilterRegister {
    pub fn new(
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn FilterImpl> + Send + Sync + 'static,
    ) -> FilterRegister {
        FilterRegister {
            name: name.into(),
            description: String::new(),
            caps: Vec::new(),
            priority: 128,
            explicit_only: false,
            accepts_inputs: true,
            can_reconfigure_output: false,
            main_thread: false,
            clonable: false,
            max_extra_pids: 0,
            args: Vec::new(),
            factory: Box::new(factory),
        }
    }

    /// Descriptor with capabilities only, backed by a pass-behavior
    /// stub. Used by resolver tests and capability queries.
    pub fn with_caps(name: impl Into<String>, caps: Vec<CapSlot>) -> FilterRegister {
        let mut reg = FilterRegister::new(name, || Box::new(NullFilterImpl));
        reg.caps = caps;
        reg
    }
}

impl std::fmt::Debug for FilterRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegister")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("caps", &self.caps.len())
            .finish()
    }
}

/// No-op behavior for capability-only registers.
struct NullFilterImpl;

impl FilterImpl for NullFilterImpl {
    fn configure_pid(
        &mut self,
        _filter: &Arc<Filter>,
        _inst: &Arc<PidInstance>,
        _is_remove: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, _filter: &Arc<Filter>) -> Result<()> {
        Ok(())
    }
}

/// Caps on the alloc reservoir scan: a pid with destinations keeps up
/// to 10 recycled buffers, an unconnected one keeps 1.
const ALLOC_RESERVOIR_CONNECTED: usize = 10;
const ALLOC_RESERVOIR_LONE: usize = 1;

/// A loaded filter instance.
pub struct Filter {
    pub(crate) session: Weak<SessionShared>,
    pub reg: Arc<FilterRegister>,
    pub(crate) name: Mutex<String>,
    /// Explicit identifier for source-ID scoping (`id=` argument).
    pub(crate) id: Mutex<Option<String>>,
    /// Accepted source identifiers (`sid=` argument).
    pub(crate) source_ids: Mutex<Option<String>>,
    pub(crate) args: Mutex<FxHashMap<String, String>>,
    /// Raw argument string, scanned for a preferred-registry override.
    pub(crate) orig_args: Mutex<Option<String>>,
    pub(crate) imp: Mutex<Box<dyn FilterImpl>>,
    /// Guards pid-list/buffer-occupancy transitions against concurrent
    /// consumers.
    pub(crate) tasks_mx: Mutex<()>,
    pub(crate) inputs: Mutex<Vec<Arc<PidInstance>>>,
    pub(crate) outputs: Mutex<Vec<Arc<Pid>>>,
    /// Registry names that failed to connect for this graph.
    pub(crate) blacklist: Mutex<Vec<String>>,
    pub(crate) would_block: AtomicU32,
    pub(crate) num_events_queued: AtomicU32,
    pub(crate) in_pid_connection_pending: AtomicU32,
    pub(crate) out_pid_connection_pending: AtomicU32,
    pub(crate) has_pending_pids: AtomicBool,
    pub(crate) pending_pids: FilterQueue<Arc<Pid>>,
    pub(crate) process_task_queued: AtomicBool,
    pub(crate) stream_reset_pending: AtomicU32,
    pub(crate) pending_packets: AtomicU32,
    pub(crate) removed: AtomicBool,
    pub(crate) finalized: AtomicBool,
    /// Sticky filters survive losing their last input.
    pub(crate) sticky: AtomicBool,
    /// Loaded by the resolver rather than the user.
    pub(crate) dynamic_filter: AtomicBool,
    pub(crate) dst_filter: Mutex<Option<Arc<Filter>>>,
    pub(crate) target_filter: Mutex<Option<Arc<Filter>>>,
    pub(crate) cloned_from: Mutex<Option<Weak<Filter>>>,
    /// Capability slot chosen by the resolver for this instance.
    pub(crate) cap_idx_at_resolution: AtomicI32,
    pub(crate) max_extra_pids: AtomicU32,
    pub(crate) clonable: AtomicBool,
    pub(crate) postponed_packets: Mutex<Vec<Packet>>,
    /// Instances detached during a capability renegotiation, reusable
    /// on reconnect.
    pub(crate) detached_insts: Mutex<Vec<Arc<PidInstance>>>,
    pcks_alloc_reservoir: Mutex<Vec<Vec<u8>>>,
    pcks_inst_reservoir: FilterQueue<Box<PacketInstance>>,
    /// Clock reference consumed on an input, staged for re-emission on
    /// the outputs.
    staged_clock: Mutex<Option<(u64, u32, ClockType)>>,
    /// Info-update events observed at fetch time, delivered before the
    /// next process call.
    pub(crate) pending_info_events: Mutex<Vec<Event>>,
    pub(crate) last_error: Mutex<Option<Error>>,
    pub(crate) status: Mutex<String>,
    /// Timed reschedule request from process, in microseconds.
    pub(crate) reschedule_us: AtomicU64,
    pub(crate) nb_pck_sent: AtomicU64,
    pub(crate) nb_bytes_sent: AtomicU64,
    /// Packets dispatched by this filter, commands included. Drives
    /// the produce-again heuristic of the process task.
    pub(crate) nb_pck_io: AtomicU64,
    pub(crate) nb_pids_playing: AtomicU32,
    /// Pending output-capability renegotiations requested by
    /// consumers.
    pub(crate) nb_caps_renegotiate: AtomicU32,
}

impl Filter {
    pub(crate) fn new(
        session: &Arc<SessionShared>,
        reg: Arc<FilterRegister>,
        name: String,
        args: FxHashMap<String, String>,
        orig_args: Option<String>,
    ) -> Arc<Filter> {
        let imp = (reg.factory)();
        let id = args.get("id").cloned();
        let source_ids = args.get("sid").cloned();
        let clonable = reg.clonable;
        let max_extra = reg.max_extra_pids;
        Arc::new(Filter {
            session: Arc::downgrade(session),
            reg,
            name: Mutex::new(name),
            id: Mutex::new(id),
            source_ids: Mutex::new(source_ids),
            args: Mutex::new(args),
            orig_args: Mutex::new(orig_args),
            imp: Mutex::new(imp),
            tasks_mx: Mutex::new(()),
            inputs: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
            blacklist: Mutex::new(Vec::new()),
            would_block: AtomicU32::new(0),
            num_events_queued: AtomicU32::new(0),
            in_pid_connection_pending: AtomicU32::new(0),
            out_pid_connection_pending: AtomicU32::new(0),
            has_pending_pids: AtomicBool::new(false),
            pending_pids: FilterQueue::new(true),
            process_task_queued: AtomicBool::new(false),
            stream_reset_pending: AtomicU32::new(0),
            pending_packets: AtomicU32::new(0),
            removed: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            sticky: AtomicBool::new(false),
            dynamic_filter: AtomicBool::new(false),
            dst_filter: Mutex::new(None),
            target_filter: Mutex::new(None),
            cloned_from: Mutex::new(None),
            cap_idx_at_resolution: AtomicI32::new(-1),
            max_extra_pids: AtomicU32::new(max_extra),
            clonable: AtomicBool::new(clonable),
            postponed_packets: Mutex::new(Vec::new()),
            detached_insts: Mutex::new(Vec::new()),
            pcks_alloc_reservoir: Mutex::new(Vec::new()),
            pcks_inst_reservoir: FilterQueue::new(true),
            staged_clock: Mutex::new(None),
            pending_info_events: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
            status: Mutex::new(String::new()),
            reschedule_us: AtomicU64::new(0),
            nb_pck_sent: AtomicU64::new(0),
            nb_bytes_sent: AtomicU64::new(0),
            nb_pck_io: AtomicU64::new(0),
            nb_pids_playing: AtomicU32::new(0),
            nb_caps_renegotiate: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn id(&self) -> Option<String> {
        self.id.lock().clone()
    }

    pub fn set_id(&self, id: impl Into<String>) {
        *self.id.lock() = Some(id.into());
    }

    pub fn set_source_ids(&self, sids: impl Into<String>) {
        *self.source_ids.lock() = Some(sids.into());
    }

    pub fn arg(&self, name: &str) -> Option<String> {
        self.args.lock().get(name).cloned()
    }

    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.lock() = status.into();
    }

    pub fn status(&self) -> String {
        self.status.lock().clone()
    }

    pub fn last_error(&self) -> Option<Error> {
        *self.last_error.lock()
    }

    /// Keep the filter alive after its last input detaches.
    pub fn set_sticky(&self, sticky: bool) {
        self.sticky.store(sticky, Ordering::Release);
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic_filter.load(Ordering::Acquire)
    }

    /// Capability bundle selected by the resolver when this filter was
    /// loaded into a chain, if any.
    pub fn resolved_bundle(&self) -> Option<usize> {
        let idx = self.cap_idx_at_resolution.load(Ordering::Acquire);
        (idx >= 0).then_some(idx as usize)
    }

    pub fn num_input_pids(&self) -> usize {
        self.inputs.lock().len()
    }

    pub fn num_output_pids(&self) -> usize {
        self.outputs.lock().len()
    }

    pub fn input_pid(&self, idx: usize) -> Option<Arc<PidInstance>> {
        self.inputs.lock().get(idx).cloned()
    }

    pub fn output_pid(&self, idx: usize) -> Option<Arc<Pid>> {
        self.outputs.lock().get(idx).cloned()
    }

    pub(crate) fn session(&self) -> Option<Arc<SessionShared>> {
        self.session.upgrade()
    }

    pub(crate) fn session_disable_blocking(&self) -> bool {
        self.session().map(|s| s.cfg.no_block).unwrap_or(true)
    }

    // -----------------------------------------------------------------
    // pid creation
    // -----------------------------------------------------------------

    /// Create a new output pid on this filter. Connection resolution
    /// is posted as a task; while this filter still has connection
    /// work pending the init is parked on `pending_pids`.
    pub fn new_pid(self: &Arc<Filter>) -> Arc<Pid> {
        let idx = self.num_output_pids();
        let pid = Pid::new(self, format!("PID{idx}"));
        {
            let _g = self.tasks_mx.lock();
            self.outputs.lock().push(Arc::clone(&pid));
        }
        if self.in_pid_connection_pending.load(Ordering::Acquire) > 0 {
            self.has_pending_pids.store(true, Ordering::Release);
            self.pending_pids.add(Arc::clone(&pid));
        } else if let Some(session) = self.session() {
            pid.init_task_pending.fetch_add(1, Ordering::AcqRel);
            session.post_task(self, TaskKind::PidInit { pid: Arc::clone(&pid) });
        }
        pid
    }

    // -----------------------------------------------------------------
    // packet reservoirs
    // -----------------------------------------------------------------

    /// Allocate a packet, preferring a recycled buffer: smallest
    /// buffer at least `size`, else the best candidate below it, with
    /// an in-place regrow once the reservoir is at capacity.
    pub(crate) fn new_packet_alloc(self: &Arc<Filter>, pid: &Arc<Pid>, size: usize) -> Option<Packet> {
        let mut reservoir = self.pcks_alloc_reservoir.lock();
        let mut best: Option<usize> = None;
        let mut closest: Option<usize> = None;
        for (i, buf) in reservoir.iter().enumerate() {
            let cap = buf.capacity();
            if cap >= size {
                match best {
                    Some(b) if reservoir[b].capacity() <= cap => {}
                    _ => best = Some(i),
                }
            } else {
                match closest {
                    None => closest = Some(i),
                    Some(c) => {
                        let c_cap = reservoir[c].capacity();
                        // small requests hunt the smallest buffer,
                        // larger ones the largest below target
                        if size < 1000 {
                            if c_cap > cap {
                                closest = Some(i);
                            }
                        } else if c_cap < cap {
                            closest = Some(i);
                        }
                    }
                }
            }
        }
        let cap_limit = if pid.num_destinations() > 0 {
            ALLOC_RESERVOIR_CONNECTED
        } else {
            ALLOC_RESERVOIR_LONE
        };
        let mut buf = match best {
            Some(i) => reservoir.swap_remove(i),
            None => {
                if reservoir.len() >= cap_limit {
                    let i = closest.expect("reservoir at cap has a closest entry");
                    let mut buf = reservoir.swap_remove(i);
                    buf.reserve(size.saturating_sub(buf.capacity()));
                    buf
                } else {
                    Vec::with_capacity(size)
                }
            }
        };
        drop(reservoir);
        buf.clear();
        buf.resize(size, 0);
        Some(Packet::new(Arc::clone(pid), PckPayload::Alloc(buf), size))
    }

    pub(crate) fn recycle_pck_buffer(&self, buf: Vec<u8>) {
        self.pcks_alloc_reservoir.lock().push(buf);
    }

    pub(crate) fn new_packet_instance(&self, core: Arc<PacketCore>) -> Box<PacketInstance> {
        match self.pcks_inst_reservoir.pop() {
            Some(mut inst) => {
                inst.reset(core);
                inst
            }
            None => PacketInstance::new(core),
        }
    }

    pub(crate) fn recycle_packet_instance(&self, mut inst: Box<PacketInstance>) {
        inst.pck = None;
        let _ = self.pcks_inst_reservoir.res_add(inst);
    }

    #[cfg(test)]
    pub(crate) fn alloc_reservoir_len(&self) -> usize {
        self.pcks_alloc_reservoir.lock().len()
    }

    // -----------------------------------------------------------------
    // task posting
    // -----------------------------------------------------------------

    /// Post (or coalesce) a process task for this filter. In direct
    /// dispatch mode the process callback runs inline instead.
    pub fn post_process_task(self: &Arc<Filter>) {
        if self.finalized.load(Ordering::Acquire) || self.removed.load(Ordering::Acquire) {
            return;
        }
        if self.process_task_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(session) = self.session() {
            // inline execution would self-deadlock when requested from
            // inside this filter's own callbacks
            if session.cfg.direct_dispatch && !self.imp.is_locked() {
                session.run_process_direct(self);
            } else {
                session.post_task(self, TaskKind::Process);
            }
        }
    }

    /// Request a timed reschedule of the process task.
    pub fn ask_rt_reschedule(&self, delay_us: u64) {
        self.reschedule_us.store(delay_us.max(1), Ordering::Release);
    }

    pub(crate) fn post_reconfigure_task(self: &Arc<Filter>, pid: &Arc<Pid>) {
        if let Some(session) = self.session() {
            session.post_task(self, TaskKind::PidReconfigure { pid: Arc::clone(pid) });
        }
    }

    pub(crate) fn post_disconnect_task(self: &Arc<Filter>, pid: &Arc<Pid>) {
        if let Some(session) = self.session() {
            session.post_task(self, TaskKind::PidDisconnect { pid: Arc::clone(pid) });
        }
    }

    // -----------------------------------------------------------------
    // events
    // -----------------------------------------------------------------

    /// Queue a downstream event task on this filter (events flowing
    /// toward the sources).
    pub(crate) fn queue_downstream_event(self: &Arc<Filter>, evt: Event) {
        if self.finalized.load(Ordering::Acquire) {
            return;
        }
        if evt.on_pid.is_some() {
            self.num_events_queued.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(session) = self.session() {
            session.post_task(self, TaskKind::EventDownstream { evt });
        }
    }

    pub(crate) fn queue_upstream_event(self: &Arc<Filter>, evt: Event) {
        if self.finalized.load(Ordering::Acquire) {
            return;
        }
        // upstream events are delivered to the destinations of the
        // target pid (or all outputs when untargeted)
        let outputs: Vec<Arc<Pid>> = self.outputs.lock().clone();
        for pid in outputs {
            if let Some(target) = &evt.on_pid {
                if !Arc::ptr_eq(target, &pid) {
                    continue;
                }
            }
            for dst in pid.destinations.read().iter() {
                if let (Some(dst_filter), Some(session)) = (dst.filter(), self.session()) {
                    let dup = Event {
                        on_pid: None,
                        kind: evt.kind.clone(),
                    };
                    session.post_task(&dst_filter, TaskKind::EventUpstream { evt: dup });
                }
            }
        }
    }

    /// Send an event from this filter; `Play`-class events with no pid
    /// reach every input.
    pub fn send_event(self: &Arc<Filter>, evt: Event) {
        if self.finalized.load(Ordering::Acquire) {
            return;
        }
        let target = evt
            .on_pid
            .as_ref()
            .and_then(|pid| pid.filter())
            .unwrap_or_else(|| Arc::clone(self));
        target.queue_downstream_event(evt);
    }

    /// Run `process_event` synchronously on the implementation.
    pub(crate) fn deliver_event(self: &Arc<Filter>, evt: &Event) -> bool {
        let mut imp = self.imp.lock();
        imp.process_event(self, evt)
    }

    /// Stash an info-update event for delivery before the next
    /// process call.
    pub(crate) fn queue_info_event(self: &Arc<Filter>, evt: Event) {
        self.pending_info_events.lock().push(evt);
        self.post_process_task();
    }

    // -----------------------------------------------------------------
    // clock forwarding
    // -----------------------------------------------------------------

    pub(crate) fn stage_clock_dispatch(&self, value: u64, timescale: u32, cktype: ClockType) {
        *self.staged_clock.lock() = Some((value, timescale, cktype));
    }

    /// Re-emit a consumed clock reference on every output pid.
    pub(crate) fn forward_clock(self: &Arc<Filter>) {
        let Some((value, _timescale, cktype)) = self.staged_clock.lock().take() else {
            return;
        };
        let outputs: Vec<Arc<Pid>> = self.outputs.lock().clone();
        for pid in outputs {
            let mut pck = Packet::new(Arc::clone(&pid), PckPayload::Empty, 0);
            pck.core.info.cts = value;
            pck.core.info.flags.set_clock_type(cktype);
            let _ = crate::packet::send_internal(pck, false);
        }
        debug!("filter {} forwarded clock {}", self.name(), value);
    }

    // -----------------------------------------------------------------
    // reconfiguration plumbing
    // -----------------------------------------------------------------

    /// Flush packets postponed while output connections were pending.
    pub(crate) fn flush_postponed_packets(self: &Arc<Filter>) {
        let postponed = {
            let mut lock = self.postponed_packets.lock();
            std::mem::take(&mut *lock)
        };
        for pck in postponed {
            let _ = crate::packet::send_internal(pck, true);
        }
    }

    /// Emit a removal command on every output and flag the filter; the
    /// session destroys it once all pids detach.
    pub fn remove(self: &Arc<Filter>) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        let outputs: Vec<Arc<Pid>> = self.outputs.lock().clone();
        for pid in outputs {
            let mut pck = Packet::new(Arc::clone(&pid), PckPayload::Empty, 0);
            pck.set_framing(true, true);
            pck.core.info.flags.set_command(CommandType::PidRemove);
            let _ = crate::packet::send_internal(pck, false);
        }
        if let Some(session) = self.session() {
            session.post_task(self, TaskKind::FilterRemove);
        }
    }

    /// Source filters: no inputs and a register that never accepts
    /// any.
    pub fn is_source(&self) -> bool {
        !self.reg.accepts_inputs
    }

    /// Effective identifier for source-ID matching: this filter's, or
    /// the last explicit one up a dynamic chain.
    pub(crate) fn last_id_in_chain(self: &Arc<Filter>) -> Option<String> {
        if let Some(id) = self.id() {
            return Some(id);
        }
        if !self.dynamic_filter.load(Ordering::Acquire) {
            return None;
        }
        let inputs: Vec<Arc<PidInstance>> = self.inputs.lock().clone();
        for inst in inputs {
            let Some(pid) = inst.pid() else { continue };
            let Some(up) = pid.filter() else { continue };
            if let Some(id) = up.id() {
                return Some(id);
            }
            if up.dynamic_filter.load(Ordering::Acquire) {
                if let Some(id) = up.last_id_in_chain() {
                    return Some(id);
                }
            }
        }
        None
    }

    /// True when `other` appears in the parent (upstream) chain of
    /// `self`.
    pub(crate) fn in_parent_chain(self: &Arc<Filter>, other: &Arc<Filter>) -> bool {
        if Arc::ptr_eq(self, other) {
            return true;
        }
        let inputs: Vec<Arc<PidInstance>> = self.inputs.lock().clone();
        for inst in inputs {
            let Some(pid) = inst.pid() else { continue };
            let Some(up) = pid.filter() else { continue };
            if up.in_parent_chain(other) {
                return true;
            }
        }
        false
    }

    /// Deliver a user event to every input-less filter (used by the
    /// embedding application for interaction events).
    pub fn notify_user_event(self: &Arc<Filter>, code: u32, payload: Option<String>) {
        self.send_event(Event::new(EventKind::User { code, payload }));
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name())
            .field("register", &self.reg.name)
            .field("inputs", &self.num_input_pids())
            .field("outputs", &self.num_output_pids())
            .finish()
    }
}

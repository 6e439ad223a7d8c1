//! End-to-end graph tests: sources, transforms and sinks built as
//! real filter implementations, connected through the session's init
//! walk and the resolver, driven by the task pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sluice_rt::{
    keys, CapSlot, Capability, Event, EventKind, Filter, FilterImpl, FilterRegister,
    FilterSession, Pid, PidInstance, PropValue, Result, SessionConfig,
};

const VIDEO: u32 = 3;
const CODEC_H264: u32 = 27;
const CODEC_RAW: u32 = 0;

fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn uint(v: u32) -> PropValue {
    PropValue::Uint(v)
}

/// What a test source emits: payload, cts, duration, framing.
#[derive(Clone)]
struct PlannedPacket {
    payload: Vec<u8>,
    cts: u64,
    duration: u32,
    framing: (bool, bool),
}

fn plain(payload: &[u8], cts: u64, duration: u32) -> PlannedPacket {
    PlannedPacket {
        payload: payload.to_vec(),
        cts,
        duration,
        framing: (true, true),
    }
}

/// Source emitting a fixed plan once played, one packet per process
/// call, then EOS.
struct PlanSource {
    plan: Vec<PlannedPacket>,
    next: usize,
    pid: Option<Arc<Pid>>,
    props: Vec<(sluice_rt::FourCC, PropValue)>,
    events_seen: Arc<Mutex<Vec<String>>>,
    playing: bool,
}

impl FilterImpl for PlanSource {
    fn initialize(&mut self, filter: &Arc<Filter>) -> Result<()> {
        let pid = filter.new_pid();
        for (key, value) in &self.props {
            pid.set_property(*key, Some(value.clone()))?;
        }
        self.pid = Some(pid);
        Ok(())
    }

    fn configure_pid(
        &mut self,
        _filter: &Arc<Filter>,
        _inst: &Arc<PidInstance>,
        _is_remove: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, _filter: &Arc<Filter>) -> Result<()> {
        if !self.playing {
            return Ok(());
        }
        let pid = self.pid.as_ref().expect("pid created in initialize");
        if self.next >= self.plan.len() {
            pid.set_eos();
            return Err(sluice_rt::Error::Eos);
        }
        let planned = self.plan[self.next].clone();
        self.next += 1;
        let mut pck = pid.new_packet_alloc(planned.payload.len()).expect("alloc");
        pck.data_mut().copy_from_slice(&planned.payload);
        pck.set_cts(planned.cts);
        if planned.duration > 0 {
            pck.set_duration(planned.duration);
        }
        pck.set_framing(planned.framing.0, planned.framing.1);
        pck.send()
    }

    fn process_event(&mut self, _filter: &Arc<Filter>, event: &Event) -> bool {
        self.events_seen.lock().unwrap().push(event.kind.name().to_string());
        if matches!(event.kind, EventKind::Play { .. }) {
            self.playing = true;
        }
        false
    }
}

fn source_register(
    name: &str,
    plan: Vec<PlannedPacket>,
    props: Vec<(sluice_rt::FourCC, PropValue)>,
    events_seen: Arc<Mutex<Vec<String>>>,
) -> FilterRegister {
    let mut reg = FilterRegister::new(name.to_string(), move || {
        Box::new(PlanSource {
            plan: plan.clone(),
            next: 0,
            pid: None,
            props: props.clone(),
            events_seen: Arc::clone(&events_seen),
            playing: false,
        })
    });
    reg.accepts_inputs = false;
    reg
}

/// Forwarding transform: h264 in, raw out, payload untouched.
struct Decoder {
    out_pid: Option<Arc<Pid>>,
}

impl FilterImpl for Decoder {
    fn configure_pid(
        &mut self,
        filter: &Arc<Filter>,
        inst: &Arc<PidInstance>,
        is_remove: bool,
    ) -> Result<()> {
        if is_remove {
            return Ok(());
        }
        if self.out_pid.is_none() {
            let out = filter.new_pid();
            if let Some(src) = inst.pid() {
                out.copy_properties(&src)?;
            }
            out.set_property(keys::CODEC_ID, Some(uint(CODEC_RAW)))?;
            self.out_pid = Some(out);
        }
        Ok(())
    }

    fn process(&mut self, filter: &Arc<Filter>) -> Result<()> {
        let Some(inst) = filter.input_pid(0) else {
            return Ok(());
        };
        let Some(out) = &self.out_pid else {
            return Ok(());
        };
        while let Some(pck) = inst.get_packet() {
            let mut decoded = out.new_packet_alloc(pck.data().len()).expect("alloc");
            decoded.data_mut().copy_from_slice(pck.data());
            decoded.set_cts(pck.cts());
            decoded.set_duration(pck.duration());
            decoded.set_framing(true, true);
            decoded.send()?;
            inst.drop_packet();
        }
        if inst.is_eos() {
            out.set_eos();
        }
        Ok(())
    }
}

fn decoder_register(name: &str, in_codec: u32) -> FilterRegister {
    let mut reg = FilterRegister::new(name.to_string(), || Box::new(Decoder { out_pid: None }));
    reg.caps = vec![
        CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(VIDEO))),
        CapSlot::Item(Capability::input(keys::CODEC_ID, uint(in_codec))),
        CapSlot::Item(Capability::output(keys::STREAM_TYPE, uint(VIDEO))),
        CapSlot::Item(Capability::output(keys::CODEC_ID, uint(CODEC_RAW))),
    ];
    reg
}

/// Pass-through used to test event cancellation mid-chain.
struct CancelingPass {
    out_pid: Option<Arc<Pid>>,
    cancel_play: Arc<AtomicBool>,
}

impl FilterImpl for CancelingPass {
    fn configure_pid(
        &mut self,
        filter: &Arc<Filter>,
        inst: &Arc<PidInstance>,
        is_remove: bool,
    ) -> Result<()> {
        if is_remove {
            return Ok(());
        }
        if self.out_pid.is_none() {
            let out = filter.new_pid();
            if let Some(src) = inst.pid() {
                out.copy_properties(&src)?;
            }
            self.out_pid = Some(out);
        }
        Ok(())
    }

    fn process(&mut self, filter: &Arc<Filter>) -> Result<()> {
        let Some(inst) = filter.input_pid(0) else {
            return Ok(());
        };
        let Some(out) = &self.out_pid else {
            return Ok(());
        };
        while let Some(pck) = inst.get_packet() {
            out.forward_packet(&pck)?;
            inst.drop_packet();
        }
        if inst.is_eos() {
            out.set_eos();
        }
        Ok(())
    }

    fn process_event(&mut self, _filter: &Arc<Filter>, event: &Event) -> bool {
        matches!(event.kind, EventKind::Play { .. }) && self.cancel_play.load(Ordering::Acquire)
    }
}

/// Sink recording everything it sees.
#[derive(Default)]
struct SinkLog {
    cts: Vec<u64>,
    payloads: Vec<Vec<u8>>,
    framings: Vec<(bool, bool)>,
    saw_eos: bool,
}

struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
    full_blocks: bool,
    play_sent: bool,
}

impl FilterImpl for RecordingSink {
    fn configure_pid(
        &mut self,
        _filter: &Arc<Filter>,
        inst: &Arc<PidInstance>,
        is_remove: bool,
    ) -> Result<()> {
        if is_remove {
            return Ok(());
        }
        if self.full_blocks {
            inst.set_framing_mode(true);
        }
        if !self.play_sent {
            self.play_sent = true;
            inst.send_event(Event::play(0.0, 1.0));
        }
        Ok(())
    }

    fn process(&mut self, filter: &Arc<Filter>) -> Result<()> {
        let Some(inst) = filter.input_pid(0) else {
            return Ok(());
        };
        while let Some(pck) = inst.get_packet() {
            let mut log = self.log.lock().unwrap();
            log.cts.push(pck.cts());
            log.payloads.push(pck.data().to_vec());
            log.framings.push(pck.framing());
            inst.drop_packet();
        }
        if inst.is_eos() {
            self.log.lock().unwrap().saw_eos = true;
        }
        Ok(())
    }
}

fn sink_register(
    name: &str,
    in_codec: Option<u32>,
    log: Arc<Mutex<SinkLog>>,
    full_blocks: bool,
) -> FilterRegister {
    let mut reg = FilterRegister::new(name.to_string(), move || {
        Box::new(RecordingSink {
            log: Arc::clone(&log),
            full_blocks,
            play_sent: false,
        })
    });
    if let Some(codec) = in_codec {
        reg.caps = vec![
            CapSlot::Item(Capability::input(keys::STREAM_TYPE, uint(VIDEO))),
            CapSlot::Item(Capability::input(keys::CODEC_ID, uint(codec))),
        ];
    }
    reg
}

fn video_props(codec: u32) -> Vec<(sluice_rt::FourCC, PropValue)> {
    vec![
        (keys::STREAM_TYPE, uint(VIDEO)),
        (keys::CODEC_ID, uint(codec)),
        (keys::TIMESCALE, uint(1000)),
    ]
}

#[test]
fn one_hop_passthrough() {
    setup();
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::new(Mutex::new(SinkLog::default()));
    let session = FilterSession::new(SessionConfig::default());
    session.register(source_register(
        "src",
        vec![
            plain(b"p0", 0, 1000),
            plain(b"p1", 1000, 1000),
            plain(b"p2", 2000, 1000),
        ],
        video_props(CODEC_RAW),
        Arc::clone(&events),
    ));
    session.register(sink_register(
        "sink",
        Some(CODEC_RAW),
        Arc::clone(&log),
        false,
    ));
    session.load("src").unwrap();
    session.load("sink").unwrap();
    session.run().unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.cts, vec![0, 1000, 2000]);
    assert!(log.saw_eos, "sink should observe end of stream");
}

#[test]
fn resolver_inserts_decoder() {
    setup();
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::new(Mutex::new(SinkLog::default()));
    let session = FilterSession::new(SessionConfig::default());
    session.register(source_register(
        "src",
        vec![plain(b"frame", 0, 1000)],
        video_props(CODEC_H264),
        Arc::clone(&events),
    ));
    session.register(decoder_register("vdec", CODEC_H264));
    session.register(sink_register(
        "vout",
        Some(CODEC_RAW),
        Arc::clone(&log),
        false,
    ));
    session.load("src").unwrap();
    session.load("vout").unwrap();
    session.run().unwrap();

    // the decoder was loaded dynamically between source and sink
    let loaded: Vec<String> = session
        .filters()
        .iter()
        .map(|f| f.reg.name.clone())
        .collect();
    assert!(loaded.contains(&"vdec".to_string()), "loaded: {loaded:?}");
    let dynamic = session
        .filters()
        .iter()
        .find(|f| f.reg.name == "vdec")
        .map(|f| f.is_dynamic());
    assert_eq!(dynamic, Some(true));

    let log = log.lock().unwrap();
    assert_eq!(log.payloads, vec![b"frame".to_vec()]);
    assert!(log.saw_eos);
}

#[test]
fn reassembly_through_session() {
    setup();
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::new(Mutex::new(SinkLog::default()));
    let session = FilterSession::new(SessionConfig::default());
    session.register(source_register(
        "src",
        vec![
            PlannedPacket {
                payload: b"aa".to_vec(),
                cts: 0,
                duration: 10,
                framing: (true, false),
            },
            PlannedPacket {
                payload: b"bb".to_vec(),
                cts: 10,
                duration: 10,
                framing: (false, false),
            },
            PlannedPacket {
                payload: b"cc".to_vec(),
                cts: 20,
                duration: 10,
                framing: (false, false),
            },
            PlannedPacket {
                payload: b"dd".to_vec(),
                cts: 30,
                duration: 10,
                framing: (false, true),
            },
        ],
        video_props(CODEC_RAW),
        Arc::clone(&events),
    ));
    session.register(sink_register(
        "sink",
        Some(CODEC_RAW),
        Arc::clone(&log),
        true,
    ));
    session.load("src").unwrap();
    session.load("sink").unwrap();
    session.run().unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.payloads, vec![b"aabbccdd".to_vec()]);
    assert_eq!(log.framings, vec![(true, true)]);
}

#[test]
fn eos_propagates_across_transform() {
    setup();
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::new(Mutex::new(SinkLog::default()));
    let session = FilterSession::new(SessionConfig::default());
    session.register(source_register(
        "src",
        vec![plain(b"x", 0, 1000)],
        video_props(CODEC_H264),
        Arc::clone(&events),
    ));
    session.register(decoder_register("vdec", CODEC_H264));
    session.register(sink_register(
        "vout",
        Some(CODEC_RAW),
        Arc::clone(&log),
        false,
    ));
    session.load("src").unwrap();
    session.load("vout").unwrap();
    session.run().unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.payloads.len(), 1);
    assert!(log.saw_eos, "eos must survive the dynamic chain");
}

#[test]
fn play_event_reaches_source() {
    setup();
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::new(Mutex::new(SinkLog::default()));
    let cancel = Arc::new(AtomicBool::new(false));
    let session = FilterSession::new(SessionConfig::default());
    session.register(source_register(
        "src",
        vec![plain(b"x", 0, 1000)],
        video_props(CODEC_RAW),
        Arc::clone(&events),
    ));
    let cancel_in_factory = Arc::clone(&cancel);
    let mut pass = FilterRegister::new("pass", move || {
        Box::new(CancelingPass {
            out_pid: None,
            cancel_play: Arc::clone(&cancel_in_factory),
        })
    });
    pass.caps = vec![
        CapSlot::Item(Capability::in_out(keys::STREAM_TYPE, uint(VIDEO))),
        CapSlot::Item(Capability::in_out(keys::CODEC_ID, uint(CODEC_RAW))),
    ];
    session.register(pass);
    session.register(sink_register(
        "sink",
        Some(CODEC_RAW),
        Arc::clone(&log),
        false,
    ));
    session.load("src:id=S").unwrap();
    session.load("pass:id=P:sid=S").unwrap();
    session.load("sink:sid=P").unwrap();
    session.run().unwrap();

    let seen = events.lock().unwrap();
    assert!(
        seen.iter().any(|e| e == "Play"),
        "source should observe the sink's Play event, saw {seen:?}"
    );
}

#[test]
fn canceled_event_stops_at_the_canceling_filter() {
    setup();
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::new(Mutex::new(SinkLog::default()));
    let cancel = Arc::new(AtomicBool::new(true));
    let session = FilterSession::new(SessionConfig::default());
    session.register(source_register(
        "src",
        vec![plain(b"x", 0, 1000)],
        video_props(CODEC_RAW),
        Arc::clone(&events),
    ));
    let cancel_in_factory = Arc::clone(&cancel);
    let mut pass = FilterRegister::new("pass", move || {
        Box::new(CancelingPass {
            out_pid: None,
            cancel_play: Arc::clone(&cancel_in_factory),
        })
    });
    pass.caps = vec![
        CapSlot::Item(Capability::in_out(keys::STREAM_TYPE, uint(VIDEO))),
        CapSlot::Item(Capability::in_out(keys::CODEC_ID, uint(CODEC_RAW))),
    ];
    session.register(pass);
    session.register(sink_register(
        "sink",
        Some(CODEC_RAW),
        Arc::clone(&log),
        false,
    ));
    session.load("src:id=S").unwrap();
    session.load("pass:id=P:sid=S").unwrap();
    session.load("sink:sid=P").unwrap();
    session.run().unwrap();

    let seen = events.lock().unwrap();
    assert!(
        !seen.iter().any(|e| e == "Play"),
        "canceled Play must not reach the source, saw {seen:?}"
    );
}

#[test]
fn multithreaded_run_delivers_everything() {
    setup();
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::new(Mutex::new(SinkLog::default()));
    let session = FilterSession::new(SessionConfig {
        threads: 3,
        ..SessionConfig::default()
    });
    let plan: Vec<PlannedPacket> = (0..50)
        .map(|i| plain(format!("pck{i}").as_bytes(), i * 10, 10))
        .collect();
    session.register(source_register(
        "src",
        plan,
        video_props(CODEC_RAW),
        Arc::clone(&events),
    ));
    session.register(sink_register(
        "sink",
        Some(CODEC_RAW),
        Arc::clone(&log),
        false,
    ));
    session.load("src").unwrap();
    session.load("sink").unwrap();
    session.run().unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.cts.len(), 50);
    // strict order on the single source -> sink pair
    let sorted: Vec<u64> = {
        let mut v = log.cts.clone();
        v.sort_unstable();
        v
    };
    assert_eq!(log.cts, sorted);
    assert!(log.saw_eos);
}

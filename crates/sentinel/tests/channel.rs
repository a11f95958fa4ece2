//! Channel behavior end to end: ordering, slot lifecycles, relocation across
//! views, teardown and timeouts.

use std::ffi::CStr;
use std::mem::size_of;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sentinel::{
    AddressSpace, Disposition, Envelope, Executor, FatalPolicy, Message, Outgoing, PackError,
    Packer, Plain, RelocPtr, Sentinel, SentinelClient, SentinelConfig, SentinelError,
    SlotStatus,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config(name: &str) -> SentinelConfig {
    SentinelConfig {
        map_name: format!("sentinel_test_{}_{}", name, std::process::id()),
        shm_dir: std::env::temp_dir(),
        host_channel: true,
        device_channels: 0,
        slot_size: 256,
        slot_count: 4,
        fatal: FatalPolicy::Panic,
        ..SentinelConfig::default()
    }
}

/// Poll `f` until it holds or a few seconds pass.
fn eventually(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

// =============================================================================
// Test messages
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Tag {
    envelope: Envelope,
    value: u64,
    result: u64,
}

unsafe impl Plain for Tag {}

unsafe impl Message for Tag {
    const OPCODE: u32 = 500;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }
}

fn tag(value: u64) -> Outgoing<'static, Tag> {
    Outgoing::new(Tag {
        envelope: Envelope::for_message::<Tag>(true),
        value,
        result: 0,
    })
}

/// Records the order tags are serviced in and answers `value * 10`.
fn tag_executor(log: Arc<Mutex<Vec<u64>>>) -> Executor {
    Executor::new("tags").on(Tag::OPCODE, move |call| {
        let mut msg: Tag = call.read()?;
        log.lock().unwrap().push(msg.value);
        msg.result = msg.value * 10;
        call.write(&msg);
        Ok(Disposition::Done)
    })
}

/// Carries a string to the host; the host answers with it reversed.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Echo {
    envelope: Envelope,
    text: RelocPtr,
    back: RelocPtr,
    /// Address of `text` as the host saw it.
    seen: u64,
}

unsafe impl Plain for Echo {}

unsafe impl Message for Echo {
    const OPCODE: u32 = 501;
    const EXTRA_SIZE: usize = 128;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn pack(&mut self, packer: &mut Packer<'_>) -> Result<(), PackError> {
        self.text = unsafe { packer.copy_cstr(self.text) }?;
        Ok(())
    }
}

fn echo(text: &CStr) -> Outgoing<'_, Echo> {
    unsafe {
        Outgoing::borrowed(Echo {
            envelope: Envelope::for_message::<Echo>(true),
            text: RelocPtr::local(text.as_ptr()),
            back: RelocPtr::null(AddressSpace::Local),
            seen: 0,
        })
    }
}

fn echo_executor() -> Executor {
    Executor::new("echo").on(Echo::OPCODE, |call| {
        let mut msg: Echo = call.read()?;
        let mut reversed = call.c_str(msg.text)?.to_bytes().to_vec();
        reversed.reverse();
        reversed.push(0);
        msg.seen = msg.text.addr();
        call.write(&msg);
        Ok(Disposition::reply(move |packer| {
            let mut msg: Echo = packer.record()?;
            msg.back = packer.push_bytes(&reversed)?;
            packer.set_record(&msg)
        }))
    })
}

/// Offset of the first item packed behind an `Echo`.
const ECHO_ITEM: u64 = ((size_of::<Echo>() + 7) & !7) as u64;

// =============================================================================
// Ordering and slot lifecycle
// =============================================================================

#[test]
fn four_slots_mixed_blocking_are_serviced_in_order() {
    init_tracing();
    let log = Arc::new(Mutex::new(Vec::new()));
    let sentinel = Sentinel::start(test_config("abcd"), Some(tag_executor(log.clone()))).unwrap();
    let host = sentinel.host().unwrap();
    let producer = host.producer();
    let mailbox = producer.mailbox();
    let stride = mailbox.slot_size() as u64;
    let start = mailbox.producer_cursor();

    let a = producer.submit(tag(1)).unwrap();
    producer.post(tag(2)).unwrap();
    let c = producer.submit(tag(3)).unwrap();
    let d = producer.submit(tag(4)).unwrap();
    assert_eq!(
        [a.slot_index(), c.slot_index(), d.slot_index()],
        [0, 2, 3]
    );

    eventually("D to complete", || d.is_complete());
    assert_eq!(*log.lock().unwrap(), vec![1, 2, 3, 4]);

    // Blocking slots wait in COMPLETE for their producers; B went straight
    // back to FREE.
    assert_eq!(a.status(), Some(SlotStatus::Complete));
    assert_eq!(mailbox.slot(1).header.status(), Some(SlotStatus::Free));
    assert_eq!(c.status(), Some(SlotStatus::Complete));

    assert_eq!(a.wait().unwrap().result, 10);
    assert_eq!(c.wait().unwrap().result, 30);
    assert_eq!(d.wait().unwrap().result, 40);
    for i in 0..4 {
        assert_eq!(mailbox.slot(i).header.status(), Some(SlotStatus::Free));
    }

    assert_eq!(mailbox.producer_cursor(), start + 4 * stride);
    eventually("consumer cursor", || mailbox.consumer_cursor() == start + 4 * stride);

    let metrics = host.metrics().snapshot();
    assert_eq!(metrics.serviced, 4);
    assert_eq!(metrics.blocking, 3);
    assert_eq!(metrics.fire_and_forget, 1);
}

#[test]
fn fifo_holds_across_ring_wraps() {
    init_tracing();
    let log = Arc::new(Mutex::new(Vec::new()));
    let sentinel = Sentinel::start(test_config("wrap"), Some(tag_executor(log.clone()))).unwrap();
    let producer = sentinel.host().unwrap().producer();
    let mailbox = producer.mailbox();

    for value in 0..20 {
        producer.post(tag(value)).unwrap();
    }
    // One blocking call behind them all.
    assert_eq!(producer.call(tag(20)).unwrap().result, 200);

    assert_eq!(*log.lock().unwrap(), (0..=20).collect::<Vec<_>>());
    assert_eq!(mailbox.producer_cursor(), 21 * mailbox.slot_size() as u64);
    eventually("consumer cursor", || {
        mailbox.consumer_cursor() == mailbox.producer_cursor()
    });
}

#[test]
fn concurrent_producers_are_each_serviced_once() {
    init_tracing();
    let log = Arc::new(Mutex::new(Vec::new()));
    let sentinel = Sentinel::start(test_config("concurrent"), Some(tag_executor(log.clone()))).unwrap();
    let producer = sentinel.host().unwrap().producer().clone();

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let producer = producer.clone();
            thread::spawn(move || {
                for i in 0..25u64 {
                    let value = t * 100 + i;
                    assert_eq!(producer.call(tag(value)).unwrap().result, value * 10);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut seen = log.lock().unwrap().clone();
    assert_eq!(seen.len(), 100);
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 100);
}

#[test]
fn unrecognized_opcode_is_claimed_by_base() {
    init_tracing();
    let sentinel = Sentinel::start(test_config("unclaimed"), None).unwrap();
    let host = sentinel.host().unwrap();
    let reply = host.producer().call(tag(7)).unwrap();
    assert_eq!(reply.result, 0);
    assert_eq!(host.metrics().snapshot().unclaimed, 1);
}

// =============================================================================
// Relocation
// =============================================================================

#[test]
fn device_pointers_shift_by_offset_and_back() {
    init_tracing();
    let config = SentinelConfig {
        host_channel: false,
        device_channels: 1,
        ..test_config("device")
    };
    let sentinel = Sentinel::start(config, Some(echo_executor())).unwrap();
    let device = sentinel.device(0).unwrap();
    let producer = device.producer();
    let offset = device.relocation().offset();
    assert_ne!(offset, 0);
    assert_eq!(producer.space(), AddressSpace::Device);

    let pending = producer.submit(echo(c"ping")).unwrap();
    let device_data = producer.mailbox().slot(pending.slot_index()).data_addr();
    let (msg, back) = pending
        .wait_with(|msg, window| Ok((*msg, window.c_str(msg.back)?.to_bytes().to_vec())))
        .unwrap();

    // Device address p reaches the host as p + offset.
    assert_eq!(msg.text.space(), Some(AddressSpace::Host));
    assert_eq!(msg.seen, (device_data + ECHO_ITEM).wrapping_add_signed(offset));

    // The host's reply comes back shifted by -offset.
    assert_eq!(msg.back.space(), Some(AddressSpace::Device));
    assert_eq!(msg.back.addr(), device_data + ECHO_ITEM);
    assert_eq!(back, b"gnip");
}

#[test]
fn host_and_device_channels_have_independent_offsets() {
    init_tracing();
    let config = SentinelConfig {
        device_channels: 2,
        ..test_config("offsets")
    };
    let sentinel = Sentinel::start(config, Some(echo_executor())).unwrap();
    let host = sentinel.host().unwrap();
    assert_eq!(host.relocation().offset(), 0);

    let d0 = sentinel.device(0).unwrap().relocation();
    let d1 = sentinel.device(1).unwrap().relocation();
    assert_ne!(d0.offset(), 0);
    assert_ne!(d1.offset(), 0);
    assert_eq!(d0.inverse().offset(), -d0.offset());

    for channel in sentinel.devices().iter().chain(sentinel.host()) {
        let back = channel
            .producer()
            .call_with(echo(c"abc"), |msg, window| {
                Ok(window.c_str(msg.back)?.to_bytes().to_vec())
            })
            .unwrap();
        assert_eq!(back, b"cba");
    }
}

#[test]
fn client_attaches_by_name_with_its_own_offset() {
    init_tracing();
    let config = test_config("client");
    let sentinel = Sentinel::start(config.clone(), Some(echo_executor())).unwrap();
    let client = SentinelClient::connect(&config).unwrap();
    let producer = client.producer();

    let offset = producer.relocation().offset();
    assert_ne!(offset, 0);
    assert_eq!(producer.space(), AddressSpace::Client);
    assert_eq!(
        producer.mailbox().origin(),
        sentinel.host().unwrap().producer().mailbox().region().addr()
    );

    let pending = producer.submit(echo(c"client")).unwrap();
    let client_data = producer.mailbox().slot(pending.slot_index()).data_addr();
    let (msg, back) = pending
        .wait_with(|msg, window| Ok((*msg, window.c_str(msg.back)?.to_bytes().to_vec())))
        .unwrap();
    assert_eq!(msg.seen, (client_data + ECHO_ITEM).wrapping_add_signed(offset));
    assert_eq!(msg.back.space(), Some(AddressSpace::Client));
    assert_eq!(msg.back.addr(), client_data + ECHO_ITEM);
    assert_eq!(back, b"tneilc");

    // The in-process producer shares the ring and still gets replies in its
    // own view.
    let host = sentinel.host().unwrap().producer();
    let (space, back) = host
        .call_with(echo(c"host"), |msg, window| {
            Ok((msg.back.space(), window.c_str(msg.back)?.to_bytes().to_vec()))
        })
        .unwrap();
    assert_eq!(space, Some(AddressSpace::Local));
    assert_eq!(back, b"tsoh");

    let back = producer
        .call_with(echo(c"again"), |msg, window| {
            Ok(window.c_str(msg.back)?.to_bytes().to_vec())
        })
        .unwrap();
    assert_eq!(back, b"niaga");
}

#[test]
fn connecting_to_a_missing_mapping_fails() {
    let err = SentinelClient::connect(&test_config("missing")).err().unwrap();
    assert!(matches!(err, SentinelError::Io(_)), "{err}");
}

// =============================================================================
// Teardown and timeouts
// =============================================================================

#[test]
fn shutdown_releases_producers_waiting_for_a_slot() {
    init_tracing();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut sentinel = Sentinel::start(test_config("teardown"), Some(tag_executor(log))).unwrap();
    let producer = sentinel.host().unwrap().producer().clone();

    // Fill the ring with completed calls nobody collects.
    let held: Vec<_> = (0..4).map(|v| producer.submit(tag(v)).unwrap()).collect();
    for pending in &held {
        eventually("held call to complete", || pending.is_complete());
    }

    let blocked = {
        let producer = producer.clone();
        thread::spawn(move || producer.call(tag(99)))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!blocked.is_finished());

    sentinel.shutdown();
    assert!(matches!(
        blocked.join().unwrap(),
        Err(SentinelError::ChannelClosed)
    ));
    assert!(matches!(
        producer.post(tag(100)),
        Err(SentinelError::ChannelClosed)
    ));

    // Calls completed before teardown still hand back their results.
    for (v, pending) in held.into_iter().enumerate() {
        assert_eq!(pending.wait().unwrap().result, v as u64 * 10);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Slow {
    envelope: Envelope,
}

unsafe impl Plain for Slow {}

unsafe impl Message for Slow {
    const OPCODE: u32 = 502;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }
}

#[test]
fn unclaimed_call_times_out_and_is_retired() {
    init_tracing();
    let (release, gate) = mpsc::channel::<()>();
    let gate = Mutex::new(gate);
    let log = Arc::new(Mutex::new(Vec::new()));
    let executor = tag_executor(log.clone()).on(Slow::OPCODE, move |_| {
        let _ = gate.lock().unwrap().recv();
        Ok(Disposition::Done)
    });

    let mut config = test_config("timeout");
    config.wait.timeout = Some(Duration::from_millis(50));
    let sentinel = Sentinel::start(config, Some(executor)).unwrap();
    let host = sentinel.host().unwrap();
    let producer = host.producer();

    // Keep the consumer busy.
    let slow = producer
        .submit(Outgoing::new(Slow {
            envelope: Envelope::for_message::<Slow>(true),
        }))
        .unwrap();
    eventually("slow call to be claimed", || {
        slow.status() == Some(SlotStatus::Claimed)
    });

    let err = producer.call(tag(5)).unwrap_err();
    match err {
        SentinelError::Timeout { waited } => assert!(waited >= Duration::from_millis(50)),
        other => panic!("expected timeout, got {other}"),
    }

    // A claimed call is never recalled, however long it takes.
    thread::sleep(Duration::from_millis(60));
    release.send(()).unwrap();
    slow.wait().unwrap();

    eventually("cancelled call to be retired", || {
        host.metrics().snapshot().cancelled == 1
    });
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(producer.mailbox().slot(1).header.status(), Some(SlotStatus::Free));

    // The ring carries on past the retired slot.
    assert_eq!(producer.call(tag(6)).unwrap().result, 60);
    assert_eq!(*log.lock().unwrap(), vec![6]);
}

//! Channels.
//!
//! A channel is one mailbox, the relocation between its producer view and
//! the host view, and the consumer thread that services it. Producers post
//! through a [`Producer`]; the [`Channel`] owns the consumer.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::RwLock;
use sentinel_shm::{
    AddressSpace, Mailbox, MailboxStatus, Relocation, Slot, SlotStatus,
};

use crate::config::WaitPolicy;
use crate::error::{CallError, SentinelError};
use crate::executor::{BASE_EXECUTOR, Call, Disposition, ExecutorChain};
use crate::fault::{self, FatalPolicy, Fault};
use crate::message::{Envelope, EnvelopeFlags, Message, Outgoing};
use crate::metrics::ChannelMetrics;
use crate::packer::Packer;
use crate::window::SlotWindow;

/// Which channel of a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Host,
    Device(usize),
}

impl ChannelKind {
    pub fn thread_name(&self) -> String {
        match self {
            Self::Host => "sentinel-host".to_string(),
            Self::Device(n) => format!("sentinel-device-{}", n),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Device(n) => write!(f, "device {}", n),
        }
    }
}

/// Whatever keeps a channel's memory mapped.
pub(crate) type Backing = Arc<dyn Any + Send + Sync>;

// =============================================================================
// Producer side
// =============================================================================

/// Posts messages into a channel.
///
/// Cloning is cheap; clones post into the same mailbox and keep its memory
/// mapped.
#[derive(Clone)]
pub struct Producer {
    kind: ChannelKind,
    mailbox: Mailbox,
    /// Producer view to host view.
    relocation: Relocation,
    wait: WaitPolicy,
    fatal: FatalPolicy,
    _backing: Backing,
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("kind", &self.kind)
            .field("relocation", &self.relocation)
            .field("status", &self.mailbox.status())
            .finish_non_exhaustive()
    }
}

impl Producer {
    pub(crate) fn new(
        kind: ChannelKind,
        mailbox: Mailbox,
        relocation: Relocation,
        wait: WaitPolicy,
        fatal: FatalPolicy,
        backing: Backing,
    ) -> Self {
        Self {
            kind,
            mailbox,
            relocation,
            wait,
            fatal,
            _backing: backing,
        }
    }

    #[inline]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// The mailbox as this producer maps it.
    #[inline]
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    #[inline]
    pub fn relocation(&self) -> Relocation {
        self.relocation
    }

    /// The address space replies are packed for.
    #[inline]
    pub fn space(&self) -> AddressSpace {
        self.relocation.from()
    }

    pub fn status(&self) -> MailboxStatus {
        self.mailbox.status()
    }

    /// Post a fire-and-forget message. Returns once it is in the ring.
    pub fn post<M: Message>(&self, msg: Outgoing<'_, M>) -> Result<(), SentinelError> {
        self.compose(msg, false).map(|_| ())
    }

    /// Post a blocking message and return a handle to wait on.
    pub fn submit<M: Message>(&self, msg: Outgoing<'_, M>) -> Result<PendingCall<'_, M>, SentinelError> {
        let index = self.compose(msg, true)?;
        Ok(PendingCall {
            producer: self,
            index,
            posted_at: Instant::now(),
            settled: false,
            _msg: PhantomData,
        })
    }

    /// Post a blocking message and wait for its record.
    pub fn call<M: Message>(&self, msg: Outgoing<'_, M>) -> Result<M, SentinelError> {
        self.submit(msg)?.wait()
    }

    /// Post a blocking message, then read the completed record and anything
    /// the consumer packed behind it.
    pub fn call_with<M, R, F>(&self, msg: Outgoing<'_, M>, f: F) -> Result<R, SentinelError>
    where
        M: Message,
        F: FnOnce(&M, &SlotWindow<'_>) -> Result<R, CallError>,
    {
        self.submit(msg)?.wait_with(f)
    }

    /// Reserve a slot, pack `msg` into it and post it. Returns the slot index.
    fn compose<M: Message>(&self, msg: Outgoing<'_, M>, wait: bool) -> Result<u32, SentinelError> {
        let needed = size_of::<M>() + M::EXTRA_SIZE;
        let available = self.mailbox.data_capacity();
        if needed > available {
            fault::raise(
                Fault::MessageTooLong {
                    channel: self.kind,
                    opcode: M::OPCODE,
                    needed,
                    available,
                },
                self.fatal,
            );
        }
        if self.mailbox.is_closed() {
            return Err(SentinelError::ChannelClosed);
        }

        // The cursor is ours from here on; the consumer will wait on this
        // slot until something is posted to it. The slot is only ours once
        // the consumer is within a lap, so a producer a lap ahead cannot take
        // it from the earlier cursor's owner.
        let cursor = self.mailbox.reserve_cursor();
        let slot = self.mailbox.slot_at(cursor);
        let mut backoff = self.wait.backoff();
        while !self.mailbox.is_in_lap(cursor) || slot.header.try_reserve().is_err() {
            if self.mailbox.is_closed() {
                return Err(SentinelError::ChannelClosed);
            }
            self.wait.pause(&mut backoff);
        }

        let mut record = msg.into_record();
        *record.envelope_mut() = Envelope::for_message::<M>(wait);

        // SAFETY: the slot is COMPOSING and owned by this producer.
        let data = unsafe { slot.data_mut() };
        let packed = Packer::new(
            data,
            slot.data_addr(),
            self.relocation,
            size_of::<M>(),
            M::EXTRA_SIZE,
        )
        .and_then(|mut packer| {
            record.pack(&mut packer)?;
            packer.set_record(&record)
        });
        if let Err(e) = packed {
            fault::raise(Fault::from_pack(self.kind, M::OPCODE, e), self.fatal);
        }

        slot.header.post(size_of::<M>() as u32, self.relocation);
        tracing::trace!(
            channel = %self.kind,
            slot = slot.index(),
            cursor,
            opcode = M::OPCODE,
            wait,
            "posted"
        );
        Ok(slot.index())
    }
}

/// A posted blocking call.
///
/// Dropping it without waiting still waits for completion and frees the
/// slot.
pub struct PendingCall<'p, M: Message> {
    producer: &'p Producer,
    index: u32,
    posted_at: Instant,
    /// The slot no longer belongs to this call.
    settled: bool,
    _msg: PhantomData<fn() -> M>,
}

impl<M: Message> PendingCall<'_, M> {
    #[inline]
    pub fn slot_index(&self) -> u32 {
        self.index
    }

    fn slot(&self) -> Slot<'_> {
        self.producer.mailbox.slot(self.index)
    }

    /// Current status of the call's slot.
    pub fn status(&self) -> Option<SlotStatus> {
        self.slot().header.status()
    }

    pub fn is_complete(&self) -> bool {
        self.slot().header.is_complete()
    }

    /// Wait for the consumer and return the completed record.
    pub fn wait(self) -> Result<M, SentinelError> {
        self.wait_with(|record, _| Ok(*record))
    }

    /// Wait for the consumer, then run `f` over the completed record and the
    /// slot window (for following reply pointers) before the slot is freed.
    pub fn wait_with<R, F>(mut self, f: F) -> Result<R, SentinelError>
    where
        F: FnOnce(&M, &SlotWindow<'_>) -> Result<R, CallError>,
    {
        self.await_complete()?;
        let producer = self.producer;
        let slot = producer.mailbox.slot(self.index);
        let result = {
            // SAFETY: a COMPLETE slot belongs to the producer waiting on it.
            let window = SlotWindow::new(
                unsafe { slot.data_mut() },
                slot.data_addr(),
                producer.space(),
            );
            window
                .read_record::<M>(slot.header.length() as usize)
                .and_then(|record| f(&record, &window))
                .map_err(SentinelError::Reply)
        };
        self.release();
        result
    }

    fn await_complete(&mut self) -> Result<(), SentinelError> {
        let producer = self.producer;
        let slot = producer.mailbox.slot(self.index);
        let mut backoff = producer.wait.backoff();
        loop {
            if slot.header.is_complete() {
                return Ok(());
            }
            if producer.mailbox.is_closed() {
                self.settled = true;
                return Err(SentinelError::ChannelClosed);
            }
            if let Some(timeout) = producer.wait.timeout {
                let waited = self.posted_at.elapsed();
                if waited >= timeout && self.recall() {
                    self.settled = true;
                    tracing::debug!(
                        channel = %producer.kind,
                        slot = self.index,
                        ?waited,
                        "recalled unclaimed call"
                    );
                    return Err(SentinelError::Timeout { waited });
                }
            }
            producer.wait.pause(&mut backoff);
        }
    }

    /// Take back an unclaimed call and repost it as cancelled, so the
    /// consumer retires the slot in cursor order.
    fn recall(&self) -> bool {
        let slot = self.slot();
        if !slot.header.recall() {
            return false;
        }
        // SAFETY: recall() moved the slot back to COMPOSING for us.
        let mut window = SlotWindow::new(
            unsafe { slot.data_mut() },
            slot.data_addr(),
            self.producer.space(),
        );
        if let Ok(mut envelope) = window.read_record::<Envelope>(size_of::<Envelope>()) {
            envelope.flags.remove(EnvelopeFlags::WAIT);
            envelope.flags.insert(EnvelopeFlags::CANCELLED);
            window.write_record(&envelope);
        }
        slot.header.post(slot.header.length(), self.producer.relocation);
        true
    }

    fn release(&mut self) {
        if let Err(e) = self.slot().header.release() {
            tracing::warn!(channel = %self.producer.kind, slot = self.index, error = %e, "release failed");
        }
        self.settled = true;
    }
}

impl<M: Message> Drop for PendingCall<'_, M> {
    fn drop(&mut self) {
        if !self.settled && self.await_complete().is_ok() {
            self.release();
        }
    }
}

// =============================================================================
// Consumer side
// =============================================================================

struct Consumer {
    kind: ChannelKind,
    /// The mailbox as the host maps it.
    mailbox: Mailbox,
    chain: Arc<RwLock<ExecutorChain>>,
    stop: Arc<AtomicBool>,
    wait: WaitPolicy,
    fatal: FatalPolicy,
    metrics: Arc<ChannelMetrics>,
    _backing: Backing,
}

impl Consumer {
    fn run(self) {
        tracing::debug!(channel = %self.kind, "consumer started");
        let mut backoff = self.wait.backoff();
        'serve: loop {
            let slot = self.mailbox.slot_at(self.mailbox.consumer_cursor());
            backoff.reset();
            while slot.header.try_claim().is_err() {
                if self.stop.load(Ordering::Acquire) {
                    break 'serve;
                }
                self.wait.pause(&mut backoff);
            }
            self.service(slot);
            self.mailbox.advance_consumer();
        }
        tracing::debug!(
            channel = %self.kind,
            cursor = self.mailbox.consumer_cursor(),
            "consumer stopped"
        );
    }

    #[cold]
    fn fault(&self, fault: Fault) -> ! {
        fault::raise(fault, self.fatal)
    }

    fn service(&self, slot: Slot<'_>) {
        let index = slot.index();
        let Ok(length) = slot.header.verify() else {
            self.fault(Fault::BadMagic {
                channel: self.kind,
                slot: index,
                found: slot.header.magic(),
            });
        };
        let length = length as usize;
        // Producer view to host view; replies go back through the inverse.
        let Ok(relocation) = slot.header.relocation() else {
            self.fault(Fault::UnknownSpace {
                channel: self.kind,
                slot: index,
                found: slot.header.space_raw(),
            });
        };

        let base = slot.data_addr();
        // SAFETY: the slot is CLAIMED by this consumer.
        let data = unsafe { slot.data_mut() };
        let capacity = data.len();
        let window = SlotWindow::new(data, base, AddressSpace::Host);

        let envelope = match window.read_record::<Envelope>(length) {
            Ok(envelope) => envelope,
            Err(error) => self.fault(Fault::Malformed {
                channel: self.kind,
                opcode: 0,
                error,
            }),
        };
        let opcode = envelope.opcode;

        if envelope.is_cancelled() {
            tracing::trace!(channel = %self.kind, slot = index, opcode, "retired cancelled call");
            slot.header.finish(false);
            self.metrics.record_cancelled();
            return;
        }

        let wait = envelope.is_wait();
        let extra = envelope.extra_size as usize;
        if length + extra > capacity {
            self.fault(Fault::MessageTooLong {
                channel: self.kind,
                opcode,
                needed: length + extra,
                available: capacity,
            });
        }

        tracing::trace!(
            channel = %self.kind,
            slot = index,
            opcode,
            flags = ?envelope.flags,
            length,
            extra,
            "claimed"
        );

        let mut call = Call::new(self.kind, envelope, length, window);
        let dispatched = match self.chain.read().dispatch(&mut call) {
            Ok(dispatched) => dispatched,
            Err(error) => self.fault(Fault::Malformed {
                channel: self.kind,
                opcode,
                error,
            }),
        };
        if dispatched.executor == BASE_EXECUTOR {
            self.metrics.record_unclaimed();
        }

        if let Disposition::Reply(reply) = dispatched.disposition {
            let data = call.into_window().into_data();
            let packed = Packer::new(data, base, relocation.inverse(), length, extra)
                .and_then(|mut packer| reply(&mut packer));
            if let Err(e) = packed {
                self.fault(Fault::from_pack(self.kind, opcode, e));
            }
            self.metrics.record_reply();
        }

        self.metrics.record_service(wait);
        let next = slot.header.finish(wait);
        tracing::trace!(
            channel = %self.kind,
            slot = index,
            executor = %dispatched.executor,
            status = %next,
            "serviced"
        );
    }
}

// =============================================================================
// Channel
// =============================================================================

/// A running channel: the producer handle and the consumer thread.
///
/// Dropping the channel shuts it down.
pub struct Channel {
    kind: ChannelKind,
    producer: Producer,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    metrics: Arc<ChannelMetrics>,
}

impl Channel {
    /// Start the consumer for `consumer_mailbox` (the host view of the
    /// mailbox `producer` posts into).
    pub(crate) fn start(
        consumer_mailbox: Mailbox,
        producer: Producer,
        chain: Arc<RwLock<ExecutorChain>>,
    ) -> Result<Self, SentinelError> {
        let kind = producer.kind;
        let stop = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(ChannelMetrics::new());

        let consumer = Consumer {
            kind,
            mailbox: consumer_mailbox,
            chain,
            stop: stop.clone(),
            wait: producer.wait,
            fatal: producer.fatal,
            metrics: metrics.clone(),
            _backing: producer._backing.clone(),
        };
        let thread = thread::Builder::new()
            .name(kind.thread_name())
            .spawn(move || consumer.run())?;

        tracing::info!(
            channel = %kind,
            slots = consumer_mailbox.slot_count(),
            slot_size = consumer_mailbox.slot_size(),
            offset = producer.relocation.offset(),
            "channel started"
        );

        Ok(Self {
            kind,
            producer,
            stop,
            thread: Some(thread),
            metrics,
        })
    }

    #[inline]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    #[inline]
    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    #[inline]
    pub fn relocation(&self) -> Relocation {
        self.producer.relocation
    }

    pub fn metrics(&self) -> &ChannelMetrics {
        &self.metrics
    }

    pub fn status(&self) -> MailboxStatus {
        self.producer.status()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Stop the consumer and close the mailbox.
    ///
    /// The consumer finishes anything already posted that it reaches before
    /// it sees the stop flag. Producers still waiting afterwards get
    /// [`SentinelError::ChannelClosed`].
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        if thread.join().is_err() {
            tracing::error!(channel = %self.kind, "consumer thread panicked");
        }
        self.producer.mailbox.close();
        let metrics = self.metrics.snapshot();
        tracing::info!(
            channel = %self.kind,
            serviced = metrics.serviced,
            cancelled = metrics.cancelled,
            "channel closed"
        );
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.kind)
            .field("producer", &self.producer)
            .field("running", &self.is_running())
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_shm::HeapRegion;

    /// An in-process channel over heap memory.
    fn heap_channel(chain: ExecutorChain) -> Channel {
        let heap = Arc::new(HeapRegion::new_zeroed(Mailbox::required_size(256, 4)));
        let mailbox = unsafe { Mailbox::init(heap.region(), 256, 4) }.unwrap();
        let producer = Producer::new(
            ChannelKind::Host,
            mailbox,
            Relocation::identity(AddressSpace::Local, AddressSpace::Host),
            WaitPolicy::default(),
            FatalPolicy::Panic,
            heap,
        );
        Channel::start(mailbox, producer, Arc::new(RwLock::new(chain))).unwrap()
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct Add {
        envelope: Envelope,
        a: u64,
        b: u64,
        sum: u64,
    }

    unsafe impl crate::message::Plain for Add {}

    unsafe impl Message for Add {
        const OPCODE: u32 = 900;

        fn envelope(&self) -> &Envelope {
            &self.envelope
        }

        fn envelope_mut(&mut self) -> &mut Envelope {
            &mut self.envelope
        }
    }

    fn add(a: u64, b: u64) -> Outgoing<'static, Add> {
        Outgoing::new(Add {
            envelope: Envelope::for_message::<Add>(true),
            a,
            b,
            sum: 0,
        })
    }

    fn adder() -> ExecutorChain {
        let mut chain = ExecutorChain::new();
        chain.register(
            crate::executor::Executor::new("adder").on(Add::OPCODE, |call| {
                let mut msg: Add = call.read()?;
                msg.sum = msg.a + msg.b;
                call.write(&msg);
                Ok(Disposition::Done)
            }),
            crate::executor::Placement::Default,
        );
        chain
    }

    #[test]
    fn blocking_call_returns_result_and_frees_slot() {
        let channel = heap_channel(adder());
        let reply = channel.producer().call(add(2, 40)).unwrap();
        assert_eq!(reply.sum, 42);
        assert_eq!(
            channel.producer().mailbox().slot(0).header.status(),
            Some(SlotStatus::Free)
        );
        assert_eq!(channel.metrics().snapshot().blocking, 1);
    }

    #[test]
    fn shutdown_closes_mailbox() {
        let mut channel = heap_channel(adder());
        let producer = channel.producer().clone();
        channel.shutdown();
        assert_eq!(channel.status(), MailboxStatus::Closed);
        assert!(matches!(
            producer.call(add(1, 1)),
            Err(SentinelError::ChannelClosed)
        ));
    }

    #[test]
    fn next_lap_producer_waits_for_the_earlier_cursor() {
        let heap = Arc::new(HeapRegion::new_zeroed(Mailbox::required_size(256, 2)));
        let mailbox = unsafe { Mailbox::init(heap.region(), 256, 2) }.unwrap();
        let local = Relocation::identity(AddressSpace::Local, AddressSpace::Host);
        // No consumer thread; the test services the ring by hand.
        let producer = Producer::new(
            ChannelKind::Host,
            mailbox,
            local,
            WaitPolicy::default(),
            FatalPolicy::Panic,
            heap,
        );

        // Both first-lap cursors are reserved but their slots not yet taken.
        let first = mailbox.reserve_cursor();
        let _second = mailbox.reserve_cursor();

        let late = {
            let producer = producer.clone();
            thread::spawn(move || producer.post(add(1, 2)))
        };
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!late.is_finished());
        assert_eq!(mailbox.slot_at(first).header.status(), Some(SlotStatus::Free));

        // The first cursor's owner posts and the consumer gets past it.
        let slot = mailbox.slot_at(first);
        slot.header.try_reserve().unwrap();
        slot.header.post(size_of::<Envelope>() as u32, local);
        slot.header.try_claim().unwrap();
        slot.header.finish(false);
        mailbox.advance_consumer();

        late.join().unwrap().unwrap();
        assert_eq!(slot.header.status(), Some(SlotStatus::Posted));
        assert_eq!(mailbox.slot(1).header.status(), Some(SlotStatus::Free));
        assert_eq!(mailbox.producer_cursor(), 3 * 256);
    }

    #[test]
    fn thread_names_follow_kind() {
        assert_eq!(ChannelKind::Host.thread_name(), "sentinel-host");
        assert_eq!(ChannelKind::Device(2).thread_name(), "sentinel-device-2");
        assert_eq!(ChannelKind::Device(2).to_string(), "device 2");
    }
}

//! Executors and the dispatch chain.
//!
//! An [`Executor`] maps opcodes to handlers. Executors are linked into an
//! [`ExecutorChain`]; the consumer offers each claimed message to the chain
//! head first and walks toward the tail until some executor claims it. The
//! base executor sits at the tail of every chain and claims everything, so
//! every message gets a defined outcome.

use std::borrow::Cow;
use std::collections::HashMap;
use std::ffi::CStr;
use std::fmt;
use std::sync::Arc;

use sentinel_shm::RelocPtr;

use crate::channel::ChannelKind;
use crate::error::CallError;
use crate::message::{Envelope, Message};
use crate::packer::{PackError, Packer};
use crate::window::SlotWindow;

/// Name of the executor every chain ends with.
pub const BASE_EXECUTOR: &str = "base";

/// Runs after dispatch to pack data behind the record for the producer.
pub type ReplyFn = Box<dyn FnOnce(&mut Packer<'_>) -> Result<(), PackError> + Send>;

/// What an executor did with a message.
pub enum Disposition {
    /// Claimed and serviced; results are in the record.
    Done,
    /// Not claimed; offer it to the next executor.
    Decline,
    /// Claimed; pack a reply behind the record once dispatch returns.
    Reply(ReplyFn),
}

impl Disposition {
    pub fn reply<F>(f: F) -> Self
    where
        F: FnOnce(&mut Packer<'_>) -> Result<(), PackError> + Send + 'static,
    {
        Self::Reply(Box::new(f))
    }

    #[inline]
    pub fn is_claimed(&self) -> bool {
        !matches!(self, Self::Decline)
    }
}

impl fmt::Debug for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => f.write_str("Done"),
            Self::Decline => f.write_str("Decline"),
            Self::Reply(_) => f.write_str("Reply(..)"),
        }
    }
}

/// Services one opcode.
///
/// Returning an error means the record itself is invalid, which the consumer
/// treats as a fatal fault. Failures of the proxied operation belong in the
/// record's result field instead.
pub trait Handler: Send + Sync {
    fn handle(&self, call: &mut Call<'_>) -> Result<Disposition, CallError>;
}

impl<F> Handler for F
where
    F: Fn(&mut Call<'_>) -> Result<Disposition, CallError> + Send + Sync,
{
    fn handle(&self, call: &mut Call<'_>) -> Result<Disposition, CallError> {
        self(call)
    }
}

/// A claimed message as handlers see it.
pub struct Call<'a> {
    channel: ChannelKind,
    envelope: Envelope,
    length: usize,
    window: SlotWindow<'a>,
}

impl<'a> Call<'a> {
    pub fn new(
        channel: ChannelKind,
        envelope: Envelope,
        length: usize,
        window: SlotWindow<'a>,
    ) -> Self {
        Self {
            channel,
            envelope,
            length,
            window,
        }
    }

    #[inline]
    pub fn channel(&self) -> ChannelKind {
        self.channel
    }

    #[inline]
    pub fn opcode(&self) -> u32 {
        self.envelope.opcode
    }

    #[inline]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Record length reported by the slot.
    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    /// The record as `M`. Fails if the opcode or length does not match.
    pub fn read<M: Message>(&self) -> Result<M, CallError> {
        if self.envelope.opcode != M::OPCODE {
            return Err(CallError::OpcodeMismatch {
                expected: M::OPCODE,
                found: self.envelope.opcode,
            });
        }
        self.window.read_record(self.length)
    }

    /// Write the record back (results included).
    pub fn write<M: Message>(&mut self, record: &M) {
        self.window.write_record(record);
    }

    pub fn c_str(&self, ptr: RelocPtr) -> Result<&CStr, CallError> {
        self.window.c_str(ptr)
    }

    pub fn bytes(&self, ptr: RelocPtr, len: usize) -> Result<&[u8], CallError> {
        self.window.bytes(ptr, len)
    }

    pub fn bytes_mut(&mut self, ptr: RelocPtr, len: usize) -> Result<&mut [u8], CallError> {
        self.window.bytes_mut(ptr, len)
    }

    pub(crate) fn into_window(self) -> SlotWindow<'a> {
        self.window
    }
}

/// A named set of opcode handlers.
#[derive(Clone)]
pub struct Executor {
    name: Cow<'static, str>,
    tag: u64,
    handlers: HashMap<u32, Arc<dyn Handler>>,
    fallback: Option<Arc<dyn Handler>>,
}

impl Executor {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            tag: 0,
            handlers: HashMap::new(),
            fallback: None,
        }
    }

    /// Attach an opaque tag for the embedding application.
    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// Handle `opcode`. Replaces any previous handler for it.
    pub fn on<F>(self, opcode: u32, handler: F) -> Self
    where
        F: Fn(&mut Call<'_>) -> Result<Disposition, CallError> + Send + Sync + 'static,
    {
        self.on_handler(opcode, Arc::new(handler))
    }

    pub fn on_handler(mut self, opcode: u32, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(opcode, handler);
        self
    }

    /// Handle every opcode without a specific handler.
    pub fn fallback<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Call<'_>) -> Result<Disposition, CallError> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(handler));
        self
    }

    /// The executor installed at the tail of every chain. It claims every
    /// message and logs the ones nobody recognized.
    pub fn base() -> Self {
        Self::new(BASE_EXECUTOR).fallback(|call| {
            tracing::warn!(
                channel = %call.channel(),
                opcode = call.opcode(),
                length = call.length(),
                "unrecognized opcode"
            );
            Ok(Disposition::Done)
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn handles(&self, opcode: u32) -> bool {
        self.fallback.is_some() || self.handlers.contains_key(&opcode)
    }

    pub fn opcodes(&self) -> Vec<u32> {
        let mut ops: Vec<u32> = self.handlers.keys().copied().collect();
        ops.sort_unstable();
        ops
    }

    fn handle(&self, call: &mut Call<'_>) -> Result<Disposition, CallError> {
        match self.handlers.get(&call.opcode()).or(self.fallback.as_ref()) {
            Some(handler) => handler.handle(call),
            None => Ok(Disposition::Decline),
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("opcodes", &self.opcodes())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Where a newly registered executor goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// New head of the chain.
    #[default]
    Default,
    /// Right after the current head.
    Secondary,
}

/// Result of offering a message to a chain.
#[derive(Debug)]
pub struct Dispatched {
    /// Name of the executor that claimed the message.
    pub executor: Cow<'static, str>,
    pub disposition: Disposition,
}

/// An ordered list of executors ending with the base executor.
#[derive(Debug, Clone)]
pub struct ExecutorChain {
    executors: Vec<Executor>,
}

impl Default for ExecutorChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorChain {
    pub fn new() -> Self {
        Self {
            executors: vec![Executor::base()],
        }
    }

    /// Link `executor`. An executor already linked under the same name is
    /// unlinked first, so no name appears twice.
    pub fn register(&mut self, executor: Executor, placement: Placement) {
        if executor.name() == BASE_EXECUTOR {
            tracing::warn!("the base executor is fixed; ignoring registration");
            return;
        }
        if self.unlink(executor.name()).is_some() {
            tracing::debug!(executor = executor.name(), "re-registering executor");
        }
        let at = match placement {
            Placement::Default => 0,
            // With only the base linked there is no head to follow; the
            // base stays last either way.
            Placement::Secondary if self.executors.len() > 1 => 1,
            Placement::Secondary => 0,
        };
        tracing::debug!(executor = executor.name(), ?placement, position = at, "registered executor");
        self.executors.insert(at, executor);
    }

    /// Unlink the executor called `name`. The base executor cannot be
    /// removed.
    pub fn unregister(&mut self, name: &str) -> Option<Executor> {
        if name == BASE_EXECUTOR {
            tracing::warn!("the base executor cannot be unregistered");
            return None;
        }
        let removed = self.unlink(name);
        if removed.is_some() {
            tracing::debug!(executor = name, "unregistered executor");
        }
        removed
    }

    fn unlink(&mut self, name: &str) -> Option<Executor> {
        let pos = self.executors.iter().position(|e| e.name() == name)?;
        Some(self.executors.remove(pos))
    }

    pub fn find(&self, name: &str) -> Option<&Executor> {
        self.executors.iter().find(|e| e.name() == name)
    }

    /// Executor names, head first.
    pub fn names(&self) -> Vec<&str> {
        self.executors.iter().map(Executor::name).collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Offer `call` to each executor from the head until one claims it.
    pub fn dispatch(&self, call: &mut Call<'_>) -> Result<Dispatched, CallError> {
        for executor in &self.executors {
            let disposition = executor.handle(call)?;
            if disposition.is_claimed() {
                return Ok(Dispatched {
                    executor: executor.name.clone(),
                    disposition,
                });
            }
        }
        // Only reachable if the base executor's fallback declined.
        Ok(Dispatched {
            executor: Cow::Borrowed(BASE_EXECUTOR),
            disposition: Disposition::Done,
        })
    }
}

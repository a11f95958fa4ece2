//! The channel manager.
//!
//! A [`Sentinel`] owns a host channel (a named shared mapping other
//! processes can attach to with [`SentinelClient`]) and any number of
//! device channels (double-mapped pinned memory), plus the two executor
//! chains their consumers dispatch through.

use std::sync::Arc;

use parking_lot::RwLock;
use sentinel_shm::{AddressSpace, Mailbox, MailboxStatus, Relocation};

use crate::channel::{Backing, Channel, ChannelKind, Producer};
use crate::config::SentinelConfig;
use crate::error::SentinelError;
use crate::executor::{Executor, ExecutorChain, Placement};
use crate::mapping::{PinnedMapping, SharedMapping};

/// Which executor chain an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainSide {
    /// The chain shared by the host channel.
    Host,
    /// The chain shared by all device channels.
    Device,
}

/// A running set of channels.
pub struct Sentinel {
    config: SentinelConfig,
    host: Option<Channel>,
    devices: Vec<Channel>,
    host_chain: Arc<RwLock<ExecutorChain>>,
    device_chain: Arc<RwLock<ExecutorChain>>,
}

impl Sentinel {
    /// Create and start every channel `config` asks for.
    ///
    /// `executor`, if given, is registered at the head of both chains before
    /// any consumer starts. On error, channels already started are shut
    /// down again and their memory released.
    pub fn start(config: SentinelConfig, executor: Option<Executor>) -> Result<Self, SentinelError> {
        config.validate()?;

        let host_chain = Arc::new(RwLock::new(ExecutorChain::new()));
        let device_chain = Arc::new(RwLock::new(ExecutorChain::new()));
        if let Some(executor) = executor {
            host_chain.write().register(executor.clone(), Placement::Default);
            device_chain.write().register(executor, Placement::Default);
        }

        let mut sentinel = Self {
            config,
            host: None,
            devices: Vec::new(),
            host_chain,
            device_chain,
        };

        if sentinel.config.host_channel {
            let channel = sentinel
                .start_host()
                .map_err(|e| init_error(ChannelKind::Host, e))?;
            sentinel.host = Some(channel);
        }
        for n in 0..sentinel.config.device_channels {
            let kind = ChannelKind::Device(n);
            let channel = sentinel.start_device(n).map_err(|e| init_error(kind, e))?;
            sentinel.devices.push(channel);
        }

        tracing::info!(
            map = %sentinel.config.map_name,
            host = sentinel.host.is_some(),
            devices = sentinel.devices.len(),
            "sentinel started"
        );
        Ok(sentinel)
    }

    fn ring_size(&self) -> usize {
        Mailbox::required_size(self.config.slot_size, self.config.slot_count)
    }

    fn start_host(&self) -> Result<Channel, SentinelError> {
        let mapping = SharedMapping::create(&self.config.shm_dir, &self.config.map_name, self.ring_size())?;
        let ring = mapping.ring()?;
        // SAFETY: the mapping was just created and nobody else uses it yet;
        // the mapping outlives the mailbox through the channel's backing.
        let mailbox = unsafe { Mailbox::init(ring, self.config.slot_size, self.config.slot_count) }?;

        let backing: Backing = Arc::new(mapping);
        let producer = Producer::new(
            ChannelKind::Host,
            mailbox,
            Relocation::identity(AddressSpace::Local, AddressSpace::Host),
            self.config.wait,
            self.config.fatal,
            backing,
        );
        Channel::start(mailbox, producer, self.host_chain.clone())
    }

    fn start_device(&self, n: usize) -> Result<Channel, SentinelError> {
        let pinned = PinnedMapping::allocate(&self.config.shm_dir, self.ring_size())?;
        // SAFETY: freshly allocated; both views stay mapped while the
        // channel's backing is alive.
        let host_view = unsafe { Mailbox::init(pinned.host_region(), self.config.slot_size, self.config.slot_count) }?;
        let device_view = unsafe { Mailbox::attach(pinned.device_region()) }?;

        let relocation = Relocation::new(pinned.offset(), AddressSpace::Device, AddressSpace::Host);
        tracing::debug!(
            channel = n,
            locked = pinned.is_locked(),
            offset = relocation.offset(),
            "allocated device mailbox"
        );

        let backing: Backing = Arc::new(pinned);
        let producer = Producer::new(
            ChannelKind::Device(n),
            device_view,
            relocation,
            self.config.wait,
            self.config.fatal,
            backing,
        );
        Channel::start(host_view, producer, self.device_chain.clone())
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    pub fn host(&self) -> Option<&Channel> {
        self.host.as_ref()
    }

    pub fn device(&self, n: usize) -> Option<&Channel> {
        self.devices.get(n)
    }

    pub fn devices(&self) -> &[Channel] {
        &self.devices
    }

    fn chain(&self, side: ChainSide) -> &RwLock<ExecutorChain> {
        match side {
            ChainSide::Host => &self.host_chain,
            ChainSide::Device => &self.device_chain,
        }
    }

    /// Link `executor` into one chain. Takes effect from the next message
    /// the consumers dispatch.
    pub fn register_executor(&self, executor: Executor, placement: Placement, side: ChainSide) {
        self.chain(side).write().register(executor, placement);
    }

    pub fn unregister_executor(&self, name: &str, side: ChainSide) -> Option<Executor> {
        self.chain(side).write().unregister(name)
    }

    /// A copy of the executor called `name`, if linked.
    pub fn find_executor(&self, name: &str, side: ChainSide) -> Option<Executor> {
        self.chain(side).read().find(name).cloned()
    }

    /// Executor names of one chain, head first.
    pub fn executor_names(&self, side: ChainSide) -> Vec<String> {
        self.chain(side)
            .read()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Stop every channel: devices first, then the host.
    pub fn shutdown(&mut self) {
        for channel in &mut self.devices {
            channel.shutdown();
        }
        if let Some(host) = &mut self.host {
            host.shutdown();
        }
    }
}

impl Drop for Sentinel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn init_error(channel: ChannelKind, source: SentinelError) -> SentinelError {
    tracing::error!(%channel, error = %source, "channel failed to start");
    SentinelError::Init {
        channel,
        source: Box::new(source),
    }
}

/// Another process's handle on a sentinel's host channel.
///
/// The client maps the named segment at its own address, so its pointers
/// are relocated into the host view on the way in.
pub struct SentinelClient {
    producer: Producer,
}

impl SentinelClient {
    /// Attach to the host channel named by `config`.
    pub fn connect(config: &SentinelConfig) -> Result<Self, SentinelError> {
        let mapping = SharedMapping::open(&config.shm_dir, &config.map_name)?;
        let ring = mapping.ring()?;
        // SAFETY: the mapping stays alive through the producer's backing.
        let mailbox = unsafe { Mailbox::attach(ring) }?;
        if mailbox.status() == MailboxStatus::Closed {
            return Err(SentinelError::ChannelClosed);
        }

        let offset = (mailbox.origin() as i64).wrapping_sub(ring.addr() as i64);
        let relocation = Relocation::new(offset, AddressSpace::Client, AddressSpace::Host);
        tracing::debug!(
            path = %mapping.path().display(),
            offset,
            "connected to host channel"
        );

        let backing: Backing = Arc::new(mapping);
        let producer = Producer::new(
            ChannelKind::Host,
            mailbox,
            relocation,
            config.wait,
            config.fatal,
            backing,
        );
        Ok(Self { producer })
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }
}

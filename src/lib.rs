#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod config;
pub mod emulation;
pub mod event;
pub mod health;
pub mod interface;
pub mod nci;
pub mod registry;
mod session;
pub mod transport;
pub mod uid;

#[cfg(test)]
mod sim;

use core::fmt::{Display, Formatter};

use embedded_hal::i2c;
use heapless::Deque;

pub use config::Config;
pub use event::{Callback, Event, EventKind};
pub use health::HealthReport;
pub use registry::{BinarySink, TagWatcher};
pub use transport::{HalTransport, Transport};
pub use uid::Uid;

use emulation::EmulationSession;
use event::Subscribers;
use health::HealthSupervisor;
use interface::MIN_I2C_FREQUENCY_HZ;
use nci::{FirmwareInfo, MessageType, Packet};
use registry::TagRegistry;

/// Millisecond timestamps supplied by the caller's scheduler
pub type Instant = fugit::TimerInstantU64<1_000>;
pub type Duration = fugit::MillisDurationU64;

/// How long a command may take to be answered
pub const RESPONSE_TIMEOUT: Duration = Duration::millis(1_000);
/// Notifications read while waiting for a response, kept for the next poll
const PENDING_CAPACITY: usize = 4;
/// Frames read past a response before giving up on it
const MAX_INTERLEAVED: usize = 8;

pub(crate) fn elapsed(now: Instant, since: Instant) -> Duration {
    now.checked_duration_since(since)
        .unwrap_or(Duration::from_ticks(0))
}

/// Rejected at construction, the driver never starts with these
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigurationError {
    EmptyUid,
    /// Zero based position of the segment that isn't two hex digits
    InvalidUidSegment { index: usize },
    UidTooLong,
    MaxFailedChecksOutOfRange(u8),
    ZeroInterval,
    MessageTooLong(usize),
    TooManyWatchers,
    TooManySubscribers,
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::EmptyUid => f.write_str("empty UID"),
            Self::InvalidUidSegment { index } => {
                write!(f, "UID segment {index} is not two hex digits")
            }
            Self::UidTooLong => write!(f, "UID longer than {} bytes", uid::MAX_UID_LEN),
            Self::MaxFailedChecksOutOfRange(n) => write!(
                f,
                "max failed checks {n} outside 1..={}",
                health::MAX_FAILED_CHECKS_LIMIT
            ),
            Self::ZeroInterval => f.write_str("interval must be non-zero"),
            Self::MessageTooLong(len) => write!(
                f,
                "emulation message of {len} bytes exceeds {}",
                emulation::MAX_MESSAGE_LEN
            ),
            Self::TooManyWatchers => f.write_str("no room for another watcher"),
            Self::TooManySubscribers => f.write_str("no room for another subscriber"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Address or data byte not acknowledged
    Nack,
    Bus,
    /// No IRQ within the response timeout
    Timeout,
    MalformedFrame,
    /// The controller answered with a non-OK status
    Rejected(u8),
    /// The session gave up, only health supervision can revive it
    Failed,
}

impl TransportError {
    pub(crate) fn from_i2c<E: i2c::Error>(e: E) -> Self {
        match e.kind() {
            i2c::ErrorKind::NoAcknowledge(_) => Self::Nack,
            _ => Self::Bus,
        }
    }

    pub(crate) fn from_spi<E>(_: E) -> Self {
        Self::Bus
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Nack => f.write_str("not acknowledged"),
            Self::Bus => f.write_str("bus error"),
            Self::Timeout => f.write_str("timed out waiting for the controller"),
            Self::MalformedFrame => f.write_str("malformed NCI frame"),
            Self::Rejected(status) => write!(f, "rejected with status {status:#04x}"),
            Self::Failed => f.write_str("controller session failed"),
        }
    }
}

/// Controller session state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Nothing has been sent yet, the first poll resets the chip
    Uninitialized,
    /// Reset done, running the NCI setup sequence
    Initializing,
    /// Discovery running, no tag in the field
    IdlePoll,
    TagPresent,
    /// A reader activated card emulation
    Emulating,
    /// Too many failures, the next poll pulses VEN
    Resetting,
    /// Too many failures with automatic reset disabled, while health checks run
    Failed,
}

/// The tag currently in the field
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Tag {
    pub uid: Uid,
    pub detected_at: Instant,
    pub(crate) last_seen: Instant,
}

impl Tag {
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

/// PN7160/PN7161 NFC controller
///
/// `W` bounds the number of tag watchers, `S` the number of subscribers per event list.
/// Nothing here blocks for long: the caller's scheduler drives [`Pn7160::poll`] and
/// [`Pn7160::health_tick`] with the current time.
pub struct Pn7160<'a, T: Transport, const W: usize = 4, const S: usize = 4> {
    transport: T,
    config: Config<'a>,
    state: State,
    health: HealthSupervisor,
    registry: TagRegistry<'a, W, S>,
    scan_subscribers: Subscribers<'a, S>,
    emulation: EmulationSession,
    tag: Option<Tag>,
    firmware: Option<FirmwareInfo>,
    pending: Deque<Packet, PENDING_CAPACITY>,
    selection: Option<nci::Discovered>,
}

impl<'a, T: Transport, const W: usize, const S: usize> Pn7160<'a, T, W, S> {
    /// Takes ownership of the transport, the chip is left alone until the first poll
    pub fn new(transport: T, config: Config<'a>) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            transport,
            health: HealthSupervisor::new(config.health.clone()),
            config,
            state: State::Uninitialized,
            registry: TagRegistry::new(),
            scan_subscribers: Subscribers::new(),
            emulation: EmulationSession::default(),
            tag: None,
            firmware: None,
            pending: Deque::new(),
            selection: None,
        })
    }

    pub fn add_watcher(&mut self, watcher: TagWatcher<'a>) -> Result<(), ConfigurationError> {
        self.registry.add_watcher(watcher)
    }

    pub fn subscribe(
        &mut self,
        kind: EventKind,
        callback: Callback<'a>,
    ) -> Result<(), ConfigurationError> {
        match kind {
            EventKind::EmulatedTagScan => self.scan_subscribers.subscribe(kind, callback),
            EventKind::TagDetected | EventKind::TagRemoved => {
                self.registry.subscribe(kind, callback)
            }
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &Config<'a> {
        &self.config
    }

    pub fn current_tag(&self) -> Option<&Tag> {
        self.tag.as_ref()
    }

    /// Reported by the chip during the last successful initialization
    pub fn firmware(&self) -> Option<FirmwareInfo> {
        self.firmware
    }

    pub fn consecutive_failures(&self) -> u8 {
        self.health.consecutive_failures()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy() && self.state != State::Failed
    }

    /// Run a function with access to the transport
    ///
    /// Can be used to reclock the bus after initialization
    pub fn with_transport<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.transport)
    }

    pub fn release(self) -> T {
        self.transport
    }

    pub fn log_config(&self) {
        info!("PN7160:");
        info!(
            "  Poll interval: {}ms",
            self.config.poll_interval.to_millis()
        );
        info!("  Tag watchers: {}", self.registry.watchers().len());
        let health = &self.config.health;
        if health.enabled {
            info!(
                "  Health check: every {}ms, max failures {}, auto reset {}",
                health.interval.to_millis(),
                health.max_failed_checks,
                health.auto_reset_on_failure
            );
        } else {
            info!("  Health check: disabled");
        }
        info!(
            "  Emulation: TTL {}ms, message {} bytes",
            self.config.emulation.ttl.to_millis(),
            self.config.emulation.message.map_or(0, |m| m.len())
        );
        if let Some(fw) = self.firmware {
            info!(
                "  Model {:#x}, firmware {}.{}.{}",
                fw.model_id, fw.major, fw.minor, fw.patch
            );
        }
        warn!(
            "  The I2C clock must be at least {} Hz, slower buses miss IRQ deadlines",
            MIN_I2C_FREQUENCY_HZ
        );
        if self.state == State::Failed {
            error!("  Communication with the PN7160 failed");
        }
    }

    pub(crate) fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        trace!(
            "TX {:#x} {:#x} {:?}",
            u8::from(packet.header),
            packet.oid,
            packet.payload.as_slice()
        );
        self.transport.write(&packet.encode())
    }

    pub(crate) fn receive(&mut self) -> Result<Packet, TransportError> {
        let mut buf = [0u8; nci::MAX_FRAME_LEN];
        let len = self.transport.read(&mut buf)?;
        let packet = Packet::decode(&buf[..len])?;
        trace!(
            "RX {:#x} {:#x} {:?}",
            u8::from(packet.header),
            packet.oid,
            packet.payload.as_slice()
        );
        Ok(packet)
    }

    /// Stashed frames first, then whatever the chip has within `timeout`
    pub(crate) fn next_packet(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Packet>, TransportError> {
        if let Some(packet) = self.pending.pop_front() {
            return Ok(Some(packet));
        }
        if !self.transport.wait_ready(timeout) {
            return Ok(None);
        }
        self.receive().map(Some)
    }

    fn stash(&mut self, packet: Packet) {
        if self.pending.is_full() {
            warn!("Pending queue full, dropping oldest frame");
            self.pending.pop_front();
        }
        let _ = self.pending.push_back(packet);
    }

    /// Send a command and return its response, whatever the status
    ///
    /// Notifications and data arriving in between are kept for the next poll.
    pub(crate) fn transact(
        &mut self,
        gid: u8,
        oid: u8,
        payload: &[u8],
    ) -> Result<Packet, TransportError> {
        self.send(&Packet::command(gid, oid, payload)?)?;
        for _ in 0..MAX_INTERLEAVED {
            if !self.transport.wait_ready(RESPONSE_TIMEOUT) {
                warn!("No response to {:#x}/{:#x}", gid, oid);
                return Err(TransportError::Timeout);
            }
            let packet = self.receive()?;
            if packet.is_response_to(gid, oid) {
                return Ok(packet);
            }
            if packet.mt() == MessageType::Response {
                warn!(
                    "Expected response to {:#x}/{:#x}, got {:#x}/{:#x}",
                    gid,
                    oid,
                    packet.gid(),
                    packet.oid
                );
                return Err(TransportError::MalformedFrame);
            }
            self.stash(packet);
        }
        Err(TransportError::Timeout)
    }

    /// [`Self::transact`] requiring an OK status
    pub(crate) fn command(
        &mut self,
        gid: u8,
        oid: u8,
        payload: &[u8],
    ) -> Result<Packet, TransportError> {
        let rsp = self.transact(gid, oid, payload)?;
        match rsp.status() {
            Some(nci::STATUS_OK) => Ok(rsp),
            status => {
                let status = status.unwrap_or(0xFF);
                warn!("{:#x}/{:#x} rejected: {:#x}", gid, oid, status);
                Err(TransportError::Rejected(status))
            }
        }
    }

    /// Pulse VEN and swallow the reset notification the chip sends on boot
    pub(crate) fn hard_reset(&mut self) {
        self.transport.reset();
        self.pending.clear();
        if self.transport.wait_ready(RESPONSE_TIMEOUT) {
            match self.receive() {
                Ok(p) if p.is_notification(nci::gid::CORE, nci::core_oid::RESET) => {
                    trace!("Boot notification received");
                }
                Ok(_) => debug!("Unexpected frame after reset"),
                Err(e) => debug!("Reading boot notification failed: {:?}", e),
            }
        }
    }

    /// Drop whatever was in progress, notifying listeners
    pub(crate) fn abandon_activity(&mut self) {
        if let Some(tag) = self.tag.take() {
            self.registry.on_tag_removed(&tag.uid);
        }
        self.finish_emulation();
        self.selection = None;
    }
}

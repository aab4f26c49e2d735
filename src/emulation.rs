use heapless::Vec;

use crate::{
    elapsed,
    event::Event,
    nci::{self, Packet},
    transport::Transport,
    ConfigurationError, Duration, Instant, Pn7160, State, TransportError,
};

pub const DEFAULT_TTL: Duration = Duration::millis(250);
/// ISO 7816 "no further qualification", appended to every answer
pub const STATUS_WORD_OK: [u8; 2] = [0x90, 0x00];
/// Largest payload that still fits a data packet next to the status word
pub const MAX_MESSAGE_LEN: usize = nci::MAX_PAYLOAD_LEN - STATUS_WORD_OK.len();

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EmulationSettings<'a> {
    /// Idle time after the last reader frame before the session ends
    pub ttl: Duration,
    /// Answer to every reader frame, empty if unset
    pub message: Option<&'a [u8]>,
}

impl Default for EmulationSettings<'_> {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            message: None,
        }
    }
}

impl EmulationSettings<'_> {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.ttl.ticks() == 0 {
            return Err(ConfigurationError::ZeroInterval);
        }
        match self.message {
            Some(m) if m.len() > MAX_MESSAGE_LEN => {
                Err(ConfigurationError::MessageTooLong(m.len()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EmulationSession {
    active: bool,
    started_at: Option<Instant>,
    last_activity: Option<Instant>,
    frames: u32,
}

impl EmulationSession {
    pub fn begin(&mut self, now: Instant) {
        self.active = true;
        self.started_at = Some(now);
        self.last_activity = Some(now);
        self.frames = 0;
    }

    /// A reader frame arrived
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = Some(now);
        self.frames = self.frames.saturating_add(1);
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// When the current or last session began
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        match self.last_activity {
            Some(last) if self.active => elapsed(now, last) > ttl,
            _ => false,
        }
    }

    /// Returns whether a session was running
    pub fn end(&mut self) -> bool {
        core::mem::replace(&mut self.active, false)
    }
}

impl<'a, T: Transport, const W: usize, const S: usize> Pn7160<'a, T, W, S> {
    pub(crate) fn begin_emulation(&mut self, now: Instant) {
        info!("Reader activated card emulation");
        self.emulation.begin(now);
        self.state = State::Emulating;
    }

    /// Answer a C-APDU with the configured message
    pub(crate) fn on_reader_frame(
        &mut self,
        frame: &Packet,
        now: Instant,
    ) -> Result<(), TransportError> {
        self.emulation.touch(now);
        trace!("Reader frame {:?}", frame.payload.as_slice());

        let mut answer: Vec<u8, { nci::MAX_PAYLOAD_LEN }> = Vec::new();
        // message length is validated against MAX_MESSAGE_LEN
        let _ = answer.extend_from_slice(self.config.emulation.message.unwrap_or(&[]));
        let _ = answer.extend_from_slice(&STATUS_WORD_OK);
        self.send(&Packet::data(nci::STATIC_RF_CONN_ID, &answer)?)
    }

    pub(crate) fn check_emulation_expiry(&mut self, now: Instant) -> Result<(), TransportError> {
        if self.emulation.is_expired(now, self.config.emulation.ttl) {
            debug!("Emulation idle for longer than the TTL");
            self.finish_emulation();
            self.state = State::IdlePoll;
            self.rearm_discovery()?;
        }
        Ok(())
    }

    /// Close the session and notify scan subscribers, once per session
    pub(crate) fn finish_emulation(&mut self) {
        let frames = self.emulation.frames();
        let started_ms = self.emulation.started_at().map(|t| t.ticks());
        if self.emulation.end() {
            info!(
                "Emulation session from {:?} ms ended after {} reader frames",
                started_ms, frames
            );
            self.scan_subscribers.emit(&Event::EmulatedTagScan);
        }
    }
}

//! Controller session: NCI setup, discovery and the tag/emulation state machine
use crate::{
    elapsed,
    health::Verdict,
    nci::{
        self, core_oid, deactivation, gid, rf_oid, Activation, Discovered, FirmwareInfo,
        MessageType, Packet,
    },
    transport::Transport,
    Duration, Instant, Pn7160, State, Tag, TransportError,
};

/// How long an idle poll waits for the chip to raise IRQ
const POLL_TIMEOUT: Duration = Duration::millis(5);
/// Frames handled per poll before yielding back to the scheduler
const MAX_FRAMES_PER_POLL: usize = 8;
/// Leftover frames read and discarded before initialization
const STALE_FRAME_LIMIT: usize = 5;

/// CORE_INIT_CMD for NCI 2.0, no optional features
const CORE_INIT: [u8; 2] = [0x00, 0x00];

/// Route ISO-DEP in listen mode to the host, whatever the power state
const LISTEN_MODE_ROUTING: [u8; 7] = [
    0x00, // last message
    0x01, // one entry
    0x01, // protocol based
    0x03, // entry length
    0x00, // to DH
    0x01, // switched on
    nci::protocol::ISO_DEP,
];

/// Two mappings: ISO-DEP over the ISO-DEP interface in poll and listen, T2T over frame RF in poll
const DISCOVER_MAP: [u8; 7] = [
    0x02,
    nci::protocol::ISO_DEP,
    0x03, // poll and listen
    nci::interface::ISO_DEP,
    nci::protocol::T2T,
    0x01, // poll only
    nci::interface::FRAME,
];

/// Poll A, B, F, V and listen A, every cycle
const DISCOVER: [u8; 11] = [
    0x05,
    nci::tech_mode::NFC_A_POLL,
    0x01,
    nci::tech_mode::NFC_B_POLL,
    0x01,
    nci::tech_mode::NFC_F_POLL,
    0x01,
    nci::tech_mode::NFC_V_POLL,
    0x01,
    nci::tech_mode::NFC_A_LISTEN,
    0x01,
];

impl<'a, T: Transport, const W: usize, const S: usize> Pn7160<'a, T, W, S> {
    /// Advance the session, call it every poll interval
    ///
    /// Failures are absorbed and counted by the health supervisor. Only a session that
    /// gave up with automatic reset disabled and health checks enabled reports
    /// [`TransportError::Failed`], until a health probe succeeds again.
    pub fn poll(&mut self, now: Instant) -> Result<(), TransportError> {
        let res = match self.state {
            State::Failed => return Err(TransportError::Failed),
            State::Uninitialized | State::Resetting => {
                self.hard_reset();
                self.health.clear();
                self.state = State::Initializing;
                self.initialize()
            }
            State::Initializing => self.initialize(),
            State::IdlePoll | State::TagPresent | State::Emulating => self.service(now),
        };
        if let Err(e) = res {
            self.on_failure(e);
        }
        Ok(())
    }

    fn on_failure(&mut self, e: TransportError) {
        let verdict = self.health.record_failure();
        warn!(
            "Poll failed in {:?}: {:?} ({} consecutive)",
            self.state,
            e,
            self.health.consecutive_failures()
        );
        match verdict {
            Verdict::Retry => {}
            Verdict::Reset => {
                warn!("Resetting PN7160 on next poll");
                self.abandon_activity();
                self.state = State::Resetting;
            }
            Verdict::Exhausted if self.config.health.enabled => {
                error!("PN7160 recovery exhausted, automatic reset disabled");
                self.abandon_activity();
                self.state = State::Failed;
            }
            Verdict::Exhausted => {
                // no probe could revive a failed session, keep setting up every tick
                error!("PN7160 recovery exhausted, retrying setup on next poll");
                self.abandon_activity();
                self.state = State::Initializing;
            }
        }
    }

    fn initialize(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        self.selection = None;
        self.clear_stale_frames();

        self.command(gid::CORE, core_oid::RESET, &[nci::RESET_KEEP_CONFIG])?;
        self.await_notification(gid::CORE, core_oid::RESET)?;

        let rsp = self.command(gid::CORE, core_oid::INIT, &CORE_INIT)?;
        self.firmware = FirmwareInfo::from_init_response(&rsp.payload);
        match self.firmware {
            Some(fw) => info!(
                "PN7160 model {:#x}, firmware {}.{}.{}",
                fw.model_id, fw.major, fw.minor, fw.patch
            ),
            None => warn!("Short CORE_INIT response, firmware version unknown"),
        }

        self.command(gid::RF_MANAGEMENT, rf_oid::SET_LISTEN_MODE_ROUTING, &LISTEN_MODE_ROUTING)?;
        self.command(gid::RF_MANAGEMENT, rf_oid::DISCOVER_MAP, &DISCOVER_MAP)?;
        self.start_discovery()?;

        self.health.clear();
        self.state = State::IdlePoll;
        info!("PN7160 ready, discovery running");
        Ok(())
    }

    /// Read out frames left over from before a reset, so IRQ drops
    fn clear_stale_frames(&mut self) {
        for _ in 0..STALE_FRAME_LIMIT {
            if !self.transport.wait_ready(Duration::millis(0)) {
                return;
            }
            match self.receive() {
                Ok(_) => debug!("Discarded stale frame"),
                Err(_) => break,
            }
        }
        if self.transport.wait_ready(Duration::millis(0)) {
            warn!("IRQ stuck high, pulsing VEN");
            self.hard_reset();
        }
    }

    /// Wait for a notification, dropping anything else
    fn await_notification(&mut self, gid: u8, oid: u8) -> Result<Packet, TransportError> {
        for _ in 0..STALE_FRAME_LIMIT {
            match self.next_packet(crate::RESPONSE_TIMEOUT)? {
                Some(p) if p.is_notification(gid, oid) => return Ok(p),
                Some(_) => debug!("Skipping frame while waiting for {:#x}/{:#x}", gid, oid),
                None => break,
            }
        }
        warn!("No {:#x}/{:#x} notification", gid, oid);
        Err(TransportError::Timeout)
    }

    fn start_discovery(&mut self) -> Result<(), TransportError> {
        self.command(gid::RF_MANAGEMENT, rf_oid::DISCOVER, &DISCOVER)
            .map(|_| ())
    }

    /// Back to discovery after an activation, keeps the RF field cycling
    pub(crate) fn rearm_discovery(&mut self) -> Result<(), TransportError> {
        self.command(
            gid::RF_MANAGEMENT,
            rf_oid::DEACTIVATE,
            &[deactivation::DISCOVERY],
        )
        .map(|_| ())
    }

    fn service(&mut self, now: Instant) -> Result<(), TransportError> {
        for _ in 0..MAX_FRAMES_PER_POLL {
            let Some(packet) = self.next_packet(POLL_TIMEOUT)? else {
                break;
            };
            self.dispatch(packet, now)?;
        }
        match self.state {
            State::TagPresent => self.check_tag_presence(now),
            State::Emulating => self.check_emulation_expiry(now),
            _ => Ok(()),
        }
    }

    fn dispatch(&mut self, packet: Packet, now: Instant) -> Result<(), TransportError> {
        match packet.mt() {
            MessageType::Notification => self.on_notification(&packet, now),
            MessageType::Data if self.state == State::Emulating => {
                self.on_reader_frame(&packet, now)
            }
            MessageType::Data => {
                trace!("Dropping data outside emulation");
                Ok(())
            }
            _ => {
                debug!(
                    "Unsolicited {:#x}/{:#x}",
                    packet.gid(),
                    packet.oid
                );
                Ok(())
            }
        }
    }

    fn on_notification(&mut self, packet: &Packet, now: Instant) -> Result<(), TransportError> {
        match (packet.gid(), packet.oid) {
            (gid::RF_MANAGEMENT, rf_oid::INTF_ACTIVATED) => {
                match Activation::parse(&packet.payload) {
                    Ok(activation) => self.on_activation(activation, now),
                    Err(_) => {
                        warn!("Unparsable activation {:?}", packet.payload.as_slice());
                        self.rearm_discovery()
                    }
                }
            }
            (gid::RF_MANAGEMENT, rf_oid::DEACTIVATE) => self.on_deactivation(&packet.payload),
            (gid::RF_MANAGEMENT, rf_oid::DISCOVER) => {
                self.on_discovered(Discovered::parse(&packet.payload)?)
            }
            (gid::CORE, core_oid::CONN_CREDITS) => Ok(()),
            (gid::CORE, core_oid::GENERIC_ERROR) | (gid::CORE, core_oid::INTERFACE_ERROR) => {
                warn!(
                    "Controller error notification {:#x}: {:?}",
                    packet.oid,
                    packet.payload.as_slice()
                );
                Ok(())
            }
            (g, o) => {
                trace!("Ignoring notification {:#x}/{:#x}", g, o);
                Ok(())
            }
        }
    }

    fn on_activation(
        &mut self,
        activation: Activation,
        now: Instant,
    ) -> Result<(), TransportError> {
        self.selection = None;
        if activation.is_listen() {
            if let Some(tag) = self.tag.take() {
                self.registry.on_tag_removed(&tag.uid);
            }
            // the deactivation of a previous reader may have been dropped
            self.finish_emulation();
            self.begin_emulation(now);
            return Ok(());
        }

        // a reader doesn't show up while we're polling, but don't leave a session dangling
        self.finish_emulation();
        let Some(uid) = activation.uid else {
            return self.rearm_discovery();
        };
        match self.tag.as_mut() {
            Some(tag) if tag.uid == uid => {
                trace!("Tag still present");
                tag.last_seen = now;
            }
            current => {
                if let Some(old) = current.map(|t| t.uid.clone()) {
                    self.registry.on_tag_removed(&old);
                }
                self.registry.on_tag_detected(&uid);
                self.tag = Some(Tag {
                    uid,
                    detected_at: now,
                    last_seen: now,
                });
            }
        }
        self.state = State::TagPresent;
        self.rearm_discovery()
    }

    fn on_deactivation(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let [kind, reason, ..] = payload else {
            return Err(TransportError::MalformedFrame);
        };
        match self.state {
            State::Emulating => {
                debug!("Reader deactivated us, reason {:#x}", reason);
                self.finish_emulation();
                self.state = State::IdlePoll;
            }
            State::TagPresent if *reason == deactivation::REASON_RF_LINK_LOSS => {
                debug!("RF link lost");
                self.tag_gone();
            }
            _ => {
                trace!("Deactivated, type {:#x} reason {:#x}", kind, reason);
                return Ok(());
            }
        }
        // deactivated to idle: discovery has to be restarted by us
        if *kind == deactivation::IDLE {
            self.start_discovery()?;
        }
        Ok(())
    }

    /// Several tags in the field, select the first one once the list is complete
    fn on_discovered(&mut self, discovered: Discovered) -> Result<(), TransportError> {
        debug!(
            "Discovered target {}, protocol {:#x}",
            discovered.discovery_id, discovered.protocol
        );
        let selection = *self.selection.get_or_insert(discovered);
        if !discovered.last {
            return Ok(());
        }
        self.selection = None;
        self.command(
            gid::RF_MANAGEMENT,
            rf_oid::DISCOVER_SELECT,
            &[
                selection.discovery_id,
                selection.protocol,
                selection.interface(),
            ],
        )
        .map(|_| ())
    }

    fn check_tag_presence(&mut self, now: Instant) -> Result<(), TransportError> {
        let absent = self
            .tag
            .as_ref()
            .map_or(true, |tag| elapsed(now, tag.last_seen) >= self.config.poll_interval);
        if absent {
            self.tag_gone();
        }
        Ok(())
    }

    fn tag_gone(&mut self) {
        if let Some(tag) = self.tag.take() {
            self.registry.on_tag_removed(&tag.uid);
        }
        self.state = State::IdlePoll;
    }
}

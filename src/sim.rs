//! Simulated PN7160 for driver tests
//!
//! Answers every command the way a healthy controller does, tests queue
//! notifications and reader traffic on top.
use std::{collections::VecDeque, vec::Vec};

use bilge::prelude::*;

use crate::{
    event::Event,
    nci::{core_oid, deactivation, gid, rf_oid, tech_mode, Header, MessageType, Packet},
    transport::Transport,
    Duration, TransportError,
};

/// Pins down the higher ranked signature so closures coerce to [`crate::Callback`]
pub(crate) fn callback<F: Fn(&Event<'_>)>(f: F) -> F {
    f
}

#[derive(Default)]
pub(crate) struct SimChip {
    outbox: VecDeque<Vec<u8>>,
    /// Every frame the driver wrote
    pub written: Vec<Vec<u8>>,
    pub resets: usize,
    /// Writes are NACKed and nothing is answered
    pub dead: bool,
    /// CORE_GET_CONFIG goes unanswered
    pub probe_fails: bool,
}

impl SimChip {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, mt: MessageType, gid: u8, oid: u8, payload: &[u8]) {
        let mut frame = Vec::with_capacity(payload.len() + 3);
        frame.push(u8::from(Header::new(u4::new(gid), false, mt)));
        frame.push(oid);
        frame.push(payload.len() as u8);
        frame.extend_from_slice(payload);
        self.outbox.push_back(frame);
    }

    fn respond(&mut self, gid: u8, oid: u8, payload: &[u8]) {
        self.push(MessageType::Response, gid, oid, payload);
    }

    fn notify(&mut self, gid: u8, oid: u8, payload: &[u8]) {
        self.push(MessageType::Notification, gid, oid, payload);
    }

    /// NFC-A tag activated over the ISO-DEP interface
    pub fn push_tag(&mut self, uid: &[u8]) {
        let mut ntf = vec![
            0x01,
            0x02,
            0x04,
            tech_mode::NFC_A_POLL,
            0xFF,
            0x01,
            3 + uid.len() as u8,
            0x44,
            0x00,
            uid.len() as u8,
        ];
        ntf.extend_from_slice(uid);
        self.notify(gid::RF_MANAGEMENT, rf_oid::INTF_ACTIVATED, &ntf);
    }

    /// A phone activating our listen mode
    pub fn push_reader(&mut self) {
        self.notify(
            gid::RF_MANAGEMENT,
            rf_oid::INTF_ACTIVATED,
            &[0x01, 0x02, 0x04, tech_mode::NFC_A_LISTEN, 0xFF, 0x01, 0x00],
        );
    }

    pub fn push_reader_frame(&mut self, apdu: &[u8]) {
        self.push(MessageType::Data, 0x00, 0x00, apdu);
    }

    pub fn push_deactivate(&mut self, reason: u8) {
        self.notify(
            gid::RF_MANAGEMENT,
            rf_oid::DEACTIVATE,
            &[deactivation::DISCOVERY, reason],
        );
    }

    pub fn push_discovered(&mut self, discovery_id: u8, protocol: u8, last: bool) {
        let notification_type = if last { 0x00 } else { 0x02 };
        self.notify(
            gid::RF_MANAGEMENT,
            rf_oid::DISCOVER,
            &[discovery_id, protocol, tech_mode::NFC_A_POLL, 0x00, notification_type],
        );
    }

    /// (gid, oid) of every command written, in order
    pub fn commands(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.written
            .iter()
            .filter(|f| Header::from(f[0]).mt() == MessageType::Command)
            .map(|f| (f[0] & 0x0F, f[1]))
    }

    pub fn count_commands(&self, gid: u8, oid: u8) -> usize {
        self.commands().filter(|&c| c == (gid, oid)).count()
    }

    /// Payloads of the data packets sent back to the reader
    pub fn data_replies(&self) -> Vec<Vec<u8>> {
        self.written
            .iter()
            .filter(|f| Header::from(f[0]).mt() == MessageType::Data)
            .map(|f| f[3..].to_vec())
            .collect()
    }

    fn answer(&mut self, cmd: &Packet) {
        match (cmd.gid(), cmd.oid) {
            (gid::CORE, core_oid::RESET) => {
                self.respond(gid::CORE, core_oid::RESET, &[0x00]);
                self.notify(gid::CORE, core_oid::RESET, &[0x02, 0x00, 0x20, 0x04, 0x00]);
            }
            (gid::CORE, core_oid::INIT) => {
                let mut rsp = [0u8; 13];
                rsp[9..].copy_from_slice(&[0x12, 0x02, 0x03, 0x04]);
                self.respond(gid::CORE, core_oid::INIT, &rsp);
            }
            (gid::CORE, core_oid::GET_CONFIG) if self.probe_fails => {}
            (gid::CORE, core_oid::GET_CONFIG) => {
                self.respond(gid::CORE, core_oid::GET_CONFIG, &[0x00, 0x01, 0x00, 0x01, 0x00]);
            }
            (gid::RF_MANAGEMENT, rf_oid::DEACTIVATE) => {
                self.respond(gid::RF_MANAGEMENT, rf_oid::DEACTIVATE, &[0x00]);
                self.notify(
                    gid::RF_MANAGEMENT,
                    rf_oid::DEACTIVATE,
                    &[cmd.payload[0], deactivation::REASON_DH_REQUEST],
                );
            }
            (g, o) => self.respond(g, o, &[0x00]),
        }
    }
}

impl Transport for SimChip {
    fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.dead {
            return Err(TransportError::Nack);
        }
        self.written.push(frame.to_vec());
        let packet = Packet::decode(frame)?;
        if packet.mt() == MessageType::Command {
            self.answer(&packet);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let frame = self.outbox.pop_front().ok_or(TransportError::Bus)?;
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    fn wait_ready(&mut self, _timeout: Duration) -> bool {
        !self.dead && !self.outbox.is_empty()
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.outbox.clear();
        if !self.dead {
            // boot announcement
            self.notify(gid::CORE, core_oid::RESET, &[0x00, 0x00, 0x20, 0x04, 0x00]);
        }
    }
}

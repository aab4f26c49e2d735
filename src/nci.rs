//! NCI packet framing
//!
//! Every exchange with the PN7160 is an NCI control or data packet:
//! a header byte (MT, PBF, GID or connection id), an OID byte, a length byte and the payload.
use bilge::prelude::*;
use heapless::Vec;

use crate::{uid::Uid, TransportError};

pub const HEADER_LEN: usize = 3;
pub const MAX_PAYLOAD_LEN: usize = 255;
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

/// Connection id of the static RF connection used for emulation traffic
pub const STATIC_RF_CONN_ID: u8 = 0x00;

pub const STATUS_OK: u8 = 0x00;

pub mod gid {
    pub const CORE: u8 = 0x00;
    pub const RF_MANAGEMENT: u8 = 0x01;
    pub const NFCEE_MANAGEMENT: u8 = 0x02;
    pub const PROPRIETARY: u8 = 0x0F;
}

pub mod core_oid {
    pub const RESET: u8 = 0x00;
    pub const INIT: u8 = 0x01;
    pub const SET_CONFIG: u8 = 0x02;
    pub const GET_CONFIG: u8 = 0x03;
    pub const CONN_CREDITS: u8 = 0x06;
    pub const GENERIC_ERROR: u8 = 0x07;
    pub const INTERFACE_ERROR: u8 = 0x08;
}

pub mod rf_oid {
    pub const DISCOVER_MAP: u8 = 0x00;
    pub const SET_LISTEN_MODE_ROUTING: u8 = 0x01;
    pub const DISCOVER: u8 = 0x03;
    pub const DISCOVER_SELECT: u8 = 0x04;
    pub const INTF_ACTIVATED: u8 = 0x05;
    pub const DEACTIVATE: u8 = 0x06;
}

/// RF technology and mode, as used in discovery and activation
pub mod tech_mode {
    pub const NFC_A_POLL: u8 = 0x00;
    pub const NFC_B_POLL: u8 = 0x01;
    pub const NFC_F_POLL: u8 = 0x02;
    pub const NFC_V_POLL: u8 = 0x06;
    pub const NFC_A_LISTEN: u8 = 0x80;
    pub const NFC_B_LISTEN: u8 = 0x81;
    pub const NFC_F_LISTEN: u8 = 0x82;
    /// Bit set on every listen mode value
    pub const LISTEN: u8 = 0x80;
}

pub mod protocol {
    pub const T1T: u8 = 0x01;
    pub const T2T: u8 = 0x02;
    pub const T3T: u8 = 0x03;
    pub const ISO_DEP: u8 = 0x04;
    pub const NFC_DEP: u8 = 0x05;
    pub const T5T: u8 = 0x06;
}

pub mod interface {
    pub const FRAME: u8 = 0x01;
    pub const ISO_DEP: u8 = 0x02;
    pub const NFC_DEP: u8 = 0x03;
}

pub mod deactivation {
    pub const IDLE: u8 = 0x00;
    pub const SLEEP: u8 = 0x01;
    pub const SLEEP_AF: u8 = 0x02;
    pub const DISCOVERY: u8 = 0x03;

    pub const REASON_DH_REQUEST: u8 = 0x00;
    pub const REASON_ENDPOINT_REQUEST: u8 = 0x01;
    pub const REASON_RF_LINK_LOSS: u8 = 0x02;
}

/// CORE_RESET_CMD reset type
pub const RESET_KEEP_CONFIG: u8 = 0x01;

#[bitsize(3)]
#[derive(FromBits, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Data = 0b000,
    Command = 0b001,
    Response = 0b010,
    Notification = 0b011,
    #[fallback]
    Reserved,
}

/// First byte of every NCI packet
///
/// For data packets the `gid` field holds the connection id.
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub gid: u4,
    /// Packet boundary flag, set on every segment but the last
    pub pbf: bool,
    pub mt: MessageType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub oid: u8,
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
}

impl Packet {
    fn new(mt: MessageType, gid: u8, oid: u8, payload: &[u8]) -> Result<Self, TransportError> {
        let payload = Vec::from_slice(payload).map_err(|_| TransportError::MalformedFrame)?;
        Ok(Self {
            header: Header::new(u4::new(gid & 0x0F), false, mt),
            oid: oid & 0x3F,
            payload,
        })
    }

    pub fn command(gid: u8, oid: u8, payload: &[u8]) -> Result<Self, TransportError> {
        Self::new(MessageType::Command, gid, oid, payload)
    }

    pub fn data(conn_id: u8, payload: &[u8]) -> Result<Self, TransportError> {
        Self::new(MessageType::Data, conn_id, 0, payload)
    }

    /// Parse one complete frame
    pub fn decode(frame: &[u8]) -> Result<Self, TransportError> {
        let (head, payload) = match frame {
            [h, o, l, rest @ ..] if rest.len() == *l as usize => ([*h, *o], rest),
            _ => return Err(TransportError::MalformedFrame),
        };
        let header = Header::from(head[0]);
        if header.mt() == MessageType::Reserved {
            return Err(TransportError::MalformedFrame);
        }
        Ok(Self {
            header,
            oid: head[1] & 0x3F,
            // length byte caps the payload at 255
            payload: Vec::from_slice(payload).map_err(|_| TransportError::MalformedFrame)?,
        })
    }

    pub fn encode(&self) -> Vec<u8, MAX_FRAME_LEN> {
        let mut frame = Vec::new();
        let _ = frame.extend_from_slice(&[
            u8::from(self.header),
            self.oid,
            self.payload.len() as u8,
        ]);
        let _ = frame.extend_from_slice(&self.payload);
        frame
    }

    pub fn mt(&self) -> MessageType {
        self.header.mt()
    }

    pub fn gid(&self) -> u8 {
        self.header.gid().value()
    }

    pub fn is_response_to(&self, gid: u8, oid: u8) -> bool {
        self.mt() == MessageType::Response && self.gid() == gid && self.oid == oid
    }

    pub fn is_notification(&self, gid: u8, oid: u8) -> bool {
        self.mt() == MessageType::Notification && self.gid() == gid && self.oid == oid
    }

    /// First payload byte of responses
    pub fn status(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Model and firmware version reported in CORE_INIT_RSP
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FirmwareInfo {
    pub model_id: u8,
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareInfo {
    pub fn from_init_response(payload: &[u8]) -> Option<Self> {
        match payload {
            [_, _, _, _, _, _, _, _, _, model_id, major, minor, patch, ..] => Some(Self {
                model_id: *model_id,
                major: *major,
                minor: *minor,
                patch: *patch,
            }),
            _ => None,
        }
    }
}

/// Decoded RF_INTF_ACTIVATED_NTF
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Activation {
    pub discovery_id: u8,
    pub interface: u8,
    pub protocol: u8,
    pub tech_mode: u8,
    pub max_data_payload: u8,
    /// NFCID of the remote tag, only present in poll modes
    pub uid: Option<Uid>,
}

impl Activation {
    pub fn parse(payload: &[u8]) -> Result<Self, TransportError> {
        let [
            discovery_id,
            interface,
            protocol,
            mode,
            max_data_payload,
            _credits,
            params_len,
            rest @ ..,
        ] = payload
        else {
            return Err(TransportError::MalformedFrame);
        };
        let params = rest
            .get(..*params_len as usize)
            .ok_or(TransportError::MalformedFrame)?;
        let uid = if mode & tech_mode::LISTEN == 0 {
            Some(nfcid(*mode, params)?)
        } else {
            None
        };
        Ok(Self {
            discovery_id: *discovery_id,
            interface: *interface,
            protocol: *protocol,
            tech_mode: *mode,
            max_data_payload: *max_data_payload,
            uid,
        })
    }

    /// Remote reader activated us, we're being emulated
    pub fn is_listen(&self) -> bool {
        self.tech_mode & tech_mode::LISTEN != 0
    }
}

/// Picks the identifier out of the technology specific parameters
fn nfcid(tech: u8, params: &[u8]) -> Result<Uid, TransportError> {
    let id = match tech {
        // SENS_RES (2), NFCID1 length, NFCID1
        tech_mode::NFC_A_POLL => params.get(2).and_then(|&len| params.get(3..3 + len as usize)),
        // SENSB_RES length, SENSB_RES starting with NFCID0
        tech_mode::NFC_B_POLL => params.get(1..5),
        // bit rate, SENSF_RES length, SENSF_RES starting with NFCID2
        tech_mode::NFC_F_POLL => params.get(2..10),
        // RES_FLAG, DSFID, UID
        tech_mode::NFC_V_POLL => params.get(2..10),
        _ => None,
    };
    id.ok_or(TransportError::MalformedFrame)
        .and_then(|b| Uid::from_bytes(b).map_err(|_| TransportError::MalformedFrame))
}

/// One entry of an RF_DISCOVER_NTF
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Discovered {
    pub discovery_id: u8,
    pub protocol: u8,
    /// No further RF_DISCOVER_NTF follows
    pub last: bool,
}

impl Discovered {
    pub fn parse(payload: &[u8]) -> Result<Self, TransportError> {
        match payload {
            [discovery_id, protocol, _tech, .., notification_type] if payload.len() >= 5 => {
                Ok(Self {
                    discovery_id: *discovery_id,
                    protocol: *protocol,
                    // 2: more notifications to follow
                    last: *notification_type != 2,
                })
            }
            _ => Err(TransportError::MalformedFrame),
        }
    }

    /// RF interface matching the protocol for RF_DISCOVER_SELECT_CMD
    pub fn interface(&self) -> u8 {
        match self.protocol {
            protocol::ISO_DEP => interface::ISO_DEP,
            protocol::NFC_DEP => interface::NFC_DEP,
            _ => interface::FRAME,
        }
    }
}

//! LoRaWAN MAC frame codec
//!
//! Byte-level encode/decode of the packed wire layout; nothing here relies on
//! in-memory struct packing. Data frames:
//!
//!   MHDR(1) | DevAddr(4,LE) | FCtrl(1) | FCnt(2,LE) | FOpts(0-15)
//!          | [FPort(1) | FRMPayload(N)] | MIC(4)
//!
//! MHDR packs MType into bits 7..5 and the MAC major version into bits 1..0;
//! it is assembled by shift-and-mask. All multi-byte integers little-endian,
//! MIC always the last four bytes, total length capped at 255 on the radio.
//!
//! When the mesh extension is active, `FOpts[0]` carries the relay hop count;
//! gateways that do not speak the extension treat FOpts as opaque.

pub mod crypto;
pub mod keys;

use std::fmt;

use thiserror::Error;

/// Radio frames never exceed one PHY payload.
pub const MAX_FRAME_LEN: usize = 255;
/// MHDR + DevAddr + FCtrl + FCnt.
pub const DATA_HEADER_LEN: usize = 8;
pub const MIC_LEN: usize = 4;
/// MHDR + AppEUI + DevEUI + DevNonce + MIC.
pub const JOIN_REQUEST_LEN: usize = 23;
/// MHDR + AppNonce + NetID + DevAddr + DLSettings + RxDelay + MIC.
pub const JOIN_ACCEPT_LEN: usize = 17;
/// Join accept with the optional CFList appended.
pub const JOIN_ACCEPT_CFLIST_LEN: usize = 33;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame length {0} out of bounds")]
    TooShort(usize),
    #[error("unsupported message type 0b{0:03b}")]
    BadMType(u8),
    #[error("FOpts length {0} exceeds frame bounds")]
    BadFOptsLen(u8),
}

/// MAC Header message type. Rejoin and proprietary frames are outside the
/// known set and fail decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
}

impl MType {
    fn from_mhdr(mhdr: u8) -> Result<Self, DecodeError> {
        match (mhdr >> 5) & 0x07 {
            0b000 => Ok(MType::JoinRequest),
            0b001 => Ok(MType::JoinAccept),
            0b010 => Ok(MType::UnconfirmedDataUp),
            0b011 => Ok(MType::UnconfirmedDataDown),
            0b100 => Ok(MType::ConfirmedDataUp),
            0b101 => Ok(MType::ConfirmedDataDown),
            other => Err(DecodeError::BadMType(other)),
        }
    }

    fn bits(&self) -> u8 {
        match self {
            MType::JoinRequest => 0b000,
            MType::JoinAccept => 0b001,
            MType::UnconfirmedDataUp => 0b010,
            MType::UnconfirmedDataDown => 0b011,
            MType::ConfirmedDataUp => 0b100,
            MType::ConfirmedDataDown => 0b101,
        }
    }

    pub fn is_uplink(&self) -> bool {
        matches!(self, MType::UnconfirmedDataUp | MType::ConfirmedDataUp)
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MType::JoinRequest => "JoinRequest",
            MType::JoinAccept => "JoinAccept",
            MType::UnconfirmedDataUp => "UnconfirmedDataUp",
            MType::UnconfirmedDataDown => "UnconfirmedDataDown",
            MType::ConfirmedDataUp => "ConfirmedDataUp",
            MType::ConfirmedDataDown => "ConfirmedDataDown",
        };
        write!(f, "{name}")
    }
}

/// LoRaWAN MAC major version (MHDR bits 1..0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Major {
    LoRaWANR1,
    Rfu(u8),
}

impl Major {
    fn from_mhdr(mhdr: u8) -> Self {
        match mhdr & 0x03 {
            0b00 => Major::LoRaWANR1,
            other => Major::Rfu(other),
        }
    }

    fn bits(&self) -> u8 {
        match self {
            Major::LoRaWANR1 => 0b00,
            Major::Rfu(v) => v & 0x03,
        }
    }
}

impl Default for Major {
    fn default() -> Self {
        Major::LoRaWANR1
    }
}

/// Frame control byte, minus the FOpts length nibble (derived from the FOpts
/// vector on encode so the two can never disagree).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    /// FPending on downlinks, Class B flag on uplinks.
    pub f_pending: bool,
}

impl FCtrl {
    fn from_byte(byte: u8) -> (Self, u8) {
        let fctrl = FCtrl {
            adr: (byte & 0x80) != 0,
            adr_ack_req: (byte & 0x40) != 0,
            ack: (byte & 0x20) != 0,
            f_pending: (byte & 0x10) != 0,
        };
        (fctrl, byte & 0x0F)
    }

    fn to_byte(self, f_opts_len: u8) -> u8 {
        (u8::from(self.adr) << 7)
            | (u8::from(self.adr_ack_req) << 6)
            | (u8::from(self.ack) << 5)
            | (u8::from(self.f_pending) << 4)
            | (f_opts_len & 0x0F)
    }
}

/// A decoded data frame (uplink or downlink). `frm_payload` stays in wire
/// form; the MAC layer owns encryption and MIC handling.
///
/// Invariant: `f_port` is `Some` whenever `frm_payload` is non-empty, and
/// `f_opts.len() <= 15`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub mtype: MType,
    pub major: Major,
    pub dev_addr: u32,
    pub fctrl: FCtrl,
    pub fcnt: u16,
    pub f_opts: Vec<u8>,
    pub f_port: Option<u8>,
    pub frm_payload: Vec<u8>,
    pub mic: [u8; 4],
}

impl DataFrame {
    /// Serialized bytes excluding the trailing MIC, as covered by the
    /// integrity check.
    pub fn mic_input(&self) -> Vec<u8> {
        let mut bytes = self.encode();
        bytes.truncate(bytes.len() - MIC_LEN);
        bytes
    }

    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.f_opts.len() <= 15);
        debug_assert!(self.f_port.is_some() || self.frm_payload.is_empty());

        let mut frame = Vec::with_capacity(
            DATA_HEADER_LEN + self.f_opts.len() + 1 + self.frm_payload.len() + MIC_LEN,
        );
        frame.push((self.mtype.bits() << 5) | self.major.bits());
        frame.extend_from_slice(&self.dev_addr.to_le_bytes());
        frame.push(self.fctrl.to_byte(self.f_opts.len() as u8));
        frame.extend_from_slice(&self.fcnt.to_le_bytes());
        frame.extend_from_slice(&self.f_opts);
        if let Some(port) = self.f_port {
            frame.push(port);
            frame.extend_from_slice(&self.frm_payload);
        }
        frame.extend_from_slice(&self.mic);
        frame
    }

    /// Relay hop count carried in the mesh extension octet, 0 when absent.
    pub fn hop_count(&self) -> u8 {
        self.f_opts.first().copied().unwrap_or(0)
    }
}

impl fmt::Display for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} DevAddr={:08X} FCnt={} FPort={} Payload={} bytes MIC={} ADR={}",
            self.mtype,
            self.dev_addr,
            self.fcnt,
            self.f_port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            self.frm_payload.len(),
            hex::encode(self.mic),
            self.fctrl.adr,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub major: Major,
    pub app_eui: u64,
    pub dev_eui: u64,
    pub dev_nonce: u16,
    pub mic: [u8; 4],
}

impl JoinRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(JOIN_REQUEST_LEN);
        frame.push((MType::JoinRequest.bits() << 5) | self.major.bits());
        frame.extend_from_slice(&self.app_eui.to_le_bytes());
        frame.extend_from_slice(&self.dev_eui.to_le_bytes());
        frame.extend_from_slice(&self.dev_nonce.to_le_bytes());
        frame.extend_from_slice(&self.mic);
        frame
    }

    /// Bytes covered by the join-request MIC (MHDR through DevNonce).
    pub fn mic_input(&self) -> Vec<u8> {
        let mut bytes = self.encode();
        bytes.truncate(bytes.len() - MIC_LEN);
        bytes
    }
}

impl fmt::Display for JoinRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JoinRequest AppEUI={:016X} DevEUI={:016X} DevNonce={} MIC={}",
            self.app_eui,
            self.dev_eui,
            self.dev_nonce,
            hex::encode(self.mic)
        )
    }
}

/// Join accept as seen on the wire: the body past MHDR stays encrypted until
/// the MAC layer unwraps it with the AppKey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAccept {
    pub major: Major,
    pub encrypted: Vec<u8>,
}

impl JoinAccept {
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + self.encrypted.len());
        frame.push((MType::JoinAccept.bits() << 5) | self.major.bits());
        frame.extend_from_slice(&self.encrypted);
        frame
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    JoinRequest(JoinRequest),
    JoinAccept(JoinAccept),
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Data(data) => data.fmt(f),
            Frame::JoinRequest(join) => join.fmt(f),
            Frame::JoinAccept(accept) => {
                write!(f, "JoinAccept (encrypted, {} bytes)", accept.encrypted.len())
            }
        }
    }
}

/// Decode a raw PHY payload into a MAC frame.
pub fn decode(data: &[u8]) -> Result<Frame, DecodeError> {
    if data.is_empty() || data.len() > MAX_FRAME_LEN {
        return Err(DecodeError::TooShort(data.len()));
    }

    let mhdr = data[0];
    let mtype = MType::from_mhdr(mhdr)?;
    let major = Major::from_mhdr(mhdr);

    match mtype {
        MType::JoinRequest => decode_join_request(major, data),
        MType::JoinAccept => decode_join_accept(major, data),
        _ => decode_data_frame(mtype, major, data),
    }
}

fn decode_join_request(major: Major, data: &[u8]) -> Result<Frame, DecodeError> {
    if data.len() != JOIN_REQUEST_LEN {
        return Err(DecodeError::TooShort(data.len()));
    }

    let app_eui = u64::from_le_bytes(data[1..9].try_into().expect("sliced to 8"));
    let dev_eui = u64::from_le_bytes(data[9..17].try_into().expect("sliced to 8"));
    let dev_nonce = u16::from_le_bytes([data[17], data[18]]);
    let mic = data[19..23].try_into().expect("sliced to 4");

    Ok(Frame::JoinRequest(JoinRequest { major, app_eui, dev_eui, dev_nonce, mic }))
}

fn decode_join_accept(major: Major, data: &[u8]) -> Result<Frame, DecodeError> {
    if data.len() != JOIN_ACCEPT_LEN && data.len() != JOIN_ACCEPT_CFLIST_LEN {
        return Err(DecodeError::TooShort(data.len()));
    }

    Ok(Frame::JoinAccept(JoinAccept { major, encrypted: data[1..].to_vec() }))
}

fn decode_data_frame(mtype: MType, major: Major, data: &[u8]) -> Result<Frame, DecodeError> {
    if data.len() < DATA_HEADER_LEN + MIC_LEN {
        return Err(DecodeError::TooShort(data.len()));
    }

    let dev_addr = u32::from_le_bytes(data[1..5].try_into().expect("sliced to 4"));
    let (fctrl, f_opts_len) = FCtrl::from_byte(data[5]);
    let fcnt = u16::from_le_bytes([data[6], data[7]]);

    let mic_start = data.len() - MIC_LEN;
    let f_opts_end = DATA_HEADER_LEN + f_opts_len as usize;
    if f_opts_end > mic_start {
        return Err(DecodeError::BadFOptsLen(f_opts_len));
    }
    let f_opts = data[DATA_HEADER_LEN..f_opts_end].to_vec();

    // FPort and FRMPayload are present only when bytes remain before the MIC.
    let (f_port, frm_payload) = if f_opts_end < mic_start {
        (Some(data[f_opts_end]), data[f_opts_end + 1..mic_start].to_vec())
    } else {
        (None, Vec::new())
    };

    let mic = data[mic_start..].try_into().expect("sliced to 4");

    Ok(Frame::Data(DataFrame {
        mtype,
        major,
        dev_addr,
        fctrl,
        fcnt,
        f_opts,
        f_port,
        frm_payload,
        mic,
    }))
}

//! LoRaWAN frame codec.
//!
//! A data frame on the air is `MHDR | FHDR | FPort | FRMPayload`. The MAC
//! header says which message type follows; the frame header carries the
//! device address, control bits, frame counter and piggybacked MAC commands.
//! Uplink and downlink frame headers share a layout but give some FCtrl bits
//! and all command identifiers a different meaning, so every decode names
//! the direction it expects up front.

use std::fmt;
use std::rc::Rc;
use thiserror::Error;

use super::address::DeviceAddress;
use super::mac_command::MacCommand;

/// Largest FOpts field the 4-bit FOptsLen can describe.
pub const MAX_FOPTS_LEN: usize = 15;

const MHDR_LEN: usize = 1;
// DevAddr + FCtrl + FCnt + FPort
const FHDR_FIXED_LEN: usize = 4 + 1 + 2 + 1;

const FCTRL_ADR: u8 = 0x80;
const FCTRL_ADR_ACK_REQ: u8 = 0x40;
const FCTRL_ACK: u8 = 0x20;
const FCTRL_F_PENDING: u8 = 0x10;
const FCTRL_FOPTS_LEN: u8 = 0x0f;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: need {need} bytes, {have} left")]
    TooShort { need: usize, have: usize },
    #[error("invalid message type code {0}")]
    InvalidMessageType(u8),
    #[error("expected a {expected:?} frame but message type is {actual:?}")]
    DirectionMismatch { expected: Direction, actual: MessageType },
    #[error("unknown MAC command identifier 0x{0:02x}")]
    UnknownCommand(u8),
    #[error("MAC commands need {0} bytes, FOpts holds at most 15")]
    CommandsTooLong(usize),
    #[error("{command:?} cannot travel in a {direction:?} frame")]
    CommandDirection { command: MacCommand, direction: Direction },
    #[error("{field} of {command:?} does not fit its field on the wire")]
    FieldOutOfRange { command: MacCommand, field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Uplink,
    Downlink,
}

/// Bounds-checked little-endian reader over a frame.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn take_slice(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        let have = self.data.len() - self.pos;
        if have < len {
            return Err(FrameError::TooShort { need: len, have });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn take_u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take_slice(1)?[0])
    }

    pub(crate) fn take_u16(&mut self) -> Result<u16, FrameError> {
        let bytes = self.take_slice(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn take_u32(&mut self) -> Result<u32, FrameError> {
        let bytes = self.take_slice(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    Proprietary,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::JoinRequest => 0,
            MessageType::JoinAccept => 1,
            MessageType::UnconfirmedDataUp => 2,
            MessageType::UnconfirmedDataDown => 3,
            MessageType::ConfirmedDataUp => 4,
            MessageType::ConfirmedDataDown => 5,
            MessageType::Proprietary => 7,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, FrameError> {
        match code {
            0 => Ok(MessageType::JoinRequest),
            1 => Ok(MessageType::JoinAccept),
            2 => Ok(MessageType::UnconfirmedDataUp),
            3 => Ok(MessageType::UnconfirmedDataDown),
            4 => Ok(MessageType::ConfirmedDataUp),
            5 => Ok(MessageType::ConfirmedDataDown),
            7 => Ok(MessageType::Proprietary),
            other => Err(FrameError::InvalidMessageType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacHeader {
    pub message_type: MessageType,
    pub major: u8,
}

impl MacHeader {
    pub fn new(message_type: MessageType) -> Self {
        Self { message_type, major: 0 }
    }

    /// Only device-originated types count as uplink; everything else
    /// (proprietary included) is treated as downlink.
    pub fn is_uplink(&self) -> bool {
        matches!(
            self.message_type,
            MessageType::JoinRequest | MessageType::UnconfirmedDataUp | MessageType::ConfirmedDataUp
        )
    }

    pub fn direction(&self) -> Direction {
        if self.is_uplink() { Direction::Uplink } else { Direction::Downlink }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.message_type, MessageType::ConfirmedDataUp | MessageType::ConfirmedDataDown)
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push((self.message_type.code() << 5) | (self.major & 0x03));
    }

    pub(crate) fn decode(reader: &mut ByteReader<'_>) -> Result<Self, FrameError> {
        let byte = reader.take_u8()?;
        Ok(Self {
            message_type: MessageType::from_code(byte >> 5)?,
            major: byte & 0x03,
        })
    }

    /// Read only the MAC header of an encoded frame.
    pub fn peek(bytes: &[u8]) -> Result<Self, FrameError> {
        Self::decode(&mut ByteReader::new(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    direction: Direction,
    pub address: DeviceAddress,
    pub adr: bool,
    /// Uplink only.
    pub adr_ack_req: bool,
    pub ack: bool,
    /// Downlink only.
    pub f_pending: bool,
    pub frame_counter: u16,
    pub commands: Vec<MacCommand>,
    pub port: u8,
}

impl FrameHeader {
    fn with_direction(direction: Direction, address: DeviceAddress) -> Self {
        Self {
            direction,
            address,
            adr: false,
            adr_ack_req: false,
            ack: false,
            f_pending: false,
            frame_counter: 0,
            commands: Vec::new(),
            port: 1,
        }
    }

    pub fn uplink(address: DeviceAddress) -> Self {
        Self::with_direction(Direction::Uplink, address)
    }

    pub fn downlink(address: DeviceAddress) -> Self {
        Self::with_direction(Direction::Downlink, address)
    }

    pub fn set_as_uplink(&mut self) {
        self.direction = Direction::Uplink;
    }

    pub fn set_as_downlink(&mut self) {
        self.direction = Direction::Downlink;
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_uplink(&self) -> bool {
        self.direction == Direction::Uplink
    }

    fn commands_len(&self) -> usize {
        self.commands.iter().map(MacCommand::encoded_len).sum()
    }

    pub fn encoded_len(&self) -> usize {
        FHDR_FIXED_LEN + self.commands_len()
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        let fopts_len = self.commands_len();
        if fopts_len > MAX_FOPTS_LEN {
            return Err(FrameError::CommandsTooLong(fopts_len));
        }
        if let Some(command) = self.commands.iter().find(|c| c.direction() != self.direction) {
            return Err(FrameError::CommandDirection {
                command: *command,
                direction: self.direction,
            });
        }
        for command in &self.commands {
            command.validate()?;
        }

        let mut fctrl = fopts_len as u8;
        if self.adr {
            fctrl |= FCTRL_ADR;
        }
        if self.ack {
            fctrl |= FCTRL_ACK;
        }
        match self.direction {
            Direction::Uplink if self.adr_ack_req => fctrl |= FCTRL_ADR_ACK_REQ,
            Direction::Downlink if self.f_pending => fctrl |= FCTRL_F_PENDING,
            _ => {}
        }

        buf.extend_from_slice(&self.address.to_u32().to_le_bytes());
        buf.push(fctrl);
        buf.extend_from_slice(&self.frame_counter.to_le_bytes());
        for command in &self.commands {
            command.encode(buf)?;
        }
        buf.push(self.port);
        Ok(())
    }

    pub(crate) fn decode(reader: &mut ByteReader<'_>, direction: Direction) -> Result<Self, FrameError> {
        let address = DeviceAddress::from_u32(reader.take_u32()?);
        let fctrl = reader.take_u8()?;
        let frame_counter = reader.take_u16()?;

        let fopts = reader.take_slice((fctrl & FCTRL_FOPTS_LEN) as usize)?;
        let mut fopts_reader = ByteReader::new(fopts);
        let mut commands = Vec::new();
        while !fopts_reader.is_empty() {
            commands.push(MacCommand::decode(&mut fopts_reader, direction)?);
        }
        let port = reader.take_u8()?;

        Ok(Self {
            direction,
            address,
            adr: fctrl & FCTRL_ADR != 0,
            adr_ack_req: direction == Direction::Uplink && fctrl & FCTRL_ADR_ACK_REQ != 0,
            ack: fctrl & FCTRL_ACK != 0,
            f_pending: direction == Direction::Downlink && fctrl & FCTRL_F_PENDING != 0,
            frame_counter,
            commands,
            port,
        })
    }
}

/// A decoded data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub mac_header: MacHeader,
    pub frame_header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(mac_header: MacHeader, frame_header: FrameHeader, payload: Vec<u8>) -> Self {
        Self {
            mac_header,
            frame_header,
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        MHDR_LEN + self.frame_header.encoded_len() + self.payload.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.mac_header.encode(&mut buf);
        self.frame_header.encode(&mut buf)?;
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode a frame that is expected to travel in `direction`.
    ///
    /// The MAC header is removed first, then the frame header.
    pub fn decode(bytes: &[u8], direction: Direction) -> Result<Self, FrameError> {
        let mut reader = ByteReader::new(bytes);
        let mac_header = MacHeader::decode(&mut reader)?;
        if mac_header.direction() != direction {
            return Err(FrameError::DirectionMismatch {
                expected: direction,
                actual: mac_header.message_type,
            });
        }
        let frame_header = FrameHeader::decode(&mut reader, direction)?;
        Ok(Self {
            mac_header,
            frame_header,
            payload: reader.remaining().to_vec(),
        })
    }
}

/// Encoded frame bytes as they travel through the simulation.
///
/// Clones share the same allocation; a retransmission sends the very same
/// instance again.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet(Rc<[u8]>);

impl Packet {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn same_instance(&self, other: &Packet) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn decode(&self, direction: Direction) -> Result<Frame, FrameError> {
        Frame::decode(&self.0, direction)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> DeviceAddress {
        DeviceAddress::new(54, 1864)
    }

    fn confirmed_uplink() -> Frame {
        let mut header = FrameHeader::uplink(address());
        header.frame_counter = 0x1234;
        header.adr = true;
        header.adr_ack_req = true;
        header.commands = vec![
            MacCommand::LinkCheckReq,
            MacCommand::DevStatusAns { battery: 254, margin: 9 },
        ];
        header.port = 10;
        Frame::new(MacHeader::new(MessageType::ConfirmedDataUp), header, vec![0xde, 0xad, 0xbe, 0xef])
    }

    #[test]
    fn uplink_round_trip() {
        let frame = confirmed_uplink();
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), frame.encoded_len());
        let decoded = Frame::decode(&bytes, Direction::Uplink).unwrap();
        assert_eq!(decoded, frame);
        assert!(decoded.mac_header.is_confirmed());
        assert!(decoded.frame_header.is_uplink());
    }

    #[test]
    fn downlink_round_trip_with_commands_and_empty_payload() {
        let mut header = FrameHeader::downlink(address());
        header.ack = true;
        header.f_pending = true;
        header.frame_counter = 7;
        header.commands = vec![
            MacCommand::LinkCheckAns { margin: 20, gateway_count: 2 },
            MacCommand::DutyCycleReq { max_duty_cycle: 4 },
            MacCommand::DevStatusReq,
        ];
        let frame = Frame::new(MacHeader::new(MessageType::UnconfirmedDataDown), header, Vec::new());
        let decoded = Frame::decode(&frame.encode().unwrap(), Direction::Downlink).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let mut header = FrameHeader::uplink(DeviceAddress::from_u32(0x0102_0304));
        header.frame_counter = 0x0a0b;
        header.ack = true;
        header.port = 3;
        let frame = Frame::new(MacHeader::new(MessageType::UnconfirmedDataUp), header, vec![0xff]);
        assert_eq!(
            frame.encode().unwrap(),
            vec![0x40, 0x04, 0x03, 0x02, 0x01, FCTRL_ACK, 0x0b, 0x0a, 0x03, 0xff]
        );
    }

    #[test]
    fn direction_specific_fctrl_bits_are_dropped() {
        let mut header = FrameHeader::downlink(address());
        header.adr_ack_req = true;
        let frame = Frame::new(MacHeader::new(MessageType::ConfirmedDataDown), header, Vec::new());
        let decoded = Frame::decode(&frame.encode().unwrap(), Direction::Downlink).unwrap();
        assert!(!decoded.frame_header.adr_ack_req);
    }

    #[test]
    fn truncated_frames_are_malformed() {
        let bytes = confirmed_uplink().encode().unwrap();
        for len in 0..(MHDR_LEN + FHDR_FIXED_LEN + 3) {
            let result = Frame::decode(&bytes[..len], Direction::Uplink);
            assert!(matches!(result, Err(FrameError::TooShort { .. })), "length {len} decoded: {result:?}");
        }
    }

    #[test]
    fn reserved_message_type_is_rejected() {
        let bytes = [6 << 5, 0, 0, 0, 0, 0, 0, 0, 1];
        assert_eq!(Frame::decode(&bytes, Direction::Uplink), Err(FrameError::InvalidMessageType(6)));
        assert_eq!(MacHeader::peek(&bytes), Err(FrameError::InvalidMessageType(6)));
    }

    #[test]
    fn decoding_in_the_wrong_direction_fails() {
        let bytes = confirmed_uplink().encode().unwrap();
        assert_eq!(
            Frame::decode(&bytes, Direction::Downlink),
            Err(FrameError::DirectionMismatch {
                expected: Direction::Downlink,
                actual: MessageType::ConfirmedDataUp,
            })
        );
    }

    #[test]
    fn header_direction_can_be_retagged() {
        let mut header = FrameHeader::uplink(address());
        header.set_as_downlink();
        assert_eq!(header.direction(), Direction::Downlink);
        header.set_as_uplink();
        assert!(header.is_uplink());
    }

    #[test]
    fn commands_must_fit_and_match_direction() {
        let mut header = FrameHeader::uplink(address());
        header.commands = vec![MacCommand::DevStatusAns { battery: 0, margin: 0 }; 6];
        assert_eq!(header.encode(&mut Vec::new()), Err(FrameError::CommandsTooLong(18)));

        header.commands = vec![MacCommand::DevStatusReq];
        assert!(matches!(header.encode(&mut Vec::new()), Err(FrameError::CommandDirection { .. })));

        let mut downlink = FrameHeader::downlink(address());
        downlink.commands = vec![MacCommand::DevStatusReq, MacCommand::DutyCycleReq { max_duty_cycle: 20 }];
        let mut buf = Vec::new();
        assert!(matches!(downlink.encode(&mut buf), Err(FrameError::FieldOutOfRange { .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn packet_clones_share_one_instance() {
        let packet = Packet::new(confirmed_uplink().encode().unwrap());
        let retry = packet.clone();
        assert!(packet.same_instance(&retry));
        assert!(!packet.same_instance(&Packet::new(packet.bytes().to_vec())));
        assert_eq!(retry.decode(Direction::Uplink).unwrap().frame_header.frame_counter, 0x1234);
    }
}

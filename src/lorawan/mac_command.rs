//! MAC commands carried in the FOpts field of a frame header.
//!
//! The same CID means a request in one direction and the answer in the
//! other, so decoding always needs the frame direction.

use super::frame::{ByteReader, Direction, FrameError};

const CID_LINK_CHECK: u8 = 0x02;
const CID_LINK_ADR: u8 = 0x03;
const CID_DUTY_CYCLE: u8 = 0x04;
const CID_DEV_STATUS: u8 = 0x06;

/// Battery level reported by a device on external power.
pub const BATTERY_EXTERNAL_POWER: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacCommand {
    /// Uplink: ask the network for a link check.
    LinkCheckReq,
    /// Downlink: demodulation margin in dB and number of gateways that heard the request.
    LinkCheckAns { margin: u8, gateway_count: u8 },
    LinkAdrReq {
        data_rate: u8,
        tx_power: u8,
        channel_mask: u16,
        redundancy: u8,
    },
    LinkAdrAns {
        power_ack: bool,
        data_rate_ack: bool,
        channel_mask_ack: bool,
    },
    /// Downlink: aggregated duty cycle becomes `1 / 2^max_duty_cycle`.
    DutyCycleReq { max_duty_cycle: u8 },
    DutyCycleAns,
    DevStatusReq,
    /// Uplink: `margin` is a signed 6-bit SNR value.
    DevStatusAns { battery: u8, margin: i8 },
}

impl MacCommand {
    pub fn cid(&self) -> u8 {
        match self {
            MacCommand::LinkCheckReq | MacCommand::LinkCheckAns { .. } => CID_LINK_CHECK,
            MacCommand::LinkAdrReq { .. } | MacCommand::LinkAdrAns { .. } => CID_LINK_ADR,
            MacCommand::DutyCycleReq { .. } | MacCommand::DutyCycleAns => CID_DUTY_CYCLE,
            MacCommand::DevStatusReq | MacCommand::DevStatusAns { .. } => CID_DEV_STATUS,
        }
    }

    /// Direction of the frames this command may travel in.
    pub fn direction(&self) -> Direction {
        match self {
            MacCommand::LinkCheckReq | MacCommand::LinkAdrAns { .. } | MacCommand::DutyCycleAns | MacCommand::DevStatusAns { .. } => {
                Direction::Uplink
            }
            MacCommand::LinkCheckAns { .. } | MacCommand::LinkAdrReq { .. } | MacCommand::DutyCycleReq { .. } | MacCommand::DevStatusReq => {
                Direction::Downlink
            }
        }
    }

    /// Encoded size including the CID byte.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            MacCommand::LinkCheckReq | MacCommand::DutyCycleAns | MacCommand::DevStatusReq => 0,
            MacCommand::LinkAdrAns { .. } | MacCommand::DutyCycleReq { .. } => 1,
            MacCommand::LinkCheckAns { .. } | MacCommand::DevStatusAns { .. } => 2,
            MacCommand::LinkAdrReq { .. } => 4,
        }
    }

    /// Reject field values that do not fit their bit width on the wire.
    pub fn validate(&self) -> Result<(), FrameError> {
        let field = match *self {
            MacCommand::LinkAdrReq { data_rate, .. } if data_rate > 0x0f => "data_rate",
            MacCommand::LinkAdrReq { tx_power, .. } if tx_power > 0x0f => "tx_power",
            MacCommand::DutyCycleReq { max_duty_cycle } if max_duty_cycle > 0x0f => "max_duty_cycle",
            MacCommand::DevStatusAns { margin, .. } if !(-32..=31).contains(&margin) => "margin",
            _ => return Ok(()),
        };
        Err(FrameError::FieldOutOfRange { command: *self, field })
    }

    /// Append the command to `buf`. Nothing is written when a field is out of range.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        self.validate()?;
        buf.push(self.cid());
        match *self {
            MacCommand::LinkCheckReq | MacCommand::DutyCycleAns | MacCommand::DevStatusReq => {}
            MacCommand::LinkCheckAns { margin, gateway_count } => {
                buf.push(margin);
                buf.push(gateway_count);
            }
            MacCommand::LinkAdrReq {
                data_rate,
                tx_power,
                channel_mask,
                redundancy,
            } => {
                buf.push((data_rate << 4) | tx_power);
                buf.extend_from_slice(&channel_mask.to_le_bytes());
                buf.push(redundancy);
            }
            MacCommand::LinkAdrAns {
                power_ack,
                data_rate_ack,
                channel_mask_ack,
            } => {
                buf.push(((power_ack as u8) << 2) | ((data_rate_ack as u8) << 1) | channel_mask_ack as u8);
            }
            MacCommand::DutyCycleReq { max_duty_cycle } => buf.push(max_duty_cycle),
            MacCommand::DevStatusAns { battery, margin } => {
                buf.push(battery);
                buf.push((margin as u8) & 0x3f);
            }
        }
        Ok(())
    }

    pub(crate) fn decode(reader: &mut ByteReader<'_>, direction: Direction) -> Result<Self, FrameError> {
        let cid = reader.take_u8()?;
        let command = match (direction, cid) {
            (Direction::Uplink, CID_LINK_CHECK) => MacCommand::LinkCheckReq,
            (Direction::Downlink, CID_LINK_CHECK) => MacCommand::LinkCheckAns {
                margin: reader.take_u8()?,
                gateway_count: reader.take_u8()?,
            },
            (Direction::Uplink, CID_LINK_ADR) => {
                let status = reader.take_u8()?;
                MacCommand::LinkAdrAns {
                    power_ack: status & 0b100 != 0,
                    data_rate_ack: status & 0b010 != 0,
                    channel_mask_ack: status & 0b001 != 0,
                }
            }
            (Direction::Downlink, CID_LINK_ADR) => {
                let dr_power = reader.take_u8()?;
                MacCommand::LinkAdrReq {
                    data_rate: dr_power >> 4,
                    tx_power: dr_power & 0x0f,
                    channel_mask: reader.take_u16()?,
                    redundancy: reader.take_u8()?,
                }
            }
            (Direction::Uplink, CID_DUTY_CYCLE) => MacCommand::DutyCycleAns,
            (Direction::Downlink, CID_DUTY_CYCLE) => MacCommand::DutyCycleReq {
                max_duty_cycle: reader.take_u8()? & 0x0f,
            },
            (Direction::Uplink, CID_DEV_STATUS) => {
                let battery = reader.take_u8()?;
                let raw = reader.take_u8()? & 0x3f;
                // Sign-extend the 6-bit margin
                let margin = if raw & 0x20 != 0 { raw as i8 - 64 } else { raw as i8 };
                MacCommand::DevStatusAns { battery, margin }
            }
            (Direction::Downlink, CID_DEV_STATUS) => MacCommand::DevStatusReq,
            (_, cid) => return Err(FrameError::UnknownCommand(cid)),
        };
        Ok(command)
    }
}

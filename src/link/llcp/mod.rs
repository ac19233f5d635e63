//! Link Layer Control Protocol (LLCP).
//!
//! This module defines the structured representation of LL Control PDUs, the per-opcode `CtrData`
//! length table used to validate received PDUs, and the two engines built on top of them:
//!
//! * [`proc`]: tracks the one *current* and any *pending* control procedures per connection,
//!   including the response timeout and collision rules.
//! * [`enc`]: the encryption start/pause state machine.

pub mod enc;
pub mod proc;

use {
    crate::{
        bytes::*,
        host::StatusCode,
        link::{channel_map::ChannelMap, comp_id::CompanyId, features::FeatureSet},
        time::Duration,
        utils::Hex,
        Error,
    },
    core::convert::TryInto,
};

/// `CtrData` payload length in octets for each defined opcode (0x00..=0x15).
///
/// A received LL Control PDU whose payload length does not match this table is malformed and must
/// be dropped without a reply.
const CTR_DATA_LENGTHS: [u8; 22] = [
    11, // CONNECTION_UPDATE_REQ
    7,  // CHANNEL_MAP_REQ
    1,  // TERMINATE_IND
    22, // ENC_REQ
    12, // ENC_RSP
    0,  // START_ENC_REQ
    0,  // START_ENC_RSP
    1,  // UNKNOWN_RSP
    8,  // FEATURE_REQ
    8,  // FEATURE_RSP
    0,  // PAUSE_ENC_REQ
    0,  // PAUSE_ENC_RSP
    5,  // VERSION_IND
    1,  // REJECT_IND
    8,  // SLAVE_FEATURE_REQ
    23, // CONNECTION_PARAM_REQ
    23, // CONNECTION_PARAM_RSP
    2,  // REJECT_IND_EXT
    0,  // PING_REQ
    0,  // PING_RSP
    8,  // LENGTH_REQ
    8,  // LENGTH_RSP
];

/// Data transmitted with an `LL_CONNECTION_UPDATE_REQ` Control PDU, containing a new set of
/// connection parameters.
#[derive(Debug, Copy, Clone)]
pub struct ConnectionUpdateData {
    win_size: u8,
    win_offset: u16,
    interval: u16,
    latency: u16,
    timeout: u16,
    instant: u16,
}

impl ConnectionUpdateData {
    /// Creates update data from raw protocol units.
    ///
    /// `win_size`, `win_offset` and `interval` are in units of 1.25 ms, `timeout` in units of
    /// 10 ms. `instant` is the connection event counter value at which the parameters take
    /// effect.
    pub fn new(
        win_size: u8,
        win_offset: u16,
        interval: u16,
        latency: u16,
        timeout: u16,
        instant: u16,
    ) -> Self {
        Self {
            win_size,
            win_offset,
            interval,
            latency,
            timeout,
            instant,
        }
    }

    /// Returns the size of the transmit window for the first PDU of the connection.
    pub fn win_size(&self) -> Duration {
        Duration::from_micros(u32::from(self.win_size) * 1_250)
    }

    /// Returns the offset of the transmit window, as a duration since the `instant`.
    pub fn win_offset(&self) -> Duration {
        Duration::from_micros(u32::from(self.win_offset) * 1_250)
    }

    /// Returns the duration between connection events.
    pub fn interval(&self) -> Duration {
        Duration::from_micros(u32::from(self.interval) * 1_250)
    }

    /// Returns the slave latency in connection events.
    pub fn latency(&self) -> u16 {
        self.latency
    }

    /// Returns the connection supervision timeout (`connSupervisionTimeout`).
    pub fn timeout(&self) -> Duration {
        Duration::from_micros(u32::from(self.timeout) * 10_000)
    }

    /// Returns the instant at which these changes should take effect.
    pub fn instant(&self) -> u16 {
        self.instant
    }
}

/// Data carried by `LL_CONNECTION_PARAM_REQ` and `LL_CONNECTION_PARAM_RSP` PDUs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnParamData {
    /// Minimum acceptable connection interval in units of 1.25 ms.
    pub interval_min: u16,
    /// Maximum acceptable connection interval in units of 1.25 ms.
    pub interval_max: u16,
    /// Requested slave latency in connection events.
    pub latency: u16,
    /// Requested supervision timeout in units of 10 ms.
    pub timeout: u16,
    /// Preferred connection interval periodicity (0 = no preference).
    pub preferred_periodicity: u8,
    /// Reference connection event counter for the offsets below.
    pub ref_conn_event_count: u16,
    /// Anchor point offsets in units of 1.25 ms, in order of preference (0xFFFF = unused).
    pub offsets: [u16; 6],
}

impl ConnParamData {
    /// Creates request data asking for the given interval range, latency and timeout, with no
    /// scheduling preferences.
    pub fn new(interval_min: u16, interval_max: u16, latency: u16, timeout: u16) -> Self {
        Self {
            interval_min,
            interval_max,
            latency,
            timeout,
            preferred_periodicity: 0,
            ref_conn_event_count: 0,
            offsets: [0xFFFF; 6],
        }
    }
}

/// Data carried by `LL_LENGTH_REQ` and `LL_LENGTH_RSP` PDUs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DataLength {
    /// Maximum number of payload octets the sender can receive in a single PDU.
    pub max_rx_octets: u16,
    /// Maximum time in µs the sender can spend receiving a single PDU.
    pub max_rx_time: u16,
    /// Maximum number of payload octets the sender can transmit in a single PDU.
    pub max_tx_octets: u16,
    /// Maximum time in µs the sender can spend transmitting a single PDU.
    pub max_tx_time: u16,
}

impl DataLength {
    /// The values every connection starts out with, until a data length update procedure says
    /// otherwise.
    pub const DEFAULT: Self = Self {
        max_rx_octets: 27,
        max_rx_time: 296,
        max_tx_octets: 27,
        max_tx_time: 296,
    };
}

/// A structured representation of an LL Control PDU used by the Link Layer Control Protocol.
#[derive(Debug, Copy, Clone)]
pub enum ControlPdu<'a> {
    /// `0x00`/`LL_CONNECTION_UPDATE_REQ` - Update connection parameters.
    ///
    /// Sent by the master. The slave does not send a response back.
    ConnectionUpdateReq(ConnectionUpdateData),

    /// `0x01`/`LL_CHANNEL_MAP_REQ` - Update the channel map.
    ///
    /// Sent by the master. The slave does not send a response back.
    ChannelMapReq { map: ChannelMap, instant: u16 },

    /// `0x02`/`LL_TERMINATE_IND` - Close the connection.
    ///
    /// Can be sent by master or slave.
    TerminateInd { error_code: StatusCode },

    /// `0x03`/`LL_ENC_REQ` - Master requests encryption start.
    EncReq {
        rand: Hex<u64>,
        ediv: u16,
        /// Master's 8-octet contribution to the session key diversifier.
        skd_m: Hex<u64>,
        /// Master's 4-octet contribution to the initialization vector.
        iv_m: Hex<u32>,
    },

    /// `0x04`/`LL_ENC_RSP` - Slave's contribution to session key and IV.
    EncRsp { skd_s: Hex<u64>, iv_s: Hex<u32> },

    /// `0x05`/`LL_START_ENC_REQ` - Slave is ready to receive encrypted traffic.
    StartEncReq,

    /// `0x06`/`LL_START_ENC_RSP` - Acknowledges encrypted traffic in the sender's direction.
    StartEncRsp,

    /// `0x07`/`LL_UNKNOWN_RSP` - Response to unknown/unsupported LL Control PDUs.
    ///
    /// This is returned as a response to an incoming LL Control PDU when the opcode is
    /// unimplemented or unknown.
    UnknownRsp {
        /// Opcode of the unknown PDU.
        unknown_type: ControlOpcode,
    },

    /// `0x08`/`LL_FEATURE_REQ` - Master requests slave's features.
    FeatureReq {
        /// Supported feature set of the master.
        features_master: FeatureSet,
    },

    /// `0x09`/`LL_FEATURE_RSP` - Answers a feature request with the used feature set.
    FeatureRsp {
        /// Features that will be used for the connection. Logical `AND` of master and slave
        /// features.
        features_used: FeatureSet,
    },

    /// `0x0A`/`LL_PAUSE_ENC_REQ` - Master requests pausing encryption.
    PauseEncReq,

    /// `0x0B`/`LL_PAUSE_ENC_RSP` - Acknowledges an encryption pause.
    PauseEncRsp,

    /// `0x0C`/`LL_VERSION_IND` - Bluetooth version indication (sent by both master and slave).
    VersionInd {
        vers_nr: VersionNumber,
        comp_id: CompanyId,
        sub_vers_nr: Hex<u16>,
    },

    /// `0x0D`/`LL_REJECT_IND` - Rejects the procedure started by the peer.
    RejectInd { error_code: StatusCode },

    /// `0x0E`/`LL_SLAVE_FEATURE_REQ` - Slave-initiated feature exchange.
    SlaveFeatureReq { features_slave: FeatureSet },

    /// `0x0F`/`LL_CONNECTION_PARAM_REQ` - Request new connection parameters (either role).
    ConnectionParamReq(ConnParamData),

    /// `0x10`/`LL_CONNECTION_PARAM_RSP` - Slave's answer to a parameter request.
    ConnectionParamRsp(ConnParamData),

    /// `0x11`/`LL_REJECT_IND_EXT` - Rejects a specific opcode with an error code.
    RejectIndExt {
        /// Opcode of the PDU being rejected.
        reject_opcode: ControlOpcode,
        error_code: StatusCode,
    },

    /// `0x12`/`LL_PING_REQ` - LE ping.
    PingReq,

    /// `0x13`/`LL_PING_RSP` - LE ping response.
    PingRsp,

    /// `0x14`/`LL_LENGTH_REQ` - Data length update request.
    LengthReq(DataLength),

    /// `0x15`/`LL_LENGTH_RSP` - Data length update response.
    LengthRsp(DataLength),

    /// Catch-all variant for unsupported opcodes.
    Unknown {
        /// The opcode we don't support. This can also be the `Unknown` variant.
        opcode: ControlOpcode,

        /// Additional data depending on the opcode.
        ctr_data: &'a [u8],
    },
}

impl ControlPdu<'_> {
    /// Returns the opcode of this LL Control PDU.
    pub fn opcode(&self) -> ControlOpcode {
        match self {
            ControlPdu::ConnectionUpdateReq { .. } => ControlOpcode::ConnectionUpdateReq,
            ControlPdu::ChannelMapReq { .. } => ControlOpcode::ChannelMapReq,
            ControlPdu::TerminateInd { .. } => ControlOpcode::TerminateInd,
            ControlPdu::EncReq { .. } => ControlOpcode::EncReq,
            ControlPdu::EncRsp { .. } => ControlOpcode::EncRsp,
            ControlPdu::StartEncReq => ControlOpcode::StartEncReq,
            ControlPdu::StartEncRsp => ControlOpcode::StartEncRsp,
            ControlPdu::UnknownRsp { .. } => ControlOpcode::UnknownRsp,
            ControlPdu::FeatureReq { .. } => ControlOpcode::FeatureReq,
            ControlPdu::FeatureRsp { .. } => ControlOpcode::FeatureRsp,
            ControlPdu::PauseEncReq => ControlOpcode::PauseEncReq,
            ControlPdu::PauseEncRsp => ControlOpcode::PauseEncRsp,
            ControlPdu::VersionInd { .. } => ControlOpcode::VersionInd,
            ControlPdu::RejectInd { .. } => ControlOpcode::RejectInd,
            ControlPdu::SlaveFeatureReq { .. } => ControlOpcode::SlaveFeatureReq,
            ControlPdu::ConnectionParamReq(_) => ControlOpcode::ConnectionParamReq,
            ControlPdu::ConnectionParamRsp(_) => ControlOpcode::ConnectionParamRsp,
            ControlPdu::RejectIndExt { .. } => ControlOpcode::RejectIndExt,
            ControlPdu::PingReq => ControlOpcode::PingReq,
            ControlPdu::PingRsp => ControlOpcode::PingRsp,
            ControlPdu::LengthReq(_) => ControlOpcode::LengthReq,
            ControlPdu::LengthRsp(_) => ControlOpcode::LengthRsp,
            ControlPdu::Unknown { opcode, .. } => *opcode,
        }
    }

    /// Returns the encoded size of this LL Control PDU, including the opcode byte.
    pub fn encoded_size(&self) -> u8 {
        match self.opcode().ctr_data_length() {
            Some(len) => 1 + len,
            None => {
                if let ControlPdu::Unknown { ctr_data, .. } = self {
                    1 + TryInto::<u8>::try_into(ctr_data.len()).unwrap_or(u8::max_value())
                } else {
                    unreachable!()
                }
            }
        }
    }
}

impl<'a> FromBytes<'a> for ControlPdu<'a> {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let opcode = ControlOpcode::from(bytes.read_u8()?);
        if let Some(expected) = opcode.ctr_data_length() {
            if bytes.bytes_left() != usize::from(expected) {
                return Err(Error::InvalidLength);
            }
        }

        Ok(match opcode {
            ControlOpcode::ConnectionUpdateReq => {
                ControlPdu::ConnectionUpdateReq(ConnectionUpdateData {
                    win_size: bytes.read_u8()?,
                    win_offset: bytes.read_u16_le()?,
                    interval: bytes.read_u16_le()?,
                    latency: bytes.read_u16_le()?,
                    timeout: bytes.read_u16_le()?,
                    instant: bytes.read_u16_le()?,
                })
            }
            ControlOpcode::ChannelMapReq => ControlPdu::ChannelMapReq {
                map: ChannelMap::from_raw(bytes.read_array()?),
                instant: bytes.read_u16_le()?,
            },
            ControlOpcode::TerminateInd => ControlPdu::TerminateInd {
                error_code: StatusCode::from(bytes.read_u8()?),
            },
            ControlOpcode::EncReq => ControlPdu::EncReq {
                rand: Hex(bytes.read_u64_le()?),
                ediv: bytes.read_u16_le()?,
                skd_m: Hex(bytes.read_u64_le()?),
                iv_m: Hex(bytes.read_u32_le()?),
            },
            ControlOpcode::EncRsp => ControlPdu::EncRsp {
                skd_s: Hex(bytes.read_u64_le()?),
                iv_s: Hex(bytes.read_u32_le()?),
            },
            ControlOpcode::StartEncReq => ControlPdu::StartEncReq,
            ControlOpcode::StartEncRsp => ControlPdu::StartEncRsp,
            ControlOpcode::UnknownRsp => ControlPdu::UnknownRsp {
                unknown_type: ControlOpcode::from(bytes.read_u8()?),
            },
            ControlOpcode::FeatureReq => ControlPdu::FeatureReq {
                features_master: FeatureSet::from_bytes(bytes)?,
            },
            ControlOpcode::FeatureRsp => ControlPdu::FeatureRsp {
                features_used: FeatureSet::from_bytes(bytes)?,
            },
            ControlOpcode::PauseEncReq => ControlPdu::PauseEncReq,
            ControlOpcode::PauseEncRsp => ControlPdu::PauseEncRsp,
            ControlOpcode::VersionInd => ControlPdu::VersionInd {
                vers_nr: VersionNumber::from(bytes.read_u8()?),
                comp_id: CompanyId::from_raw(bytes.read_u16_le()?),
                sub_vers_nr: Hex(bytes.read_u16_le()?),
            },
            ControlOpcode::RejectInd => ControlPdu::RejectInd {
                error_code: StatusCode::from(bytes.read_u8()?),
            },
            ControlOpcode::SlaveFeatureReq => ControlPdu::SlaveFeatureReq {
                features_slave: FeatureSet::from_bytes(bytes)?,
            },
            ControlOpcode::ConnectionParamReq => {
                ControlPdu::ConnectionParamReq(read_conn_param_data(bytes)?)
            }
            ControlOpcode::ConnectionParamRsp => {
                ControlPdu::ConnectionParamRsp(read_conn_param_data(bytes)?)
            }
            ControlOpcode::RejectIndExt => ControlPdu::RejectIndExt {
                reject_opcode: ControlOpcode::from(bytes.read_u8()?),
                error_code: StatusCode::from(bytes.read_u8()?),
            },
            ControlOpcode::PingReq => ControlPdu::PingReq,
            ControlOpcode::PingRsp => ControlPdu::PingRsp,
            ControlOpcode::LengthReq => ControlPdu::LengthReq(read_data_length(bytes)?),
            ControlOpcode::LengthRsp => ControlPdu::LengthRsp(read_data_length(bytes)?),
            ControlOpcode::Unknown(_) => ControlPdu::Unknown {
                opcode,
                ctr_data: bytes.read_rest(),
            },
        })
    }
}

fn read_conn_param_data(bytes: &mut ByteReader<'_>) -> Result<ConnParamData, Error> {
    let mut data = ConnParamData {
        interval_min: bytes.read_u16_le()?,
        interval_max: bytes.read_u16_le()?,
        latency: bytes.read_u16_le()?,
        timeout: bytes.read_u16_le()?,
        preferred_periodicity: bytes.read_u8()?,
        ref_conn_event_count: bytes.read_u16_le()?,
        offsets: [0xFFFF; 6],
    };
    for offset in &mut data.offsets {
        *offset = bytes.read_u16_le()?;
    }
    Ok(data)
}

fn read_data_length(bytes: &mut ByteReader<'_>) -> Result<DataLength, Error> {
    Ok(DataLength {
        max_rx_octets: bytes.read_u16_le()?,
        max_rx_time: bytes.read_u16_le()?,
        max_tx_octets: bytes.read_u16_le()?,
        max_tx_time: bytes.read_u16_le()?,
    })
}

impl<'a> ToBytes for ControlPdu<'a> {
    fn to_bytes(&self, buffer: &mut ByteWriter<'_>) -> Result<(), Error> {
        buffer.write_u8(self.opcode().into())?;
        match self {
            ControlPdu::ConnectionUpdateReq(data) => {
                buffer.write_u8(data.win_size)?;
                buffer.write_u16_le(data.win_offset)?;
                buffer.write_u16_le(data.interval)?;
                buffer.write_u16_le(data.latency)?;
                buffer.write_u16_le(data.timeout)?;
                buffer.write_u16_le(data.instant)?;
                Ok(())
            }
            ControlPdu::ChannelMapReq { map, instant } => {
                buffer.write_slice(&map.to_raw())?;
                buffer.write_u16_le(*instant)?;
                Ok(())
            }
            ControlPdu::TerminateInd { error_code } => buffer.write_u8(u8::from(*error_code)),
            ControlPdu::EncReq {
                rand,
                ediv,
                skd_m,
                iv_m,
            } => {
                buffer.write_u64_le(rand.0)?;
                buffer.write_u16_le(*ediv)?;
                buffer.write_u64_le(skd_m.0)?;
                buffer.write_u32_le(iv_m.0)?;
                Ok(())
            }
            ControlPdu::EncRsp { skd_s, iv_s } => {
                buffer.write_u64_le(skd_s.0)?;
                buffer.write_u32_le(iv_s.0)?;
                Ok(())
            }
            ControlPdu::StartEncReq
            | ControlPdu::StartEncRsp
            | ControlPdu::PauseEncReq
            | ControlPdu::PauseEncRsp
            | ControlPdu::PingReq
            | ControlPdu::PingRsp => Ok(()),
            ControlPdu::UnknownRsp { unknown_type } => buffer.write_u8(u8::from(*unknown_type)),
            ControlPdu::FeatureReq { features_master } => features_master.to_bytes(buffer),
            ControlPdu::FeatureRsp { features_used } => features_used.to_bytes(buffer),
            ControlPdu::VersionInd {
                vers_nr,
                comp_id,
                sub_vers_nr,
            } => {
                buffer.write_u8(u8::from(*vers_nr))?;
                buffer.write_u16_le(comp_id.as_u16())?;
                buffer.write_u16_le(sub_vers_nr.0)?;
                Ok(())
            }
            ControlPdu::RejectInd { error_code } => buffer.write_u8(u8::from(*error_code)),
            ControlPdu::SlaveFeatureReq { features_slave } => features_slave.to_bytes(buffer),
            ControlPdu::ConnectionParamReq(data) | ControlPdu::ConnectionParamRsp(data) => {
                buffer.write_u16_le(data.interval_min)?;
                buffer.write_u16_le(data.interval_max)?;
                buffer.write_u16_le(data.latency)?;
                buffer.write_u16_le(data.timeout)?;
                buffer.write_u8(data.preferred_periodicity)?;
                buffer.write_u16_le(data.ref_conn_event_count)?;
                for offset in &data.offsets {
                    buffer.write_u16_le(*offset)?;
                }
                Ok(())
            }
            ControlPdu::RejectIndExt {
                reject_opcode,
                error_code,
            } => {
                buffer.write_u8(u8::from(*reject_opcode))?;
                buffer.write_u8(u8::from(*error_code))?;
                Ok(())
            }
            ControlPdu::LengthReq(data) | ControlPdu::LengthRsp(data) => {
                buffer.write_u16_le(data.max_rx_octets)?;
                buffer.write_u16_le(data.max_rx_time)?;
                buffer.write_u16_le(data.max_tx_octets)?;
                buffer.write_u16_le(data.max_tx_time)?;
                Ok(())
            }
            ControlPdu::Unknown { ctr_data, .. } => {
                buffer.write_slice(ctr_data)?;
                Ok(())
            }
        }
    }
}

enum_with_unknown! {
    /// Enumeration of all known LL Control PDU opcodes (not all of which might be supported).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ControlOpcode(u8) {
        ConnectionUpdateReq = 0x00,
        ChannelMapReq = 0x01,
        TerminateInd = 0x02,
        EncReq = 0x03,
        EncRsp = 0x04,
        StartEncReq = 0x05,
        StartEncRsp = 0x06,
        UnknownRsp = 0x07,
        FeatureReq = 0x08,
        FeatureRsp = 0x09,
        PauseEncReq = 0x0A,
        PauseEncRsp = 0x0B,
        VersionInd = 0x0C,
        RejectInd = 0x0D,
        SlaveFeatureReq = 0x0E,
        ConnectionParamReq = 0x0F,
        ConnectionParamRsp = 0x10,
        RejectIndExt = 0x11,
        PingReq = 0x12,
        PingRsp = 0x13,
        LengthReq = 0x14,
        LengthRsp = 0x15,
    }
}

impl ControlOpcode {
    /// Returns the fixed `CtrData` length for this opcode in octets, or `None` when the opcode is
    /// not defined by the version of the protocol implemented here.
    pub fn ctr_data_length(&self) -> Option<u8> {
        let raw = u8::from(*self);
        CTR_DATA_LENGTHS.get(usize::from(raw)).copied()
    }

    /// Returns whether PDUs with this opcode must be transmitted ahead of queued data traffic.
    ///
    /// These are the opcodes that must not be delayed behind (possibly encrypted or paused) data
    /// PDUs during encryption transitions and teardown.
    pub fn is_queue_critical(&self) -> bool {
        matches!(
            self,
            ControlOpcode::TerminateInd
                | ControlOpcode::RejectInd
                | ControlOpcode::RejectIndExt
                | ControlOpcode::StartEncRsp
                | ControlOpcode::PauseEncRsp
        )
    }
}

enum_with_unknown! {
    /// Enumeration of all possible `VersNr` for `LL_VERSION_IND` PDUs.
    ///
    /// According to https://www.bluetooth.com/specifications/assigned-numbers/link-layer
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum VersionNumber(u8) {
        V4_0 = 6,
        V4_1 = 7,
        V4_2 = 8,
        V5_0 = 9,
        V5_1 = 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> Result<ControlPdu<'_>, Error> {
        ControlPdu::from_bytes(&mut ByteReader::new(raw))
    }

    #[test]
    fn length_table_matches_opcodes() {
        for raw in 0x00..=0x15u8 {
            let opcode = ControlOpcode::from(raw);
            assert_eq!(
                opcode.ctr_data_length(),
                Some(CTR_DATA_LENGTHS[usize::from(raw)]),
                "{:?}",
                opcode
            );
        }
        assert_eq!(ControlOpcode::from(0x16).ctr_data_length(), None);
    }

    #[test]
    fn rejects_bad_ctr_data_length() {
        // TERMINATE_IND with 2 payload bytes instead of 1.
        assert_eq!(parse(&[0x02, 0x13, 0x00]).unwrap_err(), Error::InvalidLength);
        // FEATURE_REQ with 7 payload bytes instead of 8.
        assert_eq!(
            parse(&[0x08, 0, 0, 0, 0, 0, 0, 0]).unwrap_err(),
            Error::InvalidLength
        );
    }

    #[test]
    fn parses_enc_req() {
        let mut raw = vec![0x03];
        raw.extend_from_slice(&0x1122334455667788u64.to_le_bytes());
        raw.extend_from_slice(&0xaabbu16.to_le_bytes());
        raw.extend_from_slice(&0x8877665544332211u64.to_le_bytes());
        raw.extend_from_slice(&0xddccbbaau32.to_le_bytes());
        match parse(&raw).unwrap() {
            ControlPdu::EncReq {
                rand,
                ediv,
                skd_m,
                iv_m,
            } => {
                assert_eq!(rand.0, 0x1122334455667788);
                assert_eq!(ediv, 0xaabb);
                assert_eq!(skd_m.0, 0x8877665544332211);
                assert_eq!(iv_m.0, 0xddccbbaa);
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn roundtrips_conn_param_req() {
        let pdu = ControlPdu::ConnectionParamReq(ConnParamData::new(24, 40, 2, 400));
        let mut buf = [0u8; 24];
        let mut writer = ByteWriter::new(&mut buf);
        pdu.to_bytes(&mut writer).unwrap();
        assert_eq!(writer.space_left(), 0);

        match parse(&buf).unwrap() {
            ControlPdu::ConnectionParamReq(data) => {
                assert_eq!(data, ConnParamData::new(24, 40, 2, 400));
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn unknown_opcode_keeps_payload() {
        match parse(&[0x42, 1, 2, 3]).unwrap() {
            ControlPdu::Unknown { opcode, ctr_data } => {
                assert_eq!(opcode, ControlOpcode::Unknown(0x42));
                assert_eq!(ctr_data, &[1, 2, 3]);
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn queue_critical_set() {
        assert!(ControlOpcode::TerminateInd.is_queue_critical());
        assert!(ControlOpcode::StartEncRsp.is_queue_critical());
        assert!(!ControlOpcode::FeatureReq.is_queue_critical());
        assert!(!ControlOpcode::ConnectionUpdateReq.is_queue_critical());
    }
}

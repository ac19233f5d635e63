//! Advertising channel operations.
//!
//! This module defines the advertising channel PDUs needed to advertise as a connectable device
//! and to initiate connections: `ADV_IND`, `ADV_DIRECT_IND`, the scan exchange, and `CONNECT_REQ`
//! with its fixed-layout `LLData` payload.
//!
//! Advertising data itself is opaque to the Link Layer and handled as raw bytes. Assembling AD
//! structures is the host's job.

use {
    crate::{
        bytes::*,
        link::{channel_map::ChannelMap, AddressKind, DeviceAddress},
        time::{Duration, SleepClockAccuracy},
        Error,
    },
    byteorder::{ByteOrder, LittleEndian},
    core::fmt,
    rand_core::RngCore,
};

/// The fixed Access Address used by all advertising channel packets.
pub const ACCESS_ADDRESS: u32 = 0x8E89_BED6;

/// CRC initialization value for advertising channel packets.
pub const CRC_PRESET: u32 = 0x55_5555;

/// The Access Address identifying a data channel connection.
///
/// Chosen randomly by the initiator for every new connection, subject to validity rules that
/// ensure the address has enough structure for reliable sync word detection.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct AccessAddress(u32);

impl AccessAddress {
    /// Creates an access address from its raw 32-bit value.
    ///
    /// The value is not checked for validity. Use this for addresses received over the air.
    pub fn from_raw(raw: u32) -> Self {
        AccessAddress(raw)
    }

    /// Generates a new valid access address from `rng`.
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        loop {
            let addr = AccessAddress(rng.next_u32());
            if addr.is_valid() {
                return addr;
            }
        }
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Checks the validity rules for data channel access addresses.
    ///
    /// * No more than 6 consecutive equal bits.
    /// * Not the advertising channel access address, and more than 1 bit different from it.
    /// * Not all 4 octets equal.
    /// * No more than 24 bit transitions.
    pub fn is_valid(&self) -> bool {
        let raw = self.0;

        if raw == ACCESS_ADDRESS {
            return false;
        }
        if (raw ^ ACCESS_ADDRESS).count_ones() <= 1 {
            return false;
        }

        let bytes = raw.to_le_bytes();
        if bytes.iter().all(|b| *b == bytes[0]) {
            return false;
        }

        let mut run = 1;
        let mut transitions = 0;
        for i in 1..32 {
            if (raw >> i) & 1 == (raw >> (i - 1)) & 1 {
                run += 1;
                if run > 6 {
                    return false;
                }
            } else {
                run = 1;
                transitions += 1;
            }
        }
        transitions <= 24
    }
}

impl fmt::Debug for AccessAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessAddress({:#010x})", self.0)
    }
}

/// Fixed-layout payload of a `CONNECT_REQ` PDU (`InitA`, `AdvA` and the 22-byte `LLData`).
///
/// All multi-byte fields are little-endian byte arrays so the struct stays unaligned and can be
/// viewed in-place in a received packet buffer.
#[derive(Copy, Clone, zerocopy::FromBytes, zerocopy::AsBytes, zerocopy::Unaligned)]
#[repr(C)]
pub struct ConnectRequestData {
    init_a: [u8; 6],
    adv_a: [u8; 6],
    access_address: [u8; 4],
    crc_init: [u8; 3],
    win_size: u8,
    win_offset: [u8; 2],
    interval: [u8; 2],
    latency: [u8; 2],
    timeout: [u8; 2],
    ch_m: [u8; 5],
    hop_sca: u8,
}

impl ConnectRequestData {
    /// Encoded size of the `CONNECT_REQ` payload in octets.
    pub const SIZE: u8 = 34;

    /// Assembles the payload for an outgoing `CONNECT_REQ`.
    ///
    /// `interval`, `win_offset` and `win_size` are in units of 1.25 ms, `timeout` in units of
    /// 10 ms. The address kinds go into the PDU header, not the payload, so they are not stored
    /// here.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initiator_addr: &DeviceAddress,
        advertiser_addr: &DeviceAddress,
        access_address: AccessAddress,
        crc_init: u32,
        win_size: u8,
        win_offset: u16,
        interval: u16,
        latency: u16,
        timeout: u16,
        channel_map: &ChannelMap,
        hop: u8,
        sca: SleepClockAccuracy,
    ) -> Self {
        debug_assert!((5..=16).contains(&hop));
        let crc = crc_init.to_le_bytes();
        Self {
            init_a: *initiator_addr.raw(),
            adv_a: *advertiser_addr.raw(),
            access_address: access_address.as_u32().to_le_bytes(),
            crc_init: [crc[0], crc[1], crc[2]],
            win_size,
            win_offset: win_offset.to_le_bytes(),
            interval: interval.to_le_bytes(),
            latency: latency.to_le_bytes(),
            timeout: timeout.to_le_bytes(),
            ch_m: channel_map.to_raw(),
            hop_sca: (hop & 0x1f) | (sca.raw() << 5),
        }
    }

    /// Generates the random per-connection parts of the payload: access address, CRC init, and
    /// hop increment.
    pub fn generate_connection_values<R: RngCore>(rng: &mut R) -> (AccessAddress, u32, u8) {
        let aa = AccessAddress::generate(rng);
        let crc_init = rng.next_u32() & 0x00ff_ffff;
        let hop = 5 + (rng.next_u32() % 12) as u8;
        (aa, crc_init, hop)
    }

    /// Returns the initiator's device address. The kind comes from the header's `TxAdd` bit and
    /// must be passed in by the caller.
    pub fn initiator_addr(&self, kind: AddressKind) -> DeviceAddress {
        DeviceAddress::new(self.init_a, kind)
    }

    /// Returns the advertiser's device address.
    pub fn advertiser_addr(&self, kind: AddressKind) -> DeviceAddress {
        DeviceAddress::new(self.adv_a, kind)
    }

    /// Returns the access address of the connection.
    pub fn access_address(&self) -> AccessAddress {
        AccessAddress::from_raw(u32::from_le_bytes(self.access_address))
    }

    /// Returns the CRC initialization value of the connection (24 bits).
    pub fn crc_init(&self) -> u32 {
        u32::from(self.crc_init[0])
            | u32::from(self.crc_init[1]) << 8
            | u32::from(self.crc_init[2]) << 16
    }

    /// Returns the size of the transmit window for the first PDU of the connection.
    pub fn win_size(&self) -> Duration {
        Duration::from_micros(u32::from(self.win_size) * 1_250)
    }

    /// Returns the offset of the transmit window, as a duration since the end of the
    /// `CONNECT_REQ` PDU.
    pub fn win_offset(&self) -> Duration {
        Duration::from_micros(u32::from(u16::from_le_bytes(self.win_offset)) * 1_250)
    }

    /// Returns the duration between connection events.
    pub fn interval(&self) -> Duration {
        Duration::from_micros(u32::from(u16::from_le_bytes(self.interval)) * 1_250)
    }

    /// Returns the slave latency in connection events.
    pub fn latency(&self) -> u16 {
        u16::from_le_bytes(self.latency)
    }

    /// Returns the connection supervision timeout (`connSupervisionTimeout`).
    pub fn supervision_timeout(&self) -> Duration {
        Duration::from_micros(u32::from(u16::from_le_bytes(self.timeout)) * 10_000)
    }

    /// Returns the initial channel map of the connection.
    pub fn channel_map(&self) -> ChannelMap {
        ChannelMap::from_raw(self.ch_m)
    }

    /// Returns the channel hop distance (`hopIncrement`).
    ///
    /// This must be in range `5..=16`.
    pub fn hop(&self) -> u8 {
        self.hop_sca & 0b11111
    }

    /// Returns the master's stated sleep clock accuracy.
    pub fn sleep_clock_accuracy(&self) -> SleepClockAccuracy {
        // The 3-bit field always decodes.
        SleepClockAccuracy::from_raw(self.hop_sca >> 5).unwrap()
    }
}

impl fmt::Debug for ConnectRequestData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequestData")
            .field("access_address", &self.access_address())
            .field("crc_init", &self.crc_init())
            .field("win_size", &self.win_size())
            .field("win_offset", &self.win_offset())
            .field("interval", &self.interval())
            .field("latency", &self.latency())
            .field("timeout", &self.supervision_timeout())
            .field("channel_map", &self.channel_map())
            .field("hop", &self.hop())
            .finish()
    }
}

/// Higher-level representation of a received advertising channel PDU.
#[derive(Debug)]
pub enum Pdu<'a> {
    /// Connectable undirected advertising event.
    AdvInd {
        advertiser_addr: DeviceAddress,
        /// Advertising data (may be empty).
        advertiser_data: &'a [u8],
    },

    /// Connectable directed advertising event.
    AdvDirectInd {
        advertiser_addr: DeviceAddress,
        initiator_addr: DeviceAddress,
    },

    /// Scan request, sent by a scanner to an advertiser.
    ScanReq {
        scanner_addr: DeviceAddress,
        advertiser_addr: DeviceAddress,
    },

    /// Response to a scan request.
    ScanRsp {
        advertiser_addr: DeviceAddress,
        scan_data: &'a [u8],
    },

    /// Connection request, sent by an initiator to an advertiser. Ends the advertiser's
    /// advertising state and establishes a connection.
    ConnectReq {
        /// Address kind of the initiator, from the header's `TxAdd` bit.
        tx_add: AddressKind,
        /// Address kind of the advertiser, from the header's `RxAdd` bit.
        rx_add: AddressKind,
        data: &'a ConnectRequestData,
    },
}

impl<'a> Pdu<'a> {
    /// Parses an advertising channel PDU from a header and its raw payload.
    pub fn parse(header: Header, payload: &'a [u8]) -> Result<Self, Error> {
        if usize::from(header.payload_length()) != payload.len() {
            return Err(Error::InvalidLength);
        }

        let mut bytes = ByteReader::new(payload);
        let tx_kind = header.tx_add_kind();
        let rx_kind = header.rx_add_kind();
        Ok(match header.type_() {
            PduType::AdvInd => Pdu::AdvInd {
                advertiser_addr: DeviceAddress::new(bytes.read_array()?, tx_kind),
                advertiser_data: bytes.read_rest(),
            },
            PduType::AdvDirectInd => Pdu::AdvDirectInd {
                advertiser_addr: DeviceAddress::new(bytes.read_array()?, tx_kind),
                initiator_addr: DeviceAddress::new(bytes.read_array()?, rx_kind),
            },
            PduType::ScanReq => Pdu::ScanReq {
                scanner_addr: DeviceAddress::new(bytes.read_array()?, tx_kind),
                advertiser_addr: DeviceAddress::new(bytes.read_array()?, rx_kind),
            },
            PduType::ScanRsp => Pdu::ScanRsp {
                advertiser_addr: DeviceAddress::new(bytes.read_array()?, tx_kind),
                scan_data: bytes.read_rest(),
            },
            PduType::ConnectReq => Pdu::ConnectReq {
                tx_add: tx_kind,
                rx_add: rx_kind,
                data: bytes.read_obj()?,
            },
            _ => return Err(Error::InvalidValue),
        })
    }

    /// Lowers this PDU into a payload buffer and returns the finished `Header`.
    pub fn lower(&self, buffer: &mut ByteWriter<'_>) -> Result<Header, Error> {
        let space_before = buffer.space_left();
        let mut header = Header::new(self.type_());
        match self {
            Pdu::AdvInd {
                advertiser_addr,
                advertiser_data,
            } => {
                header.set_tx_add(advertiser_addr.is_random());
                buffer.write_slice(advertiser_addr.raw())?;
                buffer.write_slice(advertiser_data)?;
            }
            Pdu::AdvDirectInd {
                advertiser_addr,
                initiator_addr,
            } => {
                header.set_tx_add(advertiser_addr.is_random());
                header.set_rx_add(initiator_addr.is_random());
                buffer.write_slice(advertiser_addr.raw())?;
                buffer.write_slice(initiator_addr.raw())?;
            }
            Pdu::ScanReq {
                scanner_addr,
                advertiser_addr,
            } => {
                header.set_tx_add(scanner_addr.is_random());
                header.set_rx_add(advertiser_addr.is_random());
                buffer.write_slice(scanner_addr.raw())?;
                buffer.write_slice(advertiser_addr.raw())?;
            }
            Pdu::ScanRsp {
                advertiser_addr,
                scan_data,
            } => {
                header.set_tx_add(advertiser_addr.is_random());
                buffer.write_slice(advertiser_addr.raw())?;
                buffer.write_slice(scan_data)?;
            }
            Pdu::ConnectReq {
                tx_add,
                rx_add,
                data,
            } => {
                header.set_tx_add(*tx_add == AddressKind::Random);
                header.set_rx_add(*rx_add == AddressKind::Random);
                buffer.write_obj(*data)?;
            }
        }

        header.set_payload_length((space_before - buffer.space_left()) as u8);
        Ok(header)
    }

    /// Returns the PDU type to put in the header.
    pub fn type_(&self) -> PduType {
        match self {
            Pdu::AdvInd { .. } => PduType::AdvInd,
            Pdu::AdvDirectInd { .. } => PduType::AdvDirectInd,
            Pdu::ScanReq { .. } => PduType::ScanReq,
            Pdu::ScanRsp { .. } => PduType::ScanRsp,
            Pdu::ConnectReq { .. } => PduType::ConnectReq,
        }
    }
}

/// 16-bit Advertising Channel PDU header preceding the Payload.
///
/// The header looks like this:
///
/// ```notrust
/// LSB                                                                     MSB
/// +------------+------------+---------+---------+--------------+------------+
/// |  PDU Type  |     -      |  TxAdd  |  RxAdd  |    Length    |     -      |
/// |  (4 bits)  |  (2 bits)  | (1 bit) | (1 bit) |   (6 bits)   |  (2 bits)  |
/// +------------+------------+---------+---------+--------------+------------+
/// ```
///
/// The `TxAdd` and `RxAdd` field are only used for some payloads, for all others, they should be
/// set to 0.
///
/// Length may be in range 6 to 36 (inclusive).
#[derive(Copy, Clone)]
pub struct Header(u16);

const TXADD_MASK: u16 = 0b00000000_01000000;
const RXADD_MASK: u16 = 0b00000000_10000000;

impl Header {
    /// Creates a new Advertising Channel PDU header specifying the Payload type `ty`.
    pub fn new(ty: PduType) -> Self {
        Header(u16::from(u8::from(ty)))
    }

    /// Parses a header from raw bytes.
    ///
    /// Panics when `raw` contains less than 2 Bytes.
    pub fn parse(raw: &[u8]) -> Self {
        Header(LittleEndian::read_u16(&raw))
    }

    /// Returns the raw representation of the header.
    ///
    /// The returned `u16` must be transmitted LSb first as the first 2 octets of the PDU.
    pub fn to_u16(&self) -> u16 {
        self.0
    }

    /// Sets all bits in the header that are set in `mask`.
    fn set_header_bits(&mut self, mask: u16) {
        self.0 |= mask;
    }

    /// Clears all bits in the header that are set in `mask`.
    fn clear_header_bits(&mut self, mask: u16) {
        self.0 &= !mask;
    }

    /// Returns the PDU type specified in the header.
    pub fn type_(&self) -> PduType {
        PduType::from((self.0 & 0b00000000_00001111) as u8)
    }

    /// Returns the state of the `TxAdd` field.
    pub fn tx_add(&self) -> bool {
        self.0 & TXADD_MASK != 0
    }

    /// Returns the address kind indicated by the `TxAdd` field.
    pub fn tx_add_kind(&self) -> AddressKind {
        if self.tx_add() {
            AddressKind::Random
        } else {
            AddressKind::Public
        }
    }

    /// Sets the `TxAdd` field's value.
    pub fn set_tx_add(&mut self, value: bool) {
        if value {
            self.set_header_bits(TXADD_MASK);
        } else {
            self.clear_header_bits(TXADD_MASK);
        }
    }

    /// Returns the state of the `RxAdd` field.
    pub fn rx_add(&self) -> bool {
        self.0 & RXADD_MASK != 0
    }

    /// Returns the address kind indicated by the `RxAdd` field.
    pub fn rx_add_kind(&self) -> AddressKind {
        if self.rx_add() {
            AddressKind::Random
        } else {
            AddressKind::Public
        }
    }

    /// Sets the `RxAdd` field's value.
    pub fn set_rx_add(&mut self, value: bool) {
        if value {
            self.set_header_bits(RXADD_MASK);
        } else {
            self.clear_header_bits(RXADD_MASK);
        }
    }

    /// Returns the length of the payload in octets as specified in the `Length` field.
    ///
    /// According to the spec, the length must be in range 6...37, but this isn't checked by this
    /// function.
    pub fn payload_length(&self) -> u8 {
        ((self.0 & 0b00111111_00000000) >> 8) as u8
    }

    /// Sets the payload length of this PDU.
    ///
    /// The `length` must be in range 6...37, otherwise this function panics.
    pub fn set_payload_length(&mut self, length: u8) {
        assert!(6 <= length && length <= 37);

        let header = self.0 & !0b00111111_00000000;
        self.0 = header | ((length as u16) << 8);
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("PDU Type", &self.type_())
            .field("TxAdd", &self.tx_add())
            .field("RxAdd", &self.rx_add())
            .field("len", &self.payload_length())
            .finish()
    }
}

enum_with_unknown! {
    /// 4-bit PDU type in `Header`.
    ///
    /// `Adv*` type PDUs are sent while in Advertising state.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum PduType(u8) {
        /// Connectable undirected advertising event.
        AdvInd = 0b0000,
        /// Connectable directed advertising event.
        AdvDirectInd = 0b0001,
        /// Non-connectable undirected advertising event.
        AdvNonconnInd = 0b0010,
        ScanReq = 0b0011,
        ScanRsp = 0b0100,
        ConnectReq = 0b0101,
        /// Scannable undirected advertising event.
        AdvScanInd = 0b0110,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SeqRng(u32, u32);

    impl RngCore for SeqRng {
        fn next_u32(&mut self) -> u32 {
            self.0 = self.0.wrapping_add(self.1);
            self.0
        }
        fn next_u64(&mut self) -> u64 {
            u64::from(self.next_u32()) << 32 | u64::from(self.next_u32())
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for b in dest {
                *b = self.next_u32() as u8;
            }
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn access_address_rules() {
        assert!(!AccessAddress::from_raw(ACCESS_ADDRESS).is_valid());
        // 1 bit away from the advertising address.
        assert!(!AccessAddress::from_raw(ACCESS_ADDRESS ^ 0x0000_0100).is_valid());
        // More than 6 consecutive equal bits.
        assert!(!AccessAddress::from_raw(0x0000_0000).is_valid());
        assert!(!AccessAddress::from_raw(0xffff_ffff).is_valid());
        assert!(!AccessAddress::from_raw(0b01010101_11111110_01010101_01010101).is_valid());
        // All four octets equal.
        assert!(!AccessAddress::from_raw(0x5a5a_5a5a).is_valid());
        // Alternating bits everywhere: 31 transitions.
        assert!(!AccessAddress::from_raw(0xaaaa_aaab).is_valid());

        assert!(AccessAddress::from_raw(0x8C5F_12E9).is_valid());
    }

    #[test]
    fn generate_yields_valid_addresses() {
        let mut rng = SeqRng(0, 0x9E37_79B9);
        for _ in 0..32 {
            assert!(AccessAddress::generate(&mut rng).is_valid());
        }
    }

    #[test]
    fn generated_hop_is_in_range() {
        let mut rng = SeqRng(7, 0x0101_0101);
        for _ in 0..64 {
            let (_, crc_init, hop) = ConnectRequestData::generate_connection_values(&mut rng);
            assert!((5..=16).contains(&hop));
            assert!(crc_init <= 0x00ff_ffff);
        }
    }

    #[test]
    fn connect_req_roundtrip() {
        let initiator =
            DeviceAddress::new([0x10, 0x11, 0x12, 0x13, 0x14, 0x15], AddressKind::Random);
        let advertiser =
            DeviceAddress::new([0x20, 0x21, 0x22, 0x23, 0x24, 0x25], AddressKind::Public);
        let map = ChannelMap::with_all_channels();
        let data = ConnectRequestData::new(
            &initiator,
            &advertiser,
            AccessAddress::from_raw(0x8C5F_12E9),
            0x00ab_cdef,
            3,
            1,
            40,
            2,
            200,
            &map,
            9,
            SleepClockAccuracy::from_raw(4).unwrap(),
        );

        let mut buf = [0u8; 40];
        let mut writer = ByteWriter::new(&mut buf);
        let header = Pdu::ConnectReq {
            tx_add: AddressKind::Random,
            rx_add: AddressKind::Public,
            data: &data,
        }
        .lower(&mut writer)
        .unwrap();

        assert_eq!(header.type_(), PduType::ConnectReq);
        assert!(header.tx_add());
        assert!(!header.rx_add());
        assert_eq!(header.payload_length(), ConnectRequestData::SIZE);

        match Pdu::parse(header, &buf[..34]).unwrap() {
            Pdu::ConnectReq { tx_add, data, .. } => {
                assert_eq!(tx_add, AddressKind::Random);
                assert_eq!(data.initiator_addr(tx_add), initiator);
                assert_eq!(data.access_address().as_u32(), 0x8C5F_12E9);
                assert_eq!(data.crc_init(), 0x00ab_cdef);
                assert_eq!(data.win_size(), Duration::from_micros(3_750));
                assert_eq!(data.win_offset(), Duration::from_micros(1_250));
                assert_eq!(data.interval(), Duration::from_micros(50_000));
                assert_eq!(data.latency(), 2);
                assert_eq!(data.supervision_timeout(), Duration::from_micros(2_000_000));
                assert_eq!(data.hop(), 9);
                assert_eq!(data.sleep_clock_accuracy().raw(), 4);
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn adv_ind_roundtrip() {
        let addr = DeviceAddress::new([1, 2, 3, 4, 5, 6], AddressKind::Public);
        let mut buf = [0u8; 37];
        let mut writer = ByteWriter::new(&mut buf);
        let header = Pdu::AdvInd {
            advertiser_addr: addr,
            advertiser_data: &[0x02, 0x01, 0x06],
        }
        .lower(&mut writer)
        .unwrap();

        assert_eq!(header.payload_length(), 9);
        match Pdu::parse(header, &buf[..9]).unwrap() {
            Pdu::AdvInd {
                advertiser_addr,
                advertiser_data,
            } => {
                assert_eq!(advertiser_addr, addr);
                assert_eq!(advertiser_data, &[0x02, 0x01, 0x06]);
            }
            other => panic!("parsed as {:?}", other),
        }
    }
}

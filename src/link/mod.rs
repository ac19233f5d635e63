//! Link-Layer coordinator.
//!
//! Note that a hardware BLE radio will already implement a few aspects of the link layer (such as
//! CRC calculation, preamble generation, etc.). Consider this module to be a construction kit for
//! BLE Link-Layers: Take whatever your hardware can do, supplement it with a few condiments from
//! this module, and you get a (hopefully) working Link-Layer.
//!
//! The [`LinkLayer`] struct is the entry point. It owns the advertising/initiating state and a
//! small pool of [`Connection`]s, multiplexes the radio between them via the [`sched`] module, and
//! reports what happened to the host through an [`EventQueue`]. The platform drives it from three
//! places: `process_adv_packet` and `process_data_packet` when a packet arrives, and `update` when
//! the timer configured by the last returned [`Cmd`] fires.
//!
//! # Packet Format
//!
//! All values are transmitted in little-endian bit order unless otherwise noted.
//!
//! ```notrust
//! LSB                                                     MSB
//! +-----------+----------------+---------------+------------+
//! | Preamble  | Access Address |     PDU       |  CRC       |
//! | (1 octet) | (4 octets)     | (2-39 octets) | (3 octets) |
//! +-----------+----------------+---------------+------------+
//! ```
//!
//! The 24-bit CRC is calculated over the PDU and transmitted MSb first; data whitening is applied
//! to PDU and CRC. The PDU's format depends on whether it is sent on an *advertising channel*
//! (see [`advertising`]) or a *data channel*.
//!
//! ## Data Channel PDU
//!
//! A data channel PDU contains a 16-bit header and a variably-sized payload. If the connection is
//! encrypted and the payload contains at least 1 octet, a Message Integrity Check (MIC) is
//! appended at the end.
//!
//! ```notrust
//! LSB                                                                MSB
//! +----------+---------+---------+---------+------------+--------------+
//! |   LLID   |  NESN   |   SN    |   MD    |     -      |    Length    |
//! | (2 bits) | (1 bit) | (1 bit) | (1 bit) |  (3 bits)  |   (8 bits)   |
//! +----------+---------+---------+---------+------------+--------------+
//! ```
//!
//! The `NESN` and `SN` fields implement the stop-and-wait acknowledgement scheme, the `MD` field
//! announces that the sender has more data for this connection event. Payload format depends on
//! the 2-bit `LLID` field:
//!
//! * `0b01`: LL Data PDU Continuation fragment or empty PDU.
//! * `0b10`: LL Data PDU Start of L2CAP message (or complete message if no fragmentation
//!   necessary).
//! * `0b11`: LL Control PDU (see [`llcp`]).
//!
//! [`LinkLayer`]: struct.LinkLayer.html
//! [`Connection`]: struct.Connection.html
//! [`Cmd`]: struct.Cmd.html
//! [`EventQueue`]: ../host/struct.EventQueue.html
//! [`sched`]: sched/index.html
//! [`advertising`]: advertising/index.html
//! [`llcp`]: llcp/index.html

pub mod advertising;
pub mod channel_map;
pub mod comp_id;
mod connection;
pub mod data;
mod device_address;
mod features;
pub mod llcp;
pub mod queue;
pub mod sched;
mod seq_num;

pub use self::connection::{Connection, RxQuality};
pub use self::device_address::*;
pub use self::features::*;
pub use self::seq_num::SeqNum;

use {
    self::{
        advertising::{ConnectRequestData, Pdu},
        channel_map::ChannelMap,
        sched::{SchedOwner, ScheduleItem, Scheduler},
    },
    crate::{
        bytes::ByteWriter,
        config::Config,
        host::{Event, EventMask, EventQueue, Role, StatusCode},
        phy::{AdvertisingChannel, DataChannel},
        time::{Duration, Instant, SleepClockAccuracy, Timer},
        utils::HexSlice,
        Error,
    },
};

/// The CRC polynomial to use for CRC24 generation.
///
/// If your radio has hardware support for CRC generation, you may use (parts of) this value to
/// configure it (if necessary). The CRC should be computed only over the PDU. Also note that the
/// CRC, unlike every other field, is transmitted MSb first.
///
/// Counting from the least-significant bit (bit 0), bit `k` in this value is set if the term `x^k`
/// occurs in the CRC polynomial. This includes bit 24, which is usually not explicitly specified.
///
/// Written out, the polynomial is:
///
/// `x^24 + x^10 + x^9 + x^6 + x^4 + x^3 + x + 1`
pub const CRC_POLY: u32 = 0b00000001_00000000_00000110_01011011;

/// Smallest PDU payload buffer a `Transmitter` must provide.
///
/// This is the maximum length of advertising channel payloads, and also the largest data channel
/// payload both sides may use before a data length update procedure has run.
pub const MIN_PAYLOAD_BUF: usize = 37;

/// Smallest PDU buffer (header + payload).
pub const MIN_PDU_BUF: usize = MIN_PAYLOAD_BUF + 2;

/// Number of connections the Link-Layer can keep up concurrently.
const CONN_SLOTS: usize = 2;

/// Maximum advertising data length in an `ADV_IND`.
const MAX_ADV_DATA: usize = 31;

/// Nominal radio time reserved for one advertising event.
const ADV_EVENT_SLOT: Duration = Duration::from_micros(3_000);

/// Nominal radio time reserved for one connection event.
const CONN_EVENT_SLOT: Duration = Duration::from_micros(3_750);

/// `transmitWindowSize` (in 1.25 ms units) offered in outgoing `CONNECT_REQ`s.
const TRANSMIT_WIN_SIZE: u8 = 3;

/// Airtime of a `CONNECT_REQ` packet: 44 octets at 1 Mbit/s.
const CONNECT_REQ_AIRTIME: Duration = Duration::from_micros(44 * 8);

/// Identifies a connection towards the host.
///
/// The low byte indexes the Link-Layer's connection pool. The high byte is a nonzero generation
/// tag, so the handle of a closed connection never aliases a newer connection reusing the same
/// pool slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnHandle(u16);

impl ConnHandle {
    pub fn new(raw: u16) -> Self {
        ConnHandle(raw)
    }

    pub fn raw(&self) -> u16 {
        self.0
    }
}

/// Per-connection traffic counters.
#[derive(Debug, Default, Copy, Clone)]
pub struct Statistics {
    /// Data channel PDUs transmitted, including empty PDUs and retransmissions.
    pub tx_pdus: u32,

    /// Data channel PDUs received with a valid CRC.
    pub rx_pdus: u32,

    /// Packets received with a CRC mismatch.
    pub crc_errors: u32,

    /// Packets received with a valid CRC but a failing message integrity check.
    pub mic_failures: u32,

    /// Connection events in which no valid packet from the peer arrived.
    pub events_missed: u32,

    /// PDUs dropped for a protocol violation: a reserved LLID, or a control payload that could
    /// not be parsed.
    pub rx_protocol_errors: u32,
}

/// Command returned by the Link-Layer to the platform.
///
/// Specifies how the radio should be configured and when to call `LinkLayer::update` again.
#[must_use]
#[derive(Debug, Clone, PartialEq)]
pub struct Cmd {
    /// Radio configuration request.
    pub radio: RadioCmd,

    /// When `LinkLayer::update` should be called next.
    pub next_update: NextUpdate,

    /// Link encryption configuration change, to apply before the radio is reconfigured.
    pub crypto: Option<CryptoCmd>,

    /// Set when a received packet was put into the RX queue and the non-realtime part of the
    /// stack should run.
    pub queued_work: bool,
}

/// Specifies when the Link Layer's `update` method should be called the next time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextUpdate {
    /// Disable timer and do not call `update`.
    Disable,

    /// Keep the previously configured time.
    Keep,

    /// Call `update` at the given `Instant`.
    ///
    /// If `Instant` is in the past, this is a bug and the implementation may panic.
    At(Instant),
}

/// Specifies if and how the radio should listen for transmissions.
///
/// Returned by the Link-Layer update and processing methods to reconfigure the radio as needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCmd {
    /// Turn the radio off and don't call `LinkLayer::process_*` methods.
    ///
    /// `LinkLayer::update` must still be called according to `Cmd`'s `next_update` field.
    Off,

    /// Listen on an advertising channel. If a packet is received, pass it to
    /// `LinkLayer::process_adv_packet`.
    ListenAdvertising {
        /// The advertising channel to listen on.
        channel: AdvertisingChannel,
    },

    /// Listen on a data channel. If a matching packet is received, pass it to
    /// `LinkLayer::process_data_packet`.
    ListenData {
        /// The data channel to listen on.
        channel: DataChannel,

        /// The Access Address to listen for.
        ///
        /// Packets with a different Access Address must not be passed to the Link-Layer. You may
        /// be able to use your Radio's hardware address matching for this.
        access_address: u32,

        /// Initialization value of the CRC-24 calculation.
        ///
        /// Only the least significant 24 bits are relevant.
        crc_init: u32,
    },
}

/// Link encryption change requested from the radio's AES-CCM machinery.
///
/// Emitted while an encryption start or pause procedure moves through its one-sided transition
/// states, where the two directions of the link are encrypted independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoCmd {
    /// Decrypt (and MIC-check) received packets, still transmit plaintext.
    EnableRx {
        /// AES-CCM session key.
        key: [u8; 16],
        /// Initialization vector (IVm || IVs).
        iv: [u8; 8],
    },

    /// Additionally encrypt transmitted packets, completing the transition started by
    /// `EnableRx`.
    EnableTx,

    /// Encrypt and decrypt both directions at once.
    EnableBoth {
        /// AES-CCM session key.
        key: [u8; 16],
        /// Initialization vector (IVm || IVs).
        iv: [u8; 8],
    },

    /// Turn link encryption off (encryption pause).
    Disable,
}

/// Trait for Link Layer packet transmission.
///
/// The specifics of sending a Link-Layer packet depend on the underlying hardware. The `link`
/// module provides building blocks that enable implementations without any BLE hardware support,
/// just a compatible radio is needed.
pub trait Transmitter {
    /// Get a reference to the Transmitter's PDU payload buffer.
    ///
    /// The buffer must hold at least 37 Bytes, as that is the maximum length of advertising
    /// channel payloads. While data channel payloads can be up to 251 Bytes in length (resulting
    /// in a "length" field of 255 with the MIC), devices are allowed to use smaller buffers and
    /// report the supported payload length.
    ///
    /// Both advertising and data channel packets also use an additional 2-Byte header preceding
    /// this payload.
    ///
    /// This buffer must not be changed. The BLE stack relies on the buffer to retain its old
    /// contents after transmitting a packet. A separate buffer must be used for received packets.
    fn tx_payload_buf(&mut self) -> &mut [u8];

    /// Transmit an Advertising Channel PDU.
    ///
    /// For Advertising Channel PDUs, the CRC initialization value is always `CRC_PRESET`, and the
    /// Access Address is always `ADVERTISING_ADDRESS`.
    ///
    /// The implementor is expected to send the preamble and access address, and assemble the rest
    /// of the packet, and must apply data whitening and do the CRC calculation. The inter-frame
    /// spacing also has to be upheld by the implementor (`T_IFS`).
    ///
    /// # Parameters
    ///
    /// * `header`: Advertising Channel PDU Header to prepend to the Payload in `payload_buf()`.
    /// * `channel`: Advertising Channel Index to transmit on.
    fn transmit_advertising(&mut self, header: advertising::Header, channel: AdvertisingChannel);

    /// Transmit a Data Channel PDU.
    ///
    /// The implementor is expected to send the preamble and assemble the rest of the packet, and
    /// must apply data whitening and do the CRC calculation.
    ///
    /// # Parameters
    ///
    /// * `access_address`: The Access Address of the Link-Layer packet.
    /// * `crc_iv`: CRC calculation initial value (`CRC_PRESET` for advertising channel).
    /// * `header`: Data Channel PDU Header to be prepended to the Payload in `payload_buf()`.
    /// * `channel`: Data Channel Index to transmit on.
    fn transmit_data(
        &mut self,
        access_address: u32,
        crc_iv: u32,
        header: data::Header,
        channel: DataChannel,
    );
}

/// Link-Layer state machine, according to the Bluetooth spec.
///
/// Connections are not part of this state; they live in the `LinkLayer`'s pool so that
/// advertising can resume while connections are up.
enum State<C: Config> {
    /// Radio silence: Not listening, not transmitting anything.
    Standby,

    /// Device is advertising and wants to establish a connection.
    Advertising {
        /// Start of the next advertising event.
        next_adv: Instant,
        interval: Duration,

        /// Advertising data to append to each `ADV_IND`.
        adv_data: [u8; MAX_ADV_DATA],
        adv_data_len: u8,

        /// Next advertising channel to use for a message.
        channel: AdvertisingChannel,

        /// Data queues to hand to the connection once a `CONNECT_REQ` arrives.
        data_queues: Option<(C::PacketConsumer, C::PacketProducer)>,
    },

    /// Device is listening for advertisements of a specific peer to connect to.
    Initiating {
        target: DeviceAddress,
        channel: AdvertisingChannel,

        /// Pre-generated connection parameters for the `CONNECT_REQ`.
        access_address: advertising::AccessAddress,
        crc_init: u32,
        hop: u8,

        /// `connInterval` in units of 1.25 ms.
        interval: u16,
        /// `connSlaveLatency` in events.
        latency: u16,
        /// `connSupervisionTimeout` in units of 10 ms.
        timeout: u16,

        data_queues: Option<(C::PacketConsumer, C::PacketProducer)>,
    },
}

/// Implementation of the real-time BLE Link-Layer logic.
///
/// Users of this struct must provide the platform's hardware interface by implementing
/// [`Config`].
///
/// [`Config`]: ../config/trait.Config.html
pub struct LinkLayer<C: Config> {
    dev_addr: DeviceAddress,
    timer: C::Timer,
    rng: C::Rng,
    cipher: C::Cipher,
    sca: SleepClockAccuracy,
    state: State<C>,
    sched: Scheduler,
    events: EventQueue,
    conns: [Option<Connection<C>>; CONN_SLOTS],
    /// Generation tag of the next allocated `ConnHandle` (nonzero, wraps around 255).
    next_tag: u8,
    /// The connection the radio is currently (or was last) tuned to; incoming data channel
    /// packets are routed here.
    active: Option<ConnHandle>,
}

impl<C: Config> LinkLayer<C> {
    /// Creates a new Link-Layer in standby state.
    ///
    /// # Parameters
    ///
    /// * **`dev_addr`**: The device address to broadcast as.
    /// * **`timer`**: A `Timer` implementation.
    /// * **`rng`**: Random number generator for access address and hop generation.
    /// * **`cipher`**: AES-128 block encryption for session key derivation.
    /// * **`sca`**: The sleep clock accuracy of the platform's timer.
    pub fn new(
        dev_addr: DeviceAddress,
        timer: C::Timer,
        rng: C::Rng,
        cipher: C::Cipher,
        sca: SleepClockAccuracy,
    ) -> Self {
        trace!("new LinkLayer, dev={:?}", dev_addr);
        Self {
            dev_addr,
            timer,
            rng,
            cipher,
            sca,
            state: State::Standby,
            sched: Scheduler::new(),
            events: EventQueue::new(),
            conns: [None, None],
            next_tag: 1,
            active: None,
        }
    }

    /// Returns a reference to the timer instance used by the Link-Layer.
    pub fn timer(&mut self) -> &mut C::Timer {
        &mut self.timer
    }

    /// Takes the next pending host event off the event queue.
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.next_event()
    }

    /// Returns whether host events are pending.
    pub fn has_events(&self) -> bool {
        self.events.has_events()
    }

    /// Configures which events are reported to the host; masked events are silently dropped.
    pub fn set_event_mask(&mut self, mask: EventMask) {
        self.events.set_mask(mask);
    }

    /// Returns the connection identified by `handle`, if it is still up.
    pub fn connection(&mut self, handle: ConnHandle) -> Option<&mut Connection<C>> {
        self.conns
            .get_mut(usize::from(handle.raw() & 0xff))?
            .as_mut()
            .filter(|conn| conn.handle() == handle)
    }

    pub fn is_advertising(&self) -> bool {
        if let State::Advertising { .. } = self.state {
            true
        } else {
            false
        }
    }

    /// Starts advertising this device as connectable, sending `adv_data` along with the
    /// advertising PDU.
    ///
    /// The queues are handed to the connection created when an initiator answers with a
    /// `CONNECT_REQ`.
    pub fn start_advertise(
        &mut self,
        interval: Duration,
        adv_data: &[u8],
        transmitter: &mut C::Transmitter,
        tx: C::PacketConsumer,
        rx: C::PacketProducer,
    ) -> Result<Cmd, Error> {
        if adv_data.len() > MAX_ADV_DATA {
            return Err(Error::InvalidLength);
        }
        let mut buf = [0; MAX_ADV_DATA];
        buf[..adv_data.len()].copy_from_slice(adv_data);
        debug!("start_advertise: adv_data = {:?}", HexSlice(adv_data));

        let now = self.timer.now();
        self.state = State::Advertising {
            next_adv: now,
            interval,
            adv_data: buf,
            adv_data_len: adv_data.len() as u8,
            channel: AdvertisingChannel::first(),
            data_queues: Some((tx, rx)),
        };
        self.sched.remove(SchedOwner::Advertising);
        self.reserve(ScheduleItem {
            owner: SchedOwner::Advertising,
            start: now,
            end: now + ADV_EVENT_SLOT,
            last_scheduled: now,
        });

        // The first advertising event is due immediately.
        Ok(self.update(transmitter))
    }

    /// Starts initiating a connection to `target`.
    ///
    /// The radio listens for connectable advertisements of the peer and answers the first one
    /// with a `CONNECT_REQ` carrying the given parameters: `interval` in units of 1.25 ms,
    /// `latency` in connection events, and `timeout` in units of 10 ms.
    pub fn initiate(
        &mut self,
        target: DeviceAddress,
        interval: u16,
        latency: u16,
        timeout: u16,
        tx: C::PacketConsumer,
        rx: C::PacketProducer,
    ) -> Cmd {
        let (access_address, crc_init, hop) =
            ConnectRequestData::generate_connection_values(&mut self.rng);
        debug!("initiate: target={:?}, aa={:?}", target, access_address);

        let channel = AdvertisingChannel::first();
        self.state = State::Initiating {
            target,
            channel,
            access_address,
            crc_init,
            hop,
            interval,
            latency,
            timeout,
            data_queues: Some((tx, rx)),
        };

        Cmd {
            radio: RadioCmd::ListenAdvertising { channel },
            next_update: self.next_wakeup(),
            crypto: None,
            queued_work: false,
        }
    }

    /// Stops advertising or initiating. Established connections stay up.
    pub fn enter_standby(&mut self) {
        self.sched.remove(SchedOwner::Advertising);
        self.sched.remove(SchedOwner::Scanning);
        self.state = State::Standby;
    }

    /// Drops all state: every connection is torn down (without notifying the peers), pending
    /// events are discarded, and the device returns to standby.
    pub fn reset(&mut self) {
        for slot in self.conns.iter_mut() {
            *slot = None;
        }
        self.sched = Scheduler::new();
        self.events.clear();
        self.state = State::Standby;
        self.active = None;
    }

    /// Process an incoming packet from an advertising channel.
    ///
    /// The access address of the packet must be `ADVERTISING_ADDRESS`.
    ///
    /// # Parameters
    ///
    /// * **`rx_end`**: A timestamp indicating when the packet was fully received.
    /// * **`tx`**: A packet transmitter.
    /// * **`header`**: The header of the received packet.
    /// * **`payload`**: The packet payload following the header.
    /// * **`crc_ok`**: Whether the packet's CRC is correct.
    pub fn process_adv_packet(
        &mut self,
        rx_end: Instant,
        tx: &mut C::Transmitter,
        header: advertising::Header,
        payload: &[u8],
        crc_ok: bool,
    ) -> Cmd {
        let parsed = Pdu::parse(header, payload);
        trace!(
            "ADV<- {}{:?}, {:?}",
            if crc_ok { "" } else { "BADCRC " },
            header,
            HexSlice(payload)
        );

        if crc_ok {
            if let Ok(pdu) = &parsed {
                match pdu {
                    Pdu::ConnectReq { rx_add, data, .. } => {
                        if let State::Advertising { data_queues, .. } = &mut self.state {
                            if data.advertiser_addr(*rx_add) == self.dev_addr {
                                if let Some((txq, rxq)) = data_queues.take() {
                                    return self.establish(Role::Slave, data, rx_end, txq, rxq);
                                }
                            }
                        }
                    }
                    Pdu::ScanReq { advertiser_addr, .. } => {
                        if let State::Advertising { channel, .. } = &self.state {
                            if *advertiser_addr == self.dev_addr {
                                let channel = *channel;
                                let rsp = Pdu::ScanRsp {
                                    advertiser_addr: self.dev_addr,
                                    scan_data: &[],
                                };
                                let mut writer = ByteWriter::new(tx.tx_payload_buf());
                                // An empty SCAN_RSP always fits the transmit buffer.
                                let rsp_header = rsp.lower(&mut writer).unwrap();
                                tx.transmit_advertising(rsp_header, channel);

                                // Log after responding to meet timing.
                                debug!("-> SCAN_RSP");
                            }
                        }
                    }
                    Pdu::AdvInd { advertiser_addr, .. } => {
                        if let Some(cmd) = self.try_connect_to(*advertiser_addr, rx_end, tx) {
                            return cmd;
                        }
                    }
                    Pdu::AdvDirectInd {
                        advertiser_addr,
                        initiator_addr,
                    } => {
                        if *initiator_addr == self.dev_addr {
                            if let Some(cmd) = self.try_connect_to(*advertiser_addr, rx_end, tx) {
                                return cmd;
                            }
                        }
                    }
                    Pdu::ScanRsp { .. } => {}
                }
            }
        }

        self.fallback_cmd()
    }

    /// Process an incoming data channel packet.
    ///
    /// The packet is routed to the connection whose event the radio is currently in.
    pub fn process_data_packet(
        &mut self,
        rx_end: Instant,
        tx: &mut C::Transmitter,
        header: data::Header,
        payload: &[u8],
        quality: RxQuality,
    ) -> Cmd {
        let handle = match self.active {
            Some(handle) => handle,
            None => {
                warn!("data channel packet without an active connection");
                return self.fallback_cmd();
            }
        };

        // The event must release the radio before anyone else's reservation starts.
        let limit = self.sched.next_time_for_other(SchedOwner::Connection(handle));
        let result = match self.conns.get_mut(usize::from(handle.raw() & 0xff)) {
            Some(Some(conn)) if conn.handle() == handle => {
                conn.set_event_limit(limit);
                Some(conn.process_data_packet(
                    rx_end,
                    tx,
                    &mut self.timer,
                    &mut self.rng,
                    &mut self.cipher,
                    &mut self.events,
                    header,
                    payload,
                    quality,
                ))
            }
            _ => None,
        };

        match result {
            Some(Ok(cmd)) => self.after_conn_cmd(handle, cmd),
            Some(Err(reason)) => {
                self.teardown(handle, reason);
                self.fallback_cmd()
            }
            None => self.fallback_cmd(),
        }
    }

    /// Update the Link-Layer state.
    ///
    /// This must be called when the timer configured by the last returned [`Cmd`] fires. The
    /// scheduler decides which participant's turn it is.
    ///
    /// [`Cmd`]: struct.Cmd.html
    pub fn update(&mut self, tx: &mut C::Transmitter) -> Cmd {
        let now = self.timer.now();
        let mut cmd = None;

        // When the call comes late, several wakeups may have become due. Each of them must be
        // dispatched (an owner that isn't gets no new reservation and would stall forever); the
        // radio ends up configured by the last one, which also re-derives the next wakeup.
        while let Some(item) = self.sched.pop_due(now) {
            cmd = Some(match item.owner {
                SchedOwner::Advertising => self.advertise(tx),
                SchedOwner::Connection(handle) => self.connection_slot(handle, tx),
                SchedOwner::Scanning => self.fallback_cmd(),
            });
        }

        match cmd {
            Some(cmd) => cmd,
            None => {
                trace!("update with nothing due");
                self.fallback_cmd()
            }
        }
    }

    /// Transmits one `ADV_IND` and books the next advertising event.
    fn advertise(&mut self, tx: &mut C::Transmitter) -> Cmd {
        let (channel, next_adv) = if let State::Advertising {
            next_adv,
            interval,
            adv_data,
            adv_data_len,
            channel,
            ..
        } = &mut self.state
        {
            *channel = channel.cycle();
            let pdu = Pdu::AdvInd {
                advertiser_addr: self.dev_addr,
                advertiser_data: &adv_data[..usize::from(*adv_data_len)],
            };
            let mut writer = ByteWriter::new(tx.tx_payload_buf());
            // An ADV_IND with at most 31 octets of data always fits the transmit buffer.
            let header = pdu.lower(&mut writer).unwrap();
            tx.transmit_advertising(header, *channel);

            *next_adv += *interval;
            (*channel, *next_adv)
        } else {
            return self.fallback_cmd();
        };

        let now = self.timer.now();
        self.reserve(ScheduleItem {
            owner: SchedOwner::Advertising,
            start: next_adv,
            end: next_adv + ADV_EVENT_SLOT,
            last_scheduled: now,
        });

        Cmd {
            radio: RadioCmd::ListenAdvertising { channel },
            next_update: self.next_wakeup(),
            crypto: None,
            queued_work: false,
        }
    }

    /// It is `handle`'s turn on the radio: drive its timer-based transition.
    fn connection_slot(&mut self, handle: ConnHandle, tx: &mut C::Transmitter) -> Cmd {
        self.active = Some(handle);
        let limit = self.sched.next_time_for_other(SchedOwner::Connection(handle));
        let result = match self.conns.get_mut(usize::from(handle.raw() & 0xff)) {
            Some(Some(conn)) if conn.handle() == handle => {
                conn.set_event_limit(limit);
                Some(conn.timer_update(tx, &mut self.timer, &mut self.rng, &mut self.events))
            }
            _ => None,
        };

        match result {
            Some(Ok(cmd)) => self.after_conn_cmd(handle, cmd),
            Some(Err(reason)) => {
                self.teardown(handle, reason);
                self.fallback_cmd()
            }
            None => self.fallback_cmd(),
        }
    }

    /// Answers an advertisement of `advertiser` with a `CONNECT_REQ` if we are initiating a
    /// connection to it.
    fn try_connect_to(
        &mut self,
        advertiser: DeviceAddress,
        rx_end: Instant,
        tx: &mut C::Transmitter,
    ) -> Option<Cmd> {
        let (lldata, channel, queues) = match &mut self.state {
            State::Initiating {
                target,
                channel,
                access_address,
                crc_init,
                hop,
                interval,
                latency,
                timeout,
                data_queues,
            } if *target == advertiser => {
                let queues = data_queues.take()?;
                let lldata = ConnectRequestData::new(
                    &self.dev_addr,
                    target,
                    *access_address,
                    *crc_init,
                    TRANSMIT_WIN_SIZE,
                    0,
                    *interval,
                    *latency,
                    *timeout,
                    &ChannelMap::with_all_channels(),
                    *hop,
                    self.sca,
                );
                (lldata, *channel, queues)
            }
            _ => return None,
        };

        let pdu = Pdu::ConnectReq {
            tx_add: self.dev_addr.kind(),
            rx_add: advertiser.kind(),
            data: &lldata,
        };
        let mut writer = ByteWriter::new(tx.tx_payload_buf());
        // A CONNECT_REQ always fits the minimum transmit buffer.
        let header = pdu.lower(&mut writer).unwrap();
        tx.transmit_advertising(header, channel);

        // The transmit window is referenced to the end of our CONNECT_REQ.
        let tx_end = rx_end + Duration::T_IFS + CONNECT_REQ_AIRTIME;
        let (txq, rxq) = queues;
        Some(self.establish(Role::Master, &lldata, tx_end, txq, rxq))
    }

    /// Creates a connection in the pool and reports it to the host.
    ///
    /// `ref_end` is the end of the PDU the transmit window is referenced to (the received
    /// `CONNECT_REQ` for a slave, our own for a master).
    fn establish(
        &mut self,
        role: Role,
        lldata: &ConnectRequestData,
        ref_end: Instant,
        txq: C::PacketConsumer,
        rxq: C::PacketProducer,
    ) -> Cmd {
        self.state = State::Standby;
        self.sched.remove(SchedOwner::Advertising);
        self.sched.remove(SchedOwner::Scanning);

        let (idx, handle) = match self.alloc_handle() {
            Some(slot) => slot,
            None => {
                warn!("connection pool exhausted");
                self.events.emit(Event::ConnectionComplete {
                    status: StatusCode::ConnectionLimitExceeded,
                    handle: ConnHandle::new(0),
                    role,
                    interval: lldata.interval(),
                    latency: lldata.latency(),
                    supervision_timeout: lldata.supervision_timeout(),
                });
                return self.fallback_cmd();
            }
        };

        let (conn, cmd) = match role {
            Role::Slave => {
                Connection::create_slave(handle, lldata, ref_end, self.sca, txq, rxq)
            }
            Role::Master => {
                Connection::create_master(handle, lldata, ref_end, self.sca, txq, rxq)
            }
        };
        self.conns[idx] = Some(conn);
        self.active = Some(handle);

        debug!(
            "{:?} established as {:?}, interval {:?}",
            handle,
            role,
            lldata.interval()
        );
        self.events.emit(Event::ConnectionComplete {
            status: StatusCode::Success,
            handle,
            role,
            interval: lldata.interval(),
            latency: lldata.latency(),
            supervision_timeout: lldata.supervision_timeout(),
        });

        self.after_conn_cmd(handle, cmd)
    }

    /// Books the wakeup a connection asked for and folds the schedule back into the `Cmd`.
    fn after_conn_cmd(&mut self, handle: ConnHandle, mut cmd: Cmd) -> Cmd {
        if let NextUpdate::At(start) = cmd.next_update {
            let now = self.timer.now();
            self.sched.remove(SchedOwner::Connection(handle));
            self.reserve(ScheduleItem {
                owner: SchedOwner::Connection(handle),
                start,
                end: start + CONN_EVENT_SLOT,
                last_scheduled: now,
            });
            if self.conn_ref(handle).is_none() {
                // The wakeup could not be booked and `reserve` tore the connection down.
                return self.fallback_cmd();
            }
            cmd.next_update = self.next_wakeup();
        }
        cmd
    }

    /// Removes a closed or lost connection and tells the host.
    fn teardown(&mut self, handle: ConnHandle, reason: StatusCode) {
        debug!("{:?} closed: {:?}", handle, reason);
        if let Some(slot) = self.conns.get_mut(usize::from(handle.raw() & 0xff)) {
            if slot.as_ref().map_or(false, |conn| conn.handle() == handle) {
                *slot = None;
            }
        }
        self.sched.remove(SchedOwner::Connection(handle));
        if self.active == Some(handle) {
            self.active = None;
        }
        self.events.emit(Event::DisconnectionComplete { handle, reason });
    }

    fn alloc_handle(&mut self) -> Option<(usize, ConnHandle)> {
        let idx = self.conns.iter().position(Option::is_none)?;
        let tag = self.next_tag;
        self.next_tag = if self.next_tag == u8::max_value() {
            1
        } else {
            self.next_tag + 1
        };
        Some((idx, ConnHandle::new(u16::from(tag) << 8 | idx as u16)))
    }

    /// Books a time slot with the scheduler, moving bumped reservations to a later slot.
    ///
    /// A reservation that cannot be booked anywhere is dropped for good; for a connection that
    /// means its only wakeup is gone and it is torn down.
    fn reserve(&mut self, item: ScheduleItem) {
        use heapless::{consts::U8, Vec};

        let mut pending: Vec<ScheduleItem, U8> = Vec::new();
        pending.push(item).ok();

        // Every retry moves an item at least one interval into the future, so a small budget
        // untangles any realistic overlap.
        let mut budget = 16u8;
        while let Some(mut item) = pending.pop() {
            if budget == 0 {
                warn!("schedule congested, dropping slot of {:?}", item.owner);
                self.drop_reservation(item.owner);
                continue;
            }
            budget -= 1;

            match self.sched.insert(item) {
                Ok(evicted) => {
                    for lost in &evicted {
                        let mut lost = *lost;
                        match self.reschedule_shift(lost.owner) {
                            Some(shift) => {
                                lost.start += shift;
                                lost.end += shift;
                                if pending.push(lost).is_err() {
                                    self.drop_reservation(lost.owner);
                                }
                            }
                            None => self.drop_reservation(lost.owner),
                        }
                    }
                }
                Err(_) => match self.reschedule_shift(item.owner) {
                    // Outranked: try again one interval later.
                    Some(shift) => {
                        item.start += shift;
                        item.end += shift;
                        if pending.push(item).is_err() {
                            self.drop_reservation(item.owner);
                        }
                    }
                    None => self.drop_reservation(item.owner),
                },
            }
        }
    }

    /// A reservation was dropped without a replacement.
    ///
    /// Advertising and scanning recover on their own, but a connection without a booked wakeup
    /// can never make progress again, so it ends here.
    fn drop_reservation(&mut self, owner: SchedOwner) {
        debug!("dropping reservation of {:?}", owner);
        if let SchedOwner::Connection(handle) = owner {
            self.teardown(handle, StatusCode::ConnectionTimeout);
        }
    }

    /// How far a displaced reservation of `owner` can be moved into the future.
    fn reschedule_shift(&self, owner: SchedOwner) -> Option<Duration> {
        match owner {
            SchedOwner::Connection(handle) => self
                .conn_ref(handle)
                .map(|conn| conn.connection_interval()),
            SchedOwner::Advertising => match &self.state {
                State::Advertising { interval, .. } => Some(*interval),
                _ => None,
            },
            // Scanning is opportunistic and does not get rescheduled.
            SchedOwner::Scanning => None,
        }
    }

    fn conn_ref(&self, handle: ConnHandle) -> Option<&Connection<C>> {
        self.conns
            .get(usize::from(handle.raw() & 0xff))?
            .as_ref()
            .filter(|conn| conn.handle() == handle)
    }

    fn next_wakeup(&self) -> NextUpdate {
        match self.sched.next_time() {
            Some(at) => NextUpdate::At(at),
            None => NextUpdate::Disable,
        }
    }

    /// `Cmd` to return when no connection event is in progress: keep listening according to the
    /// current state and wake up for the next reservation.
    fn fallback_cmd(&self) -> Cmd {
        let radio = match &self.state {
            State::Advertising { channel, .. } | State::Initiating { channel, .. } => {
                RadioCmd::ListenAdvertising { channel: *channel }
            }
            State::Standby => RadioCmd::Off,
        };
        Cmd {
            radio,
            next_update: self.next_wakeup(),
            crypto: None,
            queued_work: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bytes::ToBytes,
        config::Cipher,
        link::{
            advertising::{AccessAddress, PduType},
            data::Llid,
            llcp::ControlPdu,
            queue::{PacketQueue, SimpleConsumer, SimpleProducer, SimpleQueue},
        },
    };
    use rand_core::RngCore;

    struct TestTimer(Instant);

    impl Timer for TestTimer {
        fn now(&self) -> Instant {
            self.0
        }
    }

    struct TestTx {
        buf: [u8; MIN_PDU_BUF],
        adv: std::vec::Vec<(advertising::Header, std::vec::Vec<u8>, AdvertisingChannel)>,
        data: std::vec::Vec<(data::Header, std::vec::Vec<u8>)>,
    }

    impl TestTx {
        fn new() -> Self {
            Self {
                buf: [0; MIN_PDU_BUF],
                adv: std::vec::Vec::new(),
                data: std::vec::Vec::new(),
            }
        }
    }

    impl Transmitter for TestTx {
        fn tx_payload_buf(&mut self) -> &mut [u8] {
            &mut self.buf[2..]
        }

        fn transmit_advertising(
            &mut self,
            header: advertising::Header,
            channel: AdvertisingChannel,
        ) {
            let len = usize::from(header.payload_length());
            self.adv
                .push((header, self.buf[2..2 + len].to_vec(), channel));
        }

        fn transmit_data(
            &mut self,
            _access_address: u32,
            _crc_init: u32,
            header: data::Header,
            _channel: DataChannel,
        ) {
            let len = usize::from(header.payload_length());
            self.data.push((header, self.buf[2..2 + len].to_vec()));
        }
    }

    struct SeqRng(u64);

    impl RngCore for SeqRng {
        fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        fn next_u64(&mut self) -> u64 {
            self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
            self.0
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

    struct XorCipher;

    impl Cipher for XorCipher {
        fn encrypt_block(&mut self, key: &[u8; 16], block: &mut [u8; 16]) {
            for (b, k) in block.iter_mut().zip(key) {
                *b ^= k;
            }
        }
    }

    struct TestConfig;

    impl Config for TestConfig {
        type Timer = TestTimer;
        type Transmitter = TestTx;
        type Rng = SeqRng;
        type Cipher = XorCipher;
        type PacketProducer = SimpleProducer<'static>;
        type PacketConsumer = SimpleConsumer<'static>;
    }

    fn t(micros: u32) -> Instant {
        Instant::from_raw_micros(micros)
    }

    fn dev() -> DeviceAddress {
        DeviceAddress::new([0x10, 0x11, 0x12, 0x13, 0x14, 0x15], AddressKind::Public)
    }

    fn peer() -> DeviceAddress {
        DeviceAddress::new([6, 5, 4, 3, 2, 1], AddressKind::Random)
    }

    fn sca() -> SleepClockAccuracy {
        SleepClockAccuracy::from_raw(0).unwrap()
    }

    fn link_layer() -> LinkLayer<TestConfig> {
        LinkLayer::new(dev(), TestTimer(t(0)), SeqRng(1), XorCipher, sca())
    }

    fn queues() -> (SimpleConsumer<'static>, SimpleProducer<'static>) {
        let (_host_tx, tx_cons) = Box::leak(Box::new(SimpleQueue::new())).split();
        let (rx_prod, _host_rx) = Box::leak(Box::new(SimpleQueue::new())).split();
        (tx_cons, rx_prod)
    }

    /// Encodes an advertising PDU the way a radio would hand it to us.
    fn lower_adv(pdu: &Pdu<'_>) -> (advertising::Header, std::vec::Vec<u8>) {
        let mut buf = [0u8; MIN_PDU_BUF];
        let mut writer = ByteWriter::new(&mut buf);
        let header = pdu.lower(&mut writer).unwrap();
        let len = usize::from(header.payload_length());
        (header, buf[..len].to_vec())
    }

    /// 37.5 ms interval, no latency, 1 s supervision timeout, 1.25 ms window offset.
    fn connect_req_to_us() -> ConnectRequestData {
        ConnectRequestData::new(
            &peer(),
            &dev(),
            AccessAddress::from_raw(0x5057_13AC),
            0x00AB_CDEF,
            1,
            1,
            30,
            0,
            100,
            &ChannelMap::with_all_channels(),
            7,
            sca(),
        )
    }

    fn advertising_link_layer() -> (LinkLayer<TestConfig>, TestTx) {
        let mut ll = link_layer();
        let mut tx = TestTx::new();
        let (txq, rxq) = queues();
        let _ = ll
            .start_advertise(Duration::from_millis(200), &[0x02, 0x01, 0x06], &mut tx, txq, rxq)
            .unwrap();
        (ll, tx)
    }

    #[test]
    fn advertising_broadcasts_on_interval() {
        let mut ll = link_layer();
        let mut tx = TestTx::new();
        let (txq, rxq) = queues();
        let cmd = ll
            .start_advertise(Duration::from_millis(200), &[0x02, 0x01, 0x06], &mut tx, txq, rxq)
            .unwrap();

        assert_eq!(tx.adv.len(), 1);
        assert_eq!(tx.adv[0].0.type_(), PduType::AdvInd);
        assert!(matches!(cmd.radio, RadioCmd::ListenAdvertising { .. }));
        assert_eq!(cmd.next_update, NextUpdate::At(t(200_000)));

        ll.timer().0 = t(200_000);
        let cmd = ll.update(&mut tx);
        assert_eq!(tx.adv.len(), 2);
        // The channel advances with every event.
        assert_ne!(tx.adv[0].2, tx.adv[1].2);
        assert_eq!(cmd.next_update, NextUpdate::At(t(400_000)));
    }

    #[test]
    fn connect_req_establishes_slave_connection() {
        let (mut ll, mut tx) = advertising_link_layer();

        let lldata = connect_req_to_us();
        let (header, payload) = lower_adv(&Pdu::ConnectReq {
            tx_add: AddressKind::Random,
            rx_add: dev().kind(),
            data: &lldata,
        });
        let cmd = ll.process_adv_packet(t(500), &mut tx, header, &payload, true);

        assert!(matches!(cmd.radio, RadioCmd::ListenData { .. }));
        assert!(matches!(cmd.next_update, NextUpdate::At(_)));
        assert!(!ll.is_advertising());

        let handle = match ll.next_event() {
            Some(Event::ConnectionComplete {
                status: StatusCode::Success,
                handle,
                role: Role::Slave,
                ..
            }) => handle,
            other => panic!("unexpected event: {:?}", other),
        };
        assert!(ll.connection(handle).is_some());
    }

    #[test]
    fn connect_req_for_other_device_is_ignored() {
        let (mut ll, mut tx) = advertising_link_layer();

        let lldata = ConnectRequestData::new(
            &peer(),
            &DeviceAddress::new([9; 6], AddressKind::Public),
            AccessAddress::from_raw(0x5057_13AC),
            0x00AB_CDEF,
            1,
            1,
            30,
            0,
            100,
            &ChannelMap::with_all_channels(),
            7,
            sca(),
        );
        let (header, payload) = lower_adv(&Pdu::ConnectReq {
            tx_add: AddressKind::Random,
            rx_add: AddressKind::Public,
            data: &lldata,
        });
        let cmd = ll.process_adv_packet(t(500), &mut tx, header, &payload, true);

        assert!(matches!(cmd.radio, RadioCmd::ListenAdvertising { .. }));
        assert!(ll.is_advertising());
        assert!(ll.next_event().is_none());
    }

    #[test]
    fn scan_req_is_answered_with_scan_rsp() {
        let (mut ll, mut tx) = advertising_link_layer();

        let (header, payload) = lower_adv(&Pdu::ScanReq {
            scanner_addr: peer(),
            advertiser_addr: dev(),
        });
        let cmd = ll.process_adv_packet(t(500), &mut tx, header, &payload, true);

        assert_eq!(tx.adv.last().unwrap().0.type_(), PduType::ScanRsp);
        assert!(ll.is_advertising());
        assert!(matches!(cmd.radio, RadioCmd::ListenAdvertising { .. }));
    }

    #[test]
    fn initiating_answers_adv_ind_with_connect_req() {
        let mut ll = link_layer();
        let mut tx = TestTx::new();
        let (txq, rxq) = queues();
        let cmd = ll.initiate(peer(), 30, 0, 100, txq, rxq);
        assert!(matches!(cmd.radio, RadioCmd::ListenAdvertising { .. }));

        let (header, payload) = lower_adv(&Pdu::AdvInd {
            advertiser_addr: peer(),
            advertiser_data: &[],
        });
        let cmd = ll.process_adv_packet(t(1_000), &mut tx, header, &payload, true);

        assert_eq!(tx.adv.last().unwrap().0.type_(), PduType::ConnectReq);
        assert!(matches!(cmd.radio, RadioCmd::Off));
        // Anchor: CONNECT_REQ ends at rx_end + T_IFS + 352 µs, plus the transmit window delay.
        assert_eq!(cmd.next_update, NextUpdate::At(t(1_000 + 150 + 352 + 1_250)));

        let handle = match ll.next_event() {
            Some(Event::ConnectionComplete {
                status: StatusCode::Success,
                handle,
                role: Role::Master,
                ..
            }) => handle,
            other => panic!("unexpected event: {:?}", other),
        };
        assert!(ll.connection(handle).is_some());

        // At the anchor, the master transmits the event's first packet.
        ll.timer().0 = t(2_752);
        let cmd = ll.update(&mut tx);
        assert_eq!(tx.data.len(), 1);
        assert!(matches!(cmd.radio, RadioCmd::ListenData { .. }));
    }

    #[test]
    fn peer_terminate_frees_the_connection() {
        let (mut ll, mut tx) = advertising_link_layer();

        let lldata = connect_req_to_us();
        let (header, payload) = lower_adv(&Pdu::ConnectReq {
            tx_add: AddressKind::Random,
            rx_add: dev().kind(),
            data: &lldata,
        });
        let _ = ll.process_adv_packet(t(500), &mut tx, header, &payload, true);
        let handle = match ll.next_event() {
            Some(Event::ConnectionComplete { handle, .. }) => handle,
            other => panic!("unexpected event: {:?}", other),
        };

        let mut buf = [0u8; 24];
        let mut writer = ByteWriter::new(&mut buf);
        ControlPdu::TerminateInd {
            error_code: StatusCode::RemoteUserTerminatedConnection,
        }
        .to_bytes(&mut writer)
        .unwrap();
        let len = 24 - writer.space_left();
        let mut hdr = data::Header::new(Llid::Control);
        hdr.set_payload_length(len as u8);

        ll.timer().0 = t(4_000);
        let cmd = ll.process_data_packet(t(4_000), &mut tx, hdr, &buf[..len], RxQuality::Ok);

        assert!(matches!(cmd.radio, RadioCmd::Off));
        assert_eq!(cmd.next_update, NextUpdate::Disable);
        assert!(ll.connection(handle).is_none());
        match ll.next_event() {
            Some(Event::DisconnectionComplete { handle: h, reason }) => {
                assert_eq!(h, handle);
                assert_eq!(reason, StatusCode::RemoteUserTerminatedConnection);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn connection_without_a_slot_is_torn_down() {
        let (mut ll, mut tx) = advertising_link_layer();

        let lldata = connect_req_to_us();
        let (header, payload) = lower_adv(&Pdu::ConnectReq {
            tx_add: AddressKind::Random,
            rx_add: dev().kind(),
            data: &lldata,
        });
        let _ = ll.process_adv_packet(t(500), &mut tx, header, &payload, true);
        let handle = match ll.next_event() {
            Some(Event::ConnectionComplete { handle, .. }) => handle,
            other => panic!("unexpected event: {:?}", other),
        };

        // Pack the schedule with advertising slots the connection can neither evict nor dodge,
        // then try to book its wakeup.
        ll.sched = Scheduler::new();
        for i in 0..8u32 {
            ll.sched
                .insert(ScheduleItem {
                    owner: SchedOwner::Advertising,
                    start: t(10_000 + i * 10_000),
                    end: t(11_000 + i * 10_000),
                    last_scheduled: t(0),
                })
                .unwrap();
        }
        ll.reserve(ScheduleItem {
            owner: SchedOwner::Connection(handle),
            start: t(5_000),
            end: t(5_000) + CONN_EVENT_SLOT,
            last_scheduled: t(0),
        });

        // A connection without a wakeup can never run again, so it must not linger.
        assert!(ll.connection(handle).is_none());
        match ll.next_event() {
            Some(Event::DisconnectionComplete { handle: h, reason }) => {
                assert_eq!(h, handle);
                assert_eq!(reason, StatusCode::ConnectionTimeout);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn late_update_serves_every_due_connection() {
        let (mut ll, mut tx) = advertising_link_layer();

        let lldata = connect_req_to_us();
        let (header, payload) = lower_adv(&Pdu::ConnectReq {
            tx_add: AddressKind::Random,
            rx_add: dev().kind(),
            data: &lldata,
        });
        let _ = ll.process_adv_packet(t(500), &mut tx, header, &payload, true);
        let first = match ll.next_event() {
            Some(Event::ConnectionComplete { handle, .. }) => handle,
            other => panic!("unexpected event: {:?}", other),
        };

        // A second peer connects to us after we resume advertising.
        let (txq, rxq) = queues();
        let _ = ll
            .start_advertise(Duration::from_millis(200), &[], &mut tx, txq, rxq)
            .unwrap();
        let _ = ll.process_adv_packet(t(8_700), &mut tx, header, &payload, true);
        let second = match ll.next_event() {
            Some(Event::ConnectionComplete { handle, .. }) => handle,
            other => panic!("unexpected event: {:?}", other),
        };
        assert_ne!(first, second);

        // The update call arrives long after both listen windows ended. Both connections must
        // get their turn: each records the missed event and books its next wakeup.
        ll.timer().0 = t(20_000);
        let _ = ll.update(&mut tx);
        assert_eq!(ll.connection(first).unwrap().statistics().events_missed, 1);
        assert_eq!(ll.connection(second).unwrap().statistics().events_missed, 1);
    }
}

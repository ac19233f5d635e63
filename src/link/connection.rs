//! Connection state and the connection event state machine.
//!
//! A `Connection` owns everything that happens on a data channel: the per-event channel
//! selection, the stop-and-wait ARQ bits, RX window widening, the supervision timeout, data
//! length negotiation, and the LL Control procedures running on top (via the engines in
//! [`llcp`]).
//!
//! The machine is driven from exactly two entry points, mirroring how the radio hands control
//! back to the stack: [`process_data_packet`] for every received packet, and [`timer_update`]
//! when the scheduled wakeup fires (event anchor for a master, window timeout for a slave).
//! Both return a [`Cmd`] describing what the radio should do next, or the reason the connection
//! ended.
//!
//! [`llcp`]: ../llcp/index.html
//! [`process_data_packet`]: struct.Connection.html#method.process_data_packet
//! [`timer_update`]: struct.Connection.html#method.timer_update
//! [`Cmd`]: ../struct.Cmd.html

use {
    crate::{
        bytes::*,
        config::Config,
        host::{Event, EventQueue, Role, StatusCode},
        link::{
            advertising::ConnectRequestData,
            channel_map::{ChannelMap, ChannelSelection},
            comp_id::CompanyId,
            data::{Header, Llid},
            features::FeatureSet,
            llcp::{
                enc::{CryptoChange, EncryptionState, StartEncOutcome},
                proc::{CollisionOutcome, ProcedureEngine, ProcedureId},
                ConnParamData, ConnectionUpdateData, ControlOpcode, ControlPdu, DataLength,
            },
            queue::{Consume, Consumer, ControlQueue, Producer},
            Cmd, ConnHandle, CryptoCmd, NextUpdate, RadioCmd, SeqNum, Statistics, Transmitter,
        },
        phy::DataChannel,
        time::{data_pdu_airtime, Duration, Instant, SleepClockAccuracy, Timer},
        utils::{Hex, HexSlice},
        Error, BLUETOOTH_VERSION,
    },
    core::{marker::PhantomData, num::Wrapping},
    rand_core::RngCore,
};

/// `transmitWindowDelay`: gap between the end of the PDU that establishes (or re-times) the
/// connection and the start of the transmit window offset.
const TRANSMIT_WINDOW_DELAY: Duration = Duration::from_micros(1_250);

/// Margin by which an event must end before the next anchor.
const EVENT_CLOSE_MARGIN: Duration = Duration::T_IFS;

/// `SubVersNr` reported in our `LL_VERSION_IND`.
const SUB_VERSION: u16 = 0x0000;

/// Receive quality of an incoming data channel packet, as reported by the radio.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RxQuality {
    /// CRC (and MIC, if encrypted) check out.
    Ok,

    /// CRC mismatch. Header and payload bits cannot be trusted.
    BadCrc,

    /// CRC fine, but the message integrity check failed. The peers disagree on the session key,
    /// which is unrecoverable.
    BadMic,
}

/// What to do with a freshly received (non-retransmitted) PDU.
enum PduDisposition {
    /// Acknowledge the PDU.
    Ack,

    /// Acknowledge, and tell the caller that packet processing work was queued for the non
    /// real-time part of the stack.
    AckQueued,

    /// Do not acknowledge; the peer will retransmit.
    Nack,
}

/// A Link-Layer state update that is applied with a delay, at a *connection event instant*
/// dictated by the master.
#[derive(Debug, Copy, Clone)]
enum LlcpUpdate {
    /// Switch to a new set of connection parameters.
    ConnUpdate(ConnectionUpdateData),

    /// Start using a different `ChannelMap`.
    ChannelMap { map: ChannelMap, instant: u16 },
}

impl LlcpUpdate {
    /// Returns the connection event number at which this update must be applied.
    fn instant(&self) -> u16 {
        match self {
            LlcpUpdate::ConnUpdate(data) => data.instant(),
            LlcpUpdate::ChannelMap { instant, .. } => *instant,
        }
    }
}

/// Returns the request PDU opcode with which we initiate `id`.
///
/// Only procedures that can lose a collision need this: when one is abandoned, its
/// not-yet-transmitted request must be pulled back out of the control queue.
fn request_opcode(id: ProcedureId) -> Option<ControlOpcode> {
    Some(match id {
        ProcedureId::ConnectionUpdate => ControlOpcode::ConnectionUpdateReq,
        ProcedureId::ConnParamRequest => ControlOpcode::ConnectionParamReq,
        _ => return None,
    })
}

/// Connection state.
pub struct Connection<C: Config> {
    handle: ConnHandle,
    role: Role,

    access_address: u32,
    crc_init: u32,
    channel_map: ChannelMap,
    channels: ChannelSelection,

    /// Data channel of the current (or next) connection event.
    channel: DataChannel,

    /// Connection event interval (duration between the start of 2 subsequent connection events).
    conn_interval: Duration,
    slave_latency: u16,
    supervision_timeout: Duration,

    /// Connection event counter (`connEventCount(er)` in the spec).
    conn_event_count: Wrapping<u16>,

    /// Anchor point of the current (or next) connection event.
    anchor: Instant,

    /// End of the last packet that re-synchronized our timing to the master; reference point for
    /// window widening.
    last_sync: Instant,

    /// Whether the current event's anchor was received. The first packet of an event redefines
    /// the anchor, so widening resets there and not on later packets.
    synced_this_event: bool,

    /// A master event is open between transmitting its first packet and closing the event.
    event_open: bool,

    /// Start of the next foreign radio reservation, set by the `LinkLayer` before every entry.
    /// The current event must release the radio before it.
    event_limit: Option<Instant>,

    /// Combined worst-case sleep clock drift of both devices, in ppm.
    total_sca_ppm: u32,

    /// Whether any packet was received on this connection yet. Until then a shortened
    /// supervision timeout of 6 intervals applies.
    established: bool,
    supervision_deadline: Instant,

    // Acknowledgement / Flow Control state
    /// `SN` bit to be used
    transmit_seq_num: SeqNum,
    next_expected_seq_num: SeqNum,

    /// Header of the last transmitted packet, used for retransmission.
    last_header: Header,

    /// Whether we have ever sent a packet on this connection.
    sent_packet: bool,

    /// Slave latency may only be applied once the master has acknowledged one of our packets.
    latency_permitted: bool,

    /// Consecutive CRC failures within the current event. Two in a row close the event.
    bad_crc_streak: u8,

    /// Whether the last transmitted packet had the MD bit set.
    last_tx_had_md: bool,

    /// Whether the last fresh transmission came from the data queue (drives the
    /// `NumberOfCompletedPackets` event on ack).
    last_tx_was_data: bool,

    /// Opcode of the control PDU currently in flight from the control queue.
    ctrl_in_flight: Option<ControlOpcode>,

    /// What we can receive and transmit. Effective values are the per-direction minimum with the
    /// peer's limits.
    local_lengths: DataLength,
    remote_lengths: DataLength,

    llcp: ProcedureEngine,
    enc: EncryptionState,
    ctrl: ControlQueue,

    /// Long-term key. The master stores it with the host's encryption request; the slave when
    /// answering a `LongTermKeyRequest` event.
    ltk: Option<[u8; 16]>,
    pending_rand: Option<u64>,
    pending_ediv: Option<u16>,
    pending_conn_params: Option<ConnParamData>,

    /// Crypto switch for the platform, delivered with the next returned `Cmd`.
    pending_crypto: Option<CryptoCmd>,

    /// LLCP update received (or staged) earlier, applied at its instant.
    update_data: Option<LlcpUpdate>,

    /// Set once a `LL_TERMINATE_IND` is underway; the connection closes with this reason when
    /// the PDU is acknowledged (or the supervision timeout fires first).
    closing_reason: Option<StatusCode>,

    stats: Statistics,

    tx: C::PacketConsumer,
    rx: C::PacketProducer,

    _p: PhantomData<C>,
}

impl<C: Config> Connection<C> {
    /// Initializes slave-role connection state according to the `LLData` contained in a received
    /// `CONNECT_REQ` advertising PDU.
    ///
    /// Returns the connection state and a `Cmd` to apply to the radio.
    ///
    /// # Parameters
    ///
    /// * **`handle`**: Identifier assigned by the `LinkLayer`.
    /// * **`lldata`**: Data contained in the `CONNECT_REQ` advertising PDU.
    /// * **`rx_end`**: Instant at which the `CONNECT_REQ` PDU was fully received.
    /// * **`local_sca`**: Our own sleep clock accuracy.
    /// * **`tx`**: Channel for packets to transmit.
    /// * **`rx`**: Channel for received packets.
    pub(crate) fn create_slave(
        handle: ConnHandle,
        lldata: &ConnectRequestData,
        rx_end: Instant,
        local_sca: SleepClockAccuracy,
        tx: C::PacketConsumer,
        rx: C::PacketProducer,
    ) -> (Self, Cmd) {
        let window_start = rx_end + TRANSMIT_WINDOW_DELAY + lldata.win_offset();
        let total_sca_ppm =
            u32::from(lldata.sleep_clock_accuracy().ppm()) + u32::from(local_sca.ppm());
        let this = Self::new_common(
            handle,
            Role::Slave,
            lldata,
            window_start,
            total_sca_ppm,
            rx_end,
            tx,
            rx,
        );

        // The master transmits somewhere inside the transmit window, so listen for all of it.
        let cmd = Cmd {
            next_update: NextUpdate::At(window_start + lldata.win_size() + EVENT_CLOSE_MARGIN),
            radio: RadioCmd::ListenData {
                channel: this.channel,
                access_address: this.access_address,
                crc_init: this.crc_init,
            },
            crypto: None,
            queued_work: false,
        };

        (this, cmd)
    }

    /// Initializes master-role connection state after transmitting a `CONNECT_REQ` carrying
    /// `lldata`.
    ///
    /// The first connection event (event counter 0) is anchored `transmitWindowDelay` plus the
    /// transmit window offset after the end of the `CONNECT_REQ`; the returned `Cmd` wakes the
    /// stack at that anchor to transmit the event's first packet.
    pub(crate) fn create_master(
        handle: ConnHandle,
        lldata: &ConnectRequestData,
        rx_end: Instant,
        local_sca: SleepClockAccuracy,
        tx: C::PacketConsumer,
        rx: C::PacketProducer,
    ) -> (Self, Cmd) {
        let anchor = rx_end + TRANSMIT_WINDOW_DELAY + lldata.win_offset();
        let this = Self::new_common(
            handle,
            Role::Master,
            lldata,
            anchor,
            u32::from(local_sca.ppm()),
            rx_end,
            tx,
            rx,
        );

        let cmd = Cmd {
            next_update: NextUpdate::At(anchor),
            radio: RadioCmd::Off,
            crypto: None,
            queued_work: false,
        };

        (this, cmd)
    }

    #[allow(clippy::too_many_arguments)]
    fn new_common(
        handle: ConnHandle,
        role: Role,
        lldata: &ConnectRequestData,
        anchor: Instant,
        total_sca_ppm: u32,
        rx_end: Instant,
        tx: C::PacketConsumer,
        rx: C::PacketProducer,
    ) -> Self {
        let channel_map = lldata.channel_map();
        let mut channels = ChannelSelection::new(lldata.hop());
        let channel = channels.next(&channel_map);
        let interval = lldata.interval();

        Self {
            handle,
            role,
            access_address: lldata.access_address().as_u32(),
            crc_init: lldata.crc_init(),
            channel_map,
            channels,
            channel,
            conn_interval: interval,
            slave_latency: lldata.latency(),
            supervision_timeout: lldata.supervision_timeout(),
            conn_event_count: Wrapping(0),
            anchor,
            last_sync: anchor,
            synced_this_event: false,
            event_open: false,
            event_limit: None,
            total_sca_ppm,
            established: false,
            // Before the first received packet, the link must be declared dead after 6 intervals.
            supervision_deadline: rx_end + Duration::from_micros(interval.as_micros() * 6),
            transmit_seq_num: SeqNum::ZERO,
            next_expected_seq_num: SeqNum::ZERO,
            last_header: Header::new(Llid::DataCont),
            sent_packet: false,
            latency_permitted: false,
            bad_crc_streak: 0,
            last_tx_had_md: false,
            last_tx_was_data: false,
            ctrl_in_flight: None,
            local_lengths: DataLength::DEFAULT,
            remote_lengths: DataLength::DEFAULT,
            llcp: ProcedureEngine::new(),
            enc: EncryptionState::new(),
            ctrl: ControlQueue::new(),
            ltk: None,
            pending_rand: None,
            pending_ediv: None,
            pending_conn_params: None,
            pending_crypto: None,
            update_data: None,
            closing_reason: None,
            stats: Statistics::default(),
            tx,
            rx,
            _p: PhantomData,
        }
    }

    /// Called by the `LinkLayer` when a data channel packet is received.
    ///
    /// Returns `Err(reason)` when the connection has ended (not necessarily due to an error
    /// condition).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn process_data_packet(
        &mut self,
        rx_end: Instant,
        tx: &mut C::Transmitter,
        timer: &mut C::Timer,
        rng: &mut C::Rng,
        cipher: &mut C::Cipher,
        events: &mut EventQueue,
        header: Header,
        payload: &[u8],
        quality: RxQuality,
    ) -> Result<Cmd, StatusCode> {
        let now = timer.now();

        // On a busy link the wakeup timer may never fire, so the procedure response timeout has
        // to be checked on the RX path as well.
        if self.llcp.timed_out(now) {
            return Err(StatusCode::LmpResponseTimeout);
        }

        if quality == RxQuality::BadMic {
            self.stats.mic_failures += 1;
            return Err(StatusCode::MicFailure);
        }

        if quality == RxQuality::BadCrc {
            self.stats.crc_errors += 1;
            self.bad_crc_streak += 1;
            if self.bad_crc_streak >= 2 {
                // Two corrupted packets in a row close the event without a reply.
                return Ok(self.close_event(now, rng, events, false));
            }

            // A single bad CRC: the slave still replies (the master needs the ack stream to keep
            // flowing), the master only when its previous packet promised more data. None of the
            // header bits can be trusted, so the reply never advances ARQ state.
            let must_reply = self.role == Role::Slave || self.last_tx_had_md;
            if !must_reply {
                return Ok(self.close_event(now, rng, events, false));
            }
            if self.sent_packet {
                self.retransmit(tx);
            } else {
                self.transmit_next(tx);
            }
            return Ok(self.continue_event_cmd(false));
        }

        trace!(
            "#{} DATA<- {:?} {:?}",
            self.conn_event_count.0,
            header,
            HexSlice(payload)
        );
        self.stats.rx_pdus += 1;
        self.bad_crc_streak = 0;
        self.established = true;
        self.supervision_deadline = rx_end + self.supervision_timeout;
        if !self.synced_this_event {
            // First packet of the event redefines the anchor; the drift accumulated since the
            // last sync is forgiven.
            self.synced_this_event = true;
            self.last_sync = rx_end;
            if self.role == Role::Slave {
                self.anchor = rx_end;
            }
        }

        // If the sequence number of the packet is the same as our next expected sequence number,
        // the packet contains new data that we should try to process. Otherwise it is a
        // retransmission and only its ack bits matter.
        let is_new = header.sn() == self.next_expected_seq_num;

        // If the packet's "NESN" is equal to our last sent sequence number + 1, the other side
        // has acknowledged our last packet (and is now expecting one with an incremented
        // sequence number).
        let acknowledged = header.nesn() == self.transmit_seq_num + SeqNum::ONE;

        if header.nesn() == SeqNum::ONE {
            self.latency_permitted = true;
        }

        if acknowledged {
            self.transmit_seq_num += SeqNum::ONE;
            self.on_tx_acked(events)?;
        }

        let mut queued_work = false;
        if is_new {
            match self.process_new_pdu(now, header, payload, rng, cipher, events)? {
                PduDisposition::Ack => self.next_expected_seq_num += SeqNum::ONE,
                PduDisposition::AckQueued => {
                    self.next_expected_seq_num += SeqNum::ONE;
                    queued_work = true;
                }
                PduDisposition::Nack => {}
            }
        }

        if acknowledged || !self.sent_packet {
            self.transmit_next(tx);
        } else {
            self.retransmit(tx);
        }

        // The event stays open while either side announces more data and another full exchange
        // fits before the next anchor.
        let more = header.md() || self.last_tx_had_md;
        let mut cmd = if more && self.exchange_fits(rx_end) {
            self.continue_event_cmd(queued_work)
        } else {
            self.close_event(now, rng, events, queued_work)
        };
        cmd.crypto = self.pending_crypto.take();
        Ok(cmd)
    }

    /// Called by the `LinkLayer` when the timer configured by an earlier `Cmd` fires.
    ///
    /// For a master this is either the anchor of the next connection event (transmit the event's
    /// first packet) or the end of an event in which the slave never replied. For a slave it
    /// means the master did not transmit within the widened RX window.
    ///
    /// Returns `Err(reason)` when the connection is closed or lost. In that case, the Link Layer
    /// returns to standby state.
    pub(crate) fn timer_update(
        &mut self,
        tx: &mut C::Transmitter,
        timer: &mut C::Timer,
        rng: &mut C::Rng,
        events: &mut EventQueue,
    ) -> Result<Cmd, StatusCode> {
        let now = timer.now();

        if self.supervision_deadline.is_before_or_at(now) {
            return Err(if self.established {
                StatusCode::ConnectionTimeout
            } else {
                StatusCode::ConnectionFailedToEstablish
            });
        }
        if self.llcp.timed_out(now) {
            return Err(StatusCode::LmpResponseTimeout);
        }

        match self.role {
            Role::Master => {
                if self.event_open {
                    // No reply from the slave this event.
                    self.stats.events_missed += 1;
                    Ok(self.close_event(now, rng, events, false))
                } else {
                    // Anchor reached: transmit the event's first packet and listen for a reply.
                    self.event_open = true;
                    self.synced_this_event = false;
                    self.transmit_next(tx);
                    let mut cmd = self.continue_event_cmd(false);
                    cmd.crypto = self.pending_crypto.take();
                    Ok(cmd)
                }
            }
            Role::Slave => {
                self.stats.events_missed += 1;

                // Once the widening required to catch the next anchor exceeds half the interval,
                // the windows of adjacent events collide and the timing is unrecoverable.
                let widening = self.window_widening(self.anchor + self.conn_interval);
                if widening.as_micros() >= self.conn_interval.as_micros() / 2 {
                    return Err(StatusCode::ConnectionTimeout);
                }

                Ok(self.close_event(now, rng, events, false))
            }
        }
    }

    /// Closes the current connection event and computes the `Cmd` for the next one.
    fn close_event(
        &mut self,
        now: Instant,
        rng: &mut C::Rng,
        events: &mut EventQueue,
        queued_work: bool,
    ) -> Cmd {
        self.bad_crc_streak = 0;
        self.event_open = false;
        self.conn_event_count += Wrapping(1);

        // Start a queued control procedure if none is running.
        self.drive_procedures(now, rng, events);

        let mut skip = 0u16;
        if self.role == Role::Slave
            && self.latency_permitted
            && self.synced_this_event
            && self.closing_reason.is_none()
            && self.ctrl.is_empty()
            && self.llcp.is_idle()
            && !self.tx.has_data()
        {
            skip = self.slave_latency;
        }

        // A pending update is applied when the next event is its instant; until then it pins the
        // connection awake at that instant.
        let mut applied = None;
        if let Some(update) = self.update_data.take() {
            let until = update.instant().wrapping_sub(self.conn_event_count.0) as i16;
            if until <= 0 {
                applied = Some(update);
                skip = 0;
            } else {
                skip = skip.min(until as u16 - 1);
                self.update_data = Some(update);
            }
        }

        for _ in 0..skip {
            self.conn_event_count += Wrapping(1);
            self.channels.next(&self.channel_map);
            self.anchor += self.conn_interval;
        }

        self.channel = self.channels.next(&self.channel_map);
        self.anchor += self.conn_interval;
        self.synced_this_event = false;

        if let Some(update) = applied {
            self.apply_llcp_update(update, events);
        }

        match self.role {
            Role::Slave => {
                let widening = self.window_widening(self.anchor);
                Cmd {
                    next_update: NextUpdate::At(self.anchor + widening + EVENT_CLOSE_MARGIN),
                    radio: RadioCmd::ListenData {
                        channel: self.channel,
                        access_address: self.access_address,
                        crc_init: self.crc_init,
                    },
                    crypto: None,
                    queued_work,
                }
            }
            Role::Master => Cmd {
                next_update: NextUpdate::At(self.anchor),
                radio: RadioCmd::Off,
                crypto: None,
                queued_work,
            },
        }
    }

    /// `Cmd` that keeps the radio on the current channel for the rest of the event.
    fn continue_event_cmd(&self, queued_work: bool) -> Cmd {
        Cmd {
            next_update: NextUpdate::At(self.event_budget_end()),
            radio: RadioCmd::ListenData {
                channel: self.channel,
                access_address: self.access_address,
                crc_init: self.crc_init,
            },
            crypto: None,
            queued_work,
        }
    }

    /// Tells the connection when the next reservation of *another* radio user starts.
    ///
    /// Keeping a busy event open must not overrun that slot, so this caps the event budget.
    pub(crate) fn set_event_limit(&mut self, limit: Option<Instant>) {
        self.event_limit = limit;
    }

    /// Latest instant at which the current event must have released the radio.
    fn event_budget_end(&self) -> Instant {
        let end = self.anchor + self.conn_interval - EVENT_CLOSE_MARGIN;
        match self.event_limit {
            Some(limit) if (limit - EVENT_CLOSE_MARGIN).is_before_or_at(end) => {
                limit - EVENT_CLOSE_MARGIN
            }
            _ => end,
        }
    }

    /// Returns whether another PDU exchange fits into the current event.
    ///
    /// An exchange costs the inter-frame spaces, our next transmission, and the peer's
    /// maximum-length reply; a master additionally has to leave room to acknowledge that reply.
    fn exchange_fits(&self, now: Instant) -> bool {
        let peer_pdu = Duration::from_micros(u32::from(self.effective_rx_lengths().1));
        let own_pdu = data_pdu_airtime(self.last_header.payload_length());
        let next_pdu = data_pdu_airtime(self.effective_tx_lengths().0 as u8);

        let mut needed =
            Duration::T_IFS + Duration::T_IFS + Duration::T_IFS + peer_pdu + own_pdu + next_pdu;
        if self.role == Role::Master {
            needed += Duration::T_IFS + peer_pdu;
        }

        (now + needed).is_before_or_at(self.event_budget_end())
    }

    /// RX window widening at `at`: the worst-case drift both clocks can have accumulated since
    /// the last synchronizing packet.
    ///
    /// Grows monotonically over missed events and resets when an anchor is received. The value
    /// saturates at half the connection interval, where [`timer_update`] declares the timing
    /// unrecoverable.
    ///
    /// [`timer_update`]: #method.timer_update
    fn window_widening(&self, at: Instant) -> Duration {
        let elapsed = u64::from(at.duration_since(self.last_sync).as_micros());
        let widening = elapsed * u64::from(self.total_sca_ppm) / 1_000_000;
        let max = u64::from(self.conn_interval.as_micros() / 2);
        Duration::from_micros(widening.min(max) as u32)
    }

    /// Effective (octets, µs) we may spend on a single transmitted PDU.
    fn effective_tx_lengths(&self) -> (u16, u16) {
        (
            self.local_lengths
                .max_tx_octets
                .min(self.remote_lengths.max_rx_octets),
            self.local_lengths
                .max_tx_time
                .min(self.remote_lengths.max_rx_time),
        )
    }

    /// Effective (octets, µs) the peer may spend transmitting to us.
    fn effective_rx_lengths(&self) -> (u16, u16) {
        (
            self.local_lengths
                .max_rx_octets
                .min(self.remote_lengths.max_tx_octets),
            self.local_lengths
                .max_rx_time
                .min(self.remote_lengths.max_tx_time),
        )
    }

    /// Transmits the next fresh PDU: a staged control PDU if any, a data PDU from the TX queue
    /// otherwise, an empty PDU as last resort.
    ///
    /// Data traffic is withheld while an encryption transition or a teardown is in flight; only
    /// control and empty PDUs may cross those.
    fn transmit_next(&mut self, tx: &mut C::Transmitter) {
        let mut payload_writer = ByteWriter::new(tx.tx_payload_buf());
        let left = payload_writer.space_left();
        let eff_tx = usize::from(self.effective_tx_lengths().0);

        let staged = match self.ctrl.peek() {
            Some(pdu) => {
                // Staged control PDUs always fit the radio buffer.
                payload_writer.write_slice(pdu).unwrap();
                let mut header = Header::new(Llid::Control);
                header.set_payload_length(pdu.len() as u8);
                Some((header, ControlOpcode::from(pdu[0])))
            }
            None => None,
        };

        let header = match staged {
            Some((header, opcode)) => {
                self.ctrl_in_flight = Some(opcode);
                self.last_tx_was_data = false;
                header
            }
            None => {
                self.ctrl_in_flight = None;
                let data_allowed = !self.enc.in_transition() && self.closing_reason.is_none();
                let from_queue = if data_allowed {
                    self.tx.consume_raw_with(|header, pl| {
                        if pl.len() > left || pl.len() > eff_tx {
                            // Doesn't fit (yet); leave it in the queue.
                            return Consume::never(Err(Error::Eof));
                        }
                        payload_writer.write_slice(pl).unwrap();
                        Consume::always(Ok(header))
                    })
                } else {
                    Err(Error::Eof)
                };
                match from_queue {
                    Ok(header) => {
                        self.last_tx_was_data = true;
                        header
                    }
                    Err(_) => {
                        self.last_tx_was_data = false;
                        Header::new(Llid::DataCont)
                    }
                }
            }
        };

        self.send(header, tx);
    }

    /// Sends a new PDU to the connected device (ie. a non-retransmitted PDU).
    fn send(&mut self, mut header: Header, tx: &mut C::Transmitter) {
        header.set_md(self.has_more_data());
        header.set_nesn(self.next_expected_seq_num);
        header.set_sn(self.transmit_seq_num);
        self.last_header = header;
        self.last_tx_had_md = header.md();
        self.sent_packet = true;
        self.stats.tx_pdus += 1;

        trace!("DATA-> {:?}", header);
        tx.transmit_data(self.access_address, self.crc_init, header, self.channel);
    }

    /// Retransmits the last PDU with a refreshed NESN.
    ///
    /// The payload is still in the radio's transmit buffer from the original transmission.
    fn retransmit(&mut self, tx: &mut C::Transmitter) {
        self.last_header.set_nesn(self.next_expected_seq_num);
        self.stats.tx_pdus += 1;
        trace!("DATA-> <<RESEND>> {:?}", self.last_header);
        tx.transmit_data(
            self.access_address,
            self.crc_init,
            self.last_header,
            self.channel,
        );
    }

    /// Whether we want to send more data during this connection event.
    fn has_more_data(&mut self) -> bool {
        !self.ctrl.is_empty()
            || (!self.enc.in_transition() && self.closing_reason.is_none() && self.tx.has_data())
    }

    /// The peer acknowledged our last fresh PDU.
    fn on_tx_acked(&mut self, events: &mut EventQueue) -> Result<(), StatusCode> {
        if self.last_tx_was_data {
            self.last_tx_was_data = false;
            events.emit(Event::NumberOfCompletedPackets {
                handle: self.handle,
                completed: 1,
            });
        }

        let opcode = match self.ctrl_in_flight.take() {
            Some(opcode) => opcode,
            None => return Ok(()),
        };
        self.ctrl.remove_first(opcode);

        if opcode == ControlOpcode::TerminateInd {
            // Peer confirmed the teardown.
            return Err(self
                .closing_reason
                .unwrap_or(StatusCode::ConnectionTerminatedByLocalHost));
        }
        Ok(())
    }

    /// Handles a freshly received (non-duplicate) PDU.
    fn process_new_pdu(
        &mut self,
        now: Instant,
        header: Header,
        payload: &[u8],
        rng: &mut C::Rng,
        cipher: &mut C::Cipher,
        events: &mut EventQueue,
    ) -> Result<PduDisposition, StatusCode> {
        if header.llid() == Llid::Reserved {
            // Not a valid PDU; it must never reach the host's RX queue, and we don't pretend to
            // have processed it.
            warn!("PDU with reserved LLID: {:?}", header);
            self.stats.rx_protocol_errors += 1;
            return Ok(PduDisposition::Nack);
        }

        if header.llid() == Llid::DataCont && payload.is_empty() {
            // Always acknowledge empty packets, no need to process them
            return Ok(PduDisposition::Ack);
        }

        if header.llid() == Llid::Control {
            return match ControlPdu::from_bytes(&mut ByteReader::new(payload)) {
                Ok(pdu) => {
                    info!("LLCP<- {:?}", pdu);
                    self.process_control_pdu(now, pdu, rng, cipher, events)
                }
                // Malformed CtrData: drop the PDU without a reply, but acknowledge it so the
                // peer doesn't retransmit it forever.
                Err(_) => {
                    self.stats.rx_protocol_errors += 1;
                    Ok(PduDisposition::Ack)
                }
            };
        }

        // Regular data PDU: buffer it for the upper layers. If that fails we don't acknowledge,
        // so it will be resent until we have space.
        let result: Result<(), Error> = self.rx.produce_with(header.payload_length(), |writer| {
            writer.write_slice(payload)?;
            Ok(header.llid())
        });

        Ok(if result.is_ok() {
            PduDisposition::AckQueued
        } else {
            trace!("NACK (no space in rx buffer)");
            PduDisposition::Nack
        })
    }

    /// Processes an LL Control PDU and stages any response.
    ///
    /// Returns `Err(reason)` when the connection is closed or lost.
    fn process_control_pdu(
        &mut self,
        now: Instant,
        pdu: ControlPdu<'_>,
        rng: &mut C::Rng,
        cipher: &mut C::Cipher,
        events: &mut EventQueue,
    ) -> Result<PduDisposition, StatusCode> {
        let response = match pdu {
            ControlPdu::ConnectionUpdateReq(update) => {
                if self.role == Role::Master {
                    // Only the master may re-time the connection.
                    return Ok(PduDisposition::Ack);
                }
                if self.llcp.current() == Some(ProcedureId::ConnParamRequest) {
                    // The master's update concludes our parameter request.
                    self.llcp.complete();
                } else if self.llcp.check_collision(ProcedureId::ConnectionUpdate, self.role)
                    == CollisionOutcome::YieldOwn
                {
                    self.abandon_own_procedure(events);
                }
                self.prepare_llcp_update(LlcpUpdate::ConnUpdate(update))?;
                return Ok(PduDisposition::Ack);
            }
            ControlPdu::ChannelMapReq { map, instant } => {
                if self.role == Role::Master {
                    return Ok(PduDisposition::Ack);
                }
                self.prepare_llcp_update(LlcpUpdate::ChannelMap { map, instant })?;
                return Ok(PduDisposition::Ack);
            }
            ControlPdu::TerminateInd { error_code } => {
                info!("peer terminated connection: {:?}", error_code);
                return Err(error_code);
            }
            ControlPdu::EncReq {
                rand,
                ediv,
                skd_m,
                iv_m,
            } => {
                if self.role == Role::Master {
                    return Ok(PduDisposition::Ack);
                }
                let skd_s = rng.next_u64();
                let iv_s = rng.next_u32();
                if self.enc.on_enc_req(skd_m.0, iv_m.0, skd_s, iv_s).is_err() {
                    // Not in a state where encryption may start; drop the request.
                    return Ok(PduDisposition::Ack);
                }
                events.emit(Event::LongTermKeyRequest {
                    handle: self.handle,
                    rand,
                    ediv,
                });
                ControlPdu::EncRsp {
                    skd_s: Hex(skd_s),
                    iv_s: Hex(iv_s),
                }
            }
            ControlPdu::EncRsp { skd_s, iv_s } => {
                if self.role == Role::Slave {
                    return Ok(PduDisposition::Ack);
                }
                let ltk = self.ltk.ok_or(StatusCode::PinOrKeyMissing)?;
                let _ = self.enc.on_enc_rsp(skd_s.0, iv_s.0, cipher, &ltk);
                // Encryption start takes several request/response rounds; each response from
                // the peer re-arms the procedure timeout.
                self.llcp.refresh_timeout(now);
                return Ok(PduDisposition::Ack);
            }
            ControlPdu::StartEncReq => match self.enc.on_start_enc_req() {
                Ok(change) => {
                    self.queue_crypto_change(change);
                    self.llcp.refresh_timeout(now);
                    ControlPdu::StartEncRsp
                }
                Err(_) => return Ok(PduDisposition::Ack),
            },
            ControlPdu::StartEncRsp => match self.enc.on_start_enc_rsp(self.role) {
                Ok(outcome) => {
                    if self.llcp.current() == Some(ProcedureId::EncryptionStart) {
                        self.llcp.complete();
                    }
                    events.emit(Event::EncryptionChange {
                        status: StatusCode::Success,
                        handle: self.handle,
                        enabled: true,
                    });
                    match outcome {
                        StartEncOutcome::RespondAndFinish => {
                            self.queue_crypto_change(CryptoChange::EnableTx);
                            ControlPdu::StartEncRsp
                        }
                        StartEncOutcome::Finish => return Ok(PduDisposition::Ack),
                    }
                }
                Err(_) => return Ok(PduDisposition::Ack),
            },
            ControlPdu::UnknownRsp { unknown_type } => {
                if let Some(cancelled) = self.llcp.on_unknown_rsp(unknown_type) {
                    self.report_procedure_failure(
                        cancelled,
                        StatusCode::UnsupportedRemoteFeature,
                        events,
                    );
                }
                return Ok(PduDisposition::Ack);
            }
            ControlPdu::FeatureReq { features_master } => {
                if self.role == Role::Master {
                    return Ok(PduDisposition::Ack);
                }
                self.llcp.set_remote_features(features_master);
                ControlPdu::FeatureRsp {
                    features_used: features_master & FeatureSet::supported(),
                }
            }
            ControlPdu::FeatureRsp { features_used } => {
                self.llcp.set_remote_features(features_used);
                if self.llcp.current() == Some(ProcedureId::FeatureExchange) {
                    self.llcp.complete();
                    events.emit(Event::ReadRemoteFeaturesComplete {
                        status: StatusCode::Success,
                        handle: self.handle,
                        features: features_used,
                    });
                }
                return Ok(PduDisposition::Ack);
            }
            ControlPdu::PauseEncReq => match self.enc.on_pause_enc_req() {
                Ok(change) => {
                    self.queue_crypto_change(change);
                    ControlPdu::PauseEncRsp
                }
                Err(_) => return Ok(PduDisposition::Ack),
            },
            ControlPdu::PauseEncRsp => match self.enc.on_pause_enc_rsp() {
                Ok(Some(change)) => {
                    // We initiated the pause; this is the responder's (still encrypted)
                    // response, answered with our final unencrypted one.
                    self.queue_crypto_change(change);
                    if self.llcp.current() == Some(ProcedureId::EncryptionPause) {
                        self.llcp.complete();
                    }
                    events.emit(Event::EncryptionChange {
                        status: StatusCode::Success,
                        handle: self.handle,
                        enabled: false,
                    });
                    ControlPdu::PauseEncRsp
                }
                Ok(None) => {
                    events.emit(Event::EncryptionChange {
                        status: StatusCode::Success,
                        handle: self.handle,
                        enabled: false,
                    });
                    return Ok(PduDisposition::Ack);
                }
                Err(_) => return Ok(PduDisposition::Ack),
            },
            ControlPdu::VersionInd {
                vers_nr,
                comp_id,
                sub_vers_nr,
            } => {
                self.llcp.set_remote_version(vers_nr, comp_id, sub_vers_nr.0);
                if self.llcp.current() == Some(ProcedureId::VersionExchange) {
                    self.llcp.complete();
                    events.emit(Event::ReadRemoteVersionComplete {
                        status: StatusCode::Success,
                        handle: self.handle,
                        version: vers_nr,
                        comp_id,
                        sub_vers_nr,
                    });
                }
                if !self.llcp.mark_version_sent() {
                    // Our version indication already went out earlier on this connection.
                    return Ok(PduDisposition::Ack);
                }
                ControlPdu::VersionInd {
                    vers_nr: BLUETOOTH_VERSION,
                    comp_id: CompanyId::TESTING,
                    sub_vers_nr: Hex(SUB_VERSION),
                }
            }
            ControlPdu::RejectInd { error_code } => {
                if let Some((cancelled, code)) = self.llcp.on_reject(None, error_code) {
                    self.report_procedure_failure(cancelled, code, events);
                }
                return Ok(PduDisposition::Ack);
            }
            ControlPdu::RejectIndExt {
                reject_opcode,
                error_code,
            } => {
                if let Some((cancelled, code)) = self.llcp.on_reject(Some(reject_opcode), error_code)
                {
                    self.report_procedure_failure(cancelled, code, events);
                }
                return Ok(PduDisposition::Ack);
            }
            ControlPdu::SlaveFeatureReq { features_slave } => {
                if self.role == Role::Slave {
                    return Ok(PduDisposition::Ack);
                }
                self.llcp.set_remote_features(features_slave);
                ControlPdu::FeatureRsp {
                    features_used: features_slave & FeatureSet::supported(),
                }
            }
            ControlPdu::ConnectionParamReq(params) => {
                match self
                    .llcp
                    .check_collision(ProcedureId::ConnParamRequest, self.role)
                {
                    CollisionOutcome::Reject => ControlPdu::RejectIndExt {
                        reject_opcode: ControlOpcode::ConnectionParamReq,
                        error_code: StatusCode::LmpCollision,
                    },
                    outcome => {
                        if outcome == CollisionOutcome::YieldOwn {
                            self.abandon_own_procedure(events);
                        }
                        match self.role {
                            // The slave answers with its preferences and waits for the master's
                            // connection update.
                            Role::Slave => ControlPdu::ConnectionParamRsp(params),
                            // The master decides immediately and re-times the connection.
                            Role::Master => {
                                self.stage_connection_update(params);
                                return Ok(PduDisposition::Ack);
                            }
                        }
                    }
                }
            }
            ControlPdu::ConnectionParamRsp(params) => {
                if self.role == Role::Slave {
                    return Ok(PduDisposition::Ack);
                }
                if self.llcp.current() == Some(ProcedureId::ConnParamRequest) {
                    self.llcp.complete();
                }
                self.stage_connection_update(params);
                return Ok(PduDisposition::Ack);
            }
            ControlPdu::PingReq => ControlPdu::PingRsp,
            ControlPdu::PingRsp => {
                if self.llcp.current() == Some(ProcedureId::Ping) {
                    self.llcp.complete();
                }
                return Ok(PduDisposition::Ack);
            }
            ControlPdu::LengthReq(lengths) => {
                self.remote_lengths = lengths;
                ControlPdu::LengthRsp(self.local_lengths)
            }
            ControlPdu::LengthRsp(lengths) => {
                self.remote_lengths = lengths;
                if self.llcp.current() == Some(ProcedureId::DataLengthUpdate) {
                    self.llcp.complete();
                }
                return Ok(PduDisposition::Ack);
            }
            ControlPdu::Unknown { opcode, .. } => ControlPdu::UnknownRsp {
                unknown_type: opcode,
            },
        };

        info!("LLCP-> {:?}", response);
        match self.ctrl.stage(&response) {
            Ok(()) => Ok(PduDisposition::Ack),
            // No control slot free: don't acknowledge, the peer will retransmit.
            Err(_) => Ok(PduDisposition::Nack),
        }
    }

    /// Stages a `LL_CONNECTION_UPDATE_REQ` carrying the negotiated parameters (master only).
    fn stage_connection_update(&mut self, params: ConnParamData) {
        // A few events in the future, leaving room for retransmissions of the request.
        let instant = (self.conn_event_count + Wrapping(6)).0;
        let update = ConnectionUpdateData::new(
            1,
            0,
            params.interval_max,
            params.latency,
            params.timeout,
            instant,
        );
        if self
            .ctrl
            .stage(&ControlPdu::ConnectionUpdateReq(update))
            .is_ok()
        {
            self.update_data = Some(LlcpUpdate::ConnUpdate(update));
        }
    }

    /// Abandons our current procedure after losing a collision.
    fn abandon_own_procedure(&mut self, events: &mut EventQueue) {
        if let Some(abandoned) = self.llcp.abandon() {
            if let Some(opcode) = request_opcode(abandoned) {
                self.ctrl.remove_first(opcode);
            }
            self.report_procedure_failure(abandoned, StatusCode::LmpCollision, events);
        }
    }

    /// Reports a cancelled or rejected procedure to the host.
    fn report_procedure_failure(
        &mut self,
        id: ProcedureId,
        status: StatusCode,
        events: &mut EventQueue,
    ) {
        match id {
            ProcedureId::ConnectionUpdate | ProcedureId::ConnParamRequest => {
                events.emit(Event::ConnectionUpdateComplete {
                    status,
                    handle: self.handle,
                    interval: self.conn_interval,
                    latency: self.slave_latency,
                    supervision_timeout: self.supervision_timeout,
                });
            }
            ProcedureId::EncryptionStart | ProcedureId::EncryptionPause => {
                events.emit(Event::EncryptionChange {
                    status,
                    handle: self.handle,
                    enabled: self.enc.is_encrypted(),
                });
            }
            ProcedureId::FeatureExchange => {
                events.emit(Event::ReadRemoteFeaturesComplete {
                    status,
                    handle: self.handle,
                    features: FeatureSet::empty(),
                });
            }
            ProcedureId::VersionExchange => {
                events.emit(Event::ReadRemoteVersionComplete {
                    status,
                    handle: self.handle,
                    version: BLUETOOTH_VERSION,
                    comp_id: CompanyId::TESTING,
                    sub_vers_nr: Hex(0),
                });
            }
            _ => {}
        }
    }

    /// Starts the next queued control procedure, if any, by staging its request PDU.
    fn drive_procedures(&mut self, now: Instant, rng: &mut C::Rng, events: &mut EventQueue) {
        let id = match self.llcp.start_next(now) {
            Some(id) => id,
            None => return,
        };

        let request: ControlPdu<'static> = match id {
            ProcedureId::Terminate => ControlPdu::TerminateInd {
                error_code: self
                    .closing_reason
                    .unwrap_or(StatusCode::RemoteUserTerminatedConnection),
            },
            ProcedureId::EncryptionStart => {
                let skd_m = rng.next_u64();
                let iv_m = rng.next_u32();
                if self.enc.initiate(skd_m, iv_m).is_err() {
                    self.llcp.complete();
                    return;
                }
                ControlPdu::EncReq {
                    rand: Hex(self.pending_rand.take().unwrap_or(0)),
                    ediv: self.pending_ediv.take().unwrap_or(0),
                    skd_m: Hex(skd_m),
                    iv_m: Hex(iv_m),
                }
            }
            ProcedureId::EncryptionPause => {
                if self.enc.initiate_pause().is_err() {
                    self.llcp.complete();
                    return;
                }
                ControlPdu::PauseEncReq
            }
            ProcedureId::FeatureExchange => match self.role {
                Role::Master => ControlPdu::FeatureReq {
                    features_master: FeatureSet::supported(),
                },
                Role::Slave => ControlPdu::SlaveFeatureReq {
                    features_slave: FeatureSet::supported(),
                },
            },
            ProcedureId::VersionExchange => {
                if let Some((version, comp_id, sub_vers_nr)) = self.llcp.remote_version() {
                    // The peer already told us; only report, a second `LL_VERSION_IND` must not
                    // be sent.
                    self.llcp.complete();
                    events.emit(Event::ReadRemoteVersionComplete {
                        status: StatusCode::Success,
                        handle: self.handle,
                        version,
                        comp_id,
                        sub_vers_nr: Hex(sub_vers_nr),
                    });
                    return;
                }
                if !self.llcp.mark_version_sent() {
                    self.llcp.complete();
                    return;
                }
                ControlPdu::VersionInd {
                    vers_nr: BLUETOOTH_VERSION,
                    comp_id: CompanyId::TESTING,
                    sub_vers_nr: Hex(SUB_VERSION),
                }
            }
            ProcedureId::ConnParamRequest => {
                if self.llcp.peer_lacks(FeatureSet::CONN_PARAM_REQ) {
                    self.llcp.complete();
                    self.report_procedure_failure(id, StatusCode::UnsupportedRemoteFeature, events);
                    return;
                }
                match self.pending_conn_params.take() {
                    Some(params) => ControlPdu::ConnectionParamReq(params),
                    None => {
                        self.llcp.complete();
                        return;
                    }
                }
            }
            ProcedureId::Ping => {
                if self.llcp.peer_lacks(FeatureSet::LE_PING) {
                    self.llcp.complete();
                    return;
                }
                ControlPdu::PingReq
            }
            ProcedureId::DataLengthUpdate => {
                if self.llcp.peer_lacks(FeatureSet::LE_PACKET_LENGTH_EXTENSION) {
                    self.llcp.complete();
                    return;
                }
                ControlPdu::LengthReq(self.local_lengths)
            }
            // Staged directly by their initiators together with the update payload.
            ProcedureId::ConnectionUpdate | ProcedureId::ChannelMapUpdate => {
                self.llcp.complete();
                return;
            }
        };

        info!("LLCP-> {:?}", request);
        if self.ctrl.stage(&request).is_err() {
            // All control slots taken; put the procedure back and retry at the next event close.
            self.llcp.complete();
            self.llcp.request(id);
        }
    }

    /// Stores `update` so that it is applied once its *instant* is reached.
    fn prepare_llcp_update(&mut self, update: LlcpUpdate) -> Result<(), StatusCode> {
        if let Some(data) = self.update_data {
            error!(
                "got update data {:?} while update {:?} is already queued",
                update, data
            );
            return Err(StatusCode::LmpCollision);
        }
        let until = update.instant().wrapping_sub(self.conn_event_count.0) as i16;
        if until <= 0 {
            return Err(StatusCode::InstantPassed);
        }
        self.update_data = Some(update);
        Ok(())
    }

    /// Patches the link layer state to incorporate `update`.
    ///
    /// Called while closing the event preceding the update's instant, after the anchor was
    /// advanced with the old timing.
    fn apply_llcp_update(&mut self, update: LlcpUpdate, events: &mut EventQueue) {
        match update {
            LlcpUpdate::ConnUpdate(data) => {
                self.conn_interval = data.interval();
                self.slave_latency = data.latency();
                self.supervision_timeout = data.timeout();
                self.anchor = self.anchor + TRANSMIT_WINDOW_DELAY + data.win_offset();
                if self.llcp.current() == Some(ProcedureId::ConnectionUpdate) {
                    self.llcp.complete();
                }
                events.emit(Event::ConnectionUpdateComplete {
                    status: StatusCode::Success,
                    handle: self.handle,
                    interval: self.conn_interval,
                    latency: self.slave_latency,
                    supervision_timeout: self.supervision_timeout,
                });
            }
            LlcpUpdate::ChannelMap { map, .. } => {
                self.channel_map = map;
            }
        }
    }

    fn queue_crypto_change(&mut self, change: CryptoChange) {
        let key = *self.enc.session_key();
        let iv = self.enc.iv();
        self.pending_crypto = Some(match change {
            CryptoChange::EnableRx => CryptoCmd::EnableRx { key, iv },
            CryptoChange::EnableTx => CryptoCmd::EnableTx,
            CryptoChange::EnableBoth => CryptoCmd::EnableBoth { key, iv },
            CryptoChange::Disable => CryptoCmd::Disable,
        });
    }
}

// Host-facing API, called through the `LinkLayer` between connection events.
impl<C: Config> Connection<C> {
    /// Returns the configured interval between connection events.
    pub fn connection_interval(&self) -> Duration {
        self.conn_interval
    }

    /// Returns this connection's handle.
    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    /// Returns our role on this connection.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the peer's feature set, if a feature exchange has completed.
    pub fn remote_features(&self) -> Option<FeatureSet> {
        self.llcp.remote_features()
    }

    /// Returns per-connection traffic counters.
    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// Requests an orderly termination of the connection.
    ///
    /// A `LL_TERMINATE_IND` overtakes all queued traffic; the connection closes once the peer
    /// acknowledges it (or the supervision timeout fires first).
    pub fn initiate_disconnect(&mut self, reason: StatusCode) {
        if self.closing_reason.is_some() {
            return;
        }
        self.closing_reason = Some(reason);
        self.llcp.request(ProcedureId::Terminate);
    }

    /// Master only: starts the encryption procedure with the long-term key and the peer-issued
    /// `Rand`/`EDIV` pair identifying it.
    pub fn start_encryption(&mut self, ltk: [u8; 16], rand: u64, ediv: u16) {
        self.ltk = Some(ltk);
        self.pending_rand = Some(rand);
        self.pending_ediv = Some(ediv);
        self.llcp.request(ProcedureId::EncryptionStart);
    }

    /// Slave only: the host's positive answer to a `LongTermKeyRequest` event.
    ///
    /// Derives the session key and stages `LL_START_ENC_REQ`; received traffic is expected to be
    /// encrypted from the next event on.
    pub fn provide_ltk(&mut self, ltk: [u8; 16], cipher: &mut C::Cipher) -> Result<(), Error> {
        let change = self.enc.ltk_provided(cipher, &ltk)?;
        self.ltk = Some(ltk);
        self.ctrl.stage(&ControlPdu::StartEncReq)?;
        self.queue_crypto_change(change);
        Ok(())
    }

    /// Slave only: the host has no key for the requested `Rand`/`EDIV`.
    pub fn deny_ltk(&mut self) -> Result<(), Error> {
        self.enc.ltk_denied()?;
        self.ctrl.stage(&ControlPdu::RejectIndExt {
            reject_opcode: ControlOpcode::EncReq,
            error_code: StatusCode::PinOrKeyMissing,
        })
    }

    /// Requests new connection parameters.
    ///
    /// The master re-times the connection directly; the slave asks the master to do so via the
    /// connection parameters request procedure.
    pub fn request_conn_params(&mut self, params: ConnParamData) {
        match self.role {
            Role::Master => self.stage_connection_update(params),
            Role::Slave => {
                self.pending_conn_params = Some(params);
                self.llcp.request(ProcedureId::ConnParamRequest);
            }
        }
    }

    /// Master only: switches the connection to a new channel map, taking effect a few events in
    /// the future.
    pub fn update_channel_map(&mut self, map: ChannelMap) -> Result<(), Error> {
        let instant = (self.conn_event_count + Wrapping(6)).0;
        self.ctrl.stage(&ControlPdu::ChannelMapReq { map, instant })?;
        self.update_data = Some(LlcpUpdate::ChannelMap { map, instant });
        Ok(())
    }

    /// Starts a feature exchange with the peer.
    pub fn read_remote_features(&mut self) {
        self.llcp.request(ProcedureId::FeatureExchange);
    }

    /// Starts a version exchange with the peer.
    pub fn read_remote_version(&mut self) {
        self.llcp.request(ProcedureId::VersionExchange);
    }

    /// Sends an LE ping, verifying that the peer's Link Layer is responsive.
    pub fn ping(&mut self) {
        self.llcp.request(ProcedureId::Ping);
    }

    /// Announces new local receive/transmit capacities to the peer.
    pub fn update_data_length(&mut self, lengths: DataLength) {
        self.local_lengths = lengths;
        self.llcp.request(ProcedureId::DataLengthUpdate);
    }

    /// Master only: pauses encryption, eg. ahead of a key refresh.
    pub fn pause_encryption(&mut self) {
        self.llcp.request(ProcedureId::EncryptionPause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Cipher,
        link::{
            advertising::{self, AccessAddress},
            device_address::{AddressKind, DeviceAddress},
            queue::{PacketQueue, SimpleConsumer, SimpleProducer, SimpleQueue},
            MIN_PDU_BUF,
        },
        phy::AdvertisingChannel,
    };

    struct TestTimer(Instant);

    impl Timer for TestTimer {
        fn now(&self) -> Instant {
            self.0
        }
    }

    struct TestTx {
        buf: [u8; MIN_PDU_BUF],
        sent: Vec<(Header, std::vec::Vec<u8>)>,
    }

    impl TestTx {
        fn new() -> Self {
            Self {
                buf: [0; MIN_PDU_BUF],
                sent: Vec::new(),
            }
        }

        fn last(&self) -> &(Header, std::vec::Vec<u8>) {
            self.sent.last().expect("nothing transmitted")
        }
    }

    impl Transmitter for TestTx {
        fn tx_payload_buf(&mut self) -> &mut [u8] {
            &mut self.buf[2..]
        }

        fn transmit_data(
            &mut self,
            _access_address: u32,
            _crc_init: u32,
            header: Header,
            _channel: DataChannel,
        ) {
            let len = usize::from(header.payload_length());
            self.sent.push((header, self.buf[2..2 + len].to_vec()));
        }

        fn transmit_advertising(
            &mut self,
            _header: advertising::Header,
            _channel: AdvertisingChannel,
        ) {
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

    fn lldata(interval: u16, latency: u16, timeout: u16, win_offset: u16) -> ConnectRequestData {
        ConnectRequestData::new(
            &DeviceAddress::new([1, 2, 3, 4, 5, 6], AddressKind::Public),
            &DeviceAddress::new([6, 5, 4, 3, 2, 1], AddressKind::Random),
            AccessAddress::from_raw(0x5057_13AC),
            0x00AB_CDEF,
            1,
            win_offset,
            interval,
            latency,
            timeout,
            &ChannelMap::with_all_channels(),
            7,
            SleepClockAccuracy::from_raw(0).unwrap(),
        )
    }

    fn header(llid: Llid, sn: u8, nesn: u8, md: bool, len: u8) -> Header {
        let mut header = Header::new(llid);
        if sn == 1 {
            header.set_sn(SeqNum::ONE);
        }
        if nesn == 1 {
            header.set_nesn(SeqNum::ONE);
        }
        header.set_md(md);
        header.set_payload_length(len);
        header
    }

    struct Harness {
        conn: Connection<TestConfig>,
        cmd: Cmd,
        tx: TestTx,
        timer: TestTimer,
        rng: SeqRng,
        cipher: XorCipher,
        events: EventQueue,
        host_tx: SimpleProducer<'static>,
        host_rx: SimpleConsumer<'static>,
    }

    impl Harness {
        fn new(role: Role, lldata: &ConnectRequestData, rx_end: Instant) -> Self {
            let (host_tx, tx_cons) = Box::leak(Box::new(SimpleQueue::new())).split();
            let (rx_prod, host_rx) = Box::leak(Box::new(SimpleQueue::new())).split();
            let sca = SleepClockAccuracy::from_raw(0).unwrap();
            let (conn, cmd) = match role {
                Role::Slave => Connection::<TestConfig>::create_slave(
                    ConnHandle::new(0),
                    lldata,
                    rx_end,
                    sca,
                    tx_cons,
                    rx_prod,
                ),
                Role::Master => Connection::<TestConfig>::create_master(
                    ConnHandle::new(0),
                    lldata,
                    rx_end,
                    sca,
                    tx_cons,
                    rx_prod,
                ),
            };
            Self {
                conn,
                cmd,
                tx: TestTx::new(),
                timer: TestTimer(rx_end),
                rng: SeqRng(1),
                cipher: XorCipher,
                events: EventQueue::new(),
                host_tx,
                host_rx,
            }
        }

        /// 37.5 ms interval, no latency, 1 s supervision timeout.
        fn slave() -> Self {
            Self::new(Role::Slave, &lldata(30, 0, 100, 1), t(0))
        }

        fn rx(
            &mut self,
            rx_end: Instant,
            header: Header,
            payload: &[u8],
        ) -> Result<Cmd, StatusCode> {
            self.timer.0 = rx_end;
            self.conn.process_data_packet(
                rx_end,
                &mut self.tx,
                &mut self.timer,
                &mut self.rng,
                &mut self.cipher,
                &mut self.events,
                header,
                payload,
                RxQuality::Ok,
            )
        }

        fn rx_empty(&mut self, rx_end: Instant, sn: u8, nesn: u8) -> Result<Cmd, StatusCode> {
            self.rx(rx_end, header(Llid::DataCont, sn, nesn, false, 0), &[])
        }

        fn rx_control(
            &mut self,
            rx_end: Instant,
            sn: u8,
            nesn: u8,
            pdu: &ControlPdu<'_>,
        ) -> Result<Cmd, StatusCode> {
            let mut buf = [0u8; 24];
            let mut writer = ByteWriter::new(&mut buf);
            pdu.to_bytes(&mut writer).unwrap();
            let len = 24 - writer.space_left();
            self.rx(
                rx_end,
                header(Llid::Control, sn, nesn, false, len as u8),
                &buf[..len],
            )
        }

        fn staged_opcode(&mut self) -> Option<ControlOpcode> {
            self.conn.ctrl.peek().map(|raw| ControlOpcode::from(raw[0]))
        }

        fn drain_events(&mut self) -> Vec<Event> {
            let mut out = Vec::new();
            while let Some(ev) = self.events.next_event() {
                out.push(ev);
            }
            out
        }
    }

    #[test]
    fn slave_first_listen_covers_transmit_window() {
        let h = Harness::slave();

        // rx_end + transmitWindowDelay + winOffset, listening for winSize plus margin.
        assert_eq!(
            h.cmd.next_update,
            NextUpdate::At(t(1_250 + 1_250 + 1_250 + 150))
        );
        match h.cmd.radio {
            RadioCmd::ListenData { channel, .. } => assert_eq!(channel, DataChannel::new(7)),
            ref other => panic!("unexpected radio cmd: {:?}", other),
        }
    }

    #[test]
    fn first_packet_sets_anchor_and_is_acknowledged() {
        let mut h = Harness::slave();

        let cmd = h.rx_empty(t(3_000), 0, 0).unwrap();
        assert_eq!(h.conn.anchor, t(3_000 + 37_500));
        assert_eq!(h.conn.conn_event_count.0, 1);

        // Our reply acknowledges SN 0 and carries our own SN 0.
        let reply = h.tx.last().0;
        assert_eq!(reply.nesn(), SeqNum::ONE);
        assert_eq!(reply.sn(), SeqNum::ZERO);

        // The next event hops to the next channel.
        match cmd.radio {
            RadioCmd::ListenData { channel, .. } => assert_eq!(channel, DataChannel::new(14)),
            other => panic!("unexpected radio cmd: {:?}", other),
        }
    }

    #[test]
    fn retransmitted_pdu_is_not_requeued() {
        let mut h = Harness::slave();

        h.rx(t(3_000), header(Llid::DataStart, 0, 0, false, 3), &[1, 2, 3])
            .unwrap();
        assert!(h.host_rx.has_data());
        h.host_rx
            .consume_raw_with(|hdr, raw| {
                assert_eq!(hdr.llid(), Llid::DataStart);
                assert_eq!(raw, &[1, 2, 3]);
                Consume::always(Ok(()))
            })
            .unwrap();

        // The master missed our ack and retransmits the same PDU (same SN, NESN unchanged).
        h.rx(t(40_500), header(Llid::DataStart, 0, 0, false, 3), &[1, 2, 3])
            .unwrap();
        assert!(!h.host_rx.has_data());

        // Still acknowledging SN 0, and our own unacked reply went out again.
        let reply = h.tx.last().0;
        assert_eq!(reply.nesn(), SeqNum::ONE);
        assert_eq!(reply.sn(), SeqNum::ZERO);
    }

    #[test]
    fn window_widening_grows_until_resync() {
        let mut h = Harness::slave();

        // 500 ppm (master) + 500 ppm (local), ie. 1 µs of widening per millisecond.
        let start = h.conn.last_sync;
        let w1 = h.conn.window_widening(start + Duration::from_micros(37_500));
        let w5 = h
            .conn
            .window_widening(start + Duration::from_micros(5 * 37_500));
        assert_eq!(w1, Duration::from_micros(37));
        assert_eq!(w5, Duration::from_micros(187));

        // Receiving an anchor resets the reference point.
        h.rx_empty(t(400_000), 0, 0).unwrap();
        assert_eq!(h.conn.last_sync, t(400_000));
        let after = h
            .conn
            .window_widening(t(400_000) + Duration::from_micros(37_500));
        assert_eq!(after, Duration::from_micros(37));
    }

    #[test]
    fn widening_saturates_at_half_interval() {
        let h = Harness::slave();
        let far = h.conn.last_sync + Duration::from_secs(60);
        assert_eq!(
            h.conn.window_widening(far),
            Duration::from_micros(37_500 / 2)
        );
    }

    #[test]
    fn event_continues_only_while_budget_allows() {
        let mut h = Harness::slave();

        // Early in the event, MD keeps it open: same channel, counter unchanged.
        let cmd = h
            .rx(t(10_000), header(Llid::DataCont, 0, 0, true, 0), &[])
            .unwrap();
        assert_eq!(h.conn.conn_event_count.0, 0);
        match cmd.radio {
            RadioCmd::ListenData { channel, .. } => assert_eq!(channel, DataChannel::new(7)),
            other => panic!("unexpected radio cmd: {:?}", other),
        }

        // Right before the next anchor there is no room for another exchange.
        h.rx(t(47_000), header(Llid::DataCont, 1, 1, true, 0), &[])
            .unwrap();
        assert_eq!(h.conn.conn_event_count.0, 1);
        assert_eq!(h.conn.channel, DataChannel::new(14));
    }

    #[test]
    fn two_bad_crcs_close_the_event_without_reply() {
        let mut h = Harness::slave();
        let sent_before = h.tx.sent.len();

        h.timer.0 = t(10_000);
        let hdr = header(Llid::DataCont, 0, 0, false, 0);
        h.conn
            .process_data_packet(
                t(10_000),
                &mut h.tx,
                &mut h.timer,
                &mut h.rng,
                &mut h.cipher,
                &mut h.events,
                hdr,
                &[],
                RxQuality::BadCrc,
            )
            .unwrap();
        // A single bad CRC still gets a reply so the master sees our ack bits.
        assert_eq!(h.tx.sent.len(), sent_before + 1);
        assert_eq!(h.conn.conn_event_count.0, 0);

        let cmd = h
            .conn
            .process_data_packet(
                t(10_500),
                &mut h.tx,
                &mut h.timer,
                &mut h.rng,
                &mut h.cipher,
                &mut h.events,
                hdr,
                &[],
                RxQuality::BadCrc,
            )
            .unwrap();
        // Second in a row: event over, no extra transmission.
        assert_eq!(h.tx.sent.len(), sent_before + 1);
        assert_eq!(h.conn.conn_event_count.0, 1);
        match cmd.radio {
            RadioCmd::ListenData { channel, .. } => assert_eq!(channel, DataChannel::new(14)),
            other => panic!("unexpected radio cmd: {:?}", other),
        }
    }

    #[test]
    fn mic_failure_kills_the_connection() {
        let mut h = Harness::slave();
        let err = h
            .conn
            .process_data_packet(
                t(10_000),
                &mut h.tx,
                &mut h.timer,
                &mut h.rng,
                &mut h.cipher,
                &mut h.events,
                header(Llid::DataCont, 0, 0, false, 0),
                &[],
                RxQuality::BadMic,
            )
            .unwrap_err();
        assert_eq!(err, StatusCode::MicFailure);
    }

    #[test]
    fn encryption_start_emits_single_change() {
        let mut h = Harness::slave();

        // Master requests encryption.
        h.rx_control(
            t(3_000),
            0,
            0,
            &ControlPdu::EncReq {
                rand: Hex(0x1122_3344_5566_7788),
                ediv: 0xaabb,
                skd_m: Hex(0x0101_0202_0303_0404),
                iv_m: Hex(0x0506_0708),
            },
        )
        .unwrap();

        let events = h.drain_events();
        assert_eq!(events.len(), 1);
        match events[0] {
            Event::LongTermKeyRequest { rand, ediv, .. } => {
                assert_eq!(rand.0, 0x1122_3344_5566_7788);
                assert_eq!(ediv, 0xaabb);
            }
            ref other => panic!("unexpected event: {:?}", other),
        }
        // Our LL_ENC_RSP went out with the reply to the request.
        assert_eq!(h.tx.last().1[0], u8::from(ControlOpcode::EncRsp));

        // Host supplies the key; LL_START_ENC_REQ queues up behind the in-flight LL_ENC_RSP and
        // goes out once that is acknowledged. RX decryption switches on right away.
        h.conn.provide_ltk([0x42; 16], &mut XorCipher).unwrap();
        let cmd = h.rx_empty(t(40_500), 1, 1).unwrap();
        assert!(matches!(cmd.crypto, Some(CryptoCmd::EnableRx { .. })));
        assert_eq!(h.tx.last().1[0], u8::from(ControlOpcode::StartEncReq));

        // Master confirms; exactly one EncryptionChange, and our own response goes ahead of
        // everything else.
        let cmd = h
            .rx_control(t(78_000), 0, 0, &ControlPdu::StartEncRsp)
            .unwrap();
        assert!(matches!(cmd.crypto, Some(CryptoCmd::EnableTx)));
        assert!(h.conn.enc.is_encrypted());
        assert_eq!(h.staged_opcode(), Some(ControlOpcode::StartEncRsp));

        let changes = h
            .drain_events()
            .into_iter()
            .filter(|ev| matches!(ev, Event::EncryptionChange { .. }))
            .count();
        assert_eq!(changes, 1);
    }

    #[test]
    fn param_request_collision_yields_on_slave() {
        let mut h = Harness::slave();

        // Close an event so the requested procedure starts and its PDU is staged.
        h.rx_empty(t(3_000), 0, 0).unwrap();
        h.conn
            .request_conn_params(ConnParamData::new(24, 40, 0, 400));
        h.rx_empty(t(40_500), 1, 1).unwrap();
        assert_eq!(h.staged_opcode(), Some(ControlOpcode::ConnectionParamReq));
        assert_eq!(h.conn.llcp.current(), Some(ProcedureId::ConnParamRequest));
        h.drain_events();

        // The master starts its own parameter request before ours went anywhere: the slave
        // yields, reports the collision, and answers the master instead.
        h.rx_control(
            t(78_000),
            0,
            0,
            &ControlPdu::ConnectionParamReq(ConnParamData::new(6, 12, 0, 200)),
        )
        .unwrap();

        assert_eq!(h.conn.llcp.current(), None);
        assert_eq!(h.staged_opcode(), Some(ControlOpcode::ConnectionParamRsp));
        let events = h.drain_events();
        assert!(events.iter().any(|ev| matches!(
            ev,
            Event::ConnectionUpdateComplete {
                status: StatusCode::LmpCollision,
                ..
            }
        )));
    }

    #[test]
    fn unknown_rsp_fails_the_matching_procedure() {
        let mut h = Harness::slave();

        h.conn.update_data_length(DataLength {
            max_rx_octets: 100,
            max_rx_time: 880,
            max_tx_octets: 100,
            max_tx_time: 880,
        });
        h.rx_empty(t(3_000), 0, 0).unwrap();
        assert_eq!(h.staged_opcode(), Some(ControlOpcode::LengthReq));

        h.rx_control(
            t(40_500),
            1,
            1,
            &ControlPdu::UnknownRsp {
                unknown_type: ControlOpcode::LengthReq,
            },
        )
        .unwrap();
        assert_eq!(h.conn.llcp.current(), None);
    }

    #[test]
    fn connection_update_applies_at_instant() {
        let mut h = Harness::slave();
        h.rx_empty(t(3_000), 0, 0).unwrap();

        // Update at instant 3: interval 15 units (18.75 ms), new timeout 2 s.
        h.rx_control(
            t(40_500),
            1,
            1,
            &ControlPdu::ConnectionUpdateReq(ConnectionUpdateData::new(1, 2, 15, 0, 200, 3)),
        )
        .unwrap();

        // Event 1 still closed with the old timing.
        assert_eq!(h.conn.connection_interval(), Duration::from_micros(37_500));

        // Closing event 2 reaches the instant; event 3 runs with the new parameters.
        h.rx_empty(t(78_000), 0, 0).unwrap();
        assert_eq!(h.conn.connection_interval(), Duration::from_micros(18_750));

        // New anchor: old anchor + old interval + transmitWindowDelay + winOffset.
        assert_eq!(h.conn.anchor, t(78_000 + 37_500 + 1_250 + 2 * 1_250));
        assert!(h.drain_events().iter().any(|ev| matches!(
            ev,
            Event::ConnectionUpdateComplete {
                status: StatusCode::Success,
                ..
            }
        )));
    }

    #[test]
    fn update_with_passed_instant_is_fatal() {
        let mut h = Harness::slave();
        h.rx_empty(t(3_000), 0, 0).unwrap();

        let err = h
            .rx_control(
                t(40_500),
                1,
                1,
                &ControlPdu::ConnectionUpdateReq(ConnectionUpdateData::new(1, 0, 15, 0, 200, 1)),
            )
            .unwrap_err();
        assert_eq!(err, StatusCode::InstantPassed);
    }

    #[test]
    fn peer_terminate_closes_connection() {
        let mut h = Harness::slave();
        let err = h
            .rx_control(
                t(3_000),
                0,
                0,
                &ControlPdu::TerminateInd {
                    error_code: StatusCode::RemoteUserTerminatedConnection,
                },
            )
            .unwrap_err();
        assert_eq!(err, StatusCode::RemoteUserTerminatedConnection);
    }

    #[test]
    fn local_disconnect_waits_for_ack() {
        let mut h = Harness::slave();
        h.conn
            .initiate_disconnect(StatusCode::RemoteUserTerminatedConnection);

        // Event close starts the procedure and stages LL_TERMINATE_IND.
        h.rx_empty(t(3_000), 0, 0).unwrap();
        assert_eq!(h.staged_opcode(), Some(ControlOpcode::TerminateInd));

        // Next exchange transmits it; the connection is still alive.
        h.rx_empty(t(40_500), 1, 1).unwrap();
        assert_eq!(h.tx.last().1[0], u8::from(ControlOpcode::TerminateInd));

        // The ack of the TERMINATE_IND ends the connection.
        let err = h.rx_empty(t(78_000), 0, 0).unwrap_err();
        assert_eq!(err, StatusCode::RemoteUserTerminatedConnection);
    }

    #[test]
    fn master_transmits_at_anchor() {
        let mut h = Harness::new(Role::Master, &lldata(30, 0, 100, 2), t(0));

        // Radio stays off until the computed anchor.
        assert_eq!(h.cmd.next_update, NextUpdate::At(t(1_250 + 2_500)));
        assert!(matches!(h.cmd.radio, RadioCmd::Off));

        h.timer.0 = t(3_750);
        let cmd = h
            .conn
            .timer_update(&mut h.tx, &mut h.timer, &mut h.rng, &mut h.events)
            .unwrap();
        assert_eq!(h.tx.sent.len(), 1);
        assert_eq!(h.conn.conn_event_count.0, 0);
        assert!(matches!(cmd.radio, RadioCmd::ListenData { .. }));

        // Slave's reply closes the event; the radio sleeps until the next anchor.
        let cmd = h.rx_empty(t(3_900), 0, 1).unwrap();
        assert_eq!(h.conn.conn_event_count.0, 1);
        assert!(matches!(cmd.radio, RadioCmd::Off));
        assert_eq!(cmd.next_update, NextUpdate::At(t(3_750 + 37_500)));
    }

    #[test]
    fn supervision_timeout_before_establishment() {
        let mut h = Harness::slave();

        // 6 intervals without a single packet.
        h.timer.0 = t(6 * 37_500 + 1);
        let err = h
            .conn
            .timer_update(&mut h.tx, &mut h.timer, &mut h.rng, &mut h.events)
            .unwrap_err();
        assert_eq!(err, StatusCode::ConnectionFailedToEstablish);
    }

    #[test]
    fn slave_latency_skips_events_once_permitted() {
        // Latency 3, and nothing queued anywhere.
        let mut h = Harness::new(Role::Slave, &lldata(30, 3, 100, 1), t(0));

        // NESN=1 from the master permits applying latency.
        h.rx_empty(t(3_000), 0, 1).unwrap();
        assert_eq!(h.conn.conn_event_count.0, 4);
        assert_eq!(h.conn.anchor, t(3_000 + 4 * 37_500));
    }

    #[test]
    fn reserved_llid_is_dropped_without_ack() {
        let mut h = Harness::slave();

        h.rx(t(3_000), header(Llid::Reserved, 0, 0, false, 3), &[1, 2, 3])
            .unwrap();

        // Nothing reaches the host, and our reply does not acknowledge the PDU.
        assert!(!h.host_rx.has_data());
        assert_eq!(h.conn.stats.rx_protocol_errors, 1);
        assert_eq!(h.tx.last().0.nesn(), SeqNum::ZERO);
    }

    #[test]
    fn malformed_control_pdu_is_counted() {
        let mut h = Harness::slave();

        // LL_ENC_REQ needs 22 octets of CtrData; a truncated one cannot be parsed.
        h.rx(t(3_000), header(Llid::Control, 0, 0, false, 1), &[0x03])
            .unwrap();

        assert_eq!(h.conn.stats.rx_protocol_errors, 1);
        assert!(h.staged_opcode().is_none());
        // Acknowledged regardless, so the peer doesn't retransmit it forever.
        assert_eq!(h.tx.last().0.nesn(), SeqNum::ONE);
    }

    #[test]
    fn unanswered_procedure_times_out_despite_traffic() {
        let mut h = Harness::slave();
        h.conn.read_remote_features();

        // The event close starts the feature exchange; the master keeps the link alive with
        // empty PDUs but never answers the request.
        h.rx_empty(t(3_000), 0, 0).unwrap();
        assert_eq!(h.staged_opcode(), Some(ControlOpcode::SlaveFeatureReq));

        // 40 s later the procedure response timeout fires, even though packets keep arriving.
        let err = h.rx_empty(t(41_000_000), 1, 1).unwrap_err();
        assert_eq!(err, StatusCode::LmpResponseTimeout);
    }

    #[test]
    fn encryption_rounds_rearm_the_procedure_timeout() {
        let mut h = Harness::new(Role::Master, &lldata(30, 0, 100, 1), t(0));
        h.conn.start_encryption([0x42; 16], 0, 0);

        // Event 0: first packet goes out, the slave acks, the event close stages LL_ENC_REQ.
        h.timer.0 = t(2_500);
        h.conn
            .timer_update(&mut h.tx, &mut h.timer, &mut h.rng, &mut h.events)
            .unwrap();
        h.rx_empty(t(2_800), 0, 1).unwrap();
        assert_eq!(h.staged_opcode(), Some(ControlOpcode::EncReq));

        // Event 1: the request goes out and the slave responds with LL_ENC_RSP.
        h.timer.0 = t(40_000);
        h.conn
            .timer_update(&mut h.tx, &mut h.timer, &mut h.rng, &mut h.events)
            .unwrap();
        h.rx_control(
            t(40_400),
            1,
            0,
            &ControlPdu::EncRsp {
                skd_s: Hex(1),
                iv_s: Hex(2),
            },
        )
        .unwrap();

        // That response re-armed the 40 s timeout, so traffic past the *original* deadline is
        // still fine...
        h.rx_empty(t(40_010_000), 0, 1).unwrap();

        // ...but the slave never sending LL_START_ENC_REQ eventually is not.
        let err = h.rx_empty(t(40_050_000), 1, 0).unwrap_err();
        assert_eq!(err, StatusCode::LmpResponseTimeout);
    }

    #[test]
    fn event_closes_before_foreign_reservation() {
        let mut h = Harness::slave();

        // Another radio user owns the 4 ms mark. Despite MD and plenty of time until the next
        // anchor, the event must close instead of running into that slot.
        h.conn.set_event_limit(Some(t(4_000)));
        let cmd = h
            .rx(t(3_000), header(Llid::DataCont, 0, 0, true, 0), &[])
            .unwrap();

        assert_eq!(h.conn.conn_event_count.0, 1);
        assert_eq!(h.conn.anchor, t(3_000 + 37_500));
        assert_eq!(cmd.next_update, NextUpdate::At(t(3_000 + 37_500 + 37 + 150)));
    }
}

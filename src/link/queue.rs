//! Queues for data channel PDUs.
//!
//! Data channel PDUs are received and transmitted in time-critical code, so they're sent through
//! queues to be processed at a later time (perhaps in the application's idle loop).
//!
//! Two kinds of queue live here. The splittable SPSC [`PacketQueue`] carries Link-Layer data
//! packets (2-Byte header plus dynamically-sized payload) between the application and the
//! real-time half of the stack. The per-connection [`ControlQueue`] stages outgoing LL Control
//! PDUs, which are not allowed to mix with the data stream: procedure-critical responses must be
//! transmitted before any queued data, and a `LL_TERMINATE_IND` must overtake even those.
//!
//! [`PacketQueue`]: trait.PacketQueue.html
//! [`ControlQueue`]: struct.ControlQueue.html

use {
    crate::{
        bytes::*,
        link::{
            data::{self, Llid},
            llcp::{ControlOpcode, ControlPdu},
            MIN_PAYLOAD_BUF, MIN_PDU_BUF,
        },
        Error,
    },
    byteorder::{ByteOrder, LittleEndian},
    heapless::{
        consts::{U1, U4},
        spsc::{self, MultiCore},
        Vec,
    },
};

/// A splittable SPSC queue for Link-Layer PDUs.
///
/// Must fit at least one packet with `MIN_PDU_BUF` bytes.
pub trait PacketQueue<'a> {
    /// Producing half of the queue.
    type Producer: Producer;

    /// Consuming half of the queue.
    type Consumer: Consumer;

    /// Splits the queue into its producing and consuming ends.
    fn split(&'a mut self) -> (Self::Producer, Self::Consumer);
}

/// The producing (writing) half of a packet queue.
pub trait Producer {
    /// Returns the largest payload size that can be successfully enqueued in the current state.
    ///
    /// This is necessarily a conservative estimate, since the consumer half of the queue might
    /// remove a packet from the queue immediately after this function returns, creating more free
    /// space.
    fn free_space(&mut self) -> u8; // FIXME &self

    /// Enqueues a PDU with known size using a closure.
    ///
    /// This is an object-safe method complemented by its generic counterpart `produce_with`. Only
    /// this method need to be implemented.
    fn produce_dyn(
        &mut self,
        payload_bytes: u8,
        f: &mut dyn FnMut(&mut ByteWriter<'_>) -> Result<Llid, Error>,
    ) -> Result<(), Error>;

    /// Enqueues a PDU with known size using a closure.
    ///
    /// This will check if `payload_bytes` are available in the queue, and bail with `Error::Eof` if
    /// not. If sufficient space is available, a `ByteWriter` with access to that space is
    /// constructed and `f` is called. If `f` returns a successful result, the data is committed to
    /// the queue. If not, the queue is left unchanged.
    fn produce_with<E>(
        &mut self,
        payload_bytes: u8,
        f: impl FnOnce(&mut ByteWriter<'_>) -> Result<Llid, E>,
    ) -> Result<(), E>
    where
        E: From<Error>,
        Self: Sized,
    {
        let mut f = Some(f);
        let mut r = None;
        self.produce_dyn(payload_bytes, &mut |bytes| {
            let f = f.take().unwrap();
            let result = f(bytes);
            if let Ok(llid) = result {
                r = Some(Ok(()));
                Ok(llid)
            } else {
                r = Some(result.map(|_| ()));
                Err(Error::InvalidValue)
            }
        })
        .ok();

        r.unwrap()
    }
}

/// The consuming (reading) half of a packet queue.
pub trait Consumer {
    /// Returns whether there is a packet to dequeue.
    fn has_data(&mut self) -> bool; // FIXME &self

    /// Passes the next raw packet in the queue to a closure.
    ///
    /// The closure returns a `Consume` value to indicate whether the packet should remain in the
    /// queue or be removed.
    fn consume_raw_with<R>(
        &mut self,
        f: impl FnOnce(data::Header, &[u8]) -> Consume<R>,
    ) -> Result<R, Error>;

    /// Passes the next packet in the queue to a closure.
    ///
    /// The closure returns a `Consume` value to indicate whether the packet should remain in the
    /// queue or be removed.
    fn consume_pdu_with<R>(
        &mut self,
        f: impl FnOnce(data::Header, data::Pdu<'_>) -> Consume<R>,
    ) -> Result<R, Error> {
        self.consume_raw_with(|header, raw| {
            let pdu = match data::Pdu::parse(header, raw) {
                Ok(pdu) => pdu,
                Err(e) => return Consume::always(Err(e)),
            };

            f(header, pdu)
        })
    }
}

/// Bundles a `T` along with information telling a queue whether to consume a packet.
#[derive(Debug)]
pub struct Consume<T> {
    consume: bool,
    result: Result<T, Error>,
}

impl<T> Consume<T> {
    /// Consume the currently processed packet iff `consume` is `true`, then return `result`.
    pub fn new(consume: bool, result: Result<T, Error>) -> Self {
        Self { consume, result }
    }

    /// Consume the currently processed packet, then return `result`.
    pub fn always(result: Result<T, Error>) -> Self {
        Self {
            consume: true,
            result,
        }
    }

    /// Do not consume the currently processed packet, then return `result`.
    ///
    /// The next call to the `Consumer::consume_*` methods will yield the same packet again.
    pub fn never(result: Result<T, Error>) -> Self {
        Self {
            consume: false,
            result,
        }
    }

    /// Consume the currently processed packet if `result` indicates success, then return the
    /// result.
    pub fn on_success(result: Result<T, Error>) -> Self {
        Self {
            consume: result.is_ok(),
            result,
        }
    }
}

/// A simple packet queue that can hold a single packet.
///
/// This type is compatible with thumbv6 cores, which lack atomic operations that might be needed
/// for some queue implementations.
pub struct SimpleQueue {
    inner: spsc::Queue<[u8; MIN_PDU_BUF], U1, u8, MultiCore>,
}

impl SimpleQueue {
    /// Creates a new, empty queue.
    pub const fn new() -> Self {
        Self {
            inner: spsc::Queue(heapless::i::Queue::u8()),
        }
    }
}

impl<'a> PacketQueue<'a> for SimpleQueue {
    type Producer = SimpleProducer<'a>;

    type Consumer = SimpleConsumer<'a>;

    fn split(&'a mut self) -> (Self::Producer, Self::Consumer) {
        let (p, c) = self.inner.split();
        (SimpleProducer { inner: p }, SimpleConsumer { inner: c })
    }
}

pub struct SimpleProducer<'a> {
    inner: spsc::Producer<'a, [u8; MIN_PDU_BUF], U1, u8, MultiCore>,
}

impl<'a> Producer for SimpleProducer<'a> {
    fn free_space(&mut self) -> u8 {
        if self.inner.ready() {
            MIN_PAYLOAD_BUF as u8
        } else {
            0
        }
    }

    fn produce_dyn(
        &mut self,
        payload_bytes: u8,
        f: &mut dyn FnMut(&mut ByteWriter<'_>) -> Result<Llid, Error>,
    ) -> Result<(), Error> {
        assert!(usize::from(payload_bytes) < MIN_PAYLOAD_BUF);

        if !self.inner.ready() {
            return Err(Error::Eof);
        }

        let mut buf = [0; MIN_PDU_BUF];
        let mut writer = ByteWriter::new(&mut buf[2..]);
        let free = writer.space_left();
        let llid = f(&mut writer)?;
        let used = free - writer.space_left();

        let mut header = data::Header::new(llid);
        header.set_payload_length(used as u8);
        LittleEndian::write_u16(&mut buf, header.to_u16());

        self.inner.enqueue(buf).map_err(|_| ()).unwrap();
        Ok(())
    }
}

pub struct SimpleConsumer<'a> {
    inner: spsc::Consumer<'a, [u8; MIN_PDU_BUF], U1, u8, MultiCore>,
}

impl<'a> Consumer for SimpleConsumer<'a> {
    fn has_data(&mut self) -> bool {
        self.inner.ready()
    }

    fn consume_raw_with<R>(
        &mut self,
        f: impl FnOnce(data::Header, &[u8]) -> Consume<R>,
    ) -> Result<R, Error> {
        if let Some(packet) = self.inner.peek() {
            let mut bytes = ByteReader::new(packet);
            let raw_header: [u8; 2] = bytes.read_array().unwrap();
            let header = data::Header::parse(&raw_header);
            let pl_len = usize::from(header.payload_length());
            let raw_payload = bytes.read_slice(pl_len)?;

            let res = f(header, raw_payload);
            if res.consume {
                self.inner.dequeue().unwrap(); // can't fail
            }
            res.result
        } else {
            Err(Error::Eof)
        }
    }
}

/// Encoded size of the largest LL Control PDU (opcode plus 23 Bytes of `CtrData`).
pub const CTRL_PDU_BUF: usize = 24;

/// An encoded LL Control PDU waiting for transmission.
struct ControlEntry {
    buf: [u8; CTRL_PDU_BUF],
    len: u8,
}

impl ControlEntry {
    fn bytes(&self) -> &[u8] {
        &self.buf[..usize::from(self.len)]
    }
}

/// Stages outgoing LL Control PDUs for a connection.
///
/// Control PDUs always take precedence over queued data. Within the control stream itself,
/// *queue-critical* PDUs (procedure teardown and encryption transition responses, see
/// [`ControlOpcode::is_queue_critical`]) overtake already staged entries, because the PDUs behind
/// them may only be valid once the transition has completed.
///
/// PDUs stay at the front of the queue until explicitly popped, so a PDU that wasn't acknowledged
/// is simply offered again at the next transmission opportunity.
///
/// [`ControlOpcode::is_queue_critical`]: ../llcp/enum.ControlOpcode.html#method.is_queue_critical
pub struct ControlQueue {
    entries: Vec<ControlEntry, U4>,
}

impl ControlQueue {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Encodes `pdu` and stages it for transmission.
    ///
    /// Returns `Error::Exhausted` when all slots are taken. Callers must only stage a bounded
    /// number of PDUs per procedure, so running out of slots indicates a stack bug or a
    /// misbehaving peer and the connection should be torn down.
    pub fn stage(&mut self, pdu: &ControlPdu<'_>) -> Result<(), Error> {
        let mut entry = ControlEntry {
            buf: [0; CTRL_PDU_BUF],
            len: 0,
        };
        let mut writer = ByteWriter::new(&mut entry.buf);
        pdu.to_bytes(&mut writer)?;
        entry.len = (CTRL_PDU_BUF - writer.space_left()) as u8;

        let critical = pdu.opcode().is_queue_critical();
        if self.entries.push(entry).is_err() {
            return Err(Error::Exhausted);
        }
        if critical {
            self.entries.rotate_right(1);
        }
        Ok(())
    }

    /// Returns the encoded PDU to transmit next, without removing it.
    pub fn peek(&self) -> Option<&[u8]> {
        self.entries.first().map(|entry| entry.bytes())
    }

    /// Removes the first staged PDU carrying `opcode`.
    ///
    /// Called when the PDU was acknowledged by the peer, or when the procedure it belongs to is
    /// abandoned before it was ever transmitted. Matching by opcode instead of popping the front
    /// keeps this correct even when a critical PDU was rotated ahead of the one in flight.
    /// Returns whether an entry was removed.
    pub fn remove_first(&mut self, opcode: ControlOpcode) -> bool {
        match self
            .entries
            .iter()
            .position(|entry| entry.buf[0] == u8::from(opcode))
        {
            Some(i) => {
                self.entries[i..].rotate_left(1);
                self.entries.pop();
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discards all staged PDUs.
    ///
    /// Used during connection teardown, where only the terminate indication may remain in
    /// flight.
    pub fn clear(&mut self) {
        while self.entries.pop().is_some() {}
    }
}

impl Default for ControlQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{host::StatusCode, link::llcp::ControlOpcode};

    fn staged_opcode(queue: &ControlQueue) -> Option<ControlOpcode> {
        queue.peek().map(|bytes| ControlOpcode::from(bytes[0]))
    }

    #[test]
    fn produce_then_consume() {
        let mut queue = SimpleQueue::new();
        let (mut producer, mut consumer) = queue.split();

        assert!(!consumer.has_data());
        producer
            .produce_with(3, |writer| -> Result<_, Error> {
                writer.write_slice(&[1, 2, 3])?;
                Ok(Llid::DataStart)
            })
            .unwrap();

        assert!(consumer.has_data());
        consumer
            .consume_raw_with(|header, raw| {
                assert_eq!(header.llid(), Llid::DataStart);
                assert_eq!(raw, &[1, 2, 3]);
                Consume::always(Ok(()))
            })
            .unwrap();
        assert!(!consumer.has_data());
    }

    #[test]
    fn unconsumed_packet_is_offered_again() {
        let mut queue = SimpleQueue::new();
        let (mut producer, mut consumer) = queue.split();
        producer
            .produce_with(1, |writer| -> Result<_, Error> {
                writer.write_u8(0xab)?;
                Ok(Llid::DataCont)
            })
            .unwrap();

        consumer
            .consume_raw_with(|_, _| Consume::never(Ok(())))
            .unwrap();
        consumer
            .consume_raw_with(|_, raw| {
                assert_eq!(raw, &[0xab]);
                Consume::always(Ok(()))
            })
            .unwrap();
    }

    #[test]
    fn control_queue_is_fifo_for_regular_pdus() {
        let mut queue = ControlQueue::new();
        queue.stage(&ControlPdu::PingRsp).unwrap();
        queue
            .stage(&ControlPdu::UnknownRsp {
                unknown_type: ControlOpcode::Unknown(0x42),
            })
            .unwrap();

        assert_eq!(staged_opcode(&queue), Some(ControlOpcode::PingRsp));
        assert!(queue.remove_first(ControlOpcode::PingRsp));
        assert_eq!(staged_opcode(&queue), Some(ControlOpcode::UnknownRsp));
        assert!(queue.remove_first(ControlOpcode::UnknownRsp));
        assert!(queue.is_empty());
        assert!(!queue.remove_first(ControlOpcode::UnknownRsp));
    }

    #[test]
    fn critical_pdus_overtake_staged_entries() {
        let mut queue = ControlQueue::new();
        queue.stage(&ControlPdu::PingRsp).unwrap();
        queue
            .stage(&ControlPdu::TerminateInd {
                error_code: StatusCode::RemoteUserTerminatedConnection,
            })
            .unwrap();

        assert_eq!(staged_opcode(&queue), Some(ControlOpcode::TerminateInd));
        assert!(queue.remove_first(ControlOpcode::TerminateInd));
        assert_eq!(staged_opcode(&queue), Some(ControlOpcode::PingRsp));
    }

    #[test]
    fn unacked_pdu_stays_at_the_front() {
        let mut queue = ControlQueue::new();
        queue.stage(&ControlPdu::PingReq).unwrap();
        assert_eq!(staged_opcode(&queue), Some(ControlOpcode::PingReq));
        assert_eq!(staged_opcode(&queue), Some(ControlOpcode::PingReq));
    }
}

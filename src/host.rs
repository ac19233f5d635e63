//! Upward event surface towards the host.
//!
//! The controller reports connection lifecycle and procedure completions to the host as a stream
//! of fixed-shape events. HCI wire marshalling is out of scope here; a transport layer can turn
//! these records into HCI event packets without further controller involvement.
//!
//! Events are filtered by an [`EventMask`] *before* they enter the queue, so a masked event class
//! never consumes queue space.

use crate::{
    link::{comp_id::CompanyId, llcp::VersionNumber, ConnHandle, FeatureSet},
    time::Duration,
    utils::Hex,
};
use bitflags::bitflags;
use heapless::{
    consts::U8,
    spsc::{self, MultiCore},
};

enum_with_unknown! {
    /// Controller status and error codes, shared by disconnect reasons, reject indications and
    /// completion events.
    ///
    /// The values match the codes defined by the Bluetooth specification.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum StatusCode(u8) {
        Success = 0x00,
        UnknownConnectionId = 0x02,
        AuthenticationFailure = 0x05,
        PinOrKeyMissing = 0x06,
        MemoryCapacityExceeded = 0x07,
        ConnectionTimeout = 0x08,
        ConnectionLimitExceeded = 0x09,
        RemoteUserTerminatedConnection = 0x13,
        RemoteLowResources = 0x14,
        RemotePowerOff = 0x15,
        ConnectionTerminatedByLocalHost = 0x16,
        UnsupportedRemoteFeature = 0x1A,
        LmpResponseTimeout = 0x22,
        LmpCollision = 0x23,
        InstantPassed = 0x28,
        UnacceptableConnectionParameters = 0x3B,
        MicFailure = 0x3D,
        ConnectionFailedToEstablish = 0x3E,
    }
}

/// The role this device plays in a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// Central: initiated the connection and arbitrates its timing.
    Master,
    /// Peripheral: was advertising and accepted the connection.
    Slave,
}

/// An event reported to the host.
#[derive(Debug, Copy, Clone)]
pub enum Event {
    /// A connection was established (or establishment failed).
    ConnectionComplete {
        status: StatusCode,
        handle: ConnHandle,
        role: Role,
        interval: Duration,
        latency: u16,
        supervision_timeout: Duration,
    },

    /// A connection ended.
    DisconnectionComplete {
        handle: ConnHandle,
        reason: StatusCode,
    },

    /// A connection update procedure completed (successfully or not).
    ConnectionUpdateComplete {
        status: StatusCode,
        handle: ConnHandle,
        interval: Duration,
        latency: u16,
        supervision_timeout: Duration,
    },

    /// Link encryption was switched on or off, or an encryption start failed.
    EncryptionChange {
        status: StatusCode,
        handle: ConnHandle,
        enabled: bool,
    },

    /// The remote version information was obtained.
    ReadRemoteVersionComplete {
        status: StatusCode,
        handle: ConnHandle,
        version: VersionNumber,
        comp_id: CompanyId,
        sub_vers_nr: Hex<u16>,
    },

    /// The remote feature set was obtained.
    ReadRemoteFeaturesComplete {
        status: StatusCode,
        handle: ConnHandle,
        features: FeatureSet,
    },

    /// The peer started an encryption procedure; the host must supply the Long-Term Key (or a
    /// negative reply).
    LongTermKeyRequest {
        handle: ConnHandle,
        rand: Hex<u64>,
        ediv: u16,
    },

    /// Outgoing data PDUs were acknowledged by the peer.
    NumberOfCompletedPackets { handle: ConnHandle, completed: u8 },
}

bitflags! {
    /// Selects which classes of [`Event`] are reported to the host.
    pub struct EventMask: u32 {
        const CONNECTION_COMPLETE = 1 << 0;
        const DISCONNECTION_COMPLETE = 1 << 1;
        const CONNECTION_UPDATE_COMPLETE = 1 << 2;
        const ENCRYPTION_CHANGE = 1 << 3;
        const READ_REMOTE_VERSION_COMPLETE = 1 << 4;
        const READ_REMOTE_FEATURES_COMPLETE = 1 << 5;
        const LONG_TERM_KEY_REQUEST = 1 << 6;
        const NUMBER_OF_COMPLETED_PACKETS = 1 << 7;
    }
}

impl EventMask {
    /// Returns the mask bit corresponding to `event`'s class.
    fn bit_for(event: &Event) -> EventMask {
        match event {
            Event::ConnectionComplete { .. } => EventMask::CONNECTION_COMPLETE,
            Event::DisconnectionComplete { .. } => EventMask::DISCONNECTION_COMPLETE,
            Event::ConnectionUpdateComplete { .. } => EventMask::CONNECTION_UPDATE_COMPLETE,
            Event::EncryptionChange { .. } => EventMask::ENCRYPTION_CHANGE,
            Event::ReadRemoteVersionComplete { .. } => EventMask::READ_REMOTE_VERSION_COMPLETE,
            Event::ReadRemoteFeaturesComplete { .. } => EventMask::READ_REMOTE_FEATURES_COMPLETE,
            Event::LongTermKeyRequest { .. } => EventMask::LONG_TERM_KEY_REQUEST,
            Event::NumberOfCompletedPackets { .. } => EventMask::NUMBER_OF_COMPLETED_PACKETS,
        }
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::all()
    }
}

/// A bounded queue of host events with an attached [`EventMask`].
///
/// Masked events are discarded on emission. When the queue overflows, the oldest event is dropped
/// in favor of the new one, since newer lifecycle events (such as a disconnection) supersede older
/// ones.
pub struct EventQueue {
    queue: spsc::Queue<Event, U8, u8, MultiCore>,
    mask: EventMask,
}

impl EventQueue {
    /// Creates an empty event queue reporting all event classes.
    pub fn new() -> Self {
        Self {
            queue: spsc::Queue(heapless::i::Queue::u8()),
            mask: EventMask::default(),
        }
    }

    /// Replaces the event mask.
    pub fn set_mask(&mut self, mask: EventMask) {
        self.mask = mask;
    }

    /// Emits `event` into the queue, unless its class is masked.
    pub fn emit(&mut self, event: Event) {
        if !self.mask.contains(EventMask::bit_for(&event)) {
            return;
        }

        if self.queue.enqueue(event).is_err() {
            self.queue.dequeue();
            // Cannot fail, we just made room.
            let _ = self.queue.enqueue(event);
        }
    }

    /// Takes the oldest pending event out of the queue.
    pub fn next_event(&mut self) -> Option<Event> {
        self.queue.dequeue()
    }

    /// Returns whether any events are waiting to be collected.
    pub fn has_events(&self) -> bool {
        self.queue.len() != 0
    }

    /// Discards all pending events.
    pub fn clear(&mut self) {
        while self.queue.dequeue().is_some() {}
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

//! Stack configuration trait.

use crate::{
    link::{
        queue::{Consumer, Producer},
        Transmitter,
    },
    time::Timer,
};
use rand_core::RngCore;

// TODO: Use associated type defaults in the trait once stable

/// Trait for Shale stack configurations.
///
/// This trait defines a number of types to be used throughout the layers of the controller, which
/// define capabilities, data structures, and hardware interface types.
///
/// Every application must define a type implementing this trait and supply it to the stack.
pub trait Config {
    /// A timesource with microsecond resolution.
    type Timer: Timer;

    /// The BLE packet transmitter (radio).
    type Transmitter: Transmitter;

    /// Random number generator used for access address and hop increment generation when
    /// initiating connections.
    type Rng: RngCore;

    /// AES-128 block encryption used to derive the session key during the encryption start
    /// procedure.
    type Cipher: Cipher;

    /// Producing half of the packet queue for received (radio to host) traffic.
    type PacketProducer: Producer;

    /// Consuming half of the packet queue for outgoing (host to radio) traffic.
    type PacketConsumer: Consumer;
}

/// Synchronous AES-128 ECB block encryption.
///
/// Platforms usually provide this via a hardware AES cell; a software implementation works just as
/// well for testing. The Link Layer only ever calls this from task context.
pub trait Cipher {
    /// Encrypts `block` in place with `key`.
    ///
    /// Both the key and the block are in the byte order used by the Bluetooth encryption
    /// procedures (most significant octet first).
    fn encrypt_block(&mut self, key: &[u8; 16], block: &mut [u8; 16]);
}

//! 48-bit Bluetooth device addresses.

use core::fmt;

/// The address space a device address belongs to.
///
/// This is not part of the 48 address bits; it travels in the `TxAdd`/`RxAdd` bits of the
/// advertising channel PDU header instead.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressKind {
    /// An IEEE-registered MAC address of the device.
    Public,

    /// An address generated by the device itself.
    Random,
}

/// A device address and the address space it lives in.
///
/// A public and a random address consisting of the same bits are *different* addresses, so all
/// comparisons include the kind.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    bytes: [u8; 6],
    kind: AddressKind,
}

impl DeviceAddress {
    /// Creates a device address from raw bytes in over-the-air order (least-significant byte
    /// first).
    pub fn new(bytes: [u8; 6], kind: AddressKind) -> Self {
        DeviceAddress { bytes, kind }
    }

    /// Returns the address kind.
    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    /// Returns whether this is a randomly generated address.
    pub fn is_random(&self) -> bool {
        self.kind == AddressKind::Random
    }

    /// Returns the address bytes in over-the-air order.
    pub fn raw(&self) -> &[u8; 6] {
        &self.bytes
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Addresses are conventionally written most-significant byte first.
        let b = &self.bytes;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X} ({:?})",
            b[5], b[4], b[3], b[2], b[1], b[0], self.kind
        )
    }
}

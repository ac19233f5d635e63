//! Bluetooth SIG company identifiers.

use core::fmt;

/// A 16-bit company identifier as assigned by the Bluetooth SIG.
///
/// Exchanged in `LL_VERSION_IND` PDUs. The value `0xFFFF` is reserved for testing and used by
/// devices without an assigned identifier.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct CompanyId(u16);

impl CompanyId {
    /// The reserved identifier for prototypes and testing.
    pub const TESTING: Self = CompanyId(0xFFFF);

    /// Creates a `CompanyId` from its raw 16-bit representation.
    pub fn from_raw(raw: u16) -> Self {
        CompanyId(raw)
    }

    /// Returns the raw 16-bit value.
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Debug for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompanyId({:#06x})", self.0)
    }
}

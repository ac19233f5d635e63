//! Data channel map and the per-event channel selection algorithm.

use crate::phy::DataChannel;
use core::fmt;

/// A map marking data channels as used or unused.
///
/// A channel map must mark at least 2 channels as used.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    raw: [u8; 5],
    num_used_channels: u8,
}

impl ChannelMap {
    /// Create a new channel map from the raw format used in Connection Request PDUs (`ChM`).
    ///
    /// The first byte (LSB) contains flags for data channels 0 to 7, where the least significant
    /// bit is the flag for channel 0, and so on.
    ///
    /// Since there are only 37 data channels, but 40 bits in the 5 Bytes, the 3 most significant
    /// bits in the last Byte of `raw` are considered reserved for future use (RFU) and are ignored
    /// by this function.
    pub fn from_raw(mut raw: [u8; 5]) -> Self {
        raw[4] &= 0b11111; // clear RFU bits
        Self {
            raw,
            num_used_channels: raw.iter().map(|b| b.count_ones() as u8).sum(),
        }
    }

    /// Returns the raw bytes encoding this channel map.
    pub fn to_raw(&self) -> [u8; 5] {
        self.raw
    }

    /// Creates a new channel map that marks all data channels as used.
    pub fn with_all_channels() -> Self {
        Self {
            raw: [0xff, 0xff, 0xff, 0xff, 0b11111],
            num_used_channels: 37,
        }
    }

    /// Returns the number of data channels marked as used by this map.
    pub fn num_used_channels(&self) -> u8 {
        self.num_used_channels
    }

    /// Returns whether the given data channel is marked as used.
    pub fn is_used(&self, channel: DataChannel) -> bool {
        let byte = self.raw[channel.index() as usize / 8];
        let bitnum = channel.index() % 8;
        let mask = 1 << bitnum;

        byte & mask != 0
    }

    /// Returns an iterator over all data channels marked as used in this map.
    pub fn iter_used<'a>(&'a self) -> impl Iterator<Item = DataChannel> + 'a {
        self.raw
            .iter()
            .enumerate()
            .flat_map(move |(byteindex, byte)| {
                (0..8).filter_map(move |bitindex| {
                    if byte & (1 << bitindex) != 0 {
                        Some(DataChannel::new(byteindex as u8 * 8 + bitindex))
                    } else {
                        None
                    }
                })
            })
    }

    /// Returns the `n`th channel marked as used.
    ///
    /// # Panics
    ///
    /// This will panic when `n >= self.num_used_channels()`.
    pub fn by_index(&self, n: u8) -> DataChannel {
        self.iter_used()
            .nth(n.into())
            .expect("by_index: index out of bounds")
    }
}

impl fmt::Display for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.raw[..4] {
            write!(f, "{:08b}", b.reverse_bits())?;
        }
        write!(f, "{:05b}", self.raw[4].reverse_bits() >> 3)?;
        Ok(())
    }
}

impl fmt::Debug for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self, self.raw)
    }
}

/// Per-connection channel selection state (channel selection algorithm #1).
///
/// Before every connection event, the unmapped channel advances by the connection's hop increment
/// modulo 37. If the resulting channel is marked as used in the channel map, it is used directly;
/// otherwise it is remapped onto the `n`th used channel, with `n` the unmapped index modulo the
/// number of used channels.
///
/// The selected sequence is a pure function of (channel map, hop increment, last unmapped
/// channel), so both peers stay in lockstep without any communication.
#[derive(Copy, Clone, Debug)]
pub struct ChannelSelection {
    /// `lastUnmappedChannel`: unmapped channel used for the previous event.
    unmapped: DataChannel,

    /// Number of (unmapped) channels to hop between each connection event (5..=16).
    hop: u8,
}

impl ChannelSelection {
    /// Creates channel selection state for a new connection.
    ///
    /// The first call to [`ChannelSelection::next`] returns the channel of the connection's first
    /// event (`0 + hop`, remapped if necessary), as required for the event following `CONNECT_REQ`.
    pub fn new(hop: u8) -> Self {
        debug_assert!((5..=16).contains(&hop));
        Self {
            unmapped: DataChannel::new(0),
            hop,
        }
    }

    /// Returns the hop increment.
    pub fn hop(&self) -> u8 {
        self.hop
    }

    /// Advances to and returns the data channel for the next connection event.
    pub fn next(&mut self, map: &ChannelMap) -> DataChannel {
        let unmapped = DataChannel::new((self.unmapped.index() + self.hop) % 37);
        self.unmapped = unmapped;

        if map.is_used(unmapped) {
            unmapped
        } else {
            let remapping_index = unmapped.index() % map.num_used_channels();
            map.by_index(remapping_index)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_channel() {
        // Channel map where only channel 0 is used.
        // Not valid, since only 1 channel in the map. Still useful for testing.
        let map = ChannelMap::from_raw([0x01, 0, 0, 0, 0]);
        assert_eq!(map.num_used_channels(), 1);
        assert!(map.is_used(DataChannel::new(0)));
        assert!(!map.is_used(DataChannel::new(1)));
        assert!(!map.is_used(DataChannel::new(2)));
        assert!(!map.is_used(DataChannel::new(7)));
        assert!(!map.is_used(DataChannel::new(8)));
        assert!(!map.is_used(DataChannel::new(36)));
        assert_eq!(map.by_index(0), DataChannel::new(0));
        assert!(map.iter_used().eq(vec![DataChannel::new(0)]));
    }

    #[test]
    fn from_raw() {
        let map = ChannelMap::from_raw([0xff; 5]);
        assert_eq!(map.num_used_channels(), 37);
        assert_eq!(map, ChannelMap::with_all_channels());
    }

    #[test]
    fn all_channels() {
        let map = ChannelMap::with_all_channels();
        for ch in 0..=36 {
            assert!(map.is_used(DataChannel::new(ch)));
        }
    }

    #[test]
    fn hop_sequence_full_map() {
        let map = ChannelMap::with_all_channels();
        let mut sel = ChannelSelection::new(7);
        let seq: Vec<u8> = (0..6).map(|_| sel.next(&map).index()).collect();
        assert_eq!(seq, vec![7, 14, 21, 28, 35, 5]);
    }

    #[test]
    fn remapping_walks_used_channels() {
        // Only channels 0..=7 used; an unmapped hop landing on 9 must remap
        // onto used channel index 9 % 8 = 1.
        let map = ChannelMap::from_raw([0xff, 0, 0, 0, 0]);
        let mut sel = ChannelSelection::new(9);
        assert_eq!(sel.next(&map).index(), 1);
    }

    #[test]
    fn selection_is_deterministic() {
        let map = ChannelMap::from_raw([0xf0, 0x0f, 0xaa, 0x55, 0b10101]);
        let mut a = ChannelSelection::new(11);
        let mut b = ChannelSelection::new(11);
        for _ in 0..100 {
            assert_eq!(a.next(&map).index(), b.next(&map).index());
        }
    }
}

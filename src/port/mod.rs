use crate::packet::Packet;

mod af_packet;
mod memory;

pub use af_packet::{AfPacketPort, PortError, wait_for_link};
pub use memory::{MemoryPort, Transmitted};

/// What one `send_burst` call did with the packets it was given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOutcome {
    /// Leading packets handed to the device.
    pub sent: usize,
    /// The packet right after the sent prefix was refused for good and will
    /// never leave (oversized, interface gone).
    pub rejected: bool,
}

impl SendOutcome {
    pub fn sent(sent: usize) -> Self {
        Self {
            sent,
            rejected: false,
        }
    }

    pub fn rejected_after(sent: usize) -> Self {
        Self {
            sent,
            rejected: true,
        }
    }

    /// Packets the caller no longer holds: sent ones plus a refused one.
    pub fn consumed(&self) -> usize {
        self.sent + usize::from(self.rejected)
    }
}

/// A physical port as the pipeline sees it.
///
/// Both calls are non-blocking. A port is shared by exactly two stages: the
/// ingress stage receives from it and the egress stage transmits on it.
pub trait Port: Send + Sync {
    fn name(&self) -> &str;

    /// Append up to `max` captured frames to `out`; returns how many.
    fn receive_burst(&self, out: &mut Vec<Packet>, max: usize) -> usize;

    /// Transmit a prefix of `packets`. Stops at the first packet the device
    /// cannot take right now, or at the first one it refuses for good.
    fn send_burst(&self, packets: &[Packet]) -> SendOutcome;

    /// Frames dropped at capture because no buffer was available.
    fn rx_no_buffer(&self) -> u64 {
        0
    }

    /// Frames dropped at capture because they did not fit a receive buffer.
    fn rx_truncated(&self) -> u64 {
        0
    }
}

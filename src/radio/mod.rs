//! Radio hardware abstraction
//!
//! The core consumes the transceiver through the [`Radio`] capability set and
//! never touches PHY details. Both operations are time-bounded: `send` either
//! hands the frame off or reports the transmitter busy, and `receive` waits
//! at most `timeout_ms` (0 polls without waiting) and returns 0 on timeout.
//!
//! Two concrete variants ship with the crate: [`UdpRadio`], which moves
//! frames as local datagrams and stands in for a real concentrator during
//! integration and bench testing, and [`LoopbackRadio`], an in-memory queue
//! pair for unit tests.

pub mod loopback;
pub mod udp;

pub use loopback::LoopbackRadio;
pub use udp::UdpRadio;

use crate::config::Region;
use crate::error::GatewayError;
use crate::lorawan::MAX_FRAME_LEN;

pub trait Radio: Send {
    /// Bring the transceiver up on a regional frequency plan.
    fn init(&mut self, region: Region) -> Result<(), GatewayError>;

    fn set_datarate(&mut self, datarate: u8) -> Result<(), GatewayError>;

    fn set_tx_power(&mut self, dbm: u8) -> Result<(), GatewayError>;

    /// Hand one frame to the transmitter. `RadioBusy` when the single
    /// transmitter is occupied; the caller retries on its next tick.
    fn send(&mut self, bytes: &[u8]) -> Result<(), GatewayError>;

    /// Wait up to `timeout_ms` for one frame. Returns the number of bytes
    /// written into `buf`, 0 on timeout. `buf` should hold
    /// [`MAX_FRAME_LEN`] bytes; longer frames are truncated by the PHY.
    fn receive(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize, GatewayError>;
}

/// Receive buffer sized for the largest radio frame.
pub fn rx_buffer() -> [u8; MAX_FRAME_LEN] {
    [0u8; MAX_FRAME_LEN]
}

//! Datagram-backed radio
//!
//! Frames travel as UDP datagrams between gateways on a shared segment, one
//! datagram per PHY frame. This is the simulation-grade transceiver used for
//! paired-gateway benches and integration tests; a concentrator HAL slots in
//! behind the same trait on real hardware.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Region;
use crate::error::GatewayError;
use crate::lorawan::MAX_FRAME_LEN;
use crate::radio::Radio;

pub struct UdpRadio {
    socket: UdpSocket,
    peer: SocketAddr,
    datarate: u8,
    tx_power: u8,
}

impl UdpRadio {
    pub fn bind(bind: &str, peer: &str) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind)
            .map_err(|e| anyhow::anyhow!("radio bind {} failed: {}", bind, e))?;
        let peer: SocketAddr = peer
            .parse()
            .map_err(|e| anyhow::anyhow!("radio peer address {} invalid: {}", peer, e))?;
        Ok(Self { socket, peer, datarate: 0, tx_power: 0 })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

impl Radio for UdpRadio {
    fn init(&mut self, region: Region) -> Result<(), GatewayError> {
        info!(%region, peer = %self.peer, "radio up");
        Ok(())
    }

    fn set_datarate(&mut self, datarate: u8) -> Result<(), GatewayError> {
        self.datarate = datarate;
        debug!(datarate, "datarate set");
        Ok(())
    }

    fn set_tx_power(&mut self, dbm: u8) -> Result<(), GatewayError> {
        self.tx_power = dbm;
        debug!(dbm, "tx power set");
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), GatewayError> {
        match self.socket.send_to(bytes, self.peer) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(GatewayError::RadioBusy),
            Err(e) => {
                warn!("radio send failed: {}", e);
                Err(GatewayError::RadioBusy)
            }
        }
    }

    fn receive(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize, GatewayError> {
        if timeout_ms == 0 {
            self.socket.set_nonblocking(true).map_err(|_| GatewayError::RadioTimeout)?;
        } else {
            self.socket.set_nonblocking(false).map_err(|_| GatewayError::RadioTimeout)?;
            self.socket
                .set_read_timeout(Some(Duration::from_millis(timeout_ms)))
                .map_err(|_| GatewayError::RadioTimeout)?;
        }

        match self.socket.recv_from(buf) {
            Ok((len, _src)) => Ok(len.min(MAX_FRAME_LEN)),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(0)
            }
            Err(e) => {
                warn!("radio receive failed: {}", e);
                Err(GatewayError::RadioTimeout)
            }
        }
    }
}

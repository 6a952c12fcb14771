//! In-memory radio for unit tests
//!
//! Frames injected with [`LoopbackRadio::inject`] appear on `receive`;
//! everything sent is captured for inspection. A `busy` latch simulates the
//! single-transmitter contract.

use std::collections::VecDeque;

use crate::config::Region;
use crate::error::GatewayError;
use crate::radio::Radio;

#[derive(Debug, Default)]
pub struct LoopbackRadio {
    rx_queue: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    pub busy: bool,
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame for the next `receive` call.
    pub fn inject(&mut self, frame: Vec<u8>) {
        self.rx_queue.push_back(frame);
    }

    /// Frames handed to the transmitter, oldest first.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent)
    }
}

impl Radio for LoopbackRadio {
    fn init(&mut self, _region: Region) -> Result<(), GatewayError> {
        Ok(())
    }

    fn set_datarate(&mut self, _datarate: u8) -> Result<(), GatewayError> {
        Ok(())
    }

    fn set_tx_power(&mut self, _dbm: u8) -> Result<(), GatewayError> {
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), GatewayError> {
        if self.busy {
            return Err(GatewayError::RadioBusy);
        }
        self.sent.push(bytes.to_vec());
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], _timeout_ms: u64) -> Result<usize, GatewayError> {
        match self.rx_queue.pop_front() {
            Some(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(len)
            }
            None => Ok(0),
        }
    }
}

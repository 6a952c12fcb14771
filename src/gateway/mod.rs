//! Gateway supervisor
//!
//! One owned value holds the whole core: MAC engine, routing table, radio,
//! and the telemetry collaborators. The supervisor's tick does a bounded
//! amount of work — drain a few radio frames, drive MAC deadlines, emit at
//! most one scheduled uplink, age the mesh table, and drain downlinks the
//! cloud bridge fetched — and never blocks beyond the radio's receive
//! budget. HTTP lives in the bridge task on the far side of two bounded
//! channels.

use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{GatewayConfig, RadioConfig, Region};
use crate::error::{DropLog, GatewayError};
use crate::mac::{MacEngine, RxOutcome, TickAction};
use crate::mesh::RoutingTable;
use crate::radio::{self, Radio};
use crate::telemetry::{ActuatorSink, IrrigationCommand, SensorSource, IRRIGATION_PORT, SENSOR_PORT};

/// Frames drained from the radio in one tick.
const MAX_RX_PER_TICK: usize = 8;
/// Bridge downlinks re-entered per tick.
const MAX_DOWNLINKS_PER_TICK: usize = 4;
/// Minimum floor between drop-log lines per error kind.
const DROP_LOG_INTERVAL_MS: u64 = 5_000;
/// Idle yield between ticks in the run loop.
const TICK_IDLE_MS: u64 = 10;

#[derive(Debug, Clone)]
pub struct SupervisorOpts {
    pub region: Region,
    pub datarate: u8,
    pub tx_power: u8,
    pub tx_interval_ms: u64,
    pub rx_budget_ms: u64,
    pub confirmed_uplinks: bool,
    /// Wait before re-attempting activation after a failed join.
    pub join_backoff_ms: u64,
}

impl SupervisorOpts {
    pub fn from_config(gateway: &GatewayConfig, radio: &RadioConfig) -> Self {
        Self {
            region: gateway.region,
            datarate: gateway.datarate(),
            tx_power: gateway.tx_power(),
            tx_interval_ms: gateway.tx_interval_ms,
            // The receive wait is the tick's only suspension point; cap it.
            rx_budget_ms: radio.rx_budget_ms.unwrap_or(100).min(1_000),
            confirmed_uplinks: gateway.retries > 0,
            join_backoff_ms: gateway.join_timeout_ms.max(1) * 3,
        }
    }
}

/// Channel pair connecting the supervisor to the cloud bridge task.
pub struct CloudChannels {
    pub uplink_tx: mpsc::Sender<Vec<u8>>,
    pub downlink_rx: mpsc::Receiver<Vec<u8>>,
}

pub struct Gateway<R: Radio> {
    radio: R,
    mac: MacEngine,
    mesh: RoutingTable,
    sensors: Box<dyn SensorSource>,
    actuator: Box<dyn ActuatorSink>,
    cloud: Option<CloudChannels>,
    opts: SupervisorOpts,
    drop_log: DropLog,
    epoch: Instant,
    last_tx_ms: u64,
    /// Uplink deferred by a busy transmitter, retried next tick.
    pending_tx: Option<(Vec<u8>, bool)>,
    /// When to re-enter activation after a JoinFailed.
    rejoin_at_ms: Option<u64>,
}

impl<R: Radio> Gateway<R> {
    pub fn new(
        radio: R,
        mac: MacEngine,
        opts: SupervisorOpts,
        sensors: Box<dyn SensorSource>,
        actuator: Box<dyn ActuatorSink>,
        cloud: Option<CloudChannels>,
    ) -> Self {
        Self {
            radio,
            mac,
            mesh: RoutingTable::new(),
            sensors,
            actuator,
            cloud,
            opts,
            drop_log: DropLog::new(DROP_LOG_INTERVAL_MS),
            epoch: Instant::now(),
            last_tx_ms: 0,
            pending_tx: None,
            rejoin_at_ms: None,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Bring the radio up and start activation.
    pub fn init(&mut self) -> Result<(), GatewayError> {
        self.radio.init(self.opts.region)?;
        self.radio.set_datarate(self.opts.datarate)?;
        self.radio.set_tx_power(self.opts.tx_power)?;

        let now = self.now_ms();
        if let Some(join_request) = self.mac.activate(now)? {
            if let Err(e) = self.radio.send(&join_request) {
                // The join deadline in the MAC engine retransmits later.
                warn!("join request hand-off failed: {}", e);
            }
        }
        info!(region = %self.opts.region, "gateway initialized");
        Ok(())
    }

    /// One supervisor pass. Bounded work, no blocking beyond the radio's
    /// receive budget.
    pub fn tick(&mut self) {
        // 1. Drain the radio, spending the wait budget on the first read only.
        let mut wait_ms = self.opts.rx_budget_ms;
        for _ in 0..MAX_RX_PER_TICK {
            let mut buf = radio::rx_buffer();
            let len = match self.radio.receive(&mut buf, wait_ms) {
                Ok(len) => len,
                Err(e) => {
                    warn!("radio receive error: {}", e);
                    break;
                }
            };
            wait_ms = 0;
            if len == 0 {
                break;
            }
            let now = self.now_ms();
            self.process_rx(&buf[..len], now);
        }

        let now = self.now_ms();

        // 2. MAC deadlines: join retries and confirmed-uplink retransmissions.
        for action in self.mac.tick(now) {
            match action {
                TickAction::Transmit(bytes) => {
                    if let Err(e) = self.radio.send(&bytes) {
                        debug!("retransmission deferred: {}", e);
                    }
                }
                TickAction::Surface(e) => self.surface(e, now),
            }
        }

        // 3+4. One uplink hand-off per tick: a deferred frame from a busy
        // transmitter takes the slot before anything new is scheduled.
        if let Some((bytes, confirmed)) = self.pending_tx.take() {
            self.transmit_uplink(bytes, confirmed, now);
        } else if self.mac.is_joined()
            && now.saturating_sub(self.last_tx_ms) >= self.opts.tx_interval_ms
        {
            if let Some(reading) = self.sensors.sample() {
                match self.mac.build_uplink(
                    SENSOR_PORT,
                    &reading.encode(),
                    self.opts.confirmed_uplinks,
                ) {
                    Ok(bytes) => {
                        self.last_tx_ms = now;
                        self.transmit_uplink(bytes, self.opts.confirmed_uplinks, now);
                    }
                    Err(e) => warn!("uplink build failed: {}", e),
                }
            }
        }

        // 5. Sweep stale mesh routes.
        self.mesh.age(now);

        // 6. Downlinks the bridge fetched re-enter the RX pipeline.
        for _ in 0..MAX_DOWNLINKS_PER_TICK {
            let frame = match self.cloud.as_mut().map(|c| c.downlink_rx.try_recv()) {
                Some(Ok(frame)) => frame,
                _ => break,
            };
            let now = self.now_ms();
            self.process_rx(&frame, now);
        }

        // 7. Back-off expired: try joining again.
        if let Some(due) = self.rejoin_at_ms {
            if now >= due && !self.mac.is_joined() {
                self.rejoin_at_ms = None;
                match self.mac.activate(now) {
                    Ok(Some(join_request)) => {
                        if let Err(e) = self.radio.send(&join_request) {
                            warn!("join request hand-off failed: {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => self.surface(e, now),
                }
            }
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        info!("supervisor loop running");
        loop {
            self.tick();
            tokio::time::sleep(std::time::Duration::from_millis(TICK_IDLE_MS)).await;
        }
    }

    fn transmit_uplink(&mut self, bytes: Vec<u8>, confirmed: bool, now: u64) {
        match self.radio.send(&bytes) {
            Ok(()) => self.mac.note_uplink_sent(bytes, confirmed, now),
            Err(GatewayError::RadioBusy) => {
                debug!("transmitter busy, uplink deferred to next tick");
                self.pending_tx = Some((bytes, confirmed));
            }
            Err(e) => warn!("uplink hand-off failed: {}", e),
        }
    }

    fn process_rx(&mut self, bytes: &[u8], now: u64) {
        match self.mac.handle_rx(bytes, now) {
            Ok(RxOutcome::Observed { frame, dev_eui, fcnt }) => {
                let own_addr = self.mac.own_session().map(|s| s.dev_addr).unwrap_or(0);
                // Heard on the air directly, so the source is its own next hop.
                self.mesh.observe(frame.dev_addr, own_addr, frame.dev_addr, frame.hop_count(), now);

                if let Some(session) = self.mac.store().session(dev_eui) {
                    if let Some(relay) = self.mesh.forward(&frame, fcnt, session) {
                        if let Err(e) = self.radio.send(&relay) {
                            debug!("mesh relay dropped: {}", e);
                        }
                    }
                }

                if let Some(cloud) = &self.cloud {
                    if cloud.uplink_tx.try_send(frame.encode()).is_err() {
                        warn!("cloud channel full, uplink not bridged");
                    }
                }
            }
            Ok(RxOutcome::Downlink { f_port, payload, ack }) => {
                if ack {
                    debug!("downlink carried ACK");
                }
                match f_port {
                    Some(IRRIGATION_PORT) => match IrrigationCommand::decode(&payload) {
                        Some(command) => self.actuator.dispatch(command),
                        None => warn!(len = payload.len(), "malformed irrigation command"),
                    },
                    Some(port) => debug!(port, "downlink on unhandled port"),
                    None => {}
                }
            }
            Ok(RxOutcome::JoinComplete { dev_addr }) => {
                info!(dev_addr = format_args!("{dev_addr:08X}"), "network joined");
            }
            Ok(RxOutcome::Reply(bytes)) => {
                if let Err(e) = self.radio.send(&bytes) {
                    warn!("join accept hand-off failed: {}", e);
                }
            }
            Ok(RxOutcome::Ignored(reason)) => debug!(reason, "frame ignored"),
            Err(e) => self.surface(e, now),
        }
    }

    fn surface(&mut self, error: GatewayError, now: u64) {
        if error.is_silent_drop() {
            if let Some(suppressed) = self.drop_log.permit(now, error.kind()) {
                warn!(kind = error.kind(), suppressed, "frame dropped: {}", error);
            }
            return;
        }

        match &error {
            GatewayError::RadioBusy => debug!("radio busy, retrying next tick"),
            GatewayError::JoinFailed(_) => {
                warn!("{}; backing off {} ms", error, self.opts.join_backoff_ms);
                self.rejoin_at_ms = Some(now + self.opts.join_backoff_ms);
            }
            GatewayError::AckMissing(_) => warn!("{}", error),
            GatewayError::UnknownDevice => debug!("frame from unprovisioned device"),
            other => warn!(kind = other.kind(), "{}", other),
        }
    }

    pub fn mac(&self) -> &MacEngine {
        &self.mac
    }

    pub fn mesh(&self) -> &RoutingTable {
        &self.mesh
    }
}

//! LoRaWAN MAC endpoint state machine
//!
//! The gateway is two MAC personalities in one engine. For its own telemetry
//! it is an end device: it joins over OTAA (or attaches over ABP), builds and
//! signs uplinks, and consumes downlinks addressed to its session. For the
//! field devices around it, it is the join-accepting entity and a
//! demodulating observer: join requests from provisioned DevEUIs get a
//! session and an encrypted JoinAccept, and MIC-verified uplinks from known
//! sessions are surfaced for mesh relay and cloud submission.
//!
//! Counter discipline: every session carries 32-bit extended counters while
//! the wire carries 16 bits. A received counter is accepted when it lands in
//! a 16384-frame window ahead of the last accepted value; the high half
//! increments on rollover. Uplink MICs cover the plaintext payload, so
//! verification decrypts into a scratch copy first; downlink MICs cover the
//! wire form.

use std::collections::HashSet;

use rand::Rng;
use tracing::{debug, info};

use crate::config::Activation;
use crate::error::GatewayError;
use crate::lorawan::crypto::{self, Direction};
use crate::lorawan::keys::{derive_session_keys, Eui, KeyStore, Session};
use crate::lorawan::{DataFrame, FCtrl, Frame, JoinAccept, JoinRequest, MType, Major};

/// Widest gap a wire counter may open over the extended counter.
pub const MAX_FCNT_GAP: u16 = 16_384;

/// Private network identifier baked into join accepts.
const NET_ID: u32 = 0x000013;

/// Extend a 16-bit wire counter against the lowest still-acceptable extended
/// value. Returns the extended candidate, or `None` when the wire value falls
/// behind the window (replay) or too far ahead of it.
pub fn extend_counter(expected: u32, wire: u16) -> Option<u32> {
    let delta = wire.wrapping_sub(expected as u16);
    if delta >= MAX_FCNT_GAP {
        return None;
    }
    Some(expected.wrapping_add(delta as u32))
}

/// MIC of a wire-form uplink. The integrity code covers the plaintext
/// payload, so the FRMPayload is deciphered into a scratch copy before the
/// CMAC runs.
pub fn uplink_mic(frame: &DataFrame, fcnt: u32, session: &Session) -> [u8; 4] {
    let mut plain = frame.clone();
    if let Some(port) = plain.f_port {
        let key = payload_key(port, session);
        crypto::payload_crypt(key, plain.dev_addr, fcnt, Direction::Up, &mut plain.frm_payload);
    }
    crypto::data_mic(
        session.nwk_skey.as_bytes(),
        plain.dev_addr,
        fcnt,
        Direction::Up,
        &plain.mic_input(),
    )
}

/// Port 0 carries MAC commands ciphered with the network session key;
/// application ports use the application session key.
fn payload_key(f_port: u8, session: &Session) -> &[u8; 16] {
    if f_port == 0 {
        session.nwk_skey.as_bytes()
    } else {
        session.app_skey.as_bytes()
    }
}

/// Activation lifecycle of the gateway's own endpoint.
#[derive(Debug)]
pub enum ActivationState {
    Unjoined,
    Joining(JoinAttempt),
    Joined,
}

#[derive(Debug)]
pub struct JoinAttempt {
    dev_nonce: u16,
    deadline_ms: u64,
    attempts_left: u8,
}

/// A confirmed uplink waiting for its ACK window.
#[derive(Debug)]
struct PendingAck {
    bytes: Vec<u8>,
    deadline_ms: u64,
    retransmissions_left: u8,
}

/// What a received frame turned into.
#[derive(Debug)]
pub enum RxOutcome {
    /// MIC-verified uplink from a mesh-local device, payload still in wire
    /// form. `fcnt` is the extended counter it verified against.
    Observed { frame: DataFrame, dev_eui: Eui, fcnt: u32 },
    /// Downlink for this gateway, payload deciphered.
    Downlink { f_port: Option<u8>, payload: Vec<u8>, ack: bool },
    /// Our OTAA join completed.
    JoinComplete { dev_addr: u32 },
    /// A frame to transmit in response (join accept for a field device).
    Reply(Vec<u8>),
    /// Valid frame with nothing for us in it.
    Ignored(&'static str),
}

/// Deferred work surfaced by the periodic tick.
#[derive(Debug)]
pub enum TickAction {
    Transmit(Vec<u8>),
    Surface(GatewayError),
}

#[derive(Debug, Clone)]
pub struct MacConfig {
    pub activation: Activation,
    /// Transmission budget for joins and confirmed uplinks.
    pub retries: u8,
    pub ack_deadline_ms: u64,
    pub join_timeout_ms: u64,
}

pub struct MacEngine {
    dev_eui: Eui,
    app_eui: Eui,
    state: ActivationState,
    store: KeyStore,
    /// Next-acceptable extended uplink counter per observed source DevAddr.
    peer_fcnt_up: std::collections::HashMap<u32, u32>,
    pending_ack: Option<PendingAck>,
    /// DevNonces this gateway has itself spent on join requests.
    own_dev_nonces: HashSet<u16>,
    cfg: MacConfig,
}

impl MacEngine {
    pub fn new(dev_eui: Eui, app_eui: Eui, store: KeyStore, cfg: MacConfig) -> Self {
        Self {
            dev_eui,
            app_eui,
            state: ActivationState::Unjoined,
            store,
            peer_fcnt_up: std::collections::HashMap::new(),
            pending_ack: None,
            own_dev_nonces: HashSet::new(),
            cfg,
        }
    }

    pub fn is_joined(&self) -> bool {
        matches!(self.state, ActivationState::Joined)
    }

    pub fn state(&self) -> &ActivationState {
        &self.state
    }

    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut KeyStore {
        &mut self.store
    }

    /// Session of this gateway's own endpoint, once joined.
    pub fn own_session(&self) -> Option<&Session> {
        self.store.session(self.dev_eui)
    }

    /// Begin activation. OTAA returns the join request to transmit; ABP
    /// attaches a session immediately and returns `None`.
    pub fn activate(&mut self, now_ms: u64) -> Result<Option<Vec<u8>>, GatewayError> {
        match self.cfg.activation {
            Activation::Abp => {
                let record = self.store.record(self.dev_eui).ok_or(GatewayError::UnknownDevice)?;
                // Personalization has no join exchange; the session is pinned
                // to the persisted DevAddr with zero nonces, and the counters
                // resume where the last run stopped.
                let dev_addr = if record.dev_addr != 0 {
                    record.dev_addr
                } else {
                    self.dev_eui.as_u64() as u32
                };
                let (nwk_skey, app_skey) =
                    derive_session_keys(&record.app_key, 0, NET_ID, 0);
                let mut session = Session::new(dev_addr, nwk_skey, app_skey, 0, 0);
                session.fcnt_up = record.fcnt_up;
                session.fcnt_down = record.fcnt_down;
                self.store.attach_session(self.dev_eui, session);
                self.state = ActivationState::Joined;
                info!(dev_addr = format_args!("{dev_addr:08X}"), "ABP session attached");
                Ok(None)
            }
            Activation::Otaa => {
                let request = self.build_join_request()?;
                self.state = ActivationState::Joining(JoinAttempt {
                    dev_nonce: request.dev_nonce,
                    deadline_ms: now_ms + self.cfg.join_timeout_ms,
                    attempts_left: self.cfg.retries.max(1),
                });
                debug!(dev_nonce = request.dev_nonce, "join request prepared");
                Ok(Some(request.encode()))
            }
        }
    }

    fn build_join_request(&mut self) -> Result<JoinRequest, GatewayError> {
        let (app_key, _) = self.store.lookup(self.dev_eui).ok_or(GatewayError::UnknownDevice)?;
        let app_key = *app_key;

        let mut rng = rand::thread_rng();
        let dev_nonce = loop {
            let candidate: u16 = rng.gen();
            if self.own_dev_nonces.insert(candidate) {
                break candidate;
            }
        };

        let mut request = JoinRequest {
            major: Major::LoRaWANR1,
            app_eui: self.app_eui.as_u64(),
            dev_eui: self.dev_eui.as_u64(),
            dev_nonce,
            mic: [0; 4],
        };
        request.mic = crypto::join_mic(app_key.as_bytes(), &request.mic_input());
        Ok(request)
    }

    /// Route one received frame through decode, integrity and counter checks.
    pub fn handle_rx(&mut self, bytes: &[u8], now_ms: u64) -> Result<RxOutcome, GatewayError> {
        match crate::lorawan::decode(bytes)? {
            Frame::JoinRequest(request) => self.handle_join_request(&request),
            Frame::JoinAccept(accept) => self.handle_join_accept(&accept, now_ms),
            Frame::Data(frame) if frame.mtype.is_uplink() => self.handle_observed_uplink(frame),
            Frame::Data(frame) => self.handle_downlink(&frame),
        }
    }

    /// Join-server subset: accept a join request from a provisioned field
    /// device and answer with an encrypted JoinAccept.
    fn handle_join_request(&mut self, request: &JoinRequest) -> Result<RxOutcome, GatewayError> {
        let dev_eui = Eui::from(request.dev_eui);
        let record = self.store.record(dev_eui).ok_or(GatewayError::UnknownDevice)?;
        if record.app_eui.as_u64() != request.app_eui {
            return Err(GatewayError::UnknownDevice);
        }
        let app_key = record.app_key;

        let expected = crypto::join_mic(app_key.as_bytes(), &request.mic_input());
        if expected != request.mic {
            return Err(GatewayError::MicInvalid);
        }

        if !self.store.note_dev_nonce(dev_eui, request.dev_nonce) {
            return Err(GatewayError::ReplayedCounter(request.dev_nonce));
        }

        let mut rng = rand::thread_rng();
        let app_nonce: u32 = rng.gen::<u32>() & 0x00FF_FFFF;
        let dev_addr = loop {
            let candidate: u32 = rng.gen();
            if candidate != 0 && self.store.session_by_addr(candidate).is_none() {
                break candidate;
            }
        };

        let (nwk_skey, app_skey) =
            derive_session_keys(&app_key, app_nonce, NET_ID, request.dev_nonce);
        self.store.attach_session(
            dev_eui,
            Session::new(dev_addr, nwk_skey, app_skey, app_nonce, request.dev_nonce),
        );
        self.peer_fcnt_up.insert(dev_addr, 0);
        info!(
            dev_eui = %dev_eui,
            dev_addr = format_args!("{dev_addr:08X}"),
            "join accepted, session derived"
        );

        Ok(RxOutcome::Reply(build_join_accept(&app_key, app_nonce, dev_addr)))
    }

    /// Device side of OTAA: unwrap the accept and derive our own session.
    fn handle_join_accept(
        &mut self,
        accept: &JoinAccept,
        _now_ms: u64,
    ) -> Result<RxOutcome, GatewayError> {
        let attempt = match &self.state {
            ActivationState::Joining(attempt) => attempt,
            _ => return Ok(RxOutcome::Ignored("join accept while not joining")),
        };
        let dev_nonce = attempt.dev_nonce;

        let (app_key, _) = self.store.lookup(self.dev_eui).ok_or(GatewayError::UnknownDevice)?;
        let app_key = *app_key;

        let mut body = accept.encrypted.clone();
        crypto::join_accept_unwrap(app_key.as_bytes(), &mut body);
        if body.len() < 16 {
            return Err(GatewayError::MicInvalid);
        }

        let split = body.len() - 4;
        let mic_rx: [u8; 4] = body[split..].try_into().expect("sliced to 4");
        let plain = &body[..split];
        let mhdr = (0b001u8 << 5) | match accept.major {
            Major::LoRaWANR1 => 0b00,
            Major::Rfu(v) => v & 0x03,
        };
        let mut mic_input = Vec::with_capacity(1 + plain.len());
        mic_input.push(mhdr);
        mic_input.extend_from_slice(plain);
        if crypto::join_mic(app_key.as_bytes(), &mic_input) != mic_rx {
            return Err(GatewayError::MicInvalid);
        }

        let app_nonce =
            u32::from_le_bytes([plain[0], plain[1], plain[2], 0]);
        let dev_addr = u32::from_le_bytes([plain[6], plain[7], plain[8], plain[9]]);

        let (nwk_skey, app_skey) = derive_session_keys(&app_key, app_nonce, NET_ID, dev_nonce);
        self.store.attach_session(
            self.dev_eui,
            Session::new(dev_addr, nwk_skey, app_skey, app_nonce, dev_nonce),
        );
        self.state = ActivationState::Joined;
        info!(dev_addr = format_args!("{dev_addr:08X}"), "OTAA join complete");

        Ok(RxOutcome::JoinComplete { dev_addr })
    }

    /// Observer path: verify an uplink from a mesh-local session so it can be
    /// relayed and bridged. The payload stays in wire form.
    fn handle_observed_uplink(&mut self, frame: DataFrame) -> Result<RxOutcome, GatewayError> {
        let (dev_eui, candidate, mic_ok) = {
            let (dev_eui, session) = self
                .store
                .session_by_addr(frame.dev_addr)
                .ok_or(GatewayError::UnknownDevice)?;
            let expected = self.peer_fcnt_up.get(&frame.dev_addr).copied().unwrap_or(0);
            let candidate = extend_counter(expected, frame.fcnt)
                .ok_or(GatewayError::ReplayedCounter(frame.fcnt))?;
            let mic_ok = uplink_mic(&frame, candidate, session) == frame.mic;
            (dev_eui, candidate, mic_ok)
        };
        if !mic_ok {
            return Err(GatewayError::MicInvalid);
        }

        // Counters advance only after the integrity check passes.
        self.peer_fcnt_up.insert(frame.dev_addr, candidate + 1);
        Ok(RxOutcome::Observed { frame, dev_eui, fcnt: candidate })
    }

    /// Endpoint path: a downlink addressed to our own session.
    fn handle_downlink(&mut self, frame: &DataFrame) -> Result<RxOutcome, GatewayError> {
        let session = self.own_session().ok_or(GatewayError::UnknownDevice)?;
        if session.dev_addr != frame.dev_addr {
            return Err(GatewayError::UnknownDevice);
        }

        let candidate = extend_counter(session.fcnt_down, frame.fcnt)
            .ok_or(GatewayError::ReplayedCounter(frame.fcnt))?;

        // Downlink MICs cover the wire form.
        let expected = crypto::data_mic(
            session.nwk_skey.as_bytes(),
            frame.dev_addr,
            candidate,
            Direction::Down,
            &frame.mic_input(),
        );
        if expected != frame.mic {
            return Err(GatewayError::MicInvalid);
        }

        let mut payload = frame.frm_payload.clone();
        if let Some(port) = frame.f_port {
            let key = payload_key(port, session);
            crypto::payload_crypt(key, frame.dev_addr, candidate, Direction::Down, &mut payload);
        }

        if let Some(session) = self.store.session_mut(self.dev_eui) {
            session.fcnt_down = candidate + 1;
        }

        if frame.fctrl.ack && self.pending_ack.take().is_some() {
            info!("confirmed uplink acknowledged");
        }

        Ok(RxOutcome::Downlink { f_port: frame.f_port, payload, ack: frame.fctrl.ack })
    }

    /// Build a signed, enciphered uplink around an application payload.
    /// The frame counter is *not* advanced here; call [`note_uplink_sent`]
    /// once the radio accepts the frame.
    ///
    /// [`note_uplink_sent`]: MacEngine::note_uplink_sent
    pub fn build_uplink(
        &self,
        f_port: u8,
        payload: &[u8],
        confirmed: bool,
    ) -> Result<Vec<u8>, GatewayError> {
        let session = self.own_session().ok_or(GatewayError::JoinFailed("no active session"))?;
        let fcnt = session.fcnt_up;

        let mut frame = DataFrame {
            mtype: if confirmed { MType::ConfirmedDataUp } else { MType::UnconfirmedDataUp },
            major: Major::LoRaWANR1,
            dev_addr: session.dev_addr,
            fctrl: FCtrl::default(),
            fcnt: fcnt as u16,
            // Mesh extension octet: we originate at relay depth zero.
            f_opts: vec![0x00],
            f_port: Some(f_port),
            frm_payload: payload.to_vec(),
            mic: [0; 4],
        };

        // MIC over the plaintext, then encipher in place.
        frame.mic = crypto::data_mic(
            session.nwk_skey.as_bytes(),
            frame.dev_addr,
            fcnt,
            Direction::Up,
            &frame.mic_input(),
        );
        let key = payload_key(f_port, session);
        crypto::payload_crypt(key, frame.dev_addr, fcnt, Direction::Up, &mut frame.frm_payload);

        Ok(frame.encode())
    }

    /// Advance the uplink counter after a successful radio hand-off and arm
    /// the ACK window for confirmed frames. Never called for retransmissions.
    pub fn note_uplink_sent(&mut self, bytes: Vec<u8>, confirmed: bool, now_ms: u64) {
        if let Some(session) = self.store.session_mut(self.dev_eui) {
            session.fcnt_up += 1;
        }
        if confirmed {
            self.pending_ack = Some(PendingAck {
                bytes,
                deadline_ms: now_ms + self.cfg.ack_deadline_ms,
                retransmissions_left: self.cfg.retries.saturating_sub(1),
            });
        }
    }

    /// Drive deadlines: join attempts and confirmed-uplink ACK windows.
    pub fn tick(&mut self, now_ms: u64) -> Vec<TickAction> {
        let mut actions = Vec::new();

        let expired_attempts = match &self.state {
            ActivationState::Joining(attempt) if now_ms >= attempt.deadline_ms => {
                Some(attempt.attempts_left)
            }
            _ => None,
        };
        if let Some(attempts_left) = expired_attempts {
            if attempts_left > 1 {
                match self.build_join_request() {
                    Ok(request) => {
                        self.state = ActivationState::Joining(JoinAttempt {
                            dev_nonce: request.dev_nonce,
                            deadline_ms: now_ms + self.cfg.join_timeout_ms,
                            attempts_left: attempts_left - 1,
                        });
                        actions.push(TickAction::Transmit(request.encode()));
                    }
                    Err(e) => {
                        self.state = ActivationState::Unjoined;
                        actions.push(TickAction::Surface(e));
                    }
                }
            } else {
                self.state = ActivationState::Unjoined;
                actions.push(TickAction::Surface(GatewayError::JoinFailed("retries exhausted")));
            }
        }

        if let Some(mut pending) = self.pending_ack.take() {
            if now_ms < pending.deadline_ms {
                self.pending_ack = Some(pending);
            } else if pending.retransmissions_left > 0 {
                pending.retransmissions_left -= 1;
                pending.deadline_ms = now_ms + self.cfg.ack_deadline_ms;
                actions.push(TickAction::Transmit(pending.bytes.clone()));
                self.pending_ack = Some(pending);
            } else {
                actions.push(TickAction::Surface(GatewayError::AckMissing(self.cfg.retries)));
            }
        }

        actions
    }

    /// Request a fresh join: the current session is discarded first.
    pub fn rejoin(&mut self, now_ms: u64) -> Result<Option<Vec<u8>>, GatewayError> {
        self.store.drop_session(self.dev_eui);
        self.pending_ack = None;
        self.state = ActivationState::Unjoined;
        self.activate(now_ms)
    }

    /// Drop all keys and sessions; every pending exchange is cancelled.
    pub fn erase_all(&mut self) {
        self.store.erase_all();
        self.peer_fcnt_up.clear();
        self.own_dev_nonces.clear();
        self.pending_ack = None;
        self.state = ActivationState::Unjoined;
    }
}

/// Assemble the encrypted join accept for a device keyed with `app_key`.
fn build_join_accept(app_key: &crate::lorawan::keys::AppKey, app_nonce: u32, dev_addr: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(16);
    body.extend_from_slice(&app_nonce.to_le_bytes()[..3]);
    body.extend_from_slice(&NET_ID.to_le_bytes()[..3]);
    body.extend_from_slice(&dev_addr.to_le_bytes());
    body.push(0x00); // DLSettings: RX1 offset 0, RX2 datarate 0
    body.push(0x01); // RxDelay: 1 s

    let mhdr = 0b001u8 << 5;
    let mut mic_input = Vec::with_capacity(1 + body.len());
    mic_input.push(mhdr);
    mic_input.extend_from_slice(&body);
    let mic = crypto::join_mic(app_key.as_bytes(), &mic_input);

    body.extend_from_slice(&mic);
    crypto::join_accept_wrap(app_key.as_bytes(), &mut body);

    JoinAccept { major: Major::LoRaWANR1, encrypted: body }.encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::decode;
    use crate::lorawan::keys::{AppKey, NwkKey};

    const GATEWAY_EUI: u64 = 0x1111111111111111;
    const FIELD_EUI: u64 = 0x2222222222222222;
    const APP_EUI: u64 = 0x0000000000000001;

    fn mac_config(activation: Activation) -> MacConfig {
        MacConfig { activation, retries: 3, ack_deadline_ms: 2_000, join_timeout_ms: 6_000 }
    }

    fn engine(activation: Activation) -> MacEngine {
        let mut store = KeyStore::new();
        store.store(
            Eui::from(GATEWAY_EUI),
            AppKey::from([0x2B; 16]),
            NwkKey::from([0x7E; 16]),
            Eui::from(APP_EUI),
        );
        MacEngine::new(Eui::from(GATEWAY_EUI), Eui::from(APP_EUI), store, mac_config(activation))
    }

    /// A second engine playing the field device, plus the gateway engine
    /// provisioned with its keys.
    fn gateway_and_device() -> (MacEngine, MacEngine) {
        let mut gateway = engine(Activation::Abp);
        gateway.store_mut().store(
            Eui::from(FIELD_EUI),
            AppKey::from([0x00; 16]),
            NwkKey::from([0x11; 16]),
            Eui::from(APP_EUI),
        );
        gateway.activate(0).unwrap();

        let mut device_store = KeyStore::new();
        device_store.store(
            Eui::from(FIELD_EUI),
            AppKey::from([0x00; 16]),
            NwkKey::from([0x11; 16]),
            Eui::from(APP_EUI),
        );
        let device = MacEngine::new(
            Eui::from(FIELD_EUI),
            Eui::from(APP_EUI),
            device_store,
            mac_config(Activation::Otaa),
        );
        (gateway, device)
    }

    #[test]
    fn test_extend_counter_window() {
        assert_eq!(extend_counter(0, 0), Some(0));
        assert_eq!(extend_counter(0, 1), Some(1));
        assert_eq!(extend_counter(5, 4), None, "behind the window is a replay");
        assert_eq!(extend_counter(5, 5), Some(5));
        assert_eq!(extend_counter(0, MAX_FCNT_GAP), None, "window is exclusive");
        assert_eq!(extend_counter(0, MAX_FCNT_GAP - 1), Some((MAX_FCNT_GAP - 1) as u32));
    }

    #[test]
    fn test_extend_counter_rollover_increments_high_half() {
        // Last accepted 0xFFFF, so 0x10000 is the next expected.
        assert_eq!(extend_counter(0x1_0000, 0x0000), Some(0x1_0000));
        assert_eq!(extend_counter(0xFFFF, 0x0000), Some(0x1_0000));
        assert_eq!(extend_counter(0xFFFF, 0x0005), Some(0x1_0005));
        // Behind the rollover point stays rejected.
        assert_eq!(extend_counter(0x1_0001, 0xFFFF), None);
    }

    #[test]
    fn test_otaa_join_exchange_end_to_end() {
        let (mut gateway, mut device) = gateway_and_device();

        let request = device.activate(0).unwrap().expect("OTAA emits a join request");
        let reply = match gateway.handle_rx(&request, 10).unwrap() {
            RxOutcome::Reply(bytes) => bytes,
            other => panic!("expected join accept reply, got {other:?}"),
        };

        match device.handle_rx(&reply, 20).unwrap() {
            RxOutcome::JoinComplete { dev_addr } => {
                assert!(device.is_joined());
                let gw_session = gateway.store().session(Eui::from(FIELD_EUI)).unwrap();
                assert_eq!(gw_session.dev_addr, dev_addr);
                // Both ends derived the same session keys.
                let dev_session = device.own_session().unwrap();
                assert_eq!(dev_session.nwk_skey, gw_session.nwk_skey);
                assert_eq!(dev_session.app_skey, gw_session.app_skey);
                assert_eq!(dev_session.app_nonce, gw_session.app_nonce);
                assert_eq!(dev_session.dev_nonce, gw_session.dev_nonce);
                assert_eq!(dev_session.fcnt_up, 0);
                assert_eq!(dev_session.fcnt_down, 0);
            }
            other => panic!("expected JoinComplete, got {other:?}"),
        }
    }

    #[test]
    fn test_join_request_replay_refused() {
        let (mut gateway, mut device) = gateway_and_device();
        let request = device.activate(0).unwrap().unwrap();

        assert!(matches!(gateway.handle_rx(&request, 0), Ok(RxOutcome::Reply(_))));
        match gateway.handle_rx(&request, 5) {
            Err(GatewayError::ReplayedCounter(_)) => {}
            other => panic!("expected DevNonce replay refusal, got {other:?}"),
        }
    }

    #[test]
    fn test_join_request_unknown_device() {
        let mut gateway = engine(Activation::Abp);
        gateway.activate(0).unwrap();

        let mut request = JoinRequest {
            major: Major::LoRaWANR1,
            app_eui: APP_EUI,
            dev_eui: 0xDEADBEEFDEADBEEF,
            dev_nonce: 1,
            mic: [0; 4],
        };
        request.mic = crypto::join_mic(&[0u8; 16], &request.mic_input());

        match gateway.handle_rx(&request.encode(), 0) {
            Err(GatewayError::UnknownDevice) => {}
            other => panic!("expected UnknownDevice, got {other:?}"),
        }
    }

    #[test]
    fn test_join_request_bad_mic() {
        let (mut gateway, mut device) = gateway_and_device();
        let mut request = device.activate(0).unwrap().unwrap();
        let last = request.len() - 1;
        request[last] ^= 0xFF;

        match gateway.handle_rx(&request, 0) {
            Err(GatewayError::MicInvalid) => {}
            other => panic!("expected MicInvalid, got {other:?}"),
        }
    }

    #[test]
    fn test_uplink_roundtrip_through_observer() {
        let (mut gateway, mut device) = gateway_and_device();
        let request = device.activate(0).unwrap().unwrap();
        let reply = match gateway.handle_rx(&request, 0).unwrap() {
            RxOutcome::Reply(bytes) => bytes,
            other => panic!("unexpected {other:?}"),
        };
        device.handle_rx(&reply, 0).unwrap();

        let uplink = device.build_uplink(1, &[0x01, 0x02, 0x03], false).unwrap();
        device.note_uplink_sent(uplink.clone(), false, 0);
        assert_eq!(device.own_session().unwrap().fcnt_up, 1);

        match gateway.handle_rx(&uplink, 100).unwrap() {
            RxOutcome::Observed { frame, dev_eui, fcnt } => {
                assert_eq!(dev_eui, Eui::from(FIELD_EUI));
                assert_eq!(fcnt, 0);
                // Payload travels enciphered; decrypting with the session
                // AppSKey restores the application bytes.
                let session = gateway.store().session(dev_eui).unwrap();
                let mut payload = frame.frm_payload.clone();
                crypto::payload_crypt(
                    session.app_skey.as_bytes(),
                    frame.dev_addr,
                    fcnt,
                    Direction::Up,
                    &mut payload,
                );
                assert_eq!(payload, vec![0x01, 0x02, 0x03]);
            }
            other => panic!("expected Observed, got {other:?}"),
        }
    }

    #[test]
    fn test_uplink_replay_dropped_without_counter_motion() {
        let (mut gateway, mut device) = gateway_and_device();
        let request = device.activate(0).unwrap().unwrap();
        let reply = match gateway.handle_rx(&request, 0).unwrap() {
            RxOutcome::Reply(bytes) => bytes,
            other => panic!("unexpected {other:?}"),
        };
        device.handle_rx(&reply, 0).unwrap();

        let uplink = device.build_uplink(1, &[0xAA], false).unwrap();
        device.note_uplink_sent(uplink.clone(), false, 0);

        let first = gateway.handle_rx(&uplink, 100).unwrap();
        let dev_addr = match first {
            RxOutcome::Observed { ref frame, .. } => frame.dev_addr,
            ref other => panic!("expected Observed, got {other:?}"),
        };
        let window_after_first = gateway.peer_fcnt_up[&dev_addr];

        match gateway.handle_rx(&uplink, 200) {
            Err(GatewayError::ReplayedCounter(0)) => {}
            other => panic!("expected ReplayedCounter, got {other:?}"),
        }
        assert_eq!(gateway.peer_fcnt_up[&dev_addr], window_after_first);
    }

    #[test]
    fn test_uplink_bad_mic_rejected() {
        let (mut gateway, mut device) = gateway_and_device();
        let request = device.activate(0).unwrap().unwrap();
        let reply = match gateway.handle_rx(&request, 0).unwrap() {
            RxOutcome::Reply(bytes) => bytes,
            other => panic!("unexpected {other:?}"),
        };
        device.handle_rx(&reply, 0).unwrap();

        let mut uplink = device.build_uplink(1, &[0xAA], false).unwrap();
        let last = uplink.len() - 1;
        uplink[last] ^= 0x01;

        match gateway.handle_rx(&uplink, 100) {
            Err(GatewayError::MicInvalid) => {}
            other => panic!("expected MicInvalid, got {other:?}"),
        }
    }

    fn joined_abp_engine() -> MacEngine {
        let mut mac = engine(Activation::Abp);
        mac.activate(0).unwrap();
        assert!(mac.is_joined());
        mac
    }

    /// Craft a downlink toward `session` the way the network server would.
    fn downlink_for(session: &Session, fcnt: u32, payload: &[u8], ack: bool) -> Vec<u8> {
        let mut frame = DataFrame {
            mtype: MType::UnconfirmedDataDown,
            major: Major::LoRaWANR1,
            dev_addr: session.dev_addr,
            fctrl: FCtrl { ack, ..FCtrl::default() },
            fcnt: fcnt as u16,
            f_opts: Vec::new(),
            f_port: Some(2),
            frm_payload: payload.to_vec(),
            mic: [0; 4],
        };
        crypto::payload_crypt(
            session.app_skey.as_bytes(),
            frame.dev_addr,
            fcnt,
            Direction::Down,
            &mut frame.frm_payload,
        );
        frame.mic = crypto::data_mic(
            session.nwk_skey.as_bytes(),
            frame.dev_addr,
            fcnt,
            Direction::Down,
            &frame.mic_input(),
        );
        frame.encode()
    }

    #[test]
    fn test_downlink_decrypts_and_advances_counter() {
        let mut mac = joined_abp_engine();
        let session = mac.own_session().unwrap().clone();

        let bytes = downlink_for(&session, 0, &[0x07, 0x08], false);
        match mac.handle_rx(&bytes, 100).unwrap() {
            RxOutcome::Downlink { f_port, payload, ack } => {
                assert_eq!(f_port, Some(2));
                assert_eq!(payload, vec![0x07, 0x08]);
                assert!(!ack);
            }
            other => panic!("expected Downlink, got {other:?}"),
        }
        assert_eq!(mac.own_session().unwrap().fcnt_down, 1);

        // The same wire counter again is a replay.
        let replay = downlink_for(&session, 0, &[0x07, 0x08], false);
        match mac.handle_rx(&replay, 200) {
            Err(GatewayError::ReplayedCounter(0)) => {}
            other => panic!("expected ReplayedCounter, got {other:?}"),
        }
        assert_eq!(mac.own_session().unwrap().fcnt_down, 1);
    }

    #[test]
    fn test_downlink_accepted_after_rollover() {
        let mut mac = joined_abp_engine();
        mac.store_mut().session_mut(Eui::from(GATEWAY_EUI)).unwrap().fcnt_down = 0x1_0000;
        let session = mac.own_session().unwrap().clone();

        // Wire counter 0x0000 after the 16-bit rollover extends to 0x10000.
        let bytes = downlink_for(&session, 0x1_0000, &[0x01], false);
        match mac.handle_rx(&bytes, 100).unwrap() {
            RxOutcome::Downlink { payload, .. } => assert_eq!(payload, vec![0x01]),
            other => panic!("expected Downlink, got {other:?}"),
        }
        assert_eq!(mac.own_session().unwrap().fcnt_down, 0x1_0001);
    }

    #[test]
    fn test_own_uplink_counter_rollover() {
        let mut mac = joined_abp_engine();
        mac.store_mut().session_mut(Eui::from(GATEWAY_EUI)).unwrap().fcnt_up = 0xFFFE;

        let first = mac.build_uplink(1, &[0x01], false).unwrap();
        mac.note_uplink_sent(first.clone(), false, 0);
        assert_eq!(mac.own_session().unwrap().fcnt_up, 0xFFFF);

        let second = mac.build_uplink(1, &[0x02], false).unwrap();
        mac.note_uplink_sent(second.clone(), false, 0);
        assert_eq!(mac.own_session().unwrap().fcnt_up, 0x1_0000);

        // Wire counters show the truncated low half.
        match decode(&second).unwrap() {
            Frame::Data(frame) => assert_eq!(frame.fcnt, 0xFFFF),
            other => panic!("expected Data, got {other}"),
        }
    }

    #[test]
    fn test_confirmed_retry_exhaustion_surfaces_ack_missing() {
        let mut mac = joined_abp_engine();

        let uplink = mac.build_uplink(1, &[0x55], true).unwrap();
        mac.note_uplink_sent(uplink.clone(), true, 0);
        assert_eq!(mac.own_session().unwrap().fcnt_up, 1);

        // First deadline miss: retransmission of the same bytes.
        let actions = mac.tick(2_000);
        assert!(matches!(&actions[..], [TickAction::Transmit(b)] if *b == uplink));
        // Second miss: last retransmission.
        let actions = mac.tick(4_000);
        assert!(matches!(&actions[..], [TickAction::Transmit(b)] if *b == uplink));
        // Third miss: budget exhausted.
        let actions = mac.tick(6_000);
        assert!(matches!(
            &actions[..],
            [TickAction::Surface(GatewayError::AckMissing(3))]
        ));

        // The counter advanced exactly once for the whole exchange.
        assert_eq!(mac.own_session().unwrap().fcnt_up, 1);
        assert!(mac.tick(10_000).is_empty());
    }

    #[test]
    fn test_ack_downlink_clears_pending() {
        let mut mac = joined_abp_engine();
        let session = mac.own_session().unwrap().clone();

        let uplink = mac.build_uplink(1, &[0x55], true).unwrap();
        mac.note_uplink_sent(uplink, true, 0);

        let ack = downlink_for(&session, 0, &[], true);
        match mac.handle_rx(&ack, 500).unwrap() {
            RxOutcome::Downlink { ack: true, .. } => {}
            other => panic!("expected ACK downlink, got {other:?}"),
        }
        // No retransmission fires after the ACK.
        assert!(mac.tick(10_000).is_empty());
    }

    #[test]
    fn test_join_timeout_exhausts_to_join_failed() {
        let mut mac = engine(Activation::Otaa);
        let first = mac.activate(0).unwrap().unwrap();

        // Two more attempts fire on timeout, each with a fresh DevNonce.
        let actions = mac.tick(6_000);
        let second = match &actions[..] {
            [TickAction::Transmit(bytes)] => bytes.clone(),
            other => panic!("expected retransmit, got {other:?}"),
        };
        assert_ne!(first, second, "join retries must use a fresh DevNonce");

        let actions = mac.tick(12_000);
        assert!(matches!(&actions[..], [TickAction::Transmit(_)]));

        let actions = mac.tick(18_000);
        assert!(matches!(
            &actions[..],
            [TickAction::Surface(GatewayError::JoinFailed(_))]
        ));
        assert!(matches!(mac.state(), ActivationState::Unjoined));
    }

    #[test]
    fn test_rejoin_discards_session_and_restarts_otaa() {
        let (mut gateway, mut device) = gateway_and_device();
        let request = device.activate(0).unwrap().unwrap();
        let reply = match gateway.handle_rx(&request, 0).unwrap() {
            RxOutcome::Reply(bytes) => bytes,
            other => panic!("unexpected {other:?}"),
        };
        device.handle_rx(&reply, 0).unwrap();
        let old_addr = device.own_session().unwrap().dev_addr;

        let second_request = device.rejoin(1_000).unwrap().expect("rejoin restarts OTAA");
        assert!(matches!(device.state(), ActivationState::Joining(_)));
        assert!(device.own_session().is_none(), "old session discarded");

        // The gateway answers the fresh request with a new DevAddr.
        let reply = match gateway.handle_rx(&second_request, 1_000).unwrap() {
            RxOutcome::Reply(bytes) => bytes,
            other => panic!("unexpected {other:?}"),
        };
        match device.handle_rx(&reply, 1_100).unwrap() {
            RxOutcome::JoinComplete { dev_addr } => assert_ne!(dev_addr, old_addr),
            other => panic!("expected JoinComplete, got {other:?}"),
        }
    }

    #[test]
    fn test_erase_all_cancels_everything() {
        let mut mac = joined_abp_engine();
        let uplink = mac.build_uplink(1, &[0x01], true).unwrap();
        mac.note_uplink_sent(uplink, true, 0);

        mac.erase_all();
        assert!(matches!(mac.state(), ActivationState::Unjoined));
        assert!(mac.own_session().is_none());
        assert!(mac.tick(100_000).is_empty());
        assert_eq!(mac.store().device_count(), 0);
    }
}

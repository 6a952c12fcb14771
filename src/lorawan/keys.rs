//! Root keys, session keys, and the device key store
//!
//! The store maps each provisioned DevEUI to its root keys and, once a join
//! has completed, a live session. Root keys never leave the store in
//! cleartext except into the crypto primitives; session keys are derived, not
//! persisted. The persisted form is one flat record per device:
//!
//!   DevEUI(8,LE) | AppKey(16) | NwkKey(16) | AppEUI(8,LE)
//!              | DevAddr(4,LE) | FCntUp(4,LE) | FCntDown(4,LE)
//!
//! Counters in the record track the last persisted session so ABP devices
//! resume without reuse; OTAA resets them on every join.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::GatewayError;
use crate::lorawan::crypto;

/// 64-bit extended unique identifier (DevEUI / AppEUI / JoinEUI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eui(u64);

impl Eui {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for Eui {
    fn from(value: u64) -> Self {
        Eui(value)
    }
}

impl fmt::Display for Eui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

macro_rules! key_128 {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub struct $name([u8; 16]);

        impl $name {
            /// Key material, handed out only to the crypto layer and the
            /// persisted record codec.
            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }
        }

        impl From<[u8; 16]> for $name {
            fn from(bytes: [u8; 16]) -> Self {
                $name(bytes)
            }
        }

        // Key material stays out of logs.
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "(..)"))
            }
        }
    };
}

key_128!(
    /// Root application key; derives both session keys on OTAA join.
    AppKey
);
key_128!(
    /// Root network key, held for forward compatibility with 1.1 key
    /// separation; unused by the 1.0.x derivation.
    NwkKey
);
key_128!(
    /// Session network key; authenticates MICs.
    NwkSKey
);
key_128!(
    /// Session application key; ciphers FRMPayload on ports > 0.
    AppSKey
);

/// A live session created by a join (or ABP attach).
#[derive(Debug, Clone)]
pub struct Session {
    pub dev_addr: u32,
    pub nwk_skey: NwkSKey,
    pub app_skey: AppSKey,
    /// Extended 32-bit counters; the wire carries the low 16 bits.
    pub fcnt_up: u32,
    pub fcnt_down: u32,
    /// Nonces of the join exchange that produced this session, kept so the
    /// keys can be rederived after a restart.
    pub app_nonce: u32,
    pub dev_nonce: u16,
}

impl Session {
    pub fn new(
        dev_addr: u32,
        nwk_skey: NwkSKey,
        app_skey: AppSKey,
        app_nonce: u32,
        dev_nonce: u16,
    ) -> Self {
        Self { dev_addr, nwk_skey, app_skey, fcnt_up: 0, fcnt_down: 0, app_nonce, dev_nonce }
    }
}

/// LoRaWAN 1.0.x session key derivation. Pure: the same inputs always yield
/// the same keys, and the 0x01/0x02 tag byte keeps the two keys distinct.
pub fn derive_session_keys(
    app_key: &AppKey,
    app_nonce: u32,
    net_id: u32,
    dev_nonce: u16,
) -> (NwkSKey, AppSKey) {
    let nwk = crypto::aes128_block(app_key.as_bytes(), &session_seed(0x01, app_nonce, net_id, dev_nonce));
    let app = crypto::aes128_block(app_key.as_bytes(), &session_seed(0x02, app_nonce, net_id, dev_nonce));
    (NwkSKey::from(nwk), AppSKey::from(app))
}

fn session_seed(tag: u8, app_nonce: u32, net_id: u32, dev_nonce: u16) -> [u8; 16] {
    let mut seed = [0u8; 16];
    seed[0] = tag;
    seed[1..4].copy_from_slice(&app_nonce.to_le_bytes()[..3]);
    seed[4..7].copy_from_slice(&net_id.to_le_bytes()[..3]);
    seed[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
    seed
}

/// Provisioned per-device state, persisted across restarts.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub app_key: AppKey,
    pub nwk_key: NwkKey,
    pub app_eui: Eui,
    pub dev_addr: u32,
    pub fcnt_up: u32,
    pub fcnt_down: u32,
}

const RECORD_LEN: usize = 60;

/// In-memory key store: DevEUI → root keys, plus live sessions and the
/// accepted-DevNonce sets that guard the join procedure against replay.
#[derive(Debug, Default)]
pub struct KeyStore {
    devices: HashMap<Eui, DeviceRecord>,
    sessions: HashMap<Eui, Session>,
    dev_nonces: HashMap<Eui, HashSet<u16>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision (or re-provision) a device. Idempotent; overwrites root keys
    /// and resets the persisted counters.
    pub fn store(&mut self, dev_eui: Eui, app_key: AppKey, nwk_key: NwkKey, app_eui: Eui) {
        self.devices.insert(
            dev_eui,
            DeviceRecord { app_key, nwk_key, app_eui, dev_addr: 0, fcnt_up: 0, fcnt_down: 0 },
        );
    }

    pub fn lookup(&self, dev_eui: Eui) -> Option<(&AppKey, &NwkKey)> {
        self.devices.get(&dev_eui).map(|rec| (&rec.app_key, &rec.nwk_key))
    }

    pub fn record(&self, dev_eui: Eui) -> Option<&DeviceRecord> {
        self.devices.get(&dev_eui)
    }

    pub fn contains(&self, dev_eui: Eui) -> bool {
        self.devices.contains_key(&dev_eui)
    }

    /// Attach a freshly derived session, recording its DevAddr on the device.
    pub fn attach_session(&mut self, dev_eui: Eui, session: Session) {
        if let Some(rec) = self.devices.get_mut(&dev_eui) {
            rec.dev_addr = session.dev_addr;
        }
        self.sessions.insert(dev_eui, session);
    }

    pub fn session(&self, dev_eui: Eui) -> Option<&Session> {
        self.sessions.get(&dev_eui)
    }

    pub fn session_mut(&mut self, dev_eui: Eui) -> Option<&mut Session> {
        self.sessions.get_mut(&dev_eui)
    }

    /// Linear scan; session counts stay in the tens on a field gateway.
    pub fn session_by_addr(&self, dev_addr: u32) -> Option<(Eui, &Session)> {
        self.sessions.iter().find(|(_, s)| s.dev_addr == dev_addr).map(|(e, s)| (*e, s))
    }

    pub fn session_by_addr_mut(&mut self, dev_addr: u32) -> Option<(Eui, &mut Session)> {
        self.sessions.iter_mut().find(|(_, s)| s.dev_addr == dev_addr).map(|(e, s)| (*e, s))
    }

    pub fn drop_session(&mut self, dev_eui: Eui) {
        self.sessions.remove(&dev_eui);
    }

    /// Drop every key, session, and nonce. Pending acknowledgements die with
    /// the sessions they belonged to.
    pub fn erase_all(&mut self) {
        self.devices.clear();
        self.sessions.clear();
        self.dev_nonces.clear();
    }

    /// Record a DevNonce for a device; returns false when the value was
    /// already accepted once (join replay).
    pub fn note_dev_nonce(&mut self, dev_eui: Eui, dev_nonce: u16) -> bool {
        self.dev_nonces.entry(dev_eui).or_default().insert(dev_nonce)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Load the flat record file. A missing file is an empty store (first
    /// boot); a malformed one is `StoreCorrupt`.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = std::fs::read(path)
            .map_err(|e| GatewayError::StoreCorrupt(format!("read {}: {}", path.display(), e)))?;
        if data.len() % RECORD_LEN != 0 {
            return Err(GatewayError::StoreCorrupt(format!(
                "{} bytes is not a whole number of {}-byte records",
                data.len(),
                RECORD_LEN
            )));
        }

        let mut store = Self::new();
        let mut buf = &data[..];
        while buf.has_remaining() {
            let dev_eui = Eui::from(buf.get_u64_le());
            let mut app_key = [0u8; 16];
            buf.copy_to_slice(&mut app_key);
            let mut nwk_key = [0u8; 16];
            buf.copy_to_slice(&mut nwk_key);
            let app_eui = Eui::from(buf.get_u64_le());
            let dev_addr = buf.get_u32_le();
            let fcnt_up = buf.get_u32_le();
            let fcnt_down = buf.get_u32_le();
            store.devices.insert(
                dev_eui,
                DeviceRecord {
                    app_key: AppKey::from(app_key),
                    nwk_key: NwkKey::from(nwk_key),
                    app_eui,
                    dev_addr,
                    fcnt_up,
                    fcnt_down,
                },
            );
        }
        Ok(store)
    }

    /// Persist every record, folding live session counters into the rows so a
    /// restart resumes where the counters left off.
    pub fn save(&self, path: &Path) -> Result<(), GatewayError> {
        let mut buf = BytesMut::with_capacity(self.devices.len() * RECORD_LEN);
        for (dev_eui, rec) in &self.devices {
            let (dev_addr, fcnt_up, fcnt_down) = match self.sessions.get(dev_eui) {
                Some(s) => (s.dev_addr, s.fcnt_up, s.fcnt_down),
                None => (rec.dev_addr, rec.fcnt_up, rec.fcnt_down),
            };
            buf.put_u64_le(dev_eui.as_u64());
            buf.put_slice(rec.app_key.as_bytes());
            buf.put_slice(rec.nwk_key.as_bytes());
            buf.put_u64_le(rec.app_eui.as_u64());
            buf.put_u32_le(dev_addr);
            buf.put_u32_le(fcnt_up);
            buf.put_u32_le(fcnt_down);
        }
        std::fs::write(path, &buf)
            .map_err(|e| GatewayError::StoreCorrupt(format!("write {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> (KeyStore, Eui) {
        let dev_eui = Eui::from(0x1111111111111111);
        let mut store = KeyStore::new();
        store.store(
            dev_eui,
            AppKey::from([0x2B; 16]),
            NwkKey::from([0x7E; 16]),
            Eui::from(0x0000000000000001),
        );
        (store, dev_eui)
    }

    #[test]
    fn test_derive_session_keys_distinct_and_pure() {
        let app_key = AppKey::from([0x2B; 16]);

        let (nwk_a, app_a) = derive_session_keys(&app_key, 0x0A0B0C, 0x000013, 0x0001);
        let (nwk_b, app_b) = derive_session_keys(&app_key, 0x0A0B0C, 0x000013, 0x0001);
        assert_eq!(nwk_a, nwk_b);
        assert_eq!(app_a, app_b);
        assert_ne!(nwk_a.as_bytes(), app_a.as_bytes());

        // A different DevNonce must rotate both keys.
        let (nwk_c, app_c) = derive_session_keys(&app_key, 0x0A0B0C, 0x000013, 0x0002);
        assert_ne!(nwk_a, nwk_c);
        assert_ne!(app_a, app_c);
    }

    #[test]
    fn test_store_lookup_and_session_lifecycle() {
        let (mut store, dev_eui) = sample_store();
        assert!(store.lookup(dev_eui).is_some());
        assert!(store.lookup(Eui::from(0xDEAD)).is_none());

        let (nwk, app) = derive_session_keys(store.lookup(dev_eui).unwrap().0, 1, 0, 1);
        store.attach_session(dev_eui, Session::new(0x26011BDA, nwk, app, 1, 1));

        assert_eq!(store.session(dev_eui).unwrap().dev_addr, 0x26011BDA);
        assert_eq!(store.record(dev_eui).unwrap().dev_addr, 0x26011BDA);
        let (found, _) = store.session_by_addr(0x26011BDA).unwrap();
        assert_eq!(found, dev_eui);

        store.drop_session(dev_eui);
        assert!(store.session(dev_eui).is_none());
        // Root keys survive a session drop.
        assert!(store.lookup(dev_eui).is_some());

        store.erase_all();
        assert!(store.lookup(dev_eui).is_none());
        assert_eq!(store.device_count(), 0);
    }

    #[test]
    fn test_dev_nonce_replay_refused() {
        let (mut store, dev_eui) = sample_store();
        assert!(store.note_dev_nonce(dev_eui, 0x0001));
        assert!(!store.note_dev_nonce(dev_eui, 0x0001));
        assert!(store.note_dev_nonce(dev_eui, 0x0002));
        // Per-device sets are independent.
        assert!(store.note_dev_nonce(Eui::from(0x22), 0x0001));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");

        let (mut store, dev_eui) = sample_store();
        let (nwk, app) = derive_session_keys(store.lookup(dev_eui).unwrap().0, 7, 0, 9);
        let mut session = Session::new(0x01020304, nwk, app, 7, 9);
        session.fcnt_up = 41;
        session.fcnt_down = 12;
        store.attach_session(dev_eui, session);

        store.save(&path).unwrap();
        let loaded = KeyStore::load(&path).unwrap();

        let rec = loaded.record(dev_eui).unwrap();
        assert_eq!(rec.dev_addr, 0x01020304);
        assert_eq!(rec.fcnt_up, 41);
        assert_eq!(rec.fcnt_down, 12);
        assert_eq!(rec.app_key, AppKey::from([0x2B; 16]));
        // Sessions are rederivable, not persisted.
        assert!(loaded.session(dev_eui).is_none());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::load(&dir.path().join("absent.bin")).unwrap();
        assert_eq!(store.device_count(), 0);
    }

    #[test]
    fn test_load_truncated_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");
        std::fs::write(&path, [0u8; RECORD_LEN + 7]).unwrap();

        match KeyStore::load(&path) {
            Err(GatewayError::StoreCorrupt(_)) => {}
            other => panic!("expected StoreCorrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = AppKey::from([0xAB; 16]);
        assert_eq!(format!("{key:?}"), "AppKey(..)");
    }
}

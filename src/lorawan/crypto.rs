//! LoRaWAN 1.0.x cryptographic primitives
//!
//! AES-128 block operation, the CTR-style payload cipher, and the CMAC-based
//! message integrity codes. Pure functions over key bytes; no failure modes —
//! mismatches surface at the MAC layer as `MicInvalid`.
//!
//! Keystream and integrity blocks follow the 1.0.x layout: a tag byte, four
//! zero bytes, the direction, DevAddr and the 32-bit frame counter in
//! little-endian, a zero byte, then the block index (keystream) or message
//! length (MIC).

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

/// Frame direction as encoded into the crypto blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Up = 0,
    Down = 1,
}

/// One AES-128 ECB block operation.
pub fn aes128_block(key: &[u8; 16], input: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::clone_from_slice(input);
    cipher.encrypt_block(&mut block);
    block.into()
}

fn helper_block(tag: u8, direction: Direction, dev_addr: u32, fcnt: u32, last: u8) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0] = tag;
    block[5] = direction as u8;
    block[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    block[10..14].copy_from_slice(&fcnt.to_le_bytes());
    block[15] = last;
    block
}

/// In-place CTR-style FRMPayload cipher. XORs each 16-byte slice with
/// `AES(key, A_i)` where `A_i` carries the block index `i` starting at 1.
/// Self-inverse: applying it twice restores the input.
pub fn payload_crypt(
    key: &[u8; 16],
    dev_addr: u32,
    fcnt: u32,
    direction: Direction,
    buf: &mut [u8],
) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut a = helper_block(0x01, direction, dev_addr, fcnt, 0);
    let mut s = GenericArray::default();

    for (i, chunk) in buf.chunks_mut(16).enumerate() {
        a[15] = (i + 1) as u8;
        s.copy_from_slice(&a);
        cipher.encrypt_block(&mut s);
        for (byte, pad) in chunk.iter_mut().zip(s.iter()) {
            *byte ^= pad;
        }
    }
}

/// Data-frame MIC: first four bytes of `CMAC(key, B0 ‖ msg)`.
pub fn data_mic(
    key: &[u8; 16],
    dev_addr: u32,
    fcnt: u32,
    direction: Direction,
    msg: &[u8],
) -> [u8; 4] {
    let b0 = helper_block(0x49, direction, dev_addr, fcnt, msg.len() as u8);
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
    mac.update(&b0);
    mac.update(msg);
    truncate_mic(&mac.finalize().into_bytes())
}

/// Join-request MIC: CMAC over MHDR ‖ AppEUI ‖ DevEUI ‖ DevNonce with the
/// root AppKey (no B0 prefix on join-procedure frames).
pub fn join_mic(app_key: &[u8; 16], msg: &[u8]) -> [u8; 4] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(app_key));
    mac.update(msg);
    truncate_mic(&mac.finalize().into_bytes())
}

/// Wrap a join-accept body (plaintext body ‖ MIC) for the wire. LoRaWAN runs
/// the accept through the AES *decrypt* direction so constrained devices only
/// ever implement the encrypt primitive.
pub fn join_accept_wrap(app_key: &[u8; 16], body: &mut [u8]) {
    let cipher = Aes128::new(GenericArray::from_slice(app_key));
    for chunk in body.chunks_mut(16) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
}

/// Inverse of [`join_accept_wrap`]: recover the plaintext body ‖ MIC.
pub fn join_accept_unwrap(app_key: &[u8; 16], body: &mut [u8]) {
    let cipher = Aes128::new(GenericArray::from_slice(app_key));
    for chunk in body.chunks_mut(16) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
}

fn truncate_mic(full: &[u8]) -> [u8; 4] {
    let mut mic = [0u8; 4];
    mic.copy_from_slice(&full[0..4]);
    mic
}

#[cfg(test)]
mod tests {
    use super::*;

    // FIPS-197 appendix C.1 known-answer vector.
    #[test]
    fn test_aes128_block_vector() {
        let key: [u8; 16] = hex::decode("000102030405060708090a0b0c0d0e0f")
            .unwrap()
            .try_into()
            .unwrap();
        let input: [u8; 16] = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();
        let expected: [u8; 16] = hex::decode("69c4e0d86a7b0430d8cdb78070b4c55a")
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(aes128_block(&key, &input), expected);
    }

    #[test]
    fn test_payload_crypt_self_inverse() {
        let key = [0x2B; 16];
        let original: Vec<u8> = (0u8..40).collect();
        let mut buf = original.clone();

        payload_crypt(&key, 0x26011BDA, 1, Direction::Up, &mut buf);
        assert_ne!(buf, original, "cipher must actually transform the payload");

        payload_crypt(&key, 0x26011BDA, 1, Direction::Up, &mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn test_payload_crypt_keystream_depends_on_context() {
        let key = [0x11; 16];
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        let mut c = vec![0u8; 16];

        payload_crypt(&key, 0x01020304, 5, Direction::Up, &mut a);
        payload_crypt(&key, 0x01020304, 6, Direction::Up, &mut b);
        payload_crypt(&key, 0x01020304, 5, Direction::Down, &mut c);

        assert_ne!(a, b, "counter must perturb the keystream");
        assert_ne!(a, c, "direction must perturb the keystream");
    }

    #[test]
    fn test_data_mic_is_deterministic_and_context_bound() {
        let key = [0x7E; 16];
        let msg = [0x40, 0xDA, 0x1B, 0x01, 0x26, 0x00, 0x01, 0x00, 0x01, 0xAA];

        let mic = data_mic(&key, 0x26011BDA, 1, Direction::Up, &msg);
        assert_eq!(mic, data_mic(&key, 0x26011BDA, 1, Direction::Up, &msg));
        assert_ne!(mic, data_mic(&key, 0x26011BDA, 2, Direction::Up, &msg));
        assert_ne!(mic, data_mic(&key, 0x26011BDA, 1, Direction::Down, &msg));
        assert_ne!(mic, data_mic(&[0x15; 16], 0x26011BDA, 1, Direction::Up, &msg));
    }

    #[test]
    fn test_join_accept_wrap_roundtrip() {
        let app_key = [0x42; 16];
        let original: Vec<u8> = (0u8..16).collect();
        let mut body = original.clone();

        join_accept_wrap(&app_key, &mut body);
        assert_ne!(body, original);
        join_accept_unwrap(&app_key, &mut body);
        assert_eq!(body, original);
    }
}

// SPDX-License-Identifier: LGPL-3.0-only

use std::cmp::Ordering;

use num_bigint::BigUint;
use zeroize::Zeroize;

use crate::{
    codec::Encoder,
    crypto::{aes128, dh, sha1, sha256},
    utils, OtrError,
};

pub type KeyID = u32;

/// `AkeSecrets` is the full set of secrets derived from the AKE shared secret `s`. With
/// `secbytes` the MPI-encoding of `s` and `h2(b) = SHA256(b ‖ secbytes)`:
///
/// - `ssid`: first 8 bytes of `h2(0x00)`,
/// - `c`, `c'`: first and second half of `h2(0x01)`,
/// - `m1`, `m2`, `m1'`, `m2'`: `h2(0x02)` through `h2(0x05)`.
pub struct AkeSecrets {
    pub ssid: [u8; 8],
    pub c: aes128::Key,
    pub cp: aes128::Key,
    pub m1: [u8; 32],
    pub m2: [u8; 32],
    pub m1p: [u8; 32],
    pub m2p: [u8; 32],
}

impl Drop for AkeSecrets {
    fn drop(&mut self) {
        self.m1.zeroize();
        self.m2.zeroize();
        self.m1p.zeroize();
        self.m2p.zeroize();
    }
}

impl AkeSecrets {
    pub fn derive(shared_secret: &dh::SharedSecret) -> Self {
        let secbytes = Encoder::new().write_mpi(shared_secret).to_vec();
        let h2ssid = h2(0x00, &secbytes);
        let h2c = h2(0x01, &secbytes);
        Self {
            ssid: h2ssid[..8].try_into().unwrap(),
            c: aes128::Key(h2c[..16].try_into().unwrap()),
            cp: aes128::Key(h2c[16..].try_into().unwrap()),
            m1: h2(0x02, &secbytes),
            m2: h2(0x03, &secbytes),
            m1p: h2(0x04, &secbytes),
            m2p: h2(0x05, &secbytes),
        }
    }
}

fn h2(b: u8, secbytes: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(secbytes.len() + 1);
    data.push(b);
    data.extend_from_slice(secbytes);
    let digest = sha256::digest(&data);
    data.zeroize();
    digest
}

/// Per-message encryption and authentication keys for one (sender key, receiver key) pair. The
/// party with the numerically greater public key sends with byte `0x01` and receives with `0x02`,
/// the other party uses the bytes the other way around. With `h1(b) = SHA1(b ‖ secbytes)`: the
/// AES key is the first 16 bytes of `h1(sendbyte)` and the MAC key is the SHA1 of the AES key.
pub struct MessageKeys {
    pub send_aes: aes128::Key,
    pub send_mac: [u8; 20],
    pub recv_aes: aes128::Key,
    pub recv_mac: [u8; 20],
}

impl Drop for MessageKeys {
    fn drop(&mut self) {
        self.send_mac.zeroize();
        self.recv_mac.zeroize();
    }
}

impl MessageKeys {
    pub fn derive(our_public: &BigUint, their_public: &BigUint, secret: &dh::SharedSecret) -> Self {
        let mut secbytes = Encoder::new().write_mpi(secret).to_vec();
        let (sendbyte, recvbyte) = if our_public > their_public {
            (0x01u8, 0x02u8)
        } else {
            (0x02u8, 0x01u8)
        };
        let send_aes = aes128::Key(h1(sendbyte, &secbytes)[..16].try_into().unwrap());
        let recv_aes = aes128::Key(h1(recvbyte, &secbytes)[..16].try_into().unwrap());
        secbytes.zeroize();
        let send_mac = sha1::digest(&send_aes.0);
        let recv_mac = sha1::digest(&recv_aes.0);
        Self {
            send_aes,
            send_mac,
            recv_aes,
            recv_mac,
        }
    }
}

fn h1(b: u8, secbytes: &[u8]) -> [u8; 20] {
    let mut data = Vec::with_capacity(secbytes.len() + 1);
    data.push(b);
    data.extend_from_slice(secbytes);
    let digest = sha1::digest(&data);
    data.zeroize();
    digest
}

/// `extra_symmetric_key` derives the out-of-band symmetric key from the current shared secret:
/// `SHA256(0xFF ‖ secbytes)`.
pub fn extra_symmetric_key(secret: &dh::SharedSecret) -> [u8; 32] {
    let mut secbytes = Encoder::new().write_mpi(secret).to_vec();
    let key = h2(0xff, &secbytes);
    secbytes.zeroize();
    key
}

/// `KeyManager` maintains both our rotating DH keypairs and the public keys received from the
/// other party, together with the monotonic counters and the bookkeeping of MAC keys that must
/// eventually be revealed.
pub struct KeyManager {
    ours: KeypairRotation,
    theirs: PublicKeyRotation,
    /// Counters per key pairing, indexed by our key slot, then their key slot. A counter resets
    /// only when the key in its slot is replaced, so messages of a still-valid pairing can never
    /// be replayed.
    send_ctr: [[Counter; NUM_KEYS]; NUM_KEYS],
    recv_ctr: [[Counter; NUM_KEYS]; NUM_KEYS],
    /// MAC keys that have authenticated traffic and must be revealed after key rotation.
    used_macs: Vec<[u8; 20]>,
    /// MAC keys ready to be revealed now that rotation has occurred.
    old_macs: Vec<u8>,
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.old_macs.clear();
    }
}

impl KeyManager {
    pub fn new(ours: (KeyID, dh::Keypair), theirs: (KeyID, BigUint)) -> Self {
        assert_ne!(0, ours.0);
        assert_ne!(0, theirs.0);
        Self {
            ours: KeypairRotation::new(ours.0, ours.1),
            theirs: PublicKeyRotation::new(theirs.0, theirs.1),
            send_ctr: [
                [Counter::new(), Counter::new()],
                [Counter::new(), Counter::new()],
            ],
            recv_ctr: [
                [Counter::new(), Counter::new()],
                [Counter::new(), Counter::new()],
            ],
            used_macs: Vec::new(),
            old_macs: Vec::new(),
        }
    }

    pub fn current_keys(&self) -> (KeyID, &dh::Keypair) {
        self.ours.current()
    }

    pub fn next_keys(&self) -> (KeyID, &dh::Keypair) {
        self.ours.next()
    }

    pub fn acknowledge_ours(&mut self, key_id: KeyID) -> Result<(), OtrError> {
        if self.ours.acknowledge(key_id)? {
            self.reveal_used_mac_keys();
            // rotation replaced the keypair in the slot following the acknowledged one
            self.reset_counters_ours((key_id as usize + 1) % NUM_KEYS);
        }
        Ok(())
    }

    pub fn their_current(&self) -> (KeyID, &BigUint) {
        self.theirs.current()
    }

    pub fn register_their_key(&mut self, key_id: KeyID, key: BigUint) -> Result<(), OtrError> {
        if self.theirs.register(key_id, key)? {
            self.reveal_used_mac_keys();
            self.reset_counters_theirs(key_id as usize % NUM_KEYS);
        }
        Ok(())
    }

    /// `sending_keys` derives the message keys for the current acknowledged pairing. These are
    /// used to encrypt and authenticate the next outgoing data message.
    pub fn sending_keys(&self) -> MessageKeys {
        let (_, keypair) = self.ours.current();
        let (_, their_public) = self.theirs.current();
        MessageKeys::derive(
            &keypair.public,
            their_public,
            &keypair.shared_secret(their_public),
        )
    }

    /// `receiving_keys` derives message keys for the key ids named in a received data message.
    pub fn receiving_keys(
        &self,
        our_keyid: KeyID,
        their_keyid: KeyID,
    ) -> Result<MessageKeys, OtrError> {
        let keypair = self.ours.select(our_keyid)?;
        let their_public = self.theirs.select(their_keyid)?;
        Ok(MessageKeys::derive(
            &keypair.public,
            their_public,
            &keypair.shared_secret(their_public),
        ))
    }

    pub fn current_shared_secret(&self) -> dh::SharedSecret {
        let (_, keypair) = self.ours.current();
        let (_, their_public) = self.theirs.current();
        keypair.shared_secret(their_public)
    }

    /// `verify_counter` checks the received counter against the pairing named in the message.
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn verify_counter(
        &mut self,
        our_keyid: KeyID,
        their_keyid: KeyID,
        ctr: &[u8; COUNTER_HALF_LEN],
    ) -> Result<(), OtrError> {
        self.recv_ctr[our_keyid as usize % NUM_KEYS][their_keyid as usize % NUM_KEYS].verify(ctr)
    }

    /// `take_counter` produces the next counter value for the current sending pairing.
    pub fn take_counter(&mut self) -> [u8; COUNTER_HALF_LEN] {
        let ours = self.ours.current().0 as usize % NUM_KEYS;
        let theirs = self.theirs.current().0 as usize % NUM_KEYS;
        self.send_ctr[ours][theirs].take()
    }

    pub fn register_used_mac_key(&mut self, mac: [u8; 20]) {
        if !self.used_macs.iter().any(|m| *m == mac) {
            self.used_macs.push(mac);
        }
    }

    fn reveal_used_mac_keys(&mut self) {
        for m in &self.used_macs {
            self.old_macs.extend(m);
        }
        self.used_macs.clear();
        assert_eq!(0, self.old_macs.len() % 20);
    }

    /// `take_reveal_macs` drains the MAC keys that are due for publication. They are attached to
    /// the next outgoing data message.
    pub fn take_reveal_macs(&mut self) -> Vec<u8> {
        let reveal_macs = std::mem::take(&mut self.old_macs);
        assert_eq!(0, reveal_macs.len() % 20);
        reveal_macs
    }

    fn reset_counters_ours(&mut self, idx: usize) {
        for theirs in 0..NUM_KEYS {
            self.send_ctr[idx][theirs].reset();
            self.recv_ctr[idx][theirs].reset();
        }
    }

    fn reset_counters_theirs(&mut self, idx: usize) {
        for ours in 0..NUM_KEYS {
            self.send_ctr[ours][idx].reset();
            self.recv_ctr[ours][idx].reset();
        }
    }
}

/// Number of keys kept per party before rotating away and forgetting forever.
const NUM_KEYS: usize = 2;

/// `KeypairRotation` manages the rotation of our own DH keypairs.
///
/// Only the last acknowledged key id needs storing: the next key id is always `acknowledged + 1`.
/// OTR requires in-order delivery, so the moment a new public key is acknowledged the oldest
/// keypair can be forgotten.
struct KeypairRotation {
    keys: [dh::Keypair; NUM_KEYS],
    acknowledged: KeyID,
}

impl Drop for KeypairRotation {
    fn drop(&mut self) {
        self.acknowledged = 0;
    }
}

impl KeypairRotation {
    fn new(initial_keyid: KeyID, initial_key: dh::Keypair) -> Self {
        assert_ne!(0, initial_keyid);
        dh::verify_element(&initial_key.public).expect("BUG: public key must be valid");
        let mut keys: [dh::Keypair; NUM_KEYS] = [dh::Keypair::generate(), dh::Keypair::generate()];
        keys[initial_keyid as usize % NUM_KEYS] = initial_key;
        Self {
            keys,
            acknowledged: initial_keyid,
        }
    }

    fn current(&self) -> (KeyID, &dh::Keypair) {
        let idx = (self.acknowledged as usize) % NUM_KEYS;
        (self.acknowledged, &self.keys[idx])
    }

    fn next(&self) -> (KeyID, &dh::Keypair) {
        let idx = (self.acknowledged as usize + 1) % NUM_KEYS;
        (self.acknowledged + 1, &self.keys[idx])
    }

    fn select(&self, key_id: KeyID) -> Result<&dh::Keypair, OtrError> {
        assert_ne!(0, key_id);
        if self.acknowledged == key_id || self.acknowledged + 1 == key_id {
            // Either the acknowledged key id, or the next key id in the message that acknowledges
            // it. Anything else is a violation.
            Ok(&self.keys[key_id as usize % NUM_KEYS])
        } else {
            Err(OtrError::ProtocolViolation(
                "key id of requested key is neither current nor next",
            ))
        }
    }

    /// Acknowledge that `key_id` was named in a return message from the other party. Key ids may
    /// be acknowledged repeatedly as long as only the current or next id is named. Returns `true`
    /// when rotation occurred.
    fn acknowledge(&mut self, key_id: KeyID) -> Result<bool, OtrError> {
        if key_id == self.acknowledged {
            Ok(false)
        } else if key_id == self.acknowledged + 1 {
            self.acknowledged = key_id;
            self.keys[(self.acknowledged as usize + 1) % NUM_KEYS] = dh::Keypair::generate();
            Ok(true)
        } else {
            Err(OtrError::ProtocolViolation("unexpected key id to confirm"))
        }
    }
}

/// Rotation of the other party's DH public keys.
struct PublicKeyRotation {
    keys: [BigUint; NUM_KEYS],
    id: KeyID,
}

impl Drop for PublicKeyRotation {
    fn drop(&mut self) {
        self.id = 0;
        self.keys = [BigUint::from(0u8), BigUint::from(0u8)];
    }
}

impl PublicKeyRotation {
    fn new(key_id: KeyID, public_key: BigUint) -> Self {
        assert_ne!(0, key_id);
        assert_ne!(BigUint::from(0u8), public_key);
        let mut keys: [BigUint; NUM_KEYS] = [BigUint::from(0u8), BigUint::from(0u8)];
        keys[key_id as usize % NUM_KEYS] = public_key;
        Self { keys, id: key_id }
    }

    fn current(&self) -> (KeyID, &BigUint) {
        (self.id, &self.keys[self.id as usize % NUM_KEYS])
    }

    fn select(&self, key_id: KeyID) -> Result<&BigUint, OtrError> {
        assert_ne!(0, key_id);
        if self.id == key_id || (self.id > 1 && self.id - 1 == key_id) {
            // Either the current key id, or the previous one in a message sent before our latest
            // key reached the other party.
            Ok(&self.keys[key_id as usize % NUM_KEYS])
        } else {
            Err(OtrError::ProtocolViolation(
                "key id of requested key is neither current nor previous",
            ))
        }
    }

    /// Register the next DH public key. `true` indicates a new key was registered, `false` that
    /// the key was already known.
    fn register(&mut self, next_id: KeyID, next_key: BigUint) -> Result<bool, OtrError> {
        assert_ne!(0, next_id);
        assert_ne!(BigUint::from(0u8), next_key);
        if self.id == next_id {
            if self.keys[(self.id as usize) % NUM_KEYS] == next_key {
                Ok(false)
            } else {
                Err(OtrError::ProtocolViolation(
                    "different keys provided for same key id",
                ))
            }
        } else if self.id + 1 == next_id {
            let idx = (self.id as usize + 1) % NUM_KEYS;
            self.keys[idx] = next_key;
            self.id = next_id;
            Ok(true)
        } else {
            Err(OtrError::ProtocolViolation("unexpected next public key id"))
        }
    }
}

/// Sending or receiving counter. The transmitted value must be non-zero and strictly increasing
/// for a given key pairing:
/// - verify: requires the received value to be strictly greater than internal state,
/// - take: increments internal state before producing the value.
struct Counter([u8; COUNTER_HALF_LEN]);

impl Drop for Counter {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

impl Counter {
    fn new() -> Counter {
        Counter([0u8; COUNTER_HALF_LEN])
    }

    fn reset(&mut self) {
        self.0 = [0u8; COUNTER_HALF_LEN];
    }

    #[allow(clippy::trivially_copy_pass_by_ref)]
    fn verify(&mut self, ctr: &[u8; COUNTER_HALF_LEN]) -> Result<(), OtrError> {
        if utils::bytes::all_zero(ctr) {
            return Err(OtrError::ProtocolViolation("counter value cannot be all-zero"));
        }
        match utils::bytes::compare(ctr, &self.0) {
            Ordering::Greater => {
                self.0 = *ctr;
                Ok(())
            }
            Ordering::Less | Ordering::Equal => Err(OtrError::ProtocolViolation(
                "counter value must be strictly larger than previous value",
            )),
        }
    }

    fn take(&mut self) -> [u8; COUNTER_HALF_LEN] {
        for idx in (0..COUNTER_HALF_LEN).rev() {
            let (value, carry) = self.0[idx].overflowing_add(1);
            self.0[idx] = value;
            if carry {
                continue;
            }
            assert!(utils::bytes::any_nonzero(&self.0));
            return self.0;
        }
        panic!("BUG: counter value wrapped around completely")
    }
}

pub const COUNTER_HALF_LEN: usize = 8;

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use super::{extra_symmetric_key, AkeSecrets, Counter, KeyManager, MessageKeys};
    use crate::crypto::dh;

    #[test]
    fn test_counter_take_produces_increasing_values() {
        let mut ctr = Counter::new();
        let first = ctr.take();
        let second = ctr.take();
        assert_eq!([0, 0, 0, 0, 0, 0, 0, 1], first);
        assert_eq!([0, 0, 0, 0, 0, 0, 0, 2], second);
    }

    #[test]
    fn test_counter_verify_rejects_zero_and_replay() {
        let mut ctr = Counter::new();
        assert!(ctr.verify(&[0u8; 8]).is_err());
        assert!(ctr.verify(&[0, 0, 0, 0, 0, 0, 0, 5]).is_ok());
        assert!(ctr.verify(&[0, 0, 0, 0, 0, 0, 0, 5]).is_err());
        assert!(ctr.verify(&[0, 0, 0, 0, 0, 0, 0, 4]).is_err());
        assert!(ctr.verify(&[0, 0, 0, 0, 0, 0, 0, 6]).is_ok());
    }

    #[test]
    fn test_ake_secrets_derivation_is_deterministic() {
        let secret = BigUint::from(0x1234_5678_9abc_def0_u64);
        let s1 = AkeSecrets::derive(&secret);
        let s2 = AkeSecrets::derive(&secret);
        assert_eq!(s1.ssid, s2.ssid);
        assert_eq!(s1.m1, s2.m1);
        assert_ne!(s1.m1, s1.m2);
        assert_ne!(s1.c.0, s1.cp.0);
    }

    #[test]
    fn test_message_keys_mirror_between_parties() {
        let alice = dh::Keypair::generate();
        let bob = dh::Keypair::generate();
        let secret_a = alice.shared_secret(&bob.public);
        let secret_b = bob.shared_secret(&alice.public);
        assert_eq!(secret_a, secret_b);
        let keys_a = MessageKeys::derive(&alice.public, &bob.public, &secret_a);
        let keys_b = MessageKeys::derive(&bob.public, &alice.public, &secret_b);
        assert_eq!(keys_a.send_aes.0, keys_b.recv_aes.0);
        assert_eq!(keys_a.recv_aes.0, keys_b.send_aes.0);
        assert_eq!(keys_a.send_mac, keys_b.recv_mac);
        assert_eq!(keys_a.recv_mac, keys_b.send_mac);
        assert_eq!(
            extra_symmetric_key(&secret_a),
            extra_symmetric_key(&secret_b)
        );
    }

    #[test]
    fn test_keymanager_rotation() {
        let ours = dh::Keypair::generate();
        let theirs = dh::Keypair::generate();
        let mut manager = KeyManager::new((1, ours), (1, theirs.public.clone()));
        assert_eq!(1, manager.current_keys().0);
        assert_eq!(2, manager.next_keys().0);
        // acknowledging the current id is a no-op, the next id rotates
        manager.acknowledge_ours(1).unwrap();
        assert_eq!(1, manager.current_keys().0);
        manager.acknowledge_ours(2).unwrap();
        assert_eq!(2, manager.current_keys().0);
        assert!(manager.acknowledge_ours(5).is_err());
        // their key registration follows the same discipline
        let next_theirs = dh::Keypair::generate();
        manager.register_their_key(2, next_theirs.public.clone()).unwrap();
        assert_eq!(2, manager.their_current().0);
        assert!(manager.register_their_key(7, next_theirs.public.clone()).is_err());
    }

    #[test]
    fn test_counters_survive_rotation_of_unrelated_slot() {
        let ours = dh::Keypair::generate();
        let theirs = dh::Keypair::generate();
        let mut manager = KeyManager::new((1, ours), (1, theirs.public.clone()));
        manager.verify_counter(1, 1, &[0, 0, 0, 0, 0, 0, 0, 1]).unwrap();
        // registering their next key resets only the pairings that involve it
        let next_theirs = dh::Keypair::generate();
        manager.register_their_key(2, next_theirs.public.clone()).unwrap();
        assert!(manager.verify_counter(1, 1, &[0, 0, 0, 0, 0, 0, 0, 1]).is_err());
        manager.verify_counter(1, 2, &[0, 0, 0, 0, 0, 0, 0, 1]).unwrap();
    }

    #[test]
    fn test_used_macs_revealed_after_rotation() {
        let ours = dh::Keypair::generate();
        let theirs = dh::Keypair::generate();
        let mut manager = KeyManager::new((1, ours), (1, theirs.public.clone()));
        manager.register_used_mac_key([7u8; 20]);
        manager.register_used_mac_key([7u8; 20]);
        assert!(manager.take_reveal_macs().is_empty());
        manager.acknowledge_ours(2).unwrap();
        let revealed = manager.take_reveal_macs();
        assert_eq!(20, revealed.len());
        assert_eq!(vec![7u8; 20], revealed);
        assert!(manager.take_reveal_macs().is_empty());
    }
}

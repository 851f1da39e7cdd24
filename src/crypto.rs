// SPDX-License-Identifier: LGPL-3.0-only

use ring::rand::SecureRandom;

#[derive(Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// A MAC, hash, signature or proof failed verification.
    VerificationFailure(&'static str),
    /// A value is outside the range the protocol permits.
    IllegalValue(&'static str),
    /// The underlying algorithm implementation refused the operation.
    Failure(&'static str),
}

/// `random` fills `dest` with bytes from the system's secure random generator.
pub fn random(dest: &mut [u8]) {
    static RAND: once_cell::sync::Lazy<ring::rand::SystemRandom> =
        once_cell::sync::Lazy::new(ring::rand::SystemRandom::new);
    RAND.fill(dest)
        .expect("failed to acquire random bytes from the system");
}

pub mod constant {
    use super::CryptoError;

    /// `verify` compares two byte-slices in constant time.
    pub fn verify(expected: &[u8], actual: &[u8]) -> Result<(), CryptoError> {
        ring::constant_time::verify_slices_are_equal(expected, actual)
            .map_err(|_| CryptoError::VerificationFailure("byte-sequences are not equal"))
    }
}

pub mod sha1 {
    pub const DIGEST_LEN: usize = 20;

    pub fn digest(data: &[u8]) -> [u8; DIGEST_LEN] {
        let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, data);
        let mut result = [0u8; DIGEST_LEN];
        result.copy_from_slice(digest.as_ref());
        result
    }

    /// `hmac` computes the HMAC-SHA1 authenticator used on OTR data messages.
    pub fn hmac(key: &[u8], data: &[u8]) -> [u8; DIGEST_LEN] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
        let tag = ring::hmac::sign(&key, data);
        let mut result = [0u8; DIGEST_LEN];
        result.copy_from_slice(tag.as_ref());
        result
    }
}

pub mod sha256 {
    pub const DIGEST_LEN: usize = 32;

    pub fn digest(data: &[u8]) -> [u8; DIGEST_LEN] {
        let digest = ring::digest::digest(&ring::digest::SHA256, data);
        let mut result = [0u8; DIGEST_LEN];
        result.copy_from_slice(digest.as_ref());
        result
    }

    /// `hmac` computes the full HMAC-SHA256 value, keyed e.g. with `m1` during the AKE.
    pub fn hmac(key: &[u8], data: &[u8]) -> [u8; DIGEST_LEN] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, key);
        let tag = ring::hmac::sign(&key, data);
        let mut result = [0u8; DIGEST_LEN];
        result.copy_from_slice(tag.as_ref());
        result
    }

    /// `hmac160` computes HMAC-SHA256 truncated to its first 160 bits, keyed e.g. with `m2`.
    pub fn hmac160(key: &[u8], data: &[u8]) -> [u8; 20] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, key);
        let tag = ring::hmac::sign(&key, data);
        let mut result = [0u8; 20];
        result.copy_from_slice(&tag.as_ref()[..20]);
        result
    }
}

pub mod aes128 {
    use aes_ctr::{
        cipher::{generic_array::GenericArray, NewStreamCipher, SyncStreamCipher},
        Aes128Ctr,
    };

    use super::random;

    pub const KEY_LEN: usize = 16;

    /// 128-bit AES key. The raw bytes are wiped when the key is dropped.
    #[derive(Clone)]
    pub struct Key(pub [u8; KEY_LEN]);

    impl Drop for Key {
        fn drop(&mut self) {
            self.0.fill(0);
        }
    }

    impl Key {
        pub fn generate() -> Self {
            let mut key = [0u8; KEY_LEN];
            random(&mut key);
            Self(key)
        }

        pub fn encrypt(&self, nonce: &[u8; 16], data: &[u8]) -> Vec<u8> {
            self.crypt(nonce, data)
        }

        pub fn decrypt(&self, nonce: &[u8; 16], data: &[u8]) -> Vec<u8> {
            self.crypt(nonce, data)
        }

        /// CTR mode is an xor-stream, hence a single function for both directions.
        fn crypt(&self, nonce: &[u8; 16], data: &[u8]) -> Vec<u8> {
            let mut result = Vec::from(data);
            let key = GenericArray::from_slice(&self.0);
            let nonce = GenericArray::from_slice(nonce);
            let mut cipher = Aes128Ctr::new(key, nonce);
            cipher.apply_keystream(result.as_mut_slice());
            result
        }
    }
}

pub mod dh {
    use num_bigint::{BigUint, ModInverse};
    use once_cell::sync::Lazy;
    use zeroize::Zeroize;

    use super::{random, CryptoError};

    /// GENERATOR (g): 2
    pub static GENERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u8));

    /// The 1536-bit MODP group modulus (RFC 3526, group 5) prescribed by OTR.
    pub static MODULUS: Lazy<BigUint> = Lazy::new(|| {
        BigUint::from_bytes_be(&[
            0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2, 0x21, 0x68,
            0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1, 0x29, 0x02, 0x4E, 0x08,
            0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6, 0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A,
            0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD, 0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B,
            0x30, 0x2B, 0x0A, 0x6D, 0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51,
            0xC2, 0x45, 0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
            0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF, 0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED, 0xEE, 0x38,
            0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, 0xAE, 0x9F, 0x24, 0x11, 0x7C, 0x4B, 0x1F, 0xE6,
            0x49, 0x28, 0x66, 0x51, 0xEC, 0xE4, 0x5B, 0x3D, 0xC2, 0x00, 0x7C, 0xB8, 0xA1, 0x63,
            0xBF, 0x05, 0x98, 0xDA, 0x48, 0x36, 0x1C, 0x55, 0xD3, 0x9A, 0x69, 0x16, 0x3F, 0xA8,
            0xFD, 0x24, 0xCF, 0x5F, 0x83, 0x65, 0x5D, 0x23, 0xDC, 0xA3, 0xAD, 0x96, 0x1C, 0x62,
            0xF3, 0x56, 0x20, 0x85, 0x52, 0xBB, 0x9E, 0xD5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6D,
            0x67, 0x0C, 0x35, 0x4E, 0x4A, 0xBC, 0x98, 0x04, 0xF1, 0x74, 0x6C, 0x08, 0xCA, 0x23,
            0x73, 0x27, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
        ])
    });

    static MODULUS_MINUS_TWO: Lazy<BigUint> = Lazy::new(|| &*MODULUS - 2u8);

    /// Prime order of the subgroup used by SMP exponents: `q = (p - 1) / 2`.
    pub static ORDER: Lazy<BigUint> = Lazy::new(|| (&*MODULUS - 1u8) >> 1);

    /// Private exponents are required to have at least 320 bits.
    const PRIVATE_EXPONENT_BYTES: usize = 40;

    /// `verify_exponent` checks that an exponent received as part of a zero-knowledge proof is an
    /// element of `[1, q)`.
    pub fn verify_exponent(component: &BigUint) -> Result<(), CryptoError> {
        if component >= &BigUint::from(1u8) && component < &*ORDER {
            Ok(())
        } else {
            Err(CryptoError::IllegalValue("exponent outside of range [1,q)"))
        }
    }

    /// `verify_element` checks that a received group element lies in `[2, modulus-2]`.
    pub fn verify_element(element: &BigUint) -> Result<(), CryptoError> {
        if element >= &*GENERATOR && element <= &*MODULUS_MINUS_TWO {
            Ok(())
        } else {
            Err(CryptoError::IllegalValue(
                "group element outside of range [2, modulus-2]",
            ))
        }
    }

    /// `random_exponent` produces a random value suitable as private DH exponent or as blinding
    /// exponent in SMP proofs.
    pub fn random_exponent() -> BigUint {
        let mut bytes = [0u8; 192];
        random(&mut bytes);
        let value = BigUint::from_bytes_be(&bytes);
        bytes.zeroize();
        value
    }

    /// `inverse` computes the multiplicative inverse of `v` modulo the group modulus.
    pub fn inverse(v: &BigUint) -> Result<BigUint, CryptoError> {
        v.mod_inverse(&*MODULUS)
            .and_then(|inv| inv.to_biguint())
            .ok_or(CryptoError::IllegalValue("value has no inverse mod p"))
    }

    /// Ephemeral DH keypair. The private exponent is wiped on drop; keypairs are never persisted.
    #[derive(Clone)]
    pub struct Keypair {
        private: BigUint,
        pub public: BigUint,
    }

    impl Drop for Keypair {
        fn drop(&mut self) {
            self.private.zeroize();
        }
    }

    impl Keypair {
        pub fn generate() -> Self {
            let mut bytes = [0u8; PRIVATE_EXPONENT_BYTES];
            random(&mut bytes);
            let private = BigUint::from_bytes_be(&bytes);
            bytes.zeroize();
            let public = GENERATOR.modpow(&private, &MODULUS);
            Self { private, public }
        }

        /// `shared_secret` performs the DH combine with the peer's public key. The caller is
        /// responsible for having verified the public key.
        pub fn shared_secret(&self, their_public: &BigUint) -> SharedSecret {
            their_public.modpow(&self.private, &MODULUS)
        }
    }

    pub type SharedSecret = BigUint;
}

pub mod dsa {
    use dsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
    use dsa::{Components, KeySize, SigningKey, VerifyingKey};
    use num_bigint::BigUint;
    use rand_core::OsRng;

    use crate::codec::Encoder;

    use super::{sha1, CryptoError};

    pub const SIGNATURE_LEN: usize = 40;
    pub const PARAM_Q_LEN: usize = 20;
    pub const FINGERPRINT_LEN: usize = 20;

    /// Long-term DSA (1024/160) keypair used to authenticate the AKE. Owned by the host
    /// application, which decides on persistence and regeneration.
    #[derive(Clone)]
    pub struct Keypair {
        key: SigningKey,
    }

    impl Keypair {
        /// `generate` produces a new long-term DSA-1024/160 keypair.
        pub fn generate() -> Self {
            let components = Components::generate(&mut OsRng, KeySize::DSA_1024_160);
            Self {
                key: SigningKey::generate(&mut OsRng, components),
            }
        }

        pub fn public_key(&self) -> PublicKey {
            PublicKey {
                key: self.key.verifying_key().clone(),
            }
        }

        pub fn q(&self) -> &BigUint {
            self.key.verifying_key().components().q()
        }

        /// `sign` signs a 20-byte prehash. Per OTR, the prehash is the hash value reduced mod `q`
        /// rather than truncated, and is not hashed again.
        pub fn sign(&self, prehash: &[u8; PARAM_Q_LEN]) -> Result<Signature, CryptoError> {
            let sig = self
                .key
                .sign_prehash(prehash)
                .map_err(|_| CryptoError::Failure("DSA signing failed"))?;
            Ok(Signature(sig))
        }
    }

    #[derive(Clone, PartialEq, Debug)]
    pub struct PublicKey {
        key: VerifyingKey,
    }

    impl PublicKey {
        pub fn from_components(
            p: BigUint,
            q: BigUint,
            g: BigUint,
            y: BigUint,
        ) -> Result<Self, CryptoError> {
            let components = Components::from_components(p, q, g)
                .map_err(|_| CryptoError::IllegalValue("illegal DSA group parameters"))?;
            let key = VerifyingKey::from_components(components, y)
                .map_err(|_| CryptoError::IllegalValue("illegal DSA public key"))?;
            Ok(Self { key })
        }

        pub fn p(&self) -> &BigUint {
            self.key.components().p()
        }

        pub fn q(&self) -> &BigUint {
            self.key.components().q()
        }

        pub fn g(&self) -> &BigUint {
            self.key.components().g()
        }

        pub fn y(&self) -> &BigUint {
            self.key.y()
        }

        pub fn verify(
            &self,
            signature: &Signature,
            prehash: &[u8; PARAM_Q_LEN],
        ) -> Result<(), CryptoError> {
            self.key
                .verify_prehash(prehash, &signature.0)
                .map_err(|_| CryptoError::VerificationFailure("DSA signature does not verify"))
        }

        /// `fingerprint` computes the SHA-1 fingerprint over the serialized public key without
        /// its two-byte key-type prefix.
        pub fn fingerprint(&self) -> [u8; FINGERPRINT_LEN] {
            let encoded = Encoder::new()
                .write_mpi(self.p())
                .write_mpi(self.q())
                .write_mpi(self.g())
                .write_mpi(self.y())
                .to_vec();
            sha1::digest(&encoded)
        }

        /// `fingerprint_hex` is the fingerprint in the lowercase hexadecimal form commonly shown
        /// to users.
        pub fn fingerprint_hex(&self) -> String {
            hex::encode(self.fingerprint())
        }
    }

    #[derive(Clone, Debug)]
    pub struct Signature(dsa::Signature);

    impl Signature {
        pub fn from_components(r: BigUint, s: BigUint) -> Result<Self, CryptoError> {
            dsa::Signature::from_components(r, s)
                .map(Signature)
                .map_err(|_| CryptoError::IllegalValue("illegal DSA signature components"))
        }

        pub fn r(&self) -> &BigUint {
            self.0.r()
        }

        pub fn s(&self) -> &BigUint {
            self.0.s()
        }
    }
}

// SPDX-License-Identifier: LGPL-3.0-only

use std::rc::Rc;

use num_bigint::BigUint;
use num_integer::Integer;

use crate::{
    codec::{Decoder, Encodable, Encoder, MAC_LEN},
    crypto::{aes128, constant, dh, dsa, CryptoError},
    keys::AkeSecrets,
    message::MessageBody,
    utils, Host, OtrError, Version,
};

/// The AKE always uses key id 1 for both parties.
const KEYID_INITIAL: u32 = 1;

/// `AkeContext` runs the authenticated key exchange for a single instance. A context is created
/// per protocol version once version negotiation has settled.
pub struct AkeContext {
    version: Version,
    host: Rc<dyn Host>,
    state: AkeState,
}

impl AkeContext {
    pub fn new(host: Rc<dyn Host>, version: Version) -> Self {
        assert!(matches!(version, Version::V2 | Version::V3));
        Self {
            version,
            host,
            state: AkeState::None,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// `initiate` starts a fresh key exchange by producing a DH-Commit message: our `g^x` is sent
    /// encrypted under a random key `r` together with its hash, committing to the value without
    /// revealing it.
    pub fn initiate(&mut self) -> MessageBody {
        log::info!("initiating key exchange");
        let keypair = dh::Keypair::generate();
        let r = aes128::Key::generate();
        let gxmpi = Encoder::new().write_mpi(&keypair.public).to_vec();
        let gx_encrypted = r.encrypt(&[0; 16], &gxmpi);
        let gx_hashed = crate::crypto::sha256::digest(&gxmpi).to_vec();
        self.state = AkeState::AwaitingDHKey(AwaitingDHKey {
            our_dh_keypair: Rc::new(keypair),
            r,
        });
        MessageBody::DHCommit(DHCommitMessage {
            gx_encrypted,
            gx_hashed,
        })
    }

    /// `transfer` duplicates the context for the case that a DH-Key response arrives after our
    /// DH-Commit went out with receiver tag zero. Only the `AwaitingDHKey` state can be
    /// transferred, as only there is the actual receiver instance still unknown.
    pub fn transfer(&self) -> Result<AkeContext, AkeError> {
        match &self.state {
            AkeState::AwaitingDHKey(state) => Ok(Self {
                version: self.version,
                host: Rc::clone(&self.host),
                state: AkeState::AwaitingDHKey(AwaitingDHKey {
                    our_dh_keypair: Rc::clone(&state.our_dh_keypair),
                    r: state.r.clone(),
                }),
            }),
            AkeState::None
            | AkeState::AwaitingRevealSignature(_)
            | AkeState::AwaitingSignature(_) => Err(AkeError::IncorrectState),
        }
    }

    pub fn handle_dhcommit(&mut self, msg: DHCommitMessage) -> Result<MessageBody, AkeError> {
        let (result, transition) = match &self.state {
            AkeState::None => Self::respond_with_dhkey(msg),
            AkeState::AwaitingDHKey(state) => {
                // Both parties sent a DH-Commit simultaneously. The symmetry is broken by
                // comparing the hashed gx values as 32-byte unsigned big-endian integers: the
                // higher committer stands by their commit, the lower one yields and answers with
                // a DH-Key message.
                let gxmpi = Encoder::new()
                    .write_mpi(&state.our_dh_keypair.public)
                    .to_vec();
                let our_gxmpi_hashed = crate::crypto::sha256::digest(&gxmpi);
                let our_hash = BigUint::from_bytes_be(&our_gxmpi_hashed);
                let their_hash = BigUint::from_bytes_be(&msg.gx_hashed);
                if our_hash > their_hash {
                    // ignore theirs, resend our own commit
                    let our_gx_encrypted = state.r.encrypt(&[0u8; 16], &gxmpi);
                    let dhcommit = MessageBody::DHCommit(DHCommitMessage {
                        gx_encrypted: our_gx_encrypted,
                        gx_hashed: Vec::from(our_gxmpi_hashed),
                    });
                    (Ok(dhcommit), None)
                } else if our_hash == their_hash {
                    // Equal hashes from distinct random keys do not occur in practice. Drop the
                    // message rather than guess an ordering; a retransmit resolves the stand-off.
                    return Err(AkeError::MessageIgnored);
                } else {
                    // forget our earlier commit and yield
                    Self::respond_with_dhkey(msg)
                }
            }
            AkeState::AwaitingRevealSignature(state) => {
                // Retransmit the same DH-Key message as sent before, but adopt the new commit in
                // place of the old one. This happens when the peer restarts the AKE or resends
                // its DH-Commit, or when the peer is logged in multiple times and several of its
                // clients responded to our query.
                let dhkey = MessageBody::DHKey(DHKeyMessage {
                    gy: state.our_dh_keypair.public.clone(),
                });
                (
                    Ok(dhkey),
                    Some(AkeState::AwaitingRevealSignature(AwaitingRevealSignature {
                        our_dh_keypair: Rc::clone(&state.our_dh_keypair),
                        gx_encrypted: msg.gx_encrypted,
                        gx_hashed: msg.gx_hashed,
                    })),
                )
            }
            AkeState::AwaitingSignature(_) => Self::respond_with_dhkey(msg),
        };
        if let Some(next) = transition {
            self.state = next;
        }
        result
    }

    fn respond_with_dhkey(
        msg: DHCommitMessage,
    ) -> (Result<MessageBody, AkeError>, Option<AkeState>) {
        let keypair = dh::Keypair::generate();
        let dhkey = MessageBody::DHKey(DHKeyMessage {
            gy: keypair.public.clone(),
        });
        (
            Ok(dhkey),
            Some(AkeState::AwaitingRevealSignature(AwaitingRevealSignature {
                our_dh_keypair: Rc::new(keypair),
                gx_encrypted: msg.gx_encrypted,
                gx_hashed: msg.gx_hashed,
            })),
        )
    }

    pub fn handle_dhkey(&mut self, msg: DHKeyMessage) -> Result<MessageBody, AkeError> {
        let (result, transition) = match &self.state {
            AkeState::None | AkeState::AwaitingRevealSignature(_) => {
                return Err(AkeError::MessageIgnored);
            }
            AkeState::AwaitingDHKey(state) => {
                dh::verify_element(&msg.gy).map_err(AkeError::CryptographicViolation)?;
                let s = state.our_dh_keypair.shared_secret(&msg.gy);
                let secrets = AkeSecrets::derive(&s);
                let dsa_keypair = self.host.keypair();
                let pub_b = dsa_keypair.public_key();
                let m_b = crate::crypto::sha256::hmac(
                    &secrets.m1,
                    &Encoder::new()
                        .write_mpi(&state.our_dh_keypair.public)
                        .write_mpi(&msg.gy)
                        .write_public_key(&pub_b)
                        .write_u32(KEYID_INITIAL)
                        .to_vec(),
                );
                let sig_b = dsa_keypair
                    .sign(&signature_prehash(&m_b, dsa_keypair.q()))
                    .map_err(AkeError::CryptographicViolation)?;
                let x_b = Encoder::new()
                    .write_public_key(&pub_b)
                    .write_u32(KEYID_INITIAL)
                    .write_signature(&sig_b)
                    .to_vec();
                let enc_b = secrets.c.encrypt(&[0; 16], &x_b);
                let mac_enc_b = crate::crypto::sha256::hmac160(
                    &secrets.m2,
                    &Encoder::new().write_data(&enc_b).to_vec(),
                );
                let reveal_sig_message = RevealSignatureMessage {
                    key: state.r.clone(),
                    signature_encrypted: enc_b,
                    signature_mac: mac_enc_b,
                };
                (
                    Ok(MessageBody::RevealSignature(reveal_sig_message.clone())),
                    Some(AkeState::AwaitingSignature(AwaitingSignature {
                        our_dh_keypair: Rc::clone(&state.our_dh_keypair),
                        gy: msg.gy,
                        s,
                        previous_message: reveal_sig_message,
                    })),
                )
            }
            AkeState::AwaitingSignature(state) => {
                if state.gy != msg.gy {
                    return Err(AkeError::MessageIgnored);
                }
                // retransmission of the DH-Key we already answered
                (
                    Ok(MessageBody::RevealSignature(state.previous_message.clone())),
                    None,
                )
            }
        };
        if let Some(next) = transition {
            self.state = next;
        }
        result
    }

    #[allow(clippy::needless_pass_by_value, clippy::similar_names)]
    pub fn handle_reveal_signature(
        &mut self,
        msg: RevealSignatureMessage,
    ) -> Result<(CryptographicMaterial, MessageBody), AkeError> {
        let (result, transition) = match &self.state {
            AkeState::None | AkeState::AwaitingDHKey(_) | AkeState::AwaitingSignature(_) => {
                return Err(AkeError::MessageIgnored);
            }
            AkeState::AwaitingRevealSignature(state) => {
                log::debug!("handling reveal-signature message");
                // The revealed key r decrypts the committed gx, which must match the hash from
                // the commit message.
                let gxmpi = msg.key.decrypt(&[0; 16], &state.gx_encrypted);
                let gxmpihash = crate::crypto::sha256::digest(&gxmpi);
                constant::verify(&gxmpihash, &state.gx_hashed)
                    .map_err(AkeError::CryptographicViolation)?;
                let gx = Decoder::new(&gxmpi)
                    .read_mpi()
                    .or(Err(AkeError::DataProcessing("cannot read mpi from gxmpi")))?;
                dh::verify_element(&gx).map_err(AkeError::CryptographicViolation)?;
                log::debug!("gx verified: correct");

                let s = state.our_dh_keypair.shared_secret(&gx);
                let secrets = AkeSecrets::derive(&s);
                let expected_signature_mac = crate::crypto::sha256::hmac160(
                    &secrets.m2,
                    &Encoder::new().write_data(&msg.signature_encrypted).to_vec(),
                );
                constant::verify(&expected_signature_mac, &msg.signature_mac)
                    .map_err(AkeError::CryptographicViolation)?;

                // Bob's identity material from the encrypted x_b.
                let x_b = secrets.c.decrypt(&[0; 16], &msg.signature_encrypted);
                let mut decoder = Decoder::new(&x_b);
                let pub_b = decoder
                    .read_public_key()
                    .or(Err(AkeError::DataProcessing("cannot read public key from x_b")))?;
                let keyid_b = decoder
                    .read_u32()
                    .or(Err(AkeError::DataProcessing("cannot read keyid from x_b")))?;
                utils::u32::nonzero(keyid_b)
                    .ok_or(AkeError::DataProcessing("keyid_b must be non-zero"))?;
                let sig_m_b = decoder
                    .read_signature()
                    .or(Err(AkeError::DataProcessing("cannot read signature from x_b")))?;
                let m_b = crate::crypto::sha256::hmac(
                    &secrets.m1,
                    &Encoder::new()
                        .write_mpi(&gx)
                        .write_mpi(&state.our_dh_keypair.public)
                        .write_public_key(&pub_b)
                        .write_u32(keyid_b)
                        .to_vec(),
                );
                pub_b
                    .verify(&sig_m_b, &signature_prehash(&m_b, pub_b.q()))
                    .map_err(AkeError::CryptographicViolation)?;
                log::debug!("m_b verified: correct");

                let keypair = self.host.keypair();
                let m_a = crate::crypto::sha256::hmac(
                    &secrets.m1p,
                    &Encoder::new()
                        .write_mpi(&state.our_dh_keypair.public)
                        .write_mpi(&gx)
                        .write_public_key(&keypair.public_key())
                        .write_u32(KEYID_INITIAL)
                        .to_vec(),
                );
                let sig_m_a = keypair
                    .sign(&signature_prehash(&m_a, keypair.q()))
                    .map_err(AkeError::CryptographicViolation)?;
                let x_a = Encoder::new()
                    .write_public_key(&keypair.public_key())
                    .write_u32(KEYID_INITIAL)
                    .write_signature(&sig_m_a)
                    .to_vec();
                let encrypted_signature = secrets.cp.encrypt(&[0; 16], &x_a);
                let encrypted_mac = crate::crypto::sha256::hmac160(
                    &secrets.m2p,
                    &Encoder::new().write_data(&encrypted_signature).to_vec(),
                );
                (
                    Ok((
                        CryptographicMaterial {
                            version: self.version,
                            ssid: secrets.ssid,
                            our_dh: (*state.our_dh_keypair).clone(),
                            their_dh: gx,
                            their_dsa: pub_b,
                        },
                        MessageBody::Signature(SignatureMessage {
                            signature_encrypted: encrypted_signature,
                            signature_mac: encrypted_mac,
                        }),
                    )),
                    AkeState::None,
                )
            }
        };
        self.state = transition;
        result
    }

    #[allow(clippy::needless_pass_by_value)]
    pub fn handle_signature(
        &mut self,
        msg: SignatureMessage,
    ) -> Result<CryptographicMaterial, AkeError> {
        let (result, transition) = match &self.state {
            AkeState::None | AkeState::AwaitingDHKey(_) | AkeState::AwaitingRevealSignature(_) => {
                return Err(AkeError::MessageIgnored);
            }
            AkeState::AwaitingSignature(state) => {
                log::debug!("handling signature message");
                let secrets = AkeSecrets::derive(&state.s);
                let mac = crate::crypto::sha256::hmac160(
                    &secrets.m2p,
                    &Encoder::new().write_data(&msg.signature_encrypted).to_vec(),
                );
                constant::verify(&msg.signature_mac, &mac)
                    .map_err(AkeError::CryptographicViolation)?;
                let x_a = secrets.cp.decrypt(&[0; 16], &msg.signature_encrypted);
                let mut decoder = Decoder::new(&x_a);
                let pub_a = decoder
                    .read_public_key()
                    .or(Err(AkeError::DataProcessing("cannot read public key from x_a")))?;
                let keyid_a = decoder
                    .read_u32()
                    .or(Err(AkeError::DataProcessing("cannot read keyid from x_a")))?;
                utils::u32::nonzero(keyid_a)
                    .ok_or(AkeError::DataProcessing("keyid_a must be non-zero"))?;
                let sig_m_a = decoder
                    .read_signature()
                    .or(Err(AkeError::DataProcessing("cannot read signature from x_a")))?;
                decoder
                    .done()
                    .or(Err(AkeError::DataProcessing("data left over in buffer")))?;
                let m_a = crate::crypto::sha256::hmac(
                    &secrets.m1p,
                    &Encoder::new()
                        .write_mpi(&state.gy)
                        .write_mpi(&state.our_dh_keypair.public)
                        .write_public_key(&pub_a)
                        .write_u32(keyid_a)
                        .to_vec(),
                );
                pub_a
                    .verify(&sig_m_a, &signature_prehash(&m_a, pub_a.q()))
                    .map_err(AkeError::CryptographicViolation)?;
                log::debug!("m_a signature verified");
                (
                    Ok(CryptographicMaterial {
                        version: self.version,
                        ssid: secrets.ssid,
                        our_dh: (*state.our_dh_keypair).clone(),
                        their_dh: state.gy.clone(),
                        their_dsa: pub_a,
                    }),
                    AkeState::None,
                )
            }
        };
        self.state = transition;
        result
    }
}

/// The 32-byte HMAC value is taken modulo the DSA subgroup order `q` instead of truncated, and is
/// not hashed again. The result is left-padded to the fixed 20-byte prehash size.
fn signature_prehash(mac: &[u8; 32], q: &BigUint) -> [u8; dsa::PARAM_Q_LEN] {
    let reduced = BigUint::from_bytes_be(mac).mod_floor(q).to_bytes_be();
    assert!(reduced.len() <= dsa::PARAM_Q_LEN);
    let mut prehash = [0u8; dsa::PARAM_Q_LEN];
    prehash[dsa::PARAM_Q_LEN - reduced.len()..].copy_from_slice(&reduced);
    prehash
}

/// `CryptographicMaterial` is the outcome of a completed key exchange. Key ids are always 1 at
/// this point, so they are not included.
pub struct CryptographicMaterial {
    pub version: Version,
    pub ssid: [u8; 8],
    pub our_dh: dh::Keypair,
    pub their_dh: BigUint,
    pub their_dsa: dsa::PublicKey,
}

enum AkeState {
    /// No key exchange in progress.
    None,
    /// DH-Commit sent, expecting the peer's DH-Key.
    AwaitingDHKey(AwaitingDHKey),
    /// DH-Key sent, expecting the peer to reveal its commitment.
    AwaitingRevealSignature(AwaitingRevealSignature),
    /// Reveal-Signature sent, expecting the closing Signature message.
    AwaitingSignature(AwaitingSignature),
}

struct AwaitingDHKey {
    r: aes128::Key,
    our_dh_keypair: Rc<dh::Keypair>,
}

struct AwaitingRevealSignature {
    our_dh_keypair: Rc<dh::Keypair>,
    gx_encrypted: Vec<u8>,
    gx_hashed: Vec<u8>,
}

struct AwaitingSignature {
    our_dh_keypair: Rc<dh::Keypair>,
    gy: BigUint,
    s: dh::SharedSecret,
    previous_message: RevealSignatureMessage,
}

pub struct DHCommitMessage {
    pub gx_encrypted: Vec<u8>,
    pub gx_hashed: Vec<u8>,
}

impl Encodable for DHCommitMessage {
    fn encode(&self, encoder: &mut Encoder) {
        encoder
            .write_data(&self.gx_encrypted)
            .write_data(&self.gx_hashed);
    }
}

impl DHCommitMessage {
    pub fn decode(decoder: &mut Decoder) -> Result<DHCommitMessage, OtrError> {
        Ok(DHCommitMessage {
            gx_encrypted: decoder.read_data()?,
            gx_hashed: decoder.read_data()?,
        })
    }
}

pub struct DHKeyMessage {
    pub gy: BigUint,
}

impl Encodable for DHKeyMessage {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_mpi(&self.gy);
    }
}

impl DHKeyMessage {
    pub fn decode(decoder: &mut Decoder) -> Result<DHKeyMessage, OtrError> {
        Ok(DHKeyMessage {
            gy: decoder.read_mpi()?,
        })
    }
}

#[derive(Clone)]
pub struct RevealSignatureMessage {
    pub key: aes128::Key,
    pub signature_encrypted: Vec<u8>,
    pub signature_mac: [u8; MAC_LEN],
}

impl Drop for RevealSignatureMessage {
    fn drop(&mut self) {
        self.signature_encrypted.fill(0);
        self.signature_mac.fill(0);
    }
}

impl Encodable for RevealSignatureMessage {
    fn encode(&self, encoder: &mut Encoder) {
        encoder
            .write_data(&self.key.0)
            .write_data(&self.signature_encrypted)
            .write_mac(&self.signature_mac);
    }
}

impl RevealSignatureMessage {
    pub fn decode(decoder: &mut Decoder) -> Result<RevealSignatureMessage, OtrError> {
        Ok(RevealSignatureMessage {
            key: aes128::Key(decoder.read_data()?.try_into().or(Err(
                OtrError::ProtocolViolation("invalid format for 128-bit AES key"),
            ))?),
            signature_encrypted: decoder.read_data()?,
            signature_mac: decoder.read_mac()?,
        })
    }
}

pub struct SignatureMessage {
    pub signature_encrypted: Vec<u8>,
    pub signature_mac: [u8; MAC_LEN],
}

impl Encodable for SignatureMessage {
    fn encode(&self, encoder: &mut Encoder) {
        encoder
            .write_data(&self.signature_encrypted)
            .write_mac(&self.signature_mac);
    }
}

impl SignatureMessage {
    pub fn decode(decoder: &mut Decoder) -> Result<SignatureMessage, OtrError> {
        Ok(SignatureMessage {
            signature_encrypted: decoder.read_data()?,
            signature_mac: decoder.read_mac()?,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AkeError {
    /// Message processing failed on a cryptographic verification.
    CryptographicViolation(CryptoError),
    /// Message arrived in violation of the protocol and is dropped.
    MessageIgnored,
    /// Message content is incomplete or malformed.
    DataProcessing(&'static str),
    /// Message cannot be handled in the current exchange state.
    IncorrectState,
}

// SPDX-License-Identifier: LGPL-3.0-only

use std::rc::Rc;

use num_bigint::BigUint;
use num_integer::Integer;
use zeroize::Zeroize;

use crate::{
    codec::{Decoder, Encoder, TlvType, TLV},
    crypto::{constant, dh, sha256, CryptoError},
    utils, Host, OtrError,
};

pub const TLV_SMP_MESSAGE_1: TlvType = 2;
pub const TLV_SMP_MESSAGE_2: TlvType = 3;
pub const TLV_SMP_MESSAGE_3: TlvType = 4;
pub const TLV_SMP_MESSAGE_4: TlvType = 5;
pub const TLV_SMP_ABORT: TlvType = 6;
/// Like message 1, but prefixed with a user-specified question terminated by a NUL byte.
pub const TLV_SMP_MESSAGE_1Q: TlvType = 7;

pub fn is_smp_tlv(tlv: &TLV) -> bool {
    tlv.0 >= TLV_SMP_MESSAGE_1 && tlv.0 <= TLV_SMP_MESSAGE_1Q
}

/// `SmpContext` runs the Socialist Millionaires' Protocol over the same 1536-bit MODP group as
/// the rest of the session. Both parties end up knowing whether their secrets were equal, and
/// nothing else: a failed proof and unequal secrets are indistinguishable from the outside.
///
/// Receiving message 1 does not produce an immediate response. The host is asked for the secret
/// and the exchange continues once `respond` delivers it.
pub struct SmpContext {
    state: State,
    status: SmpStatus,
    host: Rc<dyn Host>,
    our_fingerprint: [u8; 20],
    their_fingerprint: [u8; 20],
    ssid: [u8; 8],
}

impl Drop for SmpContext {
    fn drop(&mut self) {
        self.our_fingerprint.fill(0);
        self.their_fingerprint.fill(0);
        utils::bytes::clear(&mut self.ssid);
    }
}

#[allow(non_snake_case)]
impl SmpContext {
    pub fn new(
        host: Rc<dyn Host>,
        our_fingerprint: [u8; 20],
        their_fingerprint: [u8; 20],
        ssid: [u8; 8],
    ) -> SmpContext {
        Self {
            state: State::Expect1,
            status: SmpStatus::Initial,
            host,
            our_fingerprint,
            their_fingerprint,
            ssid,
        }
    }

    pub fn status(&self) -> SmpStatus {
        self.status.clone()
    }

    /// `initiate` starts a new exchange with the given secret. A non-empty question is carried to
    /// the other side verbatim; it has no cryptographic role.
    pub fn initiate(&mut self, secret: &[u8], question: &[u8]) -> Result<TLV, OtrError> {
        if !matches!(self.state, State::Expect1) {
            return Err(OtrError::ProtocolViolation(
                "exchange already in progress, abort it first",
            ));
        }
        self.status = SmpStatus::InProgress;
        let p = &*dh::MODULUS;
        let q = &*dh::ORDER;
        let g1 = &*dh::GENERATOR;
        let a2 = dh::random_exponent();
        let a3 = dh::random_exponent();
        let r2 = dh::random_exponent();
        let r3 = dh::random_exponent();
        let g2a = g1.modpow(&a2, p);
        let g3a = g1.modpow(&a3, p);
        let c2 = hash(1, &g1.modpow(&r2, p), None);
        let d2 = (q + &r2 - (&a2 * &c2).mod_floor(q)).mod_floor(q);
        let c3 = hash(2, &g1.modpow(&r3, p), None);
        let d3 = (q + &r3 - (&a3 * &c3).mod_floor(q)).mod_floor(q);
        let payload = Encoder::new()
            .write_mpi_sequence(&[&g2a, &c2, &d2, &g3a, &c3, &d3])
            .to_vec();
        self.state = State::Expect2 {
            x: self.compute_secret(secret, true),
            a2,
            a3,
        };
        if question.is_empty() {
            Ok(TLV(TLV_SMP_MESSAGE_1, payload))
        } else {
            let mut content = Encoder::new().write_null_terminated(question).to_vec();
            content.extend(payload);
            Ok(TLV(TLV_SMP_MESSAGE_1Q, content))
        }
    }

    /// `handle` processes an incoming SMP TLV. Any violation aborts the exchange: the state
    /// resets and an abort TLV is produced for the other side.
    pub fn handle(&mut self, tlv: &TLV) -> Option<TLV> {
        match self.dispatch(tlv) {
            Ok(response) => response,
            Err(e) => {
                log::debug!("aborting exchange on failed processing: {e:?}");
                self.state = State::Expect1;
                if matches!(self.status, SmpStatus::InProgress | SmpStatus::Initial) {
                    self.status = SmpStatus::Aborted(Vec::from("protocol violation"));
                }
                Some(TLV(TLV_SMP_ABORT, Vec::new()))
            }
        }
    }

    fn dispatch(&mut self, tlv: &TLV) -> Result<Option<TLV>, OtrError> {
        match tlv.0 {
            TLV_SMP_ABORT => {
                self.state = State::Expect1;
                self.status = SmpStatus::Aborted(Vec::from("aborted by the other party"));
                Ok(None)
            }
            TLV_SMP_MESSAGE_1 | TLV_SMP_MESSAGE_1Q => {
                self.status = SmpStatus::InProgress;
                self.handle_message_1(tlv)?;
                Ok(None)
            }
            TLV_SMP_MESSAGE_2 => {
                self.status = SmpStatus::InProgress;
                self.handle_message_2(tlv).map(Some)
            }
            TLV_SMP_MESSAGE_3 => self.handle_message_3(tlv).map(Some),
            TLV_SMP_MESSAGE_4 => {
                self.handle_message_4(tlv)?;
                Ok(None)
            }
            _ => panic!("BUG: non-SMP TLV dispatched to SMP context"),
        }
    }

    /// Message 1 carries `g2a` and `g3a` with knowledge-of-exponent proofs. After verification
    /// the host is asked for the secret; the response is produced by `respond`.
    fn handle_message_1(&mut self, tlv: &TLV) -> Result<(), OtrError> {
        if !matches!(self.state, State::Expect1) {
            return Err(OtrError::ProtocolViolation("expected SMP message 1"));
        }
        let mut dec = Decoder::new(&tlv.1);
        let question = if tlv.0 == TLV_SMP_MESSAGE_1Q {
            dec.read_until_null()
        } else {
            Vec::new()
        };
        let mpis = dec.read_mpi_sequence()?;
        dec.done()?;
        let [g2a, c2, d2, g3a, c3, d3]: [BigUint; 6] = mpis
            .try_into()
            .or(Err(OtrError::ProtocolViolation("expected 6 MPI values")))?;
        dh::verify_element(&g2a).map_err(OtrError::CryptographicViolation)?;
        dh::verify_element(&g3a).map_err(OtrError::CryptographicViolation)?;
        dh::verify_exponent(&d2).map_err(OtrError::CryptographicViolation)?;
        dh::verify_exponent(&d3).map_err(OtrError::CryptographicViolation)?;
        let p = &*dh::MODULUS;
        let g1 = &*dh::GENERATOR;
        verify_hash(
            &c2,
            1,
            &(g1.modpow(&d2, p) * g2a.modpow(&c2, p)).mod_floor(p),
            None,
        )?;
        verify_hash(
            &c3,
            2,
            &(g1.modpow(&d3, p) * g3a.modpow(&c3, p)).mod_floor(p),
            None,
        )?;
        self.state = State::AwaitingUserSecret {
            g2a,
            g3a,
            question: question.clone(),
        };
        self.host.smp_secret_requested(&question);
        Ok(())
    }

    /// `respond` continues the exchange with the secret obtained from the user, producing SMP
    /// message 2.
    pub fn respond(&mut self, secret: &[u8]) -> Result<TLV, OtrError> {
        let (g2a, g3a) = if let State::AwaitingUserSecret { g2a, g3a, question } = &self.state {
            log::debug!(
                "responding to authentication request (question of {} bytes)",
                question.len()
            );
            (g2a.clone(), g3a.clone())
        } else {
            return Err(OtrError::ProtocolViolation("no pending request for a secret"));
        };
        let p = &*dh::MODULUS;
        let q = &*dh::ORDER;
        let g1 = &*dh::GENERATOR;
        let b2 = dh::random_exponent();
        let b3 = dh::random_exponent();
        let r2 = dh::random_exponent();
        let r3 = dh::random_exponent();
        let r4 = dh::random_exponent();
        let r5 = dh::random_exponent();
        let r6 = dh::random_exponent();
        let g2b = g1.modpow(&b2, p);
        let g3b = g1.modpow(&b3, p);
        let c2 = hash(3, &g1.modpow(&r2, p), None);
        let d2 = (q + &r2 - (&b2 * &c2).mod_floor(q)).mod_floor(q);
        let c3 = hash(4, &g1.modpow(&r3, p), None);
        let d3 = (q + &r3 - (&b3 * &c3).mod_floor(q)).mod_floor(q);
        let g2 = g2a.modpow(&b2, p);
        let g3 = g3a.modpow(&b3, p);
        let mut y = self.compute_secret(secret, false);
        let pb = g3.modpow(&r4, p);
        let qb = (g1.modpow(&r4, p) * g2.modpow(&y, p)).mod_floor(p);
        let cp = hash(
            5,
            &g3.modpow(&r5, p),
            Some(&(g1.modpow(&r5, p) * g2.modpow(&r6, p)).mod_floor(p)),
        );
        let d5 = (q + &r5 - (&r4 * &cp).mod_floor(q)).mod_floor(q);
        let d6 = (q + &r6 - (&y * &cp).mod_floor(q)).mod_floor(q);
        y.zeroize();
        let payload = Encoder::new()
            .write_mpi_sequence(&[&g2b, &c2, &d2, &g3b, &c3, &d3, &pb, &qb, &cp, &d5, &d6])
            .to_vec();
        self.state = State::Expect3 {
            g3a,
            g2,
            g3,
            b3,
            pb,
            qb,
        };
        Ok(TLV(TLV_SMP_MESSAGE_2, payload))
    }

    fn handle_message_2(&mut self, tlv: &TLV) -> Result<TLV, OtrError> {
        let (x, a2, a3) = if let State::Expect2 { x, a2, a3 } = &self.state {
            (x.clone(), a2.clone(), a3.clone())
        } else {
            return Err(OtrError::ProtocolViolation("expected SMP message 2"));
        };
        let mut dec = Decoder::new(&tlv.1);
        let mpis = dec.read_mpi_sequence()?;
        dec.done()?;
        let [g2b, c2, d2, g3b, c3, d3, pb, qb, cp, d5, d6]: [BigUint; 11] = mpis
            .try_into()
            .or(Err(OtrError::ProtocolViolation("expected 11 MPI values")))?;
        let p = &*dh::MODULUS;
        let q = &*dh::ORDER;
        let g1 = &*dh::GENERATOR;
        for element in [&g2b, &g3b, &pb, &qb] {
            dh::verify_element(element).map_err(OtrError::CryptographicViolation)?;
        }
        for exponent in [&d2, &d3, &d5, &d6] {
            dh::verify_exponent(exponent).map_err(OtrError::CryptographicViolation)?;
        }
        verify_hash(
            &c2,
            3,
            &(g1.modpow(&d2, p) * g2b.modpow(&c2, p)).mod_floor(p),
            None,
        )?;
        verify_hash(
            &c3,
            4,
            &(g1.modpow(&d3, p) * g3b.modpow(&c3, p)).mod_floor(p),
            None,
        )?;
        let g2 = g2b.modpow(&a2, p);
        let g3 = g3b.modpow(&a3, p);
        verify_hash(
            &cp,
            5,
            &(g3.modpow(&d5, p) * pb.modpow(&cp, p)).mod_floor(p),
            Some(&(g1.modpow(&d5, p) * g2.modpow(&d6, p) * qb.modpow(&cp, p)).mod_floor(p)),
        )?;
        // proofs check out, construct our own P, Q and R values
        let r4 = dh::random_exponent();
        let r5 = dh::random_exponent();
        let r6 = dh::random_exponent();
        let r7 = dh::random_exponent();
        let pa = g3.modpow(&r4, p);
        let qa = (g1.modpow(&r4, p) * g2.modpow(&x, p)).mod_floor(p);
        let cp = hash(
            6,
            &g3.modpow(&r5, p),
            Some(&(g1.modpow(&r5, p) * g2.modpow(&r6, p)).mod_floor(p)),
        );
        let d5 = (q + &r5 - (&r4 * &cp).mod_floor(q)).mod_floor(q);
        let d6 = (q + &r6 - (&x * &cp).mod_floor(q)).mod_floor(q);
        let qa_qb = (&qa * dh::inverse(&qb).map_err(OtrError::CryptographicViolation)?)
            .mod_floor(p);
        let ra = qa_qb.modpow(&a3, p);
        let cr = hash(7, &g1.modpow(&r7, p), Some(&qa_qb.modpow(&r7, p)));
        let d7 = (q + &r7 - (&a3 * &cr).mod_floor(q)).mod_floor(q);
        let pa_pb = (&pa * dh::inverse(&pb).map_err(OtrError::CryptographicViolation)?)
            .mod_floor(p);
        let payload = Encoder::new()
            .write_mpi_sequence(&[&pa, &qa, &cp, &d5, &d6, &ra, &cr, &d7])
            .to_vec();
        self.state = State::Expect4 {
            g3b,
            pa_pb,
            qa_qb,
            a3,
        };
        Ok(TLV(TLV_SMP_MESSAGE_3, payload))
    }

    fn handle_message_3(&mut self, tlv: &TLV) -> Result<TLV, OtrError> {
        let (g3a, g2, g3, b3, pb, qb) = if let State::Expect3 {
            g3a,
            g2,
            g3,
            b3,
            pb,
            qb,
        } = &self.state
        {
            (
                g3a.clone(),
                g2.clone(),
                g3.clone(),
                b3.clone(),
                pb.clone(),
                qb.clone(),
            )
        } else {
            return Err(OtrError::ProtocolViolation("expected SMP message 3"));
        };
        let mut dec = Decoder::new(&tlv.1);
        let mpis = dec.read_mpi_sequence()?;
        dec.done()?;
        let [pa, qa, cp, d5, d6, ra, cr, d7]: [BigUint; 8] = mpis
            .try_into()
            .or(Err(OtrError::ProtocolViolation("expected 8 MPI values")))?;
        let p = &*dh::MODULUS;
        let q = &*dh::ORDER;
        let g1 = &*dh::GENERATOR;
        for element in [&pa, &qa, &ra] {
            dh::verify_element(element).map_err(OtrError::CryptographicViolation)?;
        }
        for exponent in [&d5, &d6, &d7] {
            dh::verify_exponent(exponent).map_err(OtrError::CryptographicViolation)?;
        }
        verify_hash(
            &cp,
            6,
            &(g3.modpow(&d5, p) * pa.modpow(&cp, p)).mod_floor(p),
            Some(&(g1.modpow(&d5, p) * g2.modpow(&d6, p) * qa.modpow(&cp, p)).mod_floor(p)),
        )?;
        let qa_qb = (&qa * dh::inverse(&qb).map_err(OtrError::CryptographicViolation)?)
            .mod_floor(p);
        verify_hash(
            &cr,
            7,
            &(g1.modpow(&d7, p) * g3a.modpow(&cr, p)).mod_floor(p),
            Some(&(qa_qb.modpow(&d7, p) * ra.modpow(&cr, p)).mod_floor(p)),
        )?;
        // produce the closing message and conclude on our side
        let r7 = dh::random_exponent();
        let rb = qa_qb.modpow(&b3, p);
        let cr = hash(8, &g1.modpow(&r7, p), Some(&qa_qb.modpow(&r7, p)));
        let d7 = (q + &r7 - (&b3 * &cr).mod_floor(q)).mod_floor(q);
        let payload = Encoder::new()
            .write_mpi_sequence(&[&rb, &cr, &d7])
            .to_vec();
        self.state = State::Expect1;
        let pa_pb = (&pa * dh::inverse(&pb).map_err(OtrError::CryptographicViolation)?)
            .mod_floor(p);
        if ra.modpow(&b3, p) == pa_pb {
            self.status = SmpStatus::Completed;
            self.host
                .update_fingerprint_verification(&self.their_fingerprint, true);
        } else {
            self.status = SmpStatus::Aborted(Vec::from("secrets proved not equal"));
            self.host
                .update_fingerprint_verification(&self.their_fingerprint, false);
        }
        Ok(TLV(TLV_SMP_MESSAGE_4, payload))
    }

    fn handle_message_4(&mut self, tlv: &TLV) -> Result<(), OtrError> {
        let (g3b, pa_pb, qa_qb, a3) = if let State::Expect4 {
            g3b,
            pa_pb,
            qa_qb,
            a3,
        } = &self.state
        {
            (g3b.clone(), pa_pb.clone(), qa_qb.clone(), a3.clone())
        } else {
            return Err(OtrError::ProtocolViolation("expected SMP message 4"));
        };
        let mut dec = Decoder::new(&tlv.1);
        let mpis = dec.read_mpi_sequence()?;
        dec.done()?;
        let [rb, cr, d7]: [BigUint; 3] = mpis
            .try_into()
            .or(Err(OtrError::ProtocolViolation("expected 3 MPI values")))?;
        let p = &*dh::MODULUS;
        let g1 = &*dh::GENERATOR;
        dh::verify_element(&rb).map_err(OtrError::CryptographicViolation)?;
        dh::verify_exponent(&d7).map_err(OtrError::CryptographicViolation)?;
        verify_hash(
            &cr,
            8,
            &(g1.modpow(&d7, p) * g3b.modpow(&cr, p)).mod_floor(p),
            Some(&(qa_qb.modpow(&d7, p) * rb.modpow(&cr, p)).mod_floor(p)),
        )?;
        self.state = State::Expect1;
        if rb.modpow(&a3, p) == pa_pb {
            self.status = SmpStatus::Completed;
            self.host
                .update_fingerprint_verification(&self.their_fingerprint, true);
        } else {
            self.status = SmpStatus::Aborted(Vec::from("secrets proved not equal"));
            self.host
                .update_fingerprint_verification(&self.their_fingerprint, false);
        }
        Ok(())
    }

    /// `abort` resets to the initial state and produces the abort TLV for the other side.
    pub fn abort(&mut self) -> TLV {
        self.state = State::Expect1;
        self.status = SmpStatus::Aborted(Vec::from("aborted by user"));
        TLV(TLV_SMP_ABORT, Vec::new())
    }

    /// The user-provided secret is combined with both fingerprints and the session's ssid, so
    /// that a man-in-the-middle cannot relay a successful exchange between the real endpoints.
    fn compute_secret(&self, secret: &[u8], we_initiated: bool) -> BigUint {
        let (initiator, responder) = if we_initiated {
            (&self.our_fingerprint, &self.their_fingerprint)
        } else {
            (&self.their_fingerprint, &self.our_fingerprint)
        };
        let mut combined = Vec::with_capacity(49 + secret.len());
        combined.push(1u8);
        combined.extend_from_slice(initiator);
        combined.extend_from_slice(responder);
        combined.extend_from_slice(&self.ssid);
        combined.extend_from_slice(secret);
        let digest = sha256::digest(&combined);
        combined.zeroize();
        BigUint::from_bytes_be(&digest)
    }
}

/// `hash` computes the SHA-256 commitment over one or two MPI-encoded group elements, prefixed
/// with a version byte that fixes the hash's position in the protocol.
fn hash(version: u8, mpi1: &BigUint, mpi2: Option<&BigUint>) -> BigUint {
    let mut encoder = Encoder::new();
    encoder.write_u8(version).write_mpi(mpi1);
    if let Some(mpi2) = mpi2 {
        encoder.write_mpi(mpi2);
    }
    BigUint::from_bytes_be(&sha256::digest(&encoder.to_vec()))
}

fn verify_hash(
    expected: &BigUint,
    version: u8,
    mpi1: &BigUint,
    mpi2: Option<&BigUint>,
) -> Result<(), OtrError> {
    if *expected == hash(version, mpi1, mpi2) {
        Ok(())
    } else {
        Err(OtrError::CryptographicViolation(
            CryptoError::VerificationFailure("zero-knowledge proof does not verify"),
        ))
    }
}

/// `SmpStatus` is the externally observable progress of the exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SmpStatus {
    /// No exchange has taken place.
    Initial,
    /// An exchange is in progress.
    InProgress,
    /// The exchange did not complete successfully. The payload describes why.
    Aborted(Vec<u8>),
    /// The exchange completed and the secrets matched.
    Completed,
}

enum State {
    Expect1,
    /// Message 1 was verified, the host has been asked for the user's secret.
    AwaitingUserSecret {
        g2a: BigUint,
        g3a: BigUint,
        question: Vec<u8>,
    },
    Expect2 {
        x: BigUint,
        a2: BigUint,
        a3: BigUint,
    },
    Expect3 {
        g3a: BigUint,
        g2: BigUint,
        g3: BigUint,
        b3: BigUint,
        pb: BigUint,
        qb: BigUint,
    },
    Expect4 {
        g3b: BigUint,
        pa_pb: BigUint,
        qa_qb: BigUint,
        a3: BigUint,
    },
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{SmpContext, SmpStatus, TLV_SMP_ABORT, TLV_SMP_MESSAGE_1, TLV_SMP_MESSAGE_1Q};
    use crate::{codec::TLV, crypto::dsa, Host};

    struct TestHost {
        keypair: dsa::Keypair,
        questions: RefCell<Vec<Vec<u8>>>,
    }

    impl TestHost {
        fn new() -> Rc<TestHost> {
            Rc::new(TestHost {
                keypair: dsa::Keypair::generate(),
                questions: RefCell::new(Vec::new()),
            })
        }
    }

    impl Host for TestHost {
        fn inject(&self, _message: &[u8]) {
            panic!("not used in these tests")
        }

        fn keypair(&self) -> dsa::Keypair {
            self.keypair.clone()
        }

        fn smp_secret_requested(&self, question: &[u8]) {
            self.questions.borrow_mut().push(Vec::from(question));
        }
    }

    fn new_pair(host_a: Rc<TestHost>, host_b: Rc<TestHost>) -> (SmpContext, SmpContext) {
        let fp_a = [0x11u8; 20];
        let fp_b = [0x22u8; 20];
        let ssid = [0x42u8; 8];
        (
            SmpContext::new(host_a, fp_a, fp_b, ssid),
            SmpContext::new(host_b, fp_b, fp_a, ssid),
        )
    }

    fn run_exchange(
        alice: &mut SmpContext,
        bob: &mut SmpContext,
        secret_a: &[u8],
        secret_b: &[u8],
        question: &[u8],
    ) {
        let msg1 = alice.initiate(secret_a, question).unwrap();
        if question.is_empty() {
            assert_eq!(TLV_SMP_MESSAGE_1, msg1.0);
        } else {
            assert_eq!(TLV_SMP_MESSAGE_1Q, msg1.0);
        }
        assert!(bob.handle(&msg1).is_none());
        let msg2 = bob.respond(secret_b).unwrap();
        let msg3 = alice.handle(&msg2).unwrap();
        let msg4 = bob.handle(&msg3).unwrap();
        assert!(alice.handle(&msg4).is_none());
    }

    #[test]
    fn test_exchange_with_matching_secrets() {
        let host_b = TestHost::new();
        let (mut alice, mut bob) = new_pair(TestHost::new(), Rc::clone(&host_b));
        run_exchange(&mut alice, &mut bob, b"hunter2", b"hunter2", b"");
        assert_eq!(SmpStatus::Completed, alice.status());
        assert_eq!(SmpStatus::Completed, bob.status());
        assert_eq!(vec![Vec::<u8>::new()], *host_b.questions.borrow());
    }

    #[test]
    fn test_exchange_with_question() {
        let host_b = TestHost::new();
        let (mut alice, mut bob) = new_pair(TestHost::new(), Rc::clone(&host_b));
        run_exchange(
            &mut alice,
            &mut bob,
            b"motorhead",
            b"motorhead",
            b"favorite band?",
        );
        assert_eq!(SmpStatus::Completed, alice.status());
        assert_eq!(SmpStatus::Completed, bob.status());
        assert_eq!(
            vec![Vec::from(&b"favorite band?"[..])],
            *host_b.questions.borrow()
        );
    }

    #[test]
    fn test_exchange_with_different_secrets() {
        let (mut alice, mut bob) = new_pair(TestHost::new(), TestHost::new());
        run_exchange(&mut alice, &mut bob, b"hunter2", b"*******", b"");
        assert!(matches!(alice.status(), SmpStatus::Aborted(_)));
        assert!(matches!(bob.status(), SmpStatus::Aborted(_)));
    }

    #[test]
    fn test_out_of_order_message_aborts() {
        let (mut alice, mut bob) = new_pair(TestHost::new(), TestHost::new());
        let msg1 = alice.initiate(b"secret", b"").unwrap();
        assert!(bob.handle(&msg1).is_none());
        let msg2 = bob.respond(b"secret").unwrap();
        // replaying message 2 at bob violates the state machine
        let response = bob.handle(&msg2).unwrap();
        assert_eq!(TLV_SMP_ABORT, response.0);
        assert!(matches!(bob.status(), SmpStatus::Aborted(_)));
    }

    #[test]
    fn test_abort_resets_exchange() {
        let (mut alice, mut bob) = new_pair(TestHost::new(), TestHost::new());
        let msg1 = alice.initiate(b"secret", b"").unwrap();
        assert!(bob.handle(&msg1).is_none());
        let abort = alice.abort();
        assert_eq!(TLV_SMP_ABORT, abort.0);
        assert!(bob.handle(&abort).is_none());
        assert!(matches!(bob.status(), SmpStatus::Aborted(_)));
        // both sides can start over afterwards
        run_exchange(&mut alice, &mut bob, b"again", b"again", b"");
        assert_eq!(SmpStatus::Completed, alice.status());
        assert_eq!(SmpStatus::Completed, bob.status());
    }

    #[test]
    fn test_tampered_payload_aborts() {
        let (mut alice, mut bob) = new_pair(TestHost::new(), TestHost::new());
        let msg1 = alice.initiate(b"secret", b"").unwrap();
        assert!(bob.handle(&msg1).is_none());
        let msg2 = bob.respond(b"secret").unwrap();
        let mut tampered = msg2.1.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        let response = alice.handle(&TLV(msg2.0, tampered)).unwrap();
        assert_eq!(TLV_SMP_ABORT, response.0);
        assert!(matches!(alice.status(), SmpStatus::Aborted(_)));
    }
}

// SPDX-License-Identifier: LGPL-3.0-only

//! End-to-end exercises with two sessions wired back-to-back over in-memory queues.

use std::cell::RefCell;
use std::rc::Rc;

use otrkit::{
    crypto::dsa,
    instancetag::TAG_ZERO,
    session::Session,
    Host, OtrError, Policy, ProtocolStatus, SessionEvent, Version,
};

struct TestHost {
    keypair: dsa::Keypair,
    outbound: RefCell<Vec<Vec<u8>>>,
    questions: RefCell<Vec<Vec<u8>>>,
    verdicts: RefCell<Vec<bool>>,
    max_size: usize,
}

impl TestHost {
    fn new(max_size: usize) -> Rc<Self> {
        Rc::new(Self {
            keypair: dsa::Keypair::generate(),
            outbound: RefCell::new(Vec::new()),
            questions: RefCell::new(Vec::new()),
            verdicts: RefCell::new(Vec::new()),
            max_size,
        })
    }
}

impl Host for TestHost {
    fn inject(&self, message: &[u8]) {
        self.outbound.borrow_mut().push(Vec::from(message));
    }

    fn keypair(&self) -> dsa::Keypair {
        self.keypair.clone()
    }

    fn smp_secret_requested(&self, question: &[u8]) {
        self.questions.borrow_mut().push(Vec::from(question));
    }

    fn update_fingerprint_verification(&self, _fingerprint: &[u8; 20], verified: bool) {
        self.verdicts.borrow_mut().push(verified);
    }

    fn max_message_size(&self) -> usize {
        self.max_size
    }
}

struct Pair {
    alice: Session,
    host_alice: Rc<TestHost>,
    bob: Session,
    host_bob: Rc<TestHost>,
}

impl Pair {
    fn new(policy: Policy, max_size: usize) -> Self {
        let host_alice = TestHost::new(max_size);
        let host_bob = TestHost::new(max_size);
        let alice = Session::new(Rc::clone(&host_alice) as Rc<dyn Host>, policy);
        let bob = Session::new(Rc::clone(&host_bob) as Rc<dyn Host>, policy);
        Self {
            alice,
            host_alice,
            bob,
            host_bob,
        }
    }

    /// Shuttle queued messages between both parties until traffic dies down. Produces the events
    /// each side reported, in order.
    fn pump(&mut self) -> (Vec<SessionEvent>, Vec<SessionEvent>) {
        let mut events_alice = Vec::new();
        let mut events_bob = Vec::new();
        loop {
            let from_alice: Vec<Vec<u8>> = self.host_alice.outbound.borrow_mut().drain(..).collect();
            let from_bob: Vec<Vec<u8>> = self.host_bob.outbound.borrow_mut().drain(..).collect();
            if from_alice.is_empty() && from_bob.is_empty() {
                return (events_alice, events_bob);
            }
            for message in from_alice {
                events_bob.push(self.bob.receive(&message).unwrap());
            }
            for message in from_bob {
                events_alice.push(self.alice.receive(&message).unwrap());
            }
        }
    }

    /// Establish an encrypted session and return (bob's tag as known to alice, alice's tag as
    /// known to bob).
    fn establish(&mut self) -> (u32, u32) {
        self.alice.initiate(Version::V3, None).unwrap();
        let (events_alice, events_bob) = self.pump();
        let tag_bob = events_alice
            .iter()
            .find_map(|e| match e {
                SessionEvent::ConfidentialSessionStarted(tag) => Some(*tag),
                _ => None,
            })
            .expect("alice must reach the encrypted state");
        let tag_alice = events_bob
            .iter()
            .find_map(|e| match e {
                SessionEvent::ConfidentialSessionStarted(tag) => Some(*tag),
                _ => None,
            })
            .expect("bob must reach the encrypted state");
        assert_eq!(Some(ProtocolStatus::Encrypted), self.alice.status(tag_bob));
        assert_eq!(Some(ProtocolStatus::Encrypted), self.bob.status(tag_alice));
        (tag_bob, tag_alice)
    }

    fn deliver_to_bob(&mut self, messages: &[Vec<u8>]) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for message in messages {
            events.push(self.bob.receive(message).unwrap());
        }
        events
    }
}

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_key_exchange_establishes_encrypted_session() {
    init();
    let mut pair = Pair::new(Policy::ALLOW_V3, 0);
    let (tag_bob, tag_alice) = pair.establish();
    assert_eq!(pair.bob.ourtag(), tag_bob);
    assert_eq!(pair.alice.ourtag(), tag_alice);
}

#[test]
fn test_confidential_messaging_in_both_directions() {
    init();
    let mut pair = Pair::new(Policy::ALLOW_V3, 0);
    let (tag_bob, tag_alice) = pair.establish();
    let messages = pair.alice.send(tag_bob, b"the eagle has landed").unwrap();
    assert_eq!(1, messages.len());
    assert!(messages[0].starts_with(b"?OTR:"));
    let events = pair.deliver_to_bob(&messages);
    assert_eq!(
        vec![SessionEvent::Confidential(Vec::from(
            &b"the eagle has landed"[..]
        ))],
        events
    );
    // multiple messages in the other direction, exercising key rotation and counters
    for text in [&b"ack one"[..], b"ack two", b"ack three"] {
        let messages = pair.bob.send(tag_alice, text).unwrap();
        for message in messages {
            assert_eq!(
                SessionEvent::Confidential(Vec::from(text)),
                pair.alice.receive(&message).unwrap()
            );
        }
    }
}

#[test]
fn test_tampered_data_message_rejected() {
    init();
    let mut pair = Pair::new(Policy::ALLOW_V3, 0);
    let (tag_bob, _) = pair.establish();
    let mut message = pair.alice.send(tag_bob, b"untouched").unwrap().remove(0);
    // flip a base64 character inside the ciphertext region
    let pos = message.len() - 40;
    message[pos] = if message[pos] == b'A' { b'B' } else { b'A' };
    assert!(pair.bob.receive(&message).is_err());
}

#[test]
fn test_replayed_data_message_rejected() {
    init();
    let mut pair = Pair::new(Policy::ALLOW_V3, 0);
    let (tag_bob, _) = pair.establish();
    let message = pair.alice.send(tag_bob, b"once").unwrap().remove(0);
    assert!(pair.bob.receive(&message).is_ok());
    assert!(pair.bob.receive(&message).is_err());
}

#[test]
fn test_fragmented_exchange_and_messaging() {
    init();
    let mut pair = Pair::new(Policy::ALLOW_V3, 250);
    let (tag_bob, _) = pair.establish();
    let text = vec![b'x'; 1000];
    let messages = pair.alice.send(tag_bob, &text).unwrap();
    assert!(messages.len() > 1);
    for message in &messages {
        assert!(message.len() <= 250);
        assert!(message.starts_with(b"?OTR|"));
    }
    let events = pair.deliver_to_bob(&messages);
    let (last, rest) = events.split_last().unwrap();
    assert!(rest.iter().all(|e| *e == SessionEvent::None));
    assert_eq!(SessionEvent::Confidential(text), *last);
}

#[test]
fn test_query_negotiation_on_required_encryption() {
    init();
    let mut pair = Pair::new(Policy::ALLOW_V3 | Policy::REQUIRE_ENCRYPTION, 0);
    assert!(matches!(
        pair.alice.send(TAG_ZERO, b"premature"),
        Err(OtrError::PolicyRestriction(_))
    ));
    // the query message invites bob to initiate, completing the exchange
    let (events_alice, _) = pair.pump();
    assert!(events_alice
        .iter()
        .any(|e| matches!(e, SessionEvent::ConfidentialSessionStarted(_))));
}

#[test]
fn test_whitespace_tagged_message_starts_exchange() {
    init();
    let policy = Policy::ALLOW_V3 | Policy::SEND_WHITESPACE_TAG | Policy::WHITESPACE_START_AKE;
    let mut pair = Pair::new(policy, 0);
    let messages = pair.alice.send(TAG_ZERO, b"you there?").unwrap();
    assert_eq!(1, messages.len());
    let events = pair.deliver_to_bob(&messages);
    assert_eq!(vec![SessionEvent::Plaintext(Vec::from(&b"you there?"[..]))], events);
    let (events_alice, events_bob) = pair.pump();
    assert!(events_alice
        .iter()
        .any(|e| matches!(e, SessionEvent::ConfidentialSessionStarted(_))));
    assert!(events_bob
        .iter()
        .any(|e| matches!(e, SessionEvent::ConfidentialSessionStarted(_))));
}

#[test]
fn test_v2_exchange_and_messaging() {
    init();
    let mut pair = Pair::new(Policy::ALLOW_V2, 0);
    pair.alice.initiate(Version::V2, None).unwrap();
    let (events_alice, events_bob) = pair.pump();
    // version 2 knows no instance tags, all traffic runs under tag zero
    assert!(events_alice.contains(&SessionEvent::ConfidentialSessionStarted(TAG_ZERO)));
    assert!(events_bob.contains(&SessionEvent::ConfidentialSessionStarted(TAG_ZERO)));
    assert_eq!(Some(ProtocolStatus::Encrypted), pair.alice.status(TAG_ZERO));
    assert_eq!(Some(ProtocolStatus::Encrypted), pair.bob.status(TAG_ZERO));
    let messages = pair.alice.send(TAG_ZERO, b"strictly between us").unwrap();
    assert_eq!(1, messages.len());
    assert!(messages[0].starts_with(b"?OTR:"));
    let events = pair.deliver_to_bob(&messages);
    assert_eq!(
        vec![SessionEvent::Confidential(Vec::from(
            &b"strictly between us"[..]
        ))],
        events
    );
    let messages = pair.bob.send(TAG_ZERO, b"copy that").unwrap();
    for message in messages {
        assert_eq!(
            SessionEvent::Confidential(Vec::from(&b"copy that"[..])),
            pair.alice.receive(&message).unwrap()
        );
    }
}

#[test]
fn test_v2_fragmentation_uses_tagless_form() {
    init();
    let mut pair = Pair::new(Policy::ALLOW_V2, 250);
    pair.alice.initiate(Version::V2, None).unwrap();
    let (events_alice, _) = pair.pump();
    assert!(events_alice.contains(&SessionEvent::ConfidentialSessionStarted(TAG_ZERO)));
    let text = vec![b'y'; 800];
    let messages = pair.alice.send(TAG_ZERO, &text).unwrap();
    assert!(messages.len() > 1);
    for message in &messages {
        assert!(message.len() <= 250);
        assert!(message.starts_with(b"?OTR,"));
    }
    let events = pair.deliver_to_bob(&messages);
    let (last, rest) = events.split_last().unwrap();
    assert!(rest.iter().all(|e| *e == SessionEvent::None));
    assert_eq!(SessionEvent::Confidential(text), *last);
}

#[test]
fn test_smp_with_matching_secrets() {
    init();
    let mut pair = Pair::new(Policy::ALLOW_V3, 0);
    let (tag_bob, tag_alice) = pair.establish();
    pair.alice
        .start_smp(tag_bob, b"hunter2", b"first pet?")
        .unwrap();
    let _ = pair.pump();
    assert_eq!(
        vec![Vec::from(&b"first pet?"[..])],
        *pair.host_bob.questions.borrow()
    );
    pair.bob.respond_smp(tag_alice, b"hunter2").unwrap();
    let (events_alice, events_bob) = pair.pump();
    assert!(events_alice.contains(&SessionEvent::SmpSucceeded(tag_bob)));
    assert!(events_bob.contains(&SessionEvent::SmpSucceeded(tag_alice)));
    assert_eq!(vec![true], *pair.host_alice.verdicts.borrow());
    assert_eq!(vec![true], *pair.host_bob.verdicts.borrow());
}

#[test]
fn test_smp_with_differing_secrets() {
    init();
    let mut pair = Pair::new(Policy::ALLOW_V3, 0);
    let (tag_bob, tag_alice) = pair.establish();
    pair.alice.start_smp(tag_bob, b"hunter2", b"").unwrap();
    let _ = pair.pump();
    pair.bob.respond_smp(tag_alice, b"*******").unwrap();
    let (events_alice, events_bob) = pair.pump();
    assert!(events_alice.contains(&SessionEvent::SmpFailed(tag_bob)));
    assert!(events_bob.contains(&SessionEvent::SmpFailed(tag_alice)));
    assert_eq!(vec![false], *pair.host_alice.verdicts.borrow());
    assert_eq!(vec![false], *pair.host_bob.verdicts.borrow());
}

#[test]
fn test_ending_session_finishes_other_party() {
    init();
    let mut pair = Pair::new(Policy::ALLOW_V3, 0);
    let (tag_bob, tag_alice) = pair.establish();
    assert_eq!(
        SessionEvent::Reset(tag_bob),
        pair.alice.end(tag_bob).unwrap()
    );
    assert_eq!(Some(ProtocolStatus::Plaintext), pair.alice.status(tag_bob));
    let (_, events_bob) = pair.pump();
    assert!(events_bob.contains(&SessionEvent::ConfidentialSessionFinished(tag_alice)));
    assert_eq!(Some(ProtocolStatus::Finished), pair.bob.status(tag_alice));
    // no accidental disclosure once the other party is gone
    assert!(matches!(
        pair.bob.send(tag_alice, b"anyone?"),
        Err(OtrError::IncorrectState(_))
    ));
}

#[test]
fn test_extra_symmetric_keys_agree() {
    init();
    let mut pair = Pair::new(Policy::ALLOW_V3, 0);
    let (tag_bob, tag_alice) = pair.establish();
    assert_eq!(
        pair.alice.extra_symmetric_key(tag_bob).unwrap(),
        pair.bob.extra_symmetric_key(tag_alice).unwrap()
    );
}

// SPDX-License-Identifier: LGPL-3.0-only

use std::{
    collections::{hash_map::Entry, HashMap},
    rc::Rc,
};

use crate::{
    ake::{AkeContext, AkeError},
    codec::Encoder,
    fragment::{self, Assembler, FragmentError},
    instancetag::{self, InstanceTag, TAG_ZERO},
    message::{self, encode_message, EncodedMessage, Message, MessageBody, MessageFlags},
    smp::SmpStatus,
    state::{self, MessageState},
    utils, Host, OtrError, Policy, ProtocolStatus, SessionEvent, Version,
};

/// `Session` manages all OTR communication with a single correspondent. The correspondent may be
/// signed in with multiple clients at once, so protocol state is kept per instance tag. Instance
/// `TAG_ZERO` collects traffic of clients that have not announced a tag yet, which includes all
/// version 2 traffic.
pub struct Session {
    host: Rc<dyn Host>,
    details: Rc<SessionDetails>,
    instances: HashMap<InstanceTag, Instance>,
}

impl Session {
    pub fn new(host: Rc<dyn Host>, policy: Policy) -> Self {
        Self {
            details: Rc::new(SessionDetails {
                policy,
                tag: instancetag::random_tag(),
            }),
            host,
            instances: HashMap::new(),
        }
    }

    /// `ourtag` is our own instance tag, announced in all version 3 traffic.
    pub fn ourtag(&self) -> InstanceTag {
        self.details.tag
    }

    /// `instances` lists the tags of all client instances encountered so far.
    pub fn instances(&self) -> Vec<InstanceTag> {
        self.instances.keys().copied().collect()
    }

    /// `status` queries the protocol status for a particular instance, if the instance is known.
    pub fn status(&self, instance: InstanceTag) -> Option<ProtocolStatus> {
        self.instances.get(&instance).map(Instance::status)
    }

    /// `receive` processes a message arriving from the transport. The result tells the client
    /// what, if anything, must be shown to the user. Responses that the protocol itself requires
    /// are passed to the host for transmission.
    pub fn receive(&mut self, payload: &[u8]) -> Result<SessionEvent, OtrError> {
        if !self.details.policy.intersects(Policy::ALLOW_V2 | Policy::ALLOW_V3) {
            // no version allowed by policy, so do no OTR handling at all
            return Ok(SessionEvent::Plaintext(Vec::from(payload)));
        }
        if fragment::is_fragment(payload) {
            return self.receive_fragment(payload);
        }
        match message::parse(payload)? {
            Message::Error(error) => {
                if self.details.policy.contains(Policy::ERROR_START_AKE) {
                    self.query();
                }
                Ok(SessionEvent::Error(error))
            }
            Message::Plaintext(content) => {
                if self.expects_encryption() {
                    Ok(SessionEvent::WarningUnencrypted(content))
                } else {
                    Ok(SessionEvent::Plaintext(content))
                }
            }
            Message::Tagged(versions, content) => {
                if self.details.policy.contains(Policy::WHITESPACE_START_AKE) {
                    if let Some(selected) = self.select_version(&versions) {
                        self.initiate(selected, None)?;
                    }
                }
                if self.expects_encryption() {
                    Ok(SessionEvent::WarningUnencrypted(content))
                } else {
                    Ok(SessionEvent::Plaintext(content))
                }
            }
            Message::Query(versions) => {
                if let Some(selected) = self.select_version(&versions) {
                    self.initiate(selected, None)?;
                }
                Ok(SessionEvent::None)
            }
            Message::Encoded(msg) => {
                if !self.allowed(msg.version) {
                    log::debug!(
                        "ignoring encoded message for version disallowed by policy: {:?}",
                        msg.version
                    );
                    return Ok(SessionEvent::None);
                }
                self.verify_encoded_message(&msg)?;
                self.instance(msg.sender).handle(msg)
            }
        }
    }

    fn receive_fragment(&mut self, payload: &[u8]) -> Result<SessionEvent, OtrError> {
        let fragment = fragment::parse(payload)
            .ok_or(OtrError::ProtocolViolation("illegal or unsupported fragment"))?;
        if !self.allowed(fragment.version) {
            return Ok(SessionEvent::None);
        }
        if fragment.receiver != TAG_ZERO && fragment.receiver != self.details.tag {
            return Err(OtrError::MessageForOtherInstance);
        }
        let sender = fragment.sender;
        match self.instance(sender).assembler.assemble(&fragment) {
            Ok(assembled) => self.receive(&assembled),
            // Not enough parts yet, or the sequence restarted. Either way wait for more.
            Err(FragmentError::IncompleteResult | FragmentError::UnexpectedFragment) => {
                Ok(SessionEvent::None)
            }
            Err(FragmentError::InvalidData) => {
                Err(OtrError::ProtocolViolation("fragment with invalid data"))
            }
        }
    }

    /// `send` prepares a message for sending, according to the instance's current protocol state.
    /// The result is the list of transport-ready payloads, multiple in case the message needed
    /// fragmenting.
    pub fn send(&mut self, instance: InstanceTag, content: &[u8]) -> Result<Vec<Vec<u8>>, OtrError> {
        let status = self.instance(instance).status();
        if status == ProtocolStatus::Plaintext
            && self.details.policy.contains(Policy::REQUIRE_ENCRYPTION)
        {
            // policy requires encryption, so initiate OTR and hold off on sending
            self.query();
            return Err(OtrError::PolicyRestriction(
                "encryption is required by policy but no confidential session is established yet",
            ));
        }
        self.instances
            .get_mut(&instance)
            .ok_or(OtrError::UnknownInstance)?
            .send(content)
    }

    /// `initiate` starts the key exchange towards the designated receiver, or towards the
    /// yet-unidentified instance if no receiver is known yet.
    pub fn initiate(
        &mut self,
        version: Version,
        receiver: Option<InstanceTag>,
    ) -> Result<SessionEvent, OtrError> {
        if !self.allowed(version) {
            return Err(OtrError::PolicyRestriction(
                "protocol version disallowed by policy",
            ));
        }
        let receiver = receiver.unwrap_or(TAG_ZERO);
        self.instance(receiver).initiate(version)
    }

    /// `query` sends a query message advertising all policy-allowed versions, inviting the other
    /// party to start a key exchange.
    pub fn query(&mut self) {
        let versions = self.allowed_versions();
        assert!(!versions.is_empty());
        self.host.inject(&message::serialize(&Message::Query(versions)));
    }

    /// `end` closes the confidential session with the given instance, notifying the other party.
    pub fn end(&mut self, instance: InstanceTag) -> Result<SessionEvent, OtrError> {
        self.instances
            .get_mut(&instance)
            .ok_or(OtrError::UnknownInstance)?
            .reset()
    }

    /// `start_smp` initiates the Socialist Millionaires' Protocol with the given secret. The
    /// question is carried along when non-empty.
    pub fn start_smp(
        &mut self,
        instance: InstanceTag,
        secret: &[u8],
        question: &[u8],
    ) -> Result<(), OtrError> {
        self.instances
            .get_mut(&instance)
            .ok_or(OtrError::UnknownInstance)?
            .start_smp(secret, question)
    }

    /// `respond_smp` provides the secret that the other party's SMP initiation asked for.
    pub fn respond_smp(&mut self, instance: InstanceTag, secret: &[u8]) -> Result<(), OtrError> {
        self.instances
            .get_mut(&instance)
            .ok_or(OtrError::UnknownInstance)?
            .respond_smp(secret)
    }

    /// `abort_smp` aborts an exchange in progress, notifying the other party.
    pub fn abort_smp(&mut self, instance: InstanceTag) -> Result<(), OtrError> {
        self.instances
            .get_mut(&instance)
            .ok_or(OtrError::UnknownInstance)?
            .abort_smp()
    }

    /// `extra_symmetric_key` derives the additional symmetric key of the current confidential
    /// session, for use over an out-of-band channel.
    pub fn extra_symmetric_key(&self, instance: InstanceTag) -> Result<[u8; 32], OtrError> {
        self.instances
            .get(&instance)
            .ok_or(OtrError::UnknownInstance)?
            .state
            .extra_symmetric_key()
    }

    fn instance(&mut self, tag: InstanceTag) -> &mut Instance {
        // A key exchange started towards receiver zero moves to the instance of the first client
        // that responds with a concrete tag.
        let transferred = if tag == TAG_ZERO || self.instances.contains_key(&tag) {
            None
        } else {
            self.instances
                .get(&TAG_ZERO)
                .and_then(|zero| zero.ake.transfer().ok())
        };
        match self.instances.entry(tag) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut instance =
                    Instance::new(Rc::clone(&self.details), tag, Rc::clone(&self.host));
                if let Some(ake) = transferred {
                    instance.ake = ake;
                }
                entry.insert(instance)
            }
        }
    }

    fn verify_encoded_message(&self, msg: &EncodedMessage) -> Result<(), OtrError> {
        if msg.version != Version::V3 {
            // version 2 messages carry no instance tags, nothing to verify
            return Ok(());
        }
        if msg.receiver == self.details.tag {
            return Ok(());
        }
        if msg.receiver == TAG_ZERO && matches!(msg.body, MessageBody::DHCommit(_)) {
            // a DH-Commit may address all instances at once
            return Ok(());
        }
        Err(OtrError::MessageForOtherInstance)
    }

    fn allowed(&self, version: Version) -> bool {
        match version {
            Version::V2 => self.details.policy.contains(Policy::ALLOW_V2),
            Version::V3 => self.details.policy.contains(Policy::ALLOW_V3),
            Version::None | Version::Unsupported(_) => false,
        }
    }

    fn allowed_versions(&self) -> Vec<Version> {
        let mut versions = Vec::new();
        if self.details.policy.contains(Policy::ALLOW_V3) {
            versions.push(Version::V3);
        }
        if self.details.policy.contains(Policy::ALLOW_V2) {
            versions.push(Version::V2);
        }
        versions
    }

    fn select_version(&self, versions: &[Version]) -> Option<Version> {
        if versions.contains(&Version::V3) && self.details.policy.contains(Policy::ALLOW_V3) {
            Some(Version::V3)
        } else if versions.contains(&Version::V2) && self.details.policy.contains(Policy::ALLOW_V2)
        {
            Some(Version::V2)
        } else {
            None
        }
    }

    fn expects_encryption(&self) -> bool {
        self.details.policy.contains(Policy::REQUIRE_ENCRYPTION)
            || self.instances.values().any(|i| {
                i.status() == ProtocolStatus::Encrypted || i.status() == ProtocolStatus::Finished
            })
    }
}

/// `Instance` serves the communication with a single client of the correspondent's account.
struct Instance {
    details: Rc<SessionDetails>,
    their_tag: InstanceTag,
    host: Rc<dyn Host>,
    assembler: Assembler,
    state: Box<dyn MessageState>,
    ake: AkeContext,
    tagged: bool,
}

impl Instance {
    fn new(details: Rc<SessionDetails>, their_tag: InstanceTag, host: Rc<dyn Host>) -> Self {
        Self {
            details,
            their_tag,
            assembler: Assembler::new(),
            state: state::new_state(),
            ake: AkeContext::new(Rc::clone(&host), Version::V3),
            host,
            tagged: false,
        }
    }

    fn status(&self) -> ProtocolStatus {
        self.state.status()
    }

    fn initiate(&mut self, version: Version) -> Result<SessionEvent, OtrError> {
        self.ake = AkeContext::new(Rc::clone(&self.host), version);
        let msg = self.ake.initiate();
        self.inject_encoded(version, msg);
        Ok(SessionEvent::None)
    }

    fn handle(&mut self, encoded: EncodedMessage) -> Result<SessionEvent, OtrError> {
        debug_assert!(encoded.version != Version::V3 || encoded.sender == self.their_tag);
        match encoded.body {
            MessageBody::Unencoded(_) => {
                panic!("BUG: parsing never produces an 'Unencoded' body")
            }
            MessageBody::DHCommit(msg) => {
                if self.ake.version() != encoded.version {
                    // the other party picked a different version, follow their choice
                    self.ake = AkeContext::new(Rc::clone(&self.host), encoded.version);
                }
                match self.ake.handle_dhcommit(msg) {
                    Ok(response) => {
                        self.inject_encoded(encoded.version, response);
                        Ok(SessionEvent::None)
                    }
                    Err(AkeError::MessageIgnored) => Ok(SessionEvent::None),
                    Err(e) => Err(OtrError::AuthenticationError(e)),
                }
            }
            MessageBody::DHKey(msg) => {
                if self.ake.version() != encoded.version {
                    return Ok(SessionEvent::None);
                }
                match self.ake.handle_dhkey(msg) {
                    Ok(response) => {
                        self.inject_encoded(encoded.version, response);
                        Ok(SessionEvent::None)
                    }
                    Err(AkeError::MessageIgnored) => Ok(SessionEvent::None),
                    Err(e) => Err(OtrError::AuthenticationError(e)),
                }
            }
            MessageBody::RevealSignature(msg) => {
                if self.ake.version() != encoded.version {
                    return Ok(SessionEvent::None);
                }
                match self.ake.handle_reveal_signature(msg) {
                    Ok((material, response)) => {
                        self.state = self.state.secure(
                            Rc::clone(&self.host),
                            self.details.tag,
                            self.their_tag,
                            material,
                        );
                        self.inject_encoded(encoded.version, response);
                        Ok(SessionEvent::ConfidentialSessionStarted(self.their_tag))
                    }
                    Err(AkeError::MessageIgnored) => Ok(SessionEvent::None),
                    Err(e) => Err(OtrError::AuthenticationError(e)),
                }
            }
            MessageBody::Signature(msg) => {
                if self.ake.version() != encoded.version {
                    return Ok(SessionEvent::None);
                }
                match self.ake.handle_signature(msg) {
                    Ok(material) => {
                        self.state = self.state.secure(
                            Rc::clone(&self.host),
                            self.details.tag,
                            self.their_tag,
                            material,
                        );
                        Ok(SessionEvent::ConfidentialSessionStarted(self.their_tag))
                    }
                    Err(AkeError::MessageIgnored) => Ok(SessionEvent::None),
                    Err(e) => Err(OtrError::AuthenticationError(e)),
                }
            }
            MessageBody::Data(msg) => {
                let version = self.state.version();
                let smp_before = self.smp_status();
                let (result, transition) = self.state.handle(&msg);
                if let Some(next) = transition {
                    self.state = next;
                }
                match result {
                    Ok(handled) => {
                        if let Some(reply) = handled.reply {
                            self.inject_encoded(version, MessageBody::Data(reply));
                        }
                        if self.state.status() == ProtocolStatus::Finished {
                            return Ok(SessionEvent::ConfidentialSessionFinished(self.their_tag));
                        }
                        if let Some(event) = self.smp_event(&smp_before) {
                            return Ok(event);
                        }
                        match handled.content {
                            Some(content) => Ok(SessionEvent::Confidential(content)),
                            None => Ok(SessionEvent::None),
                        }
                    }
                    Err(OtrError::UnreadableMessage) => {
                        if msg.flags.contains(MessageFlags::IGNORE_UNREADABLE) {
                            return Ok(SessionEvent::None);
                        }
                        self.host.inject(&message::serialize(&Message::Error(
                            Vec::from(&b" unreadable message received"[..]),
                        )));
                        Err(OtrError::UnreadableMessage)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn send(&mut self, content: &[u8]) -> Result<Vec<Vec<u8>>, OtrError> {
        // NUL bytes would truncate the message on the receiving side
        let content = utils::bytes::drop_value(content, 0);
        let payload = state::encode_payload(&content, &[]);
        match self.state.prepare(MessageFlags::empty(), &payload)? {
            MessageBody::Unencoded(message) => {
                let policy = self.details.policy;
                if policy.contains(Policy::SEND_WHITESPACE_TAG) && !self.tagged {
                    self.tagged = true;
                    let mut versions = Vec::new();
                    if policy.contains(Policy::ALLOW_V3) {
                        versions.push(Version::V3);
                    }
                    if policy.contains(Policy::ALLOW_V2) {
                        versions.push(Version::V2);
                    }
                    Ok(vec![message::serialize(&Message::Tagged(versions, message))])
                } else {
                    Ok(vec![message::serialize(&Message::Plaintext(message))])
                }
            }
            body @ MessageBody::Data(_) => {
                Ok(self.serialize_fragmented(self.state.version(), body))
            }
            _ => panic!("BUG: prepared message is never a key exchange message"),
        }
    }

    fn reset(&mut self) -> Result<SessionEvent, OtrError> {
        let previous = self.state.status();
        let version = self.state.version();
        let (disconnect, newstate) = self.state.finish();
        self.state = newstate;
        if previous == self.state.status() {
            assert!(disconnect.is_none());
            return Ok(SessionEvent::None);
        }
        if let Some(msg) = disconnect {
            self.inject_encoded(version, MessageBody::Data(msg));
        }
        Ok(SessionEvent::Reset(self.their_tag))
    }

    fn start_smp(&mut self, secret: &[u8], question: &[u8]) -> Result<(), OtrError> {
        let smp = self
            .state
            .smp_mut()
            .ok_or(OtrError::IncorrectState("SMP requires a confidential session"))?;
        let tlv = smp.initiate(secret, question)?;
        self.send_tlv(tlv)
    }

    fn respond_smp(&mut self, secret: &[u8]) -> Result<(), OtrError> {
        let smp = self
            .state
            .smp_mut()
            .ok_or(OtrError::IncorrectState("SMP requires a confidential session"))?;
        let tlv = smp.respond(secret)?;
        self.send_tlv(tlv)
    }

    fn abort_smp(&mut self) -> Result<(), OtrError> {
        let smp = self
            .state
            .smp_mut()
            .ok_or(OtrError::IncorrectState("SMP requires a confidential session"))?;
        let tlv = smp.abort();
        self.send_tlv(tlv)
    }

    fn send_tlv(&mut self, tlv: crate::codec::TLV) -> Result<(), OtrError> {
        let version = self.state.version();
        let payload = state::encode_payload(b"", &[tlv]);
        let body = self.state.prepare(MessageFlags::IGNORE_UNREADABLE, &payload)?;
        self.inject_encoded(version, body);
        Ok(())
    }

    fn smp_status(&mut self) -> Option<SmpStatus> {
        self.state.smp_mut().map(|smp| smp.status())
    }

    fn smp_event(&mut self, before: &Option<SmpStatus>) -> Option<SessionEvent> {
        let after = self.smp_status()?;
        match (before, after) {
            (Some(SmpStatus::Completed), _) => None,
            (_, SmpStatus::Completed) => Some(SessionEvent::SmpSucceeded(self.their_tag)),
            (Some(SmpStatus::InProgress), SmpStatus::Aborted(_)) => {
                Some(SessionEvent::SmpFailed(self.their_tag))
            }
            _ => None,
        }
    }

    fn inject_encoded(&self, version: Version, body: MessageBody) {
        for piece in self.serialize_fragmented(version, body) {
            self.host.inject(&piece);
        }
    }

    fn serialize_fragmented(&self, version: Version, body: MessageBody) -> Vec<Vec<u8>> {
        let message = encode_message(version, self.details.tag, self.their_tag, body);
        let max = self.host.max_message_size();
        if max == 0 || message.len() <= max {
            return vec![message];
        }
        // version 2 fragments carry no instance tags
        let (sender, receiver) = if version == Version::V2 {
            (TAG_ZERO, TAG_ZERO)
        } else {
            (self.details.tag, self.their_tag)
        };
        fragment::fragment(max, version, sender, receiver, &message)
            .iter()
            .map(|piece| Encoder::new().write_encodable(piece).to_vec())
            .collect()
    }
}

/// `SessionDetails` contains our own static account details.
struct SessionDetails {
    policy: Policy,
    tag: InstanceTag,
}

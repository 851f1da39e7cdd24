// SPDX-License-Identifier: LGPL-3.0-only

use std::rc::Rc;

use crate::{
    ake::CryptographicMaterial,
    codec::{Decoder, Encoder, TlvType, TLV},
    crypto::{constant, dh, sha1},
    instancetag::InstanceTag,
    keys::{self, KeyManager},
    message::{encode_authenticator_data, DataMessage, MessageBody, MessageFlags},
    smp::{self, SmpContext},
    Host, OtrError, ProtocolStatus, Version,
};

pub const TLV_TYPE_PADDING: TlvType = 0;
pub const TLV_TYPE_DISCONNECT: TlvType = 1;
/// Signals that the other party wants to make use of the extra symmetric key.
pub const TLV_TYPE_EXTRA_SYMMETRIC_KEY: TlvType = 8;

/// Outcome of handling a data message: optionally content for the user, optionally a data
/// message that must go back to the other party through the regular send path.
pub struct Handled {
    pub content: Option<Vec<u8>>,
    pub reply: Option<DataMessage>,
}

/// `MessageState` is the per-instance message-handling state: plaintext, encrypted or finished.
/// Transitions are returned alongside results so the caller swaps states explicitly.
pub trait MessageState {
    fn status(&self) -> ProtocolStatus;
    fn version(&self) -> Version;
    fn handle(
        &mut self,
        msg: &DataMessage,
    ) -> (Result<Handled, OtrError>, Option<Box<dyn MessageState>>);
    fn secure(
        &self,
        host: Rc<dyn Host>,
        our_tag: InstanceTag,
        their_tag: InstanceTag,
        material: CryptographicMaterial,
    ) -> Box<EncryptedState>;
    fn finish(&mut self) -> (Option<DataMessage>, Box<PlaintextState>);
    fn prepare(&mut self, flags: MessageFlags, payload: &[u8]) -> Result<MessageBody, OtrError>;
    fn smp_mut(&mut self) -> Option<&mut SmpContext>;
    fn extra_symmetric_key(&self) -> Result<[u8; 32], OtrError>;
}

pub fn new_state() -> Box<dyn MessageState> {
    Box::new(PlaintextState {})
}

/// `encode_payload` produces the plaintext of a data message: the human-readable part, then a
/// NUL separator and TLV records whenever TLVs are present.
pub fn encode_payload(message: &[u8], tlvs: &[TLV]) -> Vec<u8> {
    assert!(!message.contains(&0u8));
    let mut encoder = Encoder::new();
    encoder.write(message);
    if !tlvs.is_empty() {
        encoder.write_u8(0);
        for tlv in tlvs {
            encoder.write_tlv(tlv);
        }
    }
    encoder.to_vec()
}

fn decode_payload(payload: &[u8]) -> Result<(Vec<u8>, Vec<TLV>), OtrError> {
    let mut decoder = Decoder::new(payload);
    let message = decoder.read_until_null();
    let tlvs = decoder.read_tlvs()?;
    Ok((message, tlvs))
}

pub struct PlaintextState {}

impl MessageState for PlaintextState {
    fn status(&self) -> ProtocolStatus {
        ProtocolStatus::Plaintext
    }

    fn version(&self) -> Version {
        Version::None
    }

    fn handle(
        &mut self,
        _msg: &DataMessage,
    ) -> (Result<Handled, OtrError>, Option<Box<dyn MessageState>>) {
        (Err(OtrError::UnreadableMessage), None)
    }

    fn secure(
        &self,
        host: Rc<dyn Host>,
        our_tag: InstanceTag,
        their_tag: InstanceTag,
        material: CryptographicMaterial,
    ) -> Box<EncryptedState> {
        Box::new(EncryptedState::new(host, our_tag, their_tag, material))
    }

    fn finish(&mut self) -> (Option<DataMessage>, Box<PlaintextState>) {
        (None, Box::new(PlaintextState {}))
    }

    fn prepare(&mut self, _flags: MessageFlags, payload: &[u8]) -> Result<MessageBody, OtrError> {
        // not in an encrypted state, so the content passes through as-is
        Ok(MessageBody::Unencoded(Vec::from(payload)))
    }

    fn smp_mut(&mut self) -> Option<&mut SmpContext> {
        None
    }

    fn extra_symmetric_key(&self) -> Result<[u8; 32], OtrError> {
        Err(OtrError::IncorrectState("no confidential session established"))
    }
}

pub struct EncryptedState {
    version: Version,
    our_tag: InstanceTag,
    their_tag: InstanceTag,
    keys: KeyManager,
    smp: SmpContext,
}

impl MessageState for EncryptedState {
    fn status(&self) -> ProtocolStatus {
        ProtocolStatus::Encrypted
    }

    fn version(&self) -> Version {
        self.version
    }

    fn handle(
        &mut self,
        msg: &DataMessage,
    ) -> (Result<Handled, OtrError>, Option<Box<dyn MessageState>>) {
        match self.decrypt_and_process(msg) {
            Ok((handled, finished)) => {
                if finished {
                    (Ok(handled), Some(Box::new(FinishedState {})))
                } else {
                    (Ok(handled), None)
                }
            }
            Err(e) => (Err(e), None),
        }
    }

    fn secure(
        &self,
        host: Rc<dyn Host>,
        our_tag: InstanceTag,
        their_tag: InstanceTag,
        material: CryptographicMaterial,
    ) -> Box<EncryptedState> {
        Box::new(EncryptedState::new(host, our_tag, their_tag, material))
    }

    fn finish(&mut self) -> (Option<DataMessage>, Box<PlaintextState>) {
        // Session ends with an empty message carrying the disconnect TLV. The flag prevents the
        // other side from surfacing an error if the message cannot be read anymore.
        let payload = encode_payload(b"", &[TLV(TLV_TYPE_DISCONNECT, Vec::new())]);
        let disconnect = self.encrypt_payload(MessageFlags::IGNORE_UNREADABLE, &payload);
        (Some(disconnect), Box::new(PlaintextState {}))
    }

    fn prepare(&mut self, flags: MessageFlags, payload: &[u8]) -> Result<MessageBody, OtrError> {
        Ok(MessageBody::Data(self.encrypt_payload(flags, payload)))
    }

    fn smp_mut(&mut self) -> Option<&mut SmpContext> {
        Some(&mut self.smp)
    }

    fn extra_symmetric_key(&self) -> Result<[u8; 32], OtrError> {
        Ok(keys::extra_symmetric_key(&self.keys.current_shared_secret()))
    }
}

impl EncryptedState {
    fn new(
        host: Rc<dyn Host>,
        our_tag: InstanceTag,
        their_tag: InstanceTag,
        material: CryptographicMaterial,
    ) -> Self {
        let our_fingerprint = host.keypair().public_key().fingerprint();
        let their_fingerprint = material.their_dsa.fingerprint();
        let smp = SmpContext::new(
            Rc::clone(&host),
            our_fingerprint,
            their_fingerprint,
            material.ssid,
        );
        Self {
            version: material.version,
            our_tag,
            their_tag,
            keys: KeyManager::new((1, material.our_dh), (1, material.their_dh)),
            smp,
        }
    }

    fn encrypt_payload(&mut self, flags: MessageFlags, payload: &[u8]) -> DataMessage {
        let message_keys = self.keys.sending_keys();
        let (sender_keyid, _) = self.keys.current_keys();
        let (receiver_keyid, _) = self.keys.their_current();
        let (_, next_dh) = self.keys.next_keys();
        let dh_y = next_dh.public.clone();
        let ctr = self.keys.take_counter();
        let mut nonce = [0u8; 16];
        nonce[..8].copy_from_slice(&ctr);
        let encrypted = message_keys.send_aes.encrypt(&nonce, payload);
        let revealed = self.keys.take_reveal_macs();
        let mut message = DataMessage {
            flags,
            sender_keyid,
            receiver_keyid,
            dh_y,
            ctr,
            encrypted,
            authenticator: [0u8; 20],
            revealed,
        };
        let authenticator_data =
            encode_authenticator_data(&self.version, self.our_tag, self.their_tag, &message);
        message.authenticator = sha1::hmac(&message_keys.send_mac, &authenticator_data);
        message
    }

    fn decrypt_and_process(&mut self, msg: &DataMessage) -> Result<(Handled, bool), OtrError> {
        let message_keys = self
            .keys
            .receiving_keys(msg.receiver_keyid, msg.sender_keyid)?;
        // Authenticity first: nothing about our state may change on a message that does not
        // carry a valid MAC.
        let authenticator_data =
            encode_authenticator_data(&self.version, self.their_tag, self.our_tag, msg);
        let expected = sha1::hmac(&message_keys.recv_mac, &authenticator_data);
        constant::verify(&expected, &msg.authenticator).or(Err(OtrError::UnreadableMessage))?;
        self.keys
            .verify_counter(msg.receiver_keyid, msg.sender_keyid, &msg.ctr)?;
        dh::verify_element(&msg.dh_y).map_err(OtrError::CryptographicViolation)?;
        let mut nonce = [0u8; 16];
        nonce[..8].copy_from_slice(&msg.ctr);
        let payload = message_keys.recv_aes.decrypt(&nonce, &msg.encrypted);
        // The MAC key that just authenticated traffic becomes revealable after rotation.
        self.keys.register_used_mac_key(message_keys.recv_mac);
        self.keys.acknowledge_ours(msg.receiver_keyid)?;
        self.keys
            .register_their_key(msg.sender_keyid + 1, msg.dh_y.clone())?;
        let (message, tlvs) = decode_payload(&payload)?;
        let mut finished = false;
        let mut reply: Option<DataMessage> = None;
        for tlv in &tlvs {
            match tlv.0 {
                TLV_TYPE_PADDING => { /* deliberately ignored */ }
                TLV_TYPE_DISCONNECT => {
                    log::debug!("other party closed the confidential session");
                    finished = true;
                }
                TLV_TYPE_EXTRA_SYMMETRIC_KEY => {
                    log::debug!("other party makes use of the extra symmetric key");
                }
                typ if smp::is_smp_tlv(tlv) => {
                    log::trace!("processing SMP TLV type {typ}");
                    if let Some(response) = self.smp.handle(tlv) {
                        let payload = encode_payload(b"", &[response]);
                        reply = Some(
                            self.encrypt_payload(MessageFlags::IGNORE_UNREADABLE, &payload),
                        );
                    }
                }
                typ => log::debug!("ignoring TLV of unknown type {typ}"),
            }
        }
        let content = if message.is_empty() {
            None
        } else {
            Some(message)
        };
        Ok((Handled { content, reply }, finished))
    }
}

pub struct FinishedState {}

impl MessageState for FinishedState {
    fn status(&self) -> ProtocolStatus {
        ProtocolStatus::Finished
    }

    fn version(&self) -> Version {
        Version::None
    }

    fn handle(
        &mut self,
        _msg: &DataMessage,
    ) -> (Result<Handled, OtrError>, Option<Box<dyn MessageState>>) {
        (Err(OtrError::UnreadableMessage), None)
    }

    fn secure(
        &self,
        host: Rc<dyn Host>,
        our_tag: InstanceTag,
        their_tag: InstanceTag,
        material: CryptographicMaterial,
    ) -> Box<EncryptedState> {
        Box::new(EncryptedState::new(host, our_tag, their_tag, material))
    }

    fn finish(&mut self) -> (Option<DataMessage>, Box<PlaintextState>) {
        (None, Box::new(PlaintextState {}))
    }

    fn prepare(&mut self, _flags: MessageFlags, _payload: &[u8]) -> Result<MessageBody, OtrError> {
        // The other party is gone. Refuse to send rather than fall back to plaintext.
        Err(OtrError::IncorrectState(
            "confidential session is finished, no messages can be sent",
        ))
    }

    fn smp_mut(&mut self) -> Option<&mut SmpContext> {
        None
    }

    fn extra_symmetric_key(&self) -> Result<[u8; 32], OtrError> {
        Err(OtrError::IncorrectState("no confidential session established"))
    }
}

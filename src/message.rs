// SPDX-License-Identifier: LGPL-3.0-only

use bitflags::bitflags;
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::{
    ake,
    codec::{Decoder, Encodable, Encoder, CTR_HALF_LEN, MAC_LEN},
    instancetag::{InstanceTag, TAG_ZERO},
    keys::KeyID,
    utils, OtrError, Version,
};

const OTR_USE_INFORMATION_MESSAGE: &[u8] = b"An Off-The-Record conversation has been requested.";

const OTR_ERROR_PREFIX: &[u8] = b"?OTR Error:";
const OTR_QUERY_PREFIX: &[u8] = b"?OTRv";
const OTR_ENCODED_PREFIX: &[u8] = b"?OTR:";
const OTR_ENCODED_SUFFIX: &[u8] = b".";

const OTR_DH_COMMIT_TYPE_CODE: u8 = 0x02;
const OTR_DH_KEY_TYPE_CODE: u8 = 0x0a;
const OTR_REVEAL_SIGNATURE_TYPE_CODE: u8 = 0x11;
const OTR_SIGNATURE_TYPE_CODE: u8 = 0x12;
const OTR_DATA_TYPE_CODE: u8 = 0x03;

static QUERY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\?OTR\??(:?v(\d*))?\?").expect("BUG: failed to compile hard-coded regex-pattern")
});
const QUERY_GROUP_VERSIONS: usize = 1;
static WHITESPACE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r" \t  \t\t\t\t \t \t \t  (?:[ \t]{8})*")
        .expect("BUG: failed to compile hard-coded regex-pattern")
});
const WHITESPACE_PREFIX: &[u8] = b" \t  \t\t\t\t \t \t \t  ";
const WHITESPACE_TAG_OTRV1: &[u8] = b" \t \t  \t ";
const WHITESPACE_TAG_OTRV2: &[u8] = b"  \t\t  \t ";
const WHITESPACE_TAG_OTRV3: &[u8] = b"  \t\t  \t\t";

pub fn parse(data: &[u8]) -> Result<Message, OtrError> {
    if data.starts_with(OTR_ENCODED_PREFIX) && data.ends_with(OTR_ENCODED_SUFFIX) {
        let start = OTR_ENCODED_PREFIX.len();
        let end = data.len() - OTR_ENCODED_SUFFIX.len();
        parse_encoded_message(&data[start..end])
    } else {
        Ok(parse_plain_message(data))
    }
}

fn parse_encoded_message(data: &[u8]) -> Result<Message, OtrError> {
    let data = base64::decode(data).or(Err(OtrError::ProtocolViolation(
        "content cannot be decoded from base64",
    )))?;
    let mut decoder = Decoder::new(&data);
    let version: Version = match decoder.read_u16()? {
        0u16 => {
            return Err(OtrError::ProtocolViolation(
                "a protocol version must be provided",
            ))
        }
        2u16 => Version::V2,
        3u16 => Version::V3,
        version => return Err(OtrError::UnsupportedVersion(version)),
    };
    let message_type = decoder.read_u8()?;
    // Version 2 encoded messages do not carry instance tags.
    let (sender, receiver) = if version == Version::V3 {
        (decoder.read_instance_tag()?, decoder.read_instance_tag()?)
    } else {
        (TAG_ZERO, TAG_ZERO)
    };
    let body = parse_encoded_body(message_type, &mut decoder)?;
    decoder.done()?;
    Ok(Message::Encoded(EncodedMessage {
        version,
        sender,
        receiver,
        body,
    }))
}

fn parse_encoded_body(message_type: u8, decoder: &mut Decoder) -> Result<MessageBody, OtrError> {
    match message_type {
        OTR_DH_COMMIT_TYPE_CODE => Ok(MessageBody::DHCommit(ake::DHCommitMessage::decode(
            decoder,
        )?)),
        OTR_DH_KEY_TYPE_CODE => Ok(MessageBody::DHKey(ake::DHKeyMessage::decode(decoder)?)),
        OTR_REVEAL_SIGNATURE_TYPE_CODE => Ok(MessageBody::RevealSignature(
            ake::RevealSignatureMessage::decode(decoder)?,
        )),
        OTR_SIGNATURE_TYPE_CODE => Ok(MessageBody::Signature(ake::SignatureMessage::decode(
            decoder,
        )?)),
        OTR_DATA_TYPE_CODE => Ok(MessageBody::Data(DataMessage::decode(decoder)?)),
        _ => Err(OtrError::ProtocolViolation("unknown message type")),
    }
}

fn parse_plain_message(data: &[u8]) -> Message {
    if data.starts_with(OTR_ERROR_PREFIX) {
        // The `?OTR Error:` prefix must start at the beginning of the message so that plaintext
        // messages merely mentioning OTR errors are not swallowed.
        return Message::Error(Vec::from(&data[OTR_ERROR_PREFIX.len()..]));
    }
    if let Some(caps) = (*QUERY_PATTERN).captures(data) {
        let versions = caps
            .get(QUERY_GROUP_VERSIONS)
            .expect("BUG: hard-coded regex should contain capture group for versions");
        return Message::Query(
            versions
                .as_bytes()
                .iter()
                .map(|v| match v {
                    b'1' => Version::Unsupported(1u16),
                    b'2' => Version::V2,
                    b'3' => Version::V3,
                    _ => Version::Unsupported(u16::MAX),
                })
                .filter(|v| matches!(v, Version::V2 | Version::V3))
                .collect(),
        );
    }
    if let Some(found) = (*WHITESPACE_PATTERN).find(data) {
        let cleaned = (*WHITESPACE_PATTERN)
            .replace_all(data, b"".as_ref())
            .to_vec();
        // all version tags follow the fixed prefix, 8 bytes each
        let tags = &data[found.start() + WHITESPACE_PREFIX.len()..found.end()];
        return Message::Tagged(parse_whitespace_tags(tags), cleaned);
    }
    Message::Plaintext(data.to_vec())
}

fn parse_whitespace_tags(data: &[u8]) -> Vec<Version> {
    let mut result = Vec::new();
    for i in (0..data.len()).step_by(8) {
        match &data[i..i + 8] {
            WHITESPACE_TAG_OTRV1 => result.push(Version::Unsupported(1)),
            WHITESPACE_TAG_OTRV2 => result.push(Version::V2),
            WHITESPACE_TAG_OTRV3 => result.push(Version::V3),
            _ => { /* ignore unknown tags */ }
        }
    }
    result
}

#[allow(clippy::large_enum_variant)]
pub enum Message {
    Error(Vec<u8>),
    Plaintext(Vec<u8>),
    Tagged(Vec<Version>, Vec<u8>),
    Query(Vec<Version>),
    Encoded(EncodedMessage),
}

pub struct EncodedMessage {
    pub version: Version,
    pub sender: InstanceTag,
    pub receiver: InstanceTag,
    pub body: MessageBody,
}

impl Encodable for EncodedMessage {
    fn encode(&self, encoder: &mut Encoder) {
        encoder
            .write_u16(encode_version(&self.version))
            .write_u8(match self.body {
                MessageBody::Unencoded(_) => {
                    panic!("BUG: 'Unencoded' body must be reprocessed, it cannot be sent as-is")
                }
                MessageBody::DHCommit(_) => OTR_DH_COMMIT_TYPE_CODE,
                MessageBody::DHKey(_) => OTR_DH_KEY_TYPE_CODE,
                MessageBody::RevealSignature(_) => OTR_REVEAL_SIGNATURE_TYPE_CODE,
                MessageBody::Signature(_) => OTR_SIGNATURE_TYPE_CODE,
                MessageBody::Data(_) => OTR_DATA_TYPE_CODE,
            });
        if self.version == Version::V3 {
            encoder.write_u32(self.sender).write_u32(self.receiver);
        }
        encoder
            .write_encodable(match &self.body {
                MessageBody::Unencoded(_) => {
                    panic!("BUG: 'Unencoded' body must be reprocessed, it cannot be sent as-is")
                }
                MessageBody::DHCommit(msg) => msg,
                MessageBody::DHKey(msg) => msg,
                MessageBody::RevealSignature(msg) => msg,
                MessageBody::Signature(msg) => msg,
                MessageBody::Data(msg) => msg,
            });
    }
}

/// The OTR-encoded message bodies of protocol versions 2 and 3.
#[allow(clippy::large_enum_variant)]
pub enum MessageBody {
    /// `Unencoded` marks content that is not an OTR-encoded message, such as plaintext produced by
    /// the plaintext message-state. It must never be serialized as an encoded message.
    Unencoded(Vec<u8>),
    DHCommit(ake::DHCommitMessage),
    DHKey(ake::DHKeyMessage),
    RevealSignature(ake::RevealSignatureMessage),
    Signature(ake::SignatureMessage),
    Data(DataMessage),
}

bitflags! {
    pub struct MessageFlags: u8 {
        /// "Ignore unreadable": the receiver must not report an error to the user if this message
        /// cannot be decrypted.
        const IGNORE_UNREADABLE = 0b0000_0001;
    }
}

pub struct DataMessage {
    pub flags: MessageFlags,
    pub sender_keyid: KeyID,
    pub receiver_keyid: KeyID,
    pub dh_y: BigUint,
    // Top half of the AES counter. The full initial counter is these 8 bytes followed by 8 zero
    // bytes, so ciphertext length equals plaintext length.
    pub ctr: [u8; CTR_HALF_LEN],
    pub encrypted: Vec<u8>,
    pub authenticator: [u8; MAC_LEN],
    /// Old MAC keys that are being published now that they can no longer authenticate anything.
    pub revealed: Vec<u8>,
}

impl DataMessage {
    fn decode(decoder: &mut Decoder) -> Result<Self, OtrError> {
        let flags = MessageFlags::from_bits(decoder.read_u8()?)
            .ok_or(OtrError::ProtocolViolation("invalid message flags"))?;
        let sender_keyid = utils::u32::nonzero(decoder.read_u32()?)
            .ok_or(OtrError::ProtocolViolation("sender key id cannot be 0"))?;
        let receiver_keyid = utils::u32::nonzero(decoder.read_u32()?)
            .ok_or(OtrError::ProtocolViolation("receiver key id cannot be 0"))?;
        let dh_y = decoder.read_mpi()?;
        let ctr = decoder.read_ctr()?;
        let encrypted = decoder.read_data()?;
        let authenticator = decoder.read_mac()?;
        let revealed = decoder.read_data()?;
        Ok(Self {
            flags,
            sender_keyid,
            receiver_keyid,
            dh_y,
            ctr,
            encrypted,
            authenticator,
            revealed,
        })
    }
}

impl Encodable for DataMessage {
    fn encode(&self, encoder: &mut Encoder) {
        encoder
            .write_u8(self.flags.bits())
            .write_u32(self.sender_keyid)
            .write_u32(self.receiver_keyid)
            .write_mpi(&self.dh_y)
            .write_ctr(&self.ctr)
            .write_data(&self.encrypted)
            .write_mac(&self.authenticator)
            .write_data(&self.revealed);
    }
}

pub fn encode_message(
    version: Version,
    sender: InstanceTag,
    receiver: InstanceTag,
    body: MessageBody,
) -> Vec<u8> {
    serialize(&Message::Encoded(EncodedMessage {
        version,
        sender,
        receiver,
        body,
    }))
}

pub fn serialize(msg: &Message) -> Vec<u8> {
    let mut buffer = Vec::<u8>::new();
    match msg {
        Message::Error(error) => {
            buffer.extend_from_slice(OTR_ERROR_PREFIX);
            buffer.extend(error);
            buffer
        }
        Message::Plaintext(message) => {
            buffer.extend(message);
            buffer
        }
        Message::Tagged(versions, message) => {
            assert!(!versions.is_empty());
            buffer.extend_from_slice(WHITESPACE_PREFIX);
            for v in utils::vec::unique(versions.clone()) {
                match v {
                    Version::V2 => buffer.extend_from_slice(WHITESPACE_TAG_OTRV2),
                    Version::V3 => buffer.extend_from_slice(WHITESPACE_TAG_OTRV3),
                    Version::None | Version::Unsupported(_) => {
                        panic!("BUG: only supported versions can be tagged")
                    }
                }
            }
            assert!(buffer.len() >= WHITESPACE_PREFIX.len() + 8);
            buffer.extend(message);
            buffer
        }
        Message::Query(versions) => {
            assert!(!versions.is_empty());
            // each version listed at most once, in arbitrary order
            buffer.extend_from_slice(OTR_QUERY_PREFIX);
            for v in utils::vec::unique(versions.clone()) {
                match v {
                    Version::V2 => buffer.push(b'2'),
                    Version::V3 => buffer.push(b'3'),
                    Version::None | Version::Unsupported(_) => {
                        panic!("BUG: only supported versions can be queried")
                    }
                }
            }
            buffer.push(b'?');
            buffer.push(b' ');
            buffer.extend_from_slice(OTR_USE_INFORMATION_MESSAGE);
            buffer
        }
        Message::Encoded(encoded_message) => {
            buffer.extend_from_slice(OTR_ENCODED_PREFIX);
            buffer.extend(
                base64::encode(Encoder::new().write_encodable(encoded_message).to_vec())
                    .into_bytes(),
            );
            buffer.extend_from_slice(OTR_ENCODED_SUFFIX);
            buffer
        }
    }
}

/// `encode_authenticator_data` reconstructs the bytes over which a data message's HMAC is
/// computed: the message header and body up to and including the ciphertext. Version 2 headers
/// carry no instance tags.
pub fn encode_authenticator_data(
    version: &Version,
    sender: InstanceTag,
    receiver: InstanceTag,
    message: &DataMessage,
) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder
        .write_u16(encode_version(version))
        .write_u8(OTR_DATA_TYPE_CODE);
    if *version == Version::V3 {
        encoder.write_u32(sender).write_u32(receiver);
    }
    encoder
        .write_u8(message.flags.bits())
        .write_u32(message.sender_keyid)
        .write_u32(message.receiver_keyid)
        .write_mpi(&message.dh_y)
        .write_ctr(&message.ctr)
        .write_data(&message.encrypted)
        .to_vec()
}

fn encode_version(version: &Version) -> u16 {
    match version {
        Version::None => 0,
        Version::V2 => 2,
        Version::V3 => 3,
        Version::Unsupported(_) => panic!("BUG: unsupported version"),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse, serialize, Message};
    use crate::Version;

    #[test]
    fn test_parse_plaintext() {
        match parse(b"Hello world, nothing to see here.").unwrap() {
            Message::Plaintext(content) => {
                assert_eq!(b"Hello world, nothing to see here.".to_vec(), content);
            }
            _ => panic!("unexpected message type"),
        }
    }

    #[test]
    fn test_parse_error_message() {
        match parse(b"?OTR Error:something went wrong").unwrap() {
            Message::Error(content) => {
                assert_eq!(b"something went wrong".to_vec(), content);
            }
            _ => panic!("unexpected message type"),
        }
    }

    #[test]
    fn test_error_prefix_not_at_start_is_plaintext() {
        assert!(matches!(
            parse(b"I just got '?OTR Error:' from you").unwrap(),
            Message::Plaintext(_)
        ));
    }

    #[test]
    fn test_parse_query_versions() {
        match parse(b"?OTRv23? Care for some off-the-record chat?").unwrap() {
            Message::Query(versions) => {
                assert_eq!(vec![Version::V2, Version::V3], versions);
            }
            _ => panic!("unexpected message type"),
        }
        match parse(b"?OTRv3?").unwrap() {
            Message::Query(versions) => assert_eq!(vec![Version::V3], versions),
            _ => panic!("unexpected message type"),
        }
        // versions 1 and 4+ are not supported and must be filtered out
        match parse(b"?OTRv1459?").unwrap() {
            Message::Query(versions) => assert!(versions.is_empty()),
            _ => panic!("unexpected message type"),
        }
    }

    #[test]
    fn test_parse_whitespace_tagged() {
        let mut content = Vec::new();
        content.extend_from_slice(b"plain text before ");
        content.extend_from_slice(super::WHITESPACE_PREFIX);
        content.extend_from_slice(super::WHITESPACE_TAG_OTRV2);
        content.extend_from_slice(super::WHITESPACE_TAG_OTRV3);
        content.extend_from_slice(b" and after");
        match parse(&content).unwrap() {
            Message::Tagged(versions, cleaned) => {
                assert_eq!(vec![Version::V2, Version::V3], versions);
                assert_eq!(b"plain text before  and after".to_vec(), cleaned);
            }
            _ => panic!("unexpected message type"),
        }
    }

    #[test]
    fn test_parse_whitespace_tag_order_does_not_drop_versions() {
        let mut content = Vec::new();
        content.extend_from_slice(super::WHITESPACE_PREFIX);
        content.extend_from_slice(super::WHITESPACE_TAG_OTRV3);
        content.extend_from_slice(super::WHITESPACE_TAG_OTRV2);
        content.extend_from_slice(b"hello");
        match parse(&content).unwrap() {
            Message::Tagged(versions, cleaned) => {
                assert_eq!(vec![Version::V3, Version::V2], versions);
                assert_eq!(b"hello".to_vec(), cleaned);
            }
            _ => panic!("unexpected message type"),
        }
    }

    #[test]
    fn test_serialize_query() {
        let serialized = serialize(&Message::Query(vec![Version::V3, Version::V2]));
        assert!(serialized.starts_with(b"?OTRv23? "));
    }

    #[test]
    fn test_parse_rejects_bad_base64() {
        assert!(parse(b"?OTR:this is not base64!.").is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_version() {
        // version 1 header
        let encoded = base64::encode([0x00u8, 0x01, 0x02]);
        let mut content = Vec::from(&b"?OTR:"[..]);
        content.extend(encoded.into_bytes());
        content.push(b'.');
        assert!(parse(&content).is_err());
    }
}

// SPDX-License-Identifier: LGPL-3.0-only

#![deny(unused_must_use)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc, clippy::missing_panics_doc)]

use ake::AkeError;
use bitflags::bitflags;
use crypto::{dsa, CryptoError};
use instancetag::InstanceTag;

mod ake;
mod codec;
mod fragment;
mod keys;
mod message;
mod smp;
mod state;
mod utils;

pub mod crypto;
pub mod instancetag;
pub mod session;

/// `SessionEvent` is the result of processing, intended for the messaging client, possibly
/// containing content relevant to display to the user.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Nothing relevant to report back to the messaging client.
    None,
    /// Message for the user received over the open, plaintext transport.
    Plaintext(Vec<u8>),
    /// While encrypted sessions are present or the policy requires encryption, a message was
    /// received in plaintext. The client should warn the user.
    WarningUnencrypted(Vec<u8>),
    /// OTR error message received from the other party.
    Error(Vec<u8>),
    /// Message state reset to plaintext, by user action.
    Reset(InstanceTag),
    /// Confidential session established, now in the encrypted state.
    ConfidentialSessionStarted(InstanceTag),
    /// Message for the user received over the confidential OTR transport.
    Confidential(Vec<u8>),
    /// Confidential session ended by the other party, now in the finished state.
    ConfidentialSessionFinished(InstanceTag),
    /// SMP concluded with matching secrets. The other party is authenticated.
    SmpSucceeded(InstanceTag),
    /// SMP concluded without success: secrets differ, or the exchange was aborted.
    SmpFailed(InstanceTag),
}

/// `OtrError` is the enum containing the various errors that can occur.
#[derive(Debug)]
pub enum OtrError {
    /// Message contained invalid data according to the OTR protocol.
    ProtocolViolation(&'static str),
    /// Message payload is incomplete. The message cannot be reconstructed from the received bytes.
    IncompleteMessage,
    /// Encrypted message is unreadable, either corrupted or encrypted with unavailable keys.
    UnreadableMessage,
    /// An OTR message was received that is intended for a different instance (client).
    MessageForOtherInstance,
    /// Operation attempted for an instance (client) that has not been encountered.
    UnknownInstance,
    /// Encoded message for a protocol version that is not supported.
    UnsupportedVersion(u16),
    /// Operation is not available in the current protocol state.
    IncorrectState(&'static str),
    /// Violation of a cryptographic or mathematical requirement for correct, secure operation.
    CryptographicViolation(CryptoError),
    /// An error occurred during the authenticated key exchange.
    AuthenticationError(AkeError),
    /// Operation refused because the policy does not permit it.
    PolicyRestriction(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolStatus {
    Plaintext,
    Encrypted,
    Finished,
}

/// `Version` contains the supported OTR protocol versions.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub enum Version {
    None,
    V2,
    V3,
    Unsupported(u16),
}

bitflags! {
    /// `Policy` bit-flags indicate how the protocol should respond to events related to messaging
    /// and the OTR protocol.
    pub struct Policy: u32 {
    /// Allow version 2 of the OTR protocol to be used.
    const ALLOW_V2 = 0b0000_0010;
    /// Allow version 3 of the OTR protocol to be used.
    const ALLOW_V3 = 0b0000_0100;
    /// Refuse to send unencrypted messages.
    const REQUIRE_ENCRYPTION = 0b0000_1000;
    /// Advertise support of OTR using the whitespace tag.
    const SEND_WHITESPACE_TAG = 0b0001_0000;
    /// Start the key exchange upon receiving a whitespace tag.
    const WHITESPACE_START_AKE = 0b0010_0000;
    /// Start the key exchange upon receiving an OTR error message.
    const ERROR_START_AKE = 0b0100_0000;
    }
}

/// `Host` represents the interface to the host application, for calling back into the messaging
/// client.
pub trait Host {
    /// `inject` sends a message over the messaging transport. These are messages the protocol
    /// itself requires, so they are not returned to the client. Injection is assumed to succeed.
    fn inject(&self, message: &[u8]);

    /// `keypair` acquires the long-term DSA keypair, used for authentication purposes, from the
    /// host application. This leaves the host in control of which keypair belongs to which
    /// account.
    fn keypair(&self) -> dsa::Keypair;

    /// `smp_secret_requested` signals to the host application that the other party initiated SMP
    /// and the user must be asked for the answer, to be delivered through
    /// `session::Session::respond_smp`. A non-empty question was posed by the other party.
    fn smp_secret_requested(&self, _question: &[u8]) {}

    /// `update_fingerprint_verification` reports the authenticity verdict for the other party's
    /// DSA public key fingerprint after an SMP exchange concluded. The host may persist this in
    /// its fingerprint store.
    fn update_fingerprint_verification(&self, _fingerprint: &[u8; 20], _verified: bool) {}

    /// `max_message_size` is the transport's maximum size for a single message, used to decide on
    /// fragmentation. Zero means unlimited.
    fn max_message_size(&self) -> usize {
        0
    }
}

// SPDX-License-Identifier: LGPL-3.0-only

use once_cell::sync::Lazy;
use ring::rand::{SecureRandom, SystemRandom};

use crate::utils;

/// `InstanceTag` identifies a single client among the possibly multiple clients concurrently
/// logged in on the same account. Instance tags were introduced with OTR version 3 so that
/// multiple clients can maintain independent sessions. Tag `TAG_ZERO` signals the absence of a
/// tag: it is used for OTR version 2 traffic and while the peer's actual tag is still unknown.
pub type InstanceTag = u32;

pub const TAG_ZERO: InstanceTag = 0;

/// Tags in `(0, 0x100)` are reserved as invalid by the protocol.
const TAG_SMALLEST_VALID: InstanceTag = 0x0000_0100;

static RAND: Lazy<SystemRandom> = Lazy::new(SystemRandom::new);

pub fn verify(tag: u32) -> Result<InstanceTag, InstanceTagError> {
    if tag > TAG_ZERO && tag < TAG_SMALLEST_VALID {
        Err(InstanceTagError::IllegalValue(tag))
    } else {
        Ok(tag)
    }
}

/// `random_tag` produces a random instance tag from the valid range.
pub fn random_tag() -> InstanceTag {
    let mut value = [0u8; 4];
    loop {
        RAND.fill(&mut value)
            .expect("failed to acquire random bytes from the system");
        let tag = utils::u32::from_be(&value);
        if tag >= TAG_SMALLEST_VALID {
            return tag;
        }
    }
}

#[derive(Debug)]
pub enum InstanceTagError {
    IllegalValue(u32),
}

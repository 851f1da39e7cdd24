// SPDX-License-Identifier: LGPL-3.0-only

use std::fmt::Debug;

use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::{
    codec::Encodable,
    instancetag::{self, InstanceTag, TAG_ZERO},
    utils, Version,
};

const OTR_FRAGMENT_V2_PREFIX: &[u8] = b"?OTR,";
const OTR_FRAGMENT_V3_PREFIX: &[u8] = b"?OTR|";
const OTR_FRAGMENT_SUFFIX: &[u8] = b",";

const INDEX_FIRST_FRAGMENT: u16 = 1;

/// OTR version 3 fragments carry the sender and receiver instance tags in hexadecimal, then the
/// 1-based part index `k`, the total `n` and the piece itself:
///
/// > `"?OTR|%x|%x,%hu,%hu,%s," , sender_instance, receiver_instance, k , n , piece[k]`
///
/// Instance tags and the `k` and `n` values may carry leading zeroes.
static FRAGMENT_V3_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\?OTR\|([0-9a-fA-F]{1,8})\|([0-9a-fA-F]{1,8}),(\d{1,5}),(\d{1,5}),([A-Za-z0-9\+/=\?:\.]+),",
    )
    .unwrap()
});

/// OTR version 2 fragments are the same minus the instance tags: `"?OTR,%hu,%hu,%s,"`.
static FRAGMENT_V2_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\?OTR,(\d{1,5}),(\d{1,5}),([A-Za-z0-9\+/=\?:\.]+),").unwrap());

pub fn is_fragment(content: &[u8]) -> bool {
    (content.starts_with(OTR_FRAGMENT_V2_PREFIX) || content.starts_with(OTR_FRAGMENT_V3_PREFIX))
        && content.ends_with(OTR_FRAGMENT_SUFFIX)
}

/// `parse` recognizes version 2 and version 3 fragments. Version 2 fragments carry no instance
/// tags, so both tags are reported as `TAG_ZERO`.
pub fn parse(content: &[u8]) -> Option<Fragment> {
    if let Some(captures) = (*FRAGMENT_V3_PATTERN).captures(content) {
        let sender = hex::decode(pad_hex::<8>(captures.get(1).unwrap().as_bytes())).unwrap();
        let receiver = hex::decode(pad_hex::<8>(captures.get(2).unwrap().as_bytes())).unwrap();
        Some(Fragment {
            version: Version::V3,
            sender: instancetag::verify(utils::u32::from_be(&sender)).ok()?,
            receiver: instancetag::verify(utils::u32::from_be(&receiver)).ok()?,
            part: parse_u16(captures.get(3).unwrap().as_bytes())?,
            total: parse_u16(captures.get(4).unwrap().as_bytes())?,
            payload: Vec::from(captures.get(5).unwrap().as_bytes()),
        })
    } else if let Some(captures) = (*FRAGMENT_V2_PATTERN).captures(content) {
        Some(Fragment {
            version: Version::V2,
            sender: TAG_ZERO,
            receiver: TAG_ZERO,
            part: parse_u16(captures.get(1).unwrap().as_bytes())?,
            total: parse_u16(captures.get(2).unwrap().as_bytes())?,
            payload: Vec::from(captures.get(3).unwrap().as_bytes()),
        })
    } else {
        None
    }
}

fn parse_u16(digits: &[u8]) -> Option<u16> {
    std::str::from_utf8(digits).unwrap().parse::<u16>().ok()
}

fn pad_hex<const N: usize>(data: &[u8]) -> [u8; N] {
    let mut result = [b'0'; N];
    result[N - data.len()..].copy_from_slice(data);
    result
}

pub fn verify(fragment: &Fragment) -> Result<(), FragmentError> {
    if fragment.total == 0
        || fragment.part == 0
        || fragment.part > fragment.total
        || fragment.payload.is_empty()
    {
        Err(FragmentError::InvalidData)
    } else {
        Ok(())
    }
}

/// Overhead of the serialized version 3 fragment envelope with zero-padded tags and indices.
pub const OTRV3_HEADER_SIZE: usize = 36;
/// Overhead of the serialized version 2 fragment envelope.
pub const OTRV2_HEADER_SIZE: usize = 18;

/// `fragment` partitions content into parts such that each serialized fragment stays within
/// `max_size` bytes. The envelope overhead for the requested protocol version is part of that
/// budget. The function expects to be called when applicable, and panics otherwise.
///
/// # Panics
///
/// Panics if content already fits within `max_size`, if `max_size` leaves no room for a payload,
/// or if content is so large that it would require more than 65535 parts.
#[allow(clippy::cast_possible_truncation)]
pub fn fragment(
    max_size: usize,
    version: Version,
    sender: InstanceTag,
    receiver: InstanceTag,
    content: &[u8],
) -> Vec<Fragment> {
    let overhead = match version {
        Version::V2 => OTRV2_HEADER_SIZE,
        Version::V3 => OTRV3_HEADER_SIZE,
        Version::None | Version::Unsupported(_) => panic!("BUG: no version to fragment for"),
    };
    assert!(
        max_size > overhead,
        "BUG: maximum fragment size must exceed the envelope overhead"
    );
    assert!(
        content.len() > max_size,
        "BUG: content fits in a single message and must be sent as-is"
    );
    let fragment_size = max_size - overhead;
    let num_fragments = u16::try_from(
        content.len() / fragment_size + usize::from(content.len() % fragment_size > 0),
    )
    .unwrap();
    let mut fragments = Vec::<Fragment>::new();
    for pos in (0..content.len()).step_by(fragment_size) {
        let payload = &content[pos..usize::min(pos + fragment_size, content.len())];
        fragments.push(Fragment {
            version,
            sender,
            receiver,
            part: u16::try_from(fragments.len()).unwrap() + 1,
            total: num_fragments,
            payload: Vec::from(payload),
        });
    }
    fragments
}

pub struct Fragment {
    pub version: Version,
    pub sender: InstanceTag,
    pub receiver: InstanceTag,
    part: u16,
    total: u16,
    payload: Vec<u8>,
}

impl Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragment")
            .field("version", &self.version)
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("part", &self.part)
            .field("total", &self.total)
            .field("payload", &std::str::from_utf8(&self.payload).unwrap())
            .finish()
    }
}

impl Encodable for Fragment {
    fn encode(&self, encoder: &mut crate::codec::Encoder) {
        log::trace!("fragment to encode: {:?}", &self);
        // these capture internal logic errors, not peer misbehavior
        assert_ne!(self.part, 0);
        assert_ne!(self.total, 0);
        assert!(self.part <= self.total);
        assert!(!self.payload.is_empty());
        match self.version {
            Version::V2 => {
                assert_eq!(self.sender, TAG_ZERO);
                encoder
                    .write(OTR_FRAGMENT_V2_PREFIX)
                    .write(format!("{:05},{:05},", &self.part, &self.total).as_bytes());
            }
            Version::V3 => {
                assert!(instancetag::verify(self.sender).is_ok());
                assert_ne!(self.sender, TAG_ZERO);
                assert!(instancetag::verify(self.receiver).is_ok());
                encoder.write(OTR_FRAGMENT_V3_PREFIX).write(
                    format!(
                        "{:08x}|{:08x},{:05},{:05},",
                        &self.sender, &self.receiver, &self.part, &self.total
                    )
                    .as_bytes(),
                );
            }
            Version::None | Version::Unsupported(_) => panic!("BUG: no version to encode for"),
        }
        encoder.write(&self.payload).write(OTR_FRAGMENT_SUFFIX);
    }
}

/// `Assembler` reconstructs content from fragments delivered in order. Any out-of-sequence
/// fragment discards accumulated state.
pub struct Assembler {
    total: u16,
    last: u16,
    content: Vec<u8>,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            total: 0,
            last: 0,
            content: Vec::new(),
        }
    }

    pub fn assemble(&mut self, fragment: &Fragment) -> Result<Vec<u8>, FragmentError> {
        verify(fragment)?;
        if fragment.part == INDEX_FIRST_FRAGMENT {
            self.total = fragment.total;
            self.last = 1;
            self.content.clone_from(&fragment.payload);
        } else if fragment.total == self.total && fragment.part == self.last + 1 {
            self.last = fragment.part;
            self.content.extend(&fragment.payload);
        } else {
            self.reset();
            return Err(FragmentError::UnexpectedFragment);
        }
        if self.last == self.total {
            Ok(std::mem::take(&mut self.content))
        } else {
            Err(FragmentError::IncompleteResult)
        }
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.last = 0;
        self.content.clear();
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum FragmentError {
    /// Fragment contains part information that cannot produce a valid partitioning.
    InvalidData,
    /// Incomplete result. Waiting for more fragments to arrive.
    IncompleteResult,
    /// Unexpected fragment received. Assembler state was reset.
    UnexpectedFragment,
}

#[cfg(test)]
mod tests {
    use super::{fragment, is_fragment, parse, verify, Assembler, Fragment, FragmentError};
    use crate::{codec::Encoder, instancetag::TAG_ZERO, Version};

    #[test]
    fn test_is_fragment() {
        assert!(!is_fragment(b""));
        assert!(!is_fragment(b"fda6s7d8g6sa78f76ewaf687e"));
        assert!(is_fragment(b"?OTR,"));
        assert!(!is_fragment(b"?OTR|"));
        assert!(is_fragment(b"?OTR|,"));
        assert!(!is_fragment(b"?OTRsomethingrandom,"));
        assert!(!is_fragment(b"?OTR:."));
        assert!(!is_fragment(b"?OTR:,"));
    }

    #[test]
    fn test_verify_fragments() {
        let base = |part: u16, total: u16, payload: &str| Fragment {
            version: Version::V3,
            sender: 256,
            receiver: 256,
            part,
            total,
            payload: Vec::from(payload),
        };
        assert!(verify(&base(1, 1, "Hello")).is_ok());
        assert!(verify(&base(0, 1, "Hello")).is_err());
        assert!(verify(&base(1, 0, "Hello")).is_err());
        assert!(verify(&base(1, 1, "")).is_err());
        assert!(verify(&base(2, 1, "Hello")).is_err());
        assert!(verify(&base(11, 11, "Hello")).is_ok());
    }

    #[test]
    fn test_parse_not_a_fragment() {
        assert!(parse(b"").is_none());
        assert!(parse(b"fds7ag56sdaf67sd8a5f6se7895f6asd").is_none());
    }

    #[test]
    fn test_parse_v3_fragment() {
        let f = parse(b"?OTR|1f2e3d4c|1a2b3c4d,1,2,?OTR:encoded.,").unwrap();
        assert_eq!(Version::V3, f.version);
        assert_eq!(0x1f2e_3d4c_u32, f.sender);
        assert_eq!(0x1a2b_3c4d_u32, f.receiver);
        assert_eq!(1u16, f.part);
        assert_eq!(2u16, f.total);
        assert_eq!(b"?OTR:encoded.", f.payload.as_slice());
    }

    #[test]
    fn test_parse_v2_fragment() {
        let f = parse(b"?OTR,1,3,?OTR:encoded.,").unwrap();
        assert_eq!(Version::V2, f.version);
        assert_eq!(TAG_ZERO, f.sender);
        assert_eq!(TAG_ZERO, f.receiver);
        assert_eq!(1u16, f.part);
        assert_eq!(3u16, f.total);
        assert_eq!(b"?OTR:encoded.", f.payload.as_slice());
    }

    #[test]
    fn test_parse_fragment_base64_payload_characters() {
        let f = parse(b"?OTR|7a38ec40|60b07b61,00026,00029,+/5b9OkBSaV3fsR=,").unwrap();
        assert_eq!(Version::V3, f.version);
        assert_eq!(0x7a38_ec40_u32, f.sender);
        assert_eq!(0x60b0_7b61_u32, f.receiver);
        assert_eq!(26u16, f.part);
        assert_eq!(29u16, f.total);
        assert_eq!(b"+/5b9OkBSaV3fsR=", f.payload.as_slice());
    }

    #[test]
    fn test_parse_fragment_with_shorter_instance_tags() {
        let f = parse(b"?OTR|ec40|161,26,29,ab5b9OkBSaV3fsR=,").unwrap();
        assert_eq!(Version::V3, f.version);
        assert_eq!(0x0000_ec40_u32, f.sender);
        assert_eq!(0x0000_0161_u32, f.receiver);
    }

    #[test]
    fn test_fragment_known_vector() {
        const TESTCASE: &[u8;354] = b"?OTR:AAMDJ+MVmSfjFZcAAAAAAQAAAAIAAADA1g5IjD1ZGLDVQEyCgCyn9hbrL3KAbGDdzE2ZkMyTKl7XfkSxh8YJnudstiB74i4BzT0W2haClg6dMary/jo9sMudwmUdlnKpIGEKXWdvJKT+hQ26h9nzMgEditLB8vjPEWAJ6gBXvZrY6ZQrx3gb4v0UaSMOMiR5sB7Eaulb2Yc6RmRnnlxgUUC2alosg4WIeFN951PLjScajVba6dqlDi+q1H5tPvI5SWMN7PCBWIJ41+WvF+5IAZzQZYgNaVLbAAAAAAAAAAEAAAAHwNiIi5Ms+4PsY/L2ipkTtquknfx6HodLvk3RAAAAAA==.";
        const FRAGMENT0: &[u8;199] = b"?OTR|5a73a599|27e31597,00001,00003,?OTR:AAMDJ+MVmSfjFZcAAAAAAQAAAAIAAADA1g5IjD1ZGLDVQEyCgCyn9hbrL3KAbGDdzE2ZkMyTKl7XfkSxh8YJnudstiB74i4BzT0W2haClg6dMary/jo9sMudwmUdlnKpIGEKXWdvJKT+hQ26h9nzMgEditLB8v,";
        const FRAGMENT1: &[u8;199] = b"?OTR|5a73a599|27e31597,00002,00003,jPEWAJ6gBXvZrY6ZQrx3gb4v0UaSMOMiR5sB7Eaulb2Yc6RmRnnlxgUUC2alosg4WIeFN951PLjScajVba6dqlDi+q1H5tPvI5SWMN7PCBWIJ41+WvF+5IAZzQZYgNaVLbAAAAAAAAAAEAAAAHwNiIi5Ms+4PsY/L2i,";
        const FRAGMENT2: &[u8; 64] =
            b"?OTR|5a73a599|27e31597,00003,00003,pkTtquknfx6HodLvk3RAAAAAA==.,";
        let result = fragment(199, Version::V3, 0x5a73_a599, 0x27e3_1597, TESTCASE);
        assert_eq!(3, result.len());
        assert_eq!(
            FRAGMENT0.to_vec(),
            Encoder::new().write_encodable(&result[0]).to_vec()
        );
        assert_eq!(
            FRAGMENT1.to_vec(),
            Encoder::new().write_encodable(&result[1]).to_vec()
        );
        assert_eq!(
            FRAGMENT2.to_vec(),
            Encoder::new().write_encodable(&result[2]).to_vec()
        );
    }

    #[test]
    fn test_fragment_and_reassemble() {
        let content = b"?OTR:this is not really an encoded message but long enough to split up.";
        let parts = fragment(40, Version::V3, 0x0000_0100, 0x0000_0200, content);
        let mut assembler = Assembler::new();
        let mut outcome = None;
        for part in &parts {
            match assembler.assemble(part) {
                Ok(full) => outcome = Some(full),
                Err(FragmentError::IncompleteResult) => {}
                Err(e) => panic!("unexpected assembling failure: {e:?}"),
            }
        }
        assert_eq!(content.to_vec(), outcome.unwrap());
    }

    #[test]
    fn test_assembler_resets_on_out_of_order() {
        let content = b"?OTR:another sufficiently long message to be split into multiple parts.";
        let parts = fragment(40, Version::V3, 0x0000_0100, 0x0000_0200, content);
        assert!(parts.len() >= 3);
        let mut assembler = Assembler::new();
        assert!(matches!(
            assembler.assemble(&parts[0]),
            Err(FragmentError::IncompleteResult)
        ));
        assert!(matches!(
            assembler.assemble(&parts[2]),
            Err(FragmentError::UnexpectedFragment)
        ));
        // after the reset, restarting from the first fragment works
        assert!(matches!(
            assembler.assemble(&parts[1]),
            Err(FragmentError::UnexpectedFragment)
        ));
        assert!(matches!(
            assembler.assemble(&parts[0]),
            Err(FragmentError::IncompleteResult)
        ));
    }
}

// SPDX-License-Identifier: LGPL-3.0-only

use num_bigint::BigUint;

use crate::{
    crypto::dsa,
    instancetag::{self, InstanceTag},
    OtrError,
};

/// Length of the transmitted (top) half of the AES counter on data messages.
pub const CTR_HALF_LEN: usize = 8;
/// Length of the HMAC-SHA1 authenticator on data messages and of truncated AKE MACs.
pub const MAC_LEN: usize = 20;

pub type TlvType = u16;

/// Type-length-value record carried in the decrypted payload of a data message.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TLV(pub TlvType, pub Vec<u8>);

pub trait Encodable {
    fn encode(&self, encoder: &mut Encoder);
}

/// `Decoder` reads OTR-encoded fields from an untrusted byte-buffer. Every read can fail on
/// truncated or malformed input and must be handled as a `Result`.
pub struct Decoder<'a>(&'a [u8]);

impl Drop for Decoder<'_> {
    fn drop(&mut self) {
        if !self.0.is_empty() {
            // A non-drained buffer on drop either means the sender violated the message format or
            // decoding logic skipped a field.
            log::warn!("{} unread bytes left in discarded buffer", self.0.len());
        }
    }
}

impl<'a> Decoder<'a> {
    pub fn new(content: &'a [u8]) -> Self {
        Self(content)
    }

    pub fn read_u8(&mut self) -> Result<u8, OtrError> {
        log::trace!("read byte");
        if self.0.is_empty() {
            return Err(OtrError::IncompleteMessage);
        }
        let value = self.0[0];
        self.0 = &self.0[1..];
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16, OtrError> {
        log::trace!("read short");
        Ok(u16::from_be_bytes(self.read::<2>()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, OtrError> {
        log::trace!("read int");
        Ok(u32::from_be_bytes(self.read::<4>()?))
    }

    pub fn read_instance_tag(&mut self) -> Result<InstanceTag, OtrError> {
        log::trace!("read instance tag");
        instancetag::verify(self.read_u32()?)
            .or(Err(OtrError::ProtocolViolation("illegal instance tag")))
    }

    /// `read_data` reads a variable-length DATA field (4-byte length prefix).
    pub fn read_data(&mut self) -> Result<Vec<u8>, OtrError> {
        log::trace!("read DATA");
        let len = self.read_u32()? as usize;
        if self.0.len() < len {
            return Err(OtrError::IncompleteMessage);
        }
        let mut data = Vec::with_capacity(len);
        self.transfer(len, &mut data);
        Ok(data)
    }

    /// `read_mpi` reads a length-prefixed big-endian unsigned big integer.
    pub fn read_mpi(&mut self) -> Result<BigUint, OtrError> {
        log::trace!("read MPI");
        let len = self.read_u32()? as usize;
        if len == 0 {
            // a zero-length MPI encodes the value `0`
            return Ok(BigUint::from(0u8));
        }
        if self.0.len() < len {
            return Err(OtrError::IncompleteMessage);
        }
        let mpi = BigUint::from_bytes_be(&self.0[..len]);
        self.0 = &self.0[len..];
        Ok(mpi)
    }

    /// `read_mpi_sequence` reads a count-prefixed series of MPIs as used by SMP payloads.
    pub fn read_mpi_sequence(&mut self) -> Result<Vec<BigUint>, OtrError> {
        log::trace!("read MPI sequence");
        let count = self.read_u32()? as usize;
        let mut mpis = Vec::new();
        for _ in 0..count {
            mpis.push(self.read_mpi()?);
        }
        Ok(mpis)
    }

    pub fn read_ctr(&mut self) -> Result<[u8; CTR_HALF_LEN], OtrError> {
        log::trace!("read CTR");
        self.read::<CTR_HALF_LEN>()
    }

    pub fn read_mac(&mut self) -> Result<[u8; MAC_LEN], OtrError> {
        log::trace!("read MAC");
        self.read::<MAC_LEN>()
    }

    /// `read_public_key` reads a serialized DSA public key (key-type `0x0000`).
    pub fn read_public_key(&mut self) -> Result<dsa::PublicKey, OtrError> {
        log::trace!("read DSA public key");
        let keytype = self.read_u16()?;
        if keytype != 0u16 {
            return Err(OtrError::ProtocolViolation("unsupported public key type"));
        }
        let p = self.read_mpi()?;
        let q = self.read_mpi()?;
        let g = self.read_mpi()?;
        let y = self.read_mpi()?;
        dsa::PublicKey::from_components(p, q, g, y).map_err(OtrError::CryptographicViolation)
    }

    /// `read_signature` reads the fixed-length zero-padded `r ‖ s` DSA signature encoding.
    pub fn read_signature(&mut self) -> Result<dsa::Signature, OtrError> {
        log::trace!("read DSA signature");
        let r = self.read::<{ dsa::PARAM_Q_LEN }>()?;
        let s = self.read::<{ dsa::PARAM_Q_LEN }>()?;
        dsa::Signature::from_components(BigUint::from_bytes_be(&r), BigUint::from_bytes_be(&s))
            .map_err(OtrError::CryptographicViolation)
    }

    pub fn read_tlvs(&mut self) -> Result<Vec<TLV>, OtrError> {
        log::trace!("read TLVs until buffer is empty");
        let mut tlvs = Vec::new();
        while !self.0.is_empty() {
            tlvs.push(self.read_tlv()?);
        }
        Ok(tlvs)
    }

    pub fn read_tlv(&mut self) -> Result<TLV, OtrError> {
        log::trace!("read TLV");
        let typ = self.read_u16()?;
        let len = self.read_u16()? as usize;
        if self.0.len() < len {
            return Err(OtrError::IncompleteMessage);
        }
        let mut value = Vec::with_capacity(len);
        self.transfer(len, &mut value);
        Ok(TLV(typ, value))
    }

    /// `read_until_null` reads up to (and consuming, but not returning) the first NUL byte, or
    /// until the buffer is exhausted.
    pub fn read_until_null(&mut self) -> Vec<u8> {
        log::trace!("read until NUL or end of buffer");
        let mut taken = Vec::new();
        for i in 0..self.0.len() {
            if self.0[i] == 0 {
                self.transfer(i, &mut taken);
                self.0 = &self.0[1..];
                return taken;
            }
        }
        self.transfer(self.0.len(), &mut taken);
        taken
    }

    pub fn read<const N: usize>(&mut self) -> Result<[u8; N], OtrError> {
        if self.0.len() < N {
            return Err(OtrError::IncompleteMessage);
        }
        let mut buffer = [0u8; N];
        buffer.copy_from_slice(&self.0[..N]);
        self.0 = &self.0[N..];
        Ok(buffer)
    }

    fn transfer(&mut self, n: usize, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.0[..n]);
        self.0 = &self.0[n..];
    }

    /// `done` consumes the decoder, verifying that the buffer was fully drained.
    pub fn done(mut self) -> Result<(), OtrError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            self.0 = &[];
            Err(OtrError::ProtocolViolation("data remaining in buffer"))
        }
    }
}

pub struct Encoder {
    buffer: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write(&mut self, raw: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(raw);
        self
    }

    pub fn write_encodable(&mut self, encodable: &dyn Encodable) -> &mut Self {
        encodable.encode(self);
        self
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buffer.push(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buffer.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buffer.extend_from_slice(&v.to_be_bytes());
        self
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn write_data(&mut self, v: &[u8]) -> &mut Self {
        assert!(u32::try_from(v.len()).is_ok());
        self.write_u32(v.len() as u32);
        self.buffer.extend_from_slice(v);
        self
    }

    /// MPIs use minimum-length big-endian encoding without leading zero bytes. This matters when
    /// computing public key fingerprints.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_mpi(&mut self, v: &BigUint) -> &mut Self {
        if *v == BigUint::from(0u8) {
            return self.write_u32(0);
        }
        let encoded = v.to_bytes_be();
        assert_ne!(0, encoded[0], "BigUint must encode minimum-length");
        self.write_u32(encoded.len() as u32);
        self.write(&encoded)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn write_mpi_sequence(&mut self, mpis: &[&BigUint]) -> &mut Self {
        self.write_u32(mpis.len() as u32);
        for mpi in mpis {
            self.write_mpi(mpi);
        }
        self
    }

    pub fn write_ctr(&mut self, v: &[u8; CTR_HALF_LEN]) -> &mut Self {
        self.buffer.extend_from_slice(v);
        self
    }

    pub fn write_mac(&mut self, v: &[u8; MAC_LEN]) -> &mut Self {
        self.buffer.extend_from_slice(v);
        self
    }

    pub fn write_public_key(&mut self, key: &dsa::PublicKey) -> &mut Self {
        self.write_u16(0)
            .write_mpi(key.p())
            .write_mpi(key.q())
            .write_mpi(key.g())
            .write_mpi(key.y())
    }

    /// `write_signature` writes `r ‖ s`, each zero-padded to the 20-byte length of `q`.
    pub fn write_signature(&mut self, sig: &dsa::Signature) -> &mut Self {
        let mut fixed = [0u8; dsa::SIGNATURE_LEN];
        let r = sig.r().to_bytes_be();
        let s = sig.s().to_bytes_be();
        assert!(r.len() <= dsa::PARAM_Q_LEN && s.len() <= dsa::PARAM_Q_LEN);
        fixed[dsa::PARAM_Q_LEN - r.len()..dsa::PARAM_Q_LEN].copy_from_slice(&r);
        fixed[dsa::SIGNATURE_LEN - s.len()..].copy_from_slice(&s);
        self.write(&fixed)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn write_tlv(&mut self, tlv: &TLV) -> &mut Self {
        assert!(u16::try_from(tlv.1.len()).is_ok());
        self.write_u16(tlv.0).write_u16(tlv.1.len() as u16);
        self.buffer.extend_from_slice(&tlv.1);
        self
    }

    pub fn write_null_terminated(&mut self, data: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(data);
        self.buffer.push(0u8);
        self
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.clone()
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

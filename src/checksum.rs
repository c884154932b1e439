//! Pluggable arg checksums.
//!
//! Call bodies carry a checksum over the concatenation of
//! `(arg1, arg2, arg3)`: one type byte, followed by a 4-byte value for
//! every algorithm except `none`. Algorithms sit behind
//! [`ChecksumAlgorithm`] so the codec never hard-wires one.
//!
//! Built-ins: `none` (0x00) and `crc32` (0x01). The `farmhash32` id
//! (0x02) is reserved on the wire but has no built-in implementation.

use bytes::{BufMut, BytesMut};

use crate::error::{FramewireError, Result};

/// Wire ids for checksum algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChecksumType {
    /// No checksum; only the type byte is written.
    None = 0x00,
    /// CRC-32 (IEEE) over the concatenated args.
    Crc32 = 0x01,
    /// Reserved id; no built-in implementation.
    Farmhash32 = 0x02,
}

impl ChecksumType {
    /// Decode a checksum type byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(ChecksumType::None),
            0x01 => Ok(ChecksumType::Crc32),
            0x02 => Ok(ChecksumType::Farmhash32),
            other => Err(FramewireError::UnsupportedChecksum(other)),
        }
    }

    /// The wire byte for this type.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True when the type carries a 4-byte value on the wire.
    #[inline]
    pub fn carries_value(self) -> bool {
        !matches!(self, ChecksumType::None)
    }
}

/// A checksum algorithm that folds the three args into a 32-bit digest.
pub trait ChecksumAlgorithm: Send + Sync {
    /// The wire id this algorithm implements.
    fn type_id(&self) -> ChecksumType;

    /// Digest over `arg1 · arg2 · arg3`.
    fn digest(&self, arg1: &[u8], arg2: &[u8], arg3: &[u8]) -> u32;
}

/// CRC-32 over the concatenated args.
struct Crc32Algorithm;

impl ChecksumAlgorithm for Crc32Algorithm {
    fn type_id(&self) -> ChecksumType {
        ChecksumType::Crc32
    }

    fn digest(&self, arg1: &[u8], arg2: &[u8], arg3: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(arg1);
        hasher.update(arg2);
        hasher.update(arg3);
        hasher.finalize()
    }
}

/// Look up the built-in algorithm for a checksum type.
///
/// `Ok(None)` means the type carries no value (`none`). Reserved ids
/// without an implementation fail with `UnsupportedChecksum`.
fn algorithm_for(checksum_type: ChecksumType) -> Result<Option<&'static dyn ChecksumAlgorithm>> {
    match checksum_type {
        ChecksumType::None => Ok(None),
        ChecksumType::Crc32 => Ok(Some(&Crc32Algorithm)),
        ChecksumType::Farmhash32 => Err(FramewireError::UnsupportedChecksum(
            ChecksumType::Farmhash32.as_u8(),
        )),
    }
}

/// A checksum as carried by a call body: type plus wire value.
///
/// The value is meaningful only when the type carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum {
    checksum_type: ChecksumType,
    value: u32,
}

impl Checksum {
    /// The `none` checksum.
    pub fn none() -> Self {
        Self {
            checksum_type: ChecksumType::None,
            value: 0,
        }
    }

    /// Compute a checksum of the given type over the args.
    pub fn compute(
        checksum_type: ChecksumType,
        arg1: &[u8],
        arg2: &[u8],
        arg3: &[u8],
    ) -> Result<Self> {
        let value = match algorithm_for(checksum_type)? {
            Some(alg) => alg.digest(arg1, arg2, arg3),
            None => 0,
        };
        Ok(Self {
            checksum_type,
            value,
        })
    }

    /// Rebuild from wire fields. `value` is required iff the type
    /// carries one; the body grammar enforces that pairing.
    pub fn from_wire(checksum_type: ChecksumType, value: u32) -> Self {
        Self {
            checksum_type,
            value,
        }
    }

    /// The algorithm id.
    #[inline]
    pub fn checksum_type(&self) -> ChecksumType {
        self.checksum_type
    }

    /// The wire value (0 for `none`).
    #[inline]
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Encoded length: type byte plus value when carried.
    #[inline]
    pub fn wire_len(&self) -> usize {
        if self.checksum_type.carries_value() {
            5
        } else {
            1
        }
    }

    /// Append `csumtype:1` and, when carried, `csum:4`.
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.checksum_type.as_u8());
        if self.checksum_type.carries_value() {
            buf.put_u32(self.value);
        }
    }

    /// Recompute over the args and compare against the wire value.
    pub fn verify(&self, arg1: &[u8], arg2: &[u8], arg3: &[u8]) -> Result<()> {
        let Some(alg) = algorithm_for(self.checksum_type)? else {
            return Ok(());
        };
        let computed = alg.digest(arg1, arg2, arg3);
        if computed != self.value {
            return Err(FramewireError::ChecksumMismatch {
                expected: self.value,
                computed,
            });
        }
        Ok(())
    }
}

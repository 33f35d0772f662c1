//! Key codec
//!
//! Deterministic byte encodings for key types. Segment records carry their
//! own length prefix, so an encoding only has to round-trip one value.
//!
//! ## Encodings
//! - Unsigned integers: fixed-width big-endian
//! - Signed integers: big-endian with the sign bit flipped
//! - `String`: UTF-8 bytes
//! - `Vec<u8>`: the bytes themselves
//!
//! Every provided encoding sorts bytewise in the same order as the decoded
//! value, though the engine always compares decoded keys.

use std::fmt::Debug;

use bytes::{Buf, BufMut};

use crate::error::{LsmError, Result};

/// Byte encoding for keys and values
pub trait Codec: Sized {
    /// Append the encoded form to `buf`
    fn encode(&self, buf: &mut impl BufMut);

    /// Decode a value from exactly `bytes`
    fn decode(bytes: &[u8]) -> Result<Self>;

    /// Length of the encoded form in bytes
    fn encoded_len(&self) -> usize;

    /// Encode into a fresh buffer
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf
    }
}

/// Everything the tree needs from a key type: a total order plus a codec.
pub trait Key: Codec + Ord + Clone + Debug + Send + Sync + 'static {}

impl<T> Key for T where T: Codec + Ord + Clone + Debug + Send + Sync + 'static {}

fn expect_len(bytes: &[u8], expected: usize, type_name: &str) -> Result<()> {
    if bytes.len() != expected {
        return Err(LsmError::Codec(format!(
            "{}: expected {} bytes, got {}",
            type_name,
            expected,
            bytes.len()
        )));
    }
    Ok(())
}

macro_rules! impl_unsigned_codec {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl Codec for $ty {
                fn encode(&self, buf: &mut impl BufMut) {
                    buf.$put(*self);
                }

                fn decode(bytes: &[u8]) -> Result<Self> {
                    expect_len(bytes, std::mem::size_of::<$ty>(), stringify!($ty))?;
                    let mut bytes = bytes;
                    Ok(bytes.$get())
                }

                fn encoded_len(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }
            }
        )*
    };
}

impl_unsigned_codec! {
    u8 => put_u8, get_u8;
    u16 => put_u16, get_u16;
    u32 => put_u32, get_u32;
    u64 => put_u64, get_u64;
    u128 => put_u128, get_u128;
}

macro_rules! impl_signed_codec {
    ($($ty:ty as $uty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl Codec for $ty {
                fn encode(&self, buf: &mut impl BufMut) {
                    // Flipping the sign bit maps MIN..=MAX onto 0..=UMAX in order
                    const SIGN: $uty = 1 << (<$uty>::BITS - 1);
                    buf.$put((*self as $uty) ^ SIGN);
                }

                fn decode(bytes: &[u8]) -> Result<Self> {
                    expect_len(bytes, std::mem::size_of::<$ty>(), stringify!($ty))?;
                    const SIGN: $uty = 1 << (<$uty>::BITS - 1);
                    let mut bytes = bytes;
                    let raw = bytes.$get() ^ SIGN;
                    Ok(raw as $ty)
                }

                fn encoded_len(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }
            }
        )*
    };
}

impl_signed_codec! {
    i32 as u32 => put_u32, get_u32;
    i64 as u64 => put_u64, get_u64;
}

impl Codec for String {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| LsmError::Codec(format!("String: invalid UTF-8: {}", e)))
    }

    fn encoded_len(&self) -> usize {
        self.len()
    }
}

impl Codec for Vec<u8> {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(self);
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }

    fn encoded_len(&self) -> usize {
        self.len()
    }
}

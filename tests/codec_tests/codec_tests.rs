//! Codec Tests
//!
//! Tests verify:
//! - Fixed encodings for the provided key types
//! - Byte order matches value order
//! - Malformed input is rejected with a codec error
//! - A caller-defined key type works end to end with segments

use bytes::BufMut;
use lsmstore::storage::{write_segment, SegmentMeta, SegmentReader};
use lsmstore::{Codec, Entry, LsmError};
use tempfile::TempDir;

// =============================================================================
// Provided Encodings
// =============================================================================

#[test]
fn test_unsigned_is_big_endian() {
    assert_eq!(0x0102u16.to_bytes(), vec![0x01, 0x02]);
    assert_eq!(7u64.to_bytes(), vec![0, 0, 0, 0, 0, 0, 0, 7]);
    assert_eq!(u8::decode(&[9]).unwrap(), 9);
    assert_eq!(u128::MAX.encoded_len(), 16);
}

#[test]
fn test_signed_flips_sign_bit() {
    assert_eq!(0i32.to_bytes(), vec![0x80, 0, 0, 0]);
    assert_eq!((-1i32).to_bytes(), vec![0x7F, 0xFF, 0xFF, 0xFF]);
    assert_eq!(i64::decode(&i64::MIN.to_bytes()).unwrap(), i64::MIN);
    assert_eq!(i32::decode(&(-12_345i32).to_bytes()).unwrap(), -12_345);
}

#[test]
fn test_string_and_bytes_are_raw() {
    assert_eq!("héllo".to_string().to_bytes(), "héllo".as_bytes().to_vec());
    assert_eq!(vec![0u8, 255, 1].to_bytes(), vec![0, 255, 1]);
    assert_eq!(String::decode(b"").unwrap(), "");
    assert_eq!(Vec::<u8>::decode(b"").unwrap(), Vec::<u8>::new());
}

#[test]
fn test_byte_order_matches_value_order() {
    let mut values: Vec<i32> = vec![i32::MAX, -7, 0, i32::MIN, 3, -1];
    let mut encoded: Vec<Vec<u8>> = values.iter().map(Codec::to_bytes).collect();
    values.sort();
    encoded.sort();

    let decoded: Vec<i32> = encoded.iter().map(|b| i32::decode(b).unwrap()).collect();
    assert_eq!(decoded, values);
}

// =============================================================================
// Malformed Input
// =============================================================================

#[test]
fn test_wrong_width_is_codec_error() {
    assert!(matches!(u32::decode(&[1, 2]), Err(LsmError::Codec(_))));
    assert!(matches!(i64::decode(&[0; 9]), Err(LsmError::Codec(_))));
    assert!(matches!(u16::decode(&[]), Err(LsmError::Codec(_))));
}

#[test]
fn test_invalid_utf8_is_codec_error() {
    assert!(matches!(String::decode(&[0xFF, 0xFE]), Err(LsmError::Codec(_))));
}

// =============================================================================
// Caller-Defined Keys
// =============================================================================

/// (tenant, id) key ordered tenant first
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TenantKey {
    tenant: u16,
    id: u32,
}

impl Codec for TenantKey {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.tenant);
        buf.put_u32(self.id);
    }

    fn decode(bytes: &[u8]) -> lsmstore::Result<Self> {
        if bytes.len() != 6 {
            return Err(LsmError::Codec(format!("TenantKey: {} bytes", bytes.len())));
        }
        Ok(Self {
            tenant: u16::decode(&bytes[..2])?,
            id: u32::decode(&bytes[2..])?,
        })
    }

    fn encoded_len(&self) -> usize {
        6
    }
}

#[test]
fn test_custom_key_through_segment() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("seg_0000000001_000001.sst");

    let records: Vec<(TenantKey, Entry)> = (0..3u16)
        .flat_map(|tenant| {
            (0..3u32).map(move |id| {
                (TenantKey { tenant, id }, Entry::Value(vec![tenant as u8, id as u8]))
            })
        })
        .collect();
    write_segment(&path, SegmentMeta::flush(1, 1), records.clone()).unwrap();

    let reader = SegmentReader::<TenantKey>::open(&path).unwrap();
    assert_eq!(
        reader.find(&TenantKey { tenant: 1, id: 2 }).unwrap(),
        Some(Entry::Value(vec![1, 2]))
    );
    assert_eq!(reader.find(&TenantKey { tenant: 9, id: 0 }).unwrap(), None);

    let tenant_one: Vec<TenantKey> = reader
        .scan(TenantKey { tenant: 1, id: 0 }..TenantKey { tenant: 2, id: 0 })
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(tenant_one.len(), 3);
    assert!(tenant_one.iter().all(|k| k.tenant == 1));
}

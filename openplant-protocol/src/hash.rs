//! Stable identifiers derived from names.

use std::hash::Hasher;
use twox_hash::XxHash64;

/// Feeds `data` to the hasher with each byte ASCII-uppercased.
fn write_upper(hasher: &mut XxHash64, data: &[u8]) {
    let upper: Vec<u8> = data.iter().map(u8::to_ascii_uppercase).collect();
    hasher.write(&upper);
}

/// Deterministic 63-bit identifier of a key, case-insensitive.
pub fn make_uuid(key: &str) -> i64 {
    let mut hasher = XxHash64::with_seed(0);
    write_upper(&mut hasher, key.as_bytes());
    (hasher.finish() & (i64::MAX as u64)) as i64
}

/// Table id: the uppercased first four name bytes, big-endian, zero padded.
pub fn table_id(name: &str) -> u32 {
    let mut id = [0u8; 4];
    for (dst, src) in id.iter_mut().zip(name.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    u32::from_be_bytes(id)
}

/// Order and type dependent fingerprint of a column list.
pub fn fingerprint<'a>(columns: impl IntoIterator<Item = (&'a str, u8)>) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    for (name, vt) in columns {
        write_upper(&mut hasher, name.as_bytes());
        // terminator keeps ("AB", x) apart from ("A", ..) ("B", x)
        hasher.write_u8(0);
        hasher.write_u8(vt);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_uuid_case_insensitive() {
        assert_eq!(make_uuid("client-a"), make_uuid("CLIENT-A"));
        assert_ne!(make_uuid("client-a"), make_uuid("client-b"));
        assert!(make_uuid("anything") >= 0);
    }

    #[test]
    fn test_make_uuid_known_value() {
        // XXH64 of the empty input with seed 0 is 0xef46db3751d8e999.
        assert_eq!(make_uuid(""), 0x6f46_db37_51d8_e999);
    }

    #[test]
    fn test_make_uuid_matches_xxh64_of_uppercase() {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(b"POINT.1024");
        let expected = (hasher.finish() & i64::MAX as u64) as i64;
        assert_eq!(make_uuid("point.1024"), expected);
    }

    #[test]
    fn test_table_id() {
        assert_eq!(table_id("Realtime"), u32::from_be_bytes(*b"REAL"));
        assert_eq!(table_id("ab"), u32::from_be_bytes([b'A', b'B', 0, 0]));
        assert_eq!(table_id(""), 0);
    }

    #[test]
    fn test_fingerprint_order_dependent() {
        let a = fingerprint([("ID", 4), ("AV", 11)]);
        let b = fingerprint([("AV", 11), ("ID", 4)]);
        let c = fingerprint([("id", 4), ("av", 11)]);
        let d = fingerprint([("ID", 5), ("AV", 11)]);
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, d);
    }
}

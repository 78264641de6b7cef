//! Persisted cache entries and their binary encoding.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, PrimitiveDateTime};

use super::error::CacheError;

const FORMAT_RAW: u8 = 0;
const FORMAT_LZ4: u8 = 1;

/// A generated value together with the scope metadata it was produced under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub tags: BTreeSet<String>,
    pub lifetime: u64,
    #[serde(with = "time::serde::timestamp")]
    pub generated_at: OffsetDateTime,
    pub content: serde_json::Value,
}

impl CacheEntry {
    pub fn expires_at(&self) -> OffsetDateTime {
        expiry(self.generated_at, self.lifetime)
    }

    /// Seconds left until expiry, zero once expired.
    pub fn remaining_lifetime(&self, now: OffsetDateTime) -> u64 {
        let remaining = (self.expires_at() - now).whole_seconds();
        u64::try_from(remaining).unwrap_or(0)
    }
}

/// `from + lifetime` seconds, saturating at the latest representable instant.
pub(crate) fn expiry(from: OffsetDateTime, lifetime: u64) -> OffsetDateTime {
    i64::try_from(lifetime)
        .ok()
        .and_then(|seconds| from.checked_add(Duration::seconds(seconds)))
        .unwrap_or_else(|| PrimitiveDateTime::MAX.assume_utc())
}

/// Serialize an entry, optionally lz4-compressed, behind a one byte header.
pub fn encode(entry: &CacheEntry, compress: bool) -> Result<Vec<u8>, CacheError> {
    let json = serde_json::to_vec(entry)?;
    if !compress {
        let mut out = Vec::with_capacity(json.len() + 1);
        out.push(FORMAT_RAW);
        out.extend_from_slice(&json);
        return Ok(out);
    }

    let compressed = lz4::block::compress(&json, None, true)
        .map_err(|err| CacheError::Compression(err.to_string()))?;
    let mut out = Vec::with_capacity(compressed.len() + 1);
    out.push(FORMAT_LZ4);
    out.extend_from_slice(&compressed);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<CacheEntry, CacheError> {
    match bytes.split_first() {
        Some((&FORMAT_RAW, body)) => Ok(serde_json::from_slice(body)?),
        Some((&FORMAT_LZ4, body)) => {
            let json = lz4::block::decompress(body, None)
                .map_err(|err| CacheError::Compression(err.to_string()))?;
            Ok(serde_json::from_slice(&json)?)
        }
        Some((format, _)) => Err(CacheError::Compression(format!(
            "unknown entry format byte {format}"
        ))),
        None => Err(CacheError::Compression("empty cache entry".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> CacheEntry {
        CacheEntry {
            tags: BTreeSet::from(["pages_1".to_string(), "tt_content_4".to_string()]),
            lifetime: 3600,
            generated_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("timestamp"),
            content: json!({ "title": "Home", "children": [1, 2, 3] }),
        }
    }

    #[test]
    fn compressed_and_raw_encodings_decode_to_the_same_entry() {
        let entry = sample();
        let raw = encode(&entry, false).expect("raw encoding");
        let packed = encode(&entry, true).expect("lz4 encoding");

        assert_eq!(raw[0], FORMAT_RAW);
        assert_eq!(packed[0], FORMAT_LZ4);
        assert_eq!(decode(&raw).expect("raw decodes"), entry);
        assert_eq!(decode(&packed).expect("lz4 decodes"), entry);
    }

    #[test]
    fn unknown_headers_are_rejected() {
        assert!(matches!(decode(&[9, 1, 2]), Err(CacheError::Compression(_))));
        assert!(matches!(decode(&[]), Err(CacheError::Compression(_))));
    }

    #[test]
    fn remaining_lifetime_counts_down_to_zero() {
        let entry = sample();
        assert_eq!(entry.remaining_lifetime(entry.generated_at), 3600);
        assert_eq!(
            entry.remaining_lifetime(entry.generated_at + Duration::seconds(600)),
            3000
        );
        assert_eq!(
            entry.remaining_lifetime(entry.generated_at + Duration::hours(2)),
            0
        );
    }

    #[test]
    fn unbounded_lifetimes_saturate_instead_of_overflowing() {
        let entry = CacheEntry {
            lifetime: u64::MAX,
            ..sample()
        };
        let latest = PrimitiveDateTime::MAX.assume_utc();

        assert_eq!(entry.expires_at(), latest);
        assert_eq!(expiry(entry.generated_at, 400 * 365 * 86_400 * 100), latest);
        assert!(entry.remaining_lifetime(entry.generated_at) > 0);
    }
}

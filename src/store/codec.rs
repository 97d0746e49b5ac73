//! Payload codec for `event_data.data` blobs.
//!
//! Payloads are gzipped iff the original is >= 1024 bytes and the
//! gzipped output is smaller than the original; on read, the gzip magic
//! prefix (`0x1f 0x8b`) is sniffed and transparently inflated, so raw
//! and gzipped rows coexist across a schema's lifetime.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const COMPRESS_THRESHOLD: usize = 1024;

/// Returns the bytes to store, compressed when it is worth it.
pub fn encode_payload(raw: &[u8]) -> Vec<u8> {
    if raw.len() < COMPRESS_THRESHOLD {
        return raw.to_vec();
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(raw).is_err() {
        return raw.to_vec();
    }
    match encoder.finish() {
        Ok(compressed) if compressed.len() < raw.len() => compressed,
        _ => raw.to_vec(),
    }
}

/// Inflates `raw` if it carries the gzip magic prefix; otherwise passes
/// it through unchanged.
pub fn decode_payload(raw: &[u8]) -> Vec<u8> {
    if raw.len() >= 2 && raw[0..2] == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(raw);
        let mut out = Vec::new();
        if decoder.read_to_end(&mut out).is_ok() {
            return out;
        }
    }
    raw.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_is_not_compressed() {
        let raw = b"{\"x\":1}".to_vec();
        let encoded = encode_payload(&raw);
        assert_eq!(encoded, raw);
    }

    #[test]
    fn large_payload_round_trips() {
        let raw = serde_json::json!({"body": "x".repeat(4096)}).to_string().into_bytes();
        let encoded = encode_payload(&raw);
        assert!(encoded.len() < raw.len());
        assert_eq!(decode_payload(&encoded), raw);
    }

    #[test]
    fn unrecognised_bytes_pass_through() {
        let raw = b"plain text, not gzip".to_vec();
        assert_eq!(decode_payload(&raw), raw);
    }
}

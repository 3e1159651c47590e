//! Transfer framing: payload -> gzip -> seal to the recipient.
//!
//! Used for file bodies (`YES` replies) and manifest pushes/broadcasts. The
//! framed body has no length prefix; the sender closes its write half and the
//! receiver reads until EOF.

use crate::crypto::{seal, KeyPair};
use crate::error::{LynxError, Result};
use crate::protocol::MAX_BODY_SIZE;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compress a payload with gzip
pub fn compress(payload: &[u8]) -> Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::with_capacity(payload.len() / 2 + 64), Compression::fast());
    enc.write_all(payload)?;
    Ok(enc.finish()?)
}

/// Decompress a gzip stream, refusing output larger than `MAX_BODY_SIZE`
pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(compressed)
        .take(MAX_BODY_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| LynxError::Format(format!("corrupt compressed body: {e}")))?;
    if out.len() as u64 > MAX_BODY_SIZE {
        return Err(LynxError::Format("decompressed body exceeds size limit".into()));
    }
    Ok(out)
}

/// Frame a payload for the peer that announced `recipient_key`
pub fn encode_body(recipient_key: &str, payload: &[u8]) -> Result<Vec<u8>> {
    seal(recipient_key, &compress(payload)?)
}

/// Undo [`encode_body`] with our own keypair
pub fn decode_body(keys: &KeyPair, body: &[u8]) -> Result<Vec<u8>> {
    decompress(&keys.open(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framed_payload_decodes_for_recipient() {
        let bob = KeyPair::generate().unwrap();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let body = encode_body(&bob.public_hex(), &payload).unwrap();
        assert_eq!(decode_body(&bob, &body).unwrap(), payload);
    }

    #[test]
    fn empty_payload_is_framed() {
        let bob = KeyPair::generate().unwrap();
        let body = encode_body(&bob.public_hex(), b"").unwrap();
        assert!(decode_body(&bob, &body).unwrap().is_empty());
    }

    #[test]
    fn compressible_payload_shrinks() {
        let payload = vec![b'a'; 64 * 1024];
        assert!(compress(&payload).unwrap().len() < payload.len() / 10);
    }

    #[test]
    fn sealed_garbage_is_a_format_error() {
        let bob = KeyPair::generate().unwrap();
        let body = seal(&bob.public_hex(), b"definitely not gzip").unwrap();
        assert!(matches!(decode_body(&bob, &body), Err(LynxError::Format(_))));
    }

    #[test]
    fn wrong_recipient_is_a_crypto_error() {
        let bob = KeyPair::generate().unwrap();
        let eve = KeyPair::generate().unwrap();
        let body = encode_body(&bob.public_hex(), b"hello").unwrap();
        assert!(matches!(decode_body(&eve, &body), Err(LynxError::Crypto(_))));
    }
}

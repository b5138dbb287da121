// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Body encoding for the `revisions` table.
//!
//! Bodies are stored as JSON. Bodies at or above the configured threshold are
//! zstd-compressed; reads sniff the zstd frame magic, so a database may mix
//! both forms and the threshold can change between runs.

use crate::error::{Result, SyncError};
use crate::revision::Body;
use std::io::Read;

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

const ZSTD_LEVEL: i32 = 3;

/// Serialize a body, compressing it when it is at least `threshold` bytes.
pub fn encode_body(body: &Body, threshold: usize) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(body)?;
    if json.len() < threshold {
        return Ok(json);
    }

    let compressed = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)
        .map_err(|e| SyncError::Encoding(format!("zstd encode: {}", e)))?;
    crate::metrics::record_body_compressed(json.len(), compressed.len());
    Ok(compressed)
}

/// Inverse of [`encode_body`].
pub fn decode_body(data: &[u8]) -> Result<Body> {
    let json = maybe_decompress(data)?;
    let body: Body = serde_json::from_slice(&json)?;
    Ok(body)
}

/// Decompress zstd data if it carries the frame magic, otherwise pass through.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| SyncError::Encoding(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| SyncError::Encoding(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

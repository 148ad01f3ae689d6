//! Image encoding: step crop file → base64 `ImageData` for the proposer.
//!
//! Crops are already PNG on disk, so the file bytes are sent as-is rather
//! than decoded and re-encoded. `detail: "high"` instructs GPT-4-class
//! models to use the full image tile budget; assembly diagrams carry small
//! part numbers and arrow callouts that a single low-detail tile loses.

use crate::config::RasterFormat;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use std::path::Path;
use tracing::debug;

/// Wrap already-encoded image bytes for a vision request.
pub fn encode_bytes(bytes: &[u8], format: RasterFormat) -> ImageData {
    let b64 = STANDARD.encode(bytes);
    debug!("Encoded image → {} bytes base64", b64.len());
    ImageData::new(b64, format.mime_type()).with_detail("high")
}

/// Read a step image from disk and encode it.
pub async fn encode_step_image(path: &Path, format: RasterFormat) -> std::io::Result<ImageData> {
    let bytes = tokio::fs::read(path).await?;
    Ok(encode_bytes(&bytes, format))
}

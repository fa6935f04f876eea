use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::CompletionError;
use crate::prompt::{Content, ContentPart};

const IMAGE_FORMATS: [&str; 4] = ["png", "jpeg", "gif", "webp"];

/// What the store knows about an upload before reading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMeta {
    pub filename: String,
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl UploadMeta {
    #[must_use]
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// How the bytes of an upload should be produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadRequest {
    /// Target image format (`png`, `jpeg`, ...); `None` keeps the original bytes.
    pub format: Option<&'static str>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Source of upload bytes. Resizing and format conversion are the store's job.
pub trait UploadStore: Send + Sync {
    fn metadata(&self, upload_id: u64) -> Option<UploadMeta>;

    /// # Errors
    ///
    /// Returns [`CompletionError::Upload`] when the bytes cannot be produced.
    fn read(&self, upload_id: u64, request: &ReadRequest) -> Result<Vec<u8>, CompletionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadOptions {
    /// Pixel budget per image; larger images are requested scaled down.
    pub max_pixels: Option<u64>,
    /// Include non-image documents.
    pub allow_documents: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            max_pixels: Some(1_048_576),
            allow_documents: false,
        }
    }
}

/// Transport-ready content part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedContent {
    Text(String),
    Image {
        mime_type: String,
        /// Base64 payload.
        data: String,
    },
    Document {
        mime_type: String,
        filename: String,
        data: String,
    },
}

/// Resolve the upload references in `content` into encoded parts.
///
/// Missing uploads are skipped with a warning; documents are skipped unless
/// `options.allow_documents` is set.
///
/// # Errors
///
/// Propagates [`UploadStore::read`] failures.
pub fn content_with_encoded_uploads(
    content: &Content,
    store: &dyn UploadStore,
    options: &UploadOptions,
) -> Result<Vec<EncodedContent>, CompletionError> {
    let parts = match content {
        Content::Text(text) => return Ok(vec![EncodedContent::Text(text.clone())]),
        Content::Parts(parts) => parts,
    };
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            ContentPart::Text(text) => out.push(EncodedContent::Text(text.clone())),
            ContentPart::Upload(upload) => {
                if let Some(encoded) = encode_upload(upload.upload_id, store, options)? {
                    out.push(encoded);
                }
            }
        }
    }
    Ok(out)
}

fn encode_upload(
    upload_id: u64,
    store: &dyn UploadStore,
    options: &UploadOptions,
) -> Result<Option<EncodedContent>, CompletionError> {
    let Some(meta) = store.metadata(upload_id) else {
        tracing::warn!(upload_id, "upload not found; skipping");
        return Ok(None);
    };

    if !meta.is_image() {
        if !options.allow_documents {
            tracing::debug!(upload_id, mime = %meta.mime_type, "documents not allowed; skipping");
            return Ok(None);
        }
        let bytes = store.read(upload_id, &ReadRequest::default())?;
        return Ok(Some(EncodedContent::Document {
            mime_type: meta.mime_type,
            filename: meta.filename,
            data: STANDARD.encode(bytes),
        }));
    }

    let request = image_request(&meta, options.max_pixels);
    let bytes = store.read(upload_id, &request)?;
    let format = request.format.unwrap_or("png");
    Ok(Some(EncodedContent::Image {
        mime_type: format!("image/{format}"),
        data: STANDARD.encode(bytes),
    }))
}

fn image_request(meta: &UploadMeta, max_pixels: Option<u64>) -> ReadRequest {
    let subtype = meta
        .mime_type
        .strip_prefix("image/")
        .map(|s| if s == "jpg" { "jpeg" } else { s })
        .unwrap_or_default();
    let format = IMAGE_FORMATS
        .iter()
        .copied()
        .find(|f| *f == subtype)
        .unwrap_or("png");

    let (width, height) = match (meta.width, meta.height, max_pixels) {
        (Some(w), Some(h), Some(max)) if w > 0 && h > 0 && u64::from(w) * u64::from(h) > max => {
            scaled_dimensions(w, h, max)
        }
        _ => (None, None),
    };
    ReadRequest {
        format: Some(format),
        width,
        height,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn scaled_dimensions(w: u32, h: u32, max_pixels: u64) -> (Option<u32>, Option<u32>) {
    let scale = (max_pixels as f64 / (f64::from(w) * f64::from(h))).sqrt();
    let sw = ((f64::from(w) * scale).floor() as u32).max(1);
    let sh = ((f64::from(h) * scale).floor() as u32).max(1);
    (Some(sw), Some(sh))
}

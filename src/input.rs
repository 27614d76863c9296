//! Pipeline inputs handed over by the upload and auth layers

use crate::config::UploadConfig;
use crate::error::InvalidInput;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub enum ImageSource {
    Bytes(Bytes),
    Path(PathBuf),
}

/// An uploaded image as received from the upload layer
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub source: ImageSource,
    /// Name the client gave the file; doubles as the cache fingerprint
    pub original_filename: String,
    pub mime_type: String,
}

/// A validated image with its bytes in memory
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub bytes: Bytes,
    pub original_filename: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub ip: String,
    pub is_authenticated: bool,
}

impl CallerIdentity {
    pub fn guest(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            is_authenticated: false,
        }
    }

    pub fn authenticated(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            is_authenticated: true,
        }
    }
}

impl ImageInput {
    pub fn from_bytes(
        bytes: impl Into<Bytes>,
        original_filename: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            source: ImageSource::Bytes(bytes.into()),
            original_filename: original_filename.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn from_path(
        path: impl Into<PathBuf>,
        original_filename: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            source: ImageSource::Path(path.into()),
            original_filename: original_filename.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Cache key for this input
    pub fn fingerprint(&self) -> &str {
        &self.original_filename
    }

    /// Validate type and size, load the bytes, and check they look like an
    /// image. Nothing reaches a backend without passing through here.
    pub async fn prepare(self, limits: &UploadConfig) -> Result<PreparedImage, InvalidInput> {
        check_type(&self.original_filename, &self.mime_type, &limits.allowed_types)?;

        let bytes = match self.source {
            ImageSource::Bytes(bytes) => bytes,
            ImageSource::Path(path) => {
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| InvalidInput::Unreadable(format!("{}: {}", path.display(), e)))?;
                if meta.len() as usize > limits.max_bytes {
                    return Err(InvalidInput::TooLarge {
                        size: meta.len() as usize,
                        limit: limits.max_bytes,
                    });
                }
                tokio::fs::read(&path)
                    .await
                    .map(Bytes::from)
                    .map_err(|e| InvalidInput::Unreadable(format!("{}: {}", path.display(), e)))?
            }
        };

        if bytes.is_empty() {
            return Err(InvalidInput::Empty);
        }
        if bytes.len() > limits.max_bytes {
            return Err(InvalidInput::TooLarge {
                size: bytes.len(),
                limit: limits.max_bytes,
            });
        }
        if image::guess_format(&bytes).is_err() {
            return Err(InvalidInput::NotAnImage);
        }

        Ok(PreparedImage {
            bytes,
            original_filename: self.original_filename,
            mime_type: self.mime_type,
        })
    }
}

fn check_type(filename: &str, mime_type: &str, allowed: &[String]) -> Result<(), InvalidInput> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    let mime = mime_type.to_lowercase();
    let subtype = mime.strip_prefix("image/").unwrap_or("");

    let ext_ok = allowed.iter().any(|t| *t == extension);
    let mime_ok = allowed.iter().any(|t| *t == subtype);

    if ext_ok && mime_ok {
        Ok(())
    } else {
        Err(InvalidInput::UnsupportedType {
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
        })
    }
}

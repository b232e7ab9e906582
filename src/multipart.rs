use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use mime_guess::{mime, Mime};
use multipart::client::lazy::Multipart;
use serde::Deserialize;

use crate::error::{Error, Result};

/// One multipart field as given in a request description.
///
/// Exactly one of `value` (text field) or `file` (file part) must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MultipartField {
    /// Field name
    pub name: String,
    /// Text value
    pub value: Option<String>,
    /// File to upload
    pub file: Option<PathBuf>,
    /// File name sent to the server (defaults to the path's file name)
    pub filename: Option<String>,
    /// Content type of the part (guessed from the file extension when unset)
    pub content_type: Option<String>,
}

impl MultipartField {
    /// Create a text field
    pub fn text(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Self::default()
        }
    }

    /// Create a file field
    pub fn file(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            file: Some(path.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
enum PartContent {
    Text(String),
    File(PathBuf),
    Bytes(Bytes),
}

#[derive(Debug, Clone)]
struct Part {
    name: String,
    content: PartContent,
    filename: Option<String>,
    content_type: Option<String>,
}

/// An encoded `multipart/form-data` body
#[derive(Debug, Clone)]
pub struct EncodedForm {
    boundary: String,
    body: Bytes,
}

impl EncodedForm {
    /// Boundary separating the parts
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// `Content-Type` header value for this body
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }
}

/// Multipart form data builder
///
/// Parts are encoded in insertion order; file contents are read when the
/// form is encoded.
#[derive(Debug, Clone, Default)]
pub struct MultipartBuilder {
    parts: Vec<Part>,
}

impl MultipartBuilder {
    /// Create a new, empty multipart builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from request-description fields
    pub fn from_fields(fields: &[MultipartField]) -> Result<Self> {
        fields.iter().try_fold(Self::new(), |builder, field| {
            if field.name.is_empty() {
                return Err(Error::multipart("multipart field without a name"));
            }
            let content = match (&field.value, &field.file) {
                (Some(value), None) => PartContent::Text(value.clone()),
                (None, Some(path)) => PartContent::File(path.clone()),
                _ => {
                    return Err(Error::multipart(format!(
                        "field '{}' needs exactly one of value or file",
                        field.name
                    )))
                }
            };
            Ok(builder.push(Part {
                name: field.name.clone(),
                content,
                filename: field.filename.clone(),
                content_type: field.content_type.clone(),
            }))
        })
    }

    fn push(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    /// Add a text field
    pub fn text(self, name: &str, value: &str) -> Self {
        self.push(Part {
            name: name.to_string(),
            content: PartContent::Text(value.to_string()),
            filename: None,
            content_type: None,
        })
    }

    /// Add a file field
    pub fn file(self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.push(Part {
            name: name.to_string(),
            content: PartContent::File(path.into()),
            filename: None,
            content_type: None,
        })
    }

    /// Add an in-memory file part
    pub fn bytes(self, name: &str, data: impl Into<Bytes>, filename: &str) -> Self {
        self.push(Part {
            name: name.to_string(),
            content: PartContent::Bytes(data.into()),
            filename: Some(filename.to_string()),
            content_type: None,
        })
    }

    /// Number of parts
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Encode the form, reading file parts from disk
    pub async fn encode(&self) -> Result<EncodedForm> {
        let parts = self.parts.clone();
        tokio::task::spawn_blocking(move || encode_parts(parts))
            .await
            .map_err(|e| Error::multipart(format!("form encoding task failed: {}", e)))?
    }
}

fn encode_parts(parts: Vec<Part>) -> Result<EncodedForm> {
    let mut form = Multipart::new();
    for part in parts {
        match part.content {
            PartContent::Text(text) => {
                form.add_text(part.name, text);
            }
            PartContent::File(path) => {
                let file = File::open(&path).map_err(|e| {
                    Error::multipart(format!("Failed to read file {}: {}", path.display(), e))
                })?;
                let mime = part_mime(part.content_type.as_deref(), Some(&path))?;
                let filename = part.filename.unwrap_or_else(|| file_name(&path));
                form.add_stream(part.name, file, Some(filename), Some(mime));
            }
            PartContent::Bytes(data) => {
                let mime = part_mime(part.content_type.as_deref(), None)?;
                form.add_stream(part.name, Cursor::new(data), part.filename, Some(mime));
            }
        }
    }

    let mut prepared = form
        .prepare()
        .map_err(|e| Error::multipart(format!("Failed to prepare form: {}", e.error)))?;
    let boundary = prepared.boundary().to_string();
    let mut body = Vec::new();
    prepared
        .read_to_end(&mut body)
        .map_err(|e| Error::multipart(format!("Failed to encode form: {}", e)))?;
    Ok(EncodedForm {
        boundary,
        body: Bytes::from(body),
    })
}

/// Content type of a file part: the explicit one, else a guess from the path
fn part_mime(explicit: Option<&str>, path: Option<&Path>) -> Result<Mime> {
    match explicit {
        Some(content_type) => content_type
            .parse()
            .map_err(|_| Error::multipart(format!("invalid content type '{}'", content_type))),
        None => Ok(path
            .map(|path| mime_guess::from_path(path).first_or_octet_stream())
            .unwrap_or(mime::APPLICATION_OCTET_STREAM)),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string()
}

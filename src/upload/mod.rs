//! File uploads.
//!
//! An [`UploadSpec`] names the file being uploaded and where its bytes come
//! from, plus any extra request fields passed through verbatim. The
//! [`encoder`] turns a spec into a streamed JSON request body.

pub mod encoder;

use std::path::PathBuf;

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::api::ClientError;

pub use encoder::PreparedUpload;

/// Request field carrying the upload's file name.
pub const FILENAME_FIELD: &str = "filename";

/// Request field carrying the base64 payload.
pub const DATA_FIELD: &str = "data";

/// Where the uploaded bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadData {
    /// Read and encode a local file.
    File(PathBuf),
    /// Already base64-encoded content; validated before sending.
    Base64(String),
    /// Raw bytes, encoded while streaming.
    Bytes(Bytes),
}

/// One upload request.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadSpec {
    filename: String,
    data: UploadData,
    fields: Map<String, Value>,
}

impl UploadSpec {
    /// Uploads the file at `path`; its path string doubles as the remote name.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            filename: path.to_string_lossy().into_owned(),
            data: UploadData::File(path),
            fields: Map::new(),
        }
    }

    /// Uploads explicit content under `filename`.
    pub fn with_data(filename: impl Into<String>, data: UploadData) -> Self {
        Self {
            filename: filename.into(),
            data,
            fields: Map::new(),
        }
    }

    /// Builds a spec from free-form request fields.
    ///
    /// `filename` is required. A string `data` field is taken as pre-encoded
    /// content; otherwise `filename` is read as a local path. Every other
    /// field is sent unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidRequest`] if `filename` is missing, not a
    /// string, or empty, or if `data` is present but not a string.
    pub fn from_fields(mut fields: Map<String, Value>) -> Result<Self, ClientError> {
        let filename = match fields.remove(FILENAME_FIELD) {
            Some(Value::String(name)) if !name.trim().is_empty() => name,
            Some(Value::String(_)) | None => {
                return Err(ClientError::invalid_request("upload requires a non-empty `filename`"));
            }
            Some(other) => {
                return Err(ClientError::invalid_request(format!(
                    "`filename` must be a string, got {other}"
                )));
            }
        };
        let data = match fields.remove(DATA_FIELD) {
            Some(Value::String(encoded)) => UploadData::Base64(encoded),
            Some(Value::Null) | None => UploadData::File(PathBuf::from(&filename)),
            Some(_) => {
                return Err(ClientError::invalid_request("`data` must be a base64 string"));
            }
        };
        Ok(Self {
            filename,
            data,
            fields,
        })
    }

    /// Adds or replaces an extra request field. `filename` and `data` are
    /// controlled by the spec itself and are ignored here.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != FILENAME_FIELD && key != DATA_FIELD {
            self.fields.insert(key, value.into());
        }
        self
    }

    /// Remote file name.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Content source.
    #[must_use]
    pub fn data(&self) -> &UploadData {
        &self.data
    }

    /// Extra request fields.
    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

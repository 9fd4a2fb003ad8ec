use thiserror::Error;

use crate::types::TypeKind;

pub type ZarrResult<T> = Result<T, ZarrError>;

#[derive(Error, Debug)]
pub enum ZarrError {
    /// The metadata declares a `zarr_format` other than 2 (or none at all).
    #[error("unsupported zarr format: {}", display_format(.0))]
    UnsupportedFormat(Option<serde_json::Value>),

    #[error("failed to decode dtype: {0}")]
    TypeDecode(String),

    #[error("unsupported fill value for {kind} dtype: {reason}")]
    UnsupportedFillValue { kind: TypeKind, reason: String },

    #[error("invalid base64 fill value for {kind} dtype: {source}")]
    InvalidBase64 {
        kind: TypeKind,
        #[source]
        source: base64::DecodeError,
    },

    /// Wraps whatever went wrong while extracting fields from a parsed record.
    #[error("error decoding metadata: {0}")]
    MetadataDecode(#[source] Box<ZarrError>),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("object codec decode error: {0}")]
    ObjectCodecDecode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encode error: {0}")]
    Encode(String),
}

impl ZarrError {
    pub(crate) fn metadata(err: impl Into<ZarrError>) -> Self {
        match err.into() {
            wrapped @ ZarrError::MetadataDecode(_) => wrapped,
            other => ZarrError::MetadataDecode(Box::new(other)),
        }
    }

    pub(crate) fn fill(kind: TypeKind, reason: impl Into<String>) -> Self {
        ZarrError::UnsupportedFillValue {
            kind,
            reason: reason.into(),
        }
    }
}

fn display_format(version: &Option<serde_json::Value>) -> String {
    match version {
        Some(v) => v.to_string(),
        None => "None".to_string(),
    }
}

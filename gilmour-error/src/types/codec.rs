use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки кодирования/декодирования конверта сообщения.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("failed to decode envelope: {0}")]
    Decode(String),
}

impl ErrorExt for CodecError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Encode(_) => StatusCode::Internal,
            Self::Decode(_) => StatusCode::BadRequest,
        }
    }
}

use std::io;

use thiserror::Error;

use crate::{CodecError, ErrorExt, StatusCode, StoreError};

/// Ошибки публичного API бэкенда.
///
/// Сбои внутреннего учёта (health, телеметрия ошибок) сюда не попадают:
/// они логируются и поглощаются на месте.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Для этого reply-топика уже есть незавершённая корреляция.
    #[error("a request is already pending on '{0}'")]
    DuplicateCorrelation(String),

    /// Бэкенд остановлен вызовом `stop()`.
    #[error("backend is stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ErrorExt for BackendError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Store(err) => err.status_code(),
            Self::Codec(err) => err.status_code(),
            Self::DuplicateCorrelation(_) => StatusCode::BadRequest,
            Self::Stopped | Self::Io(_) | Self::Config(_) => StatusCode::Internal,
        }
    }
}

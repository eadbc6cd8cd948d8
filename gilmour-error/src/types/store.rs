use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки выполнения команд хранилища.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Цикл событий так и не установил соединение.
    #[error("store connection was never established")]
    NotConnected,

    /// Соединение закрыто, команда не может быть выполнена.
    #[error("store connection is closed")]
    Closed,

    /// Операция применена к ключу с другим типом значения.
    #[error("WRONGTYPE operation against key '{key}' holding the wrong kind of value")]
    WrongType { key: String },

    /// Индекс базы вне допустимого диапазона.
    #[error("invalid db index {index} (store has {available} databases)")]
    InvalidDb { index: usize, available: usize },

    /// Невалидный glob-шаблон подписки.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Любая другая ошибка, возвращённая хранилищем.
    #[error("store command failed: {0}")]
    Command(String),
}

impl ErrorExt for StoreError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::WrongType { .. } | Self::InvalidPattern { .. } => StatusCode::BadRequest,
            _ => StatusCode::Internal,
        }
    }
}

pub mod ext;
pub mod status_code;
pub mod types;

// Публичный реэкспорт всех типов ошибок из вложенных модулей, чтобы упростить
// доступ к ним из внешнего кода.
pub use ext::*;
pub use status_code::*;
pub use types::*;

pub type StoreResult<T> = Result<T, StoreError>;
pub type BackendResult<T> = Result<T, BackendError>;

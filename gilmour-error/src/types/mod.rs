pub mod backend;
pub mod codec;
pub mod store;

// Публичный экспорт всех типов ошибок из вложенных модулей, чтобы упростить
// доступ к ним из внешнего кода.
pub use backend::*;
pub use codec::*;
pub use store::*;

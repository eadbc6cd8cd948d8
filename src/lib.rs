/// Фасад бэкенда: отправка, подписки, ответы, здоровье, остановка.
pub mod backend;
/// Одноразовая защёлка старта между конструктором и потоком цикла.
pub mod barrier;
/// Загрузка настроек (крейт `config`, окружение `GILMOUR_*`).
pub mod config;
/// Незавершённые запросы, reply-топики и таймауты.
pub mod correlation;
/// Конверт сообщения и кодек.
pub mod envelope;
/// Поток цикла событий, владеющий соединением с хранилищем.
pub mod event_loop;
/// Хеш присутствия и обработчик интроспекции.
pub mod health;
pub mod identity;
/// Эксклюзивное выполнение через `SET NX`.
pub mod lock;
/// Настройка логирования (tracing-subscriber).
pub mod logging;
/// Отчёты об ошибках: отключены, broadcast или буфер.
pub mod reporter;
pub mod responder;
/// Привязки топик → обработчик и диспетчеризация.
pub mod registry;
/// Интерфейс хранилища и его реализация в памяти процесса.
pub mod store;
/// Зарезервированные пространства имён топиков.
pub mod topics;
/// Пул потоков для обработчиков и продолжений команд хранилища.
pub mod worker;

// -----------------------------------------------------------------------------
//  Часто используемые публичные типы
// -----------------------------------------------------------------------------

pub use backend::{Backend, SendOptions};
pub use crate::config::{ErrorReporting, Settings};
pub use correlation::ReplyHandler;
pub use envelope::{Envelope, EnvelopeCodec, JsonCodec};
pub use gilmour_error::{BackendError, BackendResult, CodecError, StatusCode, StoreError};
pub use identity::NodeIdentity;
pub use registry::{Binding, Listener};
pub use reporter::{ErrorReport, ErrorReportMode};
pub use responder::Responder;
pub use store::{Connection, Connector, MemoryConnector, MemoryStore, StoreAddress};

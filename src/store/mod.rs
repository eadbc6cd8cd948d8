//! Интерфейс хранилища, которым пользуется бэкенд.
//!
//! Бэкенд не обращается к хранилищу напрямую. Каждая команда ставится в
//! очередь [`StoreHandle`] и выполняется циклом событий, единственным
//! владельцем [`Connection`]. Результат возвращается через oneshot-канал и
//! ожидается той задачей пула, которой он нужен.
//!
//! - `broker`: рассылка pub/sub с поддержкой glob-шаблонов;
//! - `memory`: keyspace в памяти процесса и коннектор к нему.

pub mod broker;
pub mod memory;

use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use gilmour_error::{StoreError, StoreResult};
use tokio::sync::{mpsc, oneshot};

pub use broker::Broker;
pub use memory::{MemoryConnection, MemoryConnector, MemoryStore};

/// Входящий pub/sub трафик от соединения.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `message`: доставка по точному топику.
    Message { channel: Arc<str>, payload: Bytes },
    /// `pmessage`: доставка через шаблонную подписку.
    PMessage {
        pattern: Arc<str>,
        channel: Arc<str>,
        payload: Bytes,
    },
}

impl Frame {
    /// Конкретный топик, в который опубликовано сообщение.
    pub fn channel(&self) -> &str {
        match self {
            Frame::Message { channel, .. } | Frame::PMessage { channel, .. } => channel,
        }
    }
}

pub type FrameSender = mpsc::UnboundedSender<Frame>;
pub type FrameReceiver = mpsc::UnboundedReceiver<Frame>;

/// Адрес хранилища.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreAddress {
    pub host: String,
    pub port: u16,
    pub db: usize,
}

impl Default for StoreAddress {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
        }
    }
}

impl fmt::Display for StoreAddress {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.db)
    }
}

/// Живое соединение с хранилищем. Им владеет только цикл событий.
#[async_trait]
pub trait Connection: Send {
    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
    ) -> StoreResult<usize>;

    async fn subscribe(
        &mut self,
        topic: &str,
    ) -> StoreResult<()>;

    async fn psubscribe(
        &mut self,
        pattern: &str,
    ) -> StoreResult<()>;

    async fn unsubscribe(
        &mut self,
        topic: &str,
    ) -> StoreResult<()>;

    async fn punsubscribe(
        &mut self,
        pattern: &str,
    ) -> StoreResult<()>;

    /// `PUBSUB NUMSUB topic`.
    async fn numsub(
        &mut self,
        topic: &str,
    ) -> StoreResult<usize>;

    /// `SET key value PX expiry NX`. Вернёт `true`, если ключ установлен.
    async fn set_nx(
        &mut self,
        key: &str,
        value: &str,
        expiry: Duration,
    ) -> StoreResult<bool>;

    async fn hset(
        &mut self,
        key: &str,
        field: &str,
        value: &str,
    ) -> StoreResult<bool>;

    async fn hdel(
        &mut self,
        key: &str,
        field: &str,
    ) -> StoreResult<bool>;

    async fn lpush(
        &mut self,
        key: &str,
        value: Bytes,
    ) -> StoreResult<usize>;

    async fn ltrim(
        &mut self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> StoreResult<()>;

    async fn close(&mut self);
}

/// Открывает соединения. Вызывается один раз, на потоке цикла.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        address: &StoreAddress,
    ) -> StoreResult<(Box<dyn Connection>, FrameReceiver)>;
}

/// Команда хранилища в очереди цикла событий.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Publish { topic: String, payload: Bytes },
    Subscribe { topic: String },
    PSubscribe { pattern: String },
    Unsubscribe { topic: String },
    PUnsubscribe { pattern: String },
    NumSub { topic: String },
    SetNx {
        key: String,
        value: String,
        expiry: Duration,
    },
    HSet {
        key: String,
        field: String,
        value: String,
    },
    HDel { key: String, field: String },
    LPush { key: String, value: Bytes },
    LTrim { key: String, start: i64, stop: i64 },
    /// Закрыть соединение и остановить цикл.
    Quit,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Publish { .. } => "PUBLISH",
            Op::Subscribe { .. } => "SUBSCRIBE",
            Op::PSubscribe { .. } => "PSUBSCRIBE",
            Op::Unsubscribe { .. } => "UNSUBSCRIBE",
            Op::PUnsubscribe { .. } => "PUNSUBSCRIBE",
            Op::NumSub { .. } => "NUMSUB",
            Op::SetNx { .. } => "SET",
            Op::HSet { .. } => "HSET",
            Op::HDel { .. } => "HDEL",
            Op::LPush { .. } => "LPUSH",
            Op::LTrim { .. } => "LTRIM",
            Op::Quit => "QUIT",
        }
    }
}

/// Сырой результат команды.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Int(usize),
    Bool(bool),
}

impl Reply {
    fn into_unit(self) -> StoreResult<()> {
        Ok(())
    }

    fn into_int(self) -> StoreResult<usize> {
        match self {
            Reply::Int(n) => Ok(n),
            other => Err(StoreError::Command(format!(
                "expected integer reply, got {other:?}"
            ))),
        }
    }

    fn into_bool(self) -> StoreResult<bool> {
        match self {
            Reply::Bool(b) => Ok(b),
            Reply::Int(n) => Ok(n > 0),
            Reply::Ok => Err(StoreError::Command(
                "expected boolean reply, got OK".to_string(),
            )),
        }
    }
}

/// Команда в очереди и канал для её результата.
#[derive(Debug)]
pub struct Command {
    pub op: Op,
    pub reply: oneshot::Sender<StoreResult<Reply>>,
}

impl Command {
    /// Отправляет результат. Запросивший мог уже перестать ждать.
    pub fn complete(
        self,
        result: StoreResult<Reply>,
    ) {
        let _ = self.reply.send(result);
    }
}

pub type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// Клонируемая сторона-производитель очереди команд.
///
/// Каждый метод ставит команду в очередь сразу, поэтому команды одного потока
/// доходят до соединения в порядке вызовов; ленив только результат.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl StoreHandle {
    /// Создаёт handle вместе с очередью, которую разбирает цикл.
    pub fn channel() -> (Self, CommandReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn submit(
        &self,
        op: Op,
    ) -> oneshot::Receiver<StoreResult<Reply>> {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(cmd)) = self.tx.send(Command { op, reply }) {
            cmd.complete(Err(StoreError::Closed));
        }
        rx
    }

    fn request<T>(
        &self,
        op: Op,
        map: fn(Reply) -> StoreResult<T>,
    ) -> impl Future<Output = StoreResult<T>> + Send + 'static
    where
        T: Send + 'static,
    {
        let rx = self.submit(op);
        async move {
            match rx.await {
                Ok(result) => result.and_then(map),
                Err(_) => Err(StoreError::Closed),
            }
        }
    }

    pub fn publish(
        &self,
        topic: &str,
        payload: Bytes,
    ) -> impl Future<Output = StoreResult<usize>> + Send + 'static {
        self.request(
            Op::Publish {
                topic: topic.to_string(),
                payload,
            },
            Reply::into_int,
        )
    }

    pub fn subscribe(
        &self,
        topic: &str,
    ) -> impl Future<Output = StoreResult<()>> + Send + 'static {
        self.request(
            Op::Subscribe {
                topic: topic.to_string(),
            },
            Reply::into_unit,
        )
    }

    pub fn psubscribe(
        &self,
        pattern: &str,
    ) -> impl Future<Output = StoreResult<()>> + Send + 'static {
        self.request(
            Op::PSubscribe {
                pattern: pattern.to_string(),
            },
            Reply::into_unit,
        )
    }

    pub fn unsubscribe(
        &self,
        topic: &str,
    ) -> impl Future<Output = StoreResult<()>> + Send + 'static {
        self.request(
            Op::Unsubscribe {
                topic: topic.to_string(),
            },
            Reply::into_unit,
        )
    }

    pub fn punsubscribe(
        &self,
        pattern: &str,
    ) -> impl Future<Output = StoreResult<()>> + Send + 'static {
        self.request(
            Op::PUnsubscribe {
                pattern: pattern.to_string(),
            },
            Reply::into_unit,
        )
    }

    pub fn numsub(
        &self,
        topic: &str,
    ) -> impl Future<Output = StoreResult<usize>> + Send + 'static {
        self.request(
            Op::NumSub {
                topic: topic.to_string(),
            },
            Reply::into_int,
        )
    }

    pub fn set_nx(
        &self,
        key: &str,
        value: &str,
        expiry: Duration,
    ) -> impl Future<Output = StoreResult<bool>> + Send + 'static {
        self.request(
            Op::SetNx {
                key: key.to_string(),
                value: value.to_string(),
                expiry,
            },
            Reply::into_bool,
        )
    }

    pub fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> impl Future<Output = StoreResult<bool>> + Send + 'static {
        self.request(
            Op::HSet {
                key: key.to_string(),
                field: field.to_string(),
                value: value.to_string(),
            },
            Reply::into_bool,
        )
    }

    pub fn hdel(
        &self,
        key: &str,
        field: &str,
    ) -> impl Future<Output = StoreResult<bool>> + Send + 'static {
        self.request(
            Op::HDel {
                key: key.to_string(),
                field: field.to_string(),
            },
            Reply::into_bool,
        )
    }

    pub fn lpush(
        &self,
        key: &str,
        value: Bytes,
    ) -> impl Future<Output = StoreResult<usize>> + Send + 'static {
        self.request(
            Op::LPush {
                key: key.to_string(),
                value,
            },
            Reply::into_int,
        )
    }

    pub fn ltrim(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> impl Future<Output = StoreResult<()>> + Send + 'static {
        self.request(
            Op::LTrim {
                key: key.to_string(),
                start,
                stop,
            },
            Reply::into_unit,
        )
    }

    /// Просит цикл закрыть соединение и завершиться.
    pub fn quit(&self) -> impl Future<Output = StoreResult<()>> + Send + 'static {
        self.request(Op::Quit, Reply::into_unit)
    }
}

/// Выполняет одну команду из очереди на соединении.
pub async fn execute(
    conn: &mut dyn Connection,
    op: Op,
) -> StoreResult<Reply> {
    match op {
        Op::Publish { topic, payload } => conn.publish(&topic, payload).await.map(Reply::Int),
        Op::Subscribe { topic } => conn.subscribe(&topic).await.map(|_| Reply::Ok),
        Op::PSubscribe { pattern } => conn.psubscribe(&pattern).await.map(|_| Reply::Ok),
        Op::Unsubscribe { topic } => conn.unsubscribe(&topic).await.map(|_| Reply::Ok),
        Op::PUnsubscribe { pattern } => conn.punsubscribe(&pattern).await.map(|_| Reply::Ok),
        Op::NumSub { topic } => conn.numsub(&topic).await.map(Reply::Int),
        Op::SetNx { key, value, expiry } => {
            conn.set_nx(&key, &value, expiry).await.map(Reply::Bool)
        }
        Op::HSet { key, field, value } => conn.hset(&key, &field, &value).await.map(Reply::Bool),
        Op::HDel { key, field } => conn.hdel(&key, &field).await.map(Reply::Bool),
        Op::LPush { key, value } => conn.lpush(&key, value).await.map(Reply::Int),
        Op::LTrim { key, start, stop } => {
            conn.ltrim(&key, start, stop).await.map(|_| Reply::Ok)
        }
        Op::Quit => {
            conn.close().await;
            Ok(Reply::Ok)
        }
    }
}

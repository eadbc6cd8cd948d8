//! Незавершённые запросы и их reply-топики.
//!
//! Каждая запись завершается ровно один раз: ответ и таймер соревнуются за
//! удаление из таблицы, обработчик вызывает только победитель. Удаление и
//! UNSUBSCRIBE выполняются синхронно (на потоке цикла событий или в
//! async-задаче таймера), а сам обработчик на reply-потоках пула.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use bytes::Bytes;
use gilmour_error::{BackendError, BackendResult, StatusCode};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::{
    envelope::{Envelope, EnvelopeCodec},
    store::StoreHandle,
    topics::{self, response_topic},
    worker::Workers,
};

/// Получает тело ответа и код статуса.
pub type ReplyHandler = Box<dyn FnOnce(Value, u16) -> anyhow::Result<()> + Send>;

struct PendingCorrelation {
    handler: ReplyHandler,
    timer: AbortHandle,
    created: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Reply,
    Timer,
}

pub struct CorrelationTable {
    pending: Mutex<HashMap<String, PendingCorrelation>>,
    store: StoreHandle,
    workers: Workers,
    codec: Arc<dyn EnvelopeCodec>,
}

impl CorrelationTable {
    pub fn new(
        store: StoreHandle,
        workers: Workers,
        codec: Arc<dyn EnvelopeCodec>,
    ) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            store,
            workers,
            codec,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(
        &self,
        request_id: &str,
    ) -> bool {
        self.pending.lock().contains_key(&response_topic(request_id))
    }

    /// Регистрирует `handler` на `gilmour.response.<request_id>`,
    /// подписывается на reply-топик, взводит таймер и только после этого
    /// публикует `payload` в `destination`.
    pub fn send_with_reply(
        self: &Arc<Self>,
        request_id: &str,
        destination: &str,
        payload: Bytes,
        handler: ReplyHandler,
        timeout: Duration,
    ) -> BackendResult<String> {
        self.try_send_with_reply(request_id, destination, payload, handler, timeout)
            .map_err(|(err, _)| err)
    }

    /// Как [`send_with_reply`](Self::send_with_reply), но при отказе
    /// возвращает обработчик вызывающему, чтобы тот мог ответить сам.
    pub fn try_send_with_reply(
        self: &Arc<Self>,
        request_id: &str,
        destination: &str,
        payload: Bytes,
        handler: ReplyHandler,
        timeout: Duration,
    ) -> Result<String, (BackendError, ReplyHandler)> {
        self.register(request_id, handler, timeout)?;
        debug!(request_id, destination, ?timeout, "Request sent");
        self.workers
            .spawn_logged("PUBLISH", self.store.publish(destination, payload));
        Ok(request_id.to_string())
    }

    /// Немедленно завершает запрос ответом 499. `None`, если запрос уже
    /// завершён.
    pub fn cancel(
        &self,
        request_id: &str,
    ) -> Option<JoinHandle<bool>> {
        self.expire(&response_topic(request_id))
    }

    fn register(
        self: &Arc<Self>,
        request_id: &str,
        handler: ReplyHandler,
        timeout: Duration,
    ) -> Result<String, (BackendError, ReplyHandler)> {
        let topic = response_topic(request_id);
        let mut pending = self.pending.lock();
        if pending.contains_key(&topic) {
            return Err((
                BackendError::DuplicateCorrelation(request_id.to_string()),
                handler,
            ));
        }

        // Таймер не увидит таблицу раньше, чем будет отпущен lock.
        let table: Weak<Self> = Arc::downgrade(self);
        let expiring = topic.clone();
        let timer = self
            .workers
            .spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(table) = table.upgrade() {
                    table.expire(&expiring);
                }
            })
            .abort_handle();

        pending.insert(
            topic.clone(),
            PendingCorrelation {
                handler,
                timer,
                created: Instant::now(),
            },
        );
        self.workers
            .spawn_logged("SUBSCRIBE", self.store.subscribe(&topic));
        Ok(topic)
    }

    /// Кадр, пришедший на reply-топик. Не блокирует: декодирование и
    /// обработчик выполняются на reply-потоках.
    ///
    /// Вернёт `false`, если этого ответа никто не ждал.
    pub fn resolve(
        &self,
        topic: &str,
        payload: Bytes,
    ) -> bool {
        let codec = self.codec.clone();
        let name = topic.to_string();
        self.complete(topic, Origin::Reply, move || {
            match codec.decode(&payload) {
                Ok(envelope) => (envelope.data, envelope.code),
                Err(err) => {
                    warn!(topic = %name, error = %err, "Undecodable reply");
                    (Value::Null, StatusCode::Internal.code())
                }
            }
        })
        .is_some()
    }

    /// Путь таймера: синтезированный ответ `{null, 499}`, закодированный и
    /// декодированный так же, как пришедший по сети.
    fn expire(
        &self,
        topic: &str,
    ) -> Option<JoinHandle<bool>> {
        let request_id = topic
            .strip_prefix(topics::RESPONSE_PREFIX)
            .unwrap_or(topic);
        let synthesized = Envelope::new(Value::Null, StatusCode::Timeout.code(), request_id);
        let codec = self.codec.clone();
        self.complete(topic, Origin::Timer, move || {
            codec
                .encode(&synthesized)
                .and_then(|payload| codec.decode(&payload))
                .map(|envelope| (envelope.data, envelope.code))
                .unwrap_or((Value::Null, StatusCode::Timeout.code()))
        })
    }

    fn complete<F>(
        &self,
        topic: &str,
        origin: Origin,
        reply: F,
    ) -> Option<JoinHandle<bool>>
    where
        F: FnOnce() -> (Value, u16) + Send + 'static,
    {
        let Some(entry) = self.pending.lock().remove(topic) else {
            debug!(topic, ?origin, "No pending request, reply dropped");
            return None;
        };
        if origin == Origin::Reply {
            entry.timer.abort();
        }
        self.workers
            .spawn_logged("UNSUBSCRIBE", self.store.unsubscribe(topic));

        let topic = topic.to_string();
        let handler = entry.handler;
        let created = entry.created;
        Some(self.workers.run_reply("reply", move || {
            let (body, code) = reply();
            debug!(
                topic = %topic,
                ?origin,
                code,
                elapsed_ms = created.elapsed().as_millis() as u64,
                "Request resolved"
            );
            handler(body, code)
        }))
    }

    /// Завершает все незавершённые запросы через путь таймаута. Вызывается
    /// при остановке, чтобы никто не ждал ответа, который уже не придёт.
    pub fn drain(&self) -> Vec<JoinHandle<bool>> {
        let topics: Vec<String> = self.pending.lock().keys().cloned().collect();
        topics
            .iter()
            .filter_map(|topic| self.expire(topic))
            .collect()
    }
}

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use gilmour_error::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{identity::NodeIdentity, store::StoreHandle, topics, worker::Workers};

/// Куда уходят отчёты об ошибках.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReportMode {
    Disabled,
    /// Публикация в [`topics::ERROR_CHANNEL`].
    Broadcast,
    /// Запись в список ограниченной длины.
    Buffered { queue: String },
}

/// Структурированное описание неудачного вызова обработчика.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: u16,
    pub topic: String,
    pub sender: String,
    pub node: String,
    pub description: String,
    pub request_data: String,
    pub timestamp: String,
}

impl ErrorReport {
    pub fn new(
        node: &NodeIdentity,
        topic: &str,
        description: impl Into<String>,
    ) -> Self {
        Self {
            code: StatusCode::Internal.code(),
            topic: topic.to_string(),
            sender: String::new(),
            node: node.to_string(),
            description: description.into(),
            request_data: String::new(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn with_sender(
        mut self,
        sender: impl Into<String>,
    ) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn with_request_data(
        mut self,
        data: &[u8],
    ) -> Self {
        self.request_data = String::from_utf8_lossy(data).into_owned();
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.description.clone())
    }
}

/// Доставляет сообщения об ошибках согласно [`ErrorReportMode`].
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    mode: ErrorReportMode,
    buffer_len: usize,
    identity: NodeIdentity,
    store: StoreHandle,
    workers: Workers,
}

impl ErrorReporter {
    pub fn new(
        mode: ErrorReportMode,
        buffer_len: usize,
        identity: NodeIdentity,
        store: StoreHandle,
        workers: Workers,
    ) -> Self {
        Self {
            mode,
            buffer_len: buffer_len.max(1),
            identity,
            store,
            workers,
        }
    }

    pub fn mode(&self) -> &ErrorReportMode {
        &self.mode
    }

    /// Шаблон отчёта с идентификатором этого узла.
    pub fn failure(
        &self,
        topic: &str,
        description: impl Into<String>,
    ) -> ErrorReport {
        ErrorReport::new(&self.identity, topic, description)
    }

    /// Отправляет `message` и возвращает задачу, ждущую хранилище, или
    /// `None`, если отчёты отключены. Задача вернёт `true`, когда все
    /// команды хранилища подтверждены.
    pub fn report(
        &self,
        message: impl Into<String>,
    ) -> Option<JoinHandle<bool>> {
        let payload = Bytes::from(message.into());
        match &self.mode {
            ErrorReportMode::Disabled => {
                debug!("Error reporting disabled, report skipped");
                None
            }
            ErrorReportMode::Broadcast => {
                let publish = self.store.publish(topics::ERROR_CHANNEL, payload);
                Some(self.workers.spawn(async move {
                    match publish.await {
                        Ok(_) => true,
                        Err(err) => {
                            warn!(error = %err, "Failed to broadcast error report");
                            false
                        }
                    }
                }))
            }
            ErrorReportMode::Buffered { queue } => {
                // LPUSH и LTRIM идут в очередь подряд: список превышает
                // лимит не дольше одной команды.
                let push = self.store.lpush(queue, payload);
                let trim = self.store.ltrim(queue, 0, self.buffer_len as i64 - 1);
                let queue = queue.clone();
                Some(self.workers.spawn(async move {
                    if let Err(err) = push.await {
                        warn!(queue = %queue, error = %err, "Failed to buffer error report");
                        return false;
                    }
                    if let Err(err) = trim.await {
                        warn!(queue = %queue, error = %err, "Failed to trim error queue");
                        return false;
                    }
                    true
                }))
            }
        }
    }
}

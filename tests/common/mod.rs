//! Общие помощники интеграционных тестов.
#![allow(dead_code)]

use std::{
    sync::{mpsc, Arc},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use gilmour::{
    store::{Connection, Connector, FrameReceiver},
    Envelope, EnvelopeCodec, JsonCodec, MemoryConnector, MemoryStore, ReplyHandler, Settings,
    StoreAddress, StoreError,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

/// Одна команда, дошедшая до соединения.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub command: &'static str,
    pub target: String,
}

/// Коннектор поверх [`MemoryConnector`], записывающий все команды.
#[derive(Clone)]
pub struct RecordingConnector {
    inner: MemoryConnector,
    log: Arc<Mutex<Vec<Recorded>>>,
    numsub_gate: Option<Arc<Notify>>,
}

impl RecordingConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            inner: MemoryConnector::new(store),
            log: Arc::new(Mutex::new(Vec::new())),
            numsub_gate: None,
        }
    }

    /// Каждый NUMSUB ждёт `notify_one()` на возвращённом `Notify`.
    /// Пока он ждёт, цикл событий не выполняет другие команды.
    pub fn with_numsub_gate(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.numsub_gate = Some(gate.clone());
        (self, gate)
    }

    pub fn commands(&self) -> Vec<Recorded> {
        self.log.lock().clone()
    }

    pub fn count(
        &self,
        command: &str,
        target: &str,
    ) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|r| r.command == command && r.target == target)
            .count()
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn connect(
        &self,
        address: &StoreAddress,
    ) -> Result<(Box<dyn Connection>, FrameReceiver), StoreError> {
        let (inner, frames) = self.inner.connect(address).await?;
        Ok((
            Box::new(RecordingConnection {
                inner,
                log: self.log.clone(),
                numsub_gate: self.numsub_gate.clone(),
            }),
            frames,
        ))
    }
}

struct RecordingConnection {
    inner: Box<dyn Connection>,
    log: Arc<Mutex<Vec<Recorded>>>,
    numsub_gate: Option<Arc<Notify>>,
}

impl RecordingConnection {
    fn record(
        &self,
        command: &'static str,
        target: &str,
    ) {
        self.log.lock().push(Recorded {
            command,
            target: target.to_string(),
        });
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
    ) -> Result<usize, StoreError> {
        self.record("PUBLISH", topic);
        self.inner.publish(topic, payload).await
    }

    async fn subscribe(
        &mut self,
        topic: &str,
    ) -> Result<(), StoreError> {
        self.record("SUBSCRIBE", topic);
        self.inner.subscribe(topic).await
    }

    async fn psubscribe(
        &mut self,
        pattern: &str,
    ) -> Result<(), StoreError> {
        self.record("PSUBSCRIBE", pattern);
        self.inner.psubscribe(pattern).await
    }

    async fn unsubscribe(
        &mut self,
        topic: &str,
    ) -> Result<(), StoreError> {
        self.record("UNSUBSCRIBE", topic);
        self.inner.unsubscribe(topic).await
    }

    async fn punsubscribe(
        &mut self,
        pattern: &str,
    ) -> Result<(), StoreError> {
        self.record("PUNSUBSCRIBE", pattern);
        self.inner.punsubscribe(pattern).await
    }

    async fn numsub(
        &mut self,
        topic: &str,
    ) -> Result<usize, StoreError> {
        self.record("NUMSUB", topic);
        if let Some(gate) = &self.numsub_gate {
            gate.notified().await;
        }
        self.inner.numsub(topic).await
    }

    async fn set_nx(
        &mut self,
        key: &str,
        value: &str,
        expiry: Duration,
    ) -> Result<bool, StoreError> {
        self.record("SET", key);
        self.inner.set_nx(key, value, expiry).await
    }

    async fn hset(
        &mut self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        self.record("HSET", key);
        self.inner.hset(key, field, value).await
    }

    async fn hdel(
        &mut self,
        key: &str,
        field: &str,
    ) -> Result<bool, StoreError> {
        self.record("HDEL", key);
        self.inner.hdel(key, field).await
    }

    async fn lpush(
        &mut self,
        key: &str,
        value: Bytes,
    ) -> Result<usize, StoreError> {
        self.record("LPUSH", key);
        self.inner.lpush(key, value).await
    }

    async fn ltrim(
        &mut self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<(), StoreError> {
        self.record("LTRIM", key);
        self.inner.ltrim(key, start, stop).await
    }

    async fn close(&mut self) {
        self.inner.close().await
    }
}

/// Настройки для тестов: небольшой пул и короткий backoff.
pub fn test_settings() -> Settings {
    Settings {
        worker_threads: 2,
        unregister_attempts: 3,
        unregister_backoff_ms: 10,
        ..Settings::default()
    }
}

/// Закодированный запрос с данным `sender`.
pub fn request(
    sender: &str,
    data: Value,
) -> Bytes {
    JsonCodec.encode(&Envelope::request(data, sender)).unwrap()
}

/// Обработчик ответа, пересылающий `(body, code)` в канал.
pub fn reply_channel() -> (ReplyHandler, mpsc::Receiver<(Value, u16)>) {
    let (tx, rx) = mpsc::channel();
    let handler: ReplyHandler = Box::new(move |body, code| {
        tx.send((body, code))?;
        Ok(())
    });
    (handler, rx)
}

pub fn recv<T>(rx: &mpsc::Receiver<T>) -> T {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("nothing received within 5s")
}

/// Ждёт выполнения условия, не дольше 5 секунд.
pub fn wait_until<F: FnMut() -> bool>(mut cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached within 5s");
        std::thread::sleep(Duration::from_millis(10));
    }
}

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use gilmour_error::{StoreError, StoreResult};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    broker::{Broker, ConnectionId},
    Connection, Connector, FrameReceiver, FrameSender, StoreAddress,
};

pub const DEFAULT_DATABASES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(Bytes),
    Hash(HashMap<String, Bytes>),
    List(VecDeque<Bytes>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(
        &self,
        now: Instant,
    ) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type Keyspace = DashMap<String, Entry>;

/// Хранилище в памяти процесса: пронумерованные keyspace с ленивым
/// истечением и общий для всех соединений pub/sub брокер.
pub struct MemoryStore {
    keyspaces: Vec<Keyspace>,
    broker: Broker,
    next_connection: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_databases(DEFAULT_DATABASES)
    }

    pub fn with_databases(count: usize) -> Self {
        Self {
            keyspaces: (0..count.max(1)).map(|_| DashMap::new()).collect(),
            broker: Broker::new(),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    fn keyspace(
        &self,
        db: usize,
    ) -> StoreResult<&Keyspace> {
        self.keyspaces.get(db).ok_or(StoreError::InvalidDb {
            index: db,
            available: self.keyspaces.len(),
        })
    }

    fn purge_if_expired(
        ks: &Keyspace,
        key: &str,
    ) {
        let now = Instant::now();
        ks.remove_if(key, |_, e| e.is_expired(now));
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::WrongType {
            key: key.to_string(),
        }
    }

    /// `SET key value [PX expiry] NX`.
    pub fn set_nx(
        &self,
        db: usize,
        key: &str,
        value: Bytes,
        expiry: Option<Duration>,
    ) -> StoreResult<bool> {
        let ks = self.keyspace(db)?;
        Self::purge_if_expired(ks, key);
        let mut created = false;
        ks.entry(key.to_string()).or_insert_with(|| {
            created = true;
            Entry {
                value: Value::Str(value),
                expires_at: expiry.map(|d| Instant::now() + d),
            }
        });
        Ok(created)
    }

    pub fn get(
        &self,
        db: usize,
        key: &str,
    ) -> StoreResult<Option<Bytes>> {
        let ks = self.keyspace(db)?;
        Self::purge_if_expired(ks, key);
        match ks.get(key).map(|e| e.value.clone()) {
            None => Ok(None),
            Some(Value::Str(b)) => Ok(Some(b)),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    /// Оставшееся время жизни; `None`, если ключа нет или он бессрочный.
    pub fn ttl(
        &self,
        db: usize,
        key: &str,
    ) -> StoreResult<Option<Duration>> {
        let ks = self.keyspace(db)?;
        Self::purge_if_expired(ks, key);
        let now = Instant::now();
        Ok(ks
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    /// Вернёт `true`, если поле новое.
    pub fn hset(
        &self,
        db: usize,
        key: &str,
        field: &str,
        value: Bytes,
    ) -> StoreResult<bool> {
        let ks = self.keyspace(db)?;
        Self::purge_if_expired(ks, key);
        let mut entry = ks
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(h) => Ok(h.insert(field.to_string(), value).is_none()),
            _ => Err(Self::wrong_type(key)),
        }
    }

    pub fn hget(
        &self,
        db: usize,
        key: &str,
        field: &str,
    ) -> StoreResult<Option<Bytes>> {
        let ks = self.keyspace(db)?;
        Self::purge_if_expired(ks, key);
        match ks.get(key).as_deref().map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    /// Вернёт `true`, если поле было. Опустевший хеш удаляется.
    pub fn hdel(
        &self,
        db: usize,
        key: &str,
        field: &str,
    ) -> StoreResult<bool> {
        let ks = self.keyspace(db)?;
        Self::purge_if_expired(ks, key);
        let removed = match ks.get_mut(key) {
            None => false,
            Some(mut entry) => match &mut entry.value {
                Value::Hash(h) => h.remove(field).is_some(),
                _ => return Err(Self::wrong_type(key)),
            },
        };
        ks.remove_if(key, |_, e| matches!(&e.value, Value::Hash(h) if h.is_empty()));
        Ok(removed)
    }

    /// Добавляет в голову списка и возвращает новую длину.
    pub fn lpush(
        &self,
        db: usize,
        key: &str,
        value: Bytes,
    ) -> StoreResult<usize> {
        let ks = self.keyspace(db)?;
        Self::purge_if_expired(ks, key);
        let mut entry = ks
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
        match &mut entry.value {
            Value::List(list) => {
                list.push_front(value);
                Ok(list.len())
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    /// Оставляет только диапазон `start..=stop` (отрицательные индексы
    /// считаются с конца). Опустевший список удаляется.
    pub fn ltrim(
        &self,
        db: usize,
        key: &str,
        start: i64,
        stop: i64,
    ) -> StoreResult<()> {
        let ks = self.keyspace(db)?;
        Self::purge_if_expired(ks, key);
        if let Some(mut entry) = ks.get_mut(key) {
            match &mut entry.value {
                Value::List(list) => match normalize_range(list.len(), start, stop) {
                    Some((from, to)) => {
                        list.truncate(to + 1);
                        list.drain(..from);
                    }
                    None => list.clear(),
                },
                _ => return Err(Self::wrong_type(key)),
            }
        }
        ks.remove_if(key, |_, e| matches!(&e.value, Value::List(l) if l.is_empty()));
        Ok(())
    }

    pub fn lrange(
        &self,
        db: usize,
        key: &str,
        start: i64,
        stop: i64,
    ) -> StoreResult<Vec<Bytes>> {
        let ks = self.keyspace(db)?;
        Self::purge_if_expired(ks, key);
        match ks.get(key).as_deref().map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(match normalize_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    pub fn llen(
        &self,
        db: usize,
        key: &str,
    ) -> StoreResult<usize> {
        let ks = self.keyspace(db)?;
        Self::purge_if_expired(ks, key);
        match ks.get(key).as_deref().map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Переводит включающий диапазон в стиле Redis для списка из `len` элементов.
fn normalize_range(
    len: usize,
    start: i64,
    stop: i64,
) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Открывает соединения с общим [`MemoryStore`].
#[derive(Clone, Default)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        address: &StoreAddress,
    ) -> StoreResult<(Box<dyn Connection>, FrameReceiver)> {
        self.store.keyspace(address.db)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.store.next_connection_id();
        debug!(connection = id, %address, "Opened in-process store connection");
        Ok((
            Box::new(MemoryConnection {
                store: self.store.clone(),
                id,
                db: address.db,
                frames: tx,
                closed: false,
            }),
            rx,
        ))
    }
}

/// Одно соединение с [`MemoryStore`]; при закрытии или drop снимает все
/// подписки.
pub struct MemoryConnection {
    store: Arc<MemoryStore>,
    id: ConnectionId,
    db: usize,
    frames: FrameSender,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.store.broker.disconnect(self.id);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
    ) -> StoreResult<usize> {
        self.ensure_open()?;
        Ok(self.store.broker.publish(topic, payload))
    }

    async fn subscribe(
        &mut self,
        topic: &str,
    ) -> StoreResult<()> {
        self.ensure_open()?;
        self.store
            .broker
            .subscribe(self.id, topic, self.frames.clone());
        Ok(())
    }

    async fn psubscribe(
        &mut self,
        pattern: &str,
    ) -> StoreResult<()> {
        self.ensure_open()?;
        self.store
            .broker
            .psubscribe(self.id, pattern, self.frames.clone())
    }

    async fn unsubscribe(
        &mut self,
        topic: &str,
    ) -> StoreResult<()> {
        self.ensure_open()?;
        self.store.broker.unsubscribe(self.id, topic);
        Ok(())
    }

    async fn punsubscribe(
        &mut self,
        pattern: &str,
    ) -> StoreResult<()> {
        self.ensure_open()?;
        self.store.broker.punsubscribe(self.id, pattern);
        Ok(())
    }

    async fn numsub(
        &mut self,
        topic: &str,
    ) -> StoreResult<usize> {
        self.ensure_open()?;
        Ok(self.store.broker.numsub(topic))
    }

    async fn set_nx(
        &mut self,
        key: &str,
        value: &str,
        expiry: Duration,
    ) -> StoreResult<bool> {
        self.ensure_open()?;
        self.store.set_nx(
            self.db,
            key,
            Bytes::copy_from_slice(value.as_bytes()),
            Some(expiry),
        )
    }

    async fn hset(
        &mut self,
        key: &str,
        field: &str,
        value: &str,
    ) -> StoreResult<bool> {
        self.ensure_open()?;
        self.store.hset(
            self.db,
            key,
            field,
            Bytes::copy_from_slice(value.as_bytes()),
        )
    }

    async fn hdel(
        &mut self,
        key: &str,
        field: &str,
    ) -> StoreResult<bool> {
        self.ensure_open()?;
        self.store.hdel(self.db, key, field)
    }

    async fn lpush(
        &mut self,
        key: &str,
        value: Bytes,
    ) -> StoreResult<usize> {
        self.ensure_open()?;
        self.store.lpush(self.db, key, value)
    }

    async fn ltrim(
        &mut self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> StoreResult<()> {
        self.ensure_open()?;
        self.store.ltrim(self.db, key, start, stop)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.store.broker.disconnect(self.id);
            debug!(connection = self.id, "Closed in-process store connection");
        }
    }
}

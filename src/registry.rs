//! Topic → handler bindings and the dispatch path for inbound messages.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    envelope::EnvelopeCodec,
    lock::ExclusiveLock,
    reporter::ErrorReporter,
    store::StoreHandle,
    topics,
    worker::{self, Workers},
};

/// Обработчик приложения: получает конкретный топик и сырые байты.
pub type Handler = Arc<dyn Fn(&str, Bytes) -> anyhow::Result<()> + Send + Sync>;

/// То, что передаётся в [`SubscriptionRegistry::add_listener`].
#[derive(Clone)]
pub struct Listener {
    handler: Handler,
    exclusive: bool,
}

impl Listener {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, Bytes) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            exclusive: false,
        }
    }

    /// Обработчик для данного запроса выполняет только один узел кластера.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(u64);

/// Установленный обработчик. Возвращается из `add_listener` и позволяет
/// позже удалить именно его.
#[derive(Clone)]
pub struct Binding {
    id: BindingId,
    topic: Arc<str>,
    handler: Handler,
    exclusive: bool,
}

impl Binding {
    pub fn id(&self) -> BindingId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl fmt::Debug for Binding {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Binding")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("exclusive", &self.exclusive)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Exact,
    Pattern,
}

impl SubscriptionKind {
    pub fn of(topic: &str) -> Self {
        if topics::is_pattern(topic) {
            SubscriptionKind::Pattern
        } else {
            SubscriptionKind::Exact
        }
    }
}

struct TopicEntry {
    /// Фиксируется при первой подписке на топик.
    kind: SubscriptionKind,
    bindings: Vec<Binding>,
}

pub struct SubscriptionRegistry {
    topics: Mutex<HashMap<String, TopicEntry>>,
    next_id: AtomicU64,
    store: StoreHandle,
    workers: Workers,
    lock: ExclusiveLock,
    codec: Arc<dyn EnvelopeCodec>,
    reporter: ErrorReporter,
}

impl SubscriptionRegistry {
    pub fn new(
        store: StoreHandle,
        workers: Workers,
        lock: ExclusiveLock,
        codec: Arc<dyn EnvelopeCodec>,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            store,
            workers,
            lock,
            codec,
            reporter,
        }
    }

    /// Выдаёт SUBSCRIBE или PSUBSCRIBE для `topic` при каждом вызове.
    pub fn subscribe(
        &self,
        topic: &str,
    ) {
        self.issue_subscribe(topic, SubscriptionKind::of(topic));
    }

    fn issue_subscribe(
        &self,
        topic: &str,
        kind: SubscriptionKind,
    ) {
        debug!(topic, ?kind, "Subscribing");
        match kind {
            SubscriptionKind::Exact => {
                self.workers
                    .spawn_logged("SUBSCRIBE", self.store.subscribe(topic));
            }
            SubscriptionKind::Pattern => {
                self.workers
                    .spawn_logged("PSUBSCRIBE", self.store.psubscribe(topic));
            }
        }
    }

    fn issue_unsubscribe(
        &self,
        topic: &str,
        kind: SubscriptionKind,
    ) {
        debug!(topic, ?kind, "Unsubscribing");
        match kind {
            SubscriptionKind::Exact => {
                self.workers
                    .spawn_logged("UNSUBSCRIBE", self.store.unsubscribe(topic));
            }
            SubscriptionKind::Pattern => {
                self.workers
                    .spawn_logged("PUNSUBSCRIBE", self.store.punsubscribe(topic));
            }
        }
    }

    /// Добавляет привязку; первая привязка на топике подписывает его.
    pub fn add_listener(
        &self,
        topic: &str,
        listener: Listener,
    ) -> Binding {
        let binding = Binding {
            id: BindingId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            topic: Arc::from(topic),
            handler: listener.handler,
            exclusive: listener.exclusive,
        };

        // Команда ставится в очередь под lock карты, поэтому порядок
        // SUBSCRIBE/UNSUBSCRIBE совпадает с порядком изменений карты.
        let mut topics = self.topics.lock();
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicEntry {
                kind: SubscriptionKind::of(topic),
                bindings: Vec::new(),
            });
        let first = entry.bindings.is_empty();
        entry.bindings.push(binding.clone());
        if first {
            self.issue_subscribe(topic, entry.kind);
        }
        trace!(topic, id = ?binding.id, exclusive = binding.exclusive, "Listener added");
        binding
    }

    /// Удаляет одну привязку или все привязки топика при `binding == None`.
    /// Возвращает число удалённых. Неизвестный топик ничего не меняет.
    pub fn remove_listener(
        &self,
        topic: &str,
        binding: Option<&Binding>,
    ) -> usize {
        let mut topics = self.topics.lock();
        let Some(entry) = topics.get_mut(topic) else {
            return 0;
        };
        let before = entry.bindings.len();
        match binding {
            Some(target) => entry.bindings.retain(|b| b.id != target.id),
            None => entry.bindings.clear(),
        }
        let removed = before - entry.bindings.len();
        if entry.bindings.is_empty() {
            let kind = entry.kind;
            topics.remove(topic);
            self.issue_unsubscribe(topic, kind);
        }
        removed
    }

    /// Устанавливает каждую пару `(topic, listener)`.
    pub fn setup_subscribers<I>(
        &self,
        listeners: I,
    ) -> Vec<Binding>
    where
        I: IntoIterator<Item = (String, Listener)>,
    {
        listeners
            .into_iter()
            .map(|(topic, listener)| self.add_listener(&topic, listener))
            .collect()
    }

    /// Топики хотя бы с одной привязкой, по возрастанию.
    pub fn list_topics(&self) -> Vec<String> {
        let mut out: Vec<String> = self.topics.lock().keys().cloned().collect();
        out.sort();
        out
    }

    pub fn binding_count(
        &self,
        topic: &str,
    ) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|e| e.bindings.len())
            .unwrap_or(0)
    }

    /// Планирует все привязки под `key` для сообщения, пришедшего в `topic`.
    /// Обработчики никогда не выполняются на вызывающем потоке.
    pub fn dispatch(
        &self,
        key: &str,
        topic: &str,
        payload: Bytes,
    ) {
        let bindings = match self.topics.lock().get(key) {
            Some(entry) => entry.bindings.clone(),
            None => {
                trace!(key, topic, "No bindings for inbound message");
                return;
            }
        };
        let topic: Arc<str> = Arc::from(topic);
        for binding in bindings {
            self.execute(binding, topic.clone(), payload.clone());
        }
    }

    fn execute(
        &self,
        binding: Binding,
        topic: Arc<str>,
        payload: Bytes,
    ) {
        let exclusive = binding.exclusive;
        let lock_key = if exclusive {
            match self.codec.decode(&payload) {
                Ok(envelope) => Some(envelope.sender),
                Err(err) => {
                    warn!(
                        topic = %topic,
                        error = %err,
                        "Cannot derive lock key for exclusive listener, message dropped"
                    );
                    return;
                }
            }
        } else {
            None
        };

        let reporter = self.reporter.clone();
        let codec = self.codec.clone();
        let job = move || {
            let handler = binding.handler.clone();
            let data = payload.clone();
            let name = topic.clone();
            if let Err(reason) = worker::guard("listener", move || handler(&name, data)) {
                let sender = codec.decode(&payload).map(|e| e.sender).unwrap_or_default();
                let report = reporter
                    .failure(&topic, reason)
                    .with_sender(sender)
                    .with_request_data(&payload);
                reporter.report(report.to_json());
            }
        };

        match lock_key {
            None => {
                self.workers.spawn_blocking(job);
            }
            Some(sender) => {
                let acquired = self.lock.acquire(&sender, &sender);
                let workers = self.workers.clone();
                self.workers.spawn(async move {
                    if acquired.await {
                        workers.spawn_blocking(job);
                    } else {
                        debug!(lock = %sender, "Exclusive listener skipped, lock held elsewhere");
                    }
                });
            }
        }
    }
}

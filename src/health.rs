use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    envelope::EnvelopeCodec,
    identity::NodeIdentity,
    registry::{Binding, Listener, SubscriptionRegistry},
    responder::Responder,
    store::StoreHandle,
    topics::{self, health_topic},
    worker::Workers,
};

/// Верхняя граница ожидания подтверждения одного HDEL.
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Значение рядом с идентификатором в хеше присутствия.
const ACTIVE: &str = "active";

/// Ограниченная политика повторов при снятии регистрации.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Присутствие в `gilmour.known_host.health` плюс личный топик
/// интроспекции `gilmour.health.<identity>`.
pub struct HealthRegistrar {
    identity: NodeIdentity,
    store: StoreHandle,
    workers: Workers,
    registry: Arc<SubscriptionRegistry>,
    responder: Responder,
    codec: Arc<dyn EnvelopeCodec>,
    retry: RetryPolicy,
    binding: Mutex<Option<Binding>>,
}

impl HealthRegistrar {
    pub fn new(
        identity: NodeIdentity,
        store: StoreHandle,
        workers: Workers,
        registry: Arc<SubscriptionRegistry>,
        responder: Responder,
        codec: Arc<dyn EnvelopeCodec>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            identity,
            store,
            workers,
            registry,
            responder,
            codec,
            retry,
            binding: Mutex::new(None),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.binding.lock().is_some()
    }

    /// Отмечает узел активным и ставит обработчик интроспекции.
    /// Повторный вызов только обновляет запись присутствия.
    pub fn register(&self) {
        self.workers.spawn_logged(
            "HSET",
            self.store
                .hset(topics::HEALTH_KEY, self.identity.as_str(), ACTIVE),
        );

        let mut binding = self.binding.lock();
        if binding.is_some() {
            return;
        }
        let topic = health_topic(self.identity.as_str());
        let registry: Weak<SubscriptionRegistry> = Arc::downgrade(&self.registry);
        let responder = self.responder.clone();
        let codec = self.codec.clone();
        let listener = Listener::new(move |_, payload| {
            let request = codec.decode(&payload)?;
            let topics = registry
                .upgrade()
                .map(|r| r.list_topics())
                .unwrap_or_default();
            responder.respond(&request.sender, json!(topics), 200)?;
            Ok(())
        })
        .exclusive();
        *binding = Some(self.registry.add_listener(&topic, listener));
        info!(identity = %self.identity, topic = %topic, "Health check registered");
    }

    /// Снимает обработчик и удаляет запись присутствия, повторяя HDEL, пока
    /// хранилище его не подтвердит или не кончатся попытки.
    ///
    /// Вернёт `true`, если снятие регистрации подтверждено.
    pub async fn unregister(&self) -> bool {
        let binding = self.binding.lock().take();
        if let Some(binding) = binding {
            self.registry
                .remove_listener(binding.topic(), Some(&binding));
        }

        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            let pending = self
                .store
                .hdel(topics::HEALTH_KEY, self.identity.as_str());
            match tokio::time::timeout(ACK_TIMEOUT, pending).await {
                Ok(Ok(existed)) => {
                    info!(identity = %self.identity, attempt, existed, "Health check deregistered");
                    return true;
                }
                Ok(Err(err)) => {
                    debug!(attempt, error = %err, "HDEL failed");
                }
                Err(_) => {
                    debug!(attempt, "HDEL not acknowledged in time");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.backoff * attempt).await;
            }
        }
        warn!(
            identity = %self.identity,
            attempts,
            "Could not confirm health check deregistration"
        );
        false
    }
}

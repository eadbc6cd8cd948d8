//! Публичный фасад транспорта: связывает цикл событий, пул потоков, реестр
//! подписок, таблицу корреляций, здоровье и отчёты об ошибках.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use gilmour_error::{BackendError, BackendResult, ErrorExt, StatusCode};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    barrier::StartupBarrier,
    config::Settings,
    correlation::{CorrelationTable, ReplyHandler},
    envelope::{EnvelopeCodec, JsonCodec},
    event_loop::{EventLoop, Router},
    health::{HealthRegistrar, RetryPolicy},
    identity::NodeIdentity,
    lock::ExclusiveLock,
    registry::{Binding, Listener, SubscriptionRegistry},
    reporter::ErrorReporter,
    responder::Responder,
    store::{Connector, MemoryConnector, StoreHandle},
    worker::{WorkerPool, Workers},
};

/// Сколько `stop` ждёт подтверждения QUIT от цикла.
const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Время на завершение задач пула при остановке.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Параметры одной отправки.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Таймаут ответа; при `None` берётся из настроек.
    pub timeout: Option<Duration>,
    /// Сначала проверить `PUBSUB NUMSUB` и ответить 404 локально, если
    /// адресата никто не слушает.
    pub confirm_subscribers: bool,
}

impl SendOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn confirm_subscribers(mut self) -> Self {
        self.confirm_subscribers = true;
        self
    }
}

pub struct Backend {
    identity: NodeIdentity,
    settings: Settings,
    store: StoreHandle,
    workers: Workers,
    registry: Arc<SubscriptionRegistry>,
    correlations: Arc<CorrelationTable>,
    health: HealthRegistrar,
    reporter: ErrorReporter,
    responder: Responder,
    event_loop: Mutex<EventLoop>,
    pool: Mutex<WorkerPool>,
    stopped: Arc<AtomicBool>,
}

impl Backend {
    /// Подключение с JSON-кодеком конвертов.
    pub fn connect(
        settings: Settings,
        connector: impl Connector,
    ) -> BackendResult<Self> {
        Self::connect_with(settings, Arc::new(connector), Arc::new(JsonCodec))
    }

    /// Бэкенд на собственном хранилище в памяти.
    pub fn in_memory(settings: Settings) -> BackendResult<Self> {
        Self::connect(settings, MemoryConnector::default())
    }

    /// Запускает пул и цикл событий и блокируется, пока цикл не подключится
    /// (или не получит отказ), но не дольше таймаута старта.
    ///
    /// Неудачное подключение не ломает конструирование: бэкенд поднимается
    /// инертным, и каждая команда хранилища отвечает `NotConnected`.
    pub fn connect_with(
        settings: Settings,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn EnvelopeCodec>,
    ) -> BackendResult<Self> {
        settings
            .validate()
            .map_err(|e| BackendError::Config(e.to_string()))?;

        let pool = WorkerPool::new(settings.worker_threads)?;
        let workers = pool.workers();
        let identity = NodeIdentity::generate();
        let (store, commands) = StoreHandle::channel();

        let reporter = ErrorReporter::new(
            settings.error_report_mode(),
            settings.error_buffer_len,
            identity.clone(),
            store.clone(),
            workers.clone(),
        );
        let registry = Arc::new(SubscriptionRegistry::new(
            store.clone(),
            workers.clone(),
            ExclusiveLock::new(store.clone(), settings.lock_expiry()),
            codec.clone(),
            reporter.clone(),
        ));
        let correlations = Arc::new(CorrelationTable::new(
            store.clone(),
            workers.clone(),
            codec.clone(),
        ));
        let responder = Responder::new(store.clone(), codec.clone(), workers.clone());
        let health = HealthRegistrar::new(
            identity.clone(),
            store.clone(),
            workers.clone(),
            registry.clone(),
            responder.clone(),
            codec,
            RetryPolicy {
                attempts: settings.unregister_attempts,
                backoff: settings.unregister_backoff(),
            },
        );

        let barrier = Arc::new(StartupBarrier::new());
        let router = Arc::new(Router::new(registry.clone(), correlations.clone()));
        let event_loop = EventLoop::start(
            connector,
            settings.address(),
            commands,
            router,
            barrier.clone(),
        )?;

        if !barrier.wait_timeout(settings.startup_timeout()) {
            warn!(
                timeout_ms = settings.startup_timeout_ms,
                "Event loop did not finish startup in time"
            );
        }

        let backend = Self {
            identity,
            settings,
            store,
            workers,
            registry,
            correlations,
            health,
            reporter,
            responder,
            event_loop: Mutex::new(event_loop),
            pool: Mutex::new(pool),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        if backend.settings.health_check {
            backend.register_health_check();
        }
        info!(
            identity = %backend.identity,
            connected = backend.is_connected(),
            "Backend ready"
        );
        Ok(backend)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.event_loop.lock().is_connected()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Новый id запроса, годится как `sender` конверта запроса.
    pub fn new_request_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Публикатор ответов в reply-топики, для обработчиков, отвечающих на
    /// запросы.
    pub fn responder(&self) -> Responder {
        self.responder.clone()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn pending_requests(&self) -> usize {
        self.correlations.pending_count()
    }

    fn ensure_running(&self) -> BackendResult<()> {
        if self.is_stopped() {
            Err(BackendError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Публикует `payload` в `destination`.
    ///
    /// С `handler` ответ из `gilmour.response.<sender>` (или синтезированный
    /// 499 по таймауту) доставляется ему ровно один раз. Возвращает `sender`.
    pub fn send(
        &self,
        sender: &str,
        destination: &str,
        payload: Bytes,
        options: SendOptions,
        handler: Option<ReplyHandler>,
    ) -> BackendResult<String> {
        self.ensure_running()?;
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.settings.default_timeout());

        if options.confirm_subscribers {
            self.send_confirmed(sender, destination, payload, timeout, handler);
            return Ok(sender.to_string());
        }

        match handler {
            Some(handler) => {
                let id = self.correlations.send_with_reply(
                    sender,
                    destination,
                    payload,
                    handler,
                    timeout,
                )?;
                settle_if_stopped(&self.correlations, &self.stopped, sender);
                Ok(id)
            }
            None => {
                debug!(sender, destination, "Publishing without reply");
                self.workers
                    .spawn_logged("PUBLISH", self.store.publish(destination, payload));
                Ok(sender.to_string())
            }
        }
    }

    /// Проверка подписчиков через `PUBSUB NUMSUB` и отправка.
    ///
    /// `send` к этому моменту уже вернул `Ok`, поэтому обработчик ответа
    /// здесь не теряется ни на одном пути: нет подписчиков (404), ошибка
    /// хранилища или регистрации (код ошибки), бэкенд остановлен (499).
    fn send_confirmed(
        &self,
        sender: &str,
        destination: &str,
        payload: Bytes,
        timeout: Duration,
        handler: Option<ReplyHandler>,
    ) -> JoinHandle<()> {
        let lookup = self.store.numsub(destination);
        let correlations = self.correlations.clone();
        let store = self.store.clone();
        let workers = self.workers.clone();
        let stopped = self.stopped.clone();
        let sender = sender.to_string();
        let destination = destination.to_string();

        self.workers.spawn(async move {
            let subscribers = match lookup.await {
                Ok(subscribers) => subscribers,
                Err(err) => {
                    warn!(
                        destination = %destination,
                        error = %err,
                        error_type = %err.type_name(),
                        "Subscriber check failed"
                    );
                    reply_locally(&workers, handler, err.status_code());
                    return;
                }
            };
            if subscribers == 0 {
                debug!(destination = %destination, "No subscribers, answering 404");
                reply_locally(&workers, handler, StatusCode::NotFound);
                return;
            }
            if stopped.load(Ordering::Acquire) {
                debug!(sender = %sender, "Backend stopped before the request was sent");
                reply_locally(&workers, handler, StatusCode::Timeout);
                return;
            }

            debug!(destination = %destination, subscribers, "Subscribers confirmed");
            let Some(handler) = handler else {
                workers.spawn_logged("PUBLISH", store.publish(&destination, payload));
                return;
            };
            match correlations.try_send_with_reply(
                &sender,
                &destination,
                payload,
                handler,
                timeout,
            ) {
                Ok(_) => settle_if_stopped(&correlations, &stopped, &sender),
                Err((err, handler)) => {
                    warn!(sender = %sender, error = %err, "Confirmed send failed");
                    reply_locally(&workers, Some(handler), err.status_code());
                }
            }
        })
    }

    pub fn add_listener(
        &self,
        topic: &str,
        listener: Listener,
    ) -> Binding {
        self.registry.add_listener(topic, listener)
    }

    pub fn remove_listener(
        &self,
        topic: &str,
        binding: Option<&Binding>,
    ) -> usize {
        self.registry.remove_listener(topic, binding)
    }

    pub fn setup_subscribers<I>(
        &self,
        listeners: I,
    ) -> Vec<Binding>
    where
        I: IntoIterator<Item = (String, Listener)>,
    {
        self.registry.setup_subscribers(listeners)
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.registry.list_topics()
    }

    /// Отвечает на запрос, в конверте которого был `sender`.
    pub fn send_response(
        &self,
        sender: &str,
        body: Value,
        code: u16,
    ) -> BackendResult<()> {
        self.ensure_running()?;
        self.responder.respond(sender, body, code)?;
        Ok(())
    }

    pub fn register_health_check(&self) {
        self.health.register();
    }

    /// Блокируется до подтверждения снятия регистрации или конца попыток.
    /// Нельзя вызывать из async-контекста.
    pub fn unregister_health_check(&self) -> bool {
        self.workers.block_on(self.health.unregister())
    }

    pub fn report_error(
        &self,
        message: impl Into<String>,
    ) -> Option<JoinHandle<bool>> {
        self.reporter.report(message)
    }

    /// Останавливает бэкенд: ожидающие запросы получают 499, цикл закрывает
    /// соединение, пул останавливается. Повторный вызов ничего не делает.
    ///
    /// Нельзя вызывать из async-контекста.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(identity = %self.identity, "Stopping backend");

        if self.health.is_registered() {
            self.workers.block_on(self.health.unregister());
        }

        let drained = self.correlations.drain();
        if !drained.is_empty() {
            debug!(pending = drained.len(), "Timing out outstanding requests");
        }
        self.workers.block_on(async {
            for handle in drained {
                let _ = handle.await;
            }
        });

        let quit = self.store.quit();
        let acknowledged = self
            .workers
            .block_on(async { tokio::time::timeout(QUIT_TIMEOUT, quit).await });
        if !matches!(acknowledged, Ok(Ok(()))) {
            warn!("Event loop did not acknowledge QUIT");
        }
        self.event_loop.lock().join();
        self.pool.lock().shutdown(SHUTDOWN_GRACE);
        info!(identity = %self.identity, "Backend stopped");
    }
}

/// Ответ, синтезированный без участия хранилища.
fn reply_locally(
    workers: &Workers,
    handler: Option<ReplyHandler>,
    code: StatusCode,
) {
    if let Some(handler) = handler {
        workers.run_reply("reply", move || handler(Value::Null, code.code()));
    }
}

/// Запрос, зарегистрированный уже после `stop()`, пропустил `drain` и
/// завершается здесь же ответом 499.
fn settle_if_stopped(
    correlations: &CorrelationTable,
    stopped: &AtomicBool,
    request_id: &str,
) {
    if stopped.load(Ordering::Acquire) {
        correlations.cancel(request_id);
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if self.is_stopped() {
            return;
        }
        if Handle::try_current().is_ok() {
            // Блокировка здесь остановила бы рантайм вызывающего.
            self.stopped.store(true, Ordering::Release);
            let _ = self.store.quit();
            warn!("Backend dropped inside an async context, stopping in the background");
        } else {
            self.stop();
        }
    }
}

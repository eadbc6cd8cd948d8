//! Поток, владеющий соединением с хранилищем.
//!
//! Подключается, открывает защёлку старта и затем мультиплексирует команды
//! из очереди с входящими кадрами до команды QUIT. Кадры здесь только
//! классифицируются; код обработчиков на этом потоке не выполняется.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use bytes::Bytes;
use gilmour_error::StoreError;
use tokio::runtime::Builder;
use tracing::{debug, error, info, warn};

use crate::{
    barrier::StartupBarrier,
    correlation::CorrelationTable,
    registry::SubscriptionRegistry,
    store::{self, Command, CommandReceiver, Connector, Frame, Op, Reply, StoreAddress},
    topics,
};

/// Получает каждый входящий кадр на потоке цикла.
pub trait FrameSink: Send + Sync + 'static {
    fn route(
        &self,
        frame: Frame,
    );
}

/// Reply-топики уходят в таблицу корреляций, остальное в реестр подписок.
///
/// Оба пути только снимают запись или планируют задачи, так что `route`
/// не блокирует поток цикла.
pub struct Router {
    registry: Arc<SubscriptionRegistry>,
    correlations: Arc<CorrelationTable>,
}

impl Router {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        correlations: Arc<CorrelationTable>,
    ) -> Self {
        Self {
            registry,
            correlations,
        }
    }
}

impl FrameSink for Router {
    fn route(
        &self,
        frame: Frame,
    ) {
        let (key, channel, payload): (Arc<str>, Arc<str>, Bytes) = match frame {
            Frame::Message { channel, payload } => (channel.clone(), channel, payload),
            Frame::PMessage {
                pattern,
                channel,
                payload,
            } => (pattern, channel, payload),
        };

        if topics::is_response_topic(&channel) {
            self.correlations.resolve(&channel, payload);
        } else {
            self.registry.dispatch(&key, &channel, payload);
        }
    }
}

pub struct EventLoop {
    thread: Option<thread::JoinHandle<()>>,
    connected: Arc<AtomicBool>,
}

impl EventLoop {
    /// Запускает поток цикла. Защёлка открывается, когда соединение
    /// установлено или подключение не удалось.
    pub fn start(
        connector: Arc<dyn Connector>,
        address: StoreAddress,
        commands: CommandReceiver,
        sink: Arc<dyn FrameSink>,
        barrier: Arc<StartupBarrier>,
    ) -> io::Result<Self> {
        let connected = Arc::new(AtomicBool::new(false));
        let flag = connected.clone();
        let thread = thread::Builder::new()
            .name("gilmour-event-loop".to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!(error = %err, "Failed to build event loop runtime");
                        barrier.signal();
                        return;
                    }
                };
                runtime.block_on(run(connector, address, commands, sink, barrier, flag));
            })?;
        Ok(Self {
            thread: Some(thread),
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Ждёт завершения потока цикла. Можно вызывать повторно.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Event loop thread panicked");
            }
        }
    }
}

async fn run(
    connector: Arc<dyn Connector>,
    address: StoreAddress,
    mut commands: CommandReceiver,
    sink: Arc<dyn FrameSink>,
    barrier: Arc<StartupBarrier>,
    connected: Arc<AtomicBool>,
) {
    let (mut conn, mut frames) = match connector.connect(&address).await {
        Ok(pair) => pair,
        Err(err) => {
            error!(%address, error = %err, "Failed to connect to store, backend is inert");
            barrier.signal();
            run_inert(commands).await;
            return;
        }
    };
    connected.store(true, Ordering::Release);
    info!(%address, "Event loop connected");
    barrier.signal();

    let mut frames_open = true;
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(Command { op, reply }) = command else {
                    debug!("Command queue closed");
                    break;
                };
                let quit = matches!(op, Op::Quit);
                let _ = reply.send(store::execute(conn.as_mut(), op).await);
                if quit {
                    break;
                }
            }
            frame = frames.recv(), if frames_open => match frame {
                Some(frame) => sink.route(frame),
                None => {
                    warn!("Store closed the frame stream");
                    frames_open = false;
                }
            },
        }
    }

    conn.close().await;
    connected.store(false, Ordering::Release);
    info!(%address, "Event loop stopped");
}

/// Отвечает на каждую команду `NotConnected` до команды QUIT.
async fn run_inert(mut commands: CommandReceiver) {
    while let Some(command) = commands.recv().await {
        if matches!(command.op, Op::Quit) {
            command.complete(Ok(Reply::Ok));
            break;
        }
        debug!(command = command.op.name(), "Store not connected");
        command.complete(Err(StoreError::NotConnected));
    }
}

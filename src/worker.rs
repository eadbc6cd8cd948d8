use std::{
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    time::Duration,
};

use gilmour_error::StoreResult;
use tokio::{
    runtime::{Builder, Handle, Runtime},
    task::JoinHandle,
};
use tracing::{error, warn};

/// Потоки, на которых вызываются обработчики ответов и таймаутов.
///
/// Отдельный рантайм: тела обработчиков сообщений занимают блокирующий
/// пул основного рантайма и не могут задержать 499 или ответ.
pub const REPLY_THREADS: usize = 4;

/// Пул для тел обработчиков, таймеров и продолжений команд хранилища.
///
/// Состоит из двух рантаймов:
/// - основной: async-задачи и тела обработчиков сообщений, число
///   блокирующих потоков ограничено `threads`;
/// - reply: только вызовы [`ReplyHandler`](crate::correlation::ReplyHandler).
pub struct WorkerPool {
    runtime: Option<Runtime>,
    replies: Option<Runtime>,
    workers: Workers,
}

impl WorkerPool {
    pub fn new(threads: usize) -> std::io::Result<Self> {
        let threads = threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .max_blocking_threads(threads)
            .thread_name("gilmour-worker")
            .enable_all()
            .build()?;
        let replies = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(REPLY_THREADS)
            .thread_name("gilmour-reply")
            .enable_all()
            .build()?;
        let workers = Workers {
            handle: runtime.handle().clone(),
            replies: replies.handle().clone(),
        };
        Ok(Self {
            runtime: Some(runtime),
            replies: Some(replies),
            workers,
        })
    }

    pub fn workers(&self) -> Workers {
        self.workers.clone()
    }

    /// Выполняет future до завершения с потока вне пула.
    ///
    /// Нельзя вызывать из async-контекста.
    pub fn block_on<F: Future>(
        &self,
        fut: F,
    ) -> F::Output {
        self.workers.block_on(fut)
    }

    /// Останавливает оба рантайма, давая задачам до `grace` на завершение.
    pub fn shutdown(
        &mut self,
        grace: Duration,
    ) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(grace);
        }
        if let Some(replies) = self.replies.take() {
            replies.shutdown_timeout(grace);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        if let Some(replies) = self.replies.take() {
            replies.shutdown_background();
        }
    }
}

/// Планировщик пула: дешёвый клон для компонентов.
#[derive(Clone, Debug)]
pub struct Workers {
    handle: Handle,
    replies: Handle,
}

impl Workers {
    pub fn spawn<F>(
        &self,
        fut: F,
    ) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }

    /// Тело обработчика сообщения.
    pub fn spawn_blocking<F, R>(
        &self,
        f: F,
    ) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.spawn_blocking(f)
    }

    /// Вызывает обработчик ответа на reply-потоках.
    ///
    /// Ошибки и паники логируются здесь и до вызывающего не доходят;
    /// результат `true`, если обработчик завершился успешно.
    pub fn run_reply<F>(
        &self,
        label: &'static str,
        f: F,
    ) -> JoinHandle<bool>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.replies.spawn_blocking(move || guard(label, f).is_ok())
    }

    /// Нельзя вызывать из async-контекста.
    pub fn block_on<F: Future>(
        &self,
        fut: F,
    ) -> F::Output {
        self.handle.block_on(fut)
    }

    /// Дожидается результата команды хранилища и логирует ошибку.
    pub fn spawn_logged<F, T>(
        &self,
        what: &'static str,
        fut: F,
    ) -> JoinHandle<Option<T>>
    where
        F: Future<Output = StoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.handle.spawn(async move {
            match fut.await {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(command = what, error = %err, "Store command failed");
                    None
                }
            }
        })
    }
}

/// Вызывает `f`, превращая ошибку или панику в запись лога.
///
/// При неудаче возвращает текст ошибки или паники.
pub fn guard<F>(
    label: &'static str,
    f: F,
) -> Result<(), String>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            error!(handler = label, error = %err, "Handler failed");
            Err(format!("{err:#}"))
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(handler = label, panic = %reason, "Handler panicked");
            Err(format!("panic: {reason}"))
        }
    }
}

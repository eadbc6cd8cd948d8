use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Одноразовая защёлка старта между потоком, создающим бэкенд, и потоком
/// цикла событий.
///
/// Сигнал хранится как состояние: `signal()` до `wait()` не теряется,
/// `wait()` просто сразу возвращается.
#[derive(Debug, Default)]
pub struct StartupBarrier {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl StartupBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Открывает защёлку и будит всех ожидающих.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Ждёт открытия защёлки.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
    }

    /// Ждёт открытия защёлки, но не дольше `timeout`.
    ///
    /// Вернёт `true`, если защёлка открыта.
    pub fn wait_timeout(
        &self,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                return *signaled;
            }
        }
        true
    }
}

use std::{future::Future, time::Duration};

use tracing::{debug, warn};

use crate::store::StoreHandle;

/// Рекомендательная блокировка с ограниченным временем жизни поверх
/// `SET key owner PX expiry NX`.
///
/// Явного освобождения нет: блокировка исчезает по истечении срока.
#[derive(Debug, Clone)]
pub struct ExclusiveLock {
    store: StoreHandle,
    expiry: Duration,
}

impl ExclusiveLock {
    pub fn new(
        store: StoreHandle,
        expiry: Duration,
    ) -> Self {
        Self { store, expiry }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Пытается захватить `key` для `owner` со сроком по умолчанию.
    ///
    /// Команда ставится в очередь сразу; future вернёт `true`, если
    /// блокировка теперь наша. Ошибка хранилища считается неудачей.
    pub fn acquire(
        &self,
        key: &str,
        owner: &str,
    ) -> impl Future<Output = bool> + Send + 'static {
        self.acquire_for(key, owner, self.expiry)
    }

    pub fn acquire_for(
        &self,
        key: &str,
        owner: &str,
        expiry: Duration,
    ) -> impl Future<Output = bool> + Send + 'static {
        let pending = self.store.set_nx(key, owner, expiry);
        let key = key.to_string();
        async move {
            match pending.await {
                Ok(held) => {
                    debug!(key = %key, held, "Exclusive lock attempt");
                    held
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "Exclusive lock attempt failed");
                    false
                }
            }
        }
    }
}

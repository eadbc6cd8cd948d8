use std::sync::Arc;

use gilmour_error::BackendResult;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::{
    envelope::{Envelope, EnvelopeCodec},
    store::StoreHandle,
    topics::response_topic,
    worker::Workers,
};

/// Публикует ответы в `gilmour.response.<sender>`.
#[derive(Clone)]
pub struct Responder {
    store: StoreHandle,
    codec: Arc<dyn EnvelopeCodec>,
    workers: Workers,
}

impl Responder {
    pub fn new(
        store: StoreHandle,
        codec: Arc<dyn EnvelopeCodec>,
        workers: Workers,
    ) -> Self {
        Self {
            store,
            codec,
            workers,
        }
    }

    /// Кодирует `{body, code}` для `sender` и ставит публикацию в очередь.
    ///
    /// Возвращаются только ошибки кодирования; неудачная публикация
    /// логируется задачей за возвращённым handle.
    pub fn respond(
        &self,
        sender: &str,
        body: Value,
        code: u16,
    ) -> BackendResult<JoinHandle<Option<usize>>> {
        let payload = self.codec.encode(&Envelope::new(body, code, sender))?;
        let topic = response_topic(sender);
        trace!(topic = %topic, code, "Publishing response");
        Ok(self
            .workers
            .spawn_logged("PUBLISH", self.store.publish(&topic, payload)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        envelope::JsonCodec,
        store::{testing::spawn_memory_driver, Frame, MemoryStore},
        worker::WorkerPool,
    };

    #[test]
    fn test_response_lands_on_reply_topic() {
        let pool = WorkerPool::new(1).unwrap();
        let (store, mut frames) = pool.block_on(spawn_memory_driver(Arc::new(MemoryStore::new())));
        pool.block_on(store.subscribe("gilmour.response.req-7")).unwrap();

        let responder = Responder::new(store, Arc::new(JsonCodec), pool.workers());
        let sent = responder.respond("req-7", json!({"ok": true}), 200).unwrap();
        assert_eq!(pool.block_on(sent).unwrap(), Some(1));

        let Some(Frame::Message { channel, payload }) = pool.block_on(frames.recv()) else {
            panic!("expected a message frame");
        };
        assert_eq!(&*channel, "gilmour.response.req-7");
        let envelope = JsonCodec.decode(&payload).unwrap();
        assert_eq!(envelope, Envelope::new(json!({"ok": true}), 200, "req-7"));
    }
}

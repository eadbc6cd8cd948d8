use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use gilmour::{
    topics, Backend, BackendError, EnvelopeCodec, ErrorReporting, JsonCodec, Listener,
    MemoryConnector, MemoryStore, ReplyHandler, SendOptions, Settings,
};
use serde_json::{json, Value};

mod common;
use common::*;

fn node(store: &Arc<MemoryStore>) -> Backend {
    Backend::connect(test_settings(), MemoryConnector::new(store.clone())).unwrap()
}

/// Сценарий `orders.*`: шаблонная подписка получает конкретный топик и
/// тело сообщения.
#[test]
fn test_pattern_listener_receives_concrete_topic() {
    let store = Arc::new(MemoryStore::new());
    let consumer = node(&store);
    let producer = node(&store);
    let (tx, rx) = mpsc::channel();

    consumer.add_listener(
        "orders.*",
        Listener::new(move |topic, payload| {
            let envelope = JsonCodec.decode(&payload)?;
            tx.send((topic.to_string(), envelope.data))?;
            Ok(())
        }),
    );
    wait_until(|| store.broker().active_patterns() == vec!["orders.*".to_string()]);

    producer
        .send(
            "req-orders",
            "orders.created",
            request("req-orders", json!({"id": 7})),
            SendOptions::default(),
            None,
        )
        .unwrap();

    let (topic, data) = recv(&rx);
    assert_eq!(topic, "orders.created");
    assert_eq!(data, json!({"id": 7}));

    consumer.stop();
    producer.stop();
}

#[test]
fn test_request_reply_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let server = node(&store);
    let client = node(&store);

    let responder = server.responder();
    server.add_listener(
        "math.double",
        Listener::new(move |_, payload| {
            let request = JsonCodec.decode(&payload)?;
            let n = request.data.as_i64().unwrap_or_default();
            responder.respond(&request.sender, json!(n * 2), 200)?;
            Ok(())
        }),
    );
    wait_until(|| store.broker().numsub("math.double") == 1);

    let id = Backend::new_request_id();
    let (handler, rx) = reply_channel();
    let returned = client
        .send(
            &id,
            "math.double",
            request(&id, json!(21)),
            SendOptions::with_timeout(Duration::from_secs(5)),
            Some(handler),
        )
        .unwrap();
    assert_eq!(returned, id);
    assert_eq!(recv(&rx), (json!(42), 200));
    wait_until(|| client.pending_requests() == 0);
}

/// Без ответчика обработчик получает `(null, 499)` не раньше таймаута.
#[test]
fn test_send_without_responder_times_out_with_499() {
    let store = Arc::new(MemoryStore::new());
    let backend = node(&store);
    let (handler, rx) = reply_channel();
    let started = Instant::now();

    backend
        .send(
            "lonely",
            "nobody.home",
            request("lonely", Value::Null),
            SendOptions::with_timeout(Duration::from_millis(200)),
            Some(handler),
        )
        .unwrap();

    assert_eq!(recv(&rx), (Value::Null, 499));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "fired late: {elapsed:?}");
    // Тема ответа освобождена.
    wait_until(|| store.broker().numsub("gilmour.response.lonely") == 0);
}

/// Ответ и таймер гонятся, но обработчик срабатывает ровно один раз.
#[test]
fn test_reply_handler_fires_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let server = node(&store);
    let client = node(&store);
    let responder = server.responder();
    server.add_listener(
        "slow",
        Listener::new(move |_, payload| {
            let request = JsonCodec.decode(&payload)?;
            std::thread::sleep(Duration::from_millis(50));
            responder.respond(&request.sender, json!("late"), 200)?;
            Ok(())
        }),
    );
    wait_until(|| store.broker().numsub("slow") == 1);

    let calls = Arc::new(AtomicUsize::new(0));
    for i in 0..10 {
        let calls = calls.clone();
        let id = format!("race-{i}");
        let handler: ReplyHandler = Box::new(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        client
            .send(
                &id,
                "slow",
                request(&id, Value::Null),
                SendOptions::with_timeout(Duration::from_millis(40 + i * 5)),
                Some(handler),
            )
            .unwrap();
    }
    wait_until(|| calls.load(Ordering::SeqCst) >= 10);
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(calls.load(Ordering::SeqCst), 10);
    assert_eq!(client.pending_requests(), 0);
}

/// С подтверждением подписчиков отсутствие получателя даёт 404, и ничего
/// не публикуется.
#[test]
fn test_confirm_subscribers_without_listener_yields_404() {
    let store = Arc::new(MemoryStore::new());
    let connector = RecordingConnector::new(store);
    let backend = Backend::connect(test_settings(), connector.clone()).unwrap();
    let (handler, rx) = reply_channel();

    backend
        .send(
            "ghost-req",
            "ghost.service",
            request("ghost-req", Value::Null),
            SendOptions::with_timeout(Duration::from_secs(5)).confirm_subscribers(),
            Some(handler),
        )
        .unwrap();

    assert_eq!(recv(&rx), (Value::Null, 404));
    assert_eq!(connector.count("NUMSUB", "ghost.service"), 1);
    assert_eq!(connector.count("PUBLISH", "ghost.service"), 0);
    assert_eq!(connector.count("SUBSCRIBE", "gilmour.response.ghost-req"), 0);
}

#[test]
fn test_confirm_subscribers_with_listener_publishes() {
    let store = Arc::new(MemoryStore::new());
    let server = node(&store);
    let responder = server.responder();
    server.add_listener(
        "present",
        Listener::new(move |_, payload| {
            let request = JsonCodec.decode(&payload)?;
            responder.respond(&request.sender, json!("here"), 200)?;
            Ok(())
        }),
    );
    wait_until(|| store.broker().numsub("present") == 1);

    let client = node(&store);
    let (handler, rx) = reply_channel();
    client
        .send(
            "check",
            "present",
            request("check", Value::Null),
            SendOptions::with_timeout(Duration::from_secs(5)).confirm_subscribers(),
            Some(handler),
        )
        .unwrap();
    assert_eq!(recv(&rx), (json!("here"), 200));
}

/// Последнее удаление обработчика выдаёт ровно одну отписку.
#[test]
fn test_last_removal_unsubscribes_once() {
    let store = Arc::new(MemoryStore::new());
    let connector = RecordingConnector::new(store.clone());
    let backend = Backend::connect(test_settings(), connector.clone()).unwrap();

    let a = backend.add_listener("feed", Listener::new(|_, _| Ok(())));
    let b = backend.add_listener("feed", Listener::new(|_, _| Ok(())));
    assert_eq!(backend.remove_listener("feed", Some(&a)), 1);
    assert_eq!(backend.remove_listener("feed", Some(&b)), 1);
    assert_eq!(backend.remove_listener("feed", Some(&b)), 0);
    assert_eq!(backend.remove_listener("feed", None), 0);

    wait_until(|| connector.count("UNSUBSCRIBE", "feed") == 1);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(connector.count("SUBSCRIBE", "feed"), 1);
    assert_eq!(connector.count("UNSUBSCRIBE", "feed"), 1);
    assert!(backend.subscribed_topics().is_empty());
    assert_eq!(store.broker().numsub("feed"), 0);
}

/// Интроспекция здоровья возвращает набор тем, включая собственную тему
/// здоровья.
#[test]
fn test_health_introspection() {
    let store = Arc::new(MemoryStore::new());
    let settings = Settings {
        health_check: true,
        ..test_settings()
    };
    let target = Backend::connect(settings, MemoryConnector::new(store.clone())).unwrap();
    target.add_listener("billing.*", Listener::new(|_, _| Ok(())));
    let health_topic = topics::health_topic(target.identity().as_str());

    wait_until(|| {
        store
            .hget(0, topics::HEALTH_KEY, target.identity().as_str())
            .unwrap()
            .is_some()
    });
    wait_until(|| store.broker().numsub(&health_topic) == 1);

    let client = node(&store);
    let (handler, rx) = reply_channel();
    client
        .send(
            "health-ping",
            &health_topic,
            request("health-ping", Value::Null),
            SendOptions::with_timeout(Duration::from_secs(5)),
            Some(handler),
        )
        .unwrap();

    let (body, code) = recv(&rx);
    assert_eq!(code, 200);
    let listed: Vec<String> = serde_json::from_value(body).unwrap();
    assert!(listed.contains(&health_topic));
    assert!(listed.contains(&"billing.*".to_string()));

    assert!(target.unregister_health_check());
    assert!(store
        .hget(0, topics::HEALTH_KEY, target.identity().as_str())
        .unwrap()
        .is_none());
    assert!(!target.subscribed_topics().contains(&health_topic));
}

/// Буферизованная очередь ошибок ограничена и хранит последние записи.
#[test]
fn test_buffered_error_queue_keeps_most_recent() {
    let store = Arc::new(MemoryStore::new());
    let settings = Settings {
        error_reporting: ErrorReporting::Buffered,
        error_buffer_len: 3,
        ..test_settings()
    };
    let backend = Backend::connect(settings, MemoryConnector::new(store.clone())).unwrap();
    let rt = tokio::runtime::Runtime::new().unwrap();

    for i in 0..6 {
        let done = backend.report_error(format!("err-{i}")).unwrap();
        assert!(rt.block_on(done).unwrap());
    }
    let items = store.lrange(0, topics::ERROR_QUEUE, 0, -1).unwrap();
    assert_eq!(items, vec![
        Bytes::from_static(b"err-5"),
        Bytes::from_static(b"err-4"),
        Bytes::from_static(b"err-3"),
    ]);
}

/// Сбой обработчика изолирован и попадает в канал ошибок.
#[test]
fn test_handler_failure_is_broadcast() {
    let store = Arc::new(MemoryStore::new());
    let settings = Settings {
        error_reporting: ErrorReporting::Broadcast,
        ..test_settings()
    };
    let backend = Backend::connect(settings, MemoryConnector::new(store.clone())).unwrap();
    let observer = node(&store);
    let (tx, rx) = mpsc::channel();
    observer.add_listener(
        topics::ERROR_CHANNEL,
        Listener::new(move |_, payload| {
            tx.send(payload)?;
            Ok(())
        }),
    );
    backend.add_listener("fragile", Listener::new(|_, _| anyhow::bail!("fragile broke")));
    wait_until(|| {
        store.broker().numsub(topics::ERROR_CHANNEL) == 1 && store.broker().numsub("fragile") == 1
    });

    observer
        .send("req-f", "fragile", request("req-f", json!(1)), SendOptions::default(), None)
        .unwrap();

    let raw = recv(&rx);
    let report: Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(report["topic"], "fragile");
    assert_eq!(report["sender"], "req-f");
    assert_eq!(report["node"], backend.identity().as_str());
    assert!(report["description"].as_str().unwrap().contains("fragile broke"));
}

/// Эксклюзивный обработчик выполняется на одном узле; после истечения
/// блокировки тот же запрос снова может быть выполнен.
#[test]
fn test_exclusive_listener_single_winner_then_expiry() {
    let store = Arc::new(MemoryStore::new());
    let settings = Settings {
        lock_expiry_secs: 1,
        ..test_settings()
    };
    let ran = Arc::new(AtomicUsize::new(0));
    let workers: Vec<Backend> = (0..3)
        .map(|_| {
            let backend =
                Backend::connect(settings.clone(), MemoryConnector::new(store.clone())).unwrap();
            let ran = ran.clone();
            backend.add_listener(
                "jobs.run",
                Listener::new(move |_, _| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .exclusive(),
            );
            backend
        })
        .collect();
    wait_until(|| store.broker().numsub("jobs.run") == 3);

    let sender = node(&store);
    sender
        .send("job-1", "jobs.run", request("job-1", Value::Null), SendOptions::default(), None)
        .unwrap();
    wait_until(|| ran.load(Ordering::SeqCst) >= 1);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    std::thread::sleep(Duration::from_millis(1100));
    sender
        .send("job-1", "jobs.run", request("job-1", Value::Null), SendOptions::default(), None)
        .unwrap();
    wait_until(|| ran.load(Ordering::SeqCst) >= 2);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(ran.load(Ordering::SeqCst), 2);
    drop(workers);
}

/// `stop` завершает ожидающие запросы кодом 499 и идемпотентен.
#[test]
fn test_stop_drains_pending_requests() {
    let store = Arc::new(MemoryStore::new());
    let backend = node(&store);
    let (handler, rx) = reply_channel();
    backend
        .send(
            "forever",
            "void",
            request("forever", Value::Null),
            SendOptions::with_timeout(Duration::from_secs(600)),
            Some(handler),
        )
        .unwrap();

    let started = Instant::now();
    backend.stop();
    assert_eq!(recv(&rx), (Value::Null, 499));
    assert!(started.elapsed() < Duration::from_secs(5));
    backend.stop();

    assert!(backend.is_stopped());
    assert!(!backend.is_connected());
    let err = backend
        .send("late", "void", Bytes::new(), SendOptions::default(), None)
        .unwrap_err();
    assert!(matches!(err, BackendError::Stopped));
}

/// Недоступное хранилище не ломает конструирование: бэкенд инертен, а
/// проверка подписчиков отвечает 500.
#[test]
fn test_unreachable_store_leaves_backend_inert() {
    let settings = Settings {
        db: 99,
        ..test_settings()
    };
    let backend = Backend::in_memory(settings).unwrap();
    assert!(!backend.is_connected());

    let (handler, rx) = reply_channel();
    backend
        .send(
            "inert",
            "anything",
            request("inert", Value::Null),
            SendOptions::with_timeout(Duration::from_secs(5)).confirm_subscribers(),
            Some(handler),
        )
        .unwrap();
    assert_eq!(recv(&rx), (Value::Null, 500));
}

/// Все блокирующие потоки заняты медленными обработчиками, но 499
/// приходит вовремя, а не после их завершения.
#[test]
fn test_timeout_is_not_delayed_by_busy_handlers() {
    let store = Arc::new(MemoryStore::new());
    let backend = node(&store);
    let busy = Arc::new(AtomicUsize::new(0));

    let started = busy.clone();
    backend.add_listener(
        "slow",
        Listener::new(move |_, _| {
            started.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1500));
            Ok(())
        }),
    );
    wait_until(|| store.broker().numsub("slow") == 1);
    for i in 0..test_settings().worker_threads {
        let id = format!("slow-{i}");
        backend
            .send(&id, "slow", request(&id, Value::Null), SendOptions::default(), None)
            .unwrap();
    }
    wait_until(|| busy.load(Ordering::SeqCst) == test_settings().worker_threads);

    let (handler, rx) = reply_channel();
    let sent_at = Instant::now();
    backend
        .send(
            "waits-on-nobody",
            "nobody.home",
            request("waits-on-nobody", Value::Null),
            SendOptions::with_timeout(Duration::from_millis(100)),
            Some(handler),
        )
        .unwrap();

    assert_eq!(recv(&rx), (Value::Null, 499));
    let elapsed = sent_at.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(600), "499 arrived after {elapsed:?}");
    backend.stop();
}

/// Повторный id при отправке с подтверждением: `send` уже вернул `Ok`,
/// поэтому второй обработчик получает 400 локально, а первый ждёт свой ответ.
#[test]
fn test_confirmed_duplicate_request_answers_locally() {
    let store = Arc::new(MemoryStore::new());
    let backend = node(&store);
    backend.add_listener("silent", Listener::new(|_, _| Ok(())));
    wait_until(|| store.broker().numsub("silent") == 1);

    let (first, first_rx) = reply_channel();
    backend
        .send(
            "dup",
            "silent",
            request("dup", Value::Null),
            SendOptions::with_timeout(Duration::from_secs(30)),
            Some(first),
        )
        .unwrap();

    let (second, second_rx) = reply_channel();
    let returned = backend.send(
        "dup",
        "silent",
        request("dup", Value::Null),
        SendOptions::with_timeout(Duration::from_secs(30)).confirm_subscribers(),
        Some(second),
    );
    assert_eq!(returned.unwrap(), "dup");
    assert_eq!(recv(&second_rx), (Value::Null, 400));
    assert!(first_rx.recv_timeout(Duration::from_millis(100)).is_err());

    backend.stop();
    assert_eq!(recv(&first_rx), (Value::Null, 499));
}

/// `stop` между проверкой подписчиков и регистрацией: обработчик всё равно
/// получает 499.
#[test]
fn test_stop_during_subscriber_check_answers_499() {
    let store = Arc::new(MemoryStore::new());
    let server = node(&store);
    server.add_listener("present", Listener::new(|_, _| Ok(())));
    wait_until(|| store.broker().numsub("present") == 1);

    let (connector, gate) = RecordingConnector::new(store.clone()).with_numsub_gate();
    let client = Arc::new(Backend::connect(test_settings(), connector.clone()).unwrap());
    let (handler, rx) = reply_channel();
    client
        .send(
            "late",
            "present",
            request("late", Value::Null),
            SendOptions::with_timeout(Duration::from_secs(30)).confirm_subscribers(),
            Some(handler),
        )
        .unwrap();
    wait_until(|| connector.count("NUMSUB", "present") == 1);

    let stopping = client.clone();
    let stopper = std::thread::spawn(move || stopping.stop());
    wait_until(|| client.is_stopped());
    gate.notify_one();

    assert_eq!(recv(&rx), (Value::Null, 499));
    stopper.join().unwrap();
    assert_eq!(client.pending_requests(), 0);
    server.stop();
}

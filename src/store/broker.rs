use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use dashmap::DashMap;
use gilmour_error::{StoreError, StoreResult};
use globset::{GlobBuilder, GlobMatcher};

use super::{Frame, FrameSender};

pub type ConnectionId = u64;

type ChannelKey = Arc<str>;

/// Подписчики шаблона вместе со скомпилированным матчером.
struct PatternEntry {
    matcher: GlobMatcher,
    subscribers: HashMap<ConnectionId, FrameSender>,
}

/// Брокер Pub/Sub сообщений внутрипроцессного хранилища.
///
/// Поддерживает:
/// - Точные подписки по имени канала (`message`)
/// - Подписки по glob-шаблонам (`pmessage`)
/// - Идемпотентную повторную подписку одного соединения
/// - Автоматическое удаление пустых каналов и шаблонов
/// - Статистику публикаций и ошибок отправки
#[derive(Default)]
pub struct Broker {
    /// Точные каналы → подписанные соединения
    channels: DashMap<ChannelKey, HashMap<ConnectionId, FrameSender>>,
    /// Шаблоны → матчер и подписанные соединения
    patterns: DashMap<ChannelKey, PatternEntry>,
    /// Общее количество вызовов `publish`
    pub publish_count: AtomicUsize,
    /// Количество неудачных отправок (соединение уже закрыто)
    pub send_error_count: AtomicUsize,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Подписка соединения на конкретный канал (точное совпадение).
    pub fn subscribe(
        &self,
        conn: ConnectionId,
        channel: &str,
        tx: FrameSender,
    ) {
        self.channels
            .entry(Arc::from(channel))
            .or_default()
            .insert(conn, tx);
    }

    /// Подписка по шаблону (glob), например `"orders.*"` или `"a?c"`.
    pub fn psubscribe(
        &self,
        conn: ConnectionId,
        pattern: &str,
        tx: FrameSender,
    ) -> StoreResult<()> {
        if let Some(mut entry) = self.patterns.get_mut(pattern) {
            entry.subscribers.insert(conn, tx);
            return Ok(());
        }
        let matcher = compile(pattern)?;
        self.patterns
            .entry(Arc::from(pattern))
            .or_insert_with(|| PatternEntry {
                matcher,
                subscribers: HashMap::new(),
            })
            .subscribers
            .insert(conn, tx);
        Ok(())
    }

    /// Отписка соединения от канала. Возвращает `true`, если подписка была.
    pub fn unsubscribe(
        &self,
        conn: ConnectionId,
        channel: &str,
    ) -> bool {
        let removed = self
            .channels
            .get_mut(channel)
            .map(|mut subs| subs.remove(&conn).is_some())
            .unwrap_or(false);
        self.channels.remove_if(channel, |_, subs| subs.is_empty());
        removed
    }

    /// Отписка соединения от шаблона. Возвращает `true`, если подписка была.
    pub fn punsubscribe(
        &self,
        conn: ConnectionId,
        pattern: &str,
    ) -> bool {
        let removed = self
            .patterns
            .get_mut(pattern)
            .map(|mut entry| entry.subscribers.remove(&conn).is_some())
            .unwrap_or(false);
        self.patterns
            .remove_if(pattern, |_, entry| entry.subscribers.is_empty());
        removed
    }

    /// Удаляет все подписки соединения.
    pub fn disconnect(
        &self,
        conn: ConnectionId,
    ) {
        self.channels.iter_mut().for_each(|mut subs| {
            subs.remove(&conn);
        });
        self.channels.retain(|_, subs| !subs.is_empty());
        self.patterns.iter_mut().for_each(|mut entry| {
            entry.subscribers.remove(&conn);
        });
        self.patterns.retain(|_, entry| !entry.subscribers.is_empty());
    }

    /// Публикация сообщения в канал.
    ///
    /// Работает в два этапа:
    /// 1. Отправляет `message` всем точным подписчикам канала
    /// 2. Отправляет `pmessage` подписчикам каждого совпавшего шаблона
    ///
    /// Возвращает количество доставленных кадров.
    pub fn publish(
        &self,
        channel: &str,
        payload: Bytes,
    ) -> usize {
        self.publish_count.fetch_add(1, Ordering::Relaxed);
        let channel_key: Arc<str> = Arc::from(channel);
        let mut delivered = 0;

        // 1) точное совпадение
        if let Some(subs) = self.channels.get(channel) {
            for tx in subs.values() {
                let frame = Frame::Message {
                    channel: channel_key.clone(),
                    payload: payload.clone(),
                };
                delivered += self.deliver(tx, frame);
            }
        }

        // 2) по шаблону
        for entry in self.patterns.iter() {
            if !entry.matcher.is_match(channel) {
                continue;
            }
            for tx in entry.subscribers.values() {
                let frame = Frame::PMessage {
                    pattern: entry.key().clone(),
                    channel: channel_key.clone(),
                    payload: payload.clone(),
                };
                delivered += self.deliver(tx, frame);
            }
        }
        delivered
    }

    fn deliver(
        &self,
        tx: &FrameSender,
        frame: Frame,
    ) -> usize {
        if tx.send(frame).is_ok() {
            1
        } else {
            self.send_error_count.fetch_add(1, Ordering::Relaxed);
            0
        }
    }

    /// Количество точных подписчиков канала (`PUBSUB NUMSUB`).
    pub fn numsub(
        &self,
        channel: &str,
    ) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    /// Возвращает список всех активных каналов.
    pub fn active_channels(&self) -> Vec<String> {
        let mut out: Vec<String> = self.channels.iter().map(|e| e.key().to_string()).collect();
        out.sort();
        out
    }

    /// Возвращает список всех активных шаблонов.
    pub fn active_patterns(&self) -> Vec<String> {
        let mut out: Vec<String> = self.patterns.iter().map(|e| e.key().to_string()).collect();
        out.sort();
        out
    }
}

/// Компилирует шаблон в стиле Redis: `*` совпадает с любой подстрокой,
/// включая `.`, а `\` экранирует следующий символ.
fn compile(pattern: &str) -> StoreResult<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| StoreError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

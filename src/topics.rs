//! Зарезервированные топики и ключи, общие для всех узлов gilmour.

/// Префикс reply-топиков: `gilmour.response.<request id>`.
pub const RESPONSE_PREFIX: &str = "gilmour.response.";
/// Префикс топика здоровья узла: `gilmour.health.<identity>`.
pub const HEALTH_PREFIX: &str = "gilmour.health.";
/// Хеш присутствия (`identity -> "active"`).
pub const HEALTH_KEY: &str = "gilmour.known_host.health";
/// Канал рассылки отчётов об ошибках.
pub const ERROR_CHANNEL: &str = "gilmour.errors";
/// Список по умолчанию для буферизованных отчётов.
pub const ERROR_QUEUE: &str = "gilmour.errorqueue";
/// Символ, превращающий топик в шаблонную подписку.
pub const WILDCARD: char = '*';

pub fn response_topic(request_id: &str) -> String {
    format!("{RESPONSE_PREFIX}{request_id}")
}

pub fn health_topic(identity: &str) -> String {
    format!("{HEALTH_PREFIX}{identity}")
}

#[inline]
pub fn is_response_topic(topic: &str) -> bool {
    topic.starts_with(RESPONSE_PREFIX)
}

#[inline]
pub fn is_pattern(topic: &str) -> bool {
    topic.contains(WILDCARD)
}

use std::fmt;

use num_enum::TryFromPrimitive;

/// Зарезервированные коды статуса ответа.
///
/// Приложение может отвечать любым `u16`, но эти значения имеют особый
/// смысл для транспорта:
/// - `Ok` (200): успешный ответ;
/// - `NotFound` (404): у адресата нет ни одного подписчика;
/// - `Timeout` (499): ответ синтезирован по таймеру, настоящий ответ не пришёл;
/// - `Internal` (500): ошибка обработчика или хранилища.
///
/// `num_enum::TryFromPrimitive` даёт `TryFrom<u16>` для разбора кода из
/// конверта.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u16)]
#[non_exhaustive]
pub enum StatusCode {
    Ok = 200,
    BadRequest = 400,
    NotFound = 404,
    Timeout = 499,
    Internal = 500,
}

impl StatusCode {
    /// Числовое представление кода статуса.
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Пытается получить вариант `StatusCode` из `u16`.
    ///
    /// Возвращает `None` для кодов, которые не зарезервированы транспортом.
    pub fn from_u16(v: u16) -> Option<Self> {
        Self::try_from(v).ok()
    }

    /// Вернёт `true`, если код означает успешный ответ (2xx).
    pub fn is_success(code: u16) -> bool {
        (200..300).contains(&code)
    }

    /// Вернёт `true`, если код означает синтезированный таймаут.
    pub fn is_timeout(code: u16) -> bool {
        code == Self::Timeout.code()
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> Self {
        code.code()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::Timeout => "TIMEOUT",
            Self::Internal => "INTERNAL",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

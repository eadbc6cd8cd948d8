use std::{fmt, sync::Arc};

use uuid::Uuid;

/// Идентификатор запущенного экземпляра бэкенда.
///
/// Формат: `<hostname>-pid-<pid>-uuid-<uuid>`. Используется как поле в хеше
/// присутствия и как суффикс личного топика здоровья.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity(Arc<str>);

impl NodeIdentity {
    pub fn generate() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self::from_parts(&host, std::process::id(), Uuid::new_v4())
    }

    pub fn from_parts(
        host: &str,
        pid: u32,
        nonce: Uuid,
    ) -> Self {
        Self(Arc::from(format!("{host}-pid-{pid}-uuid-{nonce}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodeIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let nonce = Uuid::nil();
        let id = NodeIdentity::from_parts("box", 42, nonce);
        assert_eq!(
            id.as_str(),
            "box-pid-42-uuid-00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_generated_identities_are_unique() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        assert_ne!(a, b);
        assert!(a.as_str().contains(&format!("-pid-{}-", std::process::id())));
    }
}

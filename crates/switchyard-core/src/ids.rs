//! Identity newtypes.
//!
//! [`WorkerId`] is a branded UUID v7 string. [`SessionKey`] is not random: it
//! is derived from the message source by the session router and must stay
//! stable across restarts, so it only offers parsing helpers plus the two
//! special forms used by non-chat callers (`cron:{jobId}` and `hook:{uuid}`).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Borrowed view of the id.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                self.as_str()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_owned())
            }
        }
    };
}

string_newtype! {
    /// Unique identifier for a pooled worker process.
    WorkerId
}

string_newtype! {
    /// Stable identity of one conversation.
    ///
    /// Chat sessions look like `agent:{agentId}:{channel}:{scope}:{identifier}`
    /// with optional `:topic:{id}` / `:thread:{id}` suffixes.
    SessionKey
}

impl WorkerId {
    /// Create a new random worker ID (UUID v7, time-ordered).
    #[must_use]
    pub fn new() -> Self {
        Self(format!("worker-{}", Uuid::now_v7()))
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionKey {
    /// Session key for a scheduled job.
    #[must_use]
    pub fn cron(job_id: &str) -> Self {
        Self(format!("cron:{job_id}"))
    }

    /// Fresh session key for a webhook-originated conversation.
    #[must_use]
    pub fn hook() -> Self {
        Self(format!("hook:{}", Uuid::now_v7()))
    }

    /// Agent id segment of an `agent:` key.
    pub fn agent_id(&self) -> Option<&str> {
        let mut parts = self.0.split(':');
        match (parts.next(), parts.next()) {
            (Some("agent"), Some(id)) if !id.is_empty() => Some(id),
            _ => None,
        }
    }

    /// Channel segment of an `agent:` key (`main` for the shared DM session).
    pub fn channel(&self) -> Option<&str> {
        self.agent_id()?;
        self.0.split(':').nth(2)
    }

    /// Value following a `:{label}:` marker, e.g. `account` or `topic`.
    pub fn segment(&self, label: &str) -> Option<&str> {
        let mut parts = self.0.split(':');
        while let Some(part) = parts.next() {
            if part == label {
                return parts.next().filter(|v| !v.is_empty());
            }
        }
        None
    }

    /// Account segment, present for multi-account channels.
    pub fn account_id(&self) -> Option<&str> {
        self.segment("account")
    }

    /// Whether this key was minted for a scheduled job.
    pub fn is_cron(&self) -> bool {
        self.0.starts_with("cron:")
    }

    /// Whether this key was minted for a webhook.
    pub fn is_hook(&self) -> bool {
        self.0.starts_with("hook:")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_ids_are_unique_and_prefixed() {
        let a = WorkerId::new();
        let b = WorkerId::new();
        assert_ne!(a, b);
        assert!(a.starts_with("worker-"));
    }

    #[test]
    fn agent_id_and_channel() {
        let key = SessionKey::from("agent:main:telegram:group:-100123:topic:7");
        assert_eq!(key.agent_id(), Some("main"));
        assert_eq!(key.channel(), Some("telegram"));
        assert_eq!(key.segment("topic"), Some("7"));
        assert_eq!(key.segment("thread"), None);
    }

    #[test]
    fn account_segment() {
        let key = SessionKey::from("agent:main:telegram:account:work:group:-100");
        assert_eq!(key.account_id(), Some("work"));
        let plain = SessionKey::from("agent:main:telegram:group:-100");
        assert_eq!(plain.account_id(), None);
    }

    #[test]
    fn special_forms() {
        let cron = SessionKey::cron("nightly");
        assert_eq!(cron.as_str(), "cron:nightly");
        assert!(cron.is_cron());
        assert_eq!(cron.agent_id(), None);
        assert_eq!(cron.channel(), None);

        let hook = SessionKey::hook();
        assert!(hook.is_hook());
        assert_ne!(hook, SessionKey::hook());
    }

    #[test]
    fn serde_is_transparent() {
        let key = SessionKey::from("agent:main:main");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"agent:main:main\"");
        let back: SessionKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}

//! Process-local passphrase cache.
//!
//! Nothing in here is ever written to disk or serialized. A drive is in one of
//! three modes: remembered for the process lifetime, paranoid (never cached),
//! or prompt (not cached, no restriction).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use zeroize::Zeroizing;

/// A passphrase held in memory. Zeroed on drop, never printed.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

impl From<String> for Passphrase {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretMode {
    Remember,
    Paranoid,
    Prompt,
}

impl SecretMode {
    /// Paranoid wins over a conflicting remember flag.
    pub fn from_flags(remember: bool, paranoid: bool) -> Self {
        if paranoid {
            Self::Paranoid
        } else if remember {
            Self::Remember
        } else {
            Self::Prompt
        }
    }
}

#[derive(Default)]
struct Entry {
    mode: Option<SecretMode>,
    value: Option<Passphrase>,
}

#[derive(Clone, Default)]
pub struct SecretCache {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl SecretCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> R) -> R {
        let mut map = match self.inner.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut map)
    }

    pub fn mode(&self, drive_id: &str) -> SecretMode {
        self.with(|m| {
            m.get(drive_id)
                .and_then(|e| e.mode)
                .unwrap_or(SecretMode::Prompt)
        })
    }

    /// Switch modes. Leaving Remember discards any cached value.
    pub fn set_mode(&self, drive_id: &str, mode: SecretMode) {
        self.with(|m| {
            let entry = m.entry(drive_id.to_string()).or_default();
            entry.mode = Some(mode);
            if mode != SecretMode::Remember {
                entry.value = None;
            }
        });
    }

    pub fn get(&self, drive_id: &str) -> Option<Passphrase> {
        self.with(|m| {
            m.get(drive_id)
                .filter(|e| e.mode == Some(SecretMode::Remember))
                .and_then(|e| e.value.clone())
        })
    }

    /// Store a passphrase. A no-op unless the drive is in Remember mode.
    pub fn put(&self, drive_id: &str, passphrase: &Passphrase) {
        self.with(|m| {
            if let Some(entry) = m.get_mut(drive_id) {
                if entry.mode == Some(SecretMode::Remember) && !passphrase.is_empty() {
                    entry.value = Some(passphrase.clone());
                }
            }
        });
    }

    pub fn clear(&self, drive_id: &str) {
        self.with(|m| {
            if let Some(entry) = m.get_mut(drive_id) {
                entry.value = None;
            }
        });
    }

    /// Drop everything known about a drive.
    pub fn forget(&self, drive_id: &str) {
        self.with(|m| {
            m.remove(drive_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_mode_caches() {
        let cache = SecretCache::new();
        cache.set_mode("d1", SecretMode::Remember);
        cache.put("d1", &Passphrase::new("pw"));
        assert_eq!(cache.get("d1").unwrap().expose(), "pw");
        cache.clear("d1");
        assert!(cache.get("d1").is_none());
    }

    #[test]
    fn paranoid_put_is_noop() {
        let cache = SecretCache::new();
        cache.set_mode("d1", SecretMode::Paranoid);
        cache.put("d1", &Passphrase::new("pw"));
        assert!(cache.get("d1").is_none());
    }

    #[test]
    fn unknown_drive_put_is_noop() {
        let cache = SecretCache::new();
        cache.put("d1", &Passphrase::new("pw"));
        assert!(cache.get("d1").is_none());
        assert_eq!(cache.mode("d1"), SecretMode::Prompt);
    }

    #[test]
    fn switching_to_paranoid_discards_immediately() {
        let cache = SecretCache::new();
        cache.set_mode("d1", SecretMode::Remember);
        cache.put("d1", &Passphrase::new("pw"));
        cache.set_mode("d1", SecretMode::Paranoid);
        assert!(cache.get("d1").is_none());
        cache.set_mode("d1", SecretMode::Remember);
        assert!(cache.get("d1").is_none());
    }

    #[test]
    fn paranoid_flag_wins() {
        assert_eq!(SecretMode::from_flags(true, true), SecretMode::Paranoid);
        assert_eq!(SecretMode::from_flags(true, false), SecretMode::Remember);
        assert_eq!(SecretMode::from_flags(false, false), SecretMode::Prompt);
    }

    #[test]
    fn debug_is_redacted() {
        let p = Passphrase::new("hunter2");
        assert!(!format!("{:?}", p).contains("hunter2"));
    }
}

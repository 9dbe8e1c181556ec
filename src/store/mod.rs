//! Persistent key-value settings
//!
//! Namespaced string settings, backed by a JSON file on hosts. Also holds
//! the typed views the runtime persists: the reminder list and the pending
//! asset download URL.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Errors from the settings backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub trait SettingsStore: Send + Sync {
    fn get_string(&self, namespace: &str, key: &str) -> Option<String>;
    fn set_string(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError>;
    fn erase_key(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
}

type Namespaces = BTreeMap<String, BTreeMap<String, String>>;

/// In-memory store, lost on restart
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<Namespaces>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn get_string(&self, namespace: &str, key: &str) -> Option<String> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.get(namespace).and_then(|ns| ns.get(key)).cloned()
    }

    fn set_string(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn erase_key(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ns) = data.get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }
}

/// Store persisted as a single JSON document, rewritten on every change
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<Namespaces>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`
    ///
    /// A corrupt file is logged and replaced by an empty store.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let data = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(?path, error = %e, "settings file unreadable, starting empty");
                Namespaces::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Namespaces::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_owned(),
            data: Mutex::new(data),
        })
    }

    fn persist(&self, data: &Namespaces) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SettingsStore for JsonFileStore {
    fn get_string(&self, namespace: &str, key: &str) -> Option<String> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.get(namespace).and_then(|ns| ns.get(key)).cloned()
    }

    fn set_string(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self.persist(&data)
    }

    fn erase_key(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = data.get_mut(namespace).and_then(|ns| ns.remove(key));
        if removed.is_some() {
            self.persist(&data)?;
        }
        Ok(())
    }
}

/// Maximum number of stored reminders
pub const MAX_REMINDERS: usize = 10;

const MEMO_NAMESPACE: &str = "memo";
const MEMO_KEY: &str = "items";
const ASSETS_NAMESPACE: &str = "assets";
const DOWNLOAD_URL_KEY: &str = "download_url";

/// One reminder shown on the memo page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    /// `HH:MM` or empty when the reminder has no time
    #[serde(default)]
    pub time: String,
    pub content: String,
}

/// Load the reminder list; a missing or corrupt entry reads as empty
pub fn load_reminders(store: &dyn SettingsStore) -> Vec<Reminder> {
    store
        .get_string(MEMO_NAMESPACE, MEMO_KEY)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

pub fn save_reminders(store: &dyn SettingsStore, reminders: &[Reminder]) -> Result<(), StoreError> {
    store.set_string(MEMO_NAMESPACE, MEMO_KEY, &serde_json::to_string(reminders)?)
}

pub fn clear_reminders(store: &dyn SettingsStore) -> Result<(), StoreError> {
    store.erase_key(MEMO_NAMESPACE, MEMO_KEY)
}

/// Take the pending asset download URL, clearing it so it is used once
pub fn take_pending_download_url(store: &dyn SettingsStore) -> Result<Option<String>, StoreError> {
    match store.get_string(ASSETS_NAMESPACE, DOWNLOAD_URL_KEY) {
        Some(url) if !url.is_empty() => {
            store.erase_key(ASSETS_NAMESPACE, DOWNLOAD_URL_KEY)?;
            Ok(Some(url))
        }
        _ => Ok(None),
    }
}

pub fn set_pending_download_url(store: &dyn SettingsStore, url: &str) -> Result<(), StoreError> {
    store.set_string(ASSETS_NAMESPACE, DOWNLOAD_URL_KEY, url)
}

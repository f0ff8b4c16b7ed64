use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use zeroize::Zeroizing;

use crate::config;
use crate::error::JournalError;

const SESSION_FILE: &str = "session.json";

#[derive(Serialize, Deserialize)]
struct SessionFile {
    access_token: String,
}

/// Durable holder of the current access token.
///
/// Clones share one channel, so every subscriber sees `set`, `clear` and any
/// change another process makes to the session file (picked up by `reload`).
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    tx: watch::Sender<Option<String>>,
}

impl SessionStore {
    pub fn open(dir: &Path) -> Self {
        let path = dir.join(SESSION_FILE);
        let (tx, _) = watch::channel(read_token(&path));
        Self {
            inner: Arc::new(Inner { path, tx }),
        }
    }

    pub fn open_default() -> Self {
        Self::open(&config::get_config_dir())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn get(&self) -> Option<String> {
        self.inner.tx.borrow().clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.inner.tx.borrow().is_some()
    }

    pub fn set(&self, token: &str) -> Result<(), JournalError> {
        let token = token.trim();
        if token.is_empty() {
            return self.clear();
        }
        let json = serde_json::to_string(&SessionFile {
            access_token: token.to_string(),
        })
        .map_err(|e| JournalError::Storage(e.to_string()))?;
        config::write_private(&self.inner.path, json.as_bytes())?;
        tracing::info!("session: token stored");
        self.publish(Some(token.to_string()));
        Ok(())
    }

    pub fn clear(&self) -> Result<(), JournalError> {
        match fs::remove_file(&self.inner.path) {
            Ok(()) => tracing::info!("session: token removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.publish(None);
        Ok(())
    }

    /// Re-reads the session file. Returns true when its content changed.
    pub fn reload(&self) -> bool {
        let on_disk = read_token(&self.inner.path);
        let changed = self.publish(on_disk);
        if changed {
            tracing::info!("session: changed outside this process");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.inner.tx.subscribe()
    }

    /// Snapshot handed to every repository call.
    pub fn context(&self) -> SessionContext {
        self.get()
            .map(SessionContext::with_token)
            .unwrap_or_else(SessionContext::anonymous)
    }

    pub fn spawn_watcher(&self, period: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                // Every other handle is gone.
                if Arc::strong_count(&store.inner) == 1 {
                    break;
                }
                store.reload();
            }
        })
    }

    fn publish(&self, token: Option<String>) -> bool {
        self.inner.tx.send_if_modified(|current| {
            if *current != token {
                *current = token;
                true
            } else {
                false
            }
        })
    }
}

fn read_token(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let token = match serde_json::from_str::<SessionFile>(&content) {
        Ok(file) => file.access_token,
        Err(_) => content.trim().to_string(),
    };
    let token = token.trim().to_string();
    (!token.is_empty()).then_some(token)
}

/// The credential a single operation runs with.
#[derive(Clone, Default)]
pub struct SessionContext {
    token: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl SessionContext {
    pub fn with_token(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            token: (!token.trim().is_empty()).then(|| Zeroizing::new(token)),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    /// The bearer token, or `Unauthenticated` when absent or past its `exp`.
    pub fn bearer(&self) -> Result<&str, JournalError> {
        let token = self
            .token
            .as_deref()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .ok_or(JournalError::Unauthenticated)?;
        if let Some(exp) = token_expiry(token) {
            if exp <= chrono::Utc::now().timestamp() {
                return Err(JournalError::Unauthenticated);
            }
        }
        Ok(token)
    }
}

/// The `exp` claim of a JWT. Opaque tokens have none.
fn token_expiry(token: &str) -> Option<i64> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD.decode(parts[1]).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims["exp"].as_i64()
}

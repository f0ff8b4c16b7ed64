use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::api::{Account, JournalApi, FORGOT_PASSWORD_NOTICE};
use crate::error::JournalError;
use crate::model::{Entry, EntryFields, EntryId, EntryPatch};

/// In-memory backend: server-assigned ids, newest entries first, call counters,
/// injectable failures and per-method gates that hold a call until released.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
    gates: Mutex<HashMap<&'static str, Arc<Semaphore>>>,
}

#[derive(Default)]
struct FakeState {
    entries: Vec<Entry>,
    next_id: EntryId,
    users: HashMap<String, String>,
    premium: bool,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, JournalError>,
}

pub const TOKEN: &str = "test-token";
/// Also accepted, for a session started from another process.
pub const OTHER_TOKEN: &str = "other-token";

impl FakeApi {
    pub fn new() -> Arc<Self> {
        let api = Self::default();
        api.state.lock().unwrap().next_id = 1;
        Arc::new(api)
    }

    pub fn with_entries(count: usize) -> Arc<Self> {
        let api = Self::new();
        for i in 0..count {
            api.seed(&format!("title {}", i + 1), &format!("content {}", i + 1), None);
        }
        api
    }

    pub fn seed(&self, title: &str, content: &str, feedback: Option<&str>) -> EntryId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + ChronoDuration::minutes(id);
        state.entries.insert(
            0,
            Entry {
                id,
                title: title.to_string(),
                content: content.to_string(),
                created_at,
                feedback: feedback.map(str::to_string),
            },
        );
        id
    }

    pub fn add_user(&self, email: &str, password: &str) {
        self.state
            .lock()
            .unwrap()
            .users
            .insert(email.to_string(), password.to_string());
    }

    pub fn set_premium(&self, premium: bool) {
        self.state.lock().unwrap().premium = premium;
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    pub fn fail_next(&self, method: &'static str, err: JournalError) {
        self.state.lock().unwrap().failures.insert(method, err);
    }

    pub fn ids(&self) -> Vec<EntryId> {
        self.state.lock().unwrap().entries.iter().map(|e| e.id).collect()
    }

    /// Holds every later call to `method` until `release` is called.
    pub fn hold(&self, method: &'static str) {
        self.gates
            .lock()
            .unwrap()
            .insert(method, Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, method: &'static str) {
        if let Some(gate) = self.gates.lock().unwrap().remove(method) {
            gate.close();
        }
    }

    async fn enter(&self, method: &'static str) -> Result<(), JournalError> {
        let gate = self.gates.lock().unwrap().get(method).cloned();
        if let Some(gate) = gate {
            // A closed semaphore means the gate was released.
            let _ = gate.acquire().await;
        }
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(method).or_insert(0) += 1;
        match state.failures.remove(method) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_bearer(bearer: &str) -> Result<(), JournalError> {
        if bearer == TOKEN || bearer == OTHER_TOKEN {
            Ok(())
        } else {
            Err(JournalError::Unauthenticated)
        }
    }
}

#[async_trait]
impl JournalApi for FakeApi {
    async fn login(&self, username: &str, password: &str) -> Result<String, JournalError> {
        self.enter("login").await?;
        let state = self.state.lock().unwrap();
        match state.users.get(username) {
            Some(p) if p == password => Ok(TOKEN.to_string()),
            _ => Err(JournalError::RequestRejected {
                status: 401,
                detail: "Invalid credentials".to_string(),
            }),
        }
    }

    async fn register(&self, email: &str, password: &str) -> Result<(), JournalError> {
        self.enter("register").await?;
        let mut state = self.state.lock().unwrap();
        if state.users.contains_key(email) {
            return Err(JournalError::RequestRejected {
                status: 400,
                detail: "Email already registered".to_string(),
            });
        }
        state.users.insert(email.to_string(), password.to_string());
        Ok(())
    }

    async fn forgot_password(&self, _email: &str) -> Result<String, JournalError> {
        self.enter("forgot_password").await?;
        Ok(FORGOT_PASSWORD_NOTICE.to_string())
    }

    async fn reset_password(&self, token: &str, _new_password: &str) -> Result<(), JournalError> {
        self.enter("reset_password").await?;
        if token.is_empty() {
            return Err(JournalError::RequestRejected {
                status: 400,
                detail: "Invalid or expired token".to_string(),
            });
        }
        Ok(())
    }

    async fn account(&self, bearer: &str) -> Result<Account, JournalError> {
        self.enter("account").await?;
        Self::check_bearer(bearer)?;
        let state = self.state.lock().unwrap();
        Ok(Account {
            email: "writer@example.com".to_string(),
            is_premium: state.premium,
            feedback_count: 0,
        })
    }

    async fn list_entries(
        &self,
        bearer: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<Entry>, JournalError> {
        self.enter("list").await?;
        Self::check_bearer(bearer)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .skip(skip as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn create_entry(
        &self,
        bearer: &str,
        fields: &EntryFields,
    ) -> Result<Entry, JournalError> {
        self.enter("create").await?;
        Self::check_bearer(bearer)?;
        let id = self.seed(&fields.title, &fields.content, None);
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(JournalError::NotFound)
    }

    async fn update_entry(
        &self,
        bearer: &str,
        id: EntryId,
        fields: &EntryFields,
    ) -> Result<EntryPatch, JournalError> {
        self.enter("update").await?;
        Self::check_bearer(bearer)?;
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(JournalError::NotFound)?;
        entry.title = fields.title.clone();
        entry.content = fields.content.clone();
        Ok(EntryPatch {
            title: Some(entry.title.clone()),
            content: Some(entry.content.clone()),
            feedback: entry.feedback.clone(),
        })
    }

    async fn delete_entry(&self, bearer: &str, id: EntryId) -> Result<(), JournalError> {
        self.enter("delete").await?;
        Self::check_bearer(bearer)?;
        let mut state = self.state.lock().unwrap();
        let before = state.entries.len();
        state.entries.retain(|e| e.id != id);
        if state.entries.len() == before {
            return Err(JournalError::NotFound);
        }
        Ok(())
    }

    async fn request_feedback(&self, bearer: &str, id: EntryId) -> Result<String, JournalError> {
        self.enter("feedback").await?;
        Self::check_bearer(bearer)?;
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(JournalError::NotFound)?;
        let text = entry
            .feedback
            .get_or_insert_with(|| format!("Reflection on {}", id))
            .clone();
        Ok(text)
    }
}

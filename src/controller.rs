use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use zeroize::Zeroizing;

use crate::api::{Account, JournalApi};
use crate::config::AppConfig;
use crate::error::JournalError;
use crate::model::{EditDraft, Entry, EntryId, EntryPatch, EntryView, LoadingState, Page};
use crate::paywall::PaywallGate;
use crate::repository::{validate_fields, EntryRepository};
use crate::reveal::{FeedbackRevealer, RevealEvent};
use crate::session::SessionStore;

pub const SESSION_EXPIRED: &str = "Session expired. Please log in again.";
pub const PASSWORD_RESET_NOTICE: &str = "Password has been reset. You can log in now.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    LoggedOut,
    LoginPending,
    LoggedIn,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub page_size: u32,
    pub reveal_step: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            page_size: config.general.page_size(),
            reveal_step: config.general.reveal_step(),
        }
    }
}

/// The new-entry form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryForm {
    pub title: String,
    pub content: String,
}

/// Results of spawned operations, tagged with the epoch they were started in.
#[derive(Debug)]
pub enum Completion {
    LoggedIn(Result<String, JournalError>),
    Notice(Result<String, JournalError>),
    Account {
        session: u64,
        result: Result<Account, JournalError>,
    },
    PageLoaded {
        session: u64,
        view: u64,
        result: Result<Page, JournalError>,
    },
    Created {
        session: u64,
        result: Result<Entry, JournalError>,
    },
    Updated {
        session: u64,
        id: EntryId,
        result: Result<EntryPatch, JournalError>,
    },
    Deleted {
        session: u64,
        id: EntryId,
        result: Result<(), JournalError>,
    },
    Feedback {
        session: u64,
        id: EntryId,
        result: Result<String, JournalError>,
    },
}

#[derive(Debug)]
pub enum ControllerEvent {
    Completed(Completion),
    Reveal(RevealEvent),
    SessionChanged(Option<String>),
}

/// Owns the displayed page and every piece of per-entry UI state.
///
/// Operations never block: each one flips its loading flag, spawns the network
/// call and returns. Results come back through `next_event` and are folded in by
/// `handle`. Only this type writes the entry collection.
pub struct JournalController<A: JournalApi> {
    repo: EntryRepository<A>,
    session: SessionStore,
    session_rx: watch::Receiver<Option<String>>,
    current_token: Option<String>,
    settings: ControllerSettings,

    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    revealer: FeedbackRevealer,
    reveal_rx: mpsc::UnboundedReceiver<RevealEvent>,
    in_flight: usize,

    auth: AuthState,
    account: Option<Account>,
    session_epoch: u64,
    view_epoch: u64,

    entries: Vec<EntryView>,
    page: u32,
    has_more: bool,
    page_loading: bool,

    compose: EntryForm,
    creating: bool,
    draft: Option<EditDraft>,
    loading: HashMap<EntryId, LoadingState>,
    pending_delete: Option<EntryId>,

    error: Option<String>,
    notice: Option<String>,
    paywall: PaywallGate,
}

impl<A: JournalApi> JournalController<A> {
    pub fn new(
        api: Arc<A>,
        session: SessionStore,
        settings: ControllerSettings,
        paywall: PaywallGate,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (revealer, reveal_rx) = FeedbackRevealer::new(settings.reveal_step);
        let mut session_rx = session.subscribe();
        let current_token = session_rx.borrow_and_update().clone();
        let auth = if current_token.is_some() {
            AuthState::LoggedIn
        } else {
            AuthState::LoggedOut
        };

        Self {
            repo: EntryRepository::new(api),
            session,
            session_rx,
            current_token,
            settings,
            completions_tx,
            completions_rx,
            revealer,
            reveal_rx,
            in_flight: 0,
            auth,
            account: None,
            session_epoch: 1,
            view_epoch: 0,
            entries: Vec::new(),
            page: 1,
            has_more: false,
            page_loading: false,
            compose: EntryForm::default(),
            creating: false,
            draft: None,
            loading: HashMap::new(),
            pending_delete: None,
            error: None,
            notice: None,
            paywall,
        }
    }

    /// Loads the first page when a stored session exists.
    pub fn start(&mut self) {
        if self.auth == AuthState::LoggedIn {
            self.request_page(1);
            self.fetch_account();
        }
    }

    // --- Read access ---

    pub fn auth(&self) -> AuthState {
        self.auth
    }

    pub fn account(&self) -> Option<&Account> {
        self.account.as_ref()
    }

    pub fn entries(&self) -> &[EntryView] {
        &self.entries
    }

    pub fn entry(&self, id: EntryId) -> Option<&EntryView> {
        self.entries.iter().find(|e| e.id() == id)
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_page_loading(&self) -> bool {
        self.page_loading
    }

    pub fn can_go_prev(&self) -> bool {
        self.auth == AuthState::LoggedIn && !self.page_loading && self.page > 1
    }

    pub fn can_go_next(&self) -> bool {
        self.auth == AuthState::LoggedIn && !self.page_loading && self.has_more
    }

    pub fn compose(&self) -> &EntryForm {
        &self.compose
    }

    pub fn is_creating(&self) -> bool {
        self.creating
    }

    pub fn draft(&self) -> Option<&EditDraft> {
        self.draft.as_ref()
    }

    pub fn loading(&self, id: EntryId) -> LoadingState {
        self.loading.get(&id).copied().unwrap_or_default()
    }

    pub fn pending_delete(&self) -> Option<EntryId> {
        self.pending_delete
    }

    pub fn can_request_feedback(&self, id: EntryId) -> bool {
        self.entry(id).is_some_and(|e| !e.has_feedback) && !self.loading(id).feedback
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn paywall(&self) -> &PaywallGate {
        &self.paywall
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_revealing(&self) -> bool {
        self.revealer.active_count() > 0
    }

    // --- Authentication ---

    pub fn login(&mut self, email: &str, password: &str) -> Result<(), JournalError> {
        if self.auth != AuthState::LoggedOut {
            return Err(JournalError::validation("Already logged in"));
        }
        let email = email.trim().to_string();
        if email.is_empty() || password.is_empty() {
            return Err(self.reject(JournalError::validation(
                "Please enter your email and password.",
            )));
        }
        let password = Zeroizing::new(password.to_string());
        self.auth = AuthState::LoginPending;
        let api = Arc::clone(self.repo.api());
        tracing::info!("controller: login requested");
        self.spawn(async move { Completion::LoggedIn(api.login(&email, &password).await) });
        Ok(())
    }

    /// Registers, then logs in with a second call; registration returns no token.
    pub fn register(
        &mut self,
        email: &str,
        password: &str,
        confirm: &str,
    ) -> Result<(), JournalError> {
        if self.auth != AuthState::LoggedOut {
            return Err(JournalError::validation("Already logged in"));
        }
        let email = email.trim().to_string();
        if email.is_empty() || password.is_empty() {
            return Err(self.reject(JournalError::validation(
                "Please enter your email and password.",
            )));
        }
        if password != confirm {
            return Err(self.reject(JournalError::validation("Passwords do not match")));
        }
        let password = Zeroizing::new(password.to_string());
        self.auth = AuthState::LoginPending;
        let api = Arc::clone(self.repo.api());
        tracing::info!("controller: registration requested");
        self.spawn(async move {
            let result = match api.register(&email, &password).await {
                Ok(()) => api.login(&email, &password).await,
                Err(e) => Err(e),
            };
            Completion::LoggedIn(result)
        });
        Ok(())
    }

    pub fn forgot_password(&mut self, email: &str) -> Result<(), JournalError> {
        let email = email.trim().to_string();
        if email.is_empty() {
            return Err(self.reject(JournalError::validation("Please enter your email.")));
        }
        let api = Arc::clone(self.repo.api());
        self.spawn(async move { Completion::Notice(api.forgot_password(&email).await) });
        Ok(())
    }

    pub fn reset_password(
        &mut self,
        token: &str,
        password: &str,
        confirm: &str,
    ) -> Result<(), JournalError> {
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(self.reject(JournalError::validation("Missing reset token.")));
        }
        if password.is_empty() {
            return Err(self.reject(JournalError::validation("Please enter a new password.")));
        }
        if password != confirm {
            return Err(self.reject(JournalError::validation("Passwords do not match")));
        }
        let password = Zeroizing::new(password.to_string());
        let api = Arc::clone(self.repo.api());
        self.spawn(async move {
            let result = api
                .reset_password(&token, &password)
                .await
                .map(|()| PASSWORD_RESET_NOTICE.to_string());
            Completion::Notice(result)
        });
        Ok(())
    }

    pub fn logout(&mut self) {
        if let Err(e) = self.session.clear() {
            tracing::warn!("controller: failed to clear session: {}", e);
            self.error = Some(e.message());
        }
        self.enter_logged_out();
        tracing::info!("controller: logged out");
    }

    // --- Pages ---

    pub fn reload(&mut self) -> Result<(), JournalError> {
        self.ensure_logged_in()?;
        self.request_page(self.page);
        Ok(())
    }

    pub fn next_page(&mut self) -> Result<(), JournalError> {
        if !self.can_go_next() {
            return Err(JournalError::validation("No next page"));
        }
        self.request_page(self.page + 1);
        Ok(())
    }

    pub fn prev_page(&mut self) -> Result<(), JournalError> {
        if !self.can_go_prev() {
            return Err(JournalError::validation("Already on the first page"));
        }
        self.request_page(self.page - 1);
        Ok(())
    }

    fn request_page(&mut self, page: u32) {
        let page = page.max(1);
        self.view_epoch += 1;
        self.page_loading = true;

        let repo = self.repo.clone();
        let ctx = self.session.context();
        let limit = self.settings.page_size;
        let (session, view) = (self.session_epoch, self.view_epoch);
        tracing::debug!("controller: loading page {}", page);
        self.spawn(async move {
            let result = repo.list(&ctx, page, limit).await;
            Completion::PageLoaded {
                session,
                view,
                result,
            }
        });
    }

    fn fetch_account(&mut self) {
        let api = Arc::clone(self.repo.api());
        let ctx = self.session.context();
        let session = self.session_epoch;
        self.spawn(async move {
            let result = match ctx.bearer() {
                Ok(bearer) => api.account(bearer).await,
                Err(e) => Err(e),
            };
            Completion::Account { session, result }
        });
    }

    // --- New entries ---

    pub fn set_compose(&mut self, title: &str, content: &str) {
        self.compose.title = title.to_string();
        self.compose.content = content.to_string();
    }

    pub fn add_entry(&mut self) -> Result<(), JournalError> {
        self.ensure_logged_in()?;
        if self.creating {
            return Err(JournalError::validation("Already saving"));
        }
        if let Err(e) = validate_fields(&self.compose.title, &self.compose.content) {
            return Err(self.reject(e));
        }
        self.creating = true;
        let repo = self.repo.clone();
        let ctx = self.session.context();
        let form = self.compose.clone();
        let session = self.session_epoch;
        self.spawn(async move {
            let result = repo.create(&ctx, &form.title, &form.content).await;
            Completion::Created { session, result }
        });
        Ok(())
    }

    // --- Editing ---

    /// Opens the single edit draft. Any unsaved previous draft is discarded.
    pub fn begin_edit(&mut self, id: EntryId) -> Result<(), JournalError> {
        let entry = self.entry(id).ok_or(JournalError::NotFound)?;
        self.draft = Some(EditDraft {
            id,
            title: entry.entry.title.clone(),
            content: entry.entry.content.clone(),
        });
        Ok(())
    }

    pub fn update_draft(&mut self, title: &str, content: &str) {
        if let Some(draft) = &mut self.draft {
            draft.title = title.to_string();
            draft.content = content.to_string();
        }
    }

    pub fn cancel_edit(&mut self) {
        self.draft = None;
    }

    pub fn save_edit(&mut self) -> Result<(), JournalError> {
        self.ensure_logged_in()?;
        let draft = self
            .draft
            .clone()
            .ok_or_else(|| JournalError::validation("Nothing to save"))?;
        if self.loading(draft.id).edit {
            return Err(JournalError::validation("Already saving"));
        }
        if let Err(e) = validate_fields(&draft.title, &draft.content) {
            return Err(self.reject(e));
        }
        self.loading.entry(draft.id).or_default().edit = true;

        let repo = self.repo.clone();
        let ctx = self.session.context();
        let session = self.session_epoch;
        self.spawn(async move {
            let result = repo
                .update(&ctx, draft.id, &draft.title, &draft.content)
                .await;
            Completion::Updated {
                session,
                id: draft.id,
                result,
            }
        });
        Ok(())
    }

    // --- Deleting ---

    /// First phase: marks the target and waits for confirmation.
    pub fn request_delete(&mut self, id: EntryId) -> Result<(), JournalError> {
        if self.entry(id).is_none() {
            return Err(JournalError::NotFound);
        }
        if self.loading(id).delete {
            return Err(JournalError::validation("Delete already in progress"));
        }
        self.pending_delete = Some(id);
        Ok(())
    }

    pub fn cancel_delete(&mut self) {
        self.pending_delete = None;
    }

    pub fn confirm_delete(&mut self) -> Result<(), JournalError> {
        self.ensure_logged_in()?;
        let id = self
            .pending_delete
            .take()
            .ok_or_else(|| JournalError::validation("Nothing to delete"))?;
        if self.loading(id).delete {
            return Err(JournalError::validation("Delete already in progress"));
        }
        self.loading.entry(id).or_default().delete = true;

        let repo = self.repo.clone();
        let ctx = self.session.context();
        let session = self.session_epoch;
        self.spawn(async move {
            let result = repo.delete(&ctx, id).await;
            Completion::Deleted {
                session,
                id,
                result,
            }
        });
        Ok(())
    }

    // --- Feedback ---

    pub fn request_feedback(&mut self, id: EntryId) -> Result<(), JournalError> {
        self.ensure_logged_in()?;
        let entry = self.entry(id).ok_or(JournalError::NotFound)?;
        if entry.has_feedback {
            return Err(JournalError::validation(
                "Feedback has already been generated for this entry",
            ));
        }
        if self.loading(id).feedback {
            return Err(JournalError::validation("Feedback is already on its way"));
        }
        self.loading.entry(id).or_default().feedback = true;

        let repo = self.repo.clone();
        let ctx = self.session.context();
        let session = self.session_epoch;
        tracing::info!("controller: feedback requested for entry {}", id);
        self.spawn(async move {
            let result = repo.request_feedback(&ctx, id).await;
            Completion::Feedback {
                session,
                id,
                result,
            }
        });
        Ok(())
    }

    pub fn toggle_expanded(&mut self, id: EntryId) {
        if let Some(view) = self.entry_mut(id) {
            view.is_expanded = !view.is_expanded;
        }
    }

    pub fn show_paywall(&mut self) {
        self.paywall.show();
    }

    pub fn dismiss_paywall(&mut self) {
        self.paywall.dismiss();
    }

    // --- Event loop ---

    pub async fn next_event(&mut self) -> ControllerEvent {
        tokio::select! {
            Some(completion) = self.completions_rx.recv() => ControllerEvent::Completed(completion),
            Some(event) = self.reveal_rx.recv() => ControllerEvent::Reveal(event),
            Ok(()) = self.session_rx.changed() => {
                ControllerEvent::SessionChanged(self.session_rx.borrow_and_update().clone())
            }
            else => std::future::pending::<ControllerEvent>().await,
        }
    }

    /// Waits for one event and applies it.
    pub async fn pump(&mut self) {
        let event = self.next_event().await;
        self.handle(event);
    }

    pub fn handle(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Completed(completion) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.on_completion(completion);
            }
            ControllerEvent::Reveal(event) => self.on_reveal(event),
            ControllerEvent::SessionChanged(token) => self.on_session_changed(token),
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::LoggedIn(result) => self.on_logged_in(result),
            Completion::Notice(result) => match result {
                Ok(message) => self.succeed(Some(message)),
                Err(e) => self.fail(e),
            },
            Completion::Account { session, result } => {
                if session != self.session_epoch {
                    return;
                }
                match result {
                    Ok(account) => {
                        self.paywall.on_account(account.is_premium);
                        self.account = Some(account);
                    }
                    Err(JournalError::Unauthenticated) => self.expire_session(),
                    Err(e) => tracing::warn!("controller: account lookup failed: {}", e),
                }
            }
            Completion::PageLoaded {
                session,
                view,
                result,
            } => {
                if session != self.session_epoch || view != self.view_epoch {
                    tracing::debug!("controller: dropping stale page result");
                    return;
                }
                self.page_loading = false;
                match result {
                    Ok(page) => {
                        self.apply_page(page);
                        self.error = None;
                    }
                    Err(e) => self.fail(e),
                }
            }
            Completion::Created { session, result } => {
                if session != self.session_epoch {
                    return;
                }
                self.creating = false;
                match result {
                    Ok(entry) => {
                        tracing::info!("controller: entry {} created", entry.id);
                        self.compose = EntryForm::default();
                        self.succeed(Some("Entry saved.".to_string()));
                        // The refetch is the only source of the new record.
                        self.request_page(1);
                    }
                    Err(e) => self.fail(e),
                }
            }
            Completion::Updated {
                session,
                id,
                result,
            } => {
                if session != self.session_epoch {
                    return;
                }
                if let Some(state) = self.loading.get_mut(&id) {
                    state.edit = false;
                }
                match result {
                    Ok(patch) => {
                        if let Some(view) = self.entry_mut(id) {
                            view.apply_patch(patch);
                        }
                        if self.draft.as_ref().is_some_and(|d| d.id == id) {
                            self.draft = None;
                        }
                        self.succeed(Some("Entry updated.".to_string()));
                    }
                    Err(e) => self.fail(e),
                }
            }
            Completion::Deleted {
                session,
                id,
                result,
            } => {
                if session != self.session_epoch {
                    return;
                }
                match result {
                    Ok(()) => {
                        self.entries.retain(|e| e.id() != id);
                        self.loading.remove(&id);
                        self.revealer.cancel(id);
                        if self.draft.as_ref().is_some_and(|d| d.id == id) {
                            self.draft = None;
                        }
                        if self.pending_delete == Some(id) {
                            self.pending_delete = None;
                        }
                        self.succeed(Some("Entry deleted.".to_string()));
                    }
                    Err(e) => {
                        if let Some(state) = self.loading.get_mut(&id) {
                            state.delete = false;
                        }
                        self.fail(e);
                    }
                }
            }
            Completion::Feedback {
                session,
                id,
                result,
            } => {
                if session != self.session_epoch {
                    return;
                }
                if let Some(state) = self.loading.get_mut(&id) {
                    state.feedback = false;
                }
                match result {
                    Ok(text) => {
                        self.succeed(None);
                        let Some(view) = self.entry_mut(id) else {
                            tracing::debug!("controller: feedback for entry {} no longer shown", id);
                            return;
                        };
                        if view.begin_feedback(text.clone()) {
                            self.revealer.start(id, &text);
                        }
                    }
                    Err(e) => {
                        self.paywall.on_feedback_error(&e);
                        self.fail(e);
                    }
                }
            }
        }
    }

    fn on_logged_in(&mut self, result: Result<String, JournalError>) {
        if self.auth != AuthState::LoginPending {
            return;
        }
        let token = match result {
            Ok(token) => token,
            Err(e) => {
                self.auth = AuthState::LoggedOut;
                self.fail(e);
                return;
            }
        };
        if let Err(e) = self.session.set(&token) {
            self.auth = AuthState::LoggedOut;
            self.fail(e);
            return;
        }
        tracing::info!("controller: logged in");
        self.enter_logged_in(Some(token));
        self.succeed(None);
    }

    fn on_reveal(&mut self, event: RevealEvent) {
        if !self.revealer.accepts(&event) {
            return;
        }
        match event {
            RevealEvent::Progress { id, shown, .. } => match self.entry_mut(id) {
                Some(view) => view.reveal_to(shown),
                None => {
                    self.revealer.cancel(id);
                }
            },
            RevealEvent::Done { id, generation } => {
                if let Some(view) = self.entry_mut(id) {
                    view.finish_reveal();
                }
                self.revealer.complete(id, generation);
            }
        }
    }

    fn on_session_changed(&mut self, token: Option<String>) {
        if token == self.current_token {
            return;
        }
        match token {
            None => {
                tracing::info!("controller: session ended elsewhere");
                self.enter_logged_out();
            }
            Some(token) => {
                tracing::info!("controller: session replaced elsewhere");
                self.enter_logged_out();
                self.enter_logged_in(Some(token));
            }
        }
    }

    fn apply_page(&mut self, page: Page) {
        let same_page = page.number == self.page;
        if !same_page {
            // Edits and reveals do not survive navigation.
            self.draft = None;
            self.pending_delete = None;
            self.stop_all_reveals();
        }
        let mut previous: HashMap<EntryId, EntryView> =
            self.entries.drain(..).map(|v| (v.id(), v)).collect();

        self.entries = page
            .entries
            .into_iter()
            .map(|entry| match previous.remove(&entry.id) {
                Some(mut view) => {
                    view.refresh(entry);
                    if !same_page {
                        view.is_expanded = false;
                    }
                    view
                }
                None => EntryView::new(entry),
            })
            .collect();

        let shown: HashSet<EntryId> = self.entries.iter().map(|v| v.id()).collect();
        self.revealer.retain(|id| shown.contains(&id));
        for view in &mut self.entries {
            if view.is_typing && !self.revealer.is_active(view.id()) {
                view.finish_reveal();
            }
        }
        if self.draft.as_ref().is_some_and(|d| !shown.contains(&d.id)) {
            self.draft = None;
        }
        if self.pending_delete.is_some_and(|id| !shown.contains(&id)) {
            self.pending_delete = None;
        }
        self.loading
            .retain(|id, state| shown.contains(id) || !state.is_idle());

        self.page = page.number;
        self.has_more = page.has_more;
        tracing::debug!(
            "controller: showing page {} ({} entries, more: {})",
            self.page,
            self.entries.len(),
            self.has_more
        );
    }

    // --- Helpers ---

    fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        self.in_flight += 1;
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(fut.await);
        });
    }

    fn entry_mut(&mut self, id: EntryId) -> Option<&mut EntryView> {
        self.entries.iter_mut().find(|e| e.id() == id)
    }

    fn ensure_logged_in(&self) -> Result<(), JournalError> {
        if self.auth == AuthState::LoggedIn {
            Ok(())
        } else {
            Err(JournalError::Unauthenticated)
        }
    }

    /// Records a client-side validation failure.
    fn reject(&mut self, err: JournalError) -> JournalError {
        self.error = Some(err.message());
        self.notice = None;
        err
    }

    fn succeed(&mut self, notice: Option<String>) {
        self.error = None;
        if notice.is_some() {
            self.notice = notice;
        }
    }

    fn fail(&mut self, err: JournalError) {
        tracing::warn!("controller: operation failed: {}", err);
        if err == JournalError::Unauthenticated && self.auth == AuthState::LoggedIn {
            self.expire_session();
            return;
        }
        self.error = Some(err.message());
        self.notice = None;
    }

    fn expire_session(&mut self) {
        if let Err(e) = self.session.clear() {
            tracing::warn!("controller: failed to clear session: {}", e);
        }
        self.enter_logged_out();
        self.error = Some(SESSION_EXPIRED.to_string());
    }

    fn stop_all_reveals(&mut self) {
        self.revealer.cancel_all();
        for view in &mut self.entries {
            if view.is_typing {
                view.finish_reveal();
            }
        }
    }

    fn enter_logged_out(&mut self) {
        self.current_token = None;
        self.auth = AuthState::LoggedOut;
        self.account = None;
        self.session_epoch += 1;
        self.view_epoch += 1;
        self.revealer.cancel_all();
        self.entries.clear();
        self.page = 1;
        self.has_more = false;
        self.page_loading = false;
        self.compose = EntryForm::default();
        self.creating = false;
        self.draft = None;
        self.loading.clear();
        self.pending_delete = None;
        self.notice = None;
        self.paywall.dismiss();
    }

    fn enter_logged_in(&mut self, token: Option<String>) {
        self.current_token = token;
        self.auth = AuthState::LoggedIn;
        self.session_epoch += 1;
        self.page = 1;
        self.request_page(1);
        self.fetch_account();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeApi, OTHER_TOKEN, TOKEN};
    use tempfile::TempDir;
    use tokio::time;

    fn settings() -> ControllerSettings {
        ControllerSettings {
            page_size: 5,
            reveal_step: Duration::from_millis(10),
        }
    }

    fn controller(api: &Arc<FakeApi>, dir: &TempDir) -> JournalController<FakeApi> {
        let store = SessionStore::open(dir.path());
        JournalController::new(Arc::clone(api), store, settings(), PaywallGate::default())
    }

    async fn settle(ctl: &mut JournalController<FakeApi>) {
        time::timeout(Duration::from_secs(60), async {
            while ctl.in_flight() > 0 {
                ctl.pump().await;
            }
        })
        .await
        .expect("operations did not settle");
    }

    async fn finish_reveals(ctl: &mut JournalController<FakeApi>) {
        time::timeout(Duration::from_secs(60), async {
            while ctl.in_flight() > 0 || ctl.is_revealing() {
                ctl.pump().await;
            }
        })
        .await
        .expect("reveals did not finish");
    }

    async fn logged_in(api: &Arc<FakeApi>) -> (JournalController<FakeApi>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        SessionStore::open(dir.path()).set(TOKEN).unwrap();
        let mut ctl = controller(api, &dir);
        ctl.start();
        settle(&mut ctl).await;
        (ctl, dir)
    }

    fn ids(ctl: &JournalController<FakeApi>) -> Vec<EntryId> {
        ctl.entries().iter().map(|e| e.id()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn login_then_add_entry_refetches_page_one() {
        let api = FakeApi::with_entries(7);
        api.add_user("writer@example.com", "hunter2");
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(&api, &dir);
        assert_eq!(ctl.auth(), AuthState::LoggedOut);

        ctl.login("writer@example.com", "hunter2").unwrap();
        assert_eq!(ctl.auth(), AuthState::LoginPending);
        settle(&mut ctl).await;

        assert_eq!(ctl.auth(), AuthState::LoggedIn);
        assert_eq!(SessionStore::open(dir.path()).get().as_deref(), Some(TOKEN));
        assert_eq!(ctl.entries().len(), 5);
        assert!(ctl.has_more());

        ctl.next_page().unwrap();
        settle(&mut ctl).await;
        assert_eq!(ctl.page(), 2);
        let seen: Vec<EntryId> = api.ids();

        ctl.set_compose("T", "C");
        ctl.add_entry().unwrap();
        let lists_before = api.calls("list");
        settle(&mut ctl).await;

        assert_eq!(api.calls("list"), lists_before + 1);
        assert_eq!(ctl.page(), 1);
        assert_eq!(ctl.compose(), &EntryForm::default());
        let created = ctl
            .entries()
            .iter()
            .find(|e| e.entry.title == "T" && e.entry.content == "C")
            .expect("new entry shown after refetch");
        assert!(!seen.contains(&created.id()));
        assert!(ctl.error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_create_keeps_the_form_and_shows_detail() {
        let api = FakeApi::with_entries(1);
        let (mut ctl, _dir) = logged_in(&api).await;

        ctl.set_compose("", "content");
        assert!(matches!(
            ctl.add_entry(),
            Err(JournalError::ValidationFailed(_))
        ));
        assert_eq!(ctl.error(), Some("Please fill out both title and content."));
        assert_eq!(api.calls("create"), 0);

        ctl.set_compose("Title", "content");
        api.fail_next(
            "create",
            JournalError::RequestRejected {
                status: 422,
                detail: "Content too long".to_string(),
            },
        );
        ctl.add_entry().unwrap();
        settle(&mut ctl).await;

        assert_eq!(ctl.error(), Some("Content too long"));
        assert_eq!(ctl.compose().title, "Title");
        assert_eq!(ctl.compose().content, "content");
        assert!(!ctl.is_creating());
    }

    #[tokio::test(start_paused = true)]
    async fn feedback_reveals_progressively_and_only_once() {
        let api = FakeApi::with_entries(2);
        let (mut ctl, _dir) = logged_in(&api).await;
        let id = ids(&ctl)[0];

        ctl.request_feedback(id).unwrap();
        assert!(ctl.loading(id).feedback);
        assert!(ctl.request_feedback(id).is_err());
        settle(&mut ctl).await;

        let full = format!("Reflection on {}", id);
        let view = ctl.entry(id).unwrap();
        assert!(view.has_feedback);
        assert!(view.is_typing);
        assert!(view.is_expanded);

        let mut last = ctl.entry(id).unwrap().displayed_feedback().chars().count();
        while ctl.is_revealing() {
            ctl.pump().await;
            let view = ctl.entry(id).unwrap();
            let shown = view.displayed_feedback().chars().count();
            assert!(shown >= last);
            assert!(full.starts_with(view.displayed_feedback()));
            assert_eq!(view.is_typing, shown < full.chars().count() || ctl.is_revealing());
            last = shown;
        }
        let view = ctl.entry(id).unwrap();
        assert!(!view.is_typing);
        assert_eq!(view.displayed_feedback(), full);

        let calls = api.calls("feedback");
        let err = ctl.request_feedback(id).unwrap_err();
        assert!(matches!(err, JournalError::ValidationFailed(_)));
        assert_eq!(api.calls("feedback"), calls);
        assert!(ctl.error().is_none());
        assert!(!ctl.can_request_feedback(id));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reveals_are_keyed_by_id() {
        let api = FakeApi::with_entries(3);
        let (mut ctl, _dir) = logged_in(&api).await;
        let shown = ids(&ctl);

        ctl.request_feedback(shown[0]).unwrap();
        ctl.request_feedback(shown[2]).unwrap();
        settle(&mut ctl).await;
        assert!(ctl.entry(shown[0]).unwrap().is_typing);
        assert!(ctl.entry(shown[2]).unwrap().is_typing);

        // Shrink the collection mid-reveal.
        ctl.request_delete(shown[1]).unwrap();
        ctl.confirm_delete().unwrap();
        finish_reveals(&mut ctl).await;

        for id in [shown[0], shown[2]] {
            let view = ctl.entry(id).unwrap();
            assert_eq!(view.displayed_feedback(), format!("Reflection on {}", id));
            assert!(!view.is_typing);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delete_needs_confirmation_and_removes_only_its_target() {
        let api = FakeApi::with_entries(4);
        api.seed("with feedback", "body", Some("Lovely"));
        let (mut ctl, _dir) = logged_in(&api).await;
        let shown = ids(&ctl);
        let keep_expanded = shown[0];
        let target = shown[2];
        ctl.toggle_expanded(keep_expanded);

        ctl.request_delete(target).unwrap();
        assert_eq!(ctl.pending_delete(), Some(target));
        ctl.cancel_delete();
        assert!(ctl.confirm_delete().is_err());
        assert_eq!(api.calls("delete"), 0);

        let before: Vec<EntryView> = ctl
            .entries()
            .iter()
            .filter(|e| e.id() != target)
            .cloned()
            .collect();

        ctl.request_delete(target).unwrap();
        ctl.confirm_delete().unwrap();
        assert!(ctl.loading(target).delete);
        assert!(ctl.request_delete(target).is_err());
        settle(&mut ctl).await;

        assert_eq!(api.calls("delete"), 1);
        assert!(ctl.entry(target).is_none());
        assert_eq!(ctl.entries(), before.as_slice());
        assert!(ctl.entry(keep_expanded).unwrap().is_expanded);
        assert_eq!(ctl.loading(target), LoadingState::default());
        assert_eq!(ctl.notice(), Some("Entry deleted."));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delete_keeps_the_entry() {
        let api = FakeApi::with_entries(2);
        let (mut ctl, _dir) = logged_in(&api).await;
        let target = ids(&ctl)[0];

        api.fail_next("delete", JournalError::Unreachable("timed out".into()));
        ctl.request_delete(target).unwrap();
        ctl.confirm_delete().unwrap();
        settle(&mut ctl).await;

        assert!(ctl.entry(target).is_some());
        assert!(!ctl.loading(target).delete);
        assert_eq!(api.calls("delete"), 1);
        assert!(ctl.error().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn pagination_controls_follow_page_fullness() {
        let api = FakeApi::with_entries(8);
        let (mut ctl, _dir) = logged_in(&api).await;

        assert_eq!(ctl.page(), 1);
        assert!(ctl.has_more());
        assert!(!ctl.can_go_prev());
        assert!(ctl.can_go_next());
        assert!(ctl.prev_page().is_err());

        let first = ids(&ctl)[0];
        ctl.begin_edit(first).unwrap();
        ctl.next_page().unwrap();
        assert!(!ctl.can_go_next());
        settle(&mut ctl).await;
        assert!(ctl.draft().is_none());

        assert_eq!(ctl.page(), 2);
        assert_eq!(ctl.entries().len(), 3);
        assert!(!ctl.has_more());
        assert!(!ctl.can_go_next());
        assert!(ctl.can_go_prev());
        assert!(ctl.next_page().is_err());

        ctl.prev_page().unwrap();
        settle(&mut ctl).await;
        assert_eq!(ctl.page(), 1);
        assert_eq!(ctl.entries().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn single_draft_and_merge_on_save() {
        let api = FakeApi::with_entries(3);
        let (mut ctl, _dir) = logged_in(&api).await;
        let shown = ids(&ctl);

        ctl.begin_edit(shown[0]).unwrap();
        ctl.update_draft("unsaved", "work");
        ctl.begin_edit(shown[1]).unwrap();
        let draft = ctl.draft().unwrap();
        assert_eq!(draft.id, shown[1]);
        assert_ne!(draft.title, "unsaved");

        ctl.update_draft("", "body");
        assert!(ctl.save_edit().is_err());
        assert_eq!(api.calls("update"), 0);

        api.fail_next("update", JournalError::Unreachable("offline".into()));
        ctl.update_draft("Edited", "New body");
        ctl.save_edit().unwrap();
        assert!(ctl.loading(shown[1]).edit);
        settle(&mut ctl).await;
        assert_eq!(ctl.draft().unwrap().title, "Edited");
        assert!(ctl.error().is_some());

        ctl.save_edit().unwrap();
        settle(&mut ctl).await;
        assert!(ctl.draft().is_none());
        assert!(ctl.error().is_none());
        let view = ctl.entry(shown[1]).unwrap();
        assert_eq!(view.entry.title, "Edited");
        assert_eq!(view.entry.content, "New body");
        assert_eq!(ctl.entry(shown[0]).unwrap().entry.title, "title 3");
    }

    #[tokio::test(start_paused = true)]
    async fn logout_clears_everything_and_silences_reveals() {
        let api = FakeApi::with_entries(2);
        let (mut ctl, dir) = logged_in(&api).await;
        let id = ids(&ctl)[0];

        ctl.request_feedback(id).unwrap();
        settle(&mut ctl).await;
        ctl.pump().await;
        assert!(ctl.is_revealing());

        ctl.logout();
        assert_eq!(ctl.auth(), AuthState::LoggedOut);
        assert!(ctl.entries().is_empty());
        assert!(!ctl.is_revealing());
        assert!(SessionStore::open(dir.path()).get().is_none());

        // Anything still queued must be dropped without touching state.
        let _ = time::timeout(Duration::from_secs(1), async {
            loop {
                ctl.pump().await;
            }
        })
        .await;
        assert!(ctl.entries().is_empty());
        assert!(ctl.error().is_none());
        assert_eq!(ctl.request_feedback(id), Err(JournalError::Unauthenticated));
    }

    #[tokio::test(start_paused = true)]
    async fn external_logout_resets_the_view() {
        let api = FakeApi::with_entries(2);
        let (mut ctl, dir) = logged_in(&api).await;
        assert_eq!(ctl.entries().len(), 2);

        let other = SessionStore::open(dir.path());
        other.clear().unwrap();
        // The controller's own store notices the file is gone.
        assert!(ctl.session.reload());
        ctl.pump().await;

        assert_eq!(ctl.auth(), AuthState::LoggedOut);
        assert!(ctl.entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn results_after_logout_are_ignored() {
        let api = FakeApi::with_entries(6);
        let (mut ctl, _dir) = logged_in(&api).await;
        let id = ids(&ctl)[0];

        api.hold("list");
        api.hold("feedback");
        ctl.next_page().unwrap();
        ctl.request_feedback(id).unwrap();
        ctl.logout();

        api.release("list");
        api.release("feedback");
        settle(&mut ctl).await;

        assert_eq!(ctl.auth(), AuthState::LoggedOut);
        assert!(ctl.entries().is_empty());
        assert!(!ctl.is_revealing());
        assert_eq!(ctl.page(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn feedback_for_a_deleted_entry_is_dropped() {
        let api = FakeApi::with_entries(2);
        let (mut ctl, _dir) = logged_in(&api).await;
        let id = ids(&ctl)[0];

        api.hold("feedback");
        ctl.request_feedback(id).unwrap();
        ctl.request_delete(id).unwrap();
        ctl.confirm_delete().unwrap();
        while ctl.entry(id).is_some() {
            ctl.pump().await;
        }
        api.release("feedback");
        settle(&mut ctl).await;

        assert!(ctl.entry(id).is_none());
        assert!(!ctl.is_revealing());
        assert_eq!(ctl.entries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn payment_required_opens_the_paywall() {
        let api = FakeApi::with_entries(1);
        let (mut ctl, _dir) = logged_in(&api).await;
        let id = ids(&ctl)[0];

        api.fail_next(
            "feedback",
            JournalError::RequestRejected {
                status: 403,
                detail: "Free feedback limit reached".to_string(),
            },
        );
        ctl.request_feedback(id).unwrap();
        settle(&mut ctl).await;

        assert!(ctl.paywall().is_visible());
        assert_eq!(ctl.error(), Some("Free feedback limit reached"));
        assert!(ctl.can_request_feedback(id));

        ctl.dismiss_paywall();
        assert!(!ctl.paywall().is_visible());
        ctl.show_paywall();
        ctl.logout();
        assert!(!ctl.paywall().is_visible());
    }

    #[tokio::test(start_paused = true)]
    async fn premium_account_hides_the_paywall() {
        let api = FakeApi::with_entries(1);
        api.set_premium(true);
        let dir = tempfile::tempdir().unwrap();
        SessionStore::open(dir.path()).set(TOKEN).unwrap();
        let mut ctl = controller(&api, &dir);
        ctl.show_paywall();
        ctl.start();
        settle(&mut ctl).await;

        assert!(ctl.account().unwrap().is_premium);
        assert!(!ctl.paywall().is_visible());
    }

    #[tokio::test(start_paused = true)]
    async fn server_rejecting_the_token_expires_the_session() {
        let api = FakeApi::with_entries(1);
        let (mut ctl, dir) = logged_in(&api).await;

        api.fail_next("list", JournalError::Unauthenticated);
        ctl.reload().unwrap();
        settle(&mut ctl).await;

        assert_eq!(ctl.auth(), AuthState::LoggedOut);
        assert_eq!(ctl.error(), Some(SESSION_EXPIRED));
        assert!(SessionStore::open(dir.path()).get().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn register_checks_passwords_then_logs_in() {
        let api = FakeApi::with_entries(0);
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(&api, &dir);

        assert!(ctl.register("new@example.com", "abc", "abd").is_err());
        assert_eq!(ctl.error(), Some("Passwords do not match"));
        assert_eq!(api.calls("register"), 0);

        ctl.register("new@example.com", "abc", "abc").unwrap();
        settle(&mut ctl).await;
        assert_eq!(api.calls("register"), 1);
        assert_eq!(api.calls("login"), 1);
        assert_eq!(ctl.auth(), AuthState::LoggedIn);
        assert!(ctl.error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn bad_credentials_surface_server_detail() {
        let api = FakeApi::new();
        api.add_user("writer@example.com", "right");
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(&api, &dir);

        ctl.login("writer@example.com", "wrong").unwrap();
        settle(&mut ctl).await;
        assert_eq!(ctl.auth(), AuthState::LoggedOut);
        assert_eq!(ctl.error(), Some("Invalid credentials"));
        assert!(SessionStore::open(dir.path()).get().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn password_recovery_notices() {
        let api = FakeApi::new();
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(&api, &dir);

        ctl.forgot_password("someone@example.com").unwrap();
        settle(&mut ctl).await;
        assert_eq!(ctl.notice(), Some(crate::api::FORGOT_PASSWORD_NOTICE));

        assert!(ctl.reset_password("tok", "a", "b").is_err());
        assert_eq!(api.calls("reset_password"), 0);
        ctl.reset_password("tok", "new-pass", "new-pass").unwrap();
        settle(&mut ctl).await;
        assert_eq!(ctl.notice(), Some(PASSWORD_RESET_NOTICE));
    }

    #[tokio::test(start_paused = true)]
    async fn refetching_the_same_page_keeps_view_state() {
        let api = FakeApi::with_entries(3);
        let (mut ctl, _dir) = logged_in(&api).await;
        let shown = ids(&ctl);
        ctl.toggle_expanded(shown[1]);
        ctl.begin_edit(shown[2]).unwrap();

        ctl.reload().unwrap();
        settle(&mut ctl).await;

        assert!(ctl.entry(shown[1]).unwrap().is_expanded);
        assert!(!ctl.entry(shown[0]).unwrap().is_expanded);
        assert_eq!(ctl.draft().unwrap().id, shown[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_page_never_takes_feedback_back() {
        let api = FakeApi::with_entries(2);
        let (mut ctl, _dir) = logged_in(&api).await;
        let id = ids(&ctl)[0];
        let before: Vec<Entry> = ctl.entries().iter().map(|v| v.entry.clone()).collect();

        ctl.reload().unwrap();
        let (session, view) = (ctl.session_epoch, ctl.view_epoch);
        settle(&mut ctl).await;
        ctl.request_feedback(id).unwrap();
        finish_reveals(&mut ctl).await;
        assert!(ctl.entry(id).unwrap().has_feedback);

        // A listing the server built before the feedback was stored.
        ctl.handle(ControllerEvent::Completed(Completion::PageLoaded {
            session,
            view,
            result: Ok(Page::from_entries(1, 5, before)),
        }));

        let shown = ctl.entry(id).unwrap();
        assert!(shown.has_feedback);
        assert_eq!(shown.displayed_feedback(), format!("Reflection on {}", id));
        assert!(!ctl.can_request_feedback(id));
        let calls = api.calls("feedback");
        assert!(ctl.request_feedback(id).is_err());
        assert_eq!(api.calls("feedback"), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn same_page_refetch_lets_a_reveal_keep_typing() {
        let api = FakeApi::with_entries(2);
        let (mut ctl, _dir) = logged_in(&api).await;
        let id = ids(&ctl)[0];

        ctl.request_feedback(id).unwrap();
        settle(&mut ctl).await;
        while ctl.entry(id).unwrap().revealed < 3 {
            ctl.pump().await;
        }
        let revealed = ctl.entry(id).unwrap().revealed;

        ctl.reload().unwrap();
        settle(&mut ctl).await;
        let view = ctl.entry(id).unwrap();
        assert!(view.is_typing);
        assert!(view.revealed >= revealed);
        assert!(ctl.is_revealing());

        finish_reveals(&mut ctl).await;
        assert_eq!(
            ctl.entry(id).unwrap().displayed_feedback(),
            format!("Reflection on {}", id)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn changing_page_finishes_every_reveal() {
        let api = FakeApi::with_entries(8);
        let (mut ctl, _dir) = logged_in(&api).await;
        let shown = ids(&ctl);

        ctl.request_feedback(shown[0]).unwrap();
        ctl.request_feedback(shown[1]).unwrap();
        settle(&mut ctl).await;
        assert!(ctl.is_revealing());

        ctl.next_page().unwrap();
        settle(&mut ctl).await;
        assert_eq!(ctl.page(), 2);
        assert!(!ctl.is_revealing());

        ctl.prev_page().unwrap();
        settle(&mut ctl).await;
        for id in [shown[0], shown[1]] {
            let view = ctl.entry(id).unwrap();
            assert!(!view.is_typing);
            assert_eq!(view.displayed_feedback(), format!("Reflection on {}", id));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_navigation_keeps_the_draft() {
        let api = FakeApi::with_entries(8);
        let (mut ctl, _dir) = logged_in(&api).await;
        let first = ids(&ctl)[0];
        ctl.begin_edit(first).unwrap();
        ctl.update_draft("half", "written");

        api.fail_next("list", JournalError::Unreachable("offline".into()));
        ctl.next_page().unwrap();
        settle(&mut ctl).await;

        assert_eq!(ctl.page(), 1);
        assert!(ctl.error().is_some());
        let draft = ctl.draft().unwrap();
        assert_eq!((draft.id, draft.title.as_str()), (first, "half"));
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_session_reloads_under_the_new_token() {
        let api = FakeApi::with_entries(3);
        let (mut ctl, dir) = logged_in(&api).await;
        let id = ids(&ctl)[0];
        ctl.toggle_expanded(id);
        ctl.begin_edit(id).unwrap();
        let lists = api.calls("list");

        let other = SessionStore::open(dir.path());
        other.set(OTHER_TOKEN).unwrap();
        assert!(ctl.session.reload());
        ctl.pump().await;

        assert_eq!(ctl.auth(), AuthState::LoggedIn);
        assert_eq!(ctl.current_token.as_deref(), Some(OTHER_TOKEN));
        assert!(ctl.entries().is_empty());
        assert!(ctl.draft().is_none());
        assert!(ctl.is_page_loading());
        settle(&mut ctl).await;

        assert_eq!(api.calls("list"), lists + 1);
        assert_eq!(ids(&ctl).len(), 3);
        assert!(!ctl.entry(id).unwrap().is_expanded);
    }

    #[tokio::test(start_paused = true)]
    async fn loading_flags_for_departed_entries_are_dropped() {
        let api = FakeApi::with_entries(8);
        let (mut ctl, _dir) = logged_in(&api).await;
        let shown = ids(&ctl);

        ctl.request_feedback(shown[0]).unwrap();
        settle(&mut ctl).await;
        assert!(ctl.loading.contains_key(&shown[0]));

        ctl.next_page().unwrap();
        settle(&mut ctl).await;
        assert!(ctl.loading.is_empty());
    }
}

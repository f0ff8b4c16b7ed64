use std::sync::Arc;

use crate::api::JournalApi;
use crate::error::JournalError;
use crate::model::{Entry, EntryFields, EntryId, EntryPatch, Page};
use crate::session::SessionContext;

/// Paginated CRUD over the journal endpoints.
///
/// Holds no entries itself: the caller owns the displayed page and reconciles
/// results into it. Identity always comes from the server; `create` never
/// invents an id.
pub struct EntryRepository<A: ?Sized> {
    api: Arc<A>,
}

impl<A: ?Sized> Clone for EntryRepository<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
        }
    }
}

impl<A: JournalApi> EntryRepository<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    pub async fn list(
        &self,
        session: &SessionContext,
        page: u32,
        limit: u32,
    ) -> Result<Page, JournalError> {
        let bearer = session.bearer()?;
        if page == 0 {
            return Err(JournalError::validation("Page numbers start at 1"));
        }
        if limit == 0 {
            return Err(JournalError::validation("Page size must be positive"));
        }
        let skip = Page::skip_for(page, limit);
        let entries = self.api.list_entries(bearer, skip, limit).await?;
        tracing::debug!("repository: page {} returned {} entries", page, entries.len());
        Ok(Page::from_entries(page, limit, entries))
    }

    pub async fn create(
        &self,
        session: &SessionContext,
        title: &str,
        content: &str,
    ) -> Result<Entry, JournalError> {
        let bearer = session.bearer()?;
        let fields = validate_fields(title, content)?;
        let entry = self.api.create_entry(bearer, &fields).await?;
        tracing::info!("repository: created entry {}", entry.id);
        Ok(entry)
    }

    pub async fn update(
        &self,
        session: &SessionContext,
        id: EntryId,
        title: &str,
        content: &str,
    ) -> Result<EntryPatch, JournalError> {
        let bearer = session.bearer()?;
        let fields = validate_fields(title, content)?;
        let patch = self.api.update_entry(bearer, id, &fields).await?;
        tracing::info!("repository: updated entry {}", id);
        Ok(patch)
    }

    pub async fn delete(&self, session: &SessionContext, id: EntryId) -> Result<(), JournalError> {
        let bearer = session.bearer()?;
        self.api.delete_entry(bearer, id).await?;
        tracing::info!("repository: deleted entry {}", id);
        Ok(())
    }

    /// Generates feedback server-side. Write-once with side effects: callers
    /// must not repeat it for an entry that already has feedback.
    pub async fn request_feedback(
        &self,
        session: &SessionContext,
        id: EntryId,
    ) -> Result<String, JournalError> {
        let bearer = session.bearer()?;
        let feedback = self.api.request_feedback(bearer, id).await?;
        if feedback.trim().is_empty() {
            return Err(JournalError::Malformed(
                "feedback response was empty".to_string(),
            ));
        }
        tracing::info!("repository: feedback received for entry {}", id);
        Ok(feedback)
    }
}

pub fn validate_fields(title: &str, content: &str) -> Result<EntryFields, JournalError> {
    let title = title.trim();
    if title.is_empty() || content.trim().is_empty() {
        return Err(JournalError::validation(
            "Please fill out both title and content.",
        ));
    }
    Ok(EntryFields {
        title: title.to_string(),
        content: content.to_string(),
    })
}

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::model::EntryId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealEvent {
    /// `shown` characters of the feedback are now visible.
    Progress {
        id: EntryId,
        generation: u64,
        shown: usize,
    },
    Done {
        id: EntryId,
        generation: u64,
    },
}

impl RevealEvent {
    pub fn id(&self) -> EntryId {
        match self {
            RevealEvent::Progress { id, .. } | RevealEvent::Done { id, .. } => *id,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            RevealEvent::Progress { generation, .. } | RevealEvent::Done { generation, .. } => {
                *generation
            }
        }
    }
}

struct ActiveReveal {
    generation: u64,
    // Dropping the guard cancels the task.
    _guard: DropGuard,
}

/// Reveals feedback text one character per step, one task per entry id.
///
/// Events are keyed by entry id and generation, never by position in a list.
/// Removing an id (cancel, restart, or dropping the revealer) cancels its task,
/// and `accepts` rejects anything a cancelled or superseded task already queued.
pub struct FeedbackRevealer {
    step: Duration,
    tx: mpsc::UnboundedSender<RevealEvent>,
    active: HashMap<EntryId, ActiveReveal>,
    next_generation: u64,
}

impl FeedbackRevealer {
    pub fn new(step: Duration) -> (Self, mpsc::UnboundedReceiver<RevealEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                step,
                tx,
                active: HashMap::new(),
                next_generation: 1,
            },
            rx,
        )
    }

    /// Starts (or restarts) the reveal for `id`. Returns its generation.
    pub fn start(&mut self, id: EntryId, text: &str) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        if self
            .active
            .insert(
                id,
                ActiveReveal {
                    generation,
                    _guard: cancel.drop_guard(),
                },
            )
            .is_some()
        {
            tracing::debug!("reveal: restarted for entry {}", id);
        }

        let total = text.chars().count();
        let step = self.step;
        let tx = self.tx.clone();

        tokio::spawn(async move {
            for shown in 1..=total {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => return,
                    _ = time::sleep(step) => {}
                }
                if tx
                    .send(RevealEvent::Progress {
                        id,
                        generation,
                        shown,
                    })
                    .is_err()
                {
                    return;
                }
            }
            if !task_cancel.is_cancelled() {
                let _ = tx.send(RevealEvent::Done { id, generation });
            }
        });

        generation
    }

    pub fn cancel(&mut self, id: EntryId) -> bool {
        let cancelled = self.active.remove(&id).is_some();
        if cancelled {
            tracing::debug!("reveal: cancelled for entry {}", id);
        }
        cancelled
    }

    pub fn cancel_all(&mut self) {
        self.active.clear();
    }

    /// Cancels every reveal whose id fails `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(EntryId) -> bool) {
        self.active.retain(|id, _| keep(*id));
    }

    pub fn is_active(&self, id: EntryId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// True when the event belongs to the live reveal for its id.
    pub fn accepts(&self, event: &RevealEvent) -> bool {
        self.active
            .get(&event.id())
            .is_some_and(|a| a.generation == event.generation())
    }

    /// Releases a reveal after its `Done` was handled.
    pub fn complete(&mut self, id: EntryId, generation: u64) {
        if self
            .active
            .get(&id)
            .is_some_and(|a| a.generation == generation)
        {
            self.active.remove(&id);
        }
    }
}

use std::sync::{Mutex, MutexGuard};

use shared::domain::{ConversationId, ConversationKind};

#[derive(Debug, Clone, PartialEq, Eq)]
struct FocusState {
    active: Option<(ConversationKind, ConversationId)>,
    foreground: bool,
}

/// Which conversation is on screen and whether the app is in the foreground.
pub struct FocusTracker {
    state: Mutex<FocusState>,
}

impl Default for FocusTracker {
    fn default() -> Self {
        Self {
            state: Mutex::new(FocusState {
                active: None,
                foreground: true,
            }),
        }
    }
}

impl FocusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self, active: Option<(ConversationKind, ConversationId)>) {
        self.lock().active = active;
    }

    pub fn active(&self) -> Option<(ConversationKind, ConversationId)> {
        self.lock().active.clone()
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.lock().foreground = foreground;
    }

    pub fn is_foreground(&self) -> bool {
        self.lock().foreground
    }

    /// True when the conversation is both active and visible.
    pub fn is_focused(&self, kind: ConversationKind, id: &ConversationId) -> bool {
        let state = self.lock();
        state.foreground
            && state
                .active
                .as_ref()
                .is_some_and(|(active_kind, active_id)| *active_kind == kind && active_id == id)
    }

    pub fn clear(&self) {
        *self.lock() = FocusState {
            active: None,
            foreground: true,
        };
    }

    fn lock(&self) -> MutexGuard<'_, FocusState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

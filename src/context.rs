//! Per-transition context
//!
//! A [`Context`] carries the acting user and the current persistence mode for a
//! single workflow transition. Temporary mode switches go through [`ModeGuard`],
//! which restores the previous mode when dropped.

use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{Result, WorkflowError};

/// Persistence mode of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextMode {
    #[default]
    ReadWrite,
    ReadOnly,
    /// Bulk modifications of many items within one transition.
    ///
    /// Advisory: the store treats it like `ReadWrite`. Atomicity comes from the
    /// unit of work, not from this mode.
    BatchEdit,
}

impl ContextMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextMode::ReadWrite => "read_write",
            ContextMode::ReadOnly => "read_only",
            ContextMode::BatchEdit => "batch_edit",
        }
    }
}

#[derive(Debug, Default)]
pub struct Context {
    current_user: Option<Uuid>,
    mode: Mutex<ContextMode>,
}

impl Context {
    pub fn new(current_user: Option<Uuid>) -> Self {
        Self {
            current_user,
            mode: Mutex::new(ContextMode::default()),
        }
    }

    pub fn with_mode(current_user: Option<Uuid>, mode: ContextMode) -> Self {
        Self {
            current_user,
            mode: Mutex::new(mode),
        }
    }

    pub fn current_user(&self) -> Option<Uuid> {
        self.current_user
    }

    pub fn current_mode(&self) -> ContextMode {
        *self.lock_mode()
    }

    pub fn set_mode(&self, mode: ContextMode) {
        *self.lock_mode() = mode;
    }

    /// Switch to `mode` until the returned guard is dropped
    pub fn enter_mode(&self, mode: ContextMode) -> ModeGuard<'_> {
        let previous = {
            let mut current = self.lock_mode();
            std::mem::replace(&mut *current, mode)
        };
        tracing::debug!(from = previous.as_str(), to = mode.as_str(), "context mode switched");
        ModeGuard {
            context: self,
            previous,
        }
    }

    /// Fails for read-only contexts
    pub fn ensure_writable(&self) -> Result<()> {
        if self.current_mode() == ContextMode::ReadOnly {
            return Err(WorkflowError::InvalidState(
                "Context is read-only".to_string(),
            ));
        }
        Ok(())
    }

    // A poisoned lock still holds a valid mode value.
    fn lock_mode(&self) -> MutexGuard<'_, ContextMode> {
        self.mode.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Restores the mode a context had before [`Context::enter_mode`]
#[must_use = "the previous mode is restored as soon as the guard is dropped"]
pub struct ModeGuard<'a> {
    context: &'a Context,
    previous: ContextMode,
}

impl ModeGuard<'_> {
    pub fn previous(&self) -> ContextMode {
        self.previous
    }
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        self.context.set_mode(self.previous);
        tracing::debug!(to = self.previous.as_str(), "context mode restored");
    }
}

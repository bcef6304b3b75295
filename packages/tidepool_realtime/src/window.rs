//! Window focus/visibility signals.
//!
//! The browser shell (or a test) owns a [`WindowDriver`] and pushes focus
//! and page-visibility changes into it; consumers hold cloneable
//! [`WindowSignals`] and either read the current value or watch for
//! transitions. Keeping this an injected capability means nothing in the
//! core touches a global window object.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Write half, held by the host shell.
pub struct WindowDriver {
    focus_tx: watch::Sender<bool>,
    visibility_tx: watch::Sender<Visibility>,
}

impl WindowDriver {
    /// Create the driver/signals pair. Starts focused and visible.
    pub fn new() -> (WindowDriver, WindowSignals) {
        let (focus_tx, focus_rx) = watch::channel(true);
        let (visibility_tx, visibility_rx) = watch::channel(Visibility::Visible);
        (
            WindowDriver {
                focus_tx,
                visibility_tx,
            },
            WindowSignals {
                focus_rx,
                visibility_rx,
            },
        )
    }

    pub fn set_focused(&self, focused: bool) {
        self.focus_tx.send_replace(focused);
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        self.visibility_tx.send_replace(visibility);
    }
}

/// Read half, cloneable into every consumer.
#[derive(Clone)]
pub struct WindowSignals {
    focus_rx: watch::Receiver<bool>,
    visibility_rx: watch::Receiver<Visibility>,
}

impl WindowSignals {
    pub fn focused(&self) -> bool {
        *self.focus_rx.borrow()
    }

    pub fn visibility(&self) -> Visibility {
        *self.visibility_rx.borrow()
    }

    /// Watch focus transitions.
    pub fn focus_watch(&self) -> watch::Receiver<bool> {
        self.focus_rx.clone()
    }

    /// Watch visibility transitions.
    pub fn visibility_watch(&self) -> watch::Receiver<Visibility> {
        self.visibility_rx.clone()
    }
}

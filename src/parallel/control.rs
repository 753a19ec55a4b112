//! Pause, resume and cancel signaling, plus keyboard shortcuts

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SvgBatchError};

/// Run-level control flags shared by the scheduler and the front end
pub struct Controller {
    paused: watch::Sender<bool>,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl Controller {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused,
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Claim the controller for a new run.
    ///
    /// Issues a fresh cancellation token and clears any pause left over from
    /// a previous run.
    pub fn begin_run(&self) -> Result<RunGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SvgBatchError::AlreadyRunning);
        }

        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        self.paused.send_replace(false);

        Ok(RunGuard { controller: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Token for the current run
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token().is_cancelled()
    }

    /// Flip the pause flag, returning the new value
    pub fn toggle_pause(&self) -> bool {
        let mut now_paused = false;
        self.paused.send_modify(|paused| {
            *paused = !*paused;
            now_paused = *paused;
        });
        now_paused
    }

    /// Fire the current run's token
    pub fn cancel(&self) {
        self.cancel_token().cancel();
    }

    /// Wait while paused. Returns `false` if the run was cancelled instead.
    pub async fn wait_until_resumed(&self, cancel: &CancellationToken) -> bool {
        let mut paused = self.paused.subscribe();

        tokio::select! {
            biased;

            _ = cancel.cancelled() => false,
            resumed = paused.wait_for(|paused| !*paused) => resumed.is_ok() && !cancel.is_cancelled(),
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks a run as active until dropped
pub struct RunGuard<'a> {
    controller: &'a Controller,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.controller.running.store(false, Ordering::Release);
    }
}

/// Actions a front end can trigger from the keyboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Start a run, or pause/resume the active one
    StartPause,
    Cancel,
    /// Archive everything converted so far
    Download,
}

/// Front-end neutral description of a key press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPress {
    pub key: Key,
    pub ctrl: bool,
    pub meta: bool,
    /// Focus is in an editable text field
    pub in_text_field: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Space,
    Escape,
    Char(char),
    Other,
}

impl KeyPress {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            ctrl: false,
            meta: false,
            in_text_field: false,
        }
    }
}

impl ControlAction {
    /// Map a key press to an action; text entry always wins
    pub fn from_key_press(press: &KeyPress) -> Option<Self> {
        if press.in_text_field {
            return None;
        }

        match press.key {
            Key::Space => Some(Self::StartPause),
            Key::Escape => Some(Self::Cancel),
            Key::Char('d') | Key::Char('D') if !press.ctrl && !press.meta => Some(Self::Download),
            _ => None,
        }
    }

    /// Map a terminal key event
    pub fn from_key_event(event: &KeyEvent) -> Option<Self> {
        if event.kind == KeyEventKind::Release {
            return None;
        }

        let key = match event.code {
            KeyCode::Char(' ') => Key::Space,
            KeyCode::Esc => Key::Escape,
            KeyCode::Char(c) => Key::Char(c),
            _ => Key::Other,
        };

        Self::from_key_press(&KeyPress {
            key,
            ctrl: event.modifiers.contains(KeyModifiers::CONTROL),
            meta: event
                .modifiers
                .intersects(KeyModifiers::META | KeyModifiers::SUPER),
            in_text_field: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_shortcut_mapping() {
        assert_eq!(
            ControlAction::from_key_press(&KeyPress::new(Key::Space)),
            Some(ControlAction::StartPause)
        );
        assert_eq!(
            ControlAction::from_key_press(&KeyPress::new(Key::Escape)),
            Some(ControlAction::Cancel)
        );
        assert_eq!(
            ControlAction::from_key_press(&KeyPress::new(Key::Char('d'))),
            Some(ControlAction::Download)
        );
        assert_eq!(ControlAction::from_key_press(&KeyPress::new(Key::Char('x'))), None);
    }

    #[test]
    fn test_shortcuts_ignored_in_text_fields() {
        let press = KeyPress {
            in_text_field: true,
            ..KeyPress::new(Key::Space)
        };
        assert_eq!(ControlAction::from_key_press(&press), None);
    }

    #[test]
    fn test_download_requires_no_modifier() {
        let press = KeyPress {
            ctrl: true,
            ..KeyPress::new(Key::Char('d'))
        };
        assert_eq!(ControlAction::from_key_press(&press), None);
    }

    #[test]
    fn test_crossterm_events() {
        let space = KeyEvent::new(KeyCode::Char(' '), KeyModifiers::NONE);
        assert_eq!(ControlAction::from_key_event(&space), Some(ControlAction::StartPause));

        let esc = KeyEvent::new(KeyCode::Esc, KeyModifiers::NONE);
        assert_eq!(ControlAction::from_key_event(&esc), Some(ControlAction::Cancel));

        let ctrl_d = KeyEvent::new(KeyCode::Char('d'), KeyModifiers::CONTROL);
        assert_eq!(ControlAction::from_key_event(&ctrl_d), None);
    }

    #[test]
    fn test_single_run_at_a_time() {
        let controller = Controller::new();
        let guard = controller.begin_run().unwrap();
        assert!(controller.is_running());
        assert!(matches!(controller.begin_run(), Err(SvgBatchError::AlreadyRunning)));
        drop(guard);
        assert!(!controller.is_running());
        assert!(controller.begin_run().is_ok());
    }

    #[test]
    fn test_new_run_gets_fresh_token() {
        let controller = Controller::new();
        {
            let _guard = controller.begin_run().unwrap();
            controller.cancel();
            assert!(controller.is_cancelled());
        }
        let _guard = controller.begin_run().unwrap();
        assert!(!controller.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_until_resumed() {
        let controller = Arc::new(Controller::new());
        let cancel = controller.cancel_token();
        assert!(controller.toggle_pause());

        let resumer = Arc::clone(&controller);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resumer.toggle_pause();
        });

        assert!(controller.wait_until_resumed(&cancel).await);
        assert!(!controller.is_paused());
    }

    #[tokio::test]
    async fn test_cancel_releases_paused_waiter() {
        let controller = Arc::new(Controller::new());
        let cancel = controller.cancel_token();
        controller.toggle_pause();

        let canceller = Arc::clone(&controller);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        assert!(!controller.wait_until_resumed(&cancel).await);
    }
}

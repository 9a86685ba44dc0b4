//! The prompt-driven state machine, independent of any process or event loop.
//!
//! Every readiness notification from the backend becomes one call to
//! [`PasswdMachine::feed`]: the bytes are appended to a buffer owned by the
//! machine and the current state's triggers are evaluated exactly once against
//! the whole buffer. The buffer is emptied whenever a trigger fires, so every
//! byte is interpreted under exactly one state.

use super::classifier::{self, AuthVerdict, RetypeVerdict};
use super::error::{PasswdError, PasswdResult};
use super::queue::{SecretQueue, SecretSink};
use super::state::PasswdState;

/// Completion handler for an authentication or change request.
pub type PasswdCallback = Box<dyn FnOnce(PasswdResult) + Send + 'static>;

/// Conversation state, write queue and pending callbacks for one session.
pub struct PasswdMachine {
    state: PasswdState,
    buffer: Vec<u8>,
    queue: SecretQueue,
    changing_password: bool,
    // The account has no password: passwd opens with the new-password prompt.
    // Survives `reset` so a restarted backend is not sent a current password.
    skips_current_password: bool,
    auth_cb: Option<PasswdCallback>,
    change_cb: Option<PasswdCallback>,
}

impl Default for PasswdMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PasswdMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswdMachine")
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .field("pending_writes", &self.queue.len())
            .field("changing_password", &self.changing_password)
            .field("skips_current_password", &self.skips_current_password)
            .field("auth_cb", &self.auth_cb.is_some())
            .field("change_cb", &self.change_cb.is_some())
            .finish()
    }
}

impl PasswdMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: PasswdState::None,
            buffer: Vec::new(),
            queue: SecretQueue::new(),
            changing_password: false,
            skips_current_password: false,
            auth_cb: None,
            change_cb: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> PasswdState {
        self.state
    }

    /// Output accumulated since the last transition.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_changing_password(&self) -> bool {
        self.changing_password
    }

    /// Whether passwd was seen asking for the new password without first
    /// asking for the current one.
    #[must_use]
    pub fn skips_current_password(&self) -> bool {
        self.skips_current_password
    }

    /// Forget the conversation: back to `None` with an empty buffer.
    pub fn reset(&mut self) {
        if self.state != PasswdState::None {
            tracing::debug!(from = ?self.state, "Resetting backend state");
        }
        self.state = PasswdState::None;
        self.buffer.clear();
    }

    /// Start an authentication request, dropping any earlier change request.
    pub fn begin_auth(&mut self, cb: PasswdCallback) {
        self.change_cb = None;
        self.queue.clear();
        self.skips_current_password = false;
        self.auth_cb = Some(cb);
    }

    /// Withdraw an authentication request that could not be started.
    pub fn abandon_auth(&mut self) {
        self.auth_cb = None;
        self.queue.clear();
    }

    /// Start a change request. `changing_password` stays set until it resolves.
    pub fn begin_change(&mut self, cb: PasswdCallback) {
        self.changing_password = true;
        self.change_cb = Some(cb);
    }

    /// Withdraw a change request that could not be started.
    pub fn abandon_change(&mut self) {
        self.changing_password = false;
        self.change_cb = None;
        self.queue.clear();
    }

    pub fn queue_current(&mut self, current_password: &str) {
        self.queue.push(current_password);
    }

    pub fn queue_new(&mut self, new_password: &str) {
        self.queue.push_twice(new_password);
    }

    /// Send the head of the write queue ahead of the next prompt.
    pub fn send_next(&mut self, sink: &mut dyn SecretSink) -> bool {
        self.queue.send_next(sink)
    }

    /// Drop every callback and queued secret. Nothing fires afterwards.
    pub fn disarm(&mut self) {
        self.auth_cb = None;
        self.change_cb = None;
        self.queue.clear();
        self.changing_password = false;
    }

    /// Consume a chunk of backend output and react to it.
    pub fn feed(&mut self, chunk: &[u8], sink: &mut dyn SecretSink) {
        self.buffer.extend_from_slice(chunk);

        if self.evaluate(sink) {
            self.buffer.clear();
        }
    }

    /// React to the backend exiting with `code` (`None` if killed by a signal).
    pub fn child_exited(&mut self, code: Option<i32>) {
        if code == Some(0) && self.state == PasswdState::AwaitingRetype {
            // passwd may exit without a final message once the change went through.
            self.complete_change();
        }
    }

    /// Returns whether a trigger fired and the buffer must be reset.
    fn evaluate(&mut self, sink: &mut dyn SecretSink) -> bool {
        let output = String::from_utf8_lossy(&self.buffer).into_owned();

        match self.state {
            PasswdState::None => {
                if !classifier::is_password_prompt(&output) {
                    return false;
                }
                if classifier::asks_for_new_password(&output) {
                    // No password set: passwd skipped the current-password prompt,
                    // so there is nothing to authenticate.
                    self.transition(PasswdState::AwaitingNew);
                    self.skips_current_password = true;
                    self.queue.discard_head();
                    self.queue.send_next(sink);
                    self.fire_auth(Ok(()));
                } else {
                    self.transition(PasswdState::AwaitingAuth);
                    self.skips_current_password = false;
                    self.queue.send_next(sink);
                }
                true
            }
            PasswdState::AwaitingAuth => match classifier::classify_auth(&output) {
                Some(AuthVerdict::Accepted) => {
                    self.transition(PasswdState::AwaitingNew);
                    self.fire_auth(Ok(()));
                    true
                }
                Some(AuthVerdict::Failed) => {
                    tracing::info!("Backend rejected the current password");
                    self.transition(PasswdState::Error);
                    self.changing_password = false;
                    // A registered change callback means the change was already in flight.
                    if let Some(cb) = self.change_cb.take() {
                        cb(Err(PasswdError::AuthFailed));
                    } else {
                        self.fire_auth(Err(PasswdError::AuthFailed));
                    }
                    true
                }
                None => false,
            },
            PasswdState::AwaitingNew => {
                if !classifier::is_password_prompt(&output) {
                    return false;
                }
                self.transition(PasswdState::AwaitingRetype);
                self.queue.send_next(sink);
                true
            }
            PasswdState::AwaitingRetype => match classifier::classify_retype(&output) {
                Some(RetypeVerdict::Changed) => {
                    self.complete_change();
                    true
                }
                Some(RetypeVerdict::Refused(err)) => {
                    tracing::info!(error = %err, "Backend refused the new password");
                    // passwd may exit now or re-prompt; exit handling cleans up either way.
                    self.transition(PasswdState::Error);
                    self.changing_password = false;
                    self.fire_change(Err(err));
                    true
                }
                None => false,
            },
            PasswdState::Done | PasswdState::Error => true,
        }
    }

    fn complete_change(&mut self) {
        self.transition(PasswdState::Done);
        self.changing_password = false;
        // The account has a password from now on.
        self.skips_current_password = false;
        self.fire_change(Ok(()));
    }

    fn transition(&mut self, to: PasswdState) {
        tracing::debug!(from = ?self.state, to = ?to, "State transition");
        self.state = to;
    }

    fn fire_auth(&mut self, result: PasswdResult) {
        if let Some(cb) = self.auth_cb.take() {
            cb(result);
        }
    }

    fn fire_change(&mut self, result: PasswdResult) {
        if let Some(cb) = self.change_cb.take() {
            cb(result);
        }
    }
}

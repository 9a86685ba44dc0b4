//! Caller-facing handler that drives one password-change session.

use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::backend::{exit_code, BackendEvent, PasswdBackend, SpawnError};
use crate::config::BackendConfig;

use super::error::{PasswdError, PasswdResult};
use super::machine::{PasswdCallback, PasswdMachine};
use super::state::PasswdState;

/// One password-change session.
///
/// Requests return immediately; outcomes are delivered to the supplied
/// callbacks while [`dispatch_next`](Self::dispatch_next) pumps backend
/// notifications. The passwords are borrowed from the caller for the
/// lifetime of the handler and only copied into the write queue.
pub struct PasswdHandler<'pw> {
    current_password: Option<&'pw str>,
    new_password: Option<&'pw str>,
    backend: PasswdBackend,
    machine: PasswdMachine,
}

impl std::fmt::Debug for PasswdHandler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswdHandler")
            .field("has_current_password", &self.current_password.is_some())
            .field("has_new_password", &self.new_password.is_some())
            .field("backend", &self.backend)
            .field("machine", &self.machine)
            .finish()
    }
}

impl<'pw> PasswdHandler<'pw> {
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        Self {
            current_password: None,
            new_password: None,
            backend: PasswdBackend::new(config),
            machine: PasswdMachine::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> PasswdState {
        self.machine.state()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.backend.is_running()
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.backend.pid()
    }

    #[must_use]
    pub fn is_changing_password(&self) -> bool {
        self.machine.is_changing_password()
    }

    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.machine.pending_writes()
    }

    /// Start `passwd` and authenticate with `current_password`.
    ///
    /// Ignored while a password change is pending, so an in-flight change is
    /// never disrupted. Otherwise any running backend is killed first and the
    /// previous change request is forgotten. `cb` fires once with the outcome.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `PasswdError::Backend` if `passwd` could not be spawned.
    pub fn authenticate<F>(&mut self, current_password: &'pw str, cb: F) -> PasswdResult
    where
        F: FnOnce(PasswdResult) + Send + 'static,
    {
        if self.machine.is_changing_password() {
            tracing::debug!("Password change pending, ignoring authentication request");
            return Ok(());
        }

        self.new_password = None;
        self.current_password = Some(current_password);
        self.machine.begin_auth(Box::new(cb));

        self.teardown();
        if let Err(e) = self.backend.spawn() {
            tracing::warn!(error = %e, "Could not start passwd");
            self.machine.abandon_auth();
            return Err(e.into());
        }

        self.machine.queue_current(current_password);
        Ok(())
    }

    /// Ask `passwd` to change the password to `new_password`.
    ///
    /// Reuses the running, authenticated backend when there is one; otherwise
    /// restarts the whole authenticate-then-change sequence. Returns `false`
    /// if `passwd` could not be spawned, in which case `cb` never fires.
    ///
    /// Must be called from within a tokio runtime.
    pub fn change_password<F>(&mut self, new_password: &'pw str, cb: F) -> bool
    where
        F: FnOnce(PasswdResult) + Send + 'static,
    {
        self.try_change_password(new_password, Box::new(cb)).is_ok()
    }

    fn try_change_password(
        &mut self,
        new_password: &'pw str,
        cb: PasswdCallback,
    ) -> Result<(), SpawnError> {
        self.new_password = Some(new_password);
        self.machine.begin_change(cb);

        if self.machine.state() == PasswdState::Error {
            self.teardown();
        }

        // Whether the head of the queue can be written before passwd prompts.
        let send_early = if self.backend.is_running() {
            self.machine.queue_new(new_password);
            self.current_password.is_some()
        } else {
            self.teardown();
            if let Err(e) = self.backend.spawn() {
                tracing::warn!(error = %e, "Could not start passwd");
                self.machine.abandon_change();
                return Err(e);
            }
            // The head entry answers the first prompt; the classifier drops it
            // if passwd asks for the new password straight away.
            self.machine.queue_current(self.current_password.unwrap_or_default());
            self.machine.queue_new(new_password);
            // An account without a password never gets a current-password
            // prompt, so the head entry must wait for the classifier.
            self.current_password.is_some() && !self.machine.skips_current_password()
        };

        if send_early {
            self.machine.send_next(&mut self.backend);
        }
        Ok(())
    }

    /// Wait for one backend notification and run the state machine on it.
    ///
    /// Returns `false` without waiting when no backend is running.
    pub async fn dispatch_next(&mut self) -> bool {
        let Some(event) = self.backend.next_event().await else {
            return false;
        };

        match event {
            BackendEvent::Output { bytes, .. } => {
                self.machine.feed(&bytes, &mut self.backend);
            }
            BackendEvent::Exited { status, .. } => {
                let code = exit_code(status);
                tracing::debug!(?code, state = ?self.machine.state(), "passwd exited");
                self.machine.child_exited(code);
                self.backend.release();
                self.machine.reset();
            }
        }
        true
    }

    /// Dispatch notifications until the backend has exited or been stopped.
    pub async fn run_until_idle(&mut self) {
        while self.dispatch_next().await {}
    }

    /// Authenticate and wait for the verdict.
    ///
    /// # Errors
    ///
    /// Returns the classified failure, `PasswdError::Backend` if `passwd`
    /// could not start, or `PasswdError::Incomplete` if it exited silently.
    pub async fn authenticate_and_wait(&mut self, current_password: &'pw str) -> PasswdResult {
        let (tx, rx) = oneshot::channel();
        self.authenticate(current_password, move |result| {
            let _ = tx.send(result);
        })?;
        self.wait_for(rx).await
    }

    /// Change the password and wait for the verdict.
    ///
    /// # Errors
    ///
    /// Returns the classified failure, `PasswdError::Backend` if `passwd`
    /// could not start, or `PasswdError::Incomplete` if it exited silently.
    pub async fn change_password_and_wait(&mut self, new_password: &'pw str) -> PasswdResult {
        let (tx, rx) = oneshot::channel();
        self.try_change_password(
            new_password,
            Box::new(move |result: PasswdResult| {
                let _ = tx.send(result);
            }),
        )?;
        self.wait_for(rx).await
    }

    async fn wait_for(&mut self, mut rx: oneshot::Receiver<PasswdResult>) -> PasswdResult {
        loop {
            match rx.try_recv() {
                Ok(result) => return result,
                // The callback was dropped without firing.
                Err(TryRecvError::Closed) => return Err(PasswdError::Incomplete),
                Err(TryRecvError::Empty) => {}
            }
            if !self.dispatch_next().await {
                return rx.try_recv().unwrap_or(Err(PasswdError::Incomplete));
            }
        }
    }

    /// Kill the backend, if any, and reset the conversation. Callbacks stay
    /// registered. Safe to call at any time, any number of times.
    pub fn teardown(&mut self) {
        self.backend.stop();
        self.machine.reset();
    }

    /// Stop everything and drop all callbacks and queued secrets.
    /// No callback fires afterwards. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        self.machine.disarm();
        self.teardown();
    }

    /// Forcefully stop any running backend and release all resources.
    pub fn destroy(mut self) {
        self.cancel();
    }
}

impl Drop for PasswdHandler<'_> {
    fn drop(&mut self) {
        self.cancel();
    }
}

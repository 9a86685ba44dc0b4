//! Write queue of secrets waiting to be sent to the backend.

use std::collections::VecDeque;
use std::io;

use zeroize::Zeroize;

/// Destination for secret lines, normally the backend's stdin.
pub trait SecretSink {
    /// Write the whole line without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the line could not be written completely.
    fn write_secret(&mut self, line: &[u8]) -> io::Result<()>;
}

impl SecretSink for Vec<u8> {
    fn write_secret(&mut self, line: &[u8]) -> io::Result<()> {
        self.extend_from_slice(line);
        Ok(())
    }
}

/// A secret plus its line terminator. Zeroed once written and again on drop.
pub struct QueuedSecret {
    line: Box<[u8]>,
}

impl QueuedSecret {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        // Exact capacity so the buffer is never reallocated and copied.
        let mut line = Vec::with_capacity(secret.len() + 1);
        line.extend_from_slice(secret.as_bytes());
        line.push(b'\n');
        Self {
            line: line.into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.line
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.line.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.line.is_empty()
    }

    /// Overwrite the backing storage with zeros.
    pub fn wipe(&mut self) {
        self.line.zeroize();
    }

    /// Whether no secret material is left in the backing storage.
    #[must_use]
    pub fn is_wiped(&self) -> bool {
        self.line.iter().all(|b| *b == 0)
    }
}

impl Drop for QueuedSecret {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl std::fmt::Debug for QueuedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedSecret")
            .field("len", &self.line.len())
            .finish()
    }
}

/// Write `secret` to `sink`, then zero it whether or not the write succeeded.
///
/// # Errors
///
/// Returns the sink's error. The secret is wiped in either case.
pub fn transmit(secret: &mut QueuedSecret, sink: &mut dyn SecretSink) -> io::Result<()> {
    let result = sink.write_secret(secret.as_bytes());
    secret.wipe();
    result
}

/// FIFO of secrets awaiting transmission.
#[derive(Debug, Default)]
pub struct SecretQueue {
    entries: VecDeque<QueuedSecret>,
}

impl SecretQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, secret: &str) {
        self.entries.push_back(QueuedSecret::new(secret));
    }

    /// Queue the new password twice: once for the prompt, once for the retype.
    pub fn push_twice(&mut self, secret: &str) {
        self.push(secret);
        self.push(secret);
    }

    /// Drop the head entry without sending it.
    pub fn discard_head(&mut self) {
        self.entries.pop_front();
    }

    /// Send the head entry, if any. Returns whether an entry was popped.
    ///
    /// Write failures are logged; the entry is wiped and released regardless.
    pub fn send_next(&mut self, sink: &mut dyn SecretSink) -> bool {
        let Some(mut secret) = self.entries.pop_front() else {
            tracing::debug!("Write queue empty, nothing to send");
            return false;
        };
        let len = secret.len();
        if let Err(e) = transmit(&mut secret, sink) {
            tracing::warn!(error = %e, len, "Could not write queued secret to backend");
        }
        true
    }

    /// Drop every queued entry. Each is zeroed on release.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

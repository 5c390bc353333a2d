//! Blocking calls on top of the asynchronous dispatcher.
//!
//! Every blocking call owns a private single-slot channel, so overlapping calls from several
//! threads each receive their own result.
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError};
use std::time::Duration;

use anyhow::anyhow;

use crate::dispatcher::{Command, Completion, Dispatcher};
use crate::Error;

/// The receiving half of a blocking call.
pub struct Pending<T> {
    name: String,
    rx: Receiver<crate::Result<T>>,
}

/// Create a completion callback and the handle to block on its outcome.
pub fn pending<T: Send + 'static, S: Into<String>>(name: S) -> (Completion<T>, Pending<T>) {
    let (tx, rx) = sync_channel(1);
    let done: Completion<T> = Box::new(move |x| {
        // the caller may have given up already
        let _ = tx.try_send(x);
    });
    (done, Pending { name: name.into(), rx })
}

impl<T> Pending<T> {
    /// Block until the outcome is available or `timeout` elapsed.
    pub fn wait(self, timeout: Duration) -> crate::Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(x)) => Ok(x),
            Ok(Err(err)) if err.is_timeout() => Err(Error::timeout(format!(
                "Communications timeout during {} command.",
                self.name
            ))),
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Gave up waiting for `{}`.", self.name);
                Err(Error::timeout(format!("Timeout waiting for {} to complete.", self.name)))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }
}

impl Dispatcher {
    /// Fail early instead of deadlocking when a callback on the worker tries to block.
    pub(crate) fn check_blocking(&self) -> crate::Result<()> {
        if self.on_worker_thread() {
            Err(Error::argument(anyhow!(
                "Blocking call from within a dispatcher callback"
            )))
        } else {
            Ok(())
        }
    }

    /// Enqueue a command and block the calling thread until it completed.
    ///
    /// Callbacks attached to the command run before this function returns. If the outcome is
    /// not available within `timeout`, a timeout error is returned and the late outcome is
    /// discarded.
    pub fn send(&self, cmd: Command, timeout: Duration) -> crate::Result<Vec<u8>> {
        self.check_blocking()?;
        let (done, pending) = pending(cmd.name());
        self.enqueue(cmd.reply(done));
        pending.wait(timeout)
    }
}

//! Mailbox actors.
//!
//! An actor owns an unbounded FIFO [`Mailbox`] and runs a cooperative loop:
//! drain everything pending without blocking, do one unit of state-dependent
//! work, then yield to the scheduler exactly once. Senders hold a cloneable
//! [`Address`] and never block.
//!
//! ```text
//!   Address::put ──▶ [ m3 | m2 | m1 ] ──▶ drain ──▶ handle ──▶ tick ──▶ yield
//!                       Mailbox                     (loop until Flow::Stop)
//! ```

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{AppResult, DaqError};

/// Whether an actor loop keeps going after a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep running.
    Continue,
    /// Controlled shutdown.
    Stop,
}

/// Sending half of a mailbox.
#[derive(Debug)]
pub struct Address<M> {
    tx: mpsc::UnboundedSender<M>,
}

impl<M> Clone for Address<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M> Address<M> {
    /// Deliver a message. Never blocks.
    pub fn put(&self, message: M) -> AppResult<()> {
        self.tx.send(message).map_err(|_| DaqError::MailboxClosed)
    }

    /// Whether the owning actor has dropped its mailbox.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, owned by exactly one actor.
#[derive(Debug)]
pub struct Mailbox<M> {
    rx: mpsc::UnboundedReceiver<M>,
    address: Address<M>,
}

impl<M> Mailbox<M> {
    /// Allocate a mailbox.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx,
            address: Address { tx },
        }
    }

    /// An address delivering into this mailbox.
    pub fn address(&self) -> Address<M> {
        self.address.clone()
    }

    /// Take every pending message without waiting.
    pub fn drain(&mut self) -> Vec<M> {
        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }
}

impl<M> Default for Mailbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit of concurrent execution.
///
/// `prepare` must complete before `run`. `run` only returns on controlled
/// shutdown or a fatal error.
#[async_trait]
pub trait Actor: Send {
    /// Name used in logs and state snapshots.
    fn name(&self) -> &str;

    /// Allocate the mailbox and any other resources.
    async fn prepare(&mut self) -> AppResult<()>;

    /// Main cooperative loop.
    async fn run(&mut self) -> AppResult<()>;

    /// Release resources after `run` returns.
    async fn shutdown(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Run-independent state to checkpoint.
    fn collect_state(&self) -> Option<serde_json::Value> {
        None
    }

    /// Restore state captured by `collect_state`.
    fn receive_state(&mut self, _state: serde_json::Value) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_is_fifo_and_non_blocking() {
        let mut mailbox = Mailbox::new();
        let address = mailbox.address();
        assert!(mailbox.drain().is_empty());

        for i in 0..5 {
            address.put(i).unwrap();
        }
        assert_eq!(mailbox.drain(), vec![0, 1, 2, 3, 4]);
        assert!(mailbox.drain().is_empty());
    }

    #[test]
    fn put_after_drop_fails() {
        let mailbox = Mailbox::<u8>::new();
        let address = mailbox.address();
        drop(mailbox);
        assert!(address.is_closed());
        assert!(matches!(address.put(1), Err(DaqError::MailboxClosed)));
    }
}

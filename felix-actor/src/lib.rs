// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! A tiny single-owner actor runtime.
//!
//! Every actor owns exactly one [`Actor::Message`] mailbox, drains it in
//! batches, and runs [`Actor::finish_batch`] once per drain. Bursts of
//! cheap state-mutating messages (e.g. repeated ipset membership deltas)
//! collapse into a single expensive flush this way, instead of one flush
//! per message.
//!
//! There is no supervision tree and no cross-actor field access: actors
//! only talk to each other by sending messages through an [`ActorRef`].

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

/// A type that processes messages of a single kind, one batch at a time.
///
/// `handle` never performs the actual kernel write; it only folds a message
/// into `self`'s pending state. `finish_batch` is the sole place permitted
/// to do that I/O, so it is the only method that can fail.
pub trait Actor: Send + 'static {
    /// The message type this actor's mailbox carries.
    type Message: Send + 'static;
    /// Error raised by [`Actor::finish_batch`].
    type Error: StdError + Send + Sync + 'static;

    /// Fold one message into the actor's pending state.
    fn handle(&mut self, message: Self::Message);

    /// Called once after every message currently in the mailbox has been
    /// handled. The default does nothing, for actors with no batched
    /// flush (e.g. pure routers). Actors that flush to the kernel
    /// (`iptables-restore`, `ipset restore`) do real I/O here, hence the
    /// `async fn` in trait position rather than a plain `Result`.
    fn finish_batch(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }
}

/// Type-erased, cloneable form of an actor's `finish_batch` error, shared
/// across every caller awaiting the batch that failed.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

struct Envelope<M> {
    message: M,
    ack: Option<oneshot::Sender<Result<(), SharedError>>>,
}

/// A cheaply-cloneable reference to a running actor's mailbox.
///
/// Dropping every `ActorRef` for an actor causes its mailbox loop to exit
/// the next time `recv` observes a closed channel; there is no separate
/// shutdown message.
pub struct ActorRef<M> {
    tx: mpsc::UnboundedSender<Envelope<M>>,
}

impl<M> Clone for ActorRef<M> {
    fn clone(&self) -> Self {
        ActorRef {
            tx: self.tx.clone(),
        }
    }
}

impl<M> fmt::Debug for ActorRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Raised when `post`/`call` is attempted against an actor whose mailbox
/// loop has already exited.
#[derive(Debug, thiserror::Error)]
#[error("actor mailbox closed")]
pub struct MailboxClosed;

impl<M: Send + 'static> ActorRef<M> {
    /// Enqueue a message without waiting for the batch it lands in to
    /// finish. This is the common case: most messages just update state
    /// that the next `finish_batch` will flush.
    pub fn post(&self, message: M) {
        // A closed mailbox means the actor has already stopped; matching
        // the reference semantics, messages posted after that point are
        // silently discarded rather than treated as an error.
        let _ = self.tx.send(Envelope { message, ack: None });
    }

    /// Enqueue a message and wait for the batch containing it to finish,
    /// observing `finish_batch`'s outcome.
    ///
    /// # Errors
    ///
    /// Returns [`MailboxClosed`] if the actor is gone, or the shared
    /// `finish_batch` error if the batch failed.
    pub async fn call(&self, message: M) -> Result<(), CallError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                message,
                ack: Some(ack_tx),
            })
            .map_err(|_| CallError::Closed(MailboxClosed))?;
        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CallError::Batch(e)),
            Err(_) => Err(CallError::Closed(MailboxClosed)),
        }
    }
}

/// Outcome of [`ActorRef::call`].
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The actor's mailbox loop exited before acknowledging the message.
    #[error(transparent)]
    Closed(#[from] MailboxClosed),
    /// `finish_batch` failed for the batch this message was part of.
    #[error("batch failed: {0}")]
    Batch(SharedError),
}

/// Spawn `actor` onto the current Tokio runtime and return a handle to its
/// mailbox.
///
/// The mailbox loop drains every message queued at the moment it wakes
/// (see the module docs), runs `finish_batch`, and acknowledges every
/// caller that used [`ActorRef::call`] in that batch with the same
/// (possibly shared) result.
pub fn spawn<A: Actor>(mut actor: A) -> ActorRef<A::Message> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope<A::Message>>();
    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut acks = Vec::new();
            let mut apply = |envelope: Envelope<A::Message>, acks: &mut Vec<_>| {
                actor.handle(envelope.message);
                if let Some(ack) = envelope.ack {
                    acks.push(ack);
                }
            };
            apply(first, &mut acks);
            while let Ok(next) = rx.try_recv() {
                apply(next, &mut acks);
            }

            let outcome: Result<(), SharedError> = actor
                .finish_batch()
                .await
                .map_err(|e| Arc::new(e) as SharedError);
            if let Err(e) = &outcome {
                tracing::error!(error = %e, "actor batch failed");
            }
            for ack in acks {
                let _ = ack.send(outcome.clone());
            }
        }
    });
    ActorRef { tx }
}

/// Synchronous helpers for unit-testing [`Actor`] implementations without
/// spawning a runtime.
pub mod test_util {
    use super::Actor;

    /// Feed `messages` to `actor` in order, exactly as the real mailbox
    /// loop would for one batch, then run `finish_batch`.
    ///
    /// # Errors
    ///
    /// Propagates whatever `finish_batch` returns.
    pub async fn drain<A: Actor>(
        actor: &mut A,
        messages: impl IntoIterator<Item = A::Message>,
    ) -> Result<(), A::Error> {
        for message in messages {
            actor.handle(message);
        }
        actor.finish_batch().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    struct Counter {
        total: StdArc<AtomicUsize>,
        batches: StdArc<AtomicUsize>,
        fail_next: bool,
    }

    enum Msg {
        Add(usize),
        FailNextBatch,
    }

    impl Actor for Counter {
        type Message = Msg;
        type Error = Boom;

        fn handle(&mut self, message: Self::Message) {
            match message {
                Msg::Add(n) => {
                    self.total.fetch_add(n, Ordering::SeqCst);
                }
                Msg::FailNextBatch => self.fail_next = true,
            }
        }

        async fn finish_batch(&mut self) -> Result<(), Self::Error> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            if std::mem::take(&mut self.fail_next) {
                Err(Boom)
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn batches_collapse_to_one_finish_batch() {
        let total = StdArc::new(AtomicUsize::new(0));
        let batches = StdArc::new(AtomicUsize::new(0));
        let actor = Counter {
            total: total.clone(),
            batches: batches.clone(),
            fail_next: false,
        };
        let actor_ref = spawn(actor);

        // Fire a burst without waiting; they should all land in (at most)
        // a handful of batches rather than one each.
        for i in 0..50 {
            actor_ref.post(Msg::Add(i));
        }
        actor_ref.call(Msg::Add(0)).await.unwrap();

        assert_eq!(total.load(Ordering::SeqCst), (0..50).sum::<usize>());
        assert!(batches.load(Ordering::SeqCst) <= 50);
    }

    #[tokio::test]
    async fn batch_failure_is_observed_by_awaiting_caller() {
        let total = StdArc::new(AtomicUsize::new(0));
        let batches = StdArc::new(AtomicUsize::new(0));
        let actor = Counter {
            total,
            batches,
            fail_next: false,
        };
        let actor_ref = spawn(actor);
        actor_ref.post(Msg::FailNextBatch);
        let result = actor_ref.call(Msg::Add(1)).await;
        assert!(matches!(result, Err(CallError::Batch(_))));
    }

    #[tokio::test]
    async fn drain_runs_finish_batch_once() {
        let total = StdArc::new(AtomicUsize::new(0));
        let batches = StdArc::new(AtomicUsize::new(0));
        let mut actor = Counter {
            total: total.clone(),
            batches: batches.clone(),
            fail_next: false,
        };
        test_util::drain(&mut actor, [Msg::Add(1), Msg::Add(2), Msg::Add(3)])
            .await
            .unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 6);
        assert_eq!(batches.load(Ordering::SeqCst), 1);
    }
}

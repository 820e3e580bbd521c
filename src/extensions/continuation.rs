// Continuation Adapter
//
// Turns engine callbacks keyed by an opaque token into awaitable results.
// Each armed token owns exactly one oneshot sender; completing a token removes
// it from the table in the same step, so a late or repeated callback finds
// nothing and is ignored.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError<E> {
    /// The engine reported a failure; carried through unchanged
    #[error("{0}")]
    Engine(E),
    #[error("the call was torn down before it completed")]
    TornDown,
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("superseded by a newer call with the same token")]
    Superseded,
}

type Outcome<T, E> = Result<T, CompletionError<E>>;

/// An armed call waiting for its engine callback
#[derive(Debug)]
pub struct PendingCall<K, T, E> {
    key: K,
    receiver: oneshot::Receiver<Outcome<T, E>>,
    timeout: Option<Duration>,
}

impl<K, T, E> PendingCall<K, T, E> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Suspend until the call completes, times out or is torn down
    pub async fn wait(self) -> Result<T, CompletionError<E>> {
        let received = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.receiver).await {
                Ok(received) => received,
                Err(_) => return Err(CompletionError::TimedOut(limit)),
            },
            None => self.receiver.await,
        };

        // A dropped sender means the adapter went away without completing us
        received.unwrap_or(Err(CompletionError::TornDown))
    }
}

/// Table of in-flight calls keyed by token
pub struct ContinuationAdapter<K, T, E> {
    label: &'static str,
    pending: RefCell<HashMap<K, oneshot::Sender<Outcome<T, E>>>>,
    timeout: Option<Duration>,
}

impl<K, T, E> ContinuationAdapter<K, T, E>
where
    K: Eq + Hash + Clone + Debug,
{
    /// `label` names the adapter in log lines
    pub fn new(label: &'static str, timeout: Option<Duration>) -> Self {
        Self {
            label,
            pending: RefCell::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Register `key` and hand back its waiter. Arming a live key fails the
    /// older waiter with `Superseded`.
    pub fn arm(&self, key: K) -> PendingCall<K, T, E> {
        let (sender, receiver) = oneshot::channel();
        let previous = self.pending.borrow_mut().insert(key.clone(), sender);
        if let Some(previous) = previous {
            log::debug!("[{}] {:?} re-armed, superseding the earlier waiter", self.label, key);
            let _ = previous.send(Err(CompletionError::Superseded));
        }

        PendingCall {
            key,
            receiver,
            timeout: self.timeout,
        }
    }

    pub fn succeed(&self, key: &K, value: T) -> bool {
        self.complete(key, Ok(value))
    }

    pub fn fail(&self, key: &K, error: E) -> bool {
        self.complete(key, Err(CompletionError::Engine(error)))
    }

    fn complete(&self, key: &K, outcome: Outcome<T, E>) -> bool {
        let Some(sender) = self.pending.borrow_mut().remove(key) else {
            log::debug!("[{}] ignoring completion for unknown {:?}", self.label, key);
            return false;
        };

        if sender.send(outcome).is_err() {
            log::debug!("[{}] waiter for {:?} is gone", self.label, key);
        }
        true
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.pending.borrow().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    /// Drop entries whose waiter stopped listening (timed out or dropped)
    pub fn prune_abandoned(&self) -> usize {
        let mut pending = self.pending.borrow_mut();
        let before = pending.len();
        pending.retain(|_, sender| !sender.is_closed());
        before - pending.len()
    }

    /// Fail every armed call with `TornDown`
    pub fn tear_down(&self) {
        let drained: Vec<_> = self.pending.borrow_mut().drain().collect();
        if !drained.is_empty() {
            log::debug!("[{}] tearing down {} pending call(s)", self.label, drained.len());
        }
        for (_, sender) in drained {
            let _ = sender.send(Err(CompletionError::TornDown));
        }
    }
}

impl<K, T, E> Drop for ContinuationAdapter<K, T, E> {
    fn drop(&mut self) {
        for (_, sender) in self.pending.get_mut().drain() {
            let _ = sender.send(Err(CompletionError::TornDown));
        }
    }
}

//! Commit notification fan-out
//!
//! Every successful commit publishes the range of entry numbers it made
//! visible. Subscribers each get a bounded buffer; `notify` never waits on
//! them, and a subscriber that overflows its buffer is told it lagged.

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

/// Range of entry numbers made visible by one commit (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedRange {
    pub first: u64,
    pub last: u64,
}

impl CommittedRange {
    /// Number of entries in the range
    pub fn entry_count(&self) -> u64 {
        self.last - self.first + 1
    }

    /// Entry count after this commit
    pub fn end(&self) -> u64 {
        self.last + 1
    }
}

/// Why a subscription stopped yielding ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// Subscriber fell behind and missed this many notifications
    #[error("subscriber lagged by {0} commits")]
    Lagged(u64),

    /// Broadcaster was dropped
    #[error("broadcaster closed")]
    Closed,
}

/// Fan-out of commit notifications to live sessions
#[derive(Debug, Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<CommittedRange>,
}

impl Broadcaster {
    /// Create a broadcaster with a per-subscriber buffer of `capacity` commits
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Register a new subscriber
    ///
    /// The subscription only sees commits notified after this call.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish a committed range to every subscriber
    ///
    /// Returns the number of subscribers that were notified.
    pub fn notify(&self, first: u64, last: u64) -> usize {
        let range = CommittedRange { first, last };
        // No receivers is fine: nobody is tailing right now
        let receivers = self.sender.send(range).unwrap_or(0);
        trace!(first, last, receivers, "Commit notified");
        receivers
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One subscriber's view of the commit notifications
///
/// Dropping the subscription releases its buffer.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<CommittedRange>,
}

impl Subscription {
    /// Wait for the next committed range
    pub async fn next(&mut self) -> Result<CommittedRange, SubscriptionError> {
        match self.receiver.recv().await {
            Ok(range) => Ok(range),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                Err(SubscriptionError::Lagged(skipped))
            }
            Err(broadcast::error::RecvError::Closed) => Err(SubscriptionError::Closed),
        }
    }
}

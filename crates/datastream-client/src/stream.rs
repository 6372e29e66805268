//! Lazy entry stream handed out by `StreamClient::start`

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use datastream_core::Entry;

use crate::error::ClientError;

/// Ordered entries from a started session
///
/// Yields entries until the client stops or the connection ends. An error
/// item is always the last item.
#[derive(Debug)]
pub struct EntryStream {
    receiver: mpsc::Receiver<Result<Entry, ClientError>>,
}

impl EntryStream {
    pub(crate) fn new(receiver: mpsc::Receiver<Result<Entry, ClientError>>) -> Self {
        Self { receiver }
    }

    /// Wait for the next entry
    pub async fn next_entry(&mut self) -> Option<Result<Entry, ClientError>> {
        self.receiver.recv().await
    }
}

impl Stream for EntryStream {
    type Item = Result<Entry, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

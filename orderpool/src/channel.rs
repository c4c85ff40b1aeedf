//! Duplex, ordered message channel between the orchestrator and one worker.
//!
//! Each direction is a bounded tokio `mpsc` channel. The worker-side
//! endpoint additionally signals a shared [`Notify`] whenever it sends (or
//! goes away), which lets the orchestrator wait on many endpoints at once
//! instead of spinning over them.

use std::{fmt, sync::Arc};

use tokio::sync::{
    mpsc::{self, error::TryRecvError, Receiver, Sender},
    Notify,
};

use crate::error::ChannelError;

/// One half of a duplex channel: sends `S`, receives `R`.
pub struct Endpoint<S, R> {
    tx: Sender<S>,
    rx: Receiver<R>,
    // Message taken off the channel by `poll` but not yet handed out.
    peeked: Option<R>,
    // Signalled after every send and on drop so the peer can wake up.
    ready: Option<Arc<Notify>>,
}

/// Creates a connected pair of endpoints.
///
/// Messages travelling towards the first endpoint signal `ready`, so a
/// single `Notify` shared across many pairs tells the owner of the first
/// endpoints that at least one of them has something to read.
pub fn pair<A, B>(capacity: usize, ready: Arc<Notify>) -> (Endpoint<A, B>, Endpoint<B, A>) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);

    let first = Endpoint {
        tx: a_tx,
        rx: b_rx,
        peeked: None,
        ready: None,
    };
    let second = Endpoint {
        tx: b_tx,
        rx: a_rx,
        peeked: None,
        ready: Some(ready),
    };

    (first, second)
}

impl<S, R> fmt::Debug for Endpoint<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("peeked", &self.peeked.is_some())
            .field("closed", &self.tx.is_closed())
            .finish_non_exhaustive()
    }
}

impl<S, R> Endpoint<S, R> {
    /// Enqueues a message for the peer.
    pub async fn send(&mut self, msg: S) -> Result<(), ChannelError> {
        self.tx.send(msg).await.map_err(|_| ChannelError::Closed)?;

        if let Some(ready) = &self.ready {
            ready.notify_one();
        }

        Ok(())
    }

    /// Waits for the next message from the peer.
    pub async fn receive(&mut self) -> Result<R, ChannelError> {
        if let Some(msg) = self.peeked.take() {
            return Ok(msg);
        }

        self.rx.recv().await.ok_or(ChannelError::EndOfStream)
    }

    /// Returns whether a message is available without consuming it. Never
    /// blocks.
    ///
    /// Messages already buffered are still reported after the peer went
    /// away; only once they are drained does this fail with `EndOfStream`.
    pub fn poll(&mut self) -> Result<bool, ChannelError> {
        if self.peeked.is_some() {
            return Ok(true);
        }

        match self.rx.try_recv() {
            Ok(msg) => {
                self.peeked = Some(msg);
                Ok(true)
            }
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => Err(ChannelError::EndOfStream),
        }
    }

    /// Whether the peer's receiving half is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<S, R> Drop for Endpoint<S, R> {
    fn drop(&mut self) {
        // NOTE(jdb): Perform clean shutdown as recommended by tokio
        //
        // https://docs.rs/tokio/latest/tokio/sync/mpsc/index.html#clean-shutdown
        self.rx.close();
        while self.rx.try_recv().is_ok() {}

        if let Some(ready) = &self.ready {
            ready.notify_one();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn endpoints() -> (Endpoint<u32, String>, Endpoint<String, u32>, Arc<Notify>) {
        let ready = Arc::new(Notify::new());
        let (a, b) = pair(8, ready.clone());
        (a, b, ready)
    }

    #[tokio::test]
    async fn delivers_in_order_both_ways() {
        let (mut a, mut b, _) = endpoints();

        a.send(1).await.unwrap();
        a.send(2).await.unwrap();
        b.send("one".into()).await.unwrap();

        assert_eq!(b.receive().await.unwrap(), 1);
        assert_eq!(b.receive().await.unwrap(), 2);
        assert_eq!(a.receive().await.unwrap(), "one");
    }

    #[tokio::test]
    async fn poll_does_not_consume() {
        let (mut a, mut b, _) = endpoints();

        assert!(!a.poll().unwrap());
        b.send("hello".into()).await.unwrap();

        assert!(a.poll().unwrap());
        assert!(a.poll().unwrap());
        assert_eq!(a.receive().await.unwrap(), "hello");
        assert!(!a.poll().unwrap());
    }

    #[tokio::test]
    async fn buffered_messages_survive_peer_drop() {
        let (mut a, mut b, _) = endpoints();

        b.send("last".into()).await.unwrap();
        drop(b);

        assert!(a.poll().unwrap());
        assert_eq!(a.receive().await.unwrap(), "last");
        assert_eq!(a.poll(), Err(ChannelError::EndOfStream));
        assert_eq!(a.receive().await, Err(ChannelError::EndOfStream));
    }

    #[tokio::test]
    async fn send_to_dropped_peer_fails() {
        let (mut a, b, _) = endpoints();
        drop(b);

        assert!(a.is_closed());
        assert_eq!(a.send(1).await, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn worker_side_signals_readiness() {
        let (_a, mut b, ready) = endpoints();

        b.send("ping".into()).await.unwrap();

        // The permit stored by `notify_one` completes this immediately.
        tokio::time::timeout(std::time::Duration::from_secs(1), ready.notified())
            .await
            .unwrap();
    }
}

//! Termination-aware FIFO queue primitive (spec §5, §9).
//!
//! The reference implementation passes `None` through a
//! `multiprocessing.Queue` to signal end-of-stream, once per expected
//! consumer. Here that sentinel is reified as the `Item::End` variant so
//! the compiler, not a runtime `is None` check, enforces that every
//! consumer handles termination.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

#[derive(Debug, Clone)]
pub enum Item<T> {
    Value(T),
    End,
}

impl<T> Item<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Item::Value(v) => Some(v),
            Item::End => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Item::End)
    }
}

/// Producer handle. `put` never blocks in practice: the channel is
/// unbounded, matching the "memory-bounded by upstream rate" model of
/// §5.
#[derive(Clone)]
pub struct Sender<T> {
    inner: mpsc::UnboundedSender<Item<T>>,
    depth: Arc<AtomicUsize>,
}

impl<T> Sender<T> {
    pub fn put(&self, value: T) -> anyhow::Result<()> {
        self.inner
            .send(Item::Value(value))
            .map_err(|_| anyhow::anyhow!("queue closed: receiver dropped"))?;
        self.depth.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Enqueue one `End` sentinel. Call once per known consumer.
    pub fn close_one(&self) -> anyhow::Result<()> {
        self.inner
            .send(Item::End)
            .map_err(|_| anyhow::anyhow!("queue closed: receiver dropped"))?;
        self.depth.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Items (including unconsumed `End` sentinels) still sitting in the
    /// channel. Lets a supervisor poll queue depth without owning the
    /// receiving end (spec §4.1 "draining" wait).
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Enqueue `n` sentinels, one per consumer, as C5/C6 do when shutting
    /// down their downstream queue (spec §4.3, §4.4).
    pub fn close_n(&self, n: usize) -> anyhow::Result<()> {
        for _ in 0..n {
            self.close_one()?;
        }
        Ok(())
    }
}

pub struct Receiver<T> {
    inner: mpsc::UnboundedReceiver<Item<T>>,
    depth: Arc<AtomicUsize>,
}

impl<T> Receiver<T> {
    /// Block until an item arrives. Returns `None` once the channel itself
    /// is closed (all senders dropped) with no further `Item`s pending.
    pub async fn get(&mut self) -> Option<Item<T>> {
        let item = self.inner.recv().await;
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    /// Drain with a timeout, matching C5's `generation_timeout` /
    /// `get_waiting_first` use in the original `__result_processing`.
    pub async fn get_waiting(&mut self, wait: Duration) -> Option<Item<T>> {
        match timeout(wait, self.inner.recv()).await {
            Ok(item) => {
                if item.is_some() {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                }
                item
            }
            Err(_elapsed) => None,
        }
    }

    /// Drain everything currently buffered without waiting.
    pub fn drain_available(&mut self) -> Vec<Item<T>> {
        let mut out = Vec::new();
        while let Ok(item) = self.inner.try_recv() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            out.push(item);
        }
        out
    }

    /// Adapts this receiver into a [`Stream`] for callers that would
    /// rather drive the drain with combinators than a manual `while let`
    /// loop (e.g. the processed-task sink, which only needs to run to
    /// completion).
    pub fn into_stream(self) -> impl Stream<Item = Item<T>> {
        UnboundedReceiverStream::new(self.inner)
    }
}

pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        Sender {
            inner: tx,
            depth: depth.clone(),
        },
        Receiver { inner: rx, depth },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_returns_value() {
        let (tx, mut rx) = channel::<u32>();
        tx.put(7).unwrap();
        match rx.get().await {
            Some(Item::Value(v)) => assert_eq!(v, 7),
            other => panic!("expected Value(7), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_n_emits_one_sentinel_per_consumer() {
        let (tx, mut rx) = channel::<u32>();
        tx.close_n(3).unwrap();
        for _ in 0..3 {
            assert!(matches!(rx.get().await, Some(Item::End)));
        }
    }

    #[tokio::test]
    async fn get_waiting_times_out_when_empty() {
        let (_tx, mut rx) = channel::<u32>();
        let got = rx.get_waiting(Duration::from_millis(20)).await;
        assert!(got.is_none());
    }
}

//! Watch events and streams.
//!
//! A watch is a bounded channel: the producing task holds a [`WatchSink`],
//! the caller a [`WatchStream`]. Streams are not rewindable; once closed a
//! new watch must be opened, typically after a fresh list.

use crate::backend::{RawEvent, RawEventKind};
use crate::core::error::StorageError;
use crate::storage::object::Resource;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Kind of a watch event.
#[derive(Debug, Clone)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    /// Progress notification; the object is empty and only the revision
    /// is meaningful.
    Bookmark,
    /// Terminal error. Always the last event of a stream.
    Error(StorageError),
}

impl EventKind {
    /// Kind of a raw backend event: a put whose create and mod revisions are
    /// equal is an add.
    pub fn from_raw(raw: &RawEvent) -> Self {
        match raw.kind {
            RawEventKind::Put if raw.kv.create_revision == raw.kv.mod_revision => Self::Added,
            RawEventKind::Put => Self::Modified,
            RawEventKind::Delete => Self::Deleted,
        }
    }

    /// Short name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Bookmark => "BOOKMARK",
            Self::Error(_) => "ERROR",
        }
    }
}

/// One change delivered to a watcher.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub object: Resource,
    /// Backend revision of the change.
    pub revision: u64,
}

impl WatchEvent {
    /// Progress marker at `revision`.
    pub fn bookmark(revision: u64) -> Self {
        let mut object = Resource::default();
        object.metadata.resource_version = revision.to_string();
        Self {
            kind: EventKind::Bookmark,
            object,
            revision,
        }
    }

    /// Terminal error event.
    pub fn error(err: StorageError) -> Self {
        Self {
            kind: EventKind::Error(err),
            object: Resource::default(),
            revision: 0,
        }
    }
}

/// Consumer half of a watch.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::Receiver<WatchEvent>,
    cancel: CancellationToken,
}

impl WatchStream {
    /// Create a connected sink/stream pair. Cancelling `cancel` (or dropping
    /// the stream) tells the producer to stop.
    pub fn channel(capacity: usize, cancel: CancellationToken) -> (WatchSink, WatchStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            WatchSink {
                tx,
                cancel: cancel.clone(),
            },
            WatchStream { rx, cancel },
        )
    }

    /// Next event, or `None` once the producer has finished.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Receiver of the event channel.
    pub fn result_channel(&mut self) -> &mut mpsc::Receiver<WatchEvent> {
        &mut self.rx
    }

    /// Stop the watch. Events already buffered stay readable.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether [`stop`](Self::stop) was called or the request was cancelled.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Producer half of a watch.
#[derive(Debug, Clone)]
pub struct WatchSink {
    tx: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
}

impl WatchSink {
    /// Deliver an event, waiting for buffer space. Returns `false` when the
    /// consumer is gone or the watch was stopped.
    pub async fn send(&self, event: WatchEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    /// Deliver a terminal error event.
    pub async fn fail(&self, err: StorageError) {
        let _ = self.send(WatchEvent::error(err)).await;
    }

    /// Resolves when the consumer stops the watch.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Whether the consumer stopped the watch.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::KeyValue;
    use bytes::Bytes;

    fn raw(kind: RawEventKind, create: u64, modified: u64) -> RawEvent {
        RawEvent {
            kind,
            kv: KeyValue {
                key: "/k".into(),
                value: Bytes::new(),
                create_revision: create,
                mod_revision: modified,
                version: 1,
            },
            prev_kv: None,
        }
    }

    #[test]
    fn test_kind_from_raw() {
        assert!(matches!(EventKind::from_raw(&raw(RawEventKind::Put, 5, 5)), EventKind::Added));
        assert!(matches!(EventKind::from_raw(&raw(RawEventKind::Put, 5, 9)), EventKind::Modified));
        assert!(matches!(EventKind::from_raw(&raw(RawEventKind::Delete, 0, 9)), EventKind::Deleted));
    }

    #[tokio::test]
    async fn test_stop_unblocks_producer() {
        let (sink, stream) = WatchStream::channel(1, CancellationToken::new());
        assert!(sink.send(WatchEvent::bookmark(1)).await);
        stream.stop();
        // Buffer is full; send must return instead of waiting forever.
        assert!(!sink.send(WatchEvent::bookmark(2)).await);
        assert!(sink.is_cancelled());
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let cancel = CancellationToken::new();
        let (sink, stream) = WatchStream::channel(4, cancel.clone());
        drop(stream);
        assert!(cancel.is_cancelled());
        assert!(!sink.send(WatchEvent::bookmark(1)).await);
    }
}

/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Progress writers for the forge solver.
//!
//! A [`Writer`] accepts progress items; a [`MultiWriter`] fans each item
//! out to every attached writer; [`channel`] builds the pipe a client
//! reads its own progress stream from. Writers carry a process-unique
//! [`WriterId`] so callers can keep witness sets of what is already
//! attached where.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use allocative::Allocative;
use derive_more::Display;
use dupe::Dupe;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Process-unique identity of a writer.
#[derive(
    Clone, Dupe, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Allocative
)]
#[display("w{}", _0)]
pub struct WriterId(u64);

impl WriterId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub trait Writer<T>: Send + Sync {
    fn id(&self) -> WriterId;

    fn write(&self, value: T);

    /// No further writes will be delivered. Default is a no-op; pipe
    /// writers release their reader on close.
    fn close(&self) {}
}

/// Broadcasts each written item to every attached writer.
///
/// Items written through one `MultiWriter` are delivered in a total order:
/// the broadcast happens under the writer list lock. Attachment is not
/// deduplicated here; callers keep a witness set of [`WriterId`]s.
pub struct MultiWriter<T> {
    id: WriterId,
    writers: Mutex<Vec<Arc<dyn Writer<T>>>>,
}

impl<T> Default for MultiWriter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MultiWriter<T> {
    pub fn new() -> Self {
        Self {
            id: WriterId::next(),
            writers: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, writer: Arc<dyn Writer<T>>) {
        self.writers.lock().push(writer);
    }

    pub fn remove(&self, id: WriterId) {
        self.writers.lock().retain(|w| w.id() != id);
    }

    pub fn len(&self) -> usize {
        self.writers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.lock().is_empty()
    }
}

impl<T: Clone + Send + Sync> Writer<T> for MultiWriter<T> {
    fn id(&self) -> WriterId {
        self.id
    }

    fn write(&self, value: T) {
        let writers = self.writers.lock();
        for writer in writers.iter() {
            writer.write(value.clone());
        }
    }
}

/// Writer half of a progress pipe.
#[derive(Debug)]
pub struct ChannelWriter<T> {
    id: WriterId,
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
}

impl<T: Send + Sync> Writer<T> for ChannelWriter<T> {
    fn id(&self) -> WriterId {
        self.id
    }

    /// Writes after close, or after the reader went away, are dropped.
    fn write(&self, value: T) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ignore = sender.send(value);
        }
    }

    fn close(&self) {
        self.sender.lock().take();
    }
}

/// Reader half of a progress pipe.
#[derive(Debug)]
pub struct ProgressReader<T> {
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T> ProgressReader<T> {
    /// Next item, or `None` once the writer is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Everything currently buffered, without waiting.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(value) = self.receiver.try_recv() {
            out.push(value);
        }
        out
    }
}

/// An unbounded progress pipe.
pub fn channel<T: Send + Sync>() -> (Arc<ChannelWriter<T>>, ProgressReader<T>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        Arc::new(ChannelWriter {
            id: WriterId::next(),
            sender: Mutex::new(Some(sender)),
        }),
        ProgressReader { receiver },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multi_writer_broadcasts_in_order() {
        let (writer_a, mut reader_a) = channel::<u32>();
        let (writer_b, mut reader_b) = channel::<u32>();

        let mpw = MultiWriter::new();
        mpw.add(writer_a);
        mpw.write(1);
        mpw.add(writer_b);
        mpw.write(2);
        mpw.write(3);

        assert_eq!(reader_a.drain(), vec![1, 2, 3]);
        assert_eq!(reader_b.drain(), vec![2, 3]);
    }

    #[tokio::test]
    async fn removed_writer_stops_receiving() {
        let (writer, mut reader) = channel::<u32>();
        let id = writer.id();

        let mpw = MultiWriter::new();
        mpw.add(writer);
        mpw.write(1);
        mpw.remove(id);
        mpw.write(2);

        assert_eq!(reader.drain(), vec![1]);
    }

    #[tokio::test]
    async fn close_ends_reader() {
        let (writer, mut reader) = channel::<u32>();
        writer.write(1);
        writer.close();
        writer.write(2);

        assert_eq!(reader.recv().await, Some(1));
        assert_eq!(reader.recv().await, None);
    }

    #[test]
    fn writer_ids_are_unique() {
        let a = MultiWriter::<u32>::new();
        let b = MultiWriter::<u32>::new();
        assert_ne!(Writer::id(&a), Writer::id(&b));
    }
}

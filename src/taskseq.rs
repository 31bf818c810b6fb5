//! Fair merge over a dynamic set of child streams.
//!
//! `TaskSeq` keeps at most one outstanding `next()` per active stream and
//! yields the next completed one, rotating a cursor across streams so none
//! is starved. Streams can be added, removed and re-armed at runtime without
//! disturbing in-flight calls on the survivors. The merge has exactly one
//! consumer (the poller); control methods may be called from the core actor
//! concurrently. Critical sections never span an await.

use crate::error::MagnetarClientError;
use crate::message::{CompleteTopicName, Message};
use crate::stream::ChildStream;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

type NextFuture = BoxFuture<'static, (CompleteTopicName, Result<Message, MagnetarClientError>)>;

struct Entry {
    stream: Arc<ChildStream>,
    in_flight: Option<NextFuture>,
}

struct Inner {
    entries: Vec<Entry>,
    cursor: usize,
    waker: Option<Waker>,
}

impl Inner {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

fn arm(stream: Arc<ChildStream>) -> NextFuture {
    async move {
        let result = stream.next().await;
        (stream.topic().clone(), result)
    }
    .boxed()
}

#[derive(Clone)]
pub(crate) struct TaskSeq {
    inner: Arc<Mutex<Inner>>,
}

impl TaskSeq {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: Vec::new(),
                cursor: 0,
                waker: None,
            })),
        }
    }

    /// Introduce a new stream; its first `next()` is started immediately.
    pub fn add(&self, stream: ChildStream) {
        let stream = Arc::new(stream);
        let mut inner = self.inner.lock();
        inner.entries.push(Entry {
            in_flight: Some(arm(stream.clone())),
            stream,
        });
        inner.wake();
    }

    /// Detach the stream for `topic`. Its in-flight `next()` is dropped and
    /// never delivered.
    pub fn remove(&self, topic: &CompleteTopicName) {
        let mut inner = self.inner.lock();
        inner.entries.retain(|e| e.stream.topic() != topic);
        inner.cursor = 0;
    }

    /// Drop every in-flight `next()`. Used before seek/redeliver so that
    /// messages pulled before the position change are never delivered.
    pub fn cancel_in_flight(&self) {
        let mut inner = self.inner.lock();
        for entry in &mut inner.entries {
            entry.in_flight = None;
        }
    }

    /// Re-arm every stream that has no outstanding call.
    pub fn restart_completed(&self) {
        let mut inner = self.inner.lock();
        for entry in &mut inner.entries {
            if entry.in_flight.is_none() {
                entry.in_flight = Some(arm(entry.stream.clone()));
            }
        }
        inner.wake();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Await the next completed stream value. Single consumer only.
    pub fn next(&self) -> Next {
        Next { seq: self.clone() }
    }
}

pub(crate) struct Next {
    seq: TaskSeq,
}

impl Future for Next {
    type Output = (CompleteTopicName, Result<Message, MagnetarClientError>);

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.seq.inner.lock();
        let len = inner.entries.len();
        if len == 0 {
            inner.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let start = inner.cursor % len;
        for offset in 0..len {
            let idx = (start + offset) % len;
            let entry = &mut inner.entries[idx];
            let Some(fut) = entry.in_flight.as_mut() else {
                continue;
            };
            if let Poll::Ready(output) = fut.as_mut().poll(cx) {
                entry.in_flight = Some(arm(entry.stream.clone()));
                inner.cursor = (idx + 1) % len;
                return Poll::Ready(output);
            }
        }

        inner.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

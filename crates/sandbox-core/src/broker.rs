//! Replay buffer + broadcast fan-out for live command output.
//!
//! One stream per id (the conversation id). Late subscribers receive the
//! buffered history first and then switch to live updates; a finished
//! stream stays replayable for a grace window before it is dropped.

use std::{
    collections::{HashMap, VecDeque},
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    task::{Context, Poll},
    time::Duration,
};

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{OutputChunk, StreamEvent};

/// Live channel capacity per stream.
const CHANNEL_CAPACITY: usize = 10_000;

type StreamMap = Mutex<HashMap<String, Arc<StreamBuffer>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct StreamBuffer {
    state: Mutex<BufferState>,
}

/// Live event tagged with its position in the buffer.
#[derive(Clone)]
struct Envelope {
    generation: u64,
    /// Index into `BufferState::chunks`; `None` for `Done`.
    seq: Option<usize>,
    event: StreamEvent,
}

struct BufferState {
    chunks: Vec<OutputChunk>,
    closed: bool,
    /// Set by `start`; a buffer created by an early subscriber is not started.
    started: bool,
    /// Dropped on `end` so live subscribers terminate after `Done`.
    sender: Option<broadcast::Sender<Envelope>>,
    /// Bumped on every `start`; stale cleanups compare against it.
    generation: u64,
}

impl Default for BufferState {
    fn default() -> Self {
        Self {
            chunks: Vec::new(),
            closed: false,
            started: false,
            sender: Some(broadcast::channel(CHANNEL_CAPACITY).0),
            generation: 0,
        }
    }
}

/// Output stream broker.
pub struct OutputBroker {
    streams: Arc<StreamMap>,
    grace: Duration,
}

impl Default for OutputBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl OutputBroker {
    /// Create a broker whose finished streams stay replayable for `grace`.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            grace,
        }
    }

    fn entry(&self, id: &str) -> Arc<StreamBuffer> {
        Arc::clone(lock(&self.streams).entry(id.to_string()).or_default())
    }

    /// Begin a new execution's stream, discarding any previous output.
    pub fn start(&self, id: &str) {
        let buffer = self.entry(id);
        let mut state = lock(&buffer.state);
        state.chunks.clear();
        state.closed = false;
        state.started = true;
        state.generation += 1;
        if state.sender.is_none() {
            state.sender = Some(broadcast::channel(CHANNEL_CAPACITY).0);
        }
        tracing::debug!(stream = id, generation = state.generation, "output stream started");
    }

    /// Append a chunk and notify live subscribers.
    pub fn push(&self, id: &str, chunk: OutputChunk) {
        let buffer = self.entry(id);
        let mut state = lock(&buffer.state);
        if let Some(tx) = &state.sender {
            // No receivers is fine: the chunk stays in the buffer.
            let _ = tx.send(Envelope {
                generation: state.generation,
                seq: Some(state.chunks.len()),
                event: StreamEvent::from(chunk.clone()),
            });
        }
        state.chunks.push(chunk);
    }

    /// Subscribe to a stream: buffered history first, then live events.
    ///
    /// Snapshot and registration happen under the buffer lock, so no chunk
    /// pushed in between can be lost or duplicated. A subscriber that falls
    /// behind the live channel catches up from the buffer. Subscribing to an id
    /// that has not started yet waits for it. Dropping the subscription
    /// unsubscribes.
    #[must_use]
    pub fn subscribe(&self, id: &str) -> Subscription {
        let buffer = self.entry(id);
        let state = lock(&buffer.state);

        let mut replay: VecDeque<StreamEvent> = state.chunks.iter().cloned().map(StreamEvent::from).collect();
        let live = if state.closed {
            replay.push_back(StreamEvent::Done);
            None
        } else {
            state.sender.as_ref().map(|tx| BroadcastStream::new(tx.subscribe()))
        };

        Subscription {
            id: id.to_string(),
            replay,
            live,
            generation: state.generation,
            next_seq: state.chunks.len(),
            finished: false,
            buffer: Arc::clone(&buffer),
            streams: Arc::downgrade(&self.streams),
        }
    }

    /// Mark the stream finished, notify subscribers, and schedule cleanup.
    pub fn end(&self, id: &str) {
        let Some(buffer) = lock(&self.streams).get(id).cloned() else {
            tracing::debug!(stream = id, "end for unknown stream");
            return;
        };

        let generation = {
            let mut state = lock(&buffer.state);
            state.closed = true;
            if let Some(tx) = state.sender.take() {
                let _ = tx.send(Envelope {
                    generation: state.generation,
                    seq: None,
                    event: StreamEvent::Done,
                });
            }
            state.generation
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(stream = id, "no runtime to schedule stream cleanup");
            return;
        };

        let streams = Arc::downgrade(&self.streams);
        let grace = self.grace;
        let id = id.to_string();
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(streams) = streams.upgrade() else {
                return;
            };
            let mut map = lock(&streams);
            let expired = map.get(&id).is_some_and(|current| {
                let state = lock(&current.state);
                Arc::ptr_eq(current, &buffer) && state.closed && state.generation == generation
            });
            if expired {
                map.remove(&id);
                tracing::debug!(stream = %id, "output stream expired");
            }
        });
    }

    /// Whether a buffer exists for `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        lock(&self.streams).contains_key(id)
    }

    /// Buffered chunks for `id`, if any.
    #[must_use]
    pub fn history(&self, id: &str) -> Option<Vec<OutputChunk>> {
        let buffer = lock(&self.streams).get(id).cloned()?;
        let chunks = lock(&buffer.state).chunks.clone();
        Some(chunks)
    }
}

/// A live view of one stream. Ends after yielding [`StreamEvent::Done`].
pub struct Subscription {
    id: String,
    replay: VecDeque<StreamEvent>,
    live: Option<BroadcastStream<Envelope>>,
    /// Run being followed and the next chunk index expected from it.
    generation: u64,
    next_seq: usize,
    finished: bool,
    buffer: Arc<StreamBuffer>,
    streams: Weak<StreamMap>,
}

impl Subscription {
    /// Stream id this subscription follows.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue every buffered chunk not yet delivered.
    ///
    /// Called after the live channel overflowed. If the run has already
    /// finished, `Done` is queued too and the live channel is released.
    fn catch_up(&mut self) {
        let state = lock(&self.buffer.state);
        if state.generation != self.generation {
            self.generation = state.generation;
            self.next_seq = 0;
        }
        self.replay
            .extend(state.chunks.iter().skip(self.next_seq).cloned().map(StreamEvent::from));
        self.next_seq = state.chunks.len();
        if state.closed {
            self.replay.push_back(StreamEvent::Done);
            self.live = None;
        }
    }

    /// SSE stream (requires `sse` feature).
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn into_sse_stream(
        self,
    ) -> futures::stream::BoxStream<'static, Result<axum::response::sse::Event, std::convert::Infallible>> {
        self.map(|event| Ok(event.to_sse_event())).boxed()
    }
}

impl Stream for Subscription {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(event) = this.replay.pop_front() {
            this.finished = event.is_done();
            return Poll::Ready(Some(event));
        }

        loop {
            let Some(live) = this.live.as_mut() else {
                this.finished = true;
                return Poll::Ready(None);
            };

            match live.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(envelope))) => {
                    if envelope.generation != this.generation {
                        this.generation = envelope.generation;
                        this.next_seq = 0;
                    }
                    if let Some(seq) = envelope.seq {
                        // Already delivered by a catch-up.
                        if seq < this.next_seq {
                            continue;
                        }
                        this.next_seq = seq + 1;
                    }
                    this.finished = envelope.event.is_done();
                    return Poll::Ready(Some(envelope.event));
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                    tracing::debug!(stream = %this.id, missed, "subscriber lagged, catching up from buffer");
                    this.catch_up();
                    if let Some(event) = this.replay.pop_front() {
                        this.finished = event.is_done();
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.live = None;
        let Some(streams) = self.streams.upgrade() else {
            return;
        };
        // A subscriber that arrived before `start` created an empty buffer;
        // drop it again if nobody else is waiting on it.
        let mut map = lock(&streams);
        let unused = map.get(&self.id).is_some_and(|buffer| {
            let state = lock(&buffer.state);
            !state.started
                && state.chunks.is_empty()
                && state.sender.as_ref().is_none_or(|tx| tx.receiver_count() == 0)
        });
        if unused {
            map.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdout(data: &str) -> StreamEvent {
        StreamEvent::Stdout { data: data.to_string() }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_subscriber_gets_history_then_done() {
        let broker = OutputBroker::default();
        broker.start("c1");
        broker.push("c1", OutputChunk::stdout("A"));
        broker.push("c1", OutputChunk::stdout("B"));
        broker.end("c1");

        tokio::time::sleep(Duration::from_secs(5)).await;

        let events: Vec<_> = broker.subscribe("c1").collect().await;
        assert_eq!(events, vec![stdout("A"), stdout("B"), StreamEvent::Done]);
    }

    #[tokio::test]
    async fn test_join_in_progress() {
        let broker = OutputBroker::default();
        broker.start("c1");
        broker.push("c1", OutputChunk::stdout("A"));

        let sub = broker.subscribe("c1");
        broker.push("c1", OutputChunk::stderr("B"));
        broker.push("c1", OutputChunk::stdout("C"));
        broker.end("c1");

        let events: Vec<_> = sub.collect().await;
        assert_eq!(
            events,
            vec![
                stdout("A"),
                StreamEvent::Stderr { data: "B".to_string() },
                stdout("C"),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_slow_subscriber_receives_every_chunk() {
        let broker = OutputBroker::default();
        broker.start("c1");
        broker.push("c1", OutputChunk::stdout("first"));

        let sub = broker.subscribe("c1");
        let total = CHANNEL_CAPACITY * 2;
        for i in 1..total {
            broker.push("c1", OutputChunk::stdout(i.to_string()));
        }
        broker.end("c1");

        let events: Vec<_> = sub.collect().await;
        assert_eq!(events.len(), total + 1);
        assert_eq!(events[0], stdout("first"));
        for (i, event) in events.iter().enumerate().take(total).skip(1) {
            assert_eq!(*event, stdout(&i.to_string()));
        }
        assert_eq!(events[total], StreamEvent::Done);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_nothing_after_catching_up() {
        let broker = OutputBroker::default();
        broker.start("c1");
        let mut sub = broker.subscribe("c1");

        for i in 0..=CHANNEL_CAPACITY {
            broker.push("c1", OutputChunk::stdout(i.to_string()));
        }
        // Catch-up drains the buffer; the live events still queued are
        // duplicates and must be skipped.
        for i in 0..=CHANNEL_CAPACITY {
            assert_eq!(sub.next().await, Some(stdout(&i.to_string())));
        }

        broker.push("c1", OutputChunk::stdout("tail"));
        broker.end("c1");
        let rest: Vec<_> = sub.collect().await;
        assert_eq!(rest, vec![stdout("tail"), StreamEvent::Done]);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_affect_others() {
        let broker = OutputBroker::default();
        broker.start("c1");
        let mut leaving = broker.subscribe("c1");
        let staying = broker.subscribe("c1");

        broker.push("c1", OutputChunk::stdout("A"));
        assert_eq!(leaving.next().await, Some(stdout("A")));
        drop(leaving);

        broker.push("c1", OutputChunk::stdout("B"));
        broker.end("c1");

        let events: Vec<_> = staying.collect().await;
        assert_eq!(events, vec![stdout("A"), stdout("B"), StreamEvent::Done]);
    }

    #[tokio::test]
    async fn test_end_without_subscribers_still_closes_stream() {
        let broker = OutputBroker::default();
        broker.start("c1");
        drop(broker.subscribe("c1"));

        broker.push("c1", OutputChunk::stdout("A"));
        broker.end("c1");
        assert!(broker.contains("c1"));

        let events: Vec<_> = broker.subscribe("c1").collect().await;
        assert_eq!(events, vec![stdout("A"), StreamEvent::Done]);
    }

    #[tokio::test]
    async fn test_subscribe_before_start_receives_run() {
        let broker = OutputBroker::default();
        let sub = broker.subscribe("c1");

        broker.start("c1");
        broker.push("c1", OutputChunk::stdout("hello"));
        broker.end("c1");

        let events: Vec<_> = sub.collect().await;
        assert_eq!(events, vec![stdout("hello"), StreamEvent::Done]);
    }

    #[tokio::test]
    async fn test_streams_do_not_interleave() {
        let broker = OutputBroker::default();
        broker.start("a");
        broker.start("b");

        let sub = broker.subscribe("a");
        broker.push("b", OutputChunk::stdout("from b"));
        broker.push("a", OutputChunk::stdout("from a"));
        broker.end("b");
        broker.end("a");

        let events: Vec<_> = sub.collect().await;
        assert_eq!(events, vec![stdout("from a"), StreamEvent::Done]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_expires_after_grace() {
        let broker = OutputBroker::new(Duration::from_secs(10));
        broker.start("c1");
        broker.push("c1", OutputChunk::stdout("A"));
        broker.end("c1");
        assert!(broker.contains("c1"));

        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert!(!broker.contains("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resets_history_and_survives_old_cleanup() {
        let broker = OutputBroker::new(Duration::from_secs(10));
        broker.start("c1");
        broker.push("c1", OutputChunk::stdout("old"));
        broker.end("c1");

        tokio::time::sleep(Duration::from_secs(5)).await;
        broker.start("c1");
        broker.push("c1", OutputChunk::stdout("new"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(broker.history("c1"), Some(vec![OutputChunk::stdout("new")]));
    }

    #[tokio::test]
    async fn test_dropping_early_subscription_leaves_no_buffer() {
        let broker = OutputBroker::default();
        let sub = broker.subscribe("ghost");
        assert!(broker.contains("ghost"));
        drop(sub);
        assert!(!broker.contains("ghost"));
    }

    #[test]
    fn test_push_without_subscribers_is_retained() {
        let broker = OutputBroker::default();
        broker.start("c1");
        broker.push("c1", OutputChunk::stdout("kept"));
        assert_eq!(broker.history("c1").unwrap().len(), 1);
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Row payloads are positional against the process-wide column schema.
pub type Row = Vec<String>;

pub const QUEUE_CAPACITY: usize = 2 * 1024;

/// How long an append may wait on a full queue before the queue gives up
/// and closes itself (slow-consumer drop).
pub const APPEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Producer half of one client's replication queue.
///
/// Held by the [`QueueMap`] and cloned into fan-out paths; the matching
/// [`QueueDrain`] is owned by the client's push session.
pub struct Queue {
    id: String,
    tx: mpsc::Sender<Row>,
    closed: CancellationToken,
    map: Mutex<Weak<QueueMapInner>>,
}

impl Queue {
    pub fn new(id: impl Into<String>) -> (Arc<Self>, QueueDrain) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let queue = Arc::new(Self {
            id: id.into(),
            tx,
            closed: CancellationToken::new(),
            map: Mutex::new(Weak::new()),
        });
        let drain = QueueDrain {
            rx,
            queue: Arc::clone(&queue),
        };
        (queue, drain)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Enqueues one record. Appends to a closed queue are no-ops; an append
    /// that stays blocked for [`APPEND_TIMEOUT`] closes the queue and drops
    /// the record, so one stuck consumer cannot back up its producers.
    pub async fn append(self: &Arc<Self>, row: Row) {
        if self.is_closed() {
            return;
        }
        tokio::select! {
            res = self.tx.send(row) => {
                if res.is_err() {
                    self.close();
                }
            }
            () = tokio::time::sleep(APPEND_TIMEOUT) => {
                debug!(client = %self.id, "queue append timed out, closing");
                self.close();
            }
        }
    }

    /// Signals the terminal "closed" state and schedules the queue's
    /// eviction from its map. Idempotent.
    ///
    /// The eviction runs on a spawned task because close can fire inside a
    /// fan-out that already holds the map's read lock.
    pub fn close(self: &Arc<Self>) {
        self.closed.cancel();
        let weak = {
            let Ok(mut map) = self.map.lock() else { return };
            std::mem::take(&mut *map)
        };
        if let Some(inner) = weak.upgrade() {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                inner.evict(&queue).await;
            });
        }
    }

    fn attach(&self, inner: &Arc<QueueMapInner>) {
        if let Ok(mut map) = self.map.lock() {
            *map = Arc::downgrade(inner);
        }
    }
}

/// Consumer half of a [`Queue`]. One per push session.
pub struct QueueDrain {
    rx: mpsc::Receiver<Row>,
    queue: Arc<Queue>,
}

impl QueueDrain {
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Collects every record currently buffered, or waits up to `timeout`
    /// for at least one and returns promptly after it arrives.
    ///
    /// An empty result is a normal idle cycle. Once the queue has been
    /// closed and the buffer is empty this returns [`Error::QueueClosed`];
    /// records buffered before the close are still delivered first.
    pub async fn retrieve_timeout(&mut self, timeout: Duration) -> Result<Vec<Row>> {
        let mut batch = Vec::new();
        while let Ok(row) = self.rx.try_recv() {
            batch.push(row);
        }
        if !batch.is_empty() {
            return Ok(batch);
        }
        if self.queue.is_closed() {
            return Err(Error::QueueClosed);
        }

        tokio::select! {
            row = self.rx.recv() => {
                match row {
                    Some(row) => {
                        batch.push(row);
                        while let Ok(row) = self.rx.try_recv() {
                            batch.push(row);
                        }
                        Ok(batch)
                    }
                    None => Err(Error::QueueClosed),
                }
            }
            () = self.queue.closed.cancelled() => {
                while let Ok(row) = self.rx.try_recv() {
                    batch.push(row);
                }
                if batch.is_empty() {
                    Err(Error::QueueClosed)
                } else {
                    Ok(batch)
                }
            }
            () = tokio::time::sleep(timeout) => Ok(batch),
        }
    }
}

struct QueueMapInner {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
}

impl QueueMapInner {
    /// Removes `queue` only if it is still the registered queue for its
    /// identity, so a superseded queue closing late never evicts its
    /// successor.
    async fn evict(&self, queue: &Arc<Queue>) {
        let mut queues = self.queues.write().await;
        if let Some(current) = queues.get(queue.id())
            && Arc::ptr_eq(current, queue)
        {
            queues.remove(queue.id());
        }
    }
}

/// Process-wide registry of live client queues, keyed by client identity.
///
/// At most one live queue per identity; registering a new queue closes the
/// previous one, which its session observes as a terminal drain error.
#[derive(Clone)]
pub struct QueueMap {
    inner: Arc<QueueMapInner>,
}

impl QueueMap {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueMapInner {
                queues: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub async fn add(&self, queue: Arc<Queue>) {
        queue.attach(&self.inner);
        let previous = {
            let mut queues = self.inner.queues.write().await;
            queues.insert(queue.id().to_string(), queue)
        };
        if let Some(previous) = previous {
            debug!(client = %previous.id(), "queue superseded by new session");
            previous.close();
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Queue>> {
        self.inner.queues.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.queues.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.queues.read().await.is_empty()
    }

    /// Appends one record to every live queue. Runs under the map's shared
    /// lock; a queue that cannot take the record within [`APPEND_TIMEOUT`]
    /// closes itself, so the critical section is bounded per queue.
    pub async fn fan_out(&self, row: &Row) {
        let queues = self.inner.queues.read().await;
        for queue in queues.values() {
            queue.append(row.clone()).await;
        }
    }
}

impl Default for QueueMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(v: &str) -> Row {
        vec![v.to_string()]
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn records_are_drained_in_fifo_order() {
        let (queue, mut drain) = Queue::new("x");
        for i in 0..10 {
            queue.append(row(&i.to_string())).await;
        }

        let batch = drain.retrieve_timeout(Duration::from_millis(10)).await.unwrap();
        let got: Vec<String> = batch.into_iter().map(|mut r| r.remove(0)).collect();
        let want: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn empty_retrieve_times_out_with_no_records() {
        let (_queue, mut drain) = Queue::new("x");
        let batch = drain.retrieve_timeout(Duration::from_millis(5)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn retrieve_returns_promptly_after_first_record() {
        let (queue, mut drain) = Queue::new("x");
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            queue.append(row("late")).await;
        });

        let batch = drain.retrieve_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch, vec![row("late")]);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn buffered_records_are_delivered_before_closed() {
        let (queue, mut drain) = Queue::new("x");
        queue.append(row("a")).await;
        queue.append(row("b")).await;
        queue.close();
        queue.close(); // idempotent

        let batch = drain.retrieve_timeout(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 2);

        let err = drain
            .retrieve_timeout(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueClosed));
    }

    #[tokio::test]
    async fn append_after_close_is_a_noop() {
        let (queue, mut drain) = Queue::new("x");
        queue.close();
        queue.append(row("lost")).await;

        let err = drain
            .retrieve_timeout(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_append_closes_the_queue_within_a_second() {
        let (queue, mut drain) = Queue::new("x");
        for i in 0..QUEUE_CAPACITY {
            queue.append(row(&i.to_string())).await;
        }

        let started = tokio::time::Instant::now();
        queue.append(row("overflow")).await;
        assert!(queue.is_closed());
        assert_eq!(started.elapsed(), APPEND_TIMEOUT);

        // The buffered records still drain, then the close is observed.
        let mut total = 0;
        loop {
            match drain.retrieve_timeout(Duration::from_millis(10)).await {
                Ok(batch) => total += batch.len(),
                Err(Error::QueueClosed) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert_eq!(total, QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn map_add_then_get_returns_the_same_queue() {
        let map = QueueMap::new();
        let (queue, _drain) = Queue::new("x");
        map.add(Arc::clone(&queue)).await;

        let got = map.get("x").await.unwrap();
        assert!(Arc::ptr_eq(&got, &queue));
    }

    #[tokio::test]
    async fn add_supersedes_and_closes_the_previous_queue() {
        let map = QueueMap::new();
        let (first, mut first_drain) = Queue::new("x");
        let (second, _second_drain) = Queue::new("x");

        map.add(Arc::clone(&first)).await;
        map.add(Arc::clone(&second)).await;

        assert!(first.is_closed());
        let err = first_drain
            .retrieve_timeout(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueClosed));

        // The superseded queue's deferred eviction must not remove the
        // successor.
        settle().await;
        let got = map.get("x").await.unwrap();
        assert!(Arc::ptr_eq(&got, &second));
        assert_eq!(map.len().await, 1);
    }

    #[tokio::test]
    async fn closed_queue_is_evicted_from_the_map() {
        let map = QueueMap::new();
        let (queue, _drain) = Queue::new("x");
        map.add(Arc::clone(&queue)).await;

        queue.close();
        settle().await;
        assert!(map.get("x").await.is_none());
        assert_eq!(map.len().await, 0);
    }

    #[tokio::test]
    async fn fan_out_reaches_every_live_queue() {
        let map = QueueMap::new();
        let (x, mut x_drain) = Queue::new("x");
        let (y, mut y_drain) = Queue::new("y");
        map.add(x).await;
        map.add(y).await;

        map.fan_out(&row("42")).await;

        let got_x = x_drain.retrieve_timeout(Duration::from_millis(10)).await.unwrap();
        let got_y = y_drain.retrieve_timeout(Duration::from_millis(10)).await.unwrap();
        assert_eq!(got_x, vec![row("42")]);
        assert_eq!(got_y, vec![row("42")]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_is_dropped_without_blocking_peers() {
        let map = QueueMap::new();
        let (slow, _slow_drain) = Queue::new("slow");
        let (fast, mut fast_drain) = Queue::new("fast");
        map.add(Arc::clone(&slow)).await;
        map.add(fast).await;

        // The slow queue never drains; overflowing it closes it while the
        // fast queue keeps receiving.
        for i in 0..=QUEUE_CAPACITY {
            map.fan_out(&row(&i.to_string())).await;
            let batch = fast_drain
                .retrieve_timeout(Duration::from_millis(10))
                .await
                .unwrap();
            assert_eq!(batch.len(), 1);
        }

        assert!(slow.is_closed());
        settle().await;
        assert!(map.get("slow").await.is_none());
        assert!(map.get("fast").await.is_some());
    }
}

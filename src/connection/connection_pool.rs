use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::select;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info, trace};

use crate::error::TransportError;
use crate::metrics::{MetricsSink, TCP_PERMITS_AVAILABLE, UDP_PERMITS_AVAILABLE};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelKind {
    Udp,
    Tcp,
}

impl ChannelKind {
    fn gauge_name(&self) -> &'static str {
        match self {
            ChannelKind::Udp => UDP_PERMITS_AVAILABLE,
            ChannelKind::Tcp => TCP_PERMITS_AVAILABLE,
        }
    }
}

enum PoolCommand {
    Reserve {
        permits: usize,
        reply: oneshot::Sender<Result<ChannelHandle, TransportError>>,
    },
    /// completes once every command queued before it was processed
    Drain {
        done: oneshot::Sender<()>,
    },
}

/// Admission control for outbound channels: at most `max_permits` permits are handed out at any
///  given time.
///
/// Reservations are served strictly in the order they were submitted, by a single worker task.
///  A reservation that does not fit holds up all reservations behind it, even those that would
///  fit - without this, small reservations could starve big ones indefinitely in busy periods.
pub struct ConnectionPool {
    kind: ChannelKind,
    max_permits: usize,
    semaphore: Arc<Semaphore>,
    queue: mpsc::UnboundedSender<PoolCommand>,
    /// held for reading while a reservation is enqueued, and for writing while shutdown starts:
    ///  that way, every reservation is either enqueued before shutdown or rejected
    enqueue_lock: RwLock<()>,
    shutting_down: Arc<AtomicBool>,
    metrics: Arc<dyn MetricsSink>,
}

impl Debug for ConnectionPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionPool{{{:?}: {}/{} available}}", self.kind, self.available(), self.max_permits)
    }
}

impl ConnectionPool {
    /// Creates the pool and spawns its reservation worker, so this must be called from inside a
    ///  Tokio runtime.
    pub fn new(kind: ChannelKind, max_permits: usize, metrics: Arc<dyn MetricsSink>) -> ConnectionPool {
        let semaphore = Arc::new(Semaphore::new(max_permits));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let (queue, queue_recv) = mpsc::unbounded_channel();

        metrics.set_gauge(kind.gauge_name(), max_permits as u64);

        tokio::spawn(Self::run_reservation_worker(
            kind,
            semaphore.clone(),
            queue_recv,
            shutting_down.clone(),
            metrics.clone(),
        ));

        ConnectionPool {
            kind,
            max_permits,
            semaphore,
            queue,
            enqueue_lock: RwLock::new(()),
            shutting_down,
            metrics,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits until `permits` permits are available and all earlier reservations were served.
    ///
    /// Dropping the returned future before it completes cancels the reservation; permits that
    ///  were acquired on its behalf in the meantime are returned to the pool.
    pub async fn reserve(&self, permits: usize) -> Result<ChannelHandle, TransportError> {
        if permits > self.max_permits {
            return Err(TransportError::AdmissionDenied { requested: permits, max: self.max_permits });
        }

        let (reply, reply_recv) = oneshot::channel();
        {
            let _guard = self.enqueue_lock.read().await;
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(TransportError::ConnectionClosed);
            }
            self.queue.send(PoolCommand::Reserve { permits, reply })
                .map_err(|_| TransportError::ConnectionClosed)?;
        }

        reply_recv.await
            .map_err(|_| TransportError::ConnectionClosed)?
    }

    /// Rejects new reservations, fails reservations that are still queued, and waits for every
    ///  outstanding [ChannelHandle] to be released. A reservation the worker is already waiting
    ///  for is allowed to finish.
    pub async fn shutdown(&self) {
        self.close().await;
        self.wait_for_channels().await;
    }

    /// The first half of [ConnectionPool::shutdown]: once this returns, every new reservation
    ///  fails with [TransportError::ConnectionClosed]. Does not wait for anything except
    ///  reservations that are being enqueued concurrently.
    pub async fn close(&self) {
        let _guard = self.enqueue_lock.write().await;
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            info!("shutting down {:?} connection pool", self.kind);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// The second half of [ConnectionPool::shutdown]: waits until the queue is drained and every
    ///  permit is back. Callers that cannot wait indefinitely wrap this in a timeout; the pool
    ///  stays closed either way.
    pub async fn wait_for_channels(&self) {
        let (done, done_recv) = oneshot::channel();
        if self.queue.send(PoolCommand::Drain { done }).is_ok() {
            done_recv.await.ok();
        }

        // the semaphore is fair, so this waits for every permit that was handed out
        match self.semaphore.acquire_many(self.max_permits as u32).await {
            Ok(all) => {
                all.forget();
                self.semaphore.close();
                self.metrics.set_gauge(self.kind.gauge_name(), 0);
                debug!("{:?} connection pool shut down, all channels are closed", self.kind);
            }
            Err(_) => {
                trace!("{:?} connection pool was shut down concurrently", self.kind);
            }
        }
    }

    async fn run_reservation_worker(
        kind: ChannelKind,
        semaphore: Arc<Semaphore>,
        mut queue: mpsc::UnboundedReceiver<PoolCommand>,
        shutting_down: Arc<AtomicBool>,
        metrics: Arc<dyn MetricsSink>,
    ) {
        while let Some(command) = queue.recv().await {
            match command {
                PoolCommand::Reserve { permits, mut reply } => {
                    if shutting_down.load(Ordering::Acquire) {
                        reply.send(Err(TransportError::ConnectionClosed)).ok();
                        continue;
                    }

                    let permit = select! {
                        p = semaphore.clone().acquire_many_owned(permits as u32) => p,
                        _ = reply.closed() => {
                            trace!("{:?} reservation for {} permits was cancelled while waiting", kind, permits);
                            continue;
                        }
                    };
                    let Ok(permit) = permit else {
                        reply.send(Err(TransportError::ConnectionClosed)).ok();
                        continue;
                    };
                    metrics.set_gauge(kind.gauge_name(), semaphore.available_permits() as u64);

                    let (closed, _) = watch::channel(false);
                    let handle = ChannelHandle {
                        kind,
                        permit: Some(permit),
                        permits,
                        closed,
                        semaphore: semaphore.clone(),
                        metrics: metrics.clone(),
                    };

                    // if the caller is gone, dropping the handle returns the permits
                    if reply.send(Ok(handle)).is_err() {
                        trace!("{:?} reservation for {} permits was cancelled after it was granted", kind, permits);
                    }
                }
                PoolCommand::Drain { done } => {
                    done.send(()).ok();
                }
            }
        }
        trace!("{:?} reservation worker terminated", kind);
    }
}

/// The right to hold `permits` outbound channels. Permits go back to the pool when the handle is
///  released or dropped, whichever happens first; releasing twice is a no-op.
pub struct ChannelHandle {
    kind: ChannelKind,
    permit: Option<OwnedSemaphorePermit>,
    permits: usize,
    closed: watch::Sender<bool>,
    semaphore: Arc<Semaphore>,
    metrics: Arc<dyn MetricsSink>,
}

impl Debug for ChannelHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelHandle{{{:?}: {} permits{}}}", self.kind, self.permits, if self.is_released() { ", released" } else { "" })
    }
}

impl ChannelHandle {
    pub fn permits(&self) -> usize {
        self.permits
    }

    pub fn is_released(&self) -> bool {
        self.permit.is_none()
    }

    /// Returns the permits to the pool, and only then signals close to listeners.
    pub fn release(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            self.metrics.set_gauge(self.kind.gauge_name(), self.semaphore.available_permits() as u64);
            self.closed.send_replace(true);
        }
    }

    pub fn close_listener(&self) -> ChannelClosed {
        ChannelClosed(self.closed.subscribe())
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Completes once the handle it was created from is released. The permits are back in the pool
///  by the time this completes.
#[derive(Clone)]
pub struct ChannelClosed(watch::Receiver<bool>);

impl ChannelClosed {
    pub async fn wait(mut self) {
        // an error means the handle is gone, and dropping it released it
        self.0.wait_for(|closed| *closed).await.ok();
    }

    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::runtime::Builder;
    use tokio::time::{sleep, timeout};

    use crate::metrics::{CountingMetrics, NoopMetrics};

    use super::*;

    fn pool(max_permits: usize) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(ChannelKind::Udp, max_permits, Arc::new(NoopMetrics)))
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_reserve_more_than_max_fails_fast() {
        paused_runtime().block_on(async {
            let pool = pool(2);
            match pool.reserve(3).await {
                Err(TransportError::AdmissionDenied { requested, max }) => {
                    assert_eq!(requested, 3);
                    assert_eq!(max, 2);
                }
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(pool.available(), 2);
        });
    }

    #[test]
    fn test_second_reservation_waits_for_release() {
        paused_runtime().block_on(async {
            let pool = pool(1);
            let mut first = pool.reserve(1).await.unwrap();
            assert_eq!(pool.available(), 0);

            let granted = Arc::new(AtomicBool::new(false));
            let second = tokio::spawn({
                let pool = pool.clone();
                let granted = granted.clone();
                async move {
                    let handle = pool.reserve(1).await.unwrap();
                    granted.store(true, Ordering::SeqCst);
                    handle
                }
            });

            sleep(Duration::from_millis(100)).await;
            assert!(!granted.load(Ordering::SeqCst));

            first.release();
            let second = second.await.unwrap();
            assert!(granted.load(Ordering::SeqCst));
            assert_eq!(second.permits(), 1);
            drop(second);
            assert_eq!(pool.available(), 1);
        });
    }

    #[test]
    fn test_reservations_are_served_in_submission_order() {
        paused_runtime().block_on(async {
            let pool = pool(2);
            let mut blocker = pool.reserve(1).await.unwrap();

            let (order_send, mut order) = mpsc::unbounded_channel();

            // the big reservation is submitted first and does not fit yet - the small one behind
            //  it would fit, but must not overtake it
            let big = tokio::spawn({
                let pool = pool.clone();
                let order_send = order_send.clone();
                async move {
                    let handle = pool.reserve(2).await.unwrap();
                    order_send.send("big").unwrap();
                    sleep(Duration::from_millis(50)).await;
                    drop(handle);
                }
            });
            sleep(Duration::from_millis(10)).await;
            let small = tokio::spawn({
                let pool = pool.clone();
                async move {
                    let _handle = pool.reserve(1).await.unwrap();
                    order_send.send("small").unwrap();
                }
            });

            sleep(Duration::from_millis(100)).await;
            assert!(order.try_recv().is_err());

            blocker.release();
            big.await.unwrap();
            small.await.unwrap();

            assert_eq!(order.recv().await, Some("big"));
            assert_eq!(order.recv().await, Some("small"));
            assert_eq!(pool.available(), 2);
        });
    }

    #[test]
    fn test_cancelled_reservation_returns_permits() {
        paused_runtime().block_on(async {
            let pool = pool(1);
            let mut blocker = pool.reserve(1).await.unwrap();

            assert!(timeout(Duration::from_millis(50), pool.reserve(1)).await.is_err());

            blocker.release();
            sleep(Duration::from_millis(10)).await;
            assert_eq!(pool.available(), 1);

            let handle = pool.reserve(1).await.unwrap();
            drop(handle);
            assert_eq!(pool.available(), 1);
        });
    }

    #[test]
    fn test_permit_conservation_under_concurrency() {
        paused_runtime().block_on(async {
            let pool = pool(3);
            let completed = Arc::new(AtomicUsize::new(0));

            let mut tasks = Vec::new();
            for i in 0..30usize {
                let pool = pool.clone();
                let completed = completed.clone();
                tasks.push(tokio::spawn(async move {
                    let permits = 1 + i % 3;
                    // every third reservation gives up early
                    let wait = if i % 3 == 0 { Duration::from_millis(5) } else { Duration::from_secs(60) };
                    if let Ok(Ok(mut handle)) = timeout(wait, pool.reserve(permits)).await {
                        sleep(Duration::from_millis(1 + (i as u64 % 4))).await;
                        if i % 2 == 0 {
                            handle.release();
                            handle.release();
                        }
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }
            for t in tasks {
                t.await.unwrap();
            }

            sleep(Duration::from_millis(10)).await;
            assert!(completed.load(Ordering::SeqCst) >= 20);
            assert_eq!(pool.available(), 3);
        });
    }

    #[test]
    fn test_close_listener_fires_after_permits_are_back() {
        paused_runtime().block_on(async {
            let pool = pool(1);
            let mut handle = pool.reserve(1).await.unwrap();
            let closed = handle.close_listener();

            let observer = tokio::spawn({
                let pool = pool.clone();
                async move {
                    closed.wait().await;
                    pool.available()
                }
            });

            sleep(Duration::from_millis(10)).await;
            handle.release();
            assert_eq!(observer.await.unwrap(), 1);
        });
    }

    #[test]
    fn test_close_listener_fires_on_drop() {
        paused_runtime().block_on(async {
            let pool = pool(1);
            let handle = pool.reserve(1).await.unwrap();
            let closed = handle.close_listener();
            drop(handle);
            timeout(Duration::from_millis(10), closed.wait()).await.unwrap();
        });
    }

    #[test]
    fn test_shutdown_drains_queue_and_waits_for_handles() {
        paused_runtime().block_on(async {
            let pool = pool(1);
            let mut blocker = pool.reserve(1).await.unwrap();

            // the worker is waiting for permits on behalf of this one
            let in_flight = tokio::spawn({
                let pool = pool.clone();
                async move { pool.reserve(1).await }
            });
            sleep(Duration::from_millis(10)).await;
            // ... and this one is still queued
            let queued = tokio::spawn({
                let pool = pool.clone();
                async move { pool.reserve(1).await }
            });
            sleep(Duration::from_millis(10)).await;

            let shutdown = tokio::spawn({
                let pool = pool.clone();
                async move { pool.shutdown().await }
            });
            sleep(Duration::from_millis(10)).await;

            assert!(matches!(pool.reserve(1).await, Err(TransportError::ConnectionClosed)));

            blocker.release();
            let in_flight = in_flight.await.unwrap().unwrap();
            assert!(matches!(queued.await.unwrap(), Err(TransportError::ConnectionClosed)));

            sleep(Duration::from_millis(10)).await;
            assert!(!shutdown.is_finished());

            drop(in_flight);
            timeout(Duration::from_millis(100), shutdown).await.unwrap().unwrap();

            assert!(matches!(pool.reserve(1).await, Err(TransportError::ConnectionClosed)));
        });
    }

    #[test]
    fn test_close_rejects_reservations_while_channels_are_open() {
        paused_runtime().block_on(async {
            let pool = pool(2);
            let handle = pool.reserve(1).await.unwrap();

            timeout(Duration::from_millis(10), pool.close()).await.unwrap();
            assert!(pool.is_closed());
            assert!(matches!(pool.reserve(1).await, Err(TransportError::ConnectionClosed)));

            // the open handle keeps the pool from being fully shut down, but not from being closed
            assert!(timeout(Duration::from_secs(1), pool.wait_for_channels()).await.is_err());
            assert!(matches!(pool.reserve(1).await, Err(TransportError::ConnectionClosed)));

            drop(handle);
            timeout(Duration::from_millis(10), pool.wait_for_channels()).await.unwrap();
        });
    }

    #[test]
    fn test_available_gauge() {
        paused_runtime().block_on(async {
            let metrics = Arc::new(CountingMetrics::default());
            let pool = ConnectionPool::new(ChannelKind::Tcp, 4, metrics.clone());
            assert_eq!(metrics.get(TCP_PERMITS_AVAILABLE), 4);

            let handle = pool.reserve(3).await.unwrap();
            assert_eq!(metrics.get(TCP_PERMITS_AVAILABLE), 1);
            drop(handle);
            assert_eq!(metrics.get(TCP_PERMITS_AVAILABLE), 4);
        });
    }
}

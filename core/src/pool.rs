//! Bounded worker pool
//!
//! A fixed number of tokio tasks consume jobs from one shared queue and run the
//! same async function over each input. A worker that produced a result stays
//! parked on that job until the caller releases it, so the number of jobs held
//! at any time never exceeds the pool size and callers decide the pace.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};

type SharedQueue<In, Out> = Arc<tokio::sync::Mutex<mpsc::Receiver<Job<In, Out>>>>;

/// One unit of work travelling through the queue
struct Job<In, Out> {
    input: In,
    token: CancellationToken,
    result_tx: oneshot::Sender<BridgeResult<Out>>,
    done_rx: oneshot::Receiver<()>,
}

/// Caller side of a submitted job
///
/// The result can be read once. The worker that ran the job is released by
/// [`JobHandle::done`] or by dropping the handle.
pub struct JobHandle<Out> {
    result_rx: Option<oneshot::Receiver<BridgeResult<Out>>>,
    done_tx: Option<oneshot::Sender<()>>,
}

impl<Out> JobHandle<Out> {
    /// Wait for the job result
    ///
    /// Cancel-safe: if the returned future is dropped before completion the
    /// result can still be awaited later.
    pub async fn result(&mut self) -> BridgeResult<Out> {
        let rx = self
            .result_rx
            .as_mut()
            .ok_or_else(|| BridgeError::invalid_state("job result already taken"))?;

        let result = rx.await;
        self.result_rx = None;

        result.map_err(|_| BridgeError::PoolClosed)?
    }

    /// Wait for the result unless `token` is cancelled first
    async fn result_until(&mut self, token: &CancellationToken) -> BridgeResult<Out> {
        tokio::select! {
            biased;
            result = self.result() => result,
            _ = token.cancelled() => Err(BridgeError::JobCancelled),
        }
    }

    /// Release the worker that ran this job
    pub fn done(mut self) {
        if let Some(done_tx) = self.done_tx.take() {
            let _ = done_tx.send(());
        }
    }
}

/// Bounded pool of workers executing a fixed function
pub struct WorkerPool<In, Out> {
    /// Job queue; `None` once closed
    queue: Mutex<Option<mpsc::Sender<Job<In, Out>>>>,
    /// Worker task handles
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Number of workers
    size: usize,
}

impl<In, Out> WorkerPool<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Create a new pool with `size` workers running `work`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F, Fut>(size: usize, work: F) -> Self
    where
        F: Fn(CancellationToken, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BridgeResult<Out>> + Send + 'static,
    {
        let size = size.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(size);
        let queue_rx: SharedQueue<In, Out> = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let work = Arc::new(work);

        let workers = (0..size)
            .map(|index| tokio::spawn(run_worker(index, queue_rx.clone(), work.clone())))
            .collect();

        debug!("Started worker pool with {} workers", size);

        Self {
            queue: Mutex::new(Some(queue_tx)),
            workers: Mutex::new(workers),
            size,
        }
    }

    /// Number of workers in the pool
    pub fn size(&self) -> usize {
        self.size
    }

    /// Submit a job. Blocks while the queue is full, or until `token` is
    /// cancelled.
    pub async fn new_job(&self, token: CancellationToken, input: In) -> BridgeResult<JobHandle<Out>> {
        let queue = self.queue.lock().clone().ok_or(BridgeError::PoolClosed)?;

        let (result_tx, result_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let cancelled = token.clone();

        let job = Job {
            input,
            token,
            result_tx,
            done_rx,
        };

        tokio::select! {
            sent = queue.send(job) => sent.map_err(|_| BridgeError::PoolClosed)?,
            _ = cancelled.cancelled() => return Err(BridgeError::JobCancelled),
        }

        Ok(JobHandle {
            result_rx: Some(result_rx),
            done_tx: Some(done_tx),
        })
    }

    /// Submit one job and wait for its result
    pub async fn process_one(&self, token: &CancellationToken, input: In) -> BridgeResult<Out> {
        let mut job = self.new_job(token.clone(), input).await?;
        let result = job.result_until(token).await;
        job.done();
        result
    }

    /// Submit all inputs and invoke `callback` as each job completes.
    ///
    /// The first error returned by a callback cancels every outstanding job of
    /// this call. Only that first error is returned; later ones are dropped.
    /// Callback order across jobs is unspecified.
    pub async fn process<C>(&self, token: &CancellationToken, inputs: Vec<In>, callback: C) -> BridgeResult<()>
    where
        In: Clone,
        C: Fn(&In, BridgeResult<Out>) -> BridgeResult<()>,
    {
        let token = token.child_token();
        let callback = &callback;

        let mut pending: FuturesUnordered<_> = inputs
            .into_iter()
            .map(|input| {
                let token = token.clone();
                async move {
                    let mut job = match self.new_job(token.clone(), input.clone()).await {
                        Ok(job) => job,
                        Err(err) if err.is_cancellation() => return callback(&input, Err(err)),
                        Err(err) => return Err(err),
                    };
                    let result = job.result_until(&token).await;
                    let outcome = callback(&input, result);
                    job.done();
                    outcome
                }
            })
            .collect();

        let mut first_err = None;

        while let Some(outcome) = pending.next().await {
            if let Err(err) = outcome {
                token.cancel();
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Submit all inputs and collect their outputs
    pub async fn process_all(&self, token: &CancellationToken, inputs: Vec<In>) -> BridgeResult<HashMap<In, Out>>
    where
        In: Clone + Eq + Hash,
    {
        let outputs = Mutex::new(HashMap::with_capacity(inputs.len()));

        self.process(token, inputs, |input, result| {
            let output = result?;
            outputs.lock().insert(input.clone(), output);
            Ok(())
        })
        .await?;

        Ok(outputs.into_inner())
    }

    /// Stop accepting jobs and wait for the workers to drain the queue.
    ///
    /// Jobs whose handles are still held keep their worker parked until they
    /// are released.
    pub async fn close(&self) {
        drop(self.queue.lock().take());

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                warn!("Pool worker terminated abnormally: {}", err);
            }
        }
    }
}

async fn run_worker<In, Out, F, Fut>(index: usize, queue: SharedQueue<In, Out>, work: Arc<F>)
where
    F: Fn(CancellationToken, In) -> Fut,
    Fut: Future<Output = BridgeResult<Out>>,
{
    loop {
        let job = queue.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        let Job {
            input,
            token,
            result_tx,
            done_rx,
        } = job;

        let result = if token.is_cancelled() {
            Err(BridgeError::JobCancelled)
        } else {
            work(token, input).await
        };

        // A dropped handle also drops its done sender, which releases us.
        let _ = result_tx.send(result);
        let _ = done_rx.await;
    }

    debug!("Pool worker {} exited", index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    fn doubling_pool(size: usize) -> WorkerPool<u32, u32> {
        WorkerPool::new(size, |_token, input: u32| async move { Ok(input * 2) })
    }

    #[tokio::test]
    async fn test_process_one() {
        let pool = doubling_pool(2);
        let token = CancellationToken::new();

        assert_eq!(pool.process_one(&token, 21).await.unwrap(), 42);
        assert_eq!(pool.size(), 2);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_work_error_is_returned() {
        let pool: WorkerPool<u32, u32> =
            WorkerPool::new(1, |_token, _input| async move { Err(BridgeError::api(500, "boom")) });
        let token = CancellationToken::new();

        let err = pool.process_one(&token, 1).await.unwrap_err();
        assert!(matches!(err, BridgeError::Api { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_backpressure_until_done() {
        let pool = doubling_pool(2);
        let token = CancellationToken::new();

        let mut first = pool.new_job(token.clone(), 1).await.unwrap();
        let mut second = pool.new_job(token.clone(), 2).await.unwrap();
        let mut third = pool.new_job(token.clone(), 3).await.unwrap();
        let mut fourth = pool.new_job(token.clone(), 4).await.unwrap();

        assert_eq!(first.result().await.unwrap(), 2);
        assert_eq!(second.result().await.unwrap(), 4);

        // Both workers are parked on unreleased jobs.
        assert_err!(timeout(Duration::from_millis(50), third.result()).await);

        first.done();

        let value = assert_ok!(timeout(Duration::from_secs(1), third.result()).await);
        assert_eq!(value.unwrap(), 6);
        assert_err!(timeout(Duration::from_millis(50), fourth.result()).await);

        second.done();
        third.done();

        let value = assert_ok!(timeout(Duration::from_secs(1), fourth.result()).await);
        assert_eq!(value.unwrap(), 8);
        fourth.done();

        pool.close().await;
    }

    #[tokio::test]
    async fn test_result_can_only_be_taken_once() {
        let pool = doubling_pool(1);
        let mut job = pool.new_job(CancellationToken::new(), 5).await.unwrap();

        assert_eq!(job.result().await.unwrap(), 10);
        assert!(matches!(job.result().await, Err(BridgeError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_cancelled_job_fails_fast() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let pool: WorkerPool<u32, u32> = WorkerPool::new(1, move |_token, input| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(input) }
        });

        let token = CancellationToken::new();
        token.cancel();

        let err = pool.process_one(&token, 1).await.unwrap_err();
        assert!(matches!(err, BridgeError::JobCancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_process_cancels_outstanding_jobs_on_error() {
        let pool: WorkerPool<u32, u32> = WorkerPool::new(2, |token: CancellationToken, input: u32| async move {
            if input == 1 {
                return Ok(input);
            }

            token.cancelled().await;
            Err(BridgeError::JobCancelled)
        });

        let token = CancellationToken::new();
        let cancelled = AtomicUsize::new(0);

        let result = pool
            .process(&token, vec![1, 2, 3, 4], |input, result| match result {
                Ok(_) if *input == 1 => Err(BridgeError::api(500, "callback failed")),
                Ok(_) => Ok(()),
                Err(err) => {
                    assert!(err.is_cancellation());
                    cancelled.fetch_add(1, Ordering::SeqCst);
                    Err(err)
                }
            })
            .await;

        assert!(matches!(result, Err(BridgeError::Api { status: 500, .. })));
        assert_eq!(cancelled.load(Ordering::SeqCst), 3);
        assert!(!token.is_cancelled());

        pool.close().await;
    }

    #[tokio::test]
    async fn test_process_all_collects_outputs() {
        let pool = doubling_pool(3);
        let token = CancellationToken::new();

        let outputs = pool.process_all(&token, (1..=10).collect()).await.unwrap();

        assert_eq!(outputs.len(), 10);
        for input in 1..=10 {
            assert_eq!(outputs[&input], input * 2);
        }
    }

    #[tokio::test]
    async fn test_cancel_releases_caller_blocked_on_full_queue() {
        let pool = doubling_pool(1);
        let token = CancellationToken::new();

        // The only worker is parked on an unreleased job and the queue is full.
        let mut held = pool.new_job(token.clone(), 1).await.unwrap();
        assert_eq!(held.result().await.unwrap(), 2);
        let _queued = pool.new_job(token.clone(), 2).await.unwrap();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = assert_ok!(timeout(Duration::from_secs(1), pool.process_one(&token, 3)).await);
        assert!(matches!(outcome, Err(BridgeError::JobCancelled)));

        held.done();
    }

    #[tokio::test]
    async fn test_cancel_releases_caller_waiting_for_result() {
        let pool: WorkerPool<u32, u32> = WorkerPool::new(1, |_token, input| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(input)
        });
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = assert_ok!(timeout(Duration::from_secs(1), pool.process_one(&token, 1)).await);
        assert!(matches!(outcome, Err(BridgeError::JobCancelled)));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_jobs() {
        let pool = doubling_pool(2);
        pool.close().await;

        let err = pool.process_one(&CancellationToken::new(), 1).await.unwrap_err();
        assert!(matches!(err, BridgeError::PoolClosed));
    }
}

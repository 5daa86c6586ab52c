//! Background TWAP job runner.
//!
//! Each job runs on its own worker task: slices are placed strictly in
//! order, each slice gets its own retry budget, and cancellation is
//! cooperative - the token is checked before every slice and raced against
//! the inter-slice sleep, so cancellation latency is bounded by one
//! checkpoint, never by a full sleep. An in-flight adapter call is never
//! interrupted; cancellation only prevents future slices from starting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{SlicePlan, TwapError};
use crate::adapter::ExchangeAdapter;
use crate::broker::{Backoff, Broker, RetryPolicy};
use crate::models::{Order, OrderSide, PlaceOrderRequest, TwapRequest};

/// TWAP job lifecycle state.
///
/// `Running` transitions to exactly one of the terminal states and never
/// re-enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TwapJobStatus {
    /// Worker is placing slices.
    Running,
    /// All slices placed.
    Completed,
    /// Cancelled at a checkpoint before completion.
    Canceled,
    /// A slice failed after exhausting its retries.
    Failed,
}

impl TwapJobStatus {
    /// True for the end states.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for TwapJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One multi-slice execution plan and its progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwapJob {
    /// Job id.
    pub job_id: String,
    /// Symbol traded by every slice.
    pub symbol: String,
    /// Side of every slice.
    pub side: OrderSide,
    /// Total amount across all slices.
    pub total_amount: Decimal,
    /// Number of slices.
    pub slices: u32,
    /// Current state.
    pub status: TwapJobStatus,
    /// Broker responses for the slices placed so far, in order.
    pub results: Vec<Order>,
    /// Failure reason, set when `status` is `Failed`.
    pub error: Option<String>,
    /// When the job started.
    pub started_at: DateTime<Utc>,
}

struct JobEntry {
    job: TwapJob,
    token: CancellationToken,
}

type JobTable = Arc<RwLock<HashMap<String, JobEntry>>>;

/// Background TWAP execution engine with an in-memory job table.
pub struct TwapRunner<A: ExchangeAdapter + 'static> {
    broker: Arc<Broker<A>>,
    policy: RetryPolicy,
    jobs: JobTable,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<A: ExchangeAdapter + 'static> TwapRunner<A> {
    /// Create a runner with the TWAP retry policy.
    #[must_use]
    pub fn new(broker: Arc<Broker<A>>) -> Self {
        Self {
            broker,
            policy: RetryPolicy::twap(),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Override the per-slice retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start a job and return its id.
    ///
    /// # Errors
    ///
    /// Plan validation errors ([`TwapError::InvalidSlices`],
    /// [`TwapError::InvalidAmount`]).
    pub fn start_job(&self, request: &TwapRequest) -> Result<String, TwapError> {
        let plan = SlicePlan::new(request.total_amount, request.slices)?;
        let delay = Duration::from_secs(request.duration_seconds) / request.slices;

        let job_id = format!("twap-{}", Uuid::new_v4());
        let token = CancellationToken::new();
        let job = TwapJob {
            job_id: job_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            total_amount: request.total_amount,
            slices: request.slices,
            status: TwapJobStatus::Running,
            results: Vec::new(),
            error: None,
            started_at: Utc::now(),
        };

        self.jobs.write().insert(
            job_id.clone(),
            JobEntry {
                job,
                token: token.clone(),
            },
        );

        info!(
            job_id = %job_id,
            symbol = %request.symbol,
            slices = request.slices,
            total = %request.total_amount,
            "twap job started"
        );

        let handle = tokio::spawn(run_job(
            Arc::clone(&self.broker),
            self.policy.clone(),
            Arc::clone(&self.jobs),
            job_id.clone(),
            request.symbol.clone(),
            request.side,
            plan,
            delay,
            token,
        ));
        self.handles.lock().push(handle);

        Ok(job_id)
    }

    /// Request cooperative cancellation of a running job.
    ///
    /// Takes effect at the worker's next checkpoint; slices already placed
    /// stay in the results.
    ///
    /// # Errors
    ///
    /// [`TwapError::JobNotFound`] for an unknown id,
    /// [`TwapError::AlreadyTerminal`] for a finished job.
    pub fn cancel_job(&self, job_id: &str) -> Result<(), TwapError> {
        let jobs = self.jobs.read();
        let entry = jobs.get(job_id).ok_or_else(|| TwapError::JobNotFound {
            job_id: job_id.to_string(),
        })?;

        if entry.job.status.is_terminal() {
            return Err(TwapError::AlreadyTerminal {
                job_id: job_id.to_string(),
            });
        }

        info!(job_id, "twap job cancellation requested");
        entry.token.cancel();
        Ok(())
    }

    /// Current status of a job.
    #[must_use]
    pub fn get_status(&self, job_id: &str) -> Option<TwapJobStatus> {
        self.jobs.read().get(job_id).map(|e| e.job.status)
    }

    /// Slice results placed so far, in order.
    #[must_use]
    pub fn get_results(&self, job_id: &str) -> Option<Vec<Order>> {
        self.jobs.read().get(job_id).map(|e| e.job.results.clone())
    }

    /// Full snapshot of one job.
    #[must_use]
    pub fn get_job(&self, job_id: &str) -> Option<TwapJob> {
        self.jobs.read().get(job_id).map(|e| e.job.clone())
    }

    /// Snapshot of every tracked job.
    #[must_use]
    pub fn list_jobs(&self) -> Vec<TwapJob> {
        self.jobs.read().values().map(|e| e.job.clone()).collect()
    }

    /// Cancel every running job and wait (bounded) for the workers.
    pub async fn shutdown(&self, timeout: Duration) {
        for entry in self.jobs.read().values() {
            entry.token.cancel();
        }

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("twap worker did not stop within timeout");
            }
        }
    }
}

/// Outcome of one slice after its retry budget.
enum SliceFailure {
    Cancelled,
    Failed(String),
}

#[allow(clippy::too_many_arguments)]
async fn run_job<A: ExchangeAdapter>(
    broker: Arc<Broker<A>>,
    policy: RetryPolicy,
    jobs: JobTable,
    job_id: String,
    symbol: String,
    side: OrderSide,
    plan: SlicePlan,
    delay: Duration,
    token: CancellationToken,
) {
    let total = plan.len();

    for (index, amount) in plan.amounts().iter().enumerate() {
        if token.is_cancelled() {
            finish(&jobs, &job_id, TwapJobStatus::Canceled, None);
            return;
        }

        match place_slice(&broker, &policy, &symbol, side, *amount, &token).await {
            Ok(order) => {
                debug!(job_id = %job_id, slice = index + 1, of = total, "twap slice placed");
                if let Some(entry) = jobs.write().get_mut(&job_id) {
                    entry.job.results.push(order);
                }
            }
            Err(SliceFailure::Cancelled) => {
                finish(&jobs, &job_id, TwapJobStatus::Canceled, None);
                return;
            }
            Err(SliceFailure::Failed(reason)) => {
                finish(&jobs, &job_id, TwapJobStatus::Failed, Some(reason));
                return;
            }
        }

        if index + 1 < total {
            tokio::select! {
                () = token.cancelled() => {
                    finish(&jobs, &job_id, TwapJobStatus::Canceled, None);
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    finish(&jobs, &job_id, TwapJobStatus::Completed, None);
}

/// Place one slice under its own retry budget.
///
/// The broker applies its own (short) retry loop per call; this outer budget
/// keeps a long-running job alive through rough patches without ever
/// retrying forever. Backoff sleeps are raced against the cancellation
/// token.
async fn place_slice<A: ExchangeAdapter>(
    broker: &Arc<Broker<A>>,
    policy: &RetryPolicy,
    symbol: &str,
    side: OrderSide,
    amount: Decimal,
    token: &CancellationToken,
) -> Result<Order, SliceFailure> {
    let request = PlaceOrderRequest::market(symbol.to_string(), side, amount);
    let mut backoff = Backoff::new(policy);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match broker.place_order(&request).await {
            Ok(order) => return Ok(order),
            Err(err) => {
                warn!(attempt, error = %err, "twap slice attempt failed");
                match backoff.next_backoff() {
                    Some(delay) if attempt < policy.max_attempts => {
                        tokio::select! {
                            () = token.cancelled() => return Err(SliceFailure::Cancelled),
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    _ => return Err(SliceFailure::Failed(err.to_string())),
                }
            }
        }
    }
}

/// Move a job to a terminal state. No-op when already terminal.
fn finish(jobs: &JobTable, job_id: &str, status: TwapJobStatus, error: Option<String>) {
    let mut jobs = jobs.write();
    if let Some(entry) = jobs.get_mut(job_id) {
        if entry.job.status == TwapJobStatus::Running {
            entry.job.status = status;
            entry.job.error = error;
            info!(job_id, status = %status, placed = entry.job.results.len(), "twap job finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::adapter::{AdapterError, AdapterOrder, PaperExchange, Ticker};
    use crate::store::MemoryOrderStore;

    fn runner() -> TwapRunner<PaperExchange> {
        let exchange = Arc::new(PaperExchange::new());
        exchange.set_ticker("BTC/USDT", dec!(99), dec!(101), dec!(100));
        let broker = Arc::new(
            Broker::new(exchange, Arc::new(MemoryOrderStore::new()))
                .with_policy(RetryPolicy::fast()),
        );
        TwapRunner::new(broker).with_policy(RetryPolicy::fast())
    }

    fn request(slices: u32, duration_seconds: u64) -> TwapRequest {
        TwapRequest {
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            total_amount: dec!(1),
            slices,
            duration_seconds,
        }
    }

    async fn wait_terminal(runner: &TwapRunner<PaperExchange>, job_id: &str) -> TwapJobStatus {
        for _ in 0..200 {
            if let Some(status) = runner.get_status(job_id) {
                if status.is_terminal() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn job_completes_and_conserves_amount() {
        let runner = runner();
        let job_id = runner.start_job(&request(5, 0)).unwrap();

        let status = wait_terminal(&runner, &job_id).await;
        assert_eq!(status, TwapJobStatus::Completed);

        let results = runner.get_results(&job_id).unwrap();
        assert_eq!(results.len(), 5);
        let total: Decimal = results.iter().map(|o| o.amount).sum();
        assert_eq!(total, dec!(1));
    }

    #[tokio::test]
    async fn cancellation_stops_future_slices() {
        let runner = runner();
        // 10 slices over 2s -> one slice every 200ms.
        let job_id = runner.start_job(&request(10, 2)).unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        runner.cancel_job(&job_id).unwrap();

        let status = wait_terminal(&runner, &job_id).await;
        assert_eq!(status, TwapJobStatus::Canceled);

        let placed = runner.get_results(&job_id).unwrap().len();
        assert!(placed > 0 && placed < 10, "placed {placed} slices");
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_an_error() {
        let runner = runner();
        assert!(matches!(
            runner.cancel_job("nope"),
            Err(TwapError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_after_completion_is_rejected() {
        let runner = runner();
        let job_id = runner.start_job(&request(2, 0)).unwrap();
        wait_terminal(&runner, &job_id).await;

        assert!(matches!(
            runner.cancel_job(&job_id),
            Err(TwapError::AlreadyTerminal { .. })
        ));
    }

    #[tokio::test]
    async fn slice_failure_marks_job_failed_and_halts() {
        struct AlwaysRejects;

        #[async_trait]
        impl ExchangeAdapter for AlwaysRejects {
            async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker, AdapterError> {
                Err(AdapterError::NotSupported {
                    capability: "fetch_ticker".to_string(),
                })
            }

            async fn place_order(
                &self,
                _request: &PlaceOrderRequest,
            ) -> Result<AdapterOrder, AdapterError> {
                Err(AdapterError::Rejected {
                    reason: "margin".to_string(),
                })
            }

            async fn cancel_order(&self, _order_id: &str) -> Result<AdapterOrder, AdapterError> {
                Ok(AdapterOrder::default())
            }

            async fn fetch_order(&self, order_id: &str) -> Result<AdapterOrder, AdapterError> {
                Err(AdapterError::NotFound {
                    order_id: order_id.to_string(),
                })
            }
        }

        let broker = Arc::new(
            Broker::new(Arc::new(AlwaysRejects), Arc::new(MemoryOrderStore::new()))
                .with_policy(RetryPolicy::fast()),
        );
        let runner = TwapRunner::new(broker).with_policy(RetryPolicy::fast());

        let job_id = runner
            .start_job(&TwapRequest {
                symbol: "BTC/USDT".to_string(),
                side: OrderSide::Buy,
                total_amount: dec!(1),
                slices: 4,
                duration_seconds: 0,
            })
            .unwrap();

        for _ in 0..200 {
            if runner.get_status(&job_id) == Some(TwapJobStatus::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let job = runner.get_job(&job_id).unwrap();
        assert_eq!(job.status, TwapJobStatus::Failed);
        assert!(job.error.is_some());
        assert!(job.results.is_empty());
    }

    #[tokio::test]
    async fn list_jobs_reports_every_job() {
        let runner = runner();
        let a = runner.start_job(&request(2, 0)).unwrap();
        let b = runner.start_job(&request(3, 0)).unwrap();

        wait_terminal(&runner, &a).await;
        wait_terminal(&runner, &b).await;

        let jobs = runner.list_jobs();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.status == TwapJobStatus::Completed));
    }

    #[tokio::test]
    async fn shutdown_cancels_running_jobs() {
        let runner = runner();
        let job_id = runner.start_job(&request(10, 5)).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        runner.shutdown(Duration::from_secs(1)).await;

        let status = runner.get_status(&job_id).unwrap();
        assert_eq!(status, TwapJobStatus::Canceled);
    }
}

//! Time-weighted average price execution.
//!
//! Splits a large order into equal time-spaced slices to reduce market
//! impact. [`TwapExecutor`] places slices inline and propagates the first
//! failure; [`TwapRunner`] runs jobs on background workers with per-slice
//! retry and cooperative cancellation.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::debug;

use crate::adapter::ExchangeAdapter;
use crate::broker::{Broker, BrokerError};
use crate::models::{Order, OrderSide, PlaceOrderRequest};

mod background;

pub use background::{TwapJob, TwapJobStatus, TwapRunner};

/// Errors from TWAP execution.
#[derive(Debug, Error)]
pub enum TwapError {
    /// Slice count must be at least 1.
    #[error("slices must be >= 1")]
    InvalidSlices,

    /// Total amount must be positive.
    #[error("total amount must be positive")]
    InvalidAmount,

    /// A slice placement failed terminally.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Unknown job id.
    #[error("twap job not found: {job_id}")]
    JobNotFound {
        /// The unknown id.
        job_id: String,
    },

    /// The job already reached a terminal state.
    #[error("twap job already terminal: {job_id}")]
    AlreadyTerminal {
        /// The terminal job's id.
        job_id: String,
    },
}

/// Per-slice amounts for one TWAP execution.
///
/// Slices are equal up to rounding; the division remainder goes to the last
/// slice so the amounts always sum exactly to the requested total.
#[derive(Debug, Clone)]
pub struct SlicePlan {
    amounts: Vec<Decimal>,
}

impl SlicePlan {
    /// Split `total` into `slices` amounts.
    ///
    /// # Errors
    ///
    /// [`TwapError::InvalidSlices`] for zero slices,
    /// [`TwapError::InvalidAmount`] for a non-positive total.
    pub fn new(total: Decimal, slices: u32) -> Result<Self, TwapError> {
        if slices == 0 {
            return Err(TwapError::InvalidSlices);
        }
        if total <= Decimal::ZERO {
            return Err(TwapError::InvalidAmount);
        }

        let count = Decimal::from(slices);
        let mut per_slice = (total / count).round_dp(8);
        let mut last = total - per_slice * Decimal::from(slices - 1);
        if last <= Decimal::ZERO {
            // Rounding ate the last slice (tiny totals); fall back to the
            // full-precision quotient.
            per_slice = total / count;
            last = total - per_slice * Decimal::from(slices - 1);
        }

        let mut amounts = vec![per_slice; slices as usize];
        if let Some(slot) = amounts.last_mut() {
            *slot = last;
        }

        Ok(Self { amounts })
    }

    /// The per-slice amounts, in placement order.
    #[must_use]
    pub fn amounts(&self) -> &[Decimal] {
        &self.amounts
    }

    /// Number of slices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.amounts.len()
    }

    /// True when the plan has no slices (never constructed, kept for API
    /// symmetry).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.amounts.is_empty()
    }

    /// Sum of all slice amounts.
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.amounts.iter().copied().sum()
    }
}

/// Synchronous TWAP executor.
///
/// Slices are placed strictly in order with a fixed delay between non-final
/// slices. There is no partial-failure recovery: the first failing slice
/// aborts the remainder and the error propagates to the caller.
pub struct TwapExecutor<A: ExchangeAdapter> {
    broker: Arc<Broker<A>>,
    order_delay: Duration,
}

impl<A: ExchangeAdapter> TwapExecutor<A> {
    /// Create an executor with a fixed inter-slice delay.
    #[must_use]
    pub const fn new(broker: Arc<Broker<A>>, order_delay: Duration) -> Self {
        Self {
            broker,
            order_delay,
        }
    }

    /// Execute `total_amount` in `slices` market orders.
    ///
    /// # Errors
    ///
    /// Plan validation errors, or the broker error of the first failing
    /// slice (already-placed slices are not rolled back).
    pub async fn execute(
        &self,
        symbol: &str,
        side: OrderSide,
        total_amount: Decimal,
        slices: u32,
    ) -> Result<Vec<Order>, TwapError> {
        let plan = SlicePlan::new(total_amount, slices)?;
        self.run(symbol, side, &plan, self.order_delay).await
    }

    /// Execute with the delay derived from a total duration window.
    ///
    /// # Errors
    ///
    /// Same as [`TwapExecutor::execute`].
    pub async fn execute_over(
        &self,
        symbol: &str,
        side: OrderSide,
        total_amount: Decimal,
        slices: u32,
        duration: Duration,
    ) -> Result<Vec<Order>, TwapError> {
        let plan = SlicePlan::new(total_amount, slices)?;
        let delay = duration / slices;
        self.run(symbol, side, &plan, delay).await
    }

    async fn run(
        &self,
        symbol: &str,
        side: OrderSide,
        plan: &SlicePlan,
        delay: Duration,
    ) -> Result<Vec<Order>, TwapError> {
        let mut results = Vec::with_capacity(plan.len());

        for (index, amount) in plan.amounts().iter().enumerate() {
            let request = PlaceOrderRequest::market(symbol.to_string(), side, *amount);
            let order = self.broker.place_order(&request).await?;
            debug!(
                slice = index + 1,
                of = plan.len(),
                order_id = %order.id,
                "twap slice placed"
            );
            results.push(order);

            if index + 1 < plan.len() && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::adapter::PaperExchange;
    use crate::broker::RetryPolicy;
    use crate::store::MemoryOrderStore;

    fn executor() -> TwapExecutor<PaperExchange> {
        let exchange = Arc::new(PaperExchange::new());
        exchange.set_ticker("BTC/USDT", dec!(99), dec!(101), dec!(100));
        let broker = Arc::new(
            Broker::new(exchange, Arc::new(MemoryOrderStore::new()))
                .with_policy(RetryPolicy::fast()),
        );
        TwapExecutor::new(broker, Duration::ZERO)
    }

    #[test]
    fn plan_splits_evenly() {
        let plan = SlicePlan::new(dec!(1), 4).unwrap();
        assert_eq!(plan.amounts().to_vec(), vec![dec!(0.25); 4]);
        assert_eq!(plan.total(), dec!(1));
    }

    #[test]
    fn plan_gives_remainder_to_last_slice() {
        let plan = SlicePlan::new(dec!(10), 3).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.amounts()[0], dec!(3.33333333));
        assert_eq!(plan.amounts()[1], dec!(3.33333333));
        assert_eq!(plan.amounts()[2], dec!(3.33333334));
        // Conservation is exact, not approximate.
        assert_eq!(plan.total(), dec!(10));
    }

    #[test]
    fn plan_conserves_total_for_many_shapes() {
        for (total, slices) in [
            (dec!(1), 1u32),
            (dec!(1), 7),
            (dec!(0.1), 3),
            (dec!(123.456), 11),
            (dec!(0.00000001), 3),
        ] {
            let plan = SlicePlan::new(total, slices).unwrap();
            assert_eq!(plan.total(), total, "total {total} slices {slices}");
            assert_eq!(plan.len(), slices as usize);
        }
    }

    #[test]
    fn plan_rejects_bad_input() {
        assert!(matches!(
            SlicePlan::new(dec!(1), 0),
            Err(TwapError::InvalidSlices)
        ));
        assert!(matches!(
            SlicePlan::new(dec!(0), 4),
            Err(TwapError::InvalidAmount)
        ));
        assert!(matches!(
            SlicePlan::new(dec!(-2), 4),
            Err(TwapError::InvalidAmount)
        ));
    }

    #[tokio::test]
    async fn executes_four_quarter_slices() {
        let twap = executor();
        let results = twap
            .execute("BTC/USDT", OrderSide::Buy, dec!(1), 4)
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        for order in &results {
            assert_eq!(order.amount, dec!(0.25));
        }
        let total: Decimal = results.iter().map(|o| o.amount).sum();
        assert_eq!(total, dec!(1));
    }

    #[tokio::test]
    async fn slices_are_placed_in_order() {
        let twap = executor();
        let results = twap
            .execute("BTC/USDT", OrderSide::Sell, dec!(10), 3)
            .await
            .unwrap();

        // Last slice carries the remainder, so order is observable.
        assert_eq!(results[0].amount, dec!(3.33333333));
        assert_eq!(results[2].amount, dec!(3.33333334));
    }
}

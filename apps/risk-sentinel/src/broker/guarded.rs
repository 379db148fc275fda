//! Reliability decorator for any [`BrokerClient`].
//!
//! Every call passes through, in order:
//!
//! 1. the endpoint's [`CircuitBreaker`] (fail fast while open)
//! 2. the [`RetryExecutor`] (failure-class retries, 401 refresh)
//! 3. the [`RateLimiter`] bucket for the endpoint, once per attempt
//!
//! The breaker wraps the whole retry sequence, so one exhausted call counts
//! as one failure.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::{
    BrokerClient, BrokerError, Endpoint, OrderAck, PlaceOrderRequest, RateLimiter, RetryExecutor,
};
use crate::models::{AccountId, Order, Position};
use crate::observability;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics};

/// Broker client wrapped in rate limiting, retry and circuit breaking.
pub struct GuardedBroker<B> {
    inner: B,
    limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    breakers: Vec<CircuitBreaker>,
}

impl<B: BrokerClient> GuardedBroker<B> {
    /// Wrap `inner`. One breaker is created per [`Endpoint`].
    pub fn new(
        inner: B,
        limiter: Arc<RateLimiter>,
        retry: RetryExecutor,
        breaker_config: &CircuitBreakerConfig,
    ) -> Self {
        let breakers = Endpoint::ALL
            .iter()
            .map(|e| CircuitBreaker::new(e.name(), breaker_config.clone()))
            .collect();
        Self {
            inner,
            limiter,
            retry,
            breakers,
        }
    }

    /// Wrapped client.
    pub const fn inner(&self) -> &B {
        &self.inner
    }

    /// Shared rate limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Breaker for an endpoint.
    pub fn breaker(&self, endpoint: Endpoint) -> &CircuitBreaker {
        &self.breakers[endpoint.index()]
    }

    /// Counter snapshots for every breaker.
    pub fn breaker_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        self.breakers.iter().map(CircuitBreaker::metrics).collect()
    }

    async fn guard<T, F, Fut>(&self, endpoint: Endpoint, op: F) -> Result<T, BrokerError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, BrokerError>> + Send,
        T: Send,
    {
        let breaker = self.breaker(endpoint);
        if let Err(rejection) = breaker.try_acquire() {
            tracing::debug!(endpoint = %endpoint, reason = %rejection, "Call rejected by circuit breaker");
            observability::record_broker_call(endpoint.name(), "circuit_open", 0.0);
            return Err(BrokerError::CircuitOpen {
                endpoint: endpoint.name().to_string(),
            });
        }

        let started = Instant::now();
        let limiter = &self.limiter;
        let inner = &self.inner;
        let op = &op;
        let bucket = endpoint.bucket();
        let upstream_failed = AtomicBool::new(false);
        let failed = &upstream_failed;

        let result = self
            .retry
            .execute(
                endpoint.name(),
                move || async move {
                    limiter.acquire(bucket).await.map_err(BrokerError::from)?;
                    let result = op().await;
                    if result.as_ref().is_err_and(|e| e.trips_breaker()) {
                        failed.store(true, Ordering::Relaxed);
                    }
                    result
                },
                move || inner.refresh_auth(),
            )
            .await;

        // A sequence that ends throttled still counts if an earlier attempt
        // reached the endpoint and failed.
        let upstream_failed = upstream_failed.load(Ordering::Relaxed);
        let outcome = match &result {
            Ok(_) => {
                breaker.record_success();
                "ok"
            }
            Err(err) if err.is_not_now() && !upstream_failed => {
                breaker.release();
                "throttled"
            }
            Err(err) if err.trips_breaker() || upstream_failed => {
                breaker.record_failure();
                "error"
            }
            // The endpoint answered; the request itself was bad.
            Err(_) => {
                breaker.record_success();
                "rejected"
            }
        };
        observability::record_broker_call(
            endpoint.name(),
            outcome,
            started.elapsed().as_secs_f64(),
        );

        result
    }
}

#[async_trait]
impl<B: BrokerClient> BrokerClient for GuardedBroker<B> {
    async fn get_accounts(&self, active_only: bool) -> Result<Vec<AccountId>, BrokerError> {
        let inner = &self.inner;
        self.guard(Endpoint::Accounts, move || inner.get_accounts(active_only))
            .await
    }

    async fn get_positions(&self, account: &AccountId) -> Result<Vec<Position>, BrokerError> {
        let inner = &self.inner;
        self.guard(Endpoint::Positions, move || inner.get_positions(account))
            .await
    }

    async fn get_open_orders(&self, account: &AccountId) -> Result<Vec<Order>, BrokerError> {
        let inner = &self.inner;
        self.guard(Endpoint::Orders, move || inner.get_open_orders(account))
            .await
    }

    async fn get_day_pnl(&self, account: &AccountId) -> Result<Decimal, BrokerError> {
        let inner = &self.inner;
        self.guard(Endpoint::DayPnl, move || inner.get_day_pnl(account))
            .await
    }

    async fn cancel_order(&self, account: &AccountId, order_id: &str) -> Result<(), BrokerError> {
        let inner = &self.inner;
        self.guard(Endpoint::CancelOrder, move || {
            inner.cancel_order(account, order_id)
        })
        .await
    }

    async fn cancel_orders(
        &self,
        account: &AccountId,
        symbol: Option<&str>,
    ) -> Result<usize, BrokerError> {
        let inner = &self.inner;
        self.guard(Endpoint::CancelOrders, move || {
            inner.cancel_orders(account, symbol)
        })
        .await
    }

    async fn close_position(&self, account: &AccountId, symbol: &str) -> Result<(), BrokerError> {
        let inner = &self.inner;
        self.guard(Endpoint::ClosePosition, move || {
            inner.close_position(account, symbol)
        })
        .await
    }

    async fn place_order(
        &self,
        account: &AccountId,
        request: &PlaceOrderRequest,
    ) -> Result<OrderAck, BrokerError> {
        let inner = &self.inner;
        self.guard(Endpoint::PlaceOrder, move || inner.place_order(account, request))
            .await
    }

    async fn refresh_auth(&self) -> Result<(), BrokerError> {
        self.inner.refresh_auth().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockall::mock;
    use mockall::predicate::eq;

    use super::*;
    use crate::broker::{BucketConfig, RateLimitConfig, RetryPolicy};
    use crate::resilience::CircuitBreakerState;

    // Owned arguments keep the expectations free of borrowed lifetimes; the
    // adapter below lends them to the async trait.
    mock! {
        pub Endpoints {
            fn get_accounts(&self, active_only: bool) -> Result<Vec<AccountId>, BrokerError>;
            fn get_positions(&self, account: AccountId) -> Result<Vec<Position>, BrokerError>;
            fn get_open_orders(&self, account: AccountId) -> Result<Vec<Order>, BrokerError>;
            fn get_day_pnl(&self, account: AccountId) -> Result<Decimal, BrokerError>;
            fn cancel_order(&self, account: AccountId, order_id: String) -> Result<(), BrokerError>;
            fn cancel_orders(&self, account: AccountId, symbol: Option<String>) -> Result<usize, BrokerError>;
            fn close_position(&self, account: AccountId, symbol: String) -> Result<(), BrokerError>;
            fn place_order(&self, account: AccountId, request: PlaceOrderRequest) -> Result<OrderAck, BrokerError>;
            fn refresh_auth(&self) -> Result<(), BrokerError>;
        }
    }

    struct Mocked(MockEndpoints);

    #[async_trait]
    impl BrokerClient for Mocked {
        async fn get_accounts(&self, active_only: bool) -> Result<Vec<AccountId>, BrokerError> {
            self.0.get_accounts(active_only)
        }

        async fn get_positions(&self, account: &AccountId) -> Result<Vec<Position>, BrokerError> {
            self.0.get_positions(account.clone())
        }

        async fn get_open_orders(&self, account: &AccountId) -> Result<Vec<Order>, BrokerError> {
            self.0.get_open_orders(account.clone())
        }

        async fn get_day_pnl(&self, account: &AccountId) -> Result<Decimal, BrokerError> {
            self.0.get_day_pnl(account.clone())
        }

        async fn cancel_order(&self, account: &AccountId, order_id: &str) -> Result<(), BrokerError> {
            self.0.cancel_order(account.clone(), order_id.to_string())
        }

        async fn cancel_orders(
            &self,
            account: &AccountId,
            symbol: Option<&str>,
        ) -> Result<usize, BrokerError> {
            self.0.cancel_orders(account.clone(), symbol.map(str::to_string))
        }

        async fn close_position(&self, account: &AccountId, symbol: &str) -> Result<(), BrokerError> {
            self.0.close_position(account.clone(), symbol.to_string())
        }

        async fn place_order(
            &self,
            account: &AccountId,
            request: &PlaceOrderRequest,
        ) -> Result<OrderAck, BrokerError> {
            self.0.place_order(account.clone(), request.clone())
        }

        async fn refresh_auth(&self) -> Result<(), BrokerError> {
            self.0.refresh_auth()
        }
    }

    fn guarded(mock: MockEndpoints, threshold: u32) -> GuardedBroker<Mocked> {
        GuardedBroker::new(
            Mocked(mock),
            Arc::new(RateLimiter::default()),
            RetryExecutor::new(RetryPolicy::default().without_jitter()),
            &CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(60),
                failure_window: Duration::from_secs(60),
            },
        )
    }

    fn account() -> AccountId {
        AccountId::from("ACC-1")
    }

    #[tokio::test(start_paused = true)]
    async fn test_passes_through_success() {
        let mut mock = MockEndpoints::new();
        mock.expect_get_day_pnl()
            .with(eq(account()))
            .times(1)
            .returning(|_| Ok(Decimal::new(125_075, 2)));

        let broker = guarded(mock, 5);
        let pnl = broker.get_day_pnl(&account()).await.unwrap();
        assert_eq!(pnl, Decimal::new(125_075, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_count_once_against_breaker() {
        let mut mock = MockEndpoints::new();
        mock.expect_get_positions()
            .times(4)
            .returning(|_| Err(BrokerError::from_status(503, "down")));

        let broker = guarded(mock, 2);
        assert!(broker.get_positions(&account()).await.is_err());

        let metrics = broker.breaker(Endpoint::Positions).metrics();
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(metrics.state, CircuitBreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_fails_fast_without_calling() {
        let mut mock = MockEndpoints::new();
        mock.expect_get_open_orders()
            .times(4)
            .returning(|_| Err(BrokerError::Timeout { message: "slow".into() }));

        let broker = guarded(mock, 1);
        assert!(matches!(
            broker.get_open_orders(&account()).await,
            Err(BrokerError::Timeout { .. })
        ));
        // mock would panic on a fifth call
        assert!(matches!(
            broker.get_open_orders(&account()).await,
            Err(BrokerError::CircuitOpen { .. })
        ));
        assert_eq!(
            broker.breaker(Endpoint::Orders).state(),
            CircuitBreakerState::Open
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_breakers_are_per_endpoint() {
        let mut mock = MockEndpoints::new();
        mock.expect_get_day_pnl()
            .returning(|_| Err(BrokerError::Network { message: "reset".into() }));
        mock.expect_get_positions().returning(|_| Ok(Vec::new()));

        let broker = guarded(mock, 1);
        let _ = broker.get_day_pnl(&account()).await;
        assert_eq!(
            broker.breaker(Endpoint::DayPnl).state(),
            CircuitBreakerState::Open
        );
        assert!(broker.get_positions(&account()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_does_not_open_breaker() {
        let mut mock = MockEndpoints::new();
        mock.expect_place_order()
            .times(2)
            .returning(|_, _| Err(BrokerError::from_status(400, "bad request")));

        let broker = guarded(mock, 1);
        let request = PlaceOrderRequest::market("ES", crate::models::OrderSide::Sell, 1);
        assert!(broker.place_order(&account(), &request).await.is_err());
        assert!(matches!(
            broker.place_order(&account(), &request).await,
            Err(BrokerError::Client { status: 400, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_triggers_refresh() {
        let mut mock = MockEndpoints::new();
        let mut first = true;
        mock.expect_get_accounts().times(2).returning(move |_| {
            if std::mem::take(&mut first) {
                Err(BrokerError::Unauthorized {
                    message: "expired".into(),
                })
            } else {
                Ok(vec![account()])
            }
        });
        mock.expect_refresh_auth().times(1).returning(|| Ok(()));

        let broker = guarded(mock, 5);
        assert_eq!(broker.get_accounts(true).await.unwrap(), vec![account()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_bucket_is_throttled_not_failure() {
        let mut mock = MockEndpoints::new();
        mock.expect_close_position().times(1).returning(|_, _| Ok(()));

        let tiny = BucketConfig {
            max_tokens: 1,
            window: Duration::from_secs(3600),
            acquire_timeout: Duration::ZERO,
        };
        let broker = GuardedBroker::new(
            Mocked(mock),
            Arc::new(RateLimiter::new(RateLimitConfig {
                emergency: tiny,
                ..RateLimitConfig::default()
            })),
            RetryExecutor::default(),
            &CircuitBreakerConfig::default(),
        );

        broker.close_position(&account(), "ES").await.unwrap();
        let err = broker.close_position(&account(), "ES").await.unwrap_err();
        assert!(err.is_not_now());
        let metrics = broker.breaker(Endpoint::ClosePosition).metrics();
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_failure_counts_when_retry_ends_throttled() {
        let mut mock = MockEndpoints::new();
        mock.expect_get_positions()
            .times(1)
            .returning(|_| Err(BrokerError::from_status(503, "down")));

        let one_token = BucketConfig {
            max_tokens: 1,
            window: Duration::from_secs(3600),
            acquire_timeout: Duration::ZERO,
        };
        let broker = GuardedBroker::new(
            Mocked(mock),
            Arc::new(RateLimiter::new(RateLimitConfig {
                general: one_token,
                ..RateLimitConfig::default()
            })),
            RetryExecutor::new(RetryPolicy::default().without_jitter()),
            &CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
                failure_window: Duration::from_secs(60),
            },
        );

        // The 503 is retried, and the retry is refused by the empty bucket.
        let err = broker.get_positions(&account()).await.unwrap_err();
        assert!(err.is_not_now());

        assert_eq!(
            broker.breaker(Endpoint::Positions).state(),
            CircuitBreakerState::Open
        );
    }
}

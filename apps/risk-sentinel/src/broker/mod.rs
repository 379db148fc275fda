//! Broker client contract and the reliability layer around it.
//!
//! - [`BrokerClient`]: logical operations the control loop needs
//! - [`RateLimiter`]: token buckets per call class
//! - [`RetryExecutor`]: failure-class keyed retry with jittered backoff
//! - [`GuardedBroker`]: composes limiter, retry and one circuit breaker per endpoint
//! - [`ProjectXClient`]: HTTP implementation
//! - [`SimulatedBroker`]: in-memory implementation for dry runs and tests

mod error;
mod guarded;
mod http;
mod rate_limiter;
mod retry;
mod simulated;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{AccountId, Order, OrderSide, OrderType, Position};

pub use error::{BrokerError, FailureClass};
pub use guarded::GuardedBroker;
pub use http::{ProjectXClient, ProjectXConfig};
pub use rate_limiter::{
    BucketConfig, BucketKind, BucketStatus, RateLimitConfig, RateLimitError, RateLimiter,
    TokenBucket,
};
pub use retry::{RetryExecutor, RetryPolicy, RetryStrategy};
pub use simulated::{BrokerCall, SimulatedBroker};

/// Logical broker endpoint. Each endpoint has its own circuit breaker and a
/// fixed rate-limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Account listing.
    Accounts,
    /// Position reads.
    Positions,
    /// Open order reads.
    Orders,
    /// Day P&L reads.
    DayPnl,
    /// Single order cancel.
    CancelOrder,
    /// Bulk order cancel.
    CancelOrders,
    /// Position close.
    ClosePosition,
    /// Order placement.
    PlaceOrder,
}

impl Endpoint {
    /// Every endpoint, in breaker index order.
    pub const ALL: [Self; 8] = [
        Self::Accounts,
        Self::Positions,
        Self::Orders,
        Self::DayPnl,
        Self::CancelOrder,
        Self::CancelOrders,
        Self::ClosePosition,
        Self::PlaceOrder,
    ];

    /// Stable name used in logs and metrics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Accounts => "accounts",
            Self::Positions => "positions",
            Self::Orders => "orders",
            Self::DayPnl => "day_pnl",
            Self::CancelOrder => "cancel_order",
            Self::CancelOrders => "cancel_orders",
            Self::ClosePosition => "close_position",
            Self::PlaceOrder => "place_order",
        }
    }

    /// Rate-limit bucket for this endpoint. Mutations draw from the emergency
    /// bucket so read polling can never starve a flatten.
    #[must_use]
    pub const fn bucket(self) -> BucketKind {
        match self {
            Self::Accounts | Self::Positions | Self::Orders => BucketKind::General,
            Self::DayPnl => BucketKind::MarketData,
            Self::CancelOrder | Self::CancelOrders | Self::ClosePosition | Self::PlaceOrder => {
                BucketKind::Emergency
            }
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Request to place an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    /// Contract symbol.
    pub symbol: String,
    /// Order type.
    pub order_type: OrderType,
    /// Order side.
    pub side: OrderSide,
    /// Contract quantity (positive).
    pub size: i64,
    /// Limit price (limit orders).
    pub limit_price: Option<Decimal>,
    /// Stop price (stop orders).
    pub stop_price: Option<Decimal>,
}

impl PlaceOrderRequest {
    /// Create a market order request.
    #[must_use]
    pub fn market(symbol: impl Into<String>, side: OrderSide, size: i64) -> Self {
        Self {
            symbol: symbol.into(),
            order_type: OrderType::Market,
            side,
            size,
            limit_price: None,
            stop_price: None,
        }
    }
}

/// Broker acknowledgement of a placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    /// Broker-assigned order ID.
    pub order_id: String,
}

/// Logical brokerage operations.
///
/// Implementations map raw payloads into typed records on ingress. Reads are
/// idempotent and safe to retry; mutations should be issued through
/// [`GuardedBroker`].
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// List account IDs.
    async fn get_accounts(&self, active_only: bool) -> Result<Vec<AccountId>, BrokerError>;

    /// Open positions for an account.
    async fn get_positions(&self, account: &AccountId) -> Result<Vec<Position>, BrokerError>;

    /// Open orders for an account.
    async fn get_open_orders(&self, account: &AccountId) -> Result<Vec<Order>, BrokerError>;

    /// Realized plus unrealized P&L for the trading day.
    async fn get_day_pnl(&self, account: &AccountId) -> Result<Decimal, BrokerError>;

    /// Cancel a single order.
    async fn cancel_order(&self, account: &AccountId, order_id: &str) -> Result<(), BrokerError>;

    /// Cancel open orders, optionally restricted to one symbol. Returns the
    /// number of orders cancelled.
    async fn cancel_orders(
        &self,
        account: &AccountId,
        symbol: Option<&str>,
    ) -> Result<usize, BrokerError>;

    /// Close the whole position in a symbol at market.
    async fn close_position(&self, account: &AccountId, symbol: &str) -> Result<(), BrokerError>;

    /// Place an order.
    async fn place_order(
        &self,
        account: &AccountId,
        request: &PlaceOrderRequest,
    ) -> Result<OrderAck, BrokerError>;

    /// Re-authenticate after a 401. Clients without sessions do nothing.
    async fn refresh_auth(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Shared clients, so a broker held elsewhere can still be wrapped.
#[async_trait]
impl<T: BrokerClient + ?Sized> BrokerClient for Arc<T> {
    async fn get_accounts(&self, active_only: bool) -> Result<Vec<AccountId>, BrokerError> {
        (**self).get_accounts(active_only).await
    }

    async fn get_positions(&self, account: &AccountId) -> Result<Vec<Position>, BrokerError> {
        (**self).get_positions(account).await
    }

    async fn get_open_orders(&self, account: &AccountId) -> Result<Vec<Order>, BrokerError> {
        (**self).get_open_orders(account).await
    }

    async fn get_day_pnl(&self, account: &AccountId) -> Result<Decimal, BrokerError> {
        (**self).get_day_pnl(account).await
    }

    async fn cancel_order(&self, account: &AccountId, order_id: &str) -> Result<(), BrokerError> {
        (**self).cancel_order(account, order_id).await
    }

    async fn cancel_orders(
        &self,
        account: &AccountId,
        symbol: Option<&str>,
    ) -> Result<usize, BrokerError> {
        (**self).cancel_orders(account, symbol).await
    }

    async fn close_position(&self, account: &AccountId, symbol: &str) -> Result<(), BrokerError> {
        (**self).close_position(account, symbol).await
    }

    async fn place_order(
        &self,
        account: &AccountId,
        request: &PlaceOrderRequest,
    ) -> Result<OrderAck, BrokerError> {
        (**self).place_order(account, request).await
    }

    async fn refresh_auth(&self) -> Result<(), BrokerError> {
        (**self).refresh_auth().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_indices_match_all() {
        for (i, endpoint) in Endpoint::ALL.iter().enumerate() {
            assert_eq!(endpoint.index(), i);
        }
    }

    #[test]
    fn test_mutations_use_emergency_bucket() {
        assert_eq!(Endpoint::PlaceOrder.bucket(), BucketKind::Emergency);
        assert_eq!(Endpoint::CancelOrders.bucket(), BucketKind::Emergency);
        assert_eq!(Endpoint::Positions.bucket(), BucketKind::General);
        assert_eq!(Endpoint::DayPnl.bucket(), BucketKind::MarketData);
    }

    #[test]
    fn test_market_request() {
        let req = PlaceOrderRequest::market("ES", OrderSide::Sell, 2);
        assert_eq!(req.order_type, OrderType::Market);
        assert_eq!(req.size, 2);
        assert!(req.limit_price.is_none());
    }
}

//! Account, position and order records.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Broker account identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Create a new account ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    /// Net long.
    Long,
    /// Net short.
    Short,
    /// No exposure.
    Flat,
}

impl PositionSide {
    /// Derive the side from a signed contract quantity.
    #[must_use]
    pub const fn from_quantity(quantity: i64) -> Self {
        if quantity > 0 {
            Self::Long
        } else if quantity < 0 {
            Self::Short
        } else {
            Self::Flat
        }
    }
}

/// An open futures position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Contract symbol (e.g. "ESZ24").
    pub symbol: String,
    /// Signed contract quantity: positive long, negative short.
    pub quantity: i64,
    /// Average entry price.
    pub entry_price: Decimal,
    /// Open P&L.
    pub unrealized_pnl: Decimal,
    /// Position side, consistent with the sign of `quantity`.
    pub side: PositionSide,
}

impl Position {
    /// Create a position; the side is derived from the quantity sign.
    #[must_use]
    pub fn new(
        symbol: impl Into<String>,
        quantity: i64,
        entry_price: Decimal,
        unrealized_pnl: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            entry_price,
            unrealized_pnl,
            side: PositionSide::from_quantity(quantity),
        }
    }

    /// Absolute contract count.
    #[must_use]
    pub const fn abs_quantity(&self) -> i64 {
        self.quantity.abs()
    }

    /// Side of the order that reduces this position, if any.
    #[must_use]
    pub const fn closing_side(&self) -> Option<OrderSide> {
        match self.side {
            PositionSide::Long => Some(OrderSide::Sell),
            PositionSide::Short => Some(OrderSide::Buy),
            PositionSide::Flat => None,
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    /// Buy order.
    Buy,
    /// Sell order.
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Execute at best available price.
    Market,
    /// Execute at the limit price or better.
    Limit,
    /// Becomes a market order when the stop price trades.
    Stop,
    /// Becomes a limit order when the stop price trades.
    StopLimit,
}

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Submitted, not yet acknowledged.
    Pending,
    /// Working at the exchange.
    Open,
    /// Partially filled and still working.
    PartiallyFilled,
    /// Completely filled.
    Filled,
    /// Cancelled.
    Cancelled,
    /// Rejected by the broker or exchange.
    Rejected,
}

impl OrderStatus {
    /// Whether the order can still fill (and therefore can be cancelled).
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Open | Self::PartiallyFilled)
    }
}

/// A broker order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Broker order ID.
    pub id: String,
    /// Contract symbol.
    pub symbol: String,
    /// Order side.
    pub side: OrderSide,
    /// Contract quantity (always positive).
    pub quantity: i64,
    /// Order type.
    pub order_type: OrderType,
    /// Lifecycle status.
    pub status: OrderStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_side_follows_quantity_sign() {
        assert_eq!(
            Position::new("ES", 2, Decimal::ZERO, Decimal::ZERO).side,
            PositionSide::Long
        );
        assert_eq!(
            Position::new("NQ", -1, Decimal::ZERO, Decimal::ZERO).side,
            PositionSide::Short
        );
        assert_eq!(
            Position::new("CL", 0, Decimal::ZERO, Decimal::ZERO).side,
            PositionSide::Flat
        );
    }

    #[test]
    fn test_closing_side() {
        let long = Position::new("ES", 3, Decimal::ZERO, Decimal::ZERO);
        let short = Position::new("ES", -3, Decimal::ZERO, Decimal::ZERO);
        let flat = Position::new("ES", 0, Decimal::ZERO, Decimal::ZERO);

        assert_eq!(long.closing_side(), Some(OrderSide::Sell));
        assert_eq!(short.closing_side(), Some(OrderSide::Buy));
        assert_eq!(flat.closing_side(), None);
        assert_eq!(short.abs_quantity(), 3);
    }

    #[test]
    fn test_open_order_statuses() {
        assert!(OrderStatus::Open.is_open());
        assert!(OrderStatus::PartiallyFilled.is_open());
        assert!(!OrderStatus::Filled.is_open());
        assert!(!OrderStatus::Cancelled.is_open());
    }
}

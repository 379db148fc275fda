//! In-memory broker used for dry runs, demos and tests.
//!
//! Market orders fill immediately at the position's entry price so that the
//! next tick sees the de-risked state. Failures can be queued and latency set
//! per endpoint.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use super::{BrokerClient, BrokerError, Endpoint, OrderAck, PlaceOrderRequest};
use crate::models::{
    AccountId, Order, OrderSide, OrderStatus, OrderType, Position, PositionSide,
};

/// A mutating call observed by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    /// `cancel_order`.
    CancelOrder {
        /// Account.
        account: AccountId,
        /// Order ID.
        order_id: String,
    },
    /// `cancel_orders`.
    CancelOrders {
        /// Account.
        account: AccountId,
        /// Symbol filter.
        symbol: Option<String>,
    },
    /// `close_position`.
    ClosePosition {
        /// Account.
        account: AccountId,
        /// Symbol.
        symbol: String,
    },
    /// `place_order`.
    PlaceOrder {
        /// Account.
        account: AccountId,
        /// Request as submitted.
        request: PlaceOrderRequest,
    },
}

#[derive(Debug, Clone)]
struct SimAccount {
    active: bool,
    positions: Vec<Position>,
    orders: Vec<Order>,
    day_pnl: Decimal,
}

#[derive(Debug, Default)]
struct SimState {
    accounts: BTreeMap<AccountId, SimAccount>,
    next_order_id: u64,
}

/// In-memory [`BrokerClient`].
#[derive(Debug, Default)]
pub struct SimulatedBroker {
    state: Mutex<SimState>,
    calls: Mutex<Vec<BrokerCall>>,
    failures: Mutex<HashMap<Endpoint, VecDeque<BrokerError>>>,
    latency: Mutex<HashMap<Endpoint, Duration>>,
}

impl SimulatedBroker {
    /// Empty simulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Two demo accounts: `SIM-001` long 2 ESZ24 / short 1 NQZ24 with a
    /// working ES bid, and a flat `SIM-002`.
    #[must_use]
    pub fn demo() -> Self {
        let sim = Self::new();
        sim.add_account(
            AccountId::from("SIM-001"),
            vec![
                Position::new("ESZ24", 2, Decimal::new(450_050, 2), Decimal::new(12_500, 2)),
                Position::new("NQZ24", -1, Decimal::new(1_650_025, 2), Decimal::new(-2_500, 2)),
            ],
            vec![Order {
                id: "ord_001".to_string(),
                symbol: "ESZ24".to_string(),
                side: OrderSide::Buy,
                quantity: 1,
                order_type: OrderType::Limit,
                status: OrderStatus::Open,
            }],
            Decimal::new(125_075, 2),
        );
        sim.add_account(AccountId::from("SIM-002"), Vec::new(), Vec::new(), Decimal::ZERO);
        sim
    }

    /// Add or replace an active account.
    pub fn add_account(
        &self,
        account: AccountId,
        positions: Vec<Position>,
        orders: Vec<Order>,
        day_pnl: Decimal,
    ) {
        self.state.lock().accounts.insert(
            account,
            SimAccount {
                active: true,
                positions,
                orders,
                day_pnl,
            },
        );
    }

    /// Mark an account inactive (hidden from `get_accounts(true)`).
    pub fn deactivate(&self, account: &AccountId) {
        if let Some(acc) = self.state.lock().accounts.get_mut(account) {
            acc.active = false;
        }
    }

    /// Overwrite an account's day P&L.
    pub fn set_day_pnl(&self, account: &AccountId, day_pnl: Decimal) {
        if let Some(acc) = self.state.lock().accounts.get_mut(account) {
            acc.day_pnl = day_pnl;
        }
    }

    /// Overwrite an account's positions.
    pub fn set_positions(&self, account: &AccountId, positions: Vec<Position>) {
        if let Some(acc) = self.state.lock().accounts.get_mut(account) {
            acc.positions = positions;
        }
    }

    /// Current positions (for assertions).
    #[must_use]
    pub fn positions(&self, account: &AccountId) -> Vec<Position> {
        self.state
            .lock()
            .accounts
            .get(account)
            .map(|a| a.positions.clone())
            .unwrap_or_default()
    }

    /// Fail the next call to `endpoint` with `error`. Queued errors are
    /// consumed in order.
    pub fn fail_next(&self, endpoint: Endpoint, error: BrokerError) {
        self.failures
            .lock()
            .entry(endpoint)
            .or_default()
            .push_back(error);
    }

    /// Delay every call to `endpoint` by `latency`.
    pub fn set_latency(&self, endpoint: Endpoint, latency: Duration) {
        self.latency.lock().insert(endpoint, latency);
    }

    /// Mutating calls received so far.
    #[must_use]
    pub fn mutation_calls(&self) -> Vec<BrokerCall> {
        self.calls.lock().clone()
    }

    /// Number of mutating calls received so far.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.calls.lock().len()
    }

    async fn delay(&self, endpoint: Endpoint) {
        let latency = self.latency.lock().get(&endpoint).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn injected(&self, endpoint: Endpoint) -> Result<(), BrokerError> {
        match self
            .failures
            .lock()
            .get_mut(&endpoint)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn with_account<T>(
        &self,
        account: &AccountId,
        f: impl FnOnce(&mut SimAccount) -> T,
    ) -> Result<T, BrokerError> {
        let mut state = self.state.lock();
        state
            .accounts
            .get_mut(account)
            .map(f)
            .ok_or_else(|| BrokerError::Client {
                status: 404,
                message: format!("unknown account {account}"),
            })
    }

    fn record(&self, call: BrokerCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl BrokerClient for SimulatedBroker {
    async fn get_accounts(&self, active_only: bool) -> Result<Vec<AccountId>, BrokerError> {
        self.delay(Endpoint::Accounts).await;
        self.injected(Endpoint::Accounts)?;
        Ok(self
            .state
            .lock()
            .accounts
            .iter()
            .filter(|(_, a)| a.active || !active_only)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn get_positions(&self, account: &AccountId) -> Result<Vec<Position>, BrokerError> {
        self.delay(Endpoint::Positions).await;
        self.injected(Endpoint::Positions)?;
        self.with_account(account, |a| a.positions.clone())
    }

    async fn get_open_orders(&self, account: &AccountId) -> Result<Vec<Order>, BrokerError> {
        self.delay(Endpoint::Orders).await;
        self.injected(Endpoint::Orders)?;
        self.with_account(account, |a| {
            a.orders
                .iter()
                .filter(|o| o.status.is_open())
                .cloned()
                .collect()
        })
    }

    async fn get_day_pnl(&self, account: &AccountId) -> Result<Decimal, BrokerError> {
        self.delay(Endpoint::DayPnl).await;
        self.injected(Endpoint::DayPnl)?;
        self.with_account(account, |a| a.day_pnl)
    }

    async fn cancel_order(&self, account: &AccountId, order_id: &str) -> Result<(), BrokerError> {
        self.record(BrokerCall::CancelOrder {
            account: account.clone(),
            order_id: order_id.to_string(),
        });
        self.delay(Endpoint::CancelOrder).await;
        self.injected(Endpoint::CancelOrder)?;
        let found = self.with_account(account, |a| {
            match a
                .orders
                .iter_mut()
                .find(|o| o.id == order_id && o.status.is_open())
            {
                Some(order) => {
                    order.status = OrderStatus::Cancelled;
                    true
                }
                None => false,
            }
        })?;
        if found {
            Ok(())
        } else {
            Err(BrokerError::Client {
                status: 404,
                message: format!("order {order_id} not open"),
            })
        }
    }

    async fn cancel_orders(
        &self,
        account: &AccountId,
        symbol: Option<&str>,
    ) -> Result<usize, BrokerError> {
        self.record(BrokerCall::CancelOrders {
            account: account.clone(),
            symbol: symbol.map(str::to_string),
        });
        self.delay(Endpoint::CancelOrders).await;
        self.injected(Endpoint::CancelOrders)?;
        self.with_account(account, |a| {
            let mut cancelled = 0;
            for order in a
                .orders
                .iter_mut()
                .filter(|o| o.status.is_open() && symbol.is_none_or(|s| o.symbol == s))
            {
                order.status = OrderStatus::Cancelled;
                cancelled += 1;
            }
            cancelled
        })
    }

    async fn close_position(&self, account: &AccountId, symbol: &str) -> Result<(), BrokerError> {
        self.record(BrokerCall::ClosePosition {
            account: account.clone(),
            symbol: symbol.to_string(),
        });
        self.delay(Endpoint::ClosePosition).await;
        self.injected(Endpoint::ClosePosition)?;
        self.with_account(account, |a| a.positions.retain(|p| p.symbol != symbol))
    }

    async fn place_order(
        &self,
        account: &AccountId,
        request: &PlaceOrderRequest,
    ) -> Result<OrderAck, BrokerError> {
        self.record(BrokerCall::PlaceOrder {
            account: account.clone(),
            request: request.clone(),
        });
        self.delay(Endpoint::PlaceOrder).await;
        self.injected(Endpoint::PlaceOrder)?;
        if request.size <= 0 {
            return Err(BrokerError::Rejected {
                reason: format!("invalid size {}", request.size),
            });
        }

        let delta = match request.side {
            OrderSide::Buy => request.size,
            OrderSide::Sell => -request.size,
        };
        self.with_account(account, |a| {
            if request.order_type != OrderType::Market {
                return;
            }
            match a.positions.iter_mut().find(|p| p.symbol == request.symbol) {
                Some(pos) => {
                    pos.quantity += delta;
                    pos.side = PositionSide::from_quantity(pos.quantity);
                }
                None => a.positions.push(Position::new(
                    &request.symbol,
                    delta,
                    Decimal::ZERO,
                    Decimal::ZERO,
                )),
            }
            a.positions.retain(|p| p.quantity != 0);
        })?;

        let mut state = self.state.lock();
        state.next_order_id += 1;
        Ok(OrderAck {
            order_id: format!("sim_ord_{}", state.next_order_id),
        })
    }
}

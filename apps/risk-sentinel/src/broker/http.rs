//! ProjectX (TopstepX) REST client.
//!
//! Performs exactly one HTTP request per call and maps the result into the
//! broker error taxonomy. Retries, rate limiting and circuit breaking are
//! applied by [`GuardedBroker`](super::GuardedBroker).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{BrokerClient, BrokerError, OrderAck, PlaceOrderRequest};
use crate::models::{AccountId, Order, OrderSide, OrderStatus, OrderType, Position};

/// Session tokens are valid for 24 hours; refresh a little early.
const TOKEN_LIFETIME: chrono::Duration = chrono::Duration::hours(24);
const TOKEN_REFRESH_MARGIN: chrono::Duration = chrono::Duration::minutes(5);

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ProjectXConfig {
    /// API root, e.g. `https://api.topstepx.com`.
    pub base_url: String,
    /// Login user name.
    pub username: String,
    /// API key.
    pub api_key: String,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout.
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    expires_at: DateTime<Utc>,
}

/// HTTP [`BrokerClient`].
#[derive(Debug)]
pub struct ProjectXClient {
    client: Client,
    config: ProjectXConfig,
    session: RwLock<Option<Session>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    user_name: &'a str,
    api_key: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    success: bool,
    token: Option<String>,
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct AccountsResponse {
    #[serde(default)]
    accounts: Vec<AccountPayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountPayload {
    id: serde_json::Value,
    #[serde(default = "default_true")]
    can_trade: bool,
}

const fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct PositionsResponse {
    #[serde(default)]
    positions: Vec<PositionPayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionPayload {
    contract_id: String,
    side: String,
    size: i64,
    average_price: Decimal,
    #[serde(default)]
    unrealized_pnl: Decimal,
}

#[derive(Deserialize)]
struct OrdersResponse {
    #[serde(default)]
    orders: Vec<OrderPayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderPayload {
    order_id: serde_json::Value,
    contract_id: String,
    status: String,
    order_type: String,
    side: String,
    size: i64,
}

#[derive(Deserialize)]
struct PnlResponse {
    #[serde(default)]
    pnl: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    cancelled: Option<usize>,
    #[serde(default)]
    order_id: Option<serde_json::Value>,
}

impl MutationResponse {
    fn into_result(self) -> Result<Self, BrokerError> {
        let failed = self.success == Some(false)
            || self.status.as_deref().is_some_and(|s| s.eq_ignore_ascii_case("error"));
        if failed {
            return Err(BrokerError::Rejected {
                reason: self
                    .message
                    .unwrap_or_else(|| "broker reported failure".to_string()),
            });
        }
        Ok(self)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrderBody<'a> {
    account_id: &'a str,
    symbol: &'a str,
    quantity: i64,
    side: &'static str,
    order_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_price: Option<Decimal>,
}

fn id_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn map_position(p: PositionPayload) -> Result<Position, BrokerError> {
    let quantity = match p.side.to_ascii_uppercase().as_str() {
        "LONG" | "1" => p.size.abs(),
        "SHORT" | "2" => -p.size.abs(),
        other => {
            return Err(BrokerError::Decode {
                message: format!("unknown position side {other}"),
            });
        }
    };
    Ok(Position::new(
        p.contract_id,
        quantity,
        p.average_price,
        p.unrealized_pnl,
    ))
}

fn map_order(o: OrderPayload) -> Order {
    let status = match o.status.to_ascii_uppercase().as_str() {
        "PENDING" => OrderStatus::Pending,
        "PARTIALLY_FILLED" | "PARTIAL" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELLED" | "CANCELED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Open,
    };
    let order_type = match o.order_type.to_ascii_uppercase().as_str() {
        "LIMIT" => OrderType::Limit,
        "STOP" => OrderType::Stop,
        "STOP_LIMIT" => OrderType::StopLimit,
        _ => OrderType::Market,
    };
    let side = match o.side.to_ascii_uppercase().as_str() {
        "SELL" | "ASK" => OrderSide::Sell,
        _ => OrderSide::Buy,
    };
    Order {
        id: id_string(&o.order_id),
        symbol: o.contract_id,
        side,
        quantity: o.size.abs(),
        order_type,
        status,
    }
}

fn map_transport(err: &reqwest::Error) -> BrokerError {
    if err.is_timeout() {
        BrokerError::Timeout {
            message: err.to_string(),
        }
    } else if err.is_decode() {
        BrokerError::Decode {
            message: err.to_string(),
        }
    } else {
        BrokerError::Network {
            message: err.to_string(),
        }
    }
}

impl ProjectXClient {
    /// Build a client. No network traffic until the first call.
    pub fn new(config: ProjectXConfig) -> Result<Self, BrokerError> {
        if config.username.is_empty() || config.api_key.is_empty() {
            return Err(BrokerError::Unauthorized {
                message: "username and api_key are required".to_string(),
            });
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BrokerError::Network {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            config,
            session: RwLock::new(None),
        })
    }

    /// Log in with the API key and store the session token.
    pub async fn login(&self) -> Result<(), BrokerError> {
        let url = format!("{}/api/Auth/loginKey", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .json(&LoginRequest {
                user_name: &self.config.username,
                api_key: &self.config.api_key,
            })
            .send()
            .await
            .map_err(|e| map_transport(&e))?;

        let body: LoginResponse = Self::decode(response).await?;
        match (body.success, body.token) {
            (true, Some(token)) => {
                *self.session.write() = Some(Session {
                    token,
                    expires_at: Utc::now() + TOKEN_LIFETIME,
                });
                tracing::info!(user = %self.config.username, "Authenticated with broker");
                Ok(())
            }
            _ => Err(BrokerError::Unauthorized {
                message: body
                    .error_message
                    .unwrap_or_else(|| "login rejected".to_string()),
            }),
        }
    }

    async fn token(&self) -> Result<String, BrokerError> {
        let cached = self.session.read().clone();
        if let Some(session) = cached
            && session.expires_at - TOKEN_REFRESH_MARGIN > Utc::now()
        {
            return Ok(session.token);
        }
        self.login().await?;
        self.session
            .read()
            .as_ref()
            .map(|s| s.token.clone())
            .ok_or_else(|| BrokerError::Unauthorized {
                message: "no session after login".to_string(),
            })
    }

    async fn request<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, BrokerError> {
        let token = self.token().await?;
        let url = format!("{}{path}", self.config.base_url);
        let mut request = self.client.request(method, &url).bearer_auth(token);
        if let Some(b) = body {
            request = request.json(b);
        }

        let response = request.send().await.map_err(|e| map_transport(&e))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            *self.session.write() = None;
        }
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, BrokerError> {
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| BrokerError::Decode {
                message: e.to_string(),
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(BrokerError::RateLimited { retry_after });
        }

        let message = response.text().await.unwrap_or_default();
        Err(BrokerError::from_status(status.as_u16(), message))
    }
}

#[async_trait]
impl BrokerClient for ProjectXClient {
    async fn get_accounts(&self, active_only: bool) -> Result<Vec<AccountId>, BrokerError> {
        let body = serde_json::json!({ "onlyActiveAccounts": active_only });
        let response: AccountsResponse = self
            .request(Method::POST, "/api/Account/search", Some(&body))
            .await?;
        Ok(response
            .accounts
            .iter()
            .filter(|a| a.can_trade || !active_only)
            .map(|a| AccountId::new(id_string(&a.id)))
            .collect())
    }

    async fn get_positions(&self, account: &AccountId) -> Result<Vec<Position>, BrokerError> {
        let response: PositionsResponse = self
            .request(Method::GET, &format!("/api/positions/{account}"), None::<&()>)
            .await?;
        response.positions.into_iter().map(map_position).collect()
    }

    async fn get_open_orders(&self, account: &AccountId) -> Result<Vec<Order>, BrokerError> {
        let response: OrdersResponse = self
            .request(Method::GET, &format!("/api/orders/{account}"), None::<&()>)
            .await?;
        Ok(response
            .orders
            .into_iter()
            .map(map_order)
            .filter(|o| o.status.is_open())
            .collect())
    }

    async fn get_day_pnl(&self, account: &AccountId) -> Result<Decimal, BrokerError> {
        let response: PnlResponse = self
            .request(Method::GET, &format!("/api/pnl/{account}/daily"), None::<&()>)
            .await?;
        Ok(response.pnl)
    }

    async fn cancel_order(&self, account: &AccountId, order_id: &str) -> Result<(), BrokerError> {
        let body = serde_json::json!({ "accountId": account.as_str(), "orderId": order_id });
        let response: MutationResponse = self
            .request(Method::POST, "/api/orders/cancel", Some(&body))
            .await?;
        response.into_result().map(|_| ())
    }

    async fn cancel_orders(
        &self,
        account: &AccountId,
        symbol: Option<&str>,
    ) -> Result<usize, BrokerError> {
        let mut body = serde_json::json!({ "accountId": account.as_str() });
        if let Some(symbol) = symbol {
            body["symbol"] = serde_json::Value::from(symbol);
        }
        let response: MutationResponse = self
            .request(Method::POST, "/api/orders/cancel", Some(&body))
            .await?;
        Ok(response.into_result()?.cancelled.unwrap_or(0))
    }

    async fn close_position(&self, account: &AccountId, symbol: &str) -> Result<(), BrokerError> {
        let body = serde_json::json!({ "accountId": account.as_str(), "symbol": symbol });
        let response: MutationResponse = self
            .request(Method::POST, "/api/positions/close", Some(&body))
            .await?;
        response.into_result().map(|_| ())
    }

    async fn place_order(
        &self,
        account: &AccountId,
        request: &PlaceOrderRequest,
    ) -> Result<OrderAck, BrokerError> {
        let body = PlaceOrderBody {
            account_id: account.as_str(),
            symbol: &request.symbol,
            quantity: request.size,
            side: match request.side {
                OrderSide::Buy => "BUY",
                OrderSide::Sell => "SELL",
            },
            order_type: match request.order_type {
                OrderType::Market => "MARKET",
                OrderType::Limit => "LIMIT",
                OrderType::Stop => "STOP",
                OrderType::StopLimit => "STOP_LIMIT",
            },
            limit_price: request.limit_price,
            stop_price: request.stop_price,
        };
        let response: MutationResponse = self
            .request(Method::POST, "/api/orders/place", Some(&body))
            .await?;
        let response = response.into_result()?;
        Ok(OrderAck {
            order_id: response
                .order_id
                .as_ref()
                .map(id_string)
                .unwrap_or_default(),
        })
    }

    async fn refresh_auth(&self) -> Result<(), BrokerError> {
        *self.session.write() = None;
        self.login().await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> ProjectXClient {
        ProjectXClient::new(ProjectXConfig {
            base_url: server.uri(),
            username: "trader".to_string(),
            api_key: "key".to_string(),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    async fn mount_login(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/api/Auth/loginKey"))
            .and(body_partial_json(serde_json::json!({"userName": "trader", "apiKey": "key"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"success": true, "token": token})),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn test_requires_credentials() {
        let result = ProjectXClient::new(ProjectXConfig {
            base_url: "http://localhost".to_string(),
            username: String::new(),
            api_key: String::new(),
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
        });
        assert!(matches!(result, Err(BrokerError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn test_positions_mapped_with_signed_quantity() {
        let server = MockServer::start().await;
        mount_login(&server, "tok-1").await;
        Mock::given(method("GET"))
            .and(path("/api/positions/ACC-1"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "positions": [
                    {"positionId": "p1", "accountId": "ACC-1", "contractId": "ESZ24",
                     "side": "LONG", "size": 2, "averagePrice": 4500.50},
                    {"positionId": "p2", "accountId": "ACC-1", "contractId": "NQZ24",
                     "side": "SHORT", "size": 1, "averagePrice": 16500.25}
                ]
            })))
            .mount(&server)
            .await;

        let positions = client(&server)
            .get_positions(&AccountId::from("ACC-1"))
            .await
            .unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].quantity, 2);
        assert_eq!(positions[1].quantity, -1);
        assert_eq!(positions[1].entry_price, Decimal::new(1_650_025, 2));
    }

    #[tokio::test]
    async fn test_only_open_orders_returned() {
        let server = MockServer::start().await;
        mount_login(&server, "tok").await;
        Mock::given(method("GET"))
            .and(path("/api/orders/ACC-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orders": [
                    {"orderId": "ord_001", "contractId": "ESZ24", "status": "OPEN",
                     "orderType": "LIMIT", "side": "BUY", "size": 1},
                    {"orderId": 2, "contractId": "NQZ24", "status": "FILLED",
                     "orderType": "MARKET", "side": "SELL", "size": 1}
                ]
            })))
            .mount(&server)
            .await;

        let orders = client(&server)
            .get_open_orders(&AccountId::from("ACC-1"))
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, "ord_001");
        assert_eq!(orders[0].order_type, OrderType::Limit);
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        mount_login(&server, "tok").await;
        Mock::given(method("GET"))
            .and(path("/api/pnl/ACC-1/daily"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
            .mount(&server)
            .await;

        let err = client(&server)
            .get_day_pnl(&AccountId::from("ACC-1"))
            .await
            .unwrap_err();
        let BrokerError::RateLimited { retry_after } = err else {
            panic!("expected rate limit, got {err:?}");
        };
        assert_eq!(retry_after, Some(Duration::from_secs(12)));
    }

    #[tokio::test]
    async fn test_unauthorized_clears_session() {
        let server = MockServer::start().await;
        mount_login(&server, "tok").await;
        Mock::given(method("GET"))
            .and(path("/api/pnl/ACC-1/daily"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let px = client(&server);
        let err = px.get_day_pnl(&AccountId::from("ACC-1")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unauthorized { .. }));
        assert!(px.session.read().is_none());
    }

    #[tokio::test]
    async fn test_failed_login_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/Auth/loginKey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"success": false, "errorMessage": "bad key"}),
            ))
            .mount(&server)
            .await;

        let err = client(&server).refresh_auth().await.unwrap_err();
        assert!(err.to_string().contains("bad key"));
    }

    #[tokio::test]
    async fn test_place_order_body_and_rejection() {
        let server = MockServer::start().await;
        mount_login(&server, "tok").await;
        Mock::given(method("POST"))
            .and(path("/api/orders/place"))
            .and(body_partial_json(serde_json::json!({
                "accountId": "ACC-1", "symbol": "ESZ24", "quantity": 1,
                "side": "SELL", "orderType": "MARKET"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"status": "error", "message": "market closed"}),
            ))
            .mount(&server)
            .await;

        let err = client(&server)
            .place_order(
                &AccountId::from("ACC-1"),
                &PlaceOrderRequest::market("ESZ24", OrderSide::Sell, 1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Rejected { ref reason } if reason == "market closed"));
    }

    #[tokio::test]
    async fn test_server_error_status() {
        let server = MockServer::start().await;
        mount_login(&server, "tok").await;
        Mock::given(method("POST"))
            .and(path("/api/orders/cancel"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let err = client(&server)
            .cancel_orders(&AccountId::from("ACC-1"), Some("ESZ24"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Server { status: 502, .. }));
    }
}

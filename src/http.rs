//! HTTP API for triggers and ledger queries
//!
//! Every operation the scheduler runs can also be triggered here, with an
//! explicit `asOf` date where time matters. Retrying any POST is safe.
//!
//! ## Intake (collaborator read models)
//! - `POST /deposits` - Confirmed deposit, activates a purchase
//! - `GET|POST /packages` - Package catalog
//! - `POST /referrals` - Referral edge
//! - `POST /pool/participants` - Pool participant
//!
//! ## Triggers
//! - `POST /advance-daily/{id}?asOf=&override=` - Advance one day
//!   (also `POST /purchases/{id}/advance`)
//! - `POST /purchases/{id}/cancel` - Cancel a purchase
//! - `POST /commissions/direct/{purchaseId}` - Direct referral commission
//! - `POST /process-direct-commissions` - Drain the commission outbox
//!   (also `POST /commissions/direct`)
//! - `POST /process-pool/{n}?asOf=` - Pay one pool cycle
//!   (also `POST /pool/cycles/{n}/process`)
//! - `POST /batch/daily?asOf=` - Full daily batch
//! - `POST /reconcile`, `POST /reconcile/{purchaseId}` - Repair from ledger
//!
//! ## Queries
//! - `GET /purchases?userId=&status=`, `GET /purchases/{id}`
//! - `GET /ledger?userId=&type=&subtype=&status=`, `GET /ledger/{id}`
//! - `GET /balance/{userId}`
//! - `GET /pool/cycles/{n}`
//! - `GET /invariants`
//!
//! ## Withdrawals
//! - `POST /withdrawals` - Reserve funds
//! - `POST /withdrawals/{entryId}/settle` - Complete or fail
//!
//! ## Example Usage
//!
//! ```bash
//! curl -X POST http://localhost:8095/deposits -d \
//!   '{"purchaseId":"p1","userId":"alice","amount":10000,"packageId":"gold","confirmedOn":"2026-01-01"}'
//!
//! curl -X POST 'http://localhost:8095/advance-daily/p1?asOf=2026-01-02'
//!
//! curl http://localhost:8095/balance/alice
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{NaiveDate, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::db::pool::PoolParticipant;
use crate::db::purchases::PurchaseQuery;
use crate::db::{LedgerQuery, Package, ReferralEdge};
use crate::error::EngineError;
use crate::scheduler::{blocking, Scheduler};
use crate::services::response::{self, HandlerResult};
use crate::services::{DepositEvent, Services, WithdrawalRequest};

/// `?asOf=YYYY-MM-DD&override=true`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerParams {
    #[serde(default)]
    as_of: Option<NaiveDate>,
    #[serde(default, rename = "override")]
    admin_override: bool,
}

impl TriggerParams {
    fn as_of(&self) -> NaiveDate {
        self.as_of.unwrap_or_else(|| Utc::now().date_naive())
    }
}

#[derive(Debug, Default, Deserialize)]
struct CancelBody {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SettleBody {
    succeeded: bool,
}

/// HTTP server state
pub struct HttpServer {
    scheduler: Arc<Scheduler>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(scheduler: Arc<Scheduler>, bind_addr: SocketAddr) -> Self {
        Self { scheduler, bind_addr }
    }

    fn services(&self) -> &Arc<Services> {
        self.scheduler.services()
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), EngineError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Handle one request; engine errors become JSON error responses
    pub async fn handle_request<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, hyper::Error>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: std::fmt::Display,
    {
        let path = req.uri().path().to_string();
        debug!(method = %req.method(), path = %path, "Incoming request");

        match self.route(req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if e.is_invariant_violation() {
                    error!(path = %path, error = %e, "Request hit invariant violation");
                } else {
                    debug!(path = %path, error = %e, "Request refused");
                }
                Ok(response::error_response(e))
            }
        }
    }

    /// Route requests to handlers
    async fn route<B>(&self, req: Request<B>) -> HandlerResult
    where
        B: Body<Data = Bytes> + Send,
        B::Error: std::fmt::Display,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        let query = req.uri().query().unwrap_or("").to_string();

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match (method, segments.as_slice()) {
            (Method::GET, ["health"]) => self.handle_health().await,

            // Intake
            (Method::POST, ["deposits"]) => {
                let event: DepositEvent = read_json(req).await?;
                let deposits = self.services().deposits.clone();
                blocking(move || deposits.confirm_deposit(&event))
                    .await
                    .map(|out| response::created_or_ok(!out.created, &out))
            }
            (Method::GET, ["packages"]) => {
                let deposits = self.services().deposits.clone();
                blocking(move || deposits.list_packages()).await.map(|p| response::ok(&p))
            }
            (Method::POST, ["packages"]) => {
                let package: Package = read_json(req).await?;
                package.terms.validate()?;
                let deposits = self.services().deposits.clone();
                blocking(move || deposits.upsert_package(&package).map(|_| package))
                    .await
                    .map(|p| response::ok(&p))
            }
            (Method::POST, ["referrals"]) => {
                let edge: ReferralEdge = read_json(req).await?;
                let deposits = self.services().deposits.clone();
                blocking(move || deposits.upsert_referral(&edge).map(|_| edge))
                    .await
                    .map(|e| response::ok(&e))
            }
            (Method::POST, ["pool", "participants"]) => {
                let participant: PoolParticipant = read_json(req).await?;
                let pool = self.services().pool.clone();
                blocking(move || pool.upsert_participant(&participant).map(|_| participant))
                    .await
                    .map(|p| response::ok(&p))
            }

            // Purchases
            (Method::GET, ["purchases"]) => {
                let q: PurchaseQuery = parse_query(&query)?;
                let accrual = self.services().accrual.clone();
                Ok(response::from_result(blocking(move || accrual.list(&q)).await))
            }
            (Method::GET, ["purchases", id]) => {
                let accrual = self.services().accrual.clone();
                let id = id.to_string();
                Ok(response::from_option(blocking(move || accrual.get(&id)).await, "Purchase not found"))
            }
            (Method::POST, ["purchases", id, "advance"] | ["advance-daily", id]) => {
                let params: TriggerParams = parse_query(&query)?;
                self.scheduler
                    .advance(id, params.as_of(), params.admin_override)
                    .await
                    .map(|out| response::ok(&out))
            }
            (Method::POST, ["purchases", id, "cancel"]) => {
                let body: CancelBody = read_json_or_default(req).await?;
                let accrual = self.services().accrual.clone();
                let id = id.to_string();
                blocking(move || accrual.cancel_purchase(&id, body.reason))
                    .await
                    .map(|p| response::ok(&p))
            }

            // Commissions
            (Method::POST, ["commissions", "direct"] | ["process-direct-commissions"]) => {
                let commission = self.services().commission.clone();
                blocking(move || commission.process_direct_commissions())
                    .await
                    .map(|s| response::ok(&s))
            }
            (Method::POST, ["commissions", "direct", purchase_id]) => {
                let commission = self.services().commission.clone();
                let id = purchase_id.to_string();
                blocking(move || commission.process_direct_commission(&id))
                    .await
                    .map(|out| response::created_or_ok(out.already_existed, &out))
            }

            // Pool
            (Method::GET, ["pool", "cycles", n]) => {
                let n = parse_cycle(n)?;
                let pool = self.services().pool.clone();
                let plan = blocking(move || pool.get_plan(n)).await.map(|plan| {
                    plan.map(|(cycle, allocations)| {
                        serde_json::json!({ "cycle": cycle, "allocations": allocations })
                    })
                });
                Ok(response::from_option(plan, "Pool cycle not planned"))
            }
            (Method::POST, ["pool", "cycles", n, "process"] | ["process-pool", n]) => {
                let n = parse_cycle(n)?;
                let params: TriggerParams = parse_query(&query)?;
                let pool = self.services().pool.clone();
                let as_of = params.as_of();
                blocking(move || pool.process_pool_cycle(n, as_of))
                    .await
                    .map(|s| response::ok(&s))
            }

            // Batch and reconciliation
            (Method::POST, ["batch", "daily"]) => {
                let params: TriggerParams = parse_query(&query)?;
                let as_of = params.as_of();
                match self.scheduler.run_daily_batch(as_of).await {
                    Ok(batch) => self
                        .scheduler
                        .run_pool(as_of)
                        .await
                        .map(|pool| response::ok(&serde_json::json!({ "batch": batch, "pool": pool }))),
                    Err(e) => Err(e),
                }
            }
            (Method::POST, ["reconcile"]) => {
                let reconcile = self.services().reconcile.clone();
                blocking(move || {
                    let summary = reconcile.reconcile_all()?;
                    let invariants = reconcile.verify_invariants()?;
                    Ok(serde_json::json!({ "summary": summary, "invariants": invariants }))
                })
                .await
                .map(|body| response::ok(&body))
            }
            (Method::POST, ["reconcile", purchase_id]) => {
                let reconcile = self.services().reconcile.clone();
                let id = purchase_id.to_string();
                Ok(response::from_result(blocking(move || reconcile.reconcile_purchase(&id)).await))
            }
            (Method::GET, ["invariants"]) => {
                let reconcile = self.services().reconcile.clone();
                Ok(response::from_result(blocking(move || reconcile.verify_invariants()).await))
            }

            // Ledger
            (Method::GET, ["ledger"]) => {
                let q: LedgerQuery = parse_query(&query)?;
                let ledger = self.services().ledger.clone();
                Ok(response::from_result(blocking(move || ledger.list(&q)).await))
            }
            (Method::GET, ["ledger", id]) => {
                let ledger = self.services().ledger.clone();
                let id = id.to_string();
                Ok(response::from_option(blocking(move || ledger.get(&id)).await, "Ledger entry not found"))
            }
            (Method::GET, ["balance", user_id]) => {
                let ledger = self.services().ledger.clone();
                let user_id = user_id.to_string();
                Ok(response::from_result(blocking(move || ledger.balance(&user_id)).await))
            }
            (Method::POST, ["withdrawals"]) => {
                let request: WithdrawalRequest = read_json(req).await?;
                let ledger = self.services().ledger.clone();
                blocking(move || ledger.request_withdrawal(&request))
                    .await
                    .map(|e| response::created(&e))
            }
            (Method::POST, ["withdrawals", entry_id, "settle"]) => {
                let entry_id = entry_id.to_string();
                let body: SettleBody = read_json(req).await?;
                let ledger = self.services().ledger.clone();
                blocking(move || ledger.settle_withdrawal(&entry_id, body.succeeded))
                    .await
                    .map(|out| response::ok(&out))
            }

            // Not found
            _ => Ok(response::json_response(
                StatusCode::NOT_FOUND,
                &serde_json::json!({ "error": "Not Found" }),
            )),
        }
    }

    /// Health check endpoint
    async fn handle_health(&self) -> HandlerResult {
        let db = self.services().db.clone();
        let stats = blocking(move || db.stats()).await?;
        let body = serde_json::json!({
            "status": "ok",
            "ledger_entries": stats.ledger_entries,
            "purchases": stats.purchases,
            "active_purchases": stats.active_purchases,
            "referral_edges": stats.referral_edges,
            "pending_commissions": stats.pending_commissions,
            "event_subscribers": self.services().events.subscriber_count(),
        });
        Ok(response::ok(&body))
    }
}

async fn read_body<B>(req: Request<B>) -> Result<Bytes, EngineError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let body = req
        .collect()
        .await
        .map_err(|e| EngineError::InvalidInput(format!("Failed to read body: {}", e)))?;
    Ok(body.to_bytes())
}

async fn read_json<T, B>(req: Request<B>) -> Result<T, EngineError>
where
    T: DeserializeOwned,
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let bytes = read_body(req).await?;
    serde_json::from_slice(&bytes).map_err(|e| EngineError::InvalidInput(format!("Invalid JSON: {}", e)))
}

/// Like [`read_json`] but an empty body yields `T::default()`
async fn read_json_or_default<T, B>(req: Request<B>) -> Result<T, EngineError>
where
    T: DeserializeOwned + Default,
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let bytes = read_body(req).await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| EngineError::InvalidInput(format!("Invalid JSON: {}", e)))
}

fn parse_query<T: DeserializeOwned>(query: &str) -> Result<T, EngineError> {
    serde_urlencoded::from_str(query).map_err(|e| EngineError::InvalidInput(format!("Invalid query: {}", e)))
}

fn parse_cycle(raw: &str) -> Result<u32, EngineError> {
    match raw.parse::<u32>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(EngineError::InvalidInput(format!("invalid cycle number: {}", raw))),
    }
}

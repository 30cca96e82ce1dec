//! Route handlers. Each one resolves the caller, then runs the marketplace
//! operation on the blocking pool since every store call is synchronous.
use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::AppState;
use super::auth::AuthUser;
use super::error::{ApiError, ApiResult};
use crate::directory::{Chat, User};
use crate::ledger::{Book, NewBook};
use crate::lock::BookLock;
use crate::marketplace::Marketplace;
use crate::matching::{Match, MatchFilter};
use crate::scope::Scope;
use crate::service::{CounterProposal, ExtensionReport, NewProposal, ProposalOutcome};
use crate::trade::{BookInterest, Trade};
use crate::transfer::{BookAuditLog, TransferSummary};
use crate::types::BookId;

async fn blocking<T, F>(state: &AppState, op: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Marketplace) -> crate::error::Result<T> + Send + 'static,
{
    let market = state.market.clone();
    tokio::task::spawn_blocking(move || op(&market))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    #[serde(default)]
    pub location: String,
}

#[derive(Debug, Serialize)]
pub struct Registered {
    pub user: User,
    pub token: String,
}

/// POST /users
pub async fn register_user(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<Registered>)> {
    let registered = blocking(&state, move |m| {
        let user = m.directory.register_user(&body.name, &body.location)?;
        let token = m.directory.issue_token(&user.id)?;
        Ok(Registered { user, token })
    })
    .await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenChatRequest {
    pub counterparty_id: String,
}

/// POST /chats
pub async fn open_chat(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<OpenChatRequest>,
) -> ApiResult<Json<Chat>> {
    let chat = blocking(&state, move |m| {
        m.directory.open_chat(&user.user_id, &body.counterparty_id)
    })
    .await?;
    Ok(Json(chat))
}

/// POST /books
pub async fn add_book(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<NewBook>,
) -> ApiResult<(StatusCode, Json<Book>)> {
    let book = blocking(&state, move |m| m.ledger.add_book(&user.user_id, body)).await?;
    Ok((StatusCode::CREATED, Json(book)))
}

/// DELETE /books/{id}
pub async fn remove_book(
    State(state): State<AppState>,
    user: AuthUser,
    Path(book_id): Path<String>,
) -> ApiResult<Json<Book>> {
    let book = blocking(&state, move |m| m.ledger.remove_book(&user.user_id, &book_id)).await?;
    Ok(Json(book))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityRequest {
    pub is_available: bool,
}

/// PATCH /books/{id}/availability
pub async fn set_availability(
    State(state): State<AppState>,
    user: AuthUser,
    Path(book_id): Path<String>,
    Json(body): Json<AvailabilityRequest>,
) -> ApiResult<Json<Book>> {
    let book = blocking(&state, move |m| {
        m.ledger
            .set_availability(&user.user_id, &book_id, body.is_available)
    })
    .await?;
    Ok(Json(book))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeRequest {
    #[serde(default)]
    pub room_id: Option<String>,
}

/// PATCH /books/{id}/scope
pub async fn set_scope(
    State(state): State<AppState>,
    user: AuthUser,
    Path(book_id): Path<String>,
    Json(body): Json<ScopeRequest>,
) -> ApiResult<Json<Book>> {
    let scope = Scope::from_room_id(body.room_id.as_deref());
    let book = blocking(&state, move |m| m.ledger.set_scope(&user.user_id, &book_id, scope)).await?;
    Ok(Json(book))
}

/// GET /books/{id}/audit
pub async fn book_audit(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(book_id): Path<String>,
) -> ApiResult<Json<Vec<BookAuditLog>>> {
    let entries = blocking(&state, move |m| m.transfers.book_audit_history(&book_id)).await?;
    Ok(Json(entries))
}

/// GET /books/{id}/interests
pub async fn book_interests(
    State(state): State<AppState>,
    user: AuthUser,
    Path(book_id): Path<String>,
) -> ApiResult<Json<Vec<BookInterest>>> {
    let interests = blocking(&state, move |m| {
        m.trades.competing_interests(&user.user_id, &book_id)
    })
    .await?;
    Ok(Json(interests))
}

/// GET /books/{id}/matches
pub async fn book_matches(
    State(state): State<AppState>,
    user: AuthUser,
    Path(book_id): Path<String>,
) -> ApiResult<Json<Vec<Match>>> {
    let matches = blocking(&state, move |m| m.matches.matches_for_book(&user.user_id, &book_id)).await?;
    Ok(Json(matches))
}

/// GET /interests
pub async fn my_interests(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<BTreeMap<BookId, Vec<BookInterest>>>> {
    let grouped = blocking(&state, move |m| m.trades.interests_for_owner(&user.user_id)).await?;
    Ok(Json(grouped))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchQuery {
    pub scope: Option<String>,
    pub room_id: Option<String>,
}

impl MatchQuery {
    fn filter(self) -> ApiResult<MatchFilter> {
        let room_id = self.room_id.filter(|r| !r.trim().is_empty());
        match (self.scope.as_deref(), room_id) {
            (Some("global"), _) => Ok(MatchFilter::Global),
            (None | Some("room"), Some(room_id)) => Ok(MatchFilter::Room(room_id)),
            (Some("room"), None) => Err(ApiError::BadRequest("scope=room requires roomId".into())),
            (None | Some("all"), _) => Ok(MatchFilter::All),
            (Some(other), _) => Err(ApiError::BadRequest(format!("unknown scope {other}"))),
        }
    }
}

/// GET /matches
pub async fn list_matches(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<MatchQuery>,
) -> ApiResult<Json<Vec<Match>>> {
    let filter = query.filter()?;
    let rows = blocking(&state, move |m| m.matches.list_matches(&user.user_id, &filter)).await?;
    Ok(Json(rows))
}

/// POST /matches/refresh
pub async fn refresh_matches(State(state): State<AppState>, user: AuthUser) -> ApiResult<Json<Vec<Match>>> {
    let rows = blocking(&state, move |m| m.matches.recompute_matches(&user.user_id)).await?;
    Ok(Json(rows))
}

/// DELETE /matches/{id}
pub async fn hide_match(
    State(state): State<AppState>,
    user: AuthUser,
    Path(match_id): Path<String>,
) -> ApiResult<Json<Match>> {
    let row = blocking(&state, move |m| m.matches.hide_match(&user.user_id, &match_id)).await?;
    Ok(Json(row))
}

/// DELETE /matches
pub async fn hide_all_matches(State(state): State<AppState>, user: AuthUser) -> ApiResult<Json<Value>> {
    let hidden = blocking(&state, move |m| m.matches.hide_all_matches(&user.user_id)).await?;
    Ok(Json(json!({ "hidden": hidden })))
}

/// POST /matches/unhide
pub async fn clear_hidden_matches(State(state): State<AppState>, user: AuthUser) -> ApiResult<Json<Value>> {
    let cleared = blocking(&state, move |m| m.matches.clear_hidden_matches(&user.user_id)).await?;
    Ok(Json(json!({ "cleared": cleared })))
}

/// GET /trades
pub async fn list_trades(State(state): State<AppState>, user: AuthUser) -> ApiResult<Json<Vec<Trade>>> {
    let trades = blocking(&state, move |m| m.trades.list_trades(&user.user_id)).await?;
    Ok(Json(trades))
}

/// POST /trades
pub async fn create_trade(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<NewProposal>,
) -> ApiResult<(StatusCode, Json<ProposalOutcome>)> {
    let outcome = blocking(&state, move |m| {
        m.trades.create_trade_proposal(&user.user_id, body)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// GET /trades/{id}
pub async fn get_trade(
    State(state): State<AppState>,
    user: AuthUser,
    Path(trade_id): Path<String>,
) -> ApiResult<Json<Trade>> {
    let trade = blocking(&state, move |m| m.trades.get_trade(&user.user_id, &trade_id)).await?;
    Ok(Json(trade))
}

/// POST /trades/{id}/accept
pub async fn accept_trade(
    State(state): State<AppState>,
    user: AuthUser,
    Path(trade_id): Path<String>,
) -> ApiResult<Json<TransferSummary>> {
    let summary = blocking(&state, move |m| m.trades.accept_trade(&user.user_id, &trade_id)).await?;
    Ok(Json(summary))
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /trades/{id}/reject
pub async fn reject_trade(
    State(state): State<AppState>,
    user: AuthUser,
    Path(trade_id): Path<String>,
    body: Option<Json<RejectRequest>>,
) -> ApiResult<Json<Trade>> {
    let reason = body.and_then(|Json(b)| b.reason);
    let trade = blocking(&state, move |m| {
        m.trades.reject_trade(&user.user_id, &trade_id, reason)
    })
    .await?;
    Ok(Json(trade))
}

/// POST /trades/{id}/cancel
pub async fn cancel_trade(
    State(state): State<AppState>,
    user: AuthUser,
    Path(trade_id): Path<String>,
) -> ApiResult<Json<Trade>> {
    let trade = blocking(&state, move |m| m.trades.cancel_trade(&user.user_id, &trade_id)).await?;
    Ok(Json(trade))
}

/// POST /trades/{id}/counter
pub async fn counter_trade(
    State(state): State<AppState>,
    user: AuthUser,
    Path(trade_id): Path<String>,
    Json(body): Json<CounterProposal>,
) -> ApiResult<Json<ProposalOutcome>> {
    let outcome = blocking(&state, move |m| {
        m.trades.counter_propose(&user.user_id, &trade_id, body)
    })
    .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendRequest {
    #[serde(default)]
    pub additional_hours: Option<u32>,
}

/// POST /trades/{id}/extend-lock
pub async fn extend_trade_locks(
    State(state): State<AppState>,
    user: AuthUser,
    Path(trade_id): Path<String>,
    body: Option<Json<ExtendRequest>>,
) -> ApiResult<Json<ExtensionReport>> {
    let hours = body.and_then(|Json(b)| b.additional_hours);
    let report = blocking(&state, move |m| {
        m.trades.extend_trade_locks(&user.user_id, &trade_id, hours)
    })
    .await?;
    Ok(Json(report))
}

/// GET /trades/{id}/locks
pub async fn trade_locks(
    State(state): State<AppState>,
    user: AuthUser,
    Path(trade_id): Path<String>,
) -> ApiResult<Json<Vec<BookLock>>> {
    let locks = blocking(&state, move |m| {
        m.trades.get_locks_for_trade(&user.user_id, &trade_id)
    })
    .await?;
    Ok(Json(locks))
}

/// GET /trades/{id}/audit
pub async fn trade_audit(
    State(state): State<AppState>,
    user: AuthUser,
    Path(trade_id): Path<String>,
) -> ApiResult<Json<Vec<BookAuditLog>>> {
    let entries = blocking(&state, move |m| {
        m.trades.get_trade(&user.user_id, &trade_id)?;
        m.transfers.trade_audit_history(&trade_id)
    })
    .await?;
    Ok(Json(entries))
}

/// GET /locks/mine
pub async fn my_locks(State(state): State<AppState>, user: AuthUser) -> ApiResult<Json<Vec<BookLock>>> {
    let locks = blocking(&state, move |m| Ok(m.locks.user_book_locks(&user.user_id)?)).await?;
    Ok(Json(locks))
}

/// POST /locks/sweep
pub async fn sweep_locks(State(state): State<AppState>, _user: AuthUser) -> ApiResult<Json<Value>> {
    let removed = blocking(&state, |m| m.sweep_expired_locks()).await?;
    Ok(Json(json!({ "removed": removed })))
}

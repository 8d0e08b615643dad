//! Wallet RPCs and the withdrawal endpoints.
//!
//! Balances are integers in minor units. `update_wallet_balance` is the only
//! writer of `wallets.balance`; withdrawals reserve funds by counting every
//! non-terminal request against the available balance until the monitor
//! settles them.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db;
use crate::error::{with_timeout, AppError};
use crate::models::{
    NewTransaction, NewWithdrawalRequest, Transaction, TransactionKind, TransactionStatus, Wallet, WithdrawalRequest,
    WithdrawalStatus,
};
use crate::payment::{normalize_msisdn, PaymentOrder};
use crate::realtime::ChangeEvent;
use crate::schema::{transactions, wallets, withdrawal_requests};
use crate::withdrawal::{Progress, WithdrawalTicket};
use crate::AppState;

pub const GATEWAY_CALL_LIMIT: Duration = Duration::from_secs(20);

/// Statuses whose amount is still reserved against the balance.
const RESERVED_STATUSES: [WithdrawalStatus; 2] = [WithdrawalStatus::Pending, WithdrawalStatus::Unknown];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceSummary {
    pub balance: i64,
    pub pending_withdrawals: i64,
    pub available: i64,
    pub currency: String,
}

/// Adds `delta` to the wallet of `profile_id`, refusing to go below zero.
pub fn update_wallet_balance(conn: &mut PgConnection, profile_id: Uuid, delta: i64) -> Result<Wallet, AppError> {
    conn.transaction(|conn| {
        let wallet: Wallet = wallets::table
            .filter(wallets::profile_id.eq(profile_id))
            .select(Wallet::as_select())
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(AppError::NotFound("Wallet"))?;
        let balance = apply_delta(wallet.balance, delta)?;
        Ok(diesel::update(wallets::table.find(wallet.id))
            .set((wallets::balance.eq(balance), wallets::updated_at.eq(Utc::now())))
            .returning(Wallet::as_returning())
            .get_result(conn)?)
    })
}

fn apply_delta(balance: i64, delta: i64) -> Result<i64, AppError> {
    let updated = balance
        .checked_add(delta)
        .ok_or_else(|| AppError::validation("Balance out of range"))?;
    if updated < 0 {
        return Err(AppError::validation("Insufficient wallet balance"));
    }
    Ok(updated)
}

fn reserved_amount(conn: &mut PgConnection, profile_id: Uuid) -> Result<i64, AppError> {
    let statuses: Vec<&str> = RESERVED_STATUSES.iter().map(|s| s.as_str()).collect();
    let amounts: Vec<i64> = withdrawal_requests::table
        .filter(withdrawal_requests::profile_id.eq(profile_id))
        .filter(withdrawal_requests::status.eq_any(statuses))
        .select(withdrawal_requests::amount)
        .load(conn)?;
    Ok(amounts.iter().sum())
}

fn summarize(wallet: &Wallet, reserved: i64) -> BalanceSummary {
    BalanceSummary {
        balance: wallet.balance,
        pending_withdrawals: reserved,
        available: (wallet.balance - reserved).max(0),
        currency: wallet.currency.clone(),
    }
}

fn find_wallet(conn: &mut PgConnection, profile_id: Uuid) -> Result<Wallet, AppError> {
    wallets::table
        .filter(wallets::profile_id.eq(profile_id))
        .select(Wallet::as_select())
        .first(conn)
        .optional()?
        .ok_or(AppError::NotFound("Wallet"))
}

pub fn available_balance(conn: &mut PgConnection, profile_id: Uuid) -> Result<BalanceSummary, AppError> {
    let wallet = find_wallet(conn, profile_id)?;
    let reserved = reserved_amount(conn, profile_id)?;
    Ok(summarize(&wallet, reserved))
}

/// Records a pending withdrawal and its ledger row once the available balance covers it.
pub fn request_withdrawal(
    conn: &mut PgConnection,
    profile_id: Uuid,
    amount: i64,
    phone_number: &str,
) -> Result<WithdrawalRequest, AppError> {
    if amount <= 0 {
        return Err(AppError::validation("Amount must be greater than zero"));
    }
    conn.transaction(|conn| {
        // The row lock serialises concurrent requests for the same wallet.
        let wallet: Wallet = wallets::table
            .filter(wallets::profile_id.eq(profile_id))
            .select(Wallet::as_select())
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(AppError::NotFound("Wallet"))?;
        let summary = summarize(&wallet, reserved_amount(conn, profile_id)?);
        if summary.available < amount {
            return Err(AppError::validation("Insufficient available balance"));
        }

        let request: WithdrawalRequest = diesel::insert_into(withdrawal_requests::table)
            .values(NewWithdrawalRequest {
                wallet_id: wallet.id,
                profile_id,
                amount,
                currency: wallet.currency.clone(),
                phone_number: phone_number.to_string(),
            })
            .returning(WithdrawalRequest::as_returning())
            .get_result(conn)?;
        diesel::insert_into(transactions::table)
            .values(NewTransaction {
                profile_id,
                reservation_id: None,
                withdrawal_id: Some(request.id),
                kind: TransactionKind::Withdrawal.as_str().to_string(),
                amount,
                currency: wallet.currency,
                status: TransactionStatus::Pending.as_str().to_string(),
                provider_reference: None,
            })
            .execute(conn)?;
        Ok(request)
    })
}

fn ticket_for(request: &WithdrawalRequest) -> Result<WithdrawalTicket, AppError> {
    let reference = request
        .provider_reference
        .clone()
        .ok_or_else(|| AppError::Conflict("Withdrawal was never submitted to the provider".to_string()))?;
    Ok(WithdrawalTicket {
        withdrawal_id: request.id,
        profile_id: request.profile_id,
        amount: request.amount,
        currency: request.currency.clone(),
        reference,
    })
}

fn own_withdrawal(conn: &mut PgConnection, user: &AuthUser, withdrawal_id: Uuid) -> Result<WithdrawalRequest, AppError> {
    withdrawal_requests::table
        .find(withdrawal_id)
        .filter(withdrawal_requests::profile_id.eq(user.id))
        .select(WithdrawalRequest::as_select())
        .first(conn)
        .optional()?
        .ok_or(AppError::NotFound("Withdrawal"))
}

/// Withdrawals a previous process left in flight: submitted ones to resume
/// monitoring, and ones that never reached the provider.
pub fn interrupted_withdrawals(conn: &mut PgConnection) -> Result<(Vec<WithdrawalTicket>, Vec<Uuid>), AppError> {
    let pending: Vec<WithdrawalRequest> = withdrawal_requests::table
        .filter(withdrawal_requests::status.eq(WithdrawalStatus::Pending.as_str()))
        .select(WithdrawalRequest::as_select())
        .load(conn)?;
    let mut tickets = Vec::new();
    let mut unsubmitted = Vec::new();
    for request in &pending {
        match ticket_for(request) {
            Ok(ticket) => tickets.push(ticket),
            Err(_) => unsubmitted.push(request.id),
        }
    }
    Ok((tickets, unsubmitted))
}

pub async fn get_wallet(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<BalanceSummary>, AppError> {
    let summary = db::run(&state.pool, move |conn| available_balance(conn, user.id)).await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Transaction>>, AppError> {
    let items = db::run(&state.pool, move |conn| {
        Ok(transactions::table
            .filter(transactions::profile_id.eq(user.id))
            .order(transactions::created_at.desc())
            .limit(page.limit.unwrap_or(50).clamp(1, 200))
            .offset(page.offset.unwrap_or(0).max(0))
            .select(Transaction::as_select())
            .load(conn)?)
    })
    .await?;
    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
pub struct WithdrawalBody {
    pub amount: i64,
    pub phone_number: String,
}

#[derive(Debug, Serialize)]
pub struct WithdrawalView {
    pub withdrawal: WithdrawalRequest,
    pub progress: Option<Progress>,
}

pub async fn create_withdrawal(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<WithdrawalBody>,
) -> Result<(StatusCode, Json<WithdrawalView>), AppError> {
    let phone = normalize_msisdn(&body.phone_number)
        .ok_or_else(|| AppError::validation("Please enter a valid mobile money number"))?;
    let amount = body.amount;
    let request_phone = phone.clone();
    let request = db::run(&state.pool, move |conn| request_withdrawal(conn, user.id, amount, &request_phone)).await?;
    log::info!("Withdrawal {} of {} requested by {}", request.id, request.amount, user.id);

    let order = PaymentOrder {
        external_id: request.id.to_string(),
        amount: request.amount,
        currency: request.currency.clone(),
        phone_number: phone,
        note: "Marketplace wallet withdrawal".to_string(),
    };
    let gateway = state.gateway.clone();
    let submitted = with_timeout("Withdrawal request", GATEWAY_CALL_LIMIT, async move {
        Ok(gateway.initiate_transfer(&order).await?)
    })
    .await;

    let withdrawal_id = request.id;
    let reference = match submitted {
        Ok(reference) => reference,
        Err(e) => {
            log::warn!("Withdrawal {} could not be submitted: {}", withdrawal_id, e);
            let reason = e.user_message();
            let hub = state.hub.clone();
            db::run(&state.pool, move |conn| {
                crate::withdrawal::settle(conn, &hub, withdrawal_id, WithdrawalStatus::Failed, Some(reason))
            })
            .await?;
            return Err(e);
        }
    };

    let hub = state.hub.clone();
    let stored_reference = reference.clone();
    let request = db::run(&state.pool, move |conn| {
        let updated = conn.transaction(|conn| {
            let updated: WithdrawalRequest = diesel::update(withdrawal_requests::table.find(withdrawal_id))
                .set((
                    withdrawal_requests::provider_reference.eq(&stored_reference),
                    withdrawal_requests::updated_at.eq(Utc::now()),
                ))
                .returning(WithdrawalRequest::as_returning())
                .get_result(conn)?;
            diesel::update(transactions::table.filter(transactions::withdrawal_id.eq(withdrawal_id)))
                .set(transactions::provider_reference.eq(&stored_reference))
                .execute(conn)?;
            Ok::<_, AppError>(updated)
        })?;
        hub.publish("withdrawal_requests", ChangeEvent::Insert, &updated);
        Ok(updated)
    })
    .await?;

    let ticket = ticket_for(&request)?;
    state.withdrawals.spawn(ticket);
    let progress = state.withdrawals.board().get(&withdrawal_id);
    Ok((StatusCode::ACCEPTED, Json(WithdrawalView { withdrawal: request, progress })))
}

pub async fn list_withdrawals(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<WithdrawalRequest>>, AppError> {
    let items = db::run(&state.pool, move |conn| {
        Ok(withdrawal_requests::table
            .filter(withdrawal_requests::profile_id.eq(user.id))
            .order(withdrawal_requests::created_at.desc())
            .limit(page.limit.unwrap_or(50).clamp(1, 200))
            .offset(page.offset.unwrap_or(0).max(0))
            .select(WithdrawalRequest::as_select())
            .load(conn)?)
    })
    .await?;
    Ok(Json(items))
}

pub async fn get_withdrawal(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(withdrawal_id): Path<Uuid>,
) -> Result<Json<WithdrawalView>, AppError> {
    let withdrawal = db::run(&state.pool, move |conn| own_withdrawal(conn, &user, withdrawal_id)).await?;
    let progress = state.withdrawals.board().get(&withdrawal_id);
    Ok(Json(WithdrawalView { withdrawal, progress }))
}

pub async fn refresh_withdrawal(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(withdrawal_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let lookup_user = user.clone();
    let withdrawal = db::run(&state.pool, move |conn| own_withdrawal(conn, &lookup_user, withdrawal_id)).await?;
    let current = withdrawal.status.parse::<WithdrawalStatus>()?;
    if current.is_terminal() {
        return Ok(Json(json!({ "status": current })));
    }
    if let Some(progress) = state.withdrawals.board().get(&withdrawal_id) {
        if progress.status == WithdrawalStatus::Pending {
            return Err(AppError::Conflict("This withdrawal is still being checked".to_string()));
        }
    }

    let ticket = ticket_for(&withdrawal)?;
    let monitor = state.withdrawals.clone();
    let status = with_timeout("Withdrawal status check", GATEWAY_CALL_LIMIT, async move {
        monitor.refresh(&ticket).await
    })
    .await?;
    log::info!("Withdrawal {} refreshed by {}: {}", withdrawal_id, user.id, status);
    Ok(Json(json!({ "status": status })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn wallet(balance: i64) -> Wallet {
        Wallet {
            id: Uuid::new_v4(),
            profile_id: Uuid::new_v4(),
            balance,
            currency: "EUR".to_string(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn balance_never_goes_negative() {
        assert_eq!(apply_delta(1_000, -400).unwrap(), 600);
        assert_eq!(apply_delta(1_000, -1_000).unwrap(), 0);
        assert!(matches!(apply_delta(1_000, -1_001), Err(AppError::Validation(_))));
        assert!(apply_delta(i64::MAX, 1).is_err());
    }

    #[test]
    fn pending_withdrawals_reduce_available_balance() {
        let summary = summarize(&wallet(10_000), 7_500);
        assert_eq!(summary.available, 2_500);
        assert_eq!(summary.pending_withdrawals, 7_500);

        let overdrawn = summarize(&wallet(1_000), 2_000);
        assert_eq!(overdrawn.available, 0);
    }

    #[test]
    fn unknown_withdrawals_stay_reserved() {
        assert!(RESERVED_STATUSES.contains(&WithdrawalStatus::Unknown));
        assert!(RESERVED_STATUSES.iter().all(|s| !s.is_terminal()));
    }

    #[test]
    fn tickets_require_a_provider_reference() {
        let now = Utc::now();
        let mut request = WithdrawalRequest {
            id: Uuid::new_v4(),
            wallet_id: Uuid::new_v4(),
            profile_id: Uuid::new_v4(),
            amount: 2_000,
            currency: "EUR".to_string(),
            phone_number: "46733123453".to_string(),
            status: "PENDING".to_string(),
            provider_reference: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        assert!(matches!(ticket_for(&request), Err(AppError::Conflict(_))));

        request.provider_reference = Some("ref-9".to_string());
        let ticket = ticket_for(&request).unwrap();
        assert_eq!(ticket.reference, "ref-9");
        assert_eq!(ticket.amount, 2_000);
    }
}

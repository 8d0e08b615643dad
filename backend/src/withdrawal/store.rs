use async_trait::async_trait;
use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use uuid::Uuid;

use super::WithdrawalTicket;
use crate::db::{self, DbPool};
use crate::error::AppError;
use crate::models::{TransactionStatus, WithdrawalRequest, WithdrawalStatus};
use crate::notification::notify;
use crate::realtime::{ChangeEvent, RealtimeHub, StagedChanges};
use crate::schema::{transactions, withdrawal_requests};
use crate::wallet::update_wallet_balance;

/// Where monitor outcomes are recorded.
#[async_trait]
pub trait WithdrawalStore: Send + Sync {
    async fn complete(&self, ticket: &WithdrawalTicket) -> Result<(), AppError>;

    async fn fail(&self, ticket: &WithdrawalTicket, status: WithdrawalStatus, reason: Option<String>)
        -> Result<(), AppError>;

    async fn mark_unknown(&self, ticket: &WithdrawalTicket) -> Result<(), AppError>;
}

pub struct PgWithdrawalStore {
    pool: DbPool,
    hub: RealtimeHub,
}

impl PgWithdrawalStore {
    pub fn new(pool: DbPool, hub: RealtimeHub) -> Self {
        Self { pool, hub }
    }
}

#[async_trait]
impl WithdrawalStore for PgWithdrawalStore {
    async fn complete(&self, ticket: &WithdrawalTicket) -> Result<(), AppError> {
        let hub = self.hub.clone();
        let ticket = ticket.clone();
        db::run(&self.pool, move |conn| {
            let mut staged = StagedChanges::new();
            conn.transaction(|conn| {
                let Some(_) = lock_open(conn, ticket.withdrawal_id)? else {
                    return Ok(());
                };
                let wallet = update_wallet_balance(conn, ticket.profile_id, -ticket.amount)?;
                let updated = write_status(conn, ticket.withdrawal_id, WithdrawalStatus::Successful, None)?;
                staged.stage("wallets", ChangeEvent::Update, &wallet);
                staged.stage("withdrawal_requests", ChangeEvent::Update, &updated);
                notify(
                    conn,
                    &mut staged,
                    ticket.profile_id,
                    "withdrawal",
                    "Withdrawal completed",
                    &format!("{} {} has been sent to your mobile money account.", ticket.amount, ticket.currency),
                )?;
                Ok::<_, AppError>(())
            })?;
            staged.publish(&hub);
            Ok(())
        })
        .await
    }

    async fn fail(
        &self,
        ticket: &WithdrawalTicket,
        status: WithdrawalStatus,
        reason: Option<String>,
    ) -> Result<(), AppError> {
        let hub = self.hub.clone();
        let withdrawal_id = ticket.withdrawal_id;
        db::run(&self.pool, move |conn| settle(conn, &hub, withdrawal_id, status, reason)).await
    }

    async fn mark_unknown(&self, ticket: &WithdrawalTicket) -> Result<(), AppError> {
        self.fail(
            ticket,
            WithdrawalStatus::Unknown,
            Some("The provider did not confirm the transfer in time".to_string()),
        )
        .await
    }
}

/// Locks the request row, returning `None` once it has reached a terminal status.
fn lock_open(conn: &mut PgConnection, withdrawal_id: Uuid) -> Result<Option<WithdrawalRequest>, AppError> {
    let request: WithdrawalRequest = withdrawal_requests::table
        .find(withdrawal_id)
        .select(WithdrawalRequest::as_select())
        .for_update()
        .first(conn)
        .optional()?
        .ok_or(AppError::NotFound("Withdrawal"))?;
    let status = request.status.parse::<WithdrawalStatus>()?;
    if status.is_terminal() {
        log::warn!("Withdrawal {} already settled as {}", withdrawal_id, status);
        return Ok(None);
    }
    Ok(Some(request))
}

fn write_status(
    conn: &mut PgConnection,
    withdrawal_id: Uuid,
    status: WithdrawalStatus,
    reason: Option<String>,
) -> Result<WithdrawalRequest, AppError> {
    let now = Utc::now();
    let completed_at = status.is_terminal().then_some(now);
    let updated = diesel::update(withdrawal_requests::table.find(withdrawal_id))
        .set((
            withdrawal_requests::status.eq(status.as_str()),
            withdrawal_requests::failure_reason.eq(reason),
            withdrawal_requests::updated_at.eq(now),
            withdrawal_requests::completed_at.eq(completed_at),
        ))
        .returning(WithdrawalRequest::as_returning())
        .get_result(conn)?;

    let ledger_status = match status {
        WithdrawalStatus::Successful => TransactionStatus::Successful,
        WithdrawalStatus::Failed | WithdrawalStatus::Expired => TransactionStatus::Failed,
        WithdrawalStatus::Pending | WithdrawalStatus::Unknown => TransactionStatus::Pending,
    };
    diesel::update(transactions::table.filter(transactions::withdrawal_id.eq(withdrawal_id)))
        .set((transactions::status.eq(ledger_status.as_str()), transactions::updated_at.eq(now)))
        .execute(conn)?;
    Ok(updated)
}

/// Records a non-successful outcome and tells the owner. The balance is untouched.
pub fn settle(
    conn: &mut PgConnection,
    hub: &RealtimeHub,
    withdrawal_id: Uuid,
    status: WithdrawalStatus,
    reason: Option<String>,
) -> Result<(), AppError> {
    let mut staged = StagedChanges::new();
    conn.transaction(|conn| {
        let Some(request) = lock_open(conn, withdrawal_id)? else {
            return Ok(());
        };
        let updated = write_status(conn, withdrawal_id, status, reason)?;
        staged.stage("withdrawal_requests", ChangeEvent::Update, &updated);

        let (title, body) = match status {
            WithdrawalStatus::Unknown => (
                "Withdrawal status unknown",
                "We could not confirm your withdrawal yet. Check again later; your balance has not been charged.",
            ),
            WithdrawalStatus::Expired => ("Withdrawal expired", "Your withdrawal expired and your balance was not charged."),
            _ => ("Withdrawal failed", "Your withdrawal failed and your balance was not charged."),
        };
        notify(conn, &mut staged, request.profile_id, "withdrawal", title, body)?;
        Ok::<_, AppError>(())
    })?;
    staged.publish(hub);
    Ok(())
}

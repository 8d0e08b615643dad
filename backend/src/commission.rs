//! Agent commissions held in escrow, and disputes over them.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db;
use crate::error::AppError;
use crate::models::{
    CommissionDispute, CommissionPayment, DisputeStatus, EscrowStatus, NewCommissionDispute, NewTransaction,
    Reservation, TransactionKind, TransactionStatus,
};
use crate::notification::notify;
use crate::realtime::{ChangeEvent, RealtimeHub, StagedChanges};
use crate::schema::{commission_disputes, commission_payments, reservations, transactions};
use crate::wallet::update_wallet_balance;
use crate::AppState;

/// Escrow only ever leaves `locked`, and only once.
pub fn check_escrow_transition(current: EscrowStatus, target: EscrowStatus) -> Result<(), AppError> {
    match (current, target) {
        (EscrowStatus::Locked, EscrowStatus::Released | EscrowStatus::Refunded) => Ok(()),
        (current, target) => Err(AppError::Conflict(format!(
            "Commission is {} and cannot be {}",
            current, target
        ))),
    }
}

pub async fn list_commissions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<CommissionPayment>>, AppError> {
    let items = db::run(&state.pool, move |conn| {
        Ok(commission_payments::table
            .filter(commission_payments::agent_id.eq(user.id))
            .order(commission_payments::created_at.desc())
            .select(CommissionPayment::as_select())
            .load(conn)?)
    })
    .await?;
    Ok(Json(items))
}

fn commission_with_reservation(
    conn: &mut PgConnection,
    commission_id: Uuid,
) -> Result<(CommissionPayment, Reservation), AppError> {
    commission_payments::table
        .inner_join(reservations::table)
        .filter(commission_payments::id.eq(commission_id))
        .select((CommissionPayment::as_select(), Reservation::as_select()))
        .first(conn)
        .optional()?
        .ok_or(AppError::NotFound("Commission"))
}

#[derive(Debug, Deserialize)]
pub struct DisputeBody {
    pub reason: String,
}

pub async fn open_dispute(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(commission_id): Path<Uuid>,
    Json(body): Json<DisputeBody>,
) -> Result<(StatusCode, Json<CommissionDispute>), AppError> {
    let reason = body.reason.trim().to_string();
    if reason.is_empty() {
        return Err(AppError::validation("Please describe the problem"));
    }
    let hub = state.hub.clone();
    let dispute = db::run(&state.pool, move |conn| {
        let (commission, reservation) = commission_with_reservation(conn, commission_id)?;
        let counterpart = if user.id == commission.agent_id {
            reservation.owner_id
        } else if user.id == reservation.owner_id {
            commission.agent_id
        } else {
            return Err(AppError::NotFound("Commission"));
        };
        if commission.escrow_status != EscrowStatus::Locked.as_str() {
            return Err(AppError::Conflict("Only commissions held in escrow can be disputed".to_string()));
        }
        let mut staged = StagedChanges::new();
        let dispute: CommissionDispute = diesel::insert_into(commission_disputes::table)
            .values(NewCommissionDispute { commission_payment_id: commission.id, raised_by: user.id, reason })
            .returning(CommissionDispute::as_returning())
            .get_result(conn)?;
        notify(
            conn,
            &mut staged,
            counterpart,
            "commission",
            "Commission disputed",
            "A dispute was opened on a commission you are part of.",
        )?;
        staged.publish(&hub);
        Ok(dispute)
    })
    .await?;
    log::info!("Dispute {} opened on commission {}", dispute.id, commission_id);
    Ok((StatusCode::CREATED, Json(dispute)))
}

pub async fn list_disputes(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<CommissionDispute>>, AppError> {
    let items = db::run(&state.pool, move |conn| {
        Ok(commission_disputes::table
            .inner_join(commission_payments::table)
            .filter(
                commission_disputes::raised_by
                    .eq(user.id)
                    .or(commission_payments::agent_id.eq(user.id)),
            )
            .order(commission_disputes::created_at.desc())
            .select(CommissionDispute::as_select())
            .load(conn)?)
    })
    .await?;
    Ok(Json(items))
}

/// Moves a locked commission to `target` and credits whoever receives the money.
fn settle_escrow(
    conn: &mut PgConnection,
    hub: &RealtimeHub,
    commission_id: Uuid,
    target: EscrowStatus,
) -> Result<CommissionPayment, AppError> {
    let mut staged = StagedChanges::new();
    let updated = conn.transaction(|conn| {
        let current: CommissionPayment = commission_payments::table
            .find(commission_id)
            .select(CommissionPayment::as_select())
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(AppError::NotFound("Commission"))?;
        check_escrow_transition(current.escrow_status.parse()?, target)?;

        let open_disputes: i64 = commission_disputes::table
            .filter(commission_disputes::commission_payment_id.eq(commission_id))
            .filter(commission_disputes::status.eq(DisputeStatus::Open.as_str()))
            .count()
            .get_result(conn)?;
        if target == EscrowStatus::Released && open_disputes > 0 {
            return Err(AppError::Conflict("Resolve the open disputes before releasing".to_string()));
        }

        let updated: CommissionPayment = diesel::update(commission_payments::table.find(commission_id))
            .set((
                commission_payments::escrow_status.eq(target.as_str()),
                commission_payments::updated_at.eq(Utc::now()),
            ))
            .returning(CommissionPayment::as_returning())
            .get_result(conn)?;

        // Released money goes to the agent; refunded money goes back to the owner it was withheld from.
        let (recipient, kind, title) = match target {
            EscrowStatus::Released => (updated.agent_id, TransactionKind::Commission, "Commission released"),
            _ => {
                let owner_id: Uuid = reservations::table
                    .find(updated.reservation_id)
                    .select(reservations::owner_id)
                    .first(conn)?;
                (owner_id, TransactionKind::Refund, "Commission refunded")
            }
        };
        let wallet = update_wallet_balance(conn, recipient, updated.amount)?;
        diesel::insert_into(transactions::table)
            .values(NewTransaction {
                profile_id: recipient,
                reservation_id: Some(updated.reservation_id),
                withdrawal_id: None,
                kind: kind.as_str().to_string(),
                amount: updated.amount,
                currency: updated.currency.clone(),
                status: TransactionStatus::Successful.as_str().to_string(),
                provider_reference: None,
            })
            .execute(conn)?;

        staged.stage("commission_payments", ChangeEvent::Update, &updated);
        staged.stage("wallets", ChangeEvent::Update, &wallet);
        notify(
            conn,
            &mut staged,
            recipient,
            "commission",
            title,
            &format!("{} {} was credited to your wallet.", updated.amount, updated.currency),
        )?;
        Ok::<_, AppError>(updated)
    })?;
    staged.publish(hub);
    Ok(updated)
}

pub async fn release_commission(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(commission_id): Path<Uuid>,
) -> Result<Json<CommissionPayment>, AppError> {
    let hub = state.hub.clone();
    let commission =
        db::run(&state.pool, move |conn| settle_escrow(conn, &hub, commission_id, EscrowStatus::Released)).await?;
    log::info!("Commission {} released by {}", commission_id, admin.id);
    Ok(Json(commission))
}

pub async fn refund_commission(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(commission_id): Path<Uuid>,
) -> Result<Json<CommissionPayment>, AppError> {
    let hub = state.hub.clone();
    let commission =
        db::run(&state.pool, move |conn| settle_escrow(conn, &hub, commission_id, EscrowStatus::Refunded)).await?;
    log::info!("Commission {} refunded by {}", commission_id, admin.id);
    Ok(Json(commission))
}

#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    pub status: DisputeStatus,
    pub resolution: String,
}

pub async fn resolve_dispute(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(dispute_id): Path<Uuid>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<CommissionDispute>, AppError> {
    if body.status == DisputeStatus::Open {
        return Err(AppError::validation("A dispute can only be resolved or rejected"));
    }
    let resolution = body.resolution.trim().to_string();
    let hub = state.hub.clone();
    let dispute = db::run(&state.pool, move |conn| {
        let dispute: CommissionDispute = diesel::update(
            commission_disputes::table
                .find(dispute_id)
                .filter(commission_disputes::status.eq(DisputeStatus::Open.as_str())),
        )
        .set((
            commission_disputes::status.eq(body.status.as_str()),
            commission_disputes::resolution.eq(Some(resolution)),
            commission_disputes::updated_at.eq(Utc::now()),
        ))
        .returning(CommissionDispute::as_returning())
        .get_result(conn)
        .optional()?
        .ok_or(AppError::NotFound("Open dispute"))?;
        let mut staged = StagedChanges::new();
        notify(
            conn,
            &mut staged,
            dispute.raised_by,
            "commission",
            "Dispute closed",
            &format!("Your dispute was marked {}.", dispute.status),
        )?;
        staged.publish(&hub);
        Ok(dispute)
    })
    .await?;
    log::info!("Dispute {} closed by {}", dispute_id, admin.id);
    Ok(Json(dispute))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escrow_leaves_locked_exactly_once() {
        assert!(check_escrow_transition(EscrowStatus::Locked, EscrowStatus::Released).is_ok());
        assert!(check_escrow_transition(EscrowStatus::Locked, EscrowStatus::Refunded).is_ok());
        assert!(matches!(
            check_escrow_transition(EscrowStatus::Released, EscrowStatus::Refunded),
            Err(AppError::Conflict(_))
        ));
        assert!(check_escrow_transition(EscrowStatus::Refunded, EscrowStatus::Released).is_err());
        assert!(check_escrow_transition(EscrowStatus::Locked, EscrowStatus::Locked).is_err());
    }
}

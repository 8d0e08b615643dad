//! Reservations paid by mobile-money collection.
//!
//! Creating a reservation asks the tenant's phone to pay; the payment is then
//! settled by `POST /reservations/:id/payment/refresh`. Settlement is
//! idempotent and books a property at most once: a collection that arrives
//! for a cancelled reservation, or for a property someone else already paid
//! for, credits nobody and is left `refund_due`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{NaiveDate, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db;
use crate::error::{with_timeout, AppError};
use crate::models::{
    CommissionPayment, NewCommissionPayment, NewReservation, NewTransaction, PaymentState, Profile, Property,
    PropertyStatus, Reservation, ReservationStatus, Role, TransactionKind, TransactionStatus,
};
use crate::notification::notify;
use crate::payment::{normalize_msisdn, PaymentOrder, PaymentStatus};
use crate::realtime::{ChangeEvent, RealtimeHub, StagedChanges};
use crate::schema::{commission_payments, profiles, properties, reservations, transactions};
use crate::wallet::{update_wallet_balance, GATEWAY_CALL_LIMIT};
use crate::AppState;

/// Splits `amount` into `(commission, payout)` at `rate_bps` basis points.
pub fn commission_split(amount: i64, rate_bps: i64) -> (i64, i64) {
    let rate = i128::from(rate_bps.clamp(0, 10_000));
    let commission = (i128::from(amount) * rate / 10_000) as i64;
    (commission, amount - commission)
}

pub fn check_dates(start: NaiveDate, end: Option<NaiveDate>, today: NaiveDate) -> Result<(), AppError> {
    if start < today {
        return Err(AppError::validation("The start date cannot be in the past"));
    }
    if end.is_some_and(|end| end <= start) {
        return Err(AppError::validation("The end date must be after the start date"));
    }
    Ok(())
}

/// Only unpaid reservations can be cancelled from the app.
pub fn can_cancel(status: ReservationStatus, payment: PaymentState) -> bool {
    matches!(status, ReservationStatus::Pending | ReservationStatus::Confirmed)
        && matches!(payment, PaymentState::Pending | PaymentState::Failed)
}

/// Payment state a reservation is left in once cancelled. An unresolved
/// collection is voided so it can never confirm the booking.
pub fn payment_after_cancel(payment: PaymentState) -> PaymentState {
    match payment {
        PaymentState::Pending => PaymentState::Voided,
        other => other,
    }
}

/// Whether the gateway may still report on this reservation's collection.
pub fn awaits_collection(payment: PaymentState) -> bool {
    matches!(payment, PaymentState::Pending | PaymentState::Voided)
}

/// What a successful collection does to a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Book the property, pay the owner, escrow the commission.
    Confirm,
    /// Keep the money off every wallet and owe it back to the tenant.
    Refund,
    /// Already settled.
    Unchanged,
}

pub fn settlement_for(status: ReservationStatus, payment: PaymentState, property: PropertyStatus) -> Settlement {
    match (status, payment) {
        (ReservationStatus::Pending, PaymentState::Pending) if property == PropertyStatus::Available => {
            Settlement::Confirm
        }
        (_, PaymentState::Pending | PaymentState::Voided) => Settlement::Refund,
        _ => Settlement::Unchanged,
    }
}

fn ledger_row(
    profile_id: Uuid,
    reservation: &Reservation,
    kind: TransactionKind,
    amount: i64,
    status: TransactionStatus,
) -> NewTransaction {
    NewTransaction {
        profile_id,
        reservation_id: Some(reservation.id),
        withdrawal_id: None,
        kind: kind.as_str().to_string(),
        amount,
        currency: reservation.currency.clone(),
        status: status.as_str().to_string(),
        provider_reference: reservation.payment_reference.clone(),
    }
}

fn find_reservation(conn: &mut PgConnection, user: &AuthUser, reservation_id: Uuid) -> Result<Reservation, AppError> {
    let reservation: Reservation = reservations::table
        .find(reservation_id)
        .select(Reservation::as_select())
        .first(conn)
        .optional()?
        .ok_or(AppError::NotFound("Reservation"))?;
    if !user.is_admin() && reservation.tenant_id != user.id && reservation.owner_id != user.id {
        return Err(AppError::NotFound("Reservation"));
    }
    Ok(reservation)
}

fn lock_reservation(conn: &mut PgConnection, reservation_id: Uuid) -> Result<Reservation, AppError> {
    Ok(reservations::table
        .find(reservation_id)
        .select(Reservation::as_select())
        .for_update()
        .first(conn)?)
}

fn set_payment_transaction(
    conn: &mut PgConnection,
    reservation_id: Uuid,
    status: TransactionStatus,
) -> Result<usize, AppError> {
    Ok(diesel::update(
        transactions::table
            .filter(transactions::reservation_id.eq(reservation_id))
            .filter(transactions::kind.eq(TransactionKind::ReservationPayment.as_str())),
    )
    .set((transactions::status.eq(status.as_str()), transactions::updated_at.eq(Utc::now())))
    .execute(conn)?)
}

fn set_payment_failed(conn: &mut PgConnection, hub: &RealtimeHub, reservation_id: Uuid) -> Result<Reservation, AppError> {
    let mut staged = StagedChanges::new();
    let reservation = conn.transaction(|conn| {
        let open = vec![PaymentState::Pending.as_str(), PaymentState::Voided.as_str()];
        let updated: Option<Reservation> = diesel::update(
            reservations::table
                .find(reservation_id)
                .filter(reservations::payment_status.eq_any(open)),
        )
        .set((
            reservations::payment_status.eq(PaymentState::Failed.as_str()),
            reservations::status.eq(ReservationStatus::Cancelled.as_str()),
            reservations::updated_at.eq(Utc::now()),
        ))
        .returning(Reservation::as_returning())
        .get_result(conn)
        .optional()?;
        let Some(reservation) = updated else {
            // Already settled by a concurrent refresh.
            return Ok(reservations::table.find(reservation_id).select(Reservation::as_select()).first(conn)?);
        };
        set_payment_transaction(conn, reservation_id, TransactionStatus::Failed)?;
        staged.stage("reservations", ChangeEvent::Update, &reservation);
        notify(
            conn,
            &mut staged,
            reservation.tenant_id,
            "reservation",
            "Payment failed",
            "Your reservation payment did not go through and the reservation was cancelled.",
        )?;
        Ok::<_, AppError>(reservation)
    })?;
    staged.publish(hub);
    Ok(reservation)
}

/// Settles a successful collection. Confirms the booking and pays the owner
/// when the reservation is still pending on an available property; otherwise
/// credits nobody and marks the payment `refund_due`.
pub fn settle_paid(
    conn: &mut PgConnection,
    hub: &RealtimeHub,
    reservation_id: Uuid,
    commission_rate_bps: i64,
) -> Result<Reservation, AppError> {
    let mut staged = StagedChanges::new();
    let reservation = conn.transaction(|conn| {
        // Property before reservation, the order booking also locks in.
        let property_id: Uuid = reservations::table
            .find(reservation_id)
            .select(reservations::property_id)
            .first(conn)?;
        let property: Property = properties::table
            .find(property_id)
            .select(Property::as_select())
            .for_update()
            .first(conn)?;
        let current = lock_reservation(conn, reservation_id)?;
        let settlement = settlement_for(
            current.status.parse()?,
            current.payment_status.parse()?,
            property.status.parse()?,
        );
        match settlement {
            Settlement::Unchanged => Ok(current),
            Settlement::Refund => refund_collection(conn, &mut staged, current, &property),
            Settlement::Confirm => confirm_booking(conn, &mut staged, current, property, commission_rate_bps),
        }
    })?;
    staged.publish(hub);
    Ok(reservation)
}

fn refund_collection(
    conn: &mut PgConnection,
    staged: &mut StagedChanges,
    current: Reservation,
    property: &Property,
) -> Result<Reservation, AppError> {
    let reservation: Reservation = diesel::update(reservations::table.find(current.id))
        .set((
            reservations::status.eq(ReservationStatus::Cancelled.as_str()),
            reservations::payment_status.eq(PaymentState::RefundDue.as_str()),
            reservations::updated_at.eq(Utc::now()),
        ))
        .returning(Reservation::as_returning())
        .get_result(conn)?;
    set_payment_transaction(conn, reservation.id, TransactionStatus::Successful)?;
    diesel::insert_into(transactions::table)
        .values(ledger_row(
            reservation.tenant_id,
            &reservation,
            TransactionKind::Refund,
            reservation.amount,
            TransactionStatus::Pending,
        ))
        .execute(conn)?;
    staged.stage("reservations", ChangeEvent::Update, &reservation);
    notify(
        conn,
        staged,
        reservation.tenant_id,
        "reservation",
        "Payment will be refunded",
        &format!(
            "Your payment of {} {} for \"{}\" was received, but the reservation could not be kept. It will be refunded.",
            reservation.amount, reservation.currency, property.title
        ),
    )?;
    log::warn!(
        "Reservation {} was paid after it could no longer be booked (was {}/{}, property {}); refund due",
        reservation.id,
        current.status,
        current.payment_status,
        property.status
    );
    Ok(reservation)
}

fn confirm_booking(
    conn: &mut PgConnection,
    staged: &mut StagedChanges,
    current: Reservation,
    property: Property,
    commission_rate_bps: i64,
) -> Result<Reservation, AppError> {
    let reservation_id = current.id;
    let reservation: Reservation = diesel::update(reservations::table.find(reservation_id))
        .set((
            reservations::status.eq(ReservationStatus::Confirmed.as_str()),
            reservations::payment_status.eq(PaymentState::Paid.as_str()),
            reservations::updated_at.eq(Utc::now()),
        ))
        .returning(Reservation::as_returning())
        .get_result(conn)?;
    let property: Property = diesel::update(properties::table.find(property.id))
        .set((
            properties::status.eq(PropertyStatus::Reserved.as_str()),
            properties::updated_at.eq(Utc::now()),
        ))
        .returning(Property::as_returning())
        .get_result(conn)?;
    set_payment_transaction(conn, reservation_id, TransactionStatus::Successful)?;

    let (commission, payout) = commission_split(reservation.amount, commission_rate_bps);
    let wallet = update_wallet_balance(conn, reservation.owner_id, payout)?;
    diesel::insert_into(transactions::table)
        .values(ledger_row(
            reservation.owner_id,
            &reservation,
            TransactionKind::Payout,
            payout,
            TransactionStatus::Successful,
        ))
        .execute(conn)?;

    let verified_agent = match property.agent_id {
        Some(agent_id) => profiles::table
            .find(agent_id)
            .select(Profile::as_select())
            .first(conn)
            .optional()?
            .filter(|agent| agent.is_verified && agent.role == Role::Agent.as_str()),
        None => None,
    };
    if let Some(agent) = verified_agent.filter(|_| commission > 0) {
        let escrow: CommissionPayment = diesel::insert_into(commission_payments::table)
            .values(NewCommissionPayment {
                reservation_id,
                agent_id: agent.id,
                amount: commission,
                currency: reservation.currency.clone(),
            })
            .returning(CommissionPayment::as_returning())
            .get_result(conn)?;
        staged.stage("commission_payments", ChangeEvent::Insert, &escrow);
        notify(
            conn,
            staged,
            agent.id,
            "commission",
            "Commission held in escrow",
            &format!("A commission of {} {} is locked until release.", commission, reservation.currency),
        )?;
    }

    // Competing requests for the same property can no longer be booked.
    let displaced: Vec<Reservation> = diesel::update(
        reservations::table
            .filter(reservations::property_id.eq(property.id))
            .filter(reservations::id.ne(reservation_id))
            .filter(reservations::status.eq(ReservationStatus::Pending.as_str()))
            .filter(reservations::payment_status.eq(PaymentState::Pending.as_str())),
    )
    .set((
        reservations::status.eq(ReservationStatus::Cancelled.as_str()),
        reservations::payment_status.eq(PaymentState::Voided.as_str()),
        reservations::updated_at.eq(Utc::now()),
    ))
    .returning(Reservation::as_returning())
    .get_results(conn)?;
    for other in &displaced {
        staged.stage("reservations", ChangeEvent::Update, other);
        notify(
            conn,
            staged,
            other.tenant_id,
            "reservation",
            "Property no longer available",
            &format!("\"{}\" was reserved by someone else and your request was cancelled.", property.title),
        )?;
    }

    staged.stage("reservations", ChangeEvent::Update, &reservation);
    staged.stage("properties", ChangeEvent::Update, &property);
    staged.stage("wallets", ChangeEvent::Update, &wallet);
    notify(
        conn,
        staged,
        reservation.owner_id,
        "reservation",
        "Reservation paid",
        &format!("{} {} was credited to your wallet for \"{}\".", payout, reservation.currency, property.title),
    )?;
    notify(
        conn,
        staged,
        reservation.tenant_id,
        "reservation",
        "Reservation confirmed",
        &format!("Your payment for \"{}\" was received.", property.title),
    )?;
    log::info!(
        "Reservation {} paid; owner credited {}, commission {}, {} competing request(s) voided",
        reservation.id,
        payout,
        commission,
        displaced.len()
    );
    Ok(reservation)
}

#[derive(Debug, Deserialize)]
pub struct ReservationBody {
    pub property_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub phone_number: String,
}

pub async fn create_reservation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<ReservationBody>,
) -> Result<(StatusCode, Json<Reservation>), AppError> {
    let phone = normalize_msisdn(&body.phone_number)
        .ok_or_else(|| AppError::validation("Please enter a valid mobile money number"))?;
    check_dates(body.start_date, body.end_date, Utc::now().date_naive())?;

    let tenant_id = user.id;
    let stored_phone = phone.clone();
    let reservation = db::run(&state.pool, move |conn| {
        conn.transaction(|conn| {
            let property: Property = properties::table
                .find(body.property_id)
                .select(Property::as_select())
                .for_update()
                .first(conn)
                .optional()?
                .ok_or(AppError::NotFound("Property"))?;
            if property.owner_id == tenant_id {
                return Err(AppError::validation("You cannot reserve your own listing"));
            }
            if property.status != PropertyStatus::Available.as_str() {
                return Err(AppError::Conflict("This property is not available".to_string()));
            }
            let reservation: Reservation = diesel::insert_into(reservations::table)
                .values(NewReservation {
                    property_id: property.id,
                    tenant_id,
                    owner_id: property.owner_id,
                    start_date: body.start_date,
                    end_date: body.end_date,
                    amount: property.price,
                    currency: property.currency,
                    phone_number: stored_phone,
                })
                .returning(Reservation::as_returning())
                .get_result(conn)?;
            diesel::insert_into(transactions::table)
                .values(ledger_row(
                    tenant_id,
                    &reservation,
                    TransactionKind::ReservationPayment,
                    reservation.amount,
                    TransactionStatus::Pending,
                ))
                .execute(conn)?;
            Ok(reservation)
        })
    })
    .await?;

    let order = PaymentOrder {
        external_id: reservation.id.to_string(),
        amount: reservation.amount,
        currency: reservation.currency.clone(),
        phone_number: phone,
        note: "Property reservation".to_string(),
    };
    let gateway = state.gateway.clone();
    let requested = with_timeout("Payment request", GATEWAY_CALL_LIMIT, async move {
        Ok(gateway.request_payment(&order).await?)
    })
    .await;

    let hub = state.hub.clone();
    let reservation_id = reservation.id;
    let reference = match requested {
        Ok(reference) => reference,
        Err(e) => {
            log::warn!("Payment request for reservation {} failed: {}", reservation_id, e);
            db::run(&state.pool, move |conn| set_payment_failed(conn, &hub, reservation_id)).await?;
            return Err(e);
        }
    };

    let reservation = db::run(&state.pool, move |conn| {
        let mut staged = StagedChanges::new();
        let reservation = conn.transaction(|conn| {
            let reservation: Reservation = diesel::update(reservations::table.find(reservation_id))
                .set((reservations::payment_reference.eq(&reference), reservations::updated_at.eq(Utc::now())))
                .returning(Reservation::as_returning())
                .get_result(conn)?;
            diesel::update(transactions::table.filter(transactions::reservation_id.eq(reservation_id)))
                .set(transactions::provider_reference.eq(&reference))
                .execute(conn)?;
            staged.stage("reservations", ChangeEvent::Insert, &reservation);
            notify(
                conn,
                &mut staged,
                reservation.owner_id,
                "reservation",
                "New reservation",
                "A tenant has requested a reservation and is completing payment.",
            )?;
            Ok::<_, AppError>(reservation)
        })?;
        staged.publish(&hub);
        Ok(reservation)
    })
    .await?;
    log::info!("Reservation {} created by {}", reservation.id, user.id);
    Ok((StatusCode::CREATED, Json(reservation)))
}

pub async fn refresh_payment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<Reservation>, AppError> {
    let reservation = db::run(&state.pool, move |conn| find_reservation(conn, &user, reservation_id)).await?;
    if !awaits_collection(reservation.payment_status.parse()?) {
        return Ok(Json(reservation));
    }
    let Some(reference) = reservation.payment_reference.clone() else {
        return Ok(Json(reservation));
    };

    let gateway = state.gateway.clone();
    let report = with_timeout("Payment status check", GATEWAY_CALL_LIMIT, async move {
        Ok(gateway.payment_status(&reference).await?)
    })
    .await?;

    let hub = state.hub.clone();
    let rate = state.config.commission_rate_bps;
    let updated = match report.status {
        PaymentStatus::Pending => reservation,
        PaymentStatus::Successful => {
            db::run(&state.pool, move |conn| settle_paid(conn, &hub, reservation_id, rate)).await?
        }
        PaymentStatus::Failed | PaymentStatus::Expired => {
            log::info!("Payment for reservation {} ended as {:?}", reservation_id, report.status);
            db::run(&state.pool, move |conn| set_payment_failed(conn, &hub, reservation_id)).await?
        }
    };
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationSide {
    Tenant,
    Owner,
}

#[derive(Debug, Deserialize)]
pub struct ReservationQuery {
    pub side: Option<ReservationSide>,
    pub status: Option<ReservationStatus>,
}

pub async fn list_reservations(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ReservationQuery>,
) -> Result<Json<Vec<Reservation>>, AppError> {
    let items = db::run(&state.pool, move |conn| {
        let mut q = reservations::table.into_boxed();
        q = match query.side {
            Some(ReservationSide::Tenant) => q.filter(reservations::tenant_id.eq(user.id)),
            Some(ReservationSide::Owner) => q.filter(reservations::owner_id.eq(user.id)),
            None => q.filter(reservations::tenant_id.eq(user.id).or(reservations::owner_id.eq(user.id))),
        };
        if let Some(status) = query.status {
            q = q.filter(reservations::status.eq(status.as_str()));
        }
        Ok(q.order(reservations::created_at.desc())
            .select(Reservation::as_select())
            .load(conn)?)
    })
    .await?;
    Ok(Json(items))
}

pub async fn cancel_reservation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<Reservation>, AppError> {
    let hub = state.hub.clone();
    let reservation = db::run(&state.pool, move |conn| {
        let mut staged = StagedChanges::new();
        let reservation = conn.transaction(|conn| {
            find_reservation(conn, &user, reservation_id)?;
            let current = lock_reservation(conn, reservation_id)?;
            let payment = current.payment_status.parse::<PaymentState>()?;
            if !can_cancel(current.status.parse()?, payment) {
                return Err(AppError::Conflict("This reservation can no longer be cancelled".to_string()));
            }
            let reservation: Reservation = diesel::update(reservations::table.find(reservation_id))
                .set((
                    reservations::status.eq(ReservationStatus::Cancelled.as_str()),
                    reservations::payment_status.eq(payment_after_cancel(payment).as_str()),
                    reservations::updated_at.eq(Utc::now()),
                ))
                .returning(Reservation::as_returning())
                .get_result(conn)?;
            staged.stage("reservations", ChangeEvent::Update, &reservation);
            let counterpart = if user.id == reservation.tenant_id { reservation.owner_id } else { reservation.tenant_id };
            notify(conn, &mut staged, counterpart, "reservation", "Reservation cancelled", "A reservation was cancelled.")?;
            Ok(reservation)
        })?;
        staged.publish(&hub);
        Ok(reservation)
    })
    .await?;
    Ok(Json(reservation))
}

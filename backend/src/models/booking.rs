use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::schema::{reservations, transactions};

text_enum!(ReservationStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    Cancelled => "cancelled",
    Completed => "completed",
});

// `voided`: cancelled before the collection resolved. `refund_due`: money was
// collected for a booking that could not stand and nobody was credited.
text_enum!(PaymentState {
    Pending => "pending",
    Paid => "paid",
    Failed => "failed",
    Voided => "voided",
    RefundDue => "refund_due",
});

text_enum!(TransactionKind {
    ReservationPayment => "reservation_payment",
    Payout => "payout",
    Withdrawal => "withdrawal",
    Commission => "commission",
    Refund => "refund",
});

text_enum!(TransactionStatus {
    Pending => "pending",
    Successful => "successful",
    Failed => "failed",
});

#[derive(Debug, Clone, Serialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = reservations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Reservation {
    pub id: Uuid,
    pub property_id: Uuid,
    pub tenant_id: Uuid,
    pub owner_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub amount: i64,
    pub currency: String,
    pub phone_number: String,
    pub status: String,
    pub payment_status: String,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = reservations)]
pub struct NewReservation {
    pub property_id: Uuid,
    pub tenant_id: Uuid,
    pub owner_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub amount: i64,
    pub currency: String,
    pub phone_number: String,
}

#[derive(Debug, Clone, Serialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = transactions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Transaction {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub reservation_id: Option<Uuid>,
    pub withdrawal_id: Option<Uuid>,
    pub kind: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub provider_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = transactions)]
pub struct NewTransaction {
    pub profile_id: Uuid,
    pub reservation_id: Option<Uuid>,
    pub withdrawal_id: Option<Uuid>,
    pub kind: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub provider_reference: Option<String>,
}

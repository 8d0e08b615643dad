use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::schema::{commission_disputes, commission_payments, wallets, withdrawal_requests};

text_enum!(WithdrawalStatus {
    Pending => "PENDING",
    Successful => "SUCCESSFUL",
    Failed => "FAILED",
    Expired => "EXPIRED",
    Unknown => "UNKNOWN",
});

impl WithdrawalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WithdrawalStatus::Successful | WithdrawalStatus::Failed | WithdrawalStatus::Expired)
    }
}

text_enum!(EscrowStatus {
    Locked => "locked",
    Released => "released",
    Refunded => "refunded",
});

text_enum!(DisputeStatus {
    Open => "open",
    Resolved => "resolved",
    Rejected => "rejected",
});

#[derive(Debug, Clone, Serialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = wallets)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Wallet {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub balance: i64,
    pub currency: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = wallets)]
pub struct NewWallet {
    pub profile_id: Uuid,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = withdrawal_requests)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct WithdrawalRequest {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub profile_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub phone_number: String,
    pub status: String,
    pub provider_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = withdrawal_requests)]
pub struct NewWithdrawalRequest {
    pub wallet_id: Uuid,
    pub profile_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub phone_number: String,
}

#[derive(Debug, Clone, Serialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = commission_payments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CommissionPayment {
    pub id: Uuid,
    pub reservation_id: Uuid,
    pub agent_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub escrow_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = commission_payments)]
pub struct NewCommissionPayment {
    pub reservation_id: Uuid,
    pub agent_id: Uuid,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = commission_disputes)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CommissionDispute {
    pub id: Uuid,
    pub commission_payment_id: Uuid,
    pub raised_by: Uuid,
    pub reason: String,
    pub status: String,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = commission_disputes)]
pub struct NewCommissionDispute {
    pub commission_payment_id: Uuid,
    pub raised_by: Uuid,
    pub reason: String,
}

//! Mobile-money gateway seam.
//!
//! Withdrawals are gateway *transfers* (disbursements to the agent's phone);
//! reservation payments are *collections* (request-to-pay from the tenant's
//! phone). Both are asynchronous on the provider side: submission returns a
//! reference that is later polled for a [`PaymentStatus`].

pub mod momo;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("not configured: {0} is missing")]
    NotConfigured(&'static str),
    #[error("unexpected response: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Successful,
    Failed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: PaymentStatus,
    pub reason: Option<String>,
}

impl StatusReport {
    pub fn pending() -> Self {
        Self { status: PaymentStatus::Pending, reason: None }
    }
}

/// A money movement between the marketplace and a mobile-money account.
#[derive(Debug, Clone)]
pub struct PaymentOrder {
    /// Our own identifier, echoed back by the provider as `externalId`.
    pub external_id: String,
    /// Amount in minor units.
    pub amount: i64,
    pub currency: String,
    /// MSISDN of the mobile-money account.
    pub phone_number: String,
    pub note: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Pays `order.amount` out to `order.phone_number`. Returns the provider reference.
    async fn initiate_transfer(&self, order: &PaymentOrder) -> Result<String, GatewayError>;

    async fn transfer_status(&self, reference: &str) -> Result<StatusReport, GatewayError>;

    /// Asks `order.phone_number` to pay `order.amount`. Returns the provider reference.
    async fn request_payment(&self, order: &PaymentOrder) -> Result<String, GatewayError>;

    async fn payment_status(&self, reference: &str) -> Result<StatusReport, GatewayError>;
}

/// Normalises an MSISDN: strips spaces, dashes and a leading `+`.
pub fn normalize_msisdn(raw: &str) -> Option<String> {
    let digits: String = raw
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .collect();
    if (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
        Some(digits)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msisdn_normalisation() {
        assert_eq!(normalize_msisdn("+256 772-123456").as_deref(), Some("256772123456"));
        assert_eq!(normalize_msisdn("46733123453").as_deref(), Some("46733123453"));
        assert!(normalize_msisdn("12345").is_none());
        assert!(normalize_msisdn("25677abc3456").is_none());
    }
}

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{GatewayError, PaymentGateway, PaymentOrder, PaymentStatus, StatusReport};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Tokens are refreshed this long before the provider says they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MomoSettings {
    pub base_url: String,
    pub api_user: String,
    pub api_key: String,
    pub subscription_key: String,
    pub target_environment: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Product {
    Disbursement,
    Collection,
}

impl Product {
    fn path(&self) -> &'static str {
        match self {
            Product::Disbursement => "disbursement",
            Product::Collection => "collection",
        }
    }

    /// Endpoint under `/{product}/v1_0/` that creates and reports on requests.
    fn resource(&self) -> &'static str {
        match self {
            Product::Disbursement => "transfer",
            Product::Collection => "requesttopay",
        }
    }

    /// Body key naming the counterparty account.
    fn party_key(&self) -> &'static str {
        match self {
            Product::Disbursement => "payee",
            Product::Collection => "payer",
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + TOKEN_EXPIRY_MARGIN < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
    #[serde(default)]
    reason: Option<Value>,
}

/// MTN MoMo Open API client.
pub struct MomoGateway {
    http: reqwest::Client,
    settings: MomoSettings,
    tokens: Mutex<HashMap<Product, CachedToken>>,
}

impl MomoGateway {
    pub fn new(settings: MomoSettings) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, settings, tokens: Mutex::new(HashMap::new()) })
    }

    fn ensure_configured(&self) -> Result<(), GatewayError> {
        if self.settings.api_user.is_empty() {
            return Err(GatewayError::NotConfigured("MOMO_API_USER"));
        }
        if self.settings.api_key.is_empty() {
            return Err(GatewayError::NotConfigured("MOMO_API_KEY"));
        }
        if self.settings.subscription_key.is_empty() {
            return Err(GatewayError::NotConfigured("MOMO_SUBSCRIPTION_KEY"));
        }
        Ok(())
    }

    async fn access_token(&self, product: Product) -> Result<String, GatewayError> {
        self.ensure_configured()?;
        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(&product).filter(|t| t.is_fresh(Instant::now())) {
            return Ok(token.value.clone());
        }

        let url = format!("{}/{}/token/", self.settings.base_url, product.path());
        let response = self
            .http
            .post(url)
            .basic_auth(&self.settings.api_user, Some(&self.settings.api_key))
            .header("Ocp-Apim-Subscription-Key", &self.settings.subscription_key)
            .send()
            .await?;
        let response = check_status(response).await?;
        let token: TokenResponse = response.json().await?;
        log::debug!("Refreshed MoMo {} token, valid for {}s", product.path(), token.expires_in);

        tokens.insert(
            product,
            CachedToken {
                value: token.access_token.clone(),
                expires_at: Instant::now() + Duration::from_secs(token.expires_in),
            },
        );
        Ok(token.access_token)
    }

    async fn submit(&self, product: Product, order: &PaymentOrder) -> Result<String, GatewayError> {
        let token = self.access_token(product).await?;
        let reference = Uuid::new_v4().to_string();
        let url = format!("{}/{}/v1_0/{}", self.settings.base_url, product.path(), product.resource());

        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .header("X-Reference-Id", &reference)
            .header("X-Target-Environment", &self.settings.target_environment)
            .header("Ocp-Apim-Subscription-Key", &self.settings.subscription_key)
            .json(&order_body(product, order))
            .send()
            .await?;
        check_status(response).await?;
        log::info!(
            "Submitted MoMo {} {} for {} {}",
            product.resource(),
            reference,
            order.amount,
            order.currency
        );
        Ok(reference)
    }

    async fn status(&self, product: Product, reference: &str) -> Result<StatusReport, GatewayError> {
        let token = self.access_token(product).await?;
        let url = format!(
            "{}/{}/v1_0/{}/{}",
            self.settings.base_url,
            product.path(),
            product.resource(),
            reference
        );

        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .header("X-Target-Environment", &self.settings.target_environment)
            .header("Ocp-Apim-Subscription-Key", &self.settings.subscription_key)
            .send()
            .await?;
        let body: StatusBody = check_status(response).await?.json().await?;
        parse_status(body)
    }
}

#[async_trait]
impl PaymentGateway for MomoGateway {
    async fn initiate_transfer(&self, order: &PaymentOrder) -> Result<String, GatewayError> {
        self.submit(Product::Disbursement, order).await
    }

    async fn transfer_status(&self, reference: &str) -> Result<StatusReport, GatewayError> {
        self.status(Product::Disbursement, reference).await
    }

    async fn request_payment(&self, order: &PaymentOrder) -> Result<String, GatewayError> {
        self.submit(Product::Collection, order).await
    }

    async fn payment_status(&self, reference: &str) -> Result<StatusReport, GatewayError> {
        self.status(Product::Collection, reference).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Rejected { status: status.as_u16(), body })
}

fn order_body(product: Product, order: &PaymentOrder) -> Value {
    let mut body = json!({
        "amount": order.amount.to_string(),
        "currency": order.currency,
        "externalId": order.external_id,
        "payerMessage": order.note,
        "payeeNote": order.note,
    });
    body[product.party_key()] = json!({
        "partyIdType": "MSISDN",
        "partyId": order.phone_number,
    });
    body
}

fn parse_status(body: StatusBody) -> Result<StatusReport, GatewayError> {
    let status = match body.status.to_ascii_uppercase().as_str() {
        "PENDING" | "ONGOING" | "CREATED" => PaymentStatus::Pending,
        "SUCCESSFUL" => PaymentStatus::Successful,
        "FAILED" | "REJECTED" => PaymentStatus::Failed,
        "TIMEOUT" | "EXPIRED" => PaymentStatus::Expired,
        other => return Err(GatewayError::Protocol(format!("unknown status '{}'", other))),
    };
    let reason = body.reason.map(|reason| match reason {
        Value::String(text) => text,
        Value::Object(map) => {
            let text = map
                .get("message")
                .or_else(|| map.get("code"))
                .and_then(Value::as_str)
                .map(str::to_string);
            text.unwrap_or_else(|| Value::Object(map).to_string())
        }
        other => other.to_string(),
    });
    Ok(StatusReport { status, reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> PaymentOrder {
        PaymentOrder {
            external_id: "w-1".to_string(),
            amount: 25_000,
            currency: "EUR".to_string(),
            phone_number: "46733123453".to_string(),
            note: "Wallet withdrawal".to_string(),
        }
    }

    fn body(status: &str, reason: Option<Value>) -> StatusBody {
        StatusBody { status: status.to_string(), reason }
    }

    #[test]
    fn transfer_body_names_the_payee() {
        let body = order_body(Product::Disbursement, &order());
        assert_eq!(body["amount"], "25000");
        assert_eq!(body["payee"]["partyId"], "46733123453");
        assert!(body.get("payer").is_none());
    }

    #[test]
    fn collection_body_names_the_payer() {
        let body = order_body(Product::Collection, &order());
        assert_eq!(body["payer"]["partyIdType"], "MSISDN");
        assert_eq!(body["externalId"], "w-1");
    }

    #[test]
    fn provider_statuses_map_onto_payment_status() {
        assert_eq!(parse_status(body("SUCCESSFUL", None)).unwrap().status, PaymentStatus::Successful);
        assert_eq!(parse_status(body("pending", None)).unwrap().status, PaymentStatus::Pending);
        assert_eq!(parse_status(body("REJECTED", None)).unwrap().status, PaymentStatus::Failed);
        assert_eq!(parse_status(body("TIMEOUT", None)).unwrap().status, PaymentStatus::Expired);
        assert!(parse_status(body("WEIRD", None)).is_err());
    }

    #[test]
    fn failure_reason_is_flattened() {
        let report = parse_status(body("FAILED", Some(json!("PAYEE_NOT_FOUND")))).unwrap();
        assert_eq!(report.reason.as_deref(), Some("PAYEE_NOT_FOUND"));
        let report = parse_status(body("FAILED", Some(json!({"code": "NOT_ENOUGH_FUNDS"})))).unwrap();
        assert_eq!(report.reason.as_deref(), Some("NOT_ENOUGH_FUNDS"));
    }

    #[test]
    fn token_freshness_respects_margin() {
        let now = Instant::now();
        let token = CachedToken { value: "t".to_string(), expires_at: now + Duration::from_secs(3600) };
        assert!(token.is_fresh(now));
        let stale = CachedToken { value: "t".to_string(), expires_at: now + Duration::from_secs(10) };
        assert!(!stale.is_fresh(now));
    }

    #[tokio::test]
    async fn unconfigured_gateway_fails_fast() {
        let gateway = MomoGateway::new(MomoSettings {
            base_url: "http://127.0.0.1:9".to_string(),
            api_user: String::new(),
            api_key: String::new(),
            subscription_key: String::new(),
            target_environment: "sandbox".to_string(),
        })
        .unwrap();
        let err = gateway.transfer_status("abc").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConfigured("MOMO_API_USER")));
    }
}

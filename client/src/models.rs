//! Wire types exchanged with the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A profile as returned by `/me` (all fields) or `/profiles/:id` (public fields only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub full_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub role: String,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Profile {
    pub fn is_agent(&self) -> bool {
        self.role == "agent"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub expires_in: i64,
    pub user: Profile,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignUp {
    pub email: String,
    pub password: String,
    pub full_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodePurpose {
    Signup,
    Recovery,
}

/// What a successful code verification yields.
#[derive(Debug, Clone)]
pub enum Verified {
    /// A confirmed sign-up opens a session straight away.
    Session(AuthSession),
    /// A recovery code is exchanged for a short-lived reset token.
    ResetToken(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    #[serde(default)]
    pub property_id: Option<Uuid>,
    pub content: String,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub client_ref: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    pub receiver_id: Uuid,
    pub content: String,
    pub property_id: Option<Uuid>,
    /// Lets the server recognise a retried send of the same message.
    pub client_ref: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: Uuid,
    pub owner_id: Uuid,
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub property_type: String,
    pub listing_type: String,
    pub status: String,
    pub price: i64,
    pub currency: String,
    pub city: String,
    pub address: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    pub bedrooms: i16,
    pub bathrooms: i16,
    #[serde(default)]
    pub area_sqm: Option<i32>,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub is_featured: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertySort {
    #[default]
    Newest,
    Oldest,
    PriceAsc,
    PriceDesc,
}

/// Listing search parameters, sent as the query string of `GET /properties`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PropertyQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listing_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_price: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_price: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_bedrooms: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub featured: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    pub sort: PropertySort,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

impl PropertyQuery {
    /// Trims and lower-cases free text and drops empty values, so equivalent
    /// searches compare equal.
    pub fn normalized(&self) -> Self {
        fn text(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
        }
        Self {
            city: text(&self.city),
            property_type: text(&self.property_type),
            listing_type: text(&self.listing_type),
            min_price: self.min_price,
            max_price: self.max_price,
            min_bedrooms: self.min_bedrooms,
            featured: self.featured,
            q: text(&self.q),
            sort: self.sort,
            limit: self.limit.map(|l| l.clamp(1, 100)),
            offset: self.offset.filter(|o| *o > 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_profiles_deserialize_without_private_fields() {
        let raw = r#"{"id":"6f1b0f5e-8f0a-4c9a-9a4b-1f5a1e2b3c4d","full_name":"Ann","avatar_url":null,"role":"agent","is_verified":true}"#;
        let profile: Profile = serde_json::from_str(raw).unwrap();
        assert!(profile.is_agent());
        assert_eq!(profile.email, None);
    }

    #[test]
    fn normalization_makes_equivalent_queries_equal() {
        let a = PropertyQuery { city: Some("  Kampala ".to_string()), q: Some(String::new()), ..Default::default() };
        let b = PropertyQuery { city: Some("kampala".to_string()), ..Default::default() };
        assert_eq!(a.normalized(), b.normalized());
        assert_eq!(a.normalized().q, None);
    }
}

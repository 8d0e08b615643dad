use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{properties, property_reviews, property_views};

text_enum!(PropertyType {
    House => "house",
    Apartment => "apartment",
    Land => "land",
    Commercial => "commercial",
    Room => "room",
});

text_enum!(ListingType {
    Sale => "sale",
    Rent => "rent",
});

text_enum!(PropertyStatus {
    Available => "available",
    Reserved => "reserved",
    Sold => "sold",
    Rented => "rented",
    Inactive => "inactive",
});

#[derive(Debug, Clone, Serialize, Queryable, Selectable, Identifiable)]
#[diesel(table_name = properties)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Property {
    pub id: Uuid,
    pub owner_id: Uuid,
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
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub bedrooms: i16,
    pub bathrooms: i16,
    pub area_sqm: Option<i32>,
    pub amenities: Vec<String>,
    pub images: Vec<String>,
    pub is_featured: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = properties)]
pub struct NewProperty {
    pub owner_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub property_type: String,
    pub listing_type: String,
    pub price: i64,
    pub currency: String,
    pub city: String,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub bedrooms: i16,
    pub bathrooms: i16,
    pub area_sqm: Option<i32>,
    pub amenities: Vec<String>,
    pub images: Vec<String>,
}

#[derive(Debug, Default, Deserialize, AsChangeset)]
#[diesel(table_name = properties)]
pub struct PropertyChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub price: Option<i64>,
    pub city: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub bedrooms: Option<i16>,
    pub bathrooms: Option<i16>,
    pub area_sqm: Option<i32>,
    pub amenities: Option<Vec<String>>,
    pub images: Option<Vec<String>>,
    #[serde(skip)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Queryable, Selectable)]
#[diesel(table_name = property_reviews)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PropertyReview {
    pub id: Uuid,
    pub property_id: Uuid,
    pub reviewer_id: Uuid,
    pub rating: i16,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = property_reviews)]
pub struct NewPropertyReview {
    pub property_id: Uuid,
    pub reviewer_id: Uuid,
    pub rating: i16,
    pub comment: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = property_views)]
pub struct NewPropertyView {
    pub property_id: Uuid,
    pub viewer_id: Option<Uuid>,
}

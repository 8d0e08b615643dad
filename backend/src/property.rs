//! Listing queries and the owner-facing listing endpoints.

use std::collections::HashMap;
use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use diesel::dsl::count_star;
use diesel::pg::{Pg, PgConnection};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{AuthUser, OptionalUser};
use crate::db;
use crate::error::AppError;
use crate::models::{
    ListingType, NewProperty, NewPropertyReview, NewPropertyView, Property, PropertyChanges, PropertyReview,
    PropertyStatus, PropertyType, Role,
};
use crate::realtime::{ChangeEvent, RealtimeHub};
use crate::schema::{properties, property_reviews, property_views};
use crate::AppState;

pub const MAX_PAGE_SIZE: i64 = 100;
const DEFAULT_PAGE_SIZE: i64 = 20;
const FEATURED_LIMIT: i64 = 12;
const SIMILAR_LIMIT: i64 = 6;
const MAX_IMAGES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertySort {
    #[default]
    Newest,
    Oldest,
    PriceAsc,
    PriceDesc,
}

/// Query-string filter for `GET /properties`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PropertyFilter {
    pub city: Option<String>,
    pub property_type: Option<String>,
    pub listing_type: Option<String>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub min_bedrooms: Option<i16>,
    pub min_bathrooms: Option<i16>,
    pub status: Option<String>,
    pub owner_id: Option<Uuid>,
    pub featured: Option<bool>,
    pub q: Option<String>,
    #[serde(default)]
    pub sort: PropertySort,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// A [`PropertyFilter`] whose values have been checked and parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidFilter {
    pub city: Option<String>,
    pub property_type: Option<PropertyType>,
    pub listing_type: Option<ListingType>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub min_bedrooms: Option<i16>,
    pub min_bathrooms: Option<i16>,
    pub status: Option<PropertyStatus>,
    pub owner_id: Option<Uuid>,
    pub featured: Option<bool>,
    pub pattern: Option<String>,
    pub sort: PropertySort,
    pub limit: i64,
    pub offset: i64,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl PropertyFilter {
    pub fn validate(&self) -> Result<ValidFilter, AppError> {
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err(AppError::validation("Minimum price cannot exceed maximum price"));
            }
        }
        if self.min_price.is_some_and(|p| p < 0) || self.max_price.is_some_and(|p| p < 0) {
            return Err(AppError::validation("Prices cannot be negative"));
        }
        Ok(ValidFilter {
            city: non_blank(&self.city).map(str::to_string),
            property_type: non_blank(&self.property_type).map(PropertyType::from_str).transpose()?,
            listing_type: non_blank(&self.listing_type).map(ListingType::from_str).transpose()?,
            min_price: self.min_price,
            max_price: self.max_price,
            min_bedrooms: self.min_bedrooms,
            min_bathrooms: self.min_bathrooms,
            status: non_blank(&self.status).map(PropertyStatus::from_str).transpose()?,
            owner_id: self.owner_id,
            featured: self.featured,
            pattern: non_blank(&self.q).map(like_pattern),
            sort: self.sort,
            limit: self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
            offset: self.offset.unwrap_or(0).max(0),
        })
    }
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Wraps free text for a substring `ILIKE`.
pub fn like_pattern(text: &str) -> String {
    format!("%{}%", escape_like(text))
}

/// Applies every predicate of `filter`; shared by the page query and its count.
fn filtered(filter: &ValidFilter) -> properties::BoxedQuery<'static, Pg> {
    let mut query = properties::table.into_boxed();
    if let Some(city) = &filter.city {
        query = query.filter(properties::city.ilike(escape_like(city)));
    }
    if let Some(t) = filter.property_type {
        query = query.filter(properties::property_type.eq(t.as_str()));
    }
    if let Some(t) = filter.listing_type {
        query = query.filter(properties::listing_type.eq(t.as_str()));
    }
    if let Some(min) = filter.min_price {
        query = query.filter(properties::price.ge(min));
    }
    if let Some(max) = filter.max_price {
        query = query.filter(properties::price.le(max));
    }
    if let Some(n) = filter.min_bedrooms {
        query = query.filter(properties::bedrooms.ge(n));
    }
    if let Some(n) = filter.min_bathrooms {
        query = query.filter(properties::bathrooms.ge(n));
    }
    query = match filter.status {
        Some(status) => query.filter(properties::status.eq(status.as_str())),
        None => query.filter(properties::status.ne(PropertyStatus::Inactive.as_str())),
    };
    if let Some(owner) = filter.owner_id {
        query = query.filter(properties::owner_id.eq(owner));
    }
    if let Some(featured) = filter.featured {
        query = query.filter(properties::is_featured.eq(featured));
    }
    if let Some(pattern) = &filter.pattern {
        query = query.filter(
            properties::title
                .ilike(pattern.clone())
                .or(properties::description.ilike(pattern.clone()))
                .or(properties::address.ilike(pattern.clone())),
        );
    }
    query
}

pub fn page_query(filter: &ValidFilter) -> properties::BoxedQuery<'static, Pg> {
    let query = filtered(filter);
    let query = match filter.sort {
        PropertySort::Newest => query.order(properties::created_at.desc()),
        PropertySort::Oldest => query.order(properties::created_at.asc()),
        PropertySort::PriceAsc => query.order((properties::price.asc(), properties::created_at.desc())),
        PropertySort::PriceDesc => query.order((properties::price.desc(), properties::created_at.desc())),
    };
    query.limit(filter.limit).offset(filter.offset)
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

pub async fn list_properties(
    State(state): State<AppState>,
    Query(filter): Query<PropertyFilter>,
) -> Result<Json<Page<Property>>, AppError> {
    let filter = filter.validate()?;
    let page = db::run(&state.pool, move |conn| {
        let total: i64 = filtered(&filter).count().get_result(conn)?;
        let items = page_query(&filter).select(Property::as_select()).load(conn)?;
        Ok(Page { items, total })
    })
    .await?;
    Ok(Json(page))
}

pub async fn featured_properties(State(state): State<AppState>) -> Result<Json<Vec<Property>>, AppError> {
    let items = db::run(&state.pool, |conn| {
        Ok(properties::table
            .filter(properties::is_featured.eq(true))
            .filter(properties::status.eq(PropertyStatus::Available.as_str()))
            .order(properties::created_at.desc())
            .limit(FEATURED_LIMIT)
            .select(Property::as_select())
            .load(conn)?)
    })
    .await?;
    Ok(Json(items))
}

fn find_property(conn: &mut PgConnection, property_id: Uuid) -> Result<Property, AppError> {
    properties::table
        .find(property_id)
        .select(Property::as_select())
        .first(conn)
        .optional()?
        .ok_or(AppError::NotFound("Property"))
}

pub async fn get_property(
    State(state): State<AppState>,
    OptionalUser(viewer): OptionalUser,
    Path(property_id): Path<Uuid>,
) -> Result<Json<Property>, AppError> {
    let property = db::run(&state.pool, move |conn| {
        let property = find_property(conn, property_id)?;
        let viewer_id = viewer.map(|v| v.id);
        // Owners looking at their own listing do not count as views.
        if viewer_id != Some(property.owner_id) {
            diesel::insert_into(property_views::table)
                .values(NewPropertyView { property_id, viewer_id })
                .execute(conn)?;
        }
        Ok(property)
    })
    .await?;
    Ok(Json(property))
}

/// Prices within 30 % either side of `price`.
pub fn similar_price_range(price: i64) -> (i64, i64) {
    let spread = price.saturating_mul(3) / 10;
    (price.saturating_sub(spread).max(0), price.saturating_add(spread))
}

pub async fn similar_properties(
    State(state): State<AppState>,
    Path(property_id): Path<Uuid>,
) -> Result<Json<Vec<Property>>, AppError> {
    let items = db::run(&state.pool, move |conn| {
        let property = find_property(conn, property_id)?;
        let (low, high) = similar_price_range(property.price);
        Ok(properties::table
            .filter(properties::id.ne(property.id))
            .filter(properties::city.eq(&property.city))
            .filter(properties::property_type.eq(&property.property_type))
            .filter(properties::status.eq(PropertyStatus::Available.as_str()))
            .filter(properties::price.between(low, high))
            .order(properties::created_at.desc())
            .limit(SIMILAR_LIMIT)
            .select(Property::as_select())
            .load(conn)?)
    })
    .await?;
    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
pub struct PropertyBody {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub property_type: PropertyType,
    pub listing_type: ListingType,
    pub price: i64,
    pub currency: Option<String>,
    pub city: String,
    #[serde(default)]
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub bedrooms: i16,
    #[serde(default)]
    pub bathrooms: i16,
    pub area_sqm: Option<i32>,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

fn check_coordinates(latitude: Option<f64>, longitude: Option<f64>) -> Result<(), AppError> {
    if latitude.is_some_and(|v| !(-90.0..=90.0).contains(&v)) || longitude.is_some_and(|v| !(-180.0..=180.0).contains(&v)) {
        return Err(AppError::validation("Coordinates are out of range"));
    }
    Ok(())
}

fn check_rooms(bedrooms: Option<i16>, bathrooms: Option<i16>, area: Option<i32>) -> Result<(), AppError> {
    if bedrooms.is_some_and(|n| n < 0) || bathrooms.is_some_and(|n| n < 0) || area.is_some_and(|a| a <= 0) {
        return Err(AppError::validation("Room counts and area must be positive"));
    }
    Ok(())
}

impl PropertyBody {
    pub fn into_new(self, owner: &AuthUser, default_currency: &str) -> Result<NewProperty, AppError> {
        let title = self.title.trim().to_string();
        let city = self.city.trim().to_string();
        if title.is_empty() || city.is_empty() {
            return Err(AppError::validation("Title and city are required"));
        }
        if self.price <= 0 {
            return Err(AppError::validation("Price must be greater than zero"));
        }
        if self.images.len() > MAX_IMAGES {
            return Err(AppError::validation(format!("At most {} images per listing", MAX_IMAGES)));
        }
        check_coordinates(self.latitude, self.longitude)?;
        check_rooms(Some(self.bedrooms), Some(self.bathrooms), self.area_sqm)?;
        Ok(NewProperty {
            owner_id: owner.id,
            agent_id: (owner.role == Role::Agent).then_some(owner.id),
            title,
            description: self.description.trim().to_string(),
            property_type: self.property_type.as_str().to_string(),
            listing_type: self.listing_type.as_str().to_string(),
            price: self.price,
            currency: self.currency.unwrap_or_else(|| default_currency.to_string()),
            city,
            address: self.address.trim().to_string(),
            latitude: self.latitude,
            longitude: self.longitude,
            bedrooms: self.bedrooms,
            bathrooms: self.bathrooms,
            area_sqm: self.area_sqm,
            amenities: self.amenities,
            images: self.images,
        })
    }
}

fn check_changes(changes: &PropertyChanges) -> Result<(), AppError> {
    if let Some(status) = &changes.status {
        PropertyStatus::from_str(status)?;
    }
    if changes.price.is_some_and(|p| p <= 0) {
        return Err(AppError::validation("Price must be greater than zero"));
    }
    if changes.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(AppError::validation("Title cannot be empty"));
    }
    if changes.images.as_ref().is_some_and(|i| i.len() > MAX_IMAGES) {
        return Err(AppError::validation(format!("At most {} images per listing", MAX_IMAGES)));
    }
    check_coordinates(changes.latitude, changes.longitude)?;
    check_rooms(changes.bedrooms, changes.bathrooms, changes.area_sqm)
}

fn ensure_can_list(user: &AuthUser) -> Result<(), AppError> {
    match user.role {
        Role::Agent | Role::Landlord | Role::Admin => Ok(()),
        Role::User => Err(AppError::forbidden("Only agents and landlords can publish listings")),
    }
}

fn ensure_manages(user: &AuthUser, property: &Property) -> Result<(), AppError> {
    if user.is_admin() || property.owner_id == user.id || property.agent_id == Some(user.id) {
        Ok(())
    } else {
        Err(AppError::forbidden("You do not manage this listing"))
    }
}

fn publish(hub: &RealtimeHub, event: ChangeEvent, property: &Property) {
    hub.publish("properties", event, property);
}

pub async fn create_property(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<PropertyBody>,
) -> Result<(StatusCode, Json<Property>), AppError> {
    ensure_can_list(&user)?;
    let new_property = body.into_new(&user, &state.config.momo_currency)?;
    let hub = state.hub.clone();
    let property = db::run(&state.pool, move |conn| {
        let property: Property = diesel::insert_into(properties::table)
            .values(&new_property)
            .returning(Property::as_returning())
            .get_result(conn)?;
        publish(&hub, ChangeEvent::Insert, &property);
        Ok(property)
    })
    .await?;
    log::info!("Listing {} created by {}", property.id, user.id);
    Ok((StatusCode::CREATED, Json(property)))
}

pub async fn update_property(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(property_id): Path<Uuid>,
    Json(mut changes): Json<PropertyChanges>,
) -> Result<Json<Property>, AppError> {
    check_changes(&changes)?;
    changes.title = changes.title.map(|t| t.trim().to_string());
    changes.updated_at = Some(Utc::now());
    let hub = state.hub.clone();
    let property = db::run(&state.pool, move |conn| {
        let existing = find_property(conn, property_id)?;
        ensure_manages(&user, &existing)?;
        let property: Property = diesel::update(properties::table.find(property_id))
            .set(&changes)
            .returning(Property::as_returning())
            .get_result(conn)?;
        publish(&hub, ChangeEvent::Update, &property);
        Ok(property)
    })
    .await?;
    Ok(Json(property))
}

pub async fn delete_property(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(property_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let hub = state.hub.clone();
    db::run(&state.pool, move |conn| {
        let existing = find_property(conn, property_id)?;
        ensure_manages(&user, &existing)?;
        diesel::delete(properties::table.find(property_id)).execute(conn)?;
        publish(&hub, ChangeEvent::Delete, &existing);
        log::info!("Listing {} deleted by {}", property_id, user.id);
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_reviews(
    State(state): State<AppState>,
    Path(property_id): Path<Uuid>,
) -> Result<Json<Vec<PropertyReview>>, AppError> {
    let items = db::run(&state.pool, move |conn| {
        Ok(property_reviews::table
            .filter(property_reviews::property_id.eq(property_id))
            .order(property_reviews::created_at.desc())
            .select(PropertyReview::as_select())
            .load(conn)?)
    })
    .await?;
    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
pub struct ReviewBody {
    pub rating: i16,
    #[serde(default)]
    pub comment: String,
}

pub async fn create_review(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(property_id): Path<Uuid>,
    Json(body): Json<ReviewBody>,
) -> Result<(StatusCode, Json<PropertyReview>), AppError> {
    if !(1..=5).contains(&body.rating) {
        return Err(AppError::validation("Rating must be between 1 and 5"));
    }
    let hub = state.hub.clone();
    let review = db::run(&state.pool, move |conn| {
        let property = find_property(conn, property_id)?;
        if property.owner_id == user.id {
            return Err(AppError::forbidden("You cannot review your own listing"));
        }
        let review: PropertyReview = diesel::insert_into(property_reviews::table)
            .values(NewPropertyReview {
                property_id,
                reviewer_id: user.id,
                rating: body.rating,
                comment: body.comment.trim().to_string(),
            })
            .returning(PropertyReview::as_returning())
            .get_result(conn)
            .map_err(|e| match AppError::from(e) {
                AppError::Conflict(_) => AppError::Conflict("You have already reviewed this property".to_string()),
                other => other,
            })?;
        hub.publish("property_reviews", ChangeEvent::Insert, &review);
        Ok(review)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(review)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingStats {
    pub property_id: Uuid,
    pub title: String,
    pub views: i64,
    pub reviews: i64,
    pub average_rating: Option<f64>,
}

/// Folds `(property, rating)` pairs into review counts and averages.
pub fn rating_summary(ratings: &[(Uuid, i16)]) -> HashMap<Uuid, (i64, f64)> {
    let mut totals: HashMap<Uuid, (i64, i64)> = HashMap::new();
    for (property_id, rating) in ratings {
        let entry = totals.entry(*property_id).or_default();
        entry.0 += 1;
        entry.1 += i64::from(*rating);
    }
    totals
        .into_iter()
        .map(|(id, (count, sum))| (id, (count, sum as f64 / count as f64)))
        .collect()
}

pub async fn owner_stats(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<ListingStats>>, AppError> {
    let stats = db::run(&state.pool, move |conn| {
        let listings: Vec<(Uuid, String)> = properties::table
            .filter(properties::owner_id.eq(user.id).or(properties::agent_id.eq(user.id)))
            .order(properties::created_at.desc())
            .select((properties::id, properties::title))
            .load(conn)?;
        let ids: Vec<Uuid> = listings.iter().map(|(id, _)| *id).collect();

        let views: HashMap<Uuid, i64> = property_views::table
            .filter(property_views::property_id.eq_any(ids.clone()))
            .group_by(property_views::property_id)
            .select((property_views::property_id, count_star()))
            .load::<(Uuid, i64)>(conn)?
            .into_iter()
            .collect();
        let ratings: Vec<(Uuid, i16)> = property_reviews::table
            .filter(property_reviews::property_id.eq_any(ids))
            .select((property_reviews::property_id, property_reviews::rating))
            .load(conn)?;
        let ratings = rating_summary(&ratings);

        Ok(listings
            .into_iter()
            .map(|(property_id, title)| {
                let (reviews, average) = ratings.get(&property_id).copied().unzip();
                ListingStats {
                    property_id,
                    title,
                    views: views.get(&property_id).copied().unwrap_or(0),
                    reviews: reviews.unwrap_or(0),
                    average_rating: average,
                }
            })
            .collect())
    })
    .await?;
    Ok(Json(stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::debug_query;

    fn filter() -> PropertyFilter {
        PropertyFilter::default()
    }

    #[test]
    fn filter_parses_enums_and_clamps_paging() {
        let valid = PropertyFilter {
            property_type: Some("apartment".to_string()),
            listing_type: Some(" rent ".to_string()),
            city: Some("  ".to_string()),
            limit: Some(500),
            offset: Some(-3),
            ..filter()
        }
        .validate()
        .unwrap();
        assert_eq!(valid.property_type, Some(PropertyType::Apartment));
        assert_eq!(valid.listing_type, Some(ListingType::Rent));
        assert_eq!(valid.city, None);
        assert_eq!(valid.limit, MAX_PAGE_SIZE);
        assert_eq!(valid.offset, 0);
    }

    #[test]
    fn filter_rejects_bad_values() {
        assert!(PropertyFilter { min_price: Some(10), max_price: Some(5), ..filter() }.validate().is_err());
        assert!(PropertyFilter { min_price: Some(-1), ..filter() }.validate().is_err());
        assert!(PropertyFilter { status: Some("demolished".to_string()), ..filter() }.validate().is_err());
    }

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(like_pattern("sea view"), "%sea view%");
        assert_eq!(like_pattern("100%_off"), "%100\\%\\_off%");
    }

    #[test]
    fn compiled_query_carries_each_predicate() {
        let valid = PropertyFilter {
            city: Some("Kampala".to_string()),
            min_price: Some(1_000),
            min_bedrooms: Some(2),
            q: Some("garden".to_string()),
            sort: PropertySort::PriceAsc,
            ..filter()
        }
        .validate()
        .unwrap();
        let sql = debug_query::<Pg, _>(&page_query(&valid)).to_string();
        assert!(sql.contains("\"properties\".\"city\" ILIKE"));
        assert!(sql.contains("\"properties\".\"price\" >="));
        assert!(sql.contains("\"properties\".\"bedrooms\" >="));
        assert!(sql.contains("\"properties\".\"status\" !="));
        assert!(sql.contains("ORDER BY \"properties\".\"price\" ASC"));
        assert!(sql.contains("LIMIT"));
    }

    #[test]
    fn explicit_status_replaces_the_inactive_exclusion() {
        let valid = PropertyFilter { status: Some("sold".to_string()), ..filter() }.validate().unwrap();
        let sql = debug_query::<Pg, _>(&filtered(&valid)).to_string();
        assert!(sql.contains("\"properties\".\"status\" = $1"));
        assert!(!sql.contains("!="));
    }

    #[test]
    fn similar_range_is_thirty_percent() {
        assert_eq!(similar_price_range(100_000), (70_000, 130_000));
        assert_eq!(similar_price_range(0), (0, 0));
    }

    #[test]
    fn ratings_are_averaged_per_listing() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let summary = rating_summary(&[(a, 5), (a, 4), (b, 1)]);
        assert_eq!(summary[&a], (2, 4.5));
        assert_eq!(summary[&b], (1, 1.0));
    }

    #[test]
    fn only_managers_may_edit() {
        let owner = AuthUser { id: Uuid::new_v4(), role: Role::Landlord, email: "o@example.com".to_string() };
        let body = PropertyBody {
            title: "Two-bed flat".to_string(),
            description: String::new(),
            property_type: PropertyType::Apartment,
            listing_type: ListingType::Rent,
            price: 500_000,
            currency: None,
            city: "Kampala".to_string(),
            address: String::new(),
            latitude: Some(0.31),
            longitude: Some(32.58),
            bedrooms: 2,
            bathrooms: 1,
            area_sqm: None,
            amenities: vec![],
            images: vec![],
        };
        let new_property = body.into_new(&owner, "UGX").unwrap();
        assert_eq!(new_property.currency, "UGX");
        assert_eq!(new_property.agent_id, None);

        let now = Utc::now();
        let property = Property {
            id: Uuid::new_v4(),
            owner_id: owner.id,
            agent_id: None,
            title: new_property.title,
            description: new_property.description,
            property_type: new_property.property_type,
            listing_type: new_property.listing_type,
            status: "available".to_string(),
            price: new_property.price,
            currency: new_property.currency,
            city: new_property.city,
            address: new_property.address,
            latitude: None,
            longitude: None,
            bedrooms: 2,
            bathrooms: 1,
            area_sqm: None,
            amenities: vec![],
            images: vec![],
            is_featured: false,
            created_at: now,
            updated_at: now,
        };
        let stranger = AuthUser { id: Uuid::new_v4(), role: Role::Agent, email: "s@example.com".to_string() };
        assert!(ensure_manages(&owner, &property).is_ok());
        assert!(ensure_manages(&stranger, &property).is_err());
        assert!(ensure_can_list(&AuthUser { role: Role::User, ..stranger }).is_err());
    }

    #[test]
    fn changes_are_checked() {
        assert!(check_changes(&PropertyChanges { price: Some(0), ..Default::default() }).is_err());
        assert!(check_changes(&PropertyChanges { status: Some("sold".to_string()), ..Default::default() }).is_ok());
        assert!(check_changes(&PropertyChanges { latitude: Some(120.0), ..Default::default() }).is_err());
    }
}

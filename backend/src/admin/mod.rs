//! Back-office data provider.
//!
//! One generic set of handlers serves every table in the [`resources`]
//! registry, in the shape the admin UI's data provider expects:
//! `{"data": ...}` bodies, with `total` on lists.

pub mod query;
pub mod resources;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use self::query::{ListRequest, SortOrder};
use self::resources::{resource, Resource, RESOURCES};
use crate::auth::AuthUser;
use crate::db;
use crate::error::AppError;
use crate::realtime::ChangeEvent;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub sort: Option<String>,
    pub order: Option<SortOrder>,
    /// JSON object matched by containment against each row.
    pub filter: Option<String>,
    pub q: Option<String>,
    /// Comma-separated ids; turns the list into a `getMany`.
    pub ids: Option<String>,
}

impl ListParams {
    fn into_request(self) -> Result<ListRequest, AppError> {
        let filter = match self.filter.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
            None => Map::new(),
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                _ => return Err(AppError::validation("filter must be a JSON object")),
            },
        };
        Ok(ListRequest {
            page: self.page.unwrap_or(1),
            per_page: self.per_page.unwrap_or(25),
            sort: self.sort,
            order: self.order.unwrap_or_default(),
            filter,
            q: self.q,
        })
    }
}

pub fn parse_ids(raw: &str) -> Result<Vec<Uuid>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Uuid::parse_str(s).map_err(|_| AppError::validation(format!("'{}' is not a valid id", s))))
        .collect()
}

/// Accepts either the bare record or `{"data": record}`.
pub fn payload(body: Value) -> Result<Map<String, Value>, AppError> {
    match body {
        Value::Object(mut map) => {
            if map.len() == 1 && matches!(map.get("data"), Some(Value::Object(_))) {
                if let Some(Value::Object(inner)) = map.remove("data") {
                    return Ok(inner);
                }
            }
            Ok(map)
        }
        _ => Err(AppError::validation("Expected a JSON object")),
    }
}

fn scrub_all(resource: &Resource, rows: Vec<Value>) -> Vec<Value> {
    rows.into_iter().map(|row| resource.scrub(row)).collect()
}

pub async fn get_list(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(mut params): Query<ListParams>,
) -> Result<Json<Value>, AppError> {
    let resource = resource(&name)?;
    if let Some(ids) = params.ids.take() {
        let plan = query::many_plan(resource, parse_ids(&ids)?);
        let rows = db::run(&state.pool, move |conn| query::fetch_rows(conn, plan)).await?;
        let rows = scrub_all(resource, rows);
        return Ok(Json(json!({ "data": rows, "total": rows.len() })));
    }

    let (count, page) = query::list_plans(resource, &params.into_request()?)?;
    let (total, rows) = db::run(&state.pool, move |conn| {
        let total = query::fetch_count(conn, count)?;
        let rows = query::fetch_rows(conn, page)?;
        Ok((total, rows))
    })
    .await?;
    Ok(Json(json!({ "data": scrub_all(resource, rows), "total": total })))
}

async fn single_row(state: &AppState, plan: query::SqlPlan) -> Result<Value, AppError> {
    let rows = db::run(&state.pool, move |conn| query::fetch_rows(conn, plan)).await?;
    rows.into_iter().next().ok_or(AppError::NotFound("Record"))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, Uuid)>,
) -> Result<Json<Value>, AppError> {
    let resource = resource(&name)?;
    let row = single_row(&state, query::one_plan(resource, id)).await?;
    Ok(Json(json!({ "data": resource.scrub(row) })))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let resource = resource(&name)?;
    let plan = query::insert_plan(resource, &payload(body)?)?;
    let row = resource.scrub(single_row(&state, plan).await?);
    state.hub.publish(resource.name, ChangeEvent::Insert, &row);
    log::info!("Admin {} created a {} row", admin.id, resource.name);
    Ok((StatusCode::CREATED, Json(json!({ "data": row }))))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path((name, id)): Path<(String, Uuid)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let resource = resource(&name)?;
    let plan = query::update_plan(resource, id, &payload(body)?)?;
    let row = resource.scrub(single_row(&state, plan).await?);
    state.hub.publish(resource.name, ChangeEvent::Update, &row);
    log::info!("Admin {} updated {} {}", admin.id, resource.name, id);
    Ok(Json(json!({ "data": row })))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path((name, id)): Path<(String, Uuid)>,
) -> Result<Json<Value>, AppError> {
    let resource = resource(&name)?;
    let plan = query::delete_plan(resource, id)?;
    let row = resource.scrub(single_row(&state, plan).await?);
    state.hub.publish(resource.name, ChangeEvent::Delete, &row);
    log::info!("Admin {} deleted {} {}", admin.id, resource.name, id);
    Ok(Json(json!({ "data": row })))
}

/// Row counts per resource for the dashboard.
pub async fn stats(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let counts = db::run(&state.pool, |conn| {
        let mut counts = Map::new();
        for resource in RESOURCES {
            let total = query::fetch_count(conn, query::count_all_plan(resource))?;
            counts.insert(resource.name.to_string(), json!(total));
        }
        Ok(counts)
    })
    .await?;
    Ok(Json(Value::Object(counts)))
}

/// Compares a `Host` header with the configured admin host, ignoring the port
/// unless the configured value names one.
pub fn host_matches(header: &str, configured: &str) -> bool {
    let header = header.trim().to_ascii_lowercase();
    let configured = configured.trim().to_ascii_lowercase();
    if configured.contains(':') {
        return header == configured;
    }
    header.split(':').next() == Some(configured.as_str())
}

/// Lets the `/api` mirror of the admin routes answer only on the admin host.
pub async fn require_admin_host(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, AppError> {
    let on_admin_host = match (state.config.admin_host.as_deref(), request.headers().get(header::HOST)) {
        (Some(configured), Some(value)) => value.to_str().map(|h| host_matches(h, configured)).unwrap_or(false),
        _ => false,
    };
    if !on_admin_host {
        return Err(AppError::NotFound("Route"));
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_params_parse_the_filter_object() {
        let params = ListParams {
            filter: Some(r#"{"status":"pending"}"#.to_string()),
            order: Some(SortOrder::Asc),
            ..Default::default()
        };
        let request = params.into_request().unwrap();
        assert_eq!(request.filter.get("status"), Some(&json!("pending")));
        assert_eq!(request.page, 1);
        assert_eq!(request.order, SortOrder::Asc);

        let bad = ListParams { filter: Some("[1,2]".to_string()), ..Default::default() };
        assert!(bad.into_request().is_err());
    }

    #[test]
    fn ids_are_parsed_strictly() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(parse_ids(&format!("{}, {},", a, b)).unwrap(), vec![a, b]);
        assert!(parse_ids("1,2").is_err());
    }

    #[test]
    fn payload_unwraps_data() {
        assert_eq!(payload(json!({ "data": { "title": "x" } })).unwrap(), payload(json!({ "title": "x" })).unwrap());
        assert!(payload(json!(["x"])).is_err());
        // A record that happens to have a `data` column next to others is kept whole.
        assert_eq!(payload(json!({ "data": {}, "id": 1 })).unwrap().len(), 2);
    }

    #[test]
    fn admin_host_matching() {
        assert!(host_matches("admin.example.com", "admin.example.com"));
        assert!(host_matches("Admin.Example.com:8080", "admin.example.com"));
        assert!(!host_matches("example.com", "admin.example.com"));
        assert!(host_matches("admin.local:8443", "admin.local:8443"));
        assert!(!host_matches("admin.local:8080", "admin.local:8443"));
    }
}

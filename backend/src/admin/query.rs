//! SQL generation for the back office.
//!
//! Identifiers in generated SQL only ever come from the [`Resource`] registry;
//! every value supplied by the caller travels as a bind parameter.

use diesel::pg::{Pg, PgConnection};
use diesel::prelude::*;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::sql_types::{Array, BigInt, Jsonb, Text};
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::resources::Resource;
use crate::error::AppError;
use crate::property::like_pattern;

pub const MAX_PER_PAGE: i64 = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Json(Value),
    Text(String),
    BigInt(i64),
    Uuid(Uuid),
    UuidList(Vec<Uuid>),
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SqlPlan {
    pub sql: String,
    pub binds: Vec<BindValue>,
}

impl SqlPlan {
    /// Registers a bind and returns its placeholder.
    fn bind(&mut self, value: BindValue) -> String {
        self.binds.push(value);
        format!("${}", self.binds.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub page: i64,
    pub per_page: i64,
    pub sort: Option<String>,
    pub order: SortOrder,
    pub filter: Map<String, Value>,
    pub q: Option<String>,
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

fn where_clause(resource: &Resource, request: &ListRequest, plan: &mut SqlPlan) -> Result<String, AppError> {
    let mut predicates = Vec::new();
    if !request.filter.is_empty() {
        if let Some(key) = request.filter.keys().find(|k| !resource.is_visible(k)) {
            return Err(AppError::validation(format!("Cannot filter {} on '{}'", resource.name, key)));
        }
        let placeholder = plan.bind(BindValue::Json(Value::Object(request.filter.clone())));
        predicates.push(format!("to_jsonb(t) @> {}", placeholder));
    }
    let q = request.q.as_deref().map(str::trim).filter(|q| !q.is_empty());
    if let (Some(q), false) = (q, resource.search.is_empty()) {
        let placeholder = plan.bind(BindValue::Text(like_pattern(q)));
        let matches: Vec<String> = resource
            .search
            .iter()
            .map(|column| format!("t.{}::text ILIKE {}", quote(column), placeholder))
            .collect();
        predicates.push(format!("({})", matches.join(" OR ")));
    }
    Ok(if predicates.is_empty() { String::new() } else { format!(" WHERE {}", predicates.join(" AND ")) })
}

/// The count query and the page query for a list request.
pub fn list_plans(resource: &Resource, request: &ListRequest) -> Result<(SqlPlan, SqlPlan), AppError> {
    let sort = match request.sort.as_deref() {
        None => resource.default_sort,
        Some(requested) => resource
            .columns
            .iter()
            .copied()
            .find(|c| *c == requested && resource.is_visible(c))
            .ok_or_else(|| AppError::validation(format!("Cannot sort {} on '{}'", resource.name, requested)))?,
    };

    let mut count = SqlPlan::default();
    let filters = where_clause(resource, request, &mut count)?;
    count.sql = format!("SELECT count(*) AS total FROM {} AS t{}", quote(resource.name), filters);

    let mut page = SqlPlan { sql: String::new(), binds: count.binds.clone() };
    let per_page = request.per_page.clamp(1, MAX_PER_PAGE);
    let offset = (request.page.max(1) - 1).saturating_mul(per_page);
    let limit = page.bind(BindValue::BigInt(per_page));
    let offset = page.bind(BindValue::BigInt(offset));
    page.sql = format!(
        "SELECT to_jsonb(t) AS record FROM {} AS t{} ORDER BY t.{} {}, t.\"id\" ASC LIMIT {} OFFSET {}",
        quote(resource.name),
        filters,
        quote(sort),
        request.order.sql(),
        limit,
        offset
    );
    Ok((count, page))
}

pub fn one_plan(resource: &Resource, id: Uuid) -> SqlPlan {
    let mut plan = SqlPlan::default();
    let placeholder = plan.bind(BindValue::Uuid(id));
    plan.sql = format!("SELECT to_jsonb(t) AS record FROM {} AS t WHERE t.\"id\" = {}", quote(resource.name), placeholder);
    plan
}

pub fn many_plan(resource: &Resource, ids: Vec<Uuid>) -> SqlPlan {
    let mut plan = SqlPlan::default();
    let placeholder = plan.bind(BindValue::UuidList(ids));
    plan.sql = format!(
        "SELECT to_jsonb(t) AS record FROM {} AS t WHERE t.\"id\" = ANY({})",
        quote(resource.name),
        placeholder
    );
    plan
}

/// Picks the writable columns out of submitted data. Read-only columns echoed
/// back by the client are ignored; unknown or hidden columns are rejected.
fn writable_subset(resource: &Resource, data: &Map<String, Value>) -> Result<(Vec<&'static str>, Value), AppError> {
    let mut columns = Vec::new();
    let mut subset = Map::new();
    for (key, value) in data {
        match resource.columns.iter().copied().find(|c| c == key) {
            Some(column) if resource.is_writable(column) => {
                columns.push(column);
                subset.insert(column.to_string(), value.clone());
            }
            Some(column) if resource.is_visible(column) => {}
            _ => return Err(AppError::validation(format!("{} has no writable field '{}'", resource.name, key))),
        }
    }
    if columns.is_empty() {
        return Err(AppError::validation("Nothing to save"));
    }
    Ok((columns, Value::Object(subset)))
}

pub fn insert_plan(resource: &Resource, data: &Map<String, Value>) -> Result<SqlPlan, AppError> {
    if !resource.creatable {
        return Err(AppError::forbidden(format!("{} cannot be created here", resource.name)));
    }
    let (columns, subset) = writable_subset(resource, data)?;
    let mut plan = SqlPlan::default();
    let placeholder = plan.bind(BindValue::Json(subset));
    let targets: Vec<String> = columns.iter().map(|c| quote(c)).collect();
    let sources: Vec<String> = columns.iter().map(|c| format!("r.{}", quote(c))).collect();
    plan.sql = format!(
        "INSERT INTO {table} AS t ({targets}) SELECT {sources} FROM jsonb_populate_record(NULL::{table}, {p}) AS r \
         RETURNING to_jsonb(t) AS record",
        table = quote(resource.name),
        targets = targets.join(", "),
        sources = sources.join(", "),
        p = placeholder
    );
    Ok(plan)
}

pub fn update_plan(resource: &Resource, id: Uuid, data: &Map<String, Value>) -> Result<SqlPlan, AppError> {
    let (columns, subset) = writable_subset(resource, data)?;
    let mut plan = SqlPlan::default();
    let values = plan.bind(BindValue::Json(subset));
    let id = plan.bind(BindValue::Uuid(id));
    let mut assignments: Vec<String> = columns.iter().map(|c| format!("{0} = r.{0}", quote(c))).collect();
    if resource.touches_updated_at() {
        assignments.push("\"updated_at\" = now()".to_string());
    }
    plan.sql = format!(
        "UPDATE {table} AS t SET {assignments} FROM jsonb_populate_record(NULL::{table}, {values}) AS r \
         WHERE t.\"id\" = {id} RETURNING to_jsonb(t) AS record",
        table = quote(resource.name),
        assignments = assignments.join(", "),
        values = values,
        id = id
    );
    Ok(plan)
}

pub fn delete_plan(resource: &Resource, id: Uuid) -> Result<SqlPlan, AppError> {
    if !resource.deletable {
        return Err(AppError::forbidden(format!("{} cannot be deleted here", resource.name)));
    }
    let mut plan = SqlPlan::default();
    let placeholder = plan.bind(BindValue::Uuid(id));
    plan.sql = format!(
        "DELETE FROM {} AS t WHERE t.\"id\" = {} RETURNING to_jsonb(t) AS record",
        quote(resource.name),
        placeholder
    );
    Ok(plan)
}

pub fn count_all_plan(resource: &Resource) -> SqlPlan {
    SqlPlan { sql: format!("SELECT count(*) AS total FROM {}", quote(resource.name)), binds: Vec::new() }
}

#[derive(QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Jsonb)]
    record: Value,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    total: i64,
}

fn prepare(plan: SqlPlan) -> BoxedSqlQuery<'static, Pg, SqlQuery> {
    let mut query = diesel::sql_query(plan.sql).into_boxed::<Pg>();
    for bind in plan.binds {
        query = match bind {
            BindValue::Json(v) => query.bind::<Jsonb, _>(v),
            BindValue::Text(v) => query.bind::<Text, _>(v),
            BindValue::BigInt(v) => query.bind::<BigInt, _>(v),
            BindValue::Uuid(v) => query.bind::<diesel::sql_types::Uuid, _>(v),
            BindValue::UuidList(v) => query.bind::<Array<diesel::sql_types::Uuid>, _>(v),
        };
    }
    query
}

pub fn fetch_rows(conn: &mut PgConnection, plan: SqlPlan) -> Result<Vec<Value>, AppError> {
    let rows: Vec<JsonRow> = prepare(plan).load(conn)?;
    Ok(rows.into_iter().map(|r| r.record).collect())
}

pub fn fetch_count(conn: &mut PgConnection, plan: SqlPlan) -> Result<i64, AppError> {
    let row: CountRow = prepare(plan).get_result(conn)?;
    Ok(row.total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::resources::resource;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn list_binds_filter_search_and_paging() {
        let request = ListRequest {
            page: 3,
            per_page: 10,
            sort: Some("price".to_string()),
            order: SortOrder::Asc,
            filter: object(json!({ "status": "available" })),
            q: Some("villa".to_string()),
        };
        let (count, page) = list_plans(resource("properties").unwrap(), &request).unwrap();

        assert_eq!(
            count.sql,
            "SELECT count(*) AS total FROM \"properties\" AS t WHERE to_jsonb(t) @> $1 AND \
             (t.\"title\"::text ILIKE $2 OR t.\"city\"::text ILIKE $2 OR t.\"address\"::text ILIKE $2)"
        );
        assert_eq!(count.binds.len(), 2);
        assert!(page.sql.ends_with("ORDER BY t.\"price\" ASC, t.\"id\" ASC LIMIT $3 OFFSET $4"));
        assert_eq!(page.binds[1], BindValue::Text("%villa%".to_string()));
        assert_eq!(page.binds[2..], [BindValue::BigInt(10), BindValue::BigInt(20)]);
    }

    #[test]
    fn list_rejects_hidden_and_unknown_columns() {
        let profiles = resource("profiles").unwrap();
        let hidden = ListRequest { filter: object(json!({ "password_hash": "x" })), per_page: 10, ..Default::default() };
        assert!(list_plans(profiles, &hidden).is_err());
        let sort = ListRequest { sort: Some("email; DROP TABLE profiles".to_string()), ..Default::default() };
        assert!(list_plans(profiles, &sort).is_err());
    }

    #[test]
    fn list_without_filters_uses_defaults() {
        let (count, page) = list_plans(resource("wallets").unwrap(), &ListRequest::default()).unwrap();
        assert_eq!(count.sql, "SELECT count(*) AS total FROM \"wallets\" AS t");
        assert!(page.sql.contains("ORDER BY t.\"updated_at\" DESC"));
        assert_eq!(page.binds, vec![BindValue::BigInt(1), BindValue::BigInt(0)]);
    }

    #[test]
    fn update_ignores_read_only_echoes() {
        let id = Uuid::new_v4();
        let data = object(json!({ "id": id, "title": "Sea view", "created_at": "2024-01-01T00:00:00Z", "price": 10 }));
        let plan = update_plan(resource("properties").unwrap(), id, &data).unwrap();

        assert!(plan.sql.starts_with("UPDATE \"properties\" AS t SET "));
        assert!(plan.sql.contains("\"title\" = r.\"title\""));
        assert!(plan.sql.contains("\"price\" = r.\"price\""));
        assert!(plan.sql.contains("\"updated_at\" = now()"));
        assert!(!plan.sql.contains("\"created_at\" = "));
        assert!(plan.sql.contains("WHERE t.\"id\" = $2 RETURNING to_jsonb(t) AS record"));
        assert_eq!(plan.binds[0], BindValue::Json(json!({ "title": "Sea view", "price": 10 })));
        assert_eq!(plan.binds[1], BindValue::Uuid(id));
    }

    #[test]
    fn writes_reject_hidden_or_unknown_fields() {
        let profiles = resource("profiles").unwrap();
        let id = Uuid::new_v4();
        assert!(update_plan(profiles, id, &object(json!({ "password_hash": "x" }))).is_err());
        assert!(update_plan(profiles, id, &object(json!({ "nickname": "x" }))).is_err());
        assert!(update_plan(profiles, id, &object(json!({ "email": "x@y.z" }))).is_err());
        assert!(insert_plan(profiles, &object(json!({ "full_name": "x" }))).is_err());
        assert!(delete_plan(resource("wallets").unwrap(), id).is_err());
    }

    #[test]
    fn insert_only_names_submitted_columns() {
        let data = object(json!({ "profile_id": Uuid::nil(), "kind": "system", "title": "Hi", "body": "Welcome" }));
        let plan = insert_plan(resource("notifications").unwrap(), &data).unwrap();
        assert!(plan.sql.starts_with("INSERT INTO \"notifications\" AS t ("));
        for column in ["profile_id", "kind", "title", "body"] {
            assert!(plan.sql.contains(&format!("r.\"{}\"", column)));
        }
        assert!(!plan.sql.contains("is_read"));
        assert!(plan.sql.contains("FROM jsonb_populate_record(NULL::\"notifications\", $1) AS r"));
        assert_eq!(plan.binds.len(), 1);
    }

    #[test]
    fn lookups_bind_ids() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let plan = many_plan(resource("messages").unwrap(), ids.clone());
        assert!(plan.sql.ends_with("WHERE t.\"id\" = ANY($1)"));
        assert_eq!(plan.binds, vec![BindValue::UuidList(ids)]);
        assert_eq!(one_plan(resource("messages").unwrap(), Uuid::nil()).binds.len(), 1);
    }

    #[test]
    fn plans_round_trip_through_postgres() {
        let Some(mut conn) = crate::db::testing::connection() else { return };
        let conn = &mut conn;
        let properties = resource("properties").unwrap();
        let owner = crate::db::testing::profile(conn, "landlord");
        let kept = crate::db::testing::property(conn, owner.id, None);
        let other = crate::db::testing::property(conn, owner.id, None);
        fetch_rows(conn, update_plan(properties, other.id, &object(json!({ "city": "entebbe" }))).unwrap()).unwrap();

        let request = ListRequest {
            page: 1,
            per_page: 10,
            filter: object(json!({ "city": "kampala" })),
            ..Default::default()
        };
        let (count, page) = list_plans(properties, &request).unwrap();
        assert_eq!(fetch_count(conn, count).unwrap(), 1);
        let rows = fetch_rows(conn, page).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(kept.id));
        let created_at = rows[0]["created_at"].clone();

        let edit = object(json!({
            "id": kept.id,
            "title": "Renovated flat",
            "price": 1_250_000,
            "created_at": "2000-01-01T00:00:00Z",
        }));
        let updated = fetch_rows(conn, update_plan(properties, kept.id, &edit).unwrap()).unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0]["title"], "Renovated flat");

        let reloaded = fetch_rows(conn, one_plan(properties, kept.id)).unwrap();
        assert_eq!(reloaded[0]["title"], "Renovated flat");
        assert_eq!(reloaded[0]["price"], 1_250_000);
        assert_eq!(reloaded[0]["city"], "kampala");
        assert_eq!(reloaded[0]["created_at"], created_at);

        let unknown = object(json!({ "nickname": "x" }));
        assert!(matches!(update_plan(properties, kept.id, &unknown), Err(AppError::Validation(_))));
        let still: Vec<Value> = fetch_rows(conn, one_plan(properties, kept.id)).unwrap();
        assert_eq!(still[0]["title"], "Renovated flat");
    }
}

use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};

use crate::error::AppError;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn init_pool(database_url: &str) -> Result<DbPool, AppError> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    match Pool::builder().max_size(16).build(manager) {
        Ok(pool) => {
            log::info!("Database pool established");
            Ok(pool)
        }
        Err(e) => {
            log::error!("Failed to establish database pool: {}", e);
            Err(AppError::Internal(format!("Failed to connect to database: {}", e)))
        }
    }
}

pub fn health_check(conn: &mut PgConnection) -> Result<i32, AppError> {
    let one: i32 = diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("1")).get_result(conn)?;
    Ok(one)
}

/// Runs blocking diesel work on the blocking thread pool.
pub async fn run<F, T>(pool: &DbPool, work: F) -> Result<T, AppError>
where
    F: FnOnce(&mut PgConnection) -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        work(&mut conn)
    })
    .await
    .map_err(|e| AppError::Internal(format!("Blocking task failed: {}", e)))?
}

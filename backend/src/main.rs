use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, patch, post};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};

mod admin;
mod auth;
mod commission;
mod config;
mod db;
mod error;
mod message;
mod models;
mod notification;
mod payment;
mod property;
mod realtime;
mod reservation;
mod schema;
mod storage;
mod verification;
mod wallet;
mod withdrawal;

use crate::auth::limiter::AttemptLimiter;
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::error::AppError;
use crate::models::WithdrawalStatus;
use crate::payment::momo::MomoGateway;
use crate::payment::PaymentGateway;
use crate::realtime::RealtimeHub;
use crate::storage::DiskStore;
use crate::withdrawal::{PgWithdrawalStore, WithdrawalMonitor};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pool: DbPool,
    pub hub: RealtimeHub,
    pub gateway: Arc<dyn PaymentGateway>,
    pub withdrawals: WithdrawalMonitor,
    pub storage: DiskStore,
    pub signin_limiter: AttemptLimiter,
    pub otp_limiter: AttemptLimiter,
}

async fn health(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let one = db::run(&state.pool, db::health_check).await?;
    Ok(Json(json!({ "status": "ok", "database": one == 1 })))
}

/// Settings the front end needs before anyone signs in.
async fn public_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "map_token": state.config.map_token,
        "currency": state.config.momo_currency,
        "admin_host": state.config.admin_host,
    }))
}

/// Picks up withdrawals a previous run was still following.
async fn resume_withdrawals(state: &AppState) -> Result<(), AppError> {
    let (tickets, unsubmitted) = db::run(&state.pool, wallet::interrupted_withdrawals).await?;
    for withdrawal_id in unsubmitted {
        let hub = state.hub.clone();
        db::run(&state.pool, move |conn| {
            withdrawal::settle(
                conn,
                &hub,
                withdrawal_id,
                WithdrawalStatus::Failed,
                Some("Interrupted before reaching the provider".to_string()),
            )
        })
        .await?;
    }
    if !tickets.is_empty() {
        log::info!("Resuming {} in-flight withdrawals", tickets.len());
    }
    for ticket in tickets {
        state.withdrawals.spawn(ticket);
    }
    Ok(())
}

fn admin_api() -> Router<AppState> {
    Router::new()
        .route("/stats", get(admin::stats))
        .route("/:resource", get(admin::get_list).post(admin::create))
        .route(
            "/:resource/:id",
            get(admin::get_one).patch(admin::update).put(admin::update).delete(admin::delete),
        )
}

fn router(state: AppState) -> Router {
    let upload_limit = state.config.storage_max_bytes + 64 * 1024;

    let public_routes = Router::new()
        .route("/", get(|| async { "Real Estate Marketplace API" }))
        .route("/health", get(health))
        .route("/config/public", get(public_config))
        .route("/auth/signup", post(auth::handlers::sign_up))
        .route("/auth/signin", post(auth::handlers::sign_in))
        .route("/auth/verify", post(auth::handlers::verify_code))
        .route("/auth/otp/resend", post(auth::handlers::resend_code))
        .route("/auth/password/forgot", post(auth::handlers::forgot_password))
        .route("/auth/password/reset", post(auth::handlers::reset_password))
        .route("/profiles/:id", get(auth::handlers::get_public_profile))
        .route("/properties", get(property::list_properties))
        .route("/properties/featured", get(property::featured_properties))
        .route("/properties/:id", get(property::get_property))
        .route("/properties/:id/similar", get(property::similar_properties))
        .route("/properties/:id/reviews", get(property::list_reviews))
        .route("/storage/:bucket/:name", get(storage::download));

    let protected_routes = Router::new()
        .route("/me", get(auth::handlers::get_me).patch(auth::handlers::update_me))
        .route("/me/properties/stats", get(property::owner_stats))
        .route("/properties", post(property::create_property))
        .route("/properties/:id", patch(property::update_property).delete(property::delete_property))
        .route("/properties/:id/reviews", post(property::create_review))
        .route("/reservations", get(reservation::list_reservations).post(reservation::create_reservation))
        .route("/reservations/:id/payment/refresh", post(reservation::refresh_payment))
        .route("/reservations/:id/cancel", post(reservation::cancel_reservation))
        .route("/messages", post(message::send_message))
        .route("/messages/inbox", get(message::inbox))
        .route("/messages/sent", get(message::sent_since))
        .route("/messages/unread-count", get(message::unread_count))
        .route("/messages/conversations/:user_id", get(message::conversation))
        .route("/messages/conversations/:user_id/read", post(message::mark_conversation_read))
        .route("/messages/:id/read", post(message::mark_read))
        .route("/notifications", get(notification::list_notifications))
        .route("/notifications/read-all", post(notification::mark_all_read))
        .route("/notifications/:id/read", post(notification::mark_read))
        .route("/realtime", get(realtime::realtime_socket))
        .route("/wallet", get(wallet::get_wallet))
        .route("/wallet/transactions", get(wallet::list_transactions))
        .route("/wallet/withdrawals", get(wallet::list_withdrawals).post(wallet::create_withdrawal))
        .route("/wallet/withdrawals/:id", get(wallet::get_withdrawal))
        .route("/wallet/withdrawals/:id/refresh", post(wallet::refresh_withdrawal))
        .route("/commissions", get(commission::list_commissions))
        .route("/commissions/disputes", get(commission::list_disputes))
        .route("/commissions/:id/disputes", post(commission::open_dispute))
        .route("/verifications", post(verification::submit_verification))
        .route("/verifications/me", get(verification::my_verifications))
        .route(
            "/storage/:bucket",
            post(storage::upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth::authenticate));

    let admin_routes = Router::new()
        .route("/admin/commissions/:id/release", post(commission::release_commission))
        .route("/admin/commissions/:id/refund", post(commission::refund_commission))
        .route("/admin/disputes/:id/resolve", post(commission::resolve_dispute))
        .route("/admin/verifications/:id/review", post(verification::review_verification))
        .nest("/admin/api", admin_api())
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_admin))
        .layer(middleware::from_fn_with_state(state.clone(), auth::authenticate));

    let mut app = Router::new().merge(public_routes).merge(protected_routes).merge(admin_routes);

    if let Some(host) = state.config.admin_host.as_deref() {
        log::info!("Admin API also served on host {}", host);
        let host_routes = Router::new()
            .nest("/api", admin_api())
            .layer(middleware::from_fn_with_state(state.clone(), auth::require_admin))
            .layer(middleware::from_fn_with_state(state.clone(), auth::authenticate))
            .layer(middleware::from_fn_with_state(state.clone(), admin::require_admin_host));
        app = app.merge(host_routes);
    }

    app.with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let config = AppConfig::load()?;
    log::info!("Loaded config: {:?}", config);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let pool = db::init_pool(&config.database_url)?;
    let mut conn = pool.get()?;
    let test_query = db::health_check(&mut conn)?;
    drop(conn);
    log::info!("Database test query result: {}", test_query);

    let hub = RealtimeHub::default();
    let gateway: Arc<dyn PaymentGateway> = Arc::new(MomoGateway::new(config.momo_settings())?);
    let store = PgWithdrawalStore::new(pool.clone(), hub.clone());
    let withdrawals = WithdrawalMonitor::new(gateway.clone(), Arc::new(store), config.monitor_settings());

    let state = AppState {
        storage: DiskStore::new(config.storage_dir.clone()),
        config: Arc::new(config),
        pool,
        hub,
        gateway,
        withdrawals,
        signin_limiter: AttemptLimiter::new(5, Duration::from_secs(15 * 60)),
        otp_limiter: AttemptLimiter::new(5, Duration::from_secs(10 * 60)),
    };

    if let Err(e) = resume_withdrawals(&state).await {
        log::error!("Failed to resume in-flight withdrawals: {}", e);
    }

    let app = router(state);
    log::info!("Starting server on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app.into_make_service()).await?;

    Ok(())
}

//! # Server: REST API, WebSocket Chat and Background Sweep
//!
//! Runs the Axum HTTP server for the marketplace: JSON API under `/api/*`,
//! the real-time chat socket at `/ws` (alias `/socket.io/`), health probes and
//! Prometheus metrics. An optional static directory is served as the
//! fallback so a prebuilt frontend can be hosted from the same process.
//!
//! A single background task expires lapsed subscriptions every
//! `sweep_interval`.

pub(crate) mod error;
pub(crate) mod middleware_auth;
mod routes_admin;
mod routes_auth;
mod routes_health;
mod routes_messages;
mod routes_notifications;
mod routes_orders;
mod routes_payments;
mod routes_reviews;
mod routes_subscriptions;
mod routes_users;
mod websocket;

use anyhow::Result;
use axum::extract::{MatchedPath, Request};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::routing::{get, post, put};
use axum::Router;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Instrument};

use crate::chat::ChatHub;
use crate::config::Config;
use crate::db::{self, Pagination};
use crate::notify::{drafts, Notifier};
use crate::payments::PaymentGateway;
use crate::prom_metrics::{self, Metrics};
use crate::sms::SmsSender;

const UNMATCHED_ROUTE: &str = "unmatched";

pub struct AppState {
    pub db: db::Database,
    pub config: Config,
    pub sms: Arc<dyn SmsSender>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub hub: Arc<ChatHub>,
    pub notifier: Notifier,
    pub prom_metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        db: db::Database,
        config: Config,
        sms: Arc<dyn SmsSender>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Arc<Self> {
        let hub = Arc::new(ChatHub::new());
        let prom_metrics = Arc::new(Metrics::new());
        let notifier = Notifier::new(db.clone(), hub.clone(), prom_metrics.clone());
        Arc::new(AppState {
            db,
            config,
            sms,
            gateway,
            hub,
            notifier,
            prom_metrics,
        })
    }
}

/// Envelope for paginated list responses.
#[derive(Serialize)]
pub(crate) struct Page<T: Serialize> {
    #[serde(flatten)]
    pub items: T,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

impl<T: Serialize> Page<T> {
    pub fn new(items: T, total: i64, page: Pagination) -> Self {
        Page {
            items,
            total,
            page: page.page(),
            limit: page.limit(),
        }
    }
}

/// Records request latency into the Prometheus histogram, generates (or
/// propagates) a request id, and runs the request inside a tracing span.
async fn metrics_middleware(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> axum::response::Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = req.method().to_string();
    let raw_path = req.uri().path().to_string();
    let route = route_label(&req);
    let start = std::time::Instant::now();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %raw_path,
    );
    let mut response = next.run(req).instrument(span).await;

    state
        .prom_metrics
        .http_request_duration
        .get_or_create(&prom_metrics::HttpLabel {
            method,
            path: route,
        })
        .observe(start.elapsed().as_secs_f64());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Label requests by their route template so the latency histogram has
/// one series per route. Anything that matched no route shares one label.
fn route_label(req: &Request) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string())
}

pub fn build_router(state: Arc<AppState>, static_dir: Option<&Path>) -> Router {
    let mut app = Router::new()
        .route("/ws", get(websocket::handler_ws))
        .route("/socket.io/", get(websocket::handler_ws))
        // Auth
        .route("/api/auth/register", post(routes_auth::handler_register))
        .route("/api/auth/verify-phone", post(routes_auth::handler_verify_phone))
        .route("/api/auth/resend-code", post(routes_auth::handler_resend_code))
        .route("/api/auth/login", post(routes_auth::handler_login))
        .route(
            "/api/auth/forgot-password",
            post(routes_auth::handler_forgot_password),
        )
        .route(
            "/api/auth/reset-password",
            post(routes_auth::handler_reset_password),
        )
        .route("/api/auth/me", get(routes_auth::handler_me))
        // Users
        .route(
            "/api/users/profile",
            get(routes_users::handler_profile_get).put(routes_users::handler_profile_update),
        )
        .route("/api/users/password", put(routes_users::handler_change_password))
        .route(
            "/api/users/specializations",
            put(routes_users::handler_specializations),
        )
        .route("/api/users/balance", get(routes_users::handler_balance))
        .route("/api/users/{id}", get(routes_users::handler_public_profile))
        // Orders
        .route(
            "/api/orders",
            get(routes_orders::handler_orders_list).post(routes_orders::handler_orders_create),
        )
        .route(
            "/api/orders/my-responses",
            get(routes_orders::handler_my_responses),
        )
        .route(
            "/api/orders/{id}",
            get(routes_orders::handler_order_get)
                .put(routes_orders::handler_order_update)
                .delete(routes_orders::handler_order_delete),
        )
        .route(
            "/api/orders/{id}/responses",
            get(routes_orders::handler_responses_list).post(routes_orders::handler_respond),
        )
        .route("/api/orders/{id}/assign", post(routes_orders::handler_assign))
        .route("/api/orders/{id}/complete", post(routes_orders::handler_complete))
        .route("/api/orders/{id}/cancel", post(routes_orders::handler_cancel))
        .route("/api/orders/{id}/archive", post(routes_orders::handler_archive))
        .route(
            "/api/orders/{id}/messages",
            get(routes_messages::handler_messages_list).post(routes_messages::handler_message_send),
        )
        .route(
            "/api/orders/{id}/messages/read",
            post(routes_messages::handler_messages_read),
        )
        // Reviews
        .route("/api/reviews", post(routes_reviews::handler_review_create))
        .route("/api/reviews/my", get(routes_reviews::handler_reviews_mine))
        .route(
            "/api/reviews/user/{id}",
            get(routes_reviews::handler_reviews_for_user),
        )
        .route(
            "/api/reviews/order/{id}/eligibility",
            get(routes_reviews::handler_review_eligibility),
        )
        // Payments
        .route(
            "/api/payments",
            get(routes_payments::handler_payments_list).post(routes_payments::handler_payment_create),
        )
        .route(
            "/api/payments/callback",
            post(routes_payments::handler_payment_callback),
        )
        .route("/api/payments/{id}", get(routes_payments::handler_payment_get))
        // Subscriptions
        .route(
            "/api/subscriptions/tariffs",
            get(routes_subscriptions::handler_tariffs),
        )
        .route("/api/subscriptions/me", get(routes_subscriptions::handler_my_subscription))
        .route(
            "/api/subscriptions/purchase",
            post(routes_subscriptions::handler_purchase),
        )
        // Notifications
        .route(
            "/api/notifications",
            get(routes_notifications::handler_notifications_list),
        )
        .route(
            "/api/notifications/unread-count",
            get(routes_notifications::handler_unread_count),
        )
        .route(
            "/api/notifications/read-all",
            post(routes_notifications::handler_read_all),
        )
        .route(
            "/api/notifications/{id}",
            axum::routing::delete(routes_notifications::handler_notification_delete),
        )
        .route(
            "/api/notifications/{id}/read",
            post(routes_notifications::handler_notification_read),
        )
        // Admin
        .route("/api/admin/stats", get(routes_admin::handler_stats))
        .route("/api/admin/users", get(routes_admin::handler_users_list))
        .route(
            "/api/admin/users/{id}",
            put(routes_admin::handler_user_update).delete(routes_admin::handler_user_delete),
        )
        .route("/api/admin/orders", get(routes_admin::handler_orders_list))
        .route("/api/admin/reviews", get(routes_admin::handler_reviews_list))
        .route(
            "/api/admin/reviews/{id}/moderate",
            post(routes_admin::handler_review_moderate),
        )
        .route("/api/admin/payments", get(routes_admin::handler_payments_list))
        .route(
            "/api/admin/notifications/broadcast",
            post(routes_admin::handler_broadcast),
        )
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/readyz", get(routes_health::handler_readyz))
        .route("/metrics", get(routes_health::handler_metrics));

    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
    }

    app.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
    .layer(CatchPanicLayer::new())
    .layer(axum::middleware::from_fn_with_state(
        state.clone(),
        metrics_middleware,
    ))
    .layer(TraceLayer::new_for_http())
    .layer(RequestBodyLimitLayer::new(1024 * 1024))
    .layer(TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        Duration::from_secs(30),
    ))
    .with_state(state)
}

/// Revert lapsed subscriptions and tell the affected users.
pub async fn sweep_subscriptions(state: &AppState) -> Result<usize> {
    let limit = state
        .config
        .tariffs
        .specialization_limit(db::users::TariffType::Standard);
    let expired = state.db.expire_subscriptions(limit).await?;
    if !expired.is_empty() {
        state
            .notifier
            .notify_many(&expired, drafts::subscription_expired())
            .await;
    }
    Ok(expired.len())
}

pub async fn run(
    port: u16,
    state: Arc<AppState>,
    static_dir: Option<&Path>,
) -> Result<()> {
    let app = build_router(state.clone(), static_dir);

    let sweep_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_state.config.sweep_interval);
        loop {
            interval.tick().await;
            match sweep_subscriptions(&sweep_state).await {
                Ok(n) if n > 0 => info!(count = n, "expired subscriptions"),
                Err(e) => warn!(error = %e, "subscription sweep failed"),
                _ => {}
            }
        }
    });

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "server running");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrouted_requests_share_one_label() {
        for uri in ["/api/orders/x1", "/nope/42", "/"] {
            let req = axum::http::Request::builder()
                .uri(uri)
                .body(axum::body::Body::empty())
                .unwrap();
            assert_eq!(route_label(&req), UNMATCHED_ROUTE);
        }
    }

    #[test]
    fn page_envelope_flattens_items() {
        #[derive(Serialize)]
        struct Items {
            orders: Vec<u32>,
        }
        let page = Page::new(Items { orders: vec![1, 2] }, 2, Pagination::new(1, 10));
        let v = serde_json::to_value(&page).unwrap();
        assert_eq!(v["orders"], serde_json::json!([1, 2]));
        assert_eq!(v["total"], 2);
        assert_eq!(v["limit"], 10);
    }
}

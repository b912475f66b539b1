//! # Prometheus Metrics
//!
//! Exposes marketplace metrics in the Prometheus text exposition format at
//! `/metrics`.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `svmontaj_http_request_duration_seconds` | Histogram | `method`, `path` | Request latency |
//! | `svmontaj_orders_created_total` | Counter | `category` | Orders published |
//! | `svmontaj_order_responses_total` | Counter | - | Executor responses accepted |
//! | `svmontaj_payments_total` | Counter | `status` | Payments reaching a status |
//! | `svmontaj_notifications_total` | Counter | - | Notifications persisted |
//! | `svmontaj_ws_connections` | Gauge | - | Open WebSocket connections |
//! | `svmontaj_online_users` | Gauge | - | Users with at least one socket |
//!
//! Paths are normalised before labelling (ids collapse to `:uuid`/`:id`), so
//! the histogram family stays bounded.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabel {
    pub method: String,
    pub path: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CategoryLabel {
    pub category: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabel {
    pub status: String,
}

pub struct Metrics {
    pub registry: Registry,
    pub http_request_duration: Family<HttpLabel, Histogram>,
    pub orders_created: Family<CategoryLabel, Counter>,
    pub order_responses: Counter,
    pub payments: Family<StatusLabel, Counter>,
    pub notifications: Counter,
    pub ws_connections: Gauge,
    pub online_users: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_request_duration: Family<HttpLabel, Histogram> =
            Family::new_with_constructor(|| Histogram::new(exponential_buckets(0.005, 2.0, 12)));
        registry.register(
            "svmontaj_http_request_duration_seconds",
            "HTTP request latency by method and normalised path",
            http_request_duration.clone(),
        );

        let orders_created = Family::<CategoryLabel, Counter>::default();
        registry.register(
            "svmontaj_orders_created",
            "Orders published by category",
            orders_created.clone(),
        );

        let order_responses = Counter::default();
        registry.register(
            "svmontaj_order_responses",
            "Executor responses accepted",
            order_responses.clone(),
        );

        let payments = Family::<StatusLabel, Counter>::default();
        registry.register(
            "svmontaj_payments",
            "Payments reaching each status",
            payments.clone(),
        );

        let notifications = Counter::default();
        registry.register(
            "svmontaj_notifications",
            "Notifications persisted",
            notifications.clone(),
        );

        let ws_connections = Gauge::default();
        registry.register(
            "svmontaj_ws_connections",
            "Open WebSocket connections",
            ws_connections.clone(),
        );

        let online_users = Gauge::default();
        registry.register(
            "svmontaj_online_users",
            "Users with at least one open WebSocket",
            online_users.clone(),
        );

        Self {
            registry,
            http_request_duration,
            orders_created,
            order_responses,
            payments,
            notifications,
            ws_connections,
            online_users,
        }
    }

    pub fn record_payment(&self, status: &str) {
        self.payments
            .get_or_create(&StatusLabel {
                status: status.to_string(),
            })
            .inc();
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if let Err(e) = encode(&mut buf, &self.registry) {
            tracing::error!(error = %e, "failed to encode metrics");
        }
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

//! SVMontaj: marketplace backend connecting customers who need windows,
//! doors, ceilings and similar work installed with executors who do it.
//!
//! - [`db`]: PostgreSQL storage and the transactional business rules
//! - [`server`]: Axum REST API, WebSocket chat and the subscription sweep
//! - [`chat`]: in-process rooms and presence for live sockets
//! - [`notify`]: persisted notifications pushed to open sockets
//! - [`payments`] / [`sms`]: outbound integrations behind traits
//! - [`tariff`]: the subscription tariff table and charge splitting

pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod notify;
pub mod payments;
pub mod prom_metrics;
pub mod server;
pub mod sms;
pub mod tariff;

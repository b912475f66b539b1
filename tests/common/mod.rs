//! Shared test helpers for integration tests.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use svmontaj::config::Config;
use svmontaj::db::Database;
use svmontaj::payments::SandboxGateway;
use svmontaj::server::{self, AppState};
use svmontaj::sms::LogSmsSender;
use tower::ServiceExt;

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

/// Connect, migrate and wipe the test database.
pub async fn setup_test_db() -> Database {
    let db = Database::connect(&test_db_url())
        .await
        .expect("Failed to connect to test database");
    db.migrate().await.expect("Failed to run migrations");
    truncate_all_tables(db.pool()).await;
    db
}

/// Truncate all tables to ensure test isolation.
pub async fn truncate_all_tables(pool: &sqlx::PgPool) {
    sqlx::raw_sql(
        "TRUNCATE TABLE messages, notifications, payments, reviews, order_responses,
                       orders, verification_codes, users
         CASCADE",
    )
    .execute(pool)
    .await
    .unwrap();
}

/// A router over a clean database plus handles to its collaborators.
#[derive(Clone)]
pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub sms: Arc<LogSmsSender>,
}

/// Build an Axum test app with development settings, logged SMS and the
/// sandbox payment gateway.
pub async fn build_test_app() -> TestApp {
    let db = setup_test_db().await;
    let config = Config::development();
    let sms = Arc::new(LogSmsSender::default());
    let gateway = Arc::new(SandboxGateway::new(config.gateway.return_url.clone()));
    let state = AppState::new(db, config, sms.clone(), gateway);
    let router = server::build_router(state.clone(), None);
    TestApp { router, state, sms }
}

impl TestApp {
    /// Send one request and return the status and parsed JSON body
    /// (`null` when the body is not JSON).
    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        self.request("GET", uri, token, None).await
    }

    pub async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.request("POST", uri, token, Some(body)).await
    }

    pub async fn put(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.request("PUT", uri, token, Some(body)).await
    }

    /// Register, confirm the SMS code and return `(token, user_id)`.
    pub async fn signup(&self, phone: &str, role: &str) -> (String, String) {
        let (status, body) = self
            .post(
                "/api/auth/register",
                None,
                serde_json::json!({
                    "phone": phone,
                    "password": "secret123",
                    "name": "Тестовый пользователь",
                    "role": role,
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "register failed: {}", body);
        let normalized = body["phone"].as_str().unwrap().to_string();
        let code = self
            .sms
            .last_code_for(&normalized)
            .expect("verification code was not sent");
        let (status, body) = self
            .post(
                "/api/auth/verify-phone",
                None,
                serde_json::json!({ "phone": normalized, "code": code }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "verify failed: {}", body);
        (
            body["token"].as_str().unwrap().to_string(),
            body["user"]["id"].as_str().unwrap().to_string(),
        )
    }

    /// Create an ACTIVE admin directly in the database and log in.
    pub async fn admin(&self, phone: &str) -> String {
        let hash = svmontaj::auth::hash_password("secret123").unwrap();
        let normalized = svmontaj::auth::normalize_phone(phone).unwrap();
        self.state
            .db
            .create_user(&svmontaj::db::users::NewUser {
                phone: &normalized,
                password_hash: &hash,
                name: "Админ",
                role: svmontaj::db::users::UserRole::Admin,
                status: svmontaj::db::users::UserStatus::Active,
                phone_verified: true,
                bonus_balance: 0,
            })
            .await
            .unwrap()
            .unwrap();
        let (status, body) = self
            .post(
                "/api/auth/login",
                None,
                serde_json::json!({ "phone": normalized, "password": "secret123" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "admin login failed: {}", body);
        body["token"].as_str().unwrap().to_string()
    }
}

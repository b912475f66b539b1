//! Order CRUD, executor responses and lifecycle transitions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::error::{ApiError, ApiJson, ApiQuery, ApiResult};
use super::middleware_auth::{RequireAuth, RequireCustomer, RequireExecutor};
use super::{AppState, Page};
use crate::db::orders::{Category, NewOrder, Order, OrderFilter, OrderScope, OrderStatus, OrderUpdate};
use crate::db::responses::{NewResponse, OrderResponse, ResponseOutcome};
use crate::db::users::{User, UserRole};
use crate::db::Pagination;
use crate::notify::drafts;
use crate::prom_metrics::CategoryLabel;

const MIN_TITLE_LEN: usize = 3;
const MAX_TITLE_LEN: usize = 200;
const MAX_DESCRIPTION_LEN: usize = 5000;
const MAX_RESPONSE_MESSAGE_LEN: usize = 2000;

/// `GET /api/orders` query string. Kept flat: numeric fields fail to parse
/// from a query string behind `#[serde(flatten)]`.
#[derive(Debug, Default, Deserialize)]
pub(super) struct OrderListQuery {
    status: Option<OrderStatus>,
    category: Option<Category>,
    region: Option<String>,
    min_budget: Option<i64>,
    max_budget: Option<i64>,
    search: Option<String>,
    sort_by: Option<String>,
    sort_dir: Option<String>,
    page: Option<i64>,
    limit: Option<i64>,
}

impl OrderListQuery {
    pub(super) fn split(self) -> (OrderFilter, Pagination) {
        (
            OrderFilter {
                status: self.status,
                category: self.category,
                region: self.region,
                min_budget: self.min_budget,
                max_budget: self.max_budget,
                search: self.search,
                sort_by: self.sort_by,
                sort_dir: self.sort_dir,
            },
            Pagination {
                page: self.page,
                limit: self.limit,
            },
        )
    }
}

#[derive(Serialize)]
pub(super) struct OrderList {
    pub(super) orders: Vec<Order>,
}

#[derive(Deserialize)]
pub(super) struct RespondPayload {
    #[serde(default)]
    message: String,
    price: Option<i64>,
}

#[derive(Deserialize)]
pub(super) struct AssignPayload {
    executor_id: Uuid,
}

#[derive(Serialize)]
struct OrderDetail {
    #[serde(flatten)]
    order: Order,
    #[serde(skip_serializing_if = "Option::is_none")]
    has_responded: Option<bool>,
}

fn validate_title(title: &str) -> ApiResult<()> {
    let len = title.trim().chars().count();
    if !(MIN_TITLE_LEN..=MAX_TITLE_LEN).contains(&len) {
        return Err(ApiError::validation(
            "Title must be between 3 and 200 characters",
        ));
    }
    Ok(())
}

fn validate_coordinates(latitude: Option<f64>, longitude: Option<f64>) -> ApiResult<()> {
    if latitude.is_some_and(|v| !(-90.0..=90.0).contains(&v)) {
        return Err(ApiError::validation("Latitude must be between -90 and 90"));
    }
    if longitude.is_some_and(|v| !(-180.0..=180.0).contains(&v)) {
        return Err(ApiError::validation("Longitude must be between -180 and 180"));
    }
    Ok(())
}

fn validate_description(description: &str) -> ApiResult<()> {
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(ApiError::validation(
            "Description is too long (max 5000 characters)",
        ));
    }
    Ok(())
}

fn validate_budget(budget: Option<i64>) -> ApiResult<()> {
    if budget.is_some_and(|b| b < 0) {
        return Err(ApiError::validation("Budget must not be negative"));
    }
    Ok(())
}

pub(super) fn validate_new_order(new: &NewOrder) -> ApiResult<()> {
    validate_title(&new.title)?;
    validate_description(&new.description)?;
    if new.region.trim().is_empty() {
        return Err(ApiError::validation("Region is required"));
    }
    if new.address.trim().is_empty() {
        return Err(ApiError::validation("Address is required"));
    }
    validate_budget(new.budget)?;
    validate_coordinates(new.latitude, new.longitude)
}

fn validate_update(update: &OrderUpdate) -> ApiResult<()> {
    if let Some(title) = &update.title {
        validate_title(title)?;
    }
    if let Some(description) = &update.description {
        validate_description(description)?;
    }
    if update.region.as_deref().is_some_and(|r| r.trim().is_empty()) {
        return Err(ApiError::validation("Region is required"));
    }
    if update.address.as_deref().is_some_and(|a| a.trim().is_empty()) {
        return Err(ApiError::validation("Address is required"));
    }
    validate_budget(update.budget)?;
    validate_coordinates(update.latitude, update.longitude)
}

pub(super) fn check_transition(order: &Order, target: OrderStatus) -> ApiResult<()> {
    if order.status.can_transition_to(target) {
        Ok(())
    } else {
        Err(ApiError::validation(format!(
            "Cannot change order status from {} to {}",
            order.status, target
        )))
    }
}

pub(super) async fn load_order(state: &AppState, id: Uuid) -> ApiResult<Order> {
    state
        .db
        .get_order(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Order not found"))
}

fn scope_for(user: &User) -> OrderScope {
    match user.role {
        UserRole::Admin => OrderScope::All,
        UserRole::Customer => OrderScope::Customer(user.id),
        UserRole::Executor => OrderScope::Executor {
            id: user.id,
            specializations: user.specializations.clone(),
            region: user.region.clone(),
        },
    }
}

/// Whether an executor may see an order without having responded to it.
fn open_to_executor(user: &User, order: &Order) -> bool {
    order.status == OrderStatus::Published
        && user.specializations.contains(&order.category)
        && user
            .region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map_or(true, |r| r == order.region)
}

fn require_owner(user: &User, order: &Order) -> ApiResult<()> {
    if order.customer_id == user.id {
        Ok(())
    } else {
        Err(ApiError::forbidden("Only the order owner can do this"))
    }
}

pub(super) async fn handler_orders_list(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiQuery(query): ApiQuery<OrderListQuery>,
) -> ApiResult<Json<Page<OrderList>>> {
    let (filter, page) = query.split();
    let (orders, total) = state
        .db
        .list_orders(&scope_for(&user), &filter, page)
        .await?;
    Ok(Json(Page::new(OrderList { orders }, total, page)))
}

pub(super) async fn handler_orders_create(
    State(state): State<Arc<AppState>>,
    RequireCustomer(user): RequireCustomer,
    ApiJson(new): ApiJson<NewOrder>,
) -> ApiResult<impl IntoResponse> {
    validate_new_order(&new)?;
    let order = state.db.create_order(user.id, &new).await?;
    info!(order_id = %order.id, customer_id = %user.id, category = %order.category, "order published");
    state
        .prom_metrics
        .orders_created
        .get_or_create(&CategoryLabel {
            category: order.category.to_string(),
        })
        .inc();
    state.notifier.new_order(&order).await;
    Ok((StatusCode::CREATED, Json(order)))
}

pub(super) async fn handler_order_get(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let order = load_order(&state, id).await?;
    if user.is_admin() || order.is_party(user.id) {
        return Ok(Json(OrderDetail {
            order,
            has_responded: None,
        }));
    }
    if user.role == UserRole::Executor {
        let has_responded = state.db.has_responded(order.id, user.id).await?;
        if has_responded || open_to_executor(&user, &order) {
            return Ok(Json(OrderDetail {
                order,
                has_responded: Some(has_responded),
            }));
        }
    }
    Err(ApiError::forbidden("You do not have access to this order"))
}

pub(super) async fn handler_order_update(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
    ApiJson(update): ApiJson<OrderUpdate>,
) -> ApiResult<Json<Order>> {
    let order = load_order(&state, id).await?;
    if !user.is_admin() {
        require_owner(&user, &order)?;
        if order.status != OrderStatus::Published {
            return Err(ApiError::validation("Only published orders can be edited"));
        }
    }
    validate_update(&update)?;
    let order = state
        .db
        .update_order(id, &update)
        .await?
        .ok_or_else(|| ApiError::not_found("Order not found"))?;
    Ok(Json(order))
}

pub(super) async fn handler_order_delete(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let order = load_order(&state, id).await?;
    if !user.is_admin() {
        require_owner(&user, &order)?;
        if !matches!(order.status, OrderStatus::Published | OrderStatus::Cancelled) {
            return Err(ApiError::validation(
                "Only published or cancelled orders can be deleted",
            ));
        }
    }
    if !state.db.delete_order(id).await? {
        return Err(ApiError::not_found("Order not found"));
    }
    info!(order_id = %id, by = %user.id, "order deleted");
    Ok(Json(json!({ "message": "Order deleted" })))
}

pub(super) async fn handler_respond(
    State(state): State<Arc<AppState>>,
    RequireExecutor(user): RequireExecutor,
    Path(id): Path<Uuid>,
    ApiJson(payload): ApiJson<RespondPayload>,
) -> ApiResult<impl IntoResponse> {
    let order = load_order(&state, id).await?;
    if !user.specializations.contains(&order.category) {
        return Err(ApiError::validation(
            "Order category is not among your specializations",
        ));
    }
    if payload.message.chars().count() > MAX_RESPONSE_MESSAGE_LEN {
        return Err(ApiError::validation(
            "Message is too long (max 2000 characters)",
        ));
    }
    validate_budget(payload.price)
        .map_err(|_| ApiError::validation("Price must not be negative"))?;

    let cost = state
        .config
        .tariffs
        .response_cost(user.effective_tariff(Utc::now()));
    let outcome = state
        .db
        .create_response(&NewResponse {
            order_id: order.id,
            executor_id: user.id,
            message: &payload.message,
            price: payload.price,
            cost,
        })
        .await?;

    let (response, charge): (OrderResponse, _) = match outcome {
        ResponseOutcome::Created { response, charge } => (response, charge),
        ResponseOutcome::OrderNotFound => return Err(ApiError::not_found("Order not found")),
        ResponseOutcome::OrderNotOpen(status) => {
            return Err(ApiError::validation(format!(
                "Order is not accepting responses (status {})",
                status
            )))
        }
        ResponseOutcome::AlreadyResponded => {
            return Err(ApiError::validation(
                "You have already responded to this order",
            ))
        }
        ResponseOutcome::InsufficientFunds {
            required,
            available,
        } => {
            return Err(ApiError::validation(format!(
                "Insufficient funds: response costs {}, available {}",
                required, available
            )))
        }
    };

    info!(order_id = %order.id, executor_id = %user.id, cost = charge.total(), "response created");
    state.prom_metrics.order_responses.inc();
    state
        .notifier
        .notify(order.customer_id, drafts::new_response(&order, &user.name))
        .await;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "response": response,
            "charged": charge.total(),
            "from_bonus": charge.from_bonus,
            "from_balance": charge.from_balance,
        })),
    ))
}

pub(super) async fn handler_responses_list(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let order = load_order(&state, id).await?;
    let only = if user.is_admin() || order.customer_id == user.id {
        None
    } else if user.role == UserRole::Executor {
        Some(user.id)
    } else {
        return Err(ApiError::forbidden("You do not have access to this order"));
    };
    let responses = state.db.list_order_responses(order.id, only).await?;
    Ok(Json(json!({ "responses": responses })))
}

pub(super) async fn handler_my_responses(
    State(state): State<Arc<AppState>>,
    RequireExecutor(user): RequireExecutor,
    ApiQuery(page): ApiQuery<Pagination>,
) -> ApiResult<Json<serde_json::Value>> {
    let (responses, total) = state.db.list_executor_responses(user.id, page).await?;
    Ok(Json(json!({
        "responses": responses,
        "total": total,
        "page": page.page(),
        "limit": page.limit(),
    })))
}

pub(super) async fn handler_assign(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
    ApiJson(payload): ApiJson<AssignPayload>,
) -> ApiResult<Json<Order>> {
    let order = load_order(&state, id).await?;
    require_owner(&user, &order)?;
    check_transition(&order, OrderStatus::InProgress)?;
    let order = state
        .db
        .assign_executor(order.id, payload.executor_id)
        .await?
        .ok_or_else(|| ApiError::validation("Executor has not responded to this order"))?;
    info!(order_id = %order.id, executor_id = %payload.executor_id, "executor assigned");
    state
        .notifier
        .notify(payload.executor_id, drafts::order_assigned(&order))
        .await;
    Ok(Json(order))
}

pub(super) async fn handler_complete(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Order>> {
    let order = load_order(&state, id).await?;
    require_owner(&user, &order)?;
    check_transition(&order, OrderStatus::Completed)?;
    let order = state
        .db
        .complete_order(order.id)
        .await?
        .ok_or_else(|| ApiError::validation("Order is no longer in progress"))?;
    info!(order_id = %order.id, "order completed");
    if let Some(executor_id) = order.executor_id {
        state
            .notifier
            .notify(executor_id, drafts::order_completed(&order))
            .await;
    }
    Ok(Json(order))
}

pub(super) async fn handler_cancel(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Order>> {
    let order = load_order(&state, id).await?;
    require_owner(&user, &order)?;
    check_transition(&order, OrderStatus::Cancelled)?;
    let order = state
        .db
        .transition_order(order.id, OrderStatus::Cancelled)
        .await?
        .ok_or_else(|| ApiError::validation("Order status changed, try again"))?;
    info!(order_id = %order.id, "order cancelled");
    if let Some(executor_id) = order.executor_id {
        state
            .notifier
            .notify(executor_id, drafts::order_cancelled(&order))
            .await;
    }
    Ok(Json(order))
}

pub(super) async fn handler_archive(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Order>> {
    let order = load_order(&state, id).await?;
    if !user.is_admin() {
        require_owner(&user, &order)?;
    }
    check_transition(&order, OrderStatus::Archived)?;
    let order = state
        .db
        .transition_order(order.id, OrderStatus::Archived)
        .await?
        .ok_or_else(|| ApiError::validation("Order status changed, try again"))?;
    Ok(Json(order))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_order() -> NewOrder {
        NewOrder {
            title: "Установить межкомнатную дверь".into(),
            description: String::new(),
            category: Category::Doors,
            region: "Москва".into(),
            address: "ул. Арбат, 10".into(),
            latitude: Some(55.75),
            longitude: Some(37.59),
            budget: Some(5000),
        }
    }

    #[test]
    fn valid_order_passes() {
        assert!(validate_new_order(&new_order()).is_ok());
    }

    #[test]
    fn title_bounds_count_characters() {
        let mut o = new_order();
        o.title = "ок".into();
        assert!(validate_new_order(&o).is_err());
        o.title = "окн".into();
        assert!(validate_new_order(&o).is_ok());
        o.title = "я".repeat(201);
        assert!(validate_new_order(&o).is_err());
    }

    #[test]
    fn coordinates_and_budget_checked() {
        let mut o = new_order();
        o.latitude = Some(91.0);
        assert!(validate_new_order(&o).is_err());
        let mut o = new_order();
        o.longitude = Some(-180.5);
        assert!(validate_new_order(&o).is_err());
        let mut o = new_order();
        o.budget = Some(-1);
        assert!(validate_new_order(&o).is_err());
    }

    #[test]
    fn blank_address_rejected() {
        let mut o = new_order();
        o.address = "   ".into();
        assert!(validate_new_order(&o).is_err());
    }

    #[test]
    fn list_query_splits_into_filter_and_page() {
        let q: OrderListQuery = serde_json::from_value(serde_json::json!({
            "category": "WINDOWS",
            "min_budget": 1000,
            "page": 2,
            "limit": 5,
        }))
        .unwrap();
        let (filter, page) = q.split();
        assert_eq!(filter.category, Some(Category::Windows));
        assert_eq!(filter.min_budget, Some(1000));
        assert_eq!(page.offset(), 5);
    }
}

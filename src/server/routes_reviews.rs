//! Reviews left by the two parties of a completed order.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::error::{ApiError, ApiJson, ApiQuery, ApiResult};
use super::middleware_auth::RequireAuth;
use super::routes_orders::load_order;
use super::{AppState, Page};
use crate::db::reviews::{review_target, Ineligible, ReviewWithAuthor, MAX_RATING, MIN_RATING};
use crate::db::Pagination;

const MAX_COMMENT_LEN: usize = 2000;

#[derive(Deserialize)]
pub(super) struct ReviewPayload {
    order_id: Uuid,
    rating: i64,
    comment: Option<String>,
}

#[derive(Serialize)]
pub(super) struct ReviewList {
    reviews: Vec<ReviewWithAuthor>,
}

#[derive(Debug, Serialize, PartialEq)]
pub(super) struct Eligibility {
    can_review: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reviewee_id: Option<Uuid>,
}

impl Eligibility {
    fn from_target(target: Result<Uuid, Ineligible>) -> Self {
        match target {
            Ok(reviewee_id) => Eligibility {
                can_review: true,
                reason: None,
                reviewee_id: Some(reviewee_id),
            },
            Err(why) => Eligibility {
                can_review: false,
                reason: Some(why.message()),
                reviewee_id: None,
            },
        }
    }
}

fn validate_review(rating: i64, comment: Option<&str>) -> ApiResult<(i16, Option<String>)> {
    let rating = i16::try_from(rating)
        .ok()
        .filter(|r| (MIN_RATING..=MAX_RATING).contains(r))
        .ok_or_else(|| ApiError::validation("Rating must be between 1 and 5"))?;
    let comment = comment.map(str::trim).filter(|c| !c.is_empty());
    if comment.is_some_and(|c| c.chars().count() > MAX_COMMENT_LEN) {
        return Err(ApiError::validation(
            "Comment is too long (max 2000 characters)",
        ));
    }
    Ok((rating, comment.map(str::to_string)))
}

pub(super) async fn handler_review_create(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    ApiJson(payload): ApiJson<ReviewPayload>,
) -> ApiResult<impl IntoResponse> {
    let (rating, comment) = validate_review(payload.rating, payload.comment.as_deref())?;
    let order = load_order(&state, payload.order_id).await?;
    let reviewee_id =
        review_target(&order, user.id).map_err(|why| ApiError::validation(why.message()))?;
    let review = state
        .db
        .create_review(order.id, user.id, reviewee_id, rating, comment.as_deref())
        .await?
        .ok_or_else(|| ApiError::validation(Ineligible::AlreadyReviewed.message()))?;
    info!(review_id = %review.id, order_id = %order.id, rating, "review submitted for moderation");
    Ok((StatusCode::CREATED, Json(review)))
}

pub(super) async fn handler_reviews_mine(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
) -> ApiResult<Json<serde_json::Value>> {
    let reviews = state.db.list_reviews_by(user.id).await?;
    Ok(Json(serde_json::json!({ "reviews": reviews })))
}

pub(super) async fn handler_reviews_for_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    ApiQuery(page): ApiQuery<Pagination>,
) -> ApiResult<Json<Page<ReviewList>>> {
    let (reviews, total) = state.db.list_reviews_about(id, page).await?;
    Ok(Json(Page::new(ReviewList { reviews }, total, page)))
}

pub(super) async fn handler_review_eligibility(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Eligibility>> {
    let order = load_order(&state, id).await?;
    let mut target = review_target(&order, user.id);
    if target.is_ok() && state.db.has_reviewed(order.id, user.id).await? {
        target = Err(Ineligible::AlreadyReviewed);
    }
    Ok(Json(Eligibility::from_target(target)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rating_must_be_in_range() {
        assert!(validate_review(0, None).is_err());
        assert!(validate_review(6, None).is_err());
        assert!(validate_review(70_000, None).is_err());
        assert_eq!(validate_review(5, None).unwrap().0, 5);
    }

    #[test]
    fn blank_comment_becomes_none() {
        let (_, comment) = validate_review(4, Some("   ")).unwrap();
        assert_eq!(comment, None);
        let (_, comment) = validate_review(4, Some(" Всё отлично ")).unwrap();
        assert_eq!(comment.as_deref(), Some("Всё отлично"));
    }

    #[test]
    fn long_comment_rejected() {
        let long = "а".repeat(2001);
        assert!(validate_review(3, Some(&long)).is_err());
    }

    #[test]
    fn eligibility_reports_reason() {
        let e = Eligibility::from_target(Err(Ineligible::NotCompleted));
        assert!(!e.can_review);
        assert_eq!(e.reason, Some(Ineligible::NotCompleted.message()));
        let id = Uuid::new_v4();
        let e = Eligibility::from_target(Ok(id));
        assert!(e.can_review);
        assert_eq!(e.reviewee_id, Some(id));
    }
}

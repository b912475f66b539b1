//! Notification fan-out: persist a notification, then push it to the
//! recipient's open sockets.
//!
//! Notifications are side effects of business operations that have already
//! committed, so failures here are logged and swallowed.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::chat::{ChatHub, ServerEvent};
use crate::db::notifications::{NotificationDraft, NotificationKind};
use crate::db::orders::Order;
use crate::db::payments::{Payment, PaymentPurpose};
use crate::db::reviews::ReviewStatus;
use crate::db::users::{TariffType, UserStatus};
use crate::db::Database;
use crate::prom_metrics::Metrics;

#[derive(Clone)]
pub struct Notifier {
    db: Database,
    hub: Arc<ChatHub>,
    metrics: Arc<Metrics>,
}

impl Notifier {
    pub fn new(db: Database, hub: Arc<ChatHub>, metrics: Arc<Metrics>) -> Self {
        Notifier { db, hub, metrics }
    }

    pub async fn notify(&self, user_id: Uuid, draft: NotificationDraft) {
        match self.db.insert_notification(user_id, &draft).await {
            Ok(n) => {
                self.metrics.notifications.inc();
                self.hub.send_to_user(user_id, &ServerEvent::Notification(n));
            }
            Err(e) => warn!(%user_id, kind = ?draft.kind, error = %e, "failed to store notification"),
        }
    }

    pub async fn notify_many(&self, user_ids: &[Uuid], draft: NotificationDraft) -> usize {
        match self.db.insert_notifications(user_ids, &draft).await {
            Ok(rows) => {
                self.metrics.notifications.inc_by(rows.len() as u64);
                let count = rows.len();
                for n in rows {
                    let user_id = n.user_id;
                    self.hub.send_to_user(user_id, &ServerEvent::Notification(n));
                }
                count
            }
            Err(e) => {
                warn!(recipients = user_ids.len(), kind = ?draft.kind, error = %e, "failed to store notifications");
                0
            }
        }
    }

    /// Tell matching executors about a freshly published order.
    pub async fn new_order(&self, order: &Order) {
        match self.db.matching_executors(order).await {
            Ok(ids) => {
                self.notify_many(&ids, drafts::new_order(order)).await;
            }
            Err(e) => warn!(order_id = %order.id, error = %e, "failed to find matching executors"),
        }
    }
}

/// Notification texts for each business event.
pub mod drafts {
    use super::*;

    fn draft(kind: NotificationKind, title: String, body: String, order_id: Option<Uuid>) -> NotificationDraft {
        NotificationDraft {
            kind,
            title,
            body,
            order_id,
        }
    }

    pub fn new_order(order: &Order) -> NotificationDraft {
        let budget = order
            .budget
            .map(|b| format!(", бюджет {} ₽", b))
            .unwrap_or_default();
        draft(
            NotificationKind::NewOrder,
            "Новый заказ".into(),
            format!("{} ({}{})", order.title, order.region, budget),
            Some(order.id),
        )
    }

    pub fn new_response(order: &Order, executor_name: &str) -> NotificationDraft {
        draft(
            NotificationKind::NewResponse,
            "Новый отклик".into(),
            format!("{} откликнулся на заказ «{}»", executor_name, order.title),
            Some(order.id),
        )
    }

    pub fn order_assigned(order: &Order) -> NotificationDraft {
        draft(
            NotificationKind::OrderAssigned,
            "Вас выбрали исполнителем".into(),
            format!("Заказ «{}» передан вам в работу", order.title),
            Some(order.id),
        )
    }

    pub fn order_completed(order: &Order) -> NotificationDraft {
        draft(
            NotificationKind::OrderCompleted,
            "Заказ завершён".into(),
            format!("Заказчик отметил заказ «{}» выполненным", order.title),
            Some(order.id),
        )
    }

    pub fn order_cancelled(order: &Order) -> NotificationDraft {
        draft(
            NotificationKind::OrderCancelled,
            "Заказ отменён".into(),
            format!("Заказ «{}» отменён заказчиком", order.title),
            Some(order.id),
        )
    }

    pub fn new_message(order: &Order, sender_name: &str) -> NotificationDraft {
        draft(
            NotificationKind::NewMessage,
            "Новое сообщение".into(),
            format!("{} написал в чате заказа «{}»", sender_name, order.title),
            Some(order.id),
        )
    }

    pub fn new_review(rating: i16, order_id: Uuid) -> NotificationDraft {
        draft(
            NotificationKind::NewReview,
            "Новый отзыв".into(),
            format!("О вас оставили отзыв с оценкой {}", rating),
            Some(order_id),
        )
    }

    pub fn review_moderated(status: ReviewStatus, order_id: Uuid) -> NotificationDraft {
        let body = match status {
            ReviewStatus::Approved => "Ваш отзыв опубликован",
            ReviewStatus::Rejected => "Ваш отзыв отклонён модератором",
            ReviewStatus::Pending => "Ваш отзыв ожидает модерации",
        };
        draft(
            NotificationKind::ReviewModerated,
            "Модерация отзыва".into(),
            body.into(),
            Some(order_id),
        )
    }

    pub fn payment_succeeded(payment: &Payment) -> NotificationDraft {
        let body = match (payment.purpose, payment.tariff) {
            (PaymentPurpose::Subscription, Some(t)) => {
                format!("Оплата тарифа {} на сумму {} ₽ прошла успешно", t, payment.amount)
            }
            _ => format!("Баланс пополнен на {} ₽", payment.amount),
        };
        draft(
            NotificationKind::PaymentSucceeded,
            "Платёж выполнен".into(),
            body,
            None,
        )
    }

    pub fn payment_failed(payment: &Payment) -> NotificationDraft {
        draft(
            NotificationKind::PaymentFailed,
            "Платёж не прошёл".into(),
            format!("Платёж на сумму {} ₽ не был выполнен", payment.amount),
            None,
        )
    }

    pub fn subscription_activated(
        tariff: TariffType,
        expires_at: Option<DateTime<Utc>>,
    ) -> NotificationDraft {
        let until = expires_at
            .map(|t| format!(" до {}", t.format("%d.%m.%Y")))
            .unwrap_or_default();
        draft(
            NotificationKind::SubscriptionActivated,
            "Тариф подключён".into(),
            format!("Тариф {} активен{}", tariff, until),
            None,
        )
    }

    pub fn subscription_expired() -> NotificationDraft {
        draft(
            NotificationKind::SubscriptionExpired,
            "Подписка закончилась".into(),
            "Срок действия тарифа истёк, аккаунт переведён на тариф STANDARD".into(),
            None,
        )
    }

    pub fn account_status(status: UserStatus) -> NotificationDraft {
        let body = match status {
            UserStatus::Active => "Ваш аккаунт активен",
            UserStatus::Blocked => "Ваш аккаунт заблокирован администратором",
            UserStatus::Pending => "Ваш аккаунт ожидает подтверждения",
        };
        draft(
            NotificationKind::AccountStatus,
            "Статус аккаунта".into(),
            body.into(),
            None,
        )
    }

    pub fn system(title: &str, body: &str) -> NotificationDraft {
        draft(NotificationKind::System, title.into(), body.into(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::drafts;
    use super::*;
    use crate::db::orders::{Category, OrderStatus};

    fn order() -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            executor_id: None,
            title: "Натяжной потолок".into(),
            description: String::new(),
            category: Category::Ceilings,
            region: "Казань".into(),
            address: "ул. Баумана, 1".into(),
            latitude: None,
            longitude: None,
            budget: Some(15_000),
            status: OrderStatus::Published,
            responses_count: 0,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn order_drafts_link_the_order() {
        let o = order();
        for d in [
            drafts::new_order(&o),
            drafts::new_response(&o, "Иван"),
            drafts::order_assigned(&o),
            drafts::order_completed(&o),
            drafts::order_cancelled(&o),
            drafts::new_message(&o, "Иван"),
        ] {
            assert_eq!(d.order_id, Some(o.id));
            assert!(d.body.contains(&o.title) || d.kind == NotificationKind::NewOrder);
        }
        let d = drafts::new_order(&o);
        assert!(d.body.contains("Казань"));
        assert!(d.body.contains("15000"));
    }

    #[test]
    fn payment_draft_mentions_tariff() {
        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount: 990,
            purpose: PaymentPurpose::Subscription,
            tariff: Some(TariffType::Comfort),
            status: crate::db::payments::PaymentStatus::Succeeded,
            external_id: None,
            confirmation_url: None,
            created_at: now,
            updated_at: now,
        };
        let d = drafts::payment_succeeded(&payment);
        assert_eq!(d.kind, NotificationKind::PaymentSucceeded);
        assert!(d.body.contains("COMFORT"));
    }
}

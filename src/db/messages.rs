//! Order chat history.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::Database;

pub const MAX_MESSAGE_LEN: usize = 4000;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    pub order_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub content: String,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub content: String,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
}

impl NewMessage {
    /// Trim the content and check it is either non-empty text within the
    /// length limit or carries a file.
    pub fn validate(mut self) -> Result<Self, &'static str> {
        self.content = self.content.trim().to_string();
        self.file_url = self.file_url.filter(|u| !u.trim().is_empty());
        if self.content.chars().count() > MAX_MESSAGE_LEN {
            return Err("Message is too long (max 4000 characters)");
        }
        if self.content.is_empty() && self.file_url.is_none() {
            return Err("Message must have content or a file");
        }
        Ok(self)
    }
}

impl Database {
    pub async fn insert_message(
        &self,
        order_id: Uuid,
        sender_id: Uuid,
        new: &NewMessage,
    ) -> Result<Message> {
        let row = sqlx::query_as::<_, Message>(
            "WITH inserted AS (
               INSERT INTO messages (id, order_id, sender_id, content, file_url, file_name)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING *
             )
             SELECT m.id, m.order_id, m.sender_id, u.name AS sender_name, m.content,
                    m.file_url, m.file_name, m.is_read, m.created_at
             FROM inserted m JOIN users u ON u.id = m.sender_id",
        )
        .bind(Uuid::new_v4())
        .bind(order_id)
        .bind(sender_id)
        .bind(&new.content)
        .bind(new.file_url.as_deref())
        .bind(new.file_name.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// A page of an order's messages, oldest first. With `before`, returns
    /// the `limit` messages immediately preceding that timestamp.
    pub async fn list_messages(
        &self,
        order_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let mut rows = sqlx::query_as::<_, Message>(
            "SELECT m.id, m.order_id, m.sender_id, u.name AS sender_name, m.content,
                    m.file_url, m.file_name, m.is_read, m.created_at
             FROM messages m JOIN users u ON u.id = m.sender_id
             WHERE m.order_id = $1 AND ($2::timestamptz IS NULL OR m.created_at < $2)
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT $3",
        )
        .bind(order_id)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    /// Mark every message in the order not sent by `reader` as read.
    pub async fn mark_messages_read(&self, order_id: Uuid, reader_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET is_read = TRUE
             WHERE order_id = $1 AND sender_id <> $2 AND is_read = FALSE",
        )
        .bind(order_id)
        .bind(reader_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Everyone who may read an order's chat, admins excluded: the customer,
    /// the assigned executor, and every executor who responded.
    pub async fn chat_participants(&self, order_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT customer_id FROM orders WHERE id = $1
             UNION
             SELECT executor_id FROM orders WHERE id = $1 AND executor_id IS NOT NULL
             UNION
             SELECT executor_id FROM order_responses WHERE order_id = $1",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_is_trimmed() {
        let msg = NewMessage {
            content: "  здравствуйте  ".into(),
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(msg.content, "здравствуйте");
    }

    #[test]
    fn empty_message_without_file_is_rejected() {
        let msg = NewMessage {
            content: "   ".into(),
            file_url: Some(" ".into()),
            ..Default::default()
        };
        assert!(msg.validate().is_err());
    }

    #[test]
    fn file_only_message_is_accepted() {
        let msg = NewMessage {
            content: String::new(),
            file_url: Some("https://cdn.example.com/plan.pdf".into()),
            file_name: Some("plan.pdf".into()),
        };
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn length_limit_counts_characters() {
        let ok = NewMessage {
            content: "ы".repeat(MAX_MESSAGE_LEN),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
        let too_long = NewMessage {
            content: "a".repeat(MAX_MESSAGE_LEN + 1),
            ..Default::default()
        };
        assert!(too_long.validate().is_err());
    }
}

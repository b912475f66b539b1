//! SMS verification codes for phone confirmation and password reset.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use super::Database;

type HmacSha256 = Hmac<Sha256>;

const CODE_MAC_KEY: &[u8] = b"svmontaj-verification-code";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "code_purpose", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CodePurpose {
    VerifyPhone,
    ResetPassword,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VerificationCode {
    pub id: Uuid,
    pub phone: String,
    pub purpose: CodePurpose,
    pub code: String,
    pub attempts: i32,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeCheck {
    Valid,
    Invalid,
    Expired,
    TooManyAttempts,
    Missing,
}

impl CodeCheck {
    pub fn message(self) -> &'static str {
        match self {
            CodeCheck::Valid => "Code accepted",
            CodeCheck::Invalid => "Invalid verification code",
            CodeCheck::Expired => "Verification code has expired",
            CodeCheck::TooManyAttempts => "Too many attempts, request a new code",
            CodeCheck::Missing => "No verification code was requested for this phone",
        }
    }
}

/// Compare codes in constant time by checking the HMAC of one against the
/// other's tag.
fn codes_match(stored: &str, submitted: &str) -> bool {
    let (Ok(mut expected), Ok(mut actual)) = (
        HmacSha256::new_from_slice(CODE_MAC_KEY),
        HmacSha256::new_from_slice(CODE_MAC_KEY),
    ) else {
        return false;
    };
    expected.update(stored.as_bytes());
    actual.update(submitted.as_bytes());
    actual.verify_slice(&expected.finalize().into_bytes()).is_ok()
}

/// Judge a submitted code against the latest live code row.
///
/// Attempts are counted before comparison, so the attempt that hits the
/// limit is still checked but the next one is refused.
pub fn evaluate_code(
    stored: Option<&VerificationCode>,
    submitted: &str,
    now: DateTime<Utc>,
    max_attempts: i32,
) -> CodeCheck {
    let Some(stored) = stored else {
        return CodeCheck::Missing;
    };
    if stored.consumed_at.is_some() {
        return CodeCheck::Missing;
    }
    if stored.expires_at <= now {
        return CodeCheck::Expired;
    }
    if stored.attempts >= max_attempts {
        return CodeCheck::TooManyAttempts;
    }
    if codes_match(&stored.code, submitted.trim()) {
        CodeCheck::Valid
    } else {
        CodeCheck::Invalid
    }
}

const CODE_COLUMNS: &str = "id, phone, purpose, code, attempts, expires_at, consumed_at, created_at";

impl Database {
    /// Store a new code, invalidating any earlier unconsumed code for the
    /// same phone and purpose.
    pub async fn create_code(
        &self,
        phone: &str,
        purpose: CodePurpose,
        code: &str,
        ttl: Duration,
    ) -> Result<VerificationCode> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE verification_codes SET consumed_at = NOW()
             WHERE phone = $1 AND purpose = $2 AND consumed_at IS NULL",
        )
        .bind(phone)
        .bind(purpose)
        .execute(&mut *tx)
        .await?;
        let sql = format!(
            "INSERT INTO verification_codes (id, phone, purpose, code, expires_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {}",
            CODE_COLUMNS
        );
        let row = sqlx::query_as::<_, VerificationCode>(&sql)
            .bind(Uuid::new_v4())
            .bind(phone)
            .bind(purpose)
            .bind(code)
            .bind(Utc::now() + ttl)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row)
    }

    /// When the last code for this phone and purpose was issued.
    pub async fn latest_code_sent_at(
        &self,
        phone: &str,
        purpose: CodePurpose,
    ) -> Result<Option<DateTime<Utc>>> {
        let at = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(created_at) FROM verification_codes WHERE phone = $1 AND purpose = $2",
        )
        .bind(phone)
        .bind(purpose)
        .fetch_one(&self.pool)
        .await?;
        Ok(at)
    }

    /// Count an attempt against the live code and consume it on success.
    pub async fn check_code(
        &self,
        phone: &str,
        purpose: CodePurpose,
        submitted: &str,
        max_attempts: i32,
    ) -> Result<CodeCheck> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT {} FROM verification_codes
             WHERE phone = $1 AND purpose = $2 AND consumed_at IS NULL
             ORDER BY created_at DESC
             LIMIT 1
             FOR UPDATE",
            CODE_COLUMNS
        );
        let stored = sqlx::query_as::<_, VerificationCode>(&sql)
            .bind(phone)
            .bind(purpose)
            .fetch_optional(&mut *tx)
            .await?;

        let verdict = evaluate_code(stored.as_ref(), submitted, Utc::now(), max_attempts);
        if let Some(stored) = &stored {
            match verdict {
                CodeCheck::Valid => {
                    sqlx::query(
                        "UPDATE verification_codes SET attempts = attempts + 1, consumed_at = NOW()
                         WHERE id = $1",
                    )
                    .bind(stored.id)
                    .execute(&mut *tx)
                    .await?;
                }
                CodeCheck::Invalid => {
                    sqlx::query(
                        "UPDATE verification_codes SET attempts = attempts + 1 WHERE id = $1",
                    )
                    .bind(stored.id)
                    .execute(&mut *tx)
                    .await?;
                }
                _ => {}
            }
        }
        tx.commit().await?;
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(attempts: i32, expires_in: Duration) -> VerificationCode {
        let now = Utc::now();
        VerificationCode {
            id: Uuid::new_v4(),
            phone: "+79161234567".into(),
            purpose: CodePurpose::VerifyPhone,
            code: "123456".into(),
            attempts,
            expires_at: now + expires_in,
            consumed_at: None,
            created_at: now,
        }
    }

    #[test]
    fn matching_code_is_valid() {
        let c = code(0, Duration::minutes(10));
        assert_eq!(evaluate_code(Some(&c), "123456", Utc::now(), 5), CodeCheck::Valid);
        assert_eq!(evaluate_code(Some(&c), " 123456 ", Utc::now(), 5), CodeCheck::Valid);
    }

    #[test]
    fn wrong_code_is_invalid() {
        let c = code(0, Duration::minutes(10));
        assert_eq!(evaluate_code(Some(&c), "654321", Utc::now(), 5), CodeCheck::Invalid);
        assert_eq!(evaluate_code(Some(&c), "12345", Utc::now(), 5), CodeCheck::Invalid);
        assert_eq!(evaluate_code(Some(&c), "", Utc::now(), 5), CodeCheck::Invalid);
    }

    #[test]
    fn codes_compare_by_value() {
        assert!(codes_match("004217", "004217"));
        assert!(!codes_match("004217", "004218"));
        assert!(!codes_match("004217", "0042170"));
    }

    #[test]
    fn expired_code_is_rejected_even_if_correct() {
        let c = code(0, Duration::seconds(-1));
        assert_eq!(evaluate_code(Some(&c), "123456", Utc::now(), 5), CodeCheck::Expired);
    }

    #[test]
    fn attempts_are_capped() {
        let c = code(4, Duration::minutes(10));
        assert_eq!(evaluate_code(Some(&c), "123456", Utc::now(), 5), CodeCheck::Valid);
        let c = code(5, Duration::minutes(10));
        assert_eq!(
            evaluate_code(Some(&c), "123456", Utc::now(), 5),
            CodeCheck::TooManyAttempts
        );
    }

    #[test]
    fn consumed_or_absent_code_is_missing() {
        let mut c = code(0, Duration::minutes(10));
        c.consumed_at = Some(Utc::now());
        assert_eq!(evaluate_code(Some(&c), "123456", Utc::now(), 5), CodeCheck::Missing);
        assert_eq!(evaluate_code(None, "123456", Utc::now(), 5), CodeCheck::Missing);
    }
}

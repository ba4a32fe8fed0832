// Database queries for leads

use crate::db::schema::{Lead, LeadAction, NewLead, RegisterOutcome, ScoreHistory};
use crate::errors::{AppError, Result};
use chrono::Utc;
use sqlx::SqlitePool;

/// Strip the formatting characters people type into phone numbers
pub fn normalize_whatsapp(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '+' | ' ' | '-'))
        .collect()
}

impl NewLead {
    /// Normalize the phone number and check required fields
    pub fn validated(mut self) -> Result<Self> {
        self.whatsapp = normalize_whatsapp(&self.whatsapp);
        self.name = self.name.trim().to_string();

        if self.whatsapp.is_empty() || self.name.is_empty() {
            return Err(AppError::ValidationError(
                "whatsapp and name are required".to_string(),
            ));
        }

        if !(0..=100).contains(&self.score) {
            return Err(AppError::ValidationError(
                "score must be between 0 and 100".to_string(),
            ));
        }

        Ok(self)
    }
}

/// Insert or update a lead, recording score changes in the history
pub async fn register(pool: &SqlitePool, lead: &NewLead) -> Result<RegisterOutcome> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let existing: Option<(i64, i64)> =
        sqlx::query_as("SELECT id, score FROM leads WHERE whatsapp = ?")
            .bind(&lead.whatsapp)
            .fetch_optional(&mut *tx)
            .await?;

    let (lead_id, action) = match existing {
        Some((id, previous_score)) => {
            sqlx::query(
                r#"
                UPDATE leads
                SET name = ?, property_id = ?, score = ?, scheduled_visit = ?, updated_at = ?
                WHERE whatsapp = ?
                "#,
            )
            .bind(&lead.name)
            .bind(lead.property_id)
            .bind(lead.score)
            .bind(lead.scheduled_visit)
            .bind(now)
            .bind(&lead.whatsapp)
            .execute(&mut *tx)
            .await?;

            if previous_score != lead.score {
                let reason = format!("Score updated from {} to {}", previous_score, lead.score);
                record_score_change(&mut tx, &lead.whatsapp, previous_score, lead.score, &reason)
                    .await?;
            }

            (id, LeadAction::Updated)
        }
        None => {
            let id = sqlx::query(
                r#"
                INSERT INTO leads
                    (whatsapp, name, property_id, score, scheduled_visit, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&lead.whatsapp)
            .bind(&lead.name)
            .bind(lead.property_id)
            .bind(lead.score)
            .bind(lead.scheduled_visit)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            record_score_change(&mut tx, &lead.whatsapp, 0, lead.score, "Lead created").await?;

            (id, LeadAction::Created)
        }
    };

    tx.commit().await?;

    tracing::info!(
        whatsapp = %lead.whatsapp,
        lead_id,
        action = ?action,
        score = lead.score,
        "Lead registered"
    );

    Ok(RegisterOutcome {
        success: true,
        lead_id,
        action,
        score: lead.score,
    })
}

async fn record_score_change(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    whatsapp: &str,
    previous_score: i64,
    new_score: i64,
    reason: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO score_history (whatsapp, previous_score, new_score, reason, recorded_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(whatsapp)
    .bind(previous_score)
    .bind(new_score)
    .bind(reason)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Get a lead by its normalized WhatsApp number
pub async fn get_by_whatsapp(pool: &SqlitePool, whatsapp: &str) -> Result<Option<Lead>> {
    let lead = sqlx::query_as::<_, Lead>(
        r#"
        SELECT id, whatsapp, name, property_id, score, scheduled_visit, created_at, updated_at
        FROM leads
        WHERE whatsapp = ?
        "#,
    )
    .bind(whatsapp)
    .fetch_optional(pool)
    .await?;

    Ok(lead)
}

/// Score changes for a lead, newest first
pub async fn score_history(pool: &SqlitePool, whatsapp: &str) -> Result<Vec<ScoreHistory>> {
    let history = sqlx::query_as::<_, ScoreHistory>(
        r#"
        SELECT id, whatsapp, previous_score, new_score, reason, recorded_at
        FROM score_history
        WHERE whatsapp = ?
        ORDER BY id DESC
        "#,
    )
    .bind(whatsapp)
    .fetch_all(pool)
    .await?;

    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    fn lead(score: i64) -> NewLead {
        NewLead {
            whatsapp: "+55 31 99988-7766".to_string(),
            name: "João Silva".to_string(),
            property_id: Some(1),
            score,
            scheduled_visit: false,
        }
    }

    #[test]
    fn test_normalize_whatsapp() {
        assert_eq!(normalize_whatsapp("+55 31 99988-7766"), "5531999887766");
        assert_eq!(normalize_whatsapp("5531999887766"), "5531999887766");
    }

    #[test]
    fn test_validation() {
        assert!(lead(101).validated().is_err());
        assert!(lead(-1).validated().is_err());

        let mut missing_name = lead(45);
        missing_name.name = "  ".to_string();
        assert!(missing_name.validated().is_err());

        let valid = lead(45).validated().unwrap();
        assert_eq!(valid.whatsapp, "5531999887766");
    }

    #[tokio::test]
    async fn test_register_creates_then_updates() {
        let pool = memory_pool().await.unwrap();
        let new_lead = lead(45).validated().unwrap();

        let created = register(&pool, &new_lead).await.unwrap();
        assert_eq!(created.action, LeadAction::Created);

        let updated = register(&pool, &lead(80).validated().unwrap()).await.unwrap();
        assert_eq!(updated.action, LeadAction::Updated);
        assert_eq!(updated.lead_id, created.lead_id);

        let stored = get_by_whatsapp(&pool, "5531999887766").await.unwrap().unwrap();
        assert_eq!(stored.score, 80);
        assert_eq!(stored.property_id, Some(1));
    }

    #[tokio::test]
    async fn test_history_only_records_score_changes() {
        let pool = memory_pool().await.unwrap();

        register(&pool, &lead(45).validated().unwrap()).await.unwrap();
        register(&pool, &lead(45).validated().unwrap()).await.unwrap();
        register(&pool, &lead(60).validated().unwrap()).await.unwrap();

        let history = score_history(&pool, "5531999887766").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].previous_score, 45);
        assert_eq!(history[0].new_score, 60);
        assert_eq!(history[1].reason, "Lead created");
    }

    #[tokio::test]
    async fn test_missing_lead() {
        let pool = memory_pool().await.unwrap();
        assert!(get_by_whatsapp(&pool, "000").await.unwrap().is_none());
    }
}

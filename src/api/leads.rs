use crate::{
    db::{
        leads,
        schema::{Lead, LeadAction, NewLead, RegisterOutcome, ScoreHistory},
    },
    errors::{AppError, Result},
};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Deserialize)]
pub struct ScoreQuery {
    pub whatsapp: Option<String>,
    #[serde(alias = "nome")]
    pub name: Option<String>,
    pub score: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LeadDetail {
    pub success: bool,
    pub lead: Lead,
    pub history: Vec<ScoreHistory>,
}

/// POST /api/leads/registrar - Create or update a lead
#[tracing::instrument(skip(pool, payload))]
pub async fn register(
    State(pool): State<SqlitePool>,
    payload: std::result::Result<Json<NewLead>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterOutcome>)> {
    let Json(new_lead) = payload.map_err(|e| AppError::ValidationError(e.body_text()))?;
    let new_lead = new_lead.validated()?;

    let outcome = leads::register(&pool, &new_lead).await?;
    let status = match outcome.action {
        LeadAction::Created => StatusCode::CREATED,
        LeadAction::Updated => StatusCode::OK,
    };

    Ok((status, Json(outcome)))
}

/// GET /api/leads/score - Update only the score, keeping the lead's other fields
#[tracing::instrument(skip(pool))]
pub async fn update_score(
    State(pool): State<SqlitePool>,
    Query(query): Query<ScoreQuery>,
) -> Result<Json<RegisterOutcome>> {
    let (Some(whatsapp), Some(name), Some(score)) = (query.whatsapp, query.name, query.score)
    else {
        return Err(AppError::ValidationError(
            "Required parameters: whatsapp, name, score".to_string(),
        ));
    };

    let score = score
        .trim()
        .parse::<i64>()
        .map_err(|_| AppError::ValidationError(format!("Invalid score: {}", score)))?;

    let whatsapp = leads::normalize_whatsapp(&whatsapp);
    let existing = leads::get_by_whatsapp(&pool, &whatsapp).await?;

    let new_lead = NewLead {
        whatsapp,
        name,
        property_id: existing.as_ref().and_then(|lead| lead.property_id),
        score,
        scheduled_visit: existing.map(|lead| lead.scheduled_visit).unwrap_or(false),
    }
    .validated()?;

    let outcome = leads::register(&pool, &new_lead).await?;
    Ok(Json(outcome))
}

/// GET /api/leads/:whatsapp - Lead with its score history
#[tracing::instrument(skip(pool))]
pub async fn get_lead(
    State(pool): State<SqlitePool>,
    Path(whatsapp): Path<String>,
) -> Result<Json<LeadDetail>> {
    let whatsapp = leads::normalize_whatsapp(&whatsapp);
    let lead = leads::get_by_whatsapp(&pool, &whatsapp)
        .await?
        .ok_or_else(|| AppError::LeadNotFound(whatsapp.clone()))?;
    let history = leads::score_history(&pool, &whatsapp).await?;

    Ok(Json(LeadDetail {
        success: true,
        lead,
        history,
    }))
}

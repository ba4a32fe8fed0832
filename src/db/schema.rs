// Database schema types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Lead {
    pub id: i64,
    pub whatsapp: String,
    pub name: String,
    pub property_id: Option<i64>,
    pub score: i64,
    pub scheduled_visit: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScoreHistory {
    pub id: i64,
    pub whatsapp: String,
    pub previous_score: i64,
    pub new_score: i64,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Lead fields as submitted by the automation workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLead {
    pub whatsapp: String,
    #[serde(alias = "nome")]
    pub name: String,
    #[serde(default, alias = "imovel_id")]
    pub property_id: Option<i64>,
    pub score: i64,
    #[serde(default, alias = "agendou_visita")]
    pub scheduled_visit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterOutcome {
    pub success: bool,
    pub lead_id: i64,
    pub action: LeadAction,
    pub score: i64,
}

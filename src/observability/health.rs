use chrono::Local;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub success: bool,
    pub status: String,
    pub version: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<ComponentStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub status: String,
    pub message: Option<String>,
}

pub struct HealthChecker {
    db_pool: SqlitePool,
}

impl HealthChecker {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    /// Liveness check - is the service running?
    pub fn liveness(&self) -> HealthStatus {
        HealthStatus {
            success: true,
            status: "online".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Local::now().to_rfc3339(),
            database: None,
        }
    }

    /// Readiness check - can the service reach its lead store?
    pub async fn readiness(&self) -> HealthStatus {
        let database = match crate::db::health_check(&self.db_pool).await {
            Ok(()) => ComponentStatus {
                status: "ok".to_string(),
                message: None,
            },
            Err(e) => ComponentStatus {
                status: "error".to_string(),
                message: Some(format!("Database check failed: {}", e)),
            },
        };

        let ready = database.status == "ok";
        HealthStatus {
            success: ready,
            status: if ready { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Local::now().to_rfc3339(),
            database: Some(database),
        }
    }
}

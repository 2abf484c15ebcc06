use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("SURREALDB_URL")
                .unwrap_or_else(|_| "memory".to_string()),
            namespace: env::var("SURREALDB_NAMESPACE")
                .unwrap_or_else(|_| "drip".to_string()),
            database: env::var("SURREALDB_DATABASE")
                .unwrap_or_else(|_| "campaigns".to_string()),
            username: env::var("SURREALDB_USERNAME").ok(),
            password: env::var("SURREALDB_PASSWORD").ok(),
        }
    }
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    let db = surrealdb::engine::any::connect(config.url).await?;

    // Sign in if credentials are provided
    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}

pub async fn ensure_schema(db: &Db) -> Result<()> {
    // Enrollment, campaign and lead documents stay schemaless: campaigns and
    // leads are written by other services, and old enrollments still carry
    // legacy flag names until `normalize-legacy` has run.
    let schema_queries = vec![
        "DEFINE TABLE IF NOT EXISTS enrollment SCHEMALESS;
         DEFINE FIELD IF NOT EXISTS tenant ON TABLE enrollment TYPE string;
         DEFINE FIELD IF NOT EXISTS lead_id ON TABLE enrollment TYPE string;
         DEFINE FIELD IF NOT EXISTS campaign_id ON TABLE enrollment TYPE string;
         DEFINE FIELD IF NOT EXISTS cursor_step ON TABLE enrollment TYPE int DEFAULT 0;",

        "DEFINE TABLE IF NOT EXISTS campaign SCHEMALESS;",

        "DEFINE TABLE IF NOT EXISTS lead SCHEMALESS;",

        "DEFINE TABLE IF NOT EXISTS send_lock SCHEMALESS;
         DEFINE FIELD IF NOT EXISTS expires_at ON TABLE send_lock TYPE datetime;",

        "DEFINE INDEX IF NOT EXISTS enrollment_due ON TABLE enrollment COLUMNS status, next_send_at;
         DEFINE INDEX IF NOT EXISTS enrollment_identity ON TABLE enrollment COLUMNS tenant, lead_id, campaign_id UNIQUE;
         DEFINE INDEX IF NOT EXISTS campaign_tenant ON TABLE campaign COLUMNS tenant;
         DEFINE INDEX IF NOT EXISTS lead_tenant ON TABLE lead COLUMNS tenant;",
    ];

    for query in schema_queries {
        db.query(query).await?;
    }

    Ok(())
}

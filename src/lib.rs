// Core modules
pub mod config;
pub mod db;
pub mod types;

// Campaign model and scheduling
pub mod campaign;
pub mod render;
pub mod schedule;

// Delivery and coordination
pub mod engine;
pub mod gateway;
pub mod lock;
pub mod seed;

pub mod api;

// Re-export key types and functions
pub use config::{EngineConfig, GatewayConfig, load_engine_config};
pub use db::{DatabaseConfig, EnrollmentStore, create_connection, ensure_schema};
pub use engine::{Engine, TickOptions, TickReport};
pub use gateway::{DeliveryGateway, HttpDeliveryGateway};
pub use lock::{LockService, SurrealLockService};
pub use seed::{SeedReport, SeedRequest, seed_enrollments};

use anyhow::Result;
use std::sync::Arc;
use tracing::warn;

/// Build an engine against `db_config`, wiring the HTTP gateway when one is
/// configured.
pub async fn create_engine(db_config: DatabaseConfig, config: EngineConfig) -> Result<Engine> {
    let db = create_connection(db_config).await?;
    ensure_schema(&db).await?;

    let locks = Arc::new(SurrealLockService::new(db.clone()));
    let gateway = match config.gateway.url {
        Some(_) => Some(HttpDeliveryGateway::new(&config.gateway)?),
        None => {
            warn!("No delivery gateway configured; only dry runs will succeed");
            None
        }
    };

    let engine = Engine::new(db, locks, config)?;
    Ok(match gateway {
        Some(gateway) => engine.with_gateway(Arc::new(gateway)),
        None => engine,
    })
}

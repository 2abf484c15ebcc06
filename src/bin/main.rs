use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;
use drip_engine::{
    DatabaseConfig, EngineConfig, SeedRequest, TickOptions, create_engine, load_engine_config,
};
use drip_engine::types::{CampaignId, LeadId, TenantId};

#[derive(Parser)]
#[command(name = "drip-engine")]
#[command(about = "Drip campaign scheduling and delivery engine")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Commands,
}

/// Settings that override the config file.
#[derive(Args)]
struct Overrides {
    #[arg(long, global = true, env = "SURREALDB_URL", default_value = "memory")]
    db_url: String,
    #[arg(long, global = true, env = "DRIP_CRON_SECRET")]
    cron_secret: Option<String>,
    #[arg(long, global = true, env = "DRIP_GATEWAY_URL")]
    gateway_url: Option<String>,
    #[arg(long, global = true, env = "DRIP_GATEWAY_TOKEN")]
    gateway_token: Option<String>,
}

impl Overrides {
    fn database(&self) -> DatabaseConfig {
        DatabaseConfig {
            url: self.db_url.clone(),
            ..Default::default()
        }
    }

    fn engine(&self) -> Result<EngineConfig> {
        let mut config = load_engine_config()?;
        if let Some(secret) = &self.cron_secret {
            config.cron_secret = Some(secret.clone());
        }
        if let Some(url) = &self.gateway_url {
            config.gateway.url = Some(url.clone());
        }
        if let Some(token) = &self.gateway_token {
            config.gateway.token = Some(token.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the trigger and enrollment endpoints
    Server {
        /// Bind address, e.g. 0.0.0.0:8080
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },
    /// Run a single tick and print its report
    Tick {
        /// Run even outside the send window
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Preview without claiming, sending or writing
        #[arg(long, default_value_t = false)]
        dry: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Initialize the database
    Init,
    /// Enroll leads into a campaign
    Seed {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        campaign: String,
        /// Comma-separated lead ids; omit to enroll every lead of the tenant
        #[arg(long)]
        leads: Option<String>,
        #[arg(long)]
        folder: Option<String>,
        #[arg(long)]
        source: Option<String>,
    },
    /// Rewrite legacy enable/disable aliases into canonical flags
    NormalizeLegacy,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("drip_engine=info".parse()?)
                .add_directive("surrealdb=warn".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    let overrides = cli.overrides;

    match cli.command {
        Commands::Server { bind } => {
            let db_config = overrides.database();
            info!("Using database url for server: {}", db_config.url);

            let engine = create_engine(db_config, overrides.engine()?).await?;
            let app = drip_engine::api::create_router(Arc::new(engine));

            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!("Drip engine listening on http://{}", bind);
            axum::serve(listener, app).await?;
        }
        Commands::Tick { force, dry, limit } => {
            let engine = create_engine(overrides.database(), overrides.engine()?).await?;
            let report = engine
                .run_tick(TickOptions { force, dry, limit }, chrono::Utc::now())
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Init => {
            let db_config = overrides.database();
            info!("Using database url for initialization: {}", db_config.url);

            info!("Initializing database...");
            let db = drip_engine::create_connection(db_config).await?;
            drip_engine::ensure_schema(&db).await?;
            info!("Database initialized successfully");
        }
        Commands::Seed {
            tenant,
            campaign,
            leads,
            folder,
            source,
        } => {
            let engine = create_engine(overrides.database(), overrides.engine()?).await?;

            let lead_ids = leads
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(LeadId::new)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            let request = SeedRequest {
                tenant: TenantId::new(tenant),
                campaign_id: CampaignId::new(campaign),
                lead_ids,
                folder,
                source,
            };

            let report = drip_engine::seed_enrollments(
                engine.store(),
                engine.config(),
                &request,
                chrono::Utc::now(),
            )
            .await?;

            println!("Seeded campaign {}", request.campaign_id);
            println!("  Requested:        {}", report.requested);
            println!("  Created:          {}", report.created);
            println!("  Already enrolled: {}", report.already_enrolled);
            if !report.missing_leads.is_empty() {
                let missing: Vec<&str> = report.missing_leads.iter().map(|l| l.as_str()).collect();
                println!("  Missing leads:    {}", missing.join(", "));
            }
        }
        Commands::NormalizeLegacy => {
            let db = drip_engine::create_connection(overrides.database()).await?;
            drip_engine::ensure_schema(&db).await?;

            let store = drip_engine::EnrollmentStore::new(db);
            let rewritten = store.normalize_legacy(chrono::Utc::now()).await?;
            println!("Normalized {} enrollment(s)", rewritten);
        }
    }

    Ok(())
}

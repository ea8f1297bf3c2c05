//! Gateway Binary
//!
//! Boots the governance gateway: configuration, tracing, provider adapters,
//! background tasks, and the HTTP server. All dependencies are constructed
//! here once and passed down by handle.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use llm_governance_gateway::api::{build_router, AppState};
use llm_governance_gateway::auth::{
    AiQuotaTracker, AuthGate, SsoSigner, StaticTokenVerifier, VerifiedToken,
};
use llm_governance_gateway::budget::{BudgetEngine, LoggingAlertSink, StoreAlertSink};
use llm_governance_gateway::config::{default_plan_catalog, GatewayConfig};
use llm_governance_gateway::identity::UserDirectory;
use llm_governance_gateway::jobs::{JobRunner, JobScheduler};
use llm_governance_gateway::limiter::RateLimiter;
use llm_governance_gateway::pricing::PricingTable;
use llm_governance_gateway::providers::{
    anthropic::AnthropicConfig, google::GoogleConfig, openai::OpenAiConfig, AnthropicProvider,
    GoogleProvider, OpenAiProvider, ProviderSet,
};
use llm_governance_gateway::resilience::{CircuitBreakerRegistry, FallbackChain};
use llm_governance_gateway::router::LlmRouter;
use llm_governance_gateway::routing::default_tables;
use llm_governance_gateway::sharing::SharingService;
use llm_governance_gateway::store::MemoryStore;
use llm_governance_gateway::tracking::CostTracker;

#[derive(Parser)]
#[command(name = "gateway")]
#[command(about = "AI request governance gateway", long_about = None)]
struct Cli {
    /// Bind address, e.g. 0.0.0.0:8080
    #[arg(long, env = "GATEWAY_BIND_ADDR")]
    bind: Option<String>,

    /// Disable the scheduled jobs (reset, rollup, report, sweep)
    #[arg(long)]
    no_jobs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = GatewayConfig::from_env()?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    let config = Arc::new(config);

    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let directory = Arc::new(UserDirectory::new(store.clone(), default_plan_catalog()));

    // Local token table; production deployments replace this verifier with
    // the identity provider's.
    let verifier = Arc::new(StaticTokenVerifier::new());
    if let Ok(token) = std::env::var("GATEWAY_DEV_TOKEN") {
        verifier.insert(
            &token,
            VerifiedToken {
                uid: "dev-user".to_string(),
                email: "dev@localhost".to_string(),
                provider: "static".to_string(),
                email_verified: true,
            },
        );
        info!("registered GATEWAY_DEV_TOKEN for uid dev-user");
    }
    let gate = Arc::new(AuthGate::new(
        verifier,
        directory.clone(),
        Duration::from_secs(config.entitlement_cache_ttl_secs),
    ));

    let pricing = Arc::new(PricingTable::default());
    let providers = ProviderSet::new()
        .with(Arc::new(
            AnthropicProvider::new(AnthropicConfig::from_env()?, pricing.clone())
                .context("anthropic adapter")?,
        ))
        .with(Arc::new(
            OpenAiProvider::new(OpenAiConfig::from_env()?, pricing.clone())
                .context("openai adapter")?,
        ))
        .with(Arc::new(
            GoogleProvider::new(GoogleConfig::from_env()?, pricing.clone())
                .context("google adapter")?,
        ));

    let engine = Arc::new(BudgetEngine::new(
        store.clone(),
        config.tiers.clone(),
        directory.clone(),
        vec![
            Arc::new(LoggingAlertSink) as Arc<dyn llm_governance_gateway::budget::AlertSink>,
            Arc::new(StoreAlertSink::new(store.clone())),
        ],
    ));
    let tracker = Arc::new(CostTracker::new(store.clone()));

    let breakers = Arc::new(CircuitBreakerRegistry::new(&config.resilience));
    let chain = FallbackChain::new(config.resilience, breakers);
    let (table, degraded) = default_tables();
    let router = Arc::new(LlmRouter::new(
        Arc::new(table),
        Arc::new(degraded),
        pricing,
        providers,
        chain,
        engine.clone(),
        tracker.clone(),
        config.tiers.clone(),
        config.global_preference,
    ));

    let limiter = Arc::new(RateLimiter::new(config.tiers.clone()));
    let janitor = limiter.start_janitor(Duration::from_secs(config.janitor_interval_secs));

    let scheduler = if cli.no_jobs {
        None
    } else {
        Some(JobScheduler::start(Arc::new(JobRunner::new(
            store.clone(),
            engine.clone(),
            tracker.clone(),
        ))))
    };

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        gate,
        limiter,
        quota: Arc::new(AiQuotaTracker::new(store.clone())),
        router,
        engine,
        tracker,
        directory,
        sharing: Arc::new(SharingService::new(
            store.clone(),
            config.invitation_ttl_days,
        )),
        sso: Arc::new(SsoSigner::new(config.sso.clone())),
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down background tasks");
    janitor.stop().await;
    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

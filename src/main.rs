//! Armitage server binary.
//!
//! Explicit startup wiring: the composition root constructs every
//! component from configuration and hands them to the HTTP surface. No
//! module-load side effects, no hidden connections.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::RngCore;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use armitage::config::{AppEnv, Settings};
use armitage::db;
use armitage::http::{self, AppState, ComplianceReport, DeviceFlowBroker};
use armitage::identity::{
    decode_verifying_key, IdentityResolver, KeySet, Role, SqlDirectory, TokenSigner, TokenVerifier,
};
use armitage::inference::{BreakerConfig, InferenceProxy, OpenAiBackend, Pricing};
use armitage::ledger::{BudgetLedger, InMemoryCounter, LedgerConfig, SpendCounter};
use armitage::pipeline::{CostEstimator, GovernancePipeline};
use armitage::redaction::{PatternDetector, RedactionEngine};
use armitage::telemetry::{spawn_workers, SqliteAuditStore, TelemetryQueue, WorkerConfig};
use armitage::vault::{SqliteSecretStore, VaultCrypto, VaultReader};
use armitage::workbench::{DraftService, LockManager};

#[derive(Parser)]
#[command(name = "armitage", about = "Governance enforcement gateway for LLM access")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway server.
    Serve,
    /// Load and validate configuration, then exit.
    CheckConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::CheckConfig => {
            armitage::logging::init_cli();
            let settings = Settings::from_env().context("configuration invalid")?;
            println!(
                "configuration ok: env={} bind={}:{}",
                settings.env.as_str(),
                settings.host,
                settings.port
            );
            Ok(())
        }
        Command::Serve => {
            let settings = Settings::from_env().context("configuration invalid")?;
            let _logging_guard = armitage::logging::init_server(&settings.log_dir)?;
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(serve(settings))
        }
    }
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    info!(env = settings.env.as_str(), "armitage starting");

    let pool = db::connect(&settings.database_url)
        .await
        .context("failed to open database")?;
    db::init_schema(&pool).await.context("failed to bootstrap schema")?;

    // Telemetry first: the ledger reports markers into it.
    let (telemetry, telemetry_rx) = TelemetryQueue::bounded(settings.telemetry.queue_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handles = spawn_workers(
        Arc::new(SqliteAuditStore::new(pool.clone())),
        telemetry_rx,
        WorkerConfig {
            workers: settings.telemetry.workers,
            max_attempts: settings.telemetry.max_attempts,
            base_backoff: settings.telemetry.base_backoff,
            shutdown_grace: settings.telemetry.shutdown_grace,
        },
        shutdown_rx,
    );

    // Budget ledger over the counter collaborator.
    let counter: Arc<dyn SpendCounter> = Arc::new(InMemoryCounter::new());
    let ledger = Arc::new(BudgetLedger::with_observer(
        counter,
        LedgerConfig {
            daily_limit_micros: settings.budget.daily_limit_micros,
            reserve_grace: settings.budget.reserve_grace,
            commit_slack_micros: settings.budget.commit_slack_micros,
        },
        Arc::clone(&telemetry) as Arc<dyn armitage::ledger::LedgerObserver>,
    ));

    // Vault: master key is mandatory in production, ephemeral in development.
    let master_key = match settings.master_key() {
        Ok(key) => key,
        Err(err) if settings.env == AppEnv::Development => {
            warn!(error = %err, "no master key configured; using an ephemeral development key");
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            key
        }
        Err(err) => return Err(err),
    };
    let vault = Arc::new(VaultReader::new(
        Arc::new(SqliteSecretStore::new(pool.clone())),
        VaultCrypto::new(&master_key),
    ));

    // Identity: published keys plus, in development, a local device-flow signer.
    let directory = Arc::new(SqlDirectory::new(pool.clone()));
    let (verifier, device_flow) =
        build_identity(&settings, directory.as_ref()).await?;
    let identity = Arc::new(
        IdentityResolver::new(verifier, directory).with_login_recording(pool.clone()),
    );

    // Redaction and inference.
    let redaction = Arc::new(RedactionEngine::new(Arc::new(PatternDetector::new())));
    let proxy = Arc::new(
        InferenceProxy::new(
            Arc::new(OpenAiBackend::new(settings.inference.base_url.clone())),
            BreakerConfig::default(),
            Pricing::flat(settings.budget.micros_per_1k_tokens),
            settings.inference.deadline,
        )
        .with_default_seed(settings.inference.default_seed),
    );

    let pipeline = Arc::new(GovernancePipeline::new(
        ledger,
        Arc::clone(&vault),
        Arc::clone(&redaction),
        proxy,
        Arc::clone(&telemetry),
        CostEstimator {
            floor_micros: settings.budget.floor_estimate_micros,
            micros_per_1k_tokens: settings.budget.micros_per_1k_tokens,
        },
    ));

    let locks = Arc::new(LockManager::new(pool.clone(), settings.lock_ttl));
    let drafts = Arc::new(DraftService::new(pool.clone(), locks));

    let compliance = Arc::new(ComplianceReport::new(redaction.entity_catalogue()));

    let state = AppState {
        env_label: settings.env.as_str().to_owned(),
        identity,
        pipeline,
        drafts,
        vault,
        device_flow,
        compliance,
    };

    let result = http::serve(&settings.host, settings.port, state).await;

    // Drain the telemetry queue within the grace budget, then stop.
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = handle.await;
    }
    info!("armitage stopped");
    result
}

/// Build the token verifier and, in development, the device-flow broker.
async fn build_identity(
    settings: &Settings,
    directory: &SqlDirectory,
) -> anyhow::Result<(TokenVerifier, Option<Arc<DeviceFlowBroker>>)> {
    let issuer = settings.idp.issuer.clone();
    let audience = settings.idp.audience.clone();

    if let Some(url) = &settings.idp.key_url {
        let keys = Arc::new(KeySet::from_url(url.clone()));
        return Ok((TokenVerifier::new(keys, issuer, audience), None));
    }

    let mut static_keys: Vec<(String, ed25519_dalek::VerifyingKey)> = Vec::new();
    if let Some(hex_key) = &settings.idp.public_key_hex {
        static_keys.push((
            "static".to_owned(),
            decode_verifying_key(hex_key).context("IDP_PUBLIC_KEY_HEX invalid")?,
        ));
    }

    if settings.env != AppEnv::Development {
        let keys = Arc::new(KeySet::from_static(static_keys));
        return Ok((TokenVerifier::new(keys, issuer, audience), None));
    }

    // Development: a local signer backs the mocked SSO device flow, and a
    // seeded sandbox grant makes the first token usable immediately.
    let dev_group = Uuid::new_v4();
    let signer = TokenSigner::ephemeral(issuer.clone(), audience.clone())
        .with_groups(vec![dev_group]);
    directory
        .put_mapping(dev_group, Role::Developer, &["sandbox"])
        .await
        .context("failed to seed development group mapping")?;
    info!(project = "sandbox", "development sandbox grant seeded");

    static_keys.push((
        "local".to_owned(),
        decode_verifying_key(&signer.public_key_hex()).context("local signer key invalid")?,
    ));
    let keys = Arc::new(KeySet::from_static(static_keys));
    let verifier = TokenVerifier::new(keys, issuer, audience);

    let broker = DeviceFlowBroker::new(signer, "https://sso.invalid/device").with_auto_approve(
        armitage::http::ApprovedSubject {
            sub: Uuid::new_v4(),
            email: "dev@localhost".to_owned(),
            name: Some("Development User".to_owned()),
        },
    );
    Ok((verifier, Some(Arc::new(broker))))
}

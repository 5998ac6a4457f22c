//! 🧭 Rehearsal CLI
//!
//! Externally triggered batch entry points: one scoring cycle (or a loop of them),
//! decision-pack generation, and shadow-exit evaluation. Generation and exit evaluation
//! support a side-effect-free dry run.

use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;

use regime_rehearsal::clock::{Clock, SystemClock};
use regime_rehearsal::config::ScoringBackendKind;
use regime_rehearsal::cycle::ScoringCycle;
use regime_rehearsal::decision_engine::{
    BanditRegistry, CachedCalibration, PackGenerator, PositionSizer,
};
use regime_rehearsal::providers::{StorePriceSeries, StoreRegimeState};
use regime_rehearsal::regime::RegimeClassifier;
use regime_rehearsal::scoring::{BudgetedScorer, CallBudget, ScoringBackend};
use regime_rehearsal::shadow::ShadowExecutionEngine;
use regime_rehearsal::signing::RecordSigner;
use regime_rehearsal::store::SqliteStore;
use regime_rehearsal::validation::ValidationFramework;
use regime_rehearsal::Config;

#[derive(Parser)]
#[command(name = "rehearsal")]
#[command(about = "Regime-aware decision packs and shadow rehearsal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify, validate and score every tracked symbol
    RunCycle {
        /// Repeat on CYCLE_INTERVAL_SECS until Ctrl-C
        #[arg(long = "loop")]
        continuous: bool,
    },

    /// Turn recent signal candidates into signed decision packs
    GeneratePacks {
        /// Evaluate every candidate but write nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Open shadow trades for new packs and run the exit state machine
    EvaluateExits {
        /// Evaluate every trade but write nothing
        #[arg(long)]
        dry_run: bool,
    },
}

/// Shared components every subcommand needs
struct Runtime {
    config: Config,
    store: Arc<SqliteStore>,
    signer: RecordSigner,
    clock: Arc<dyn Clock>,
    bandits: Arc<BanditRegistry>,
}

impl Runtime {
    fn init(config: Config) -> Result<Self> {
        info!("🔌 Opening SQLite store...");
        let store = Arc::new(
            SqliteStore::open(&config.database.sqlite_path, config.database.wal_mode)
                .context("Failed to open SQLite store")?,
        );
        info!("✅ SQLite: Connected ({})", config.database.sqlite_path.display());

        let signer = RecordSigner::new(config.signing.signer_id.clone(), config.signing.key.as_bytes())
            .context("Failed to build record signer")?;

        let bandits = Arc::new(BanditRegistry::new(config.reward_mode()?, config.bandit.seed));
        let states = store.load_bandit_states().context("Failed to load bandit states")?;
        bandits.load(states).context("Failed to restore bandit posteriors")?;

        Ok(Self {
            config,
            store,
            signer,
            clock: Arc::new(SystemClock),
            bandits,
        })
    }

    async fn run_cycle(&self, continuous: bool) -> Result<()> {
        let config = &self.config;
        let tracker = ScoringCycle::restore_tracker(&self.store, self.signer.clone())
            .context("Failed to restore persistence tracker")?;

        let backend = match config.scoring.backend {
            ScoringBackendKind::Mock => ScoringBackend::Mock,
            ScoringBackendKind::Http => ScoringBackend::http(
                config.scoring.endpoint.clone(),
                config.scoring.api_key.clone(),
                config.scoring_timeout(),
            )
            .context("Failed to build HTTP scoring client")?,
        };
        info!("✅ Scoring backend: {}", backend.name());
        let scorer = BudgetedScorer::new(backend, CallBudget::new(config.budget_config(), self.clock.clone()));

        let cycle = ScoringCycle::new(
            self.store.clone(),
            RegimeClassifier::new(config.classifier_config()),
            Arc::new(tracker),
            ValidationFramework::new(config.validation_config(), self.signer.clone()),
            scorer,
            self.clock.clone(),
            config.cycle_config(),
        );

        if continuous {
            cycle.run_loop().await;
        } else {
            cycle.run_once().await;
        }
        Ok(())
    }

    fn generate_packs(&self, dry_run: bool) -> Result<()> {
        let config = &self.config;
        let calibration = Arc::new(CachedCalibration::new(
            self.store.clone(),
            self.clock.clone(),
            Duration::seconds(config.pack.calibration_max_age_secs),
        ));
        // An empty table makes every candidate skip with NO_CALIBRATION
        if let Err(e) = calibration.refresh_if_stale() {
            warn!("⚠️ Calibration refresh failed: {}", e);
        }

        let generator = PackGenerator::new(
            self.store.clone(),
            Arc::new(StorePriceSeries::new(self.store.clone())),
            Arc::new(StoreRegimeState::new(self.store.clone(), config.regime.interval.clone())),
            calibration,
            PositionSizer::new(config.sizer_config()),
            self.bandits.clone(),
            self.signer.clone(),
            self.clock.clone(),
            config.pack_generator_config(dry_run),
        );

        let since = self.clock.now() - Duration::hours(config.pack.candidate_lookback_hours);
        let candidates = self
            .store
            .signal_candidates_since(since)
            .context("Failed to load signal candidates")?;
        info!("📦 {} candidates since {}", candidates.len(), since);

        let report = generator.generate(&candidates);
        info!(
            "📦 Pack generation{}: {} created, {} duplicates, {} skipped, {} failed",
            if dry_run { " (dry run)" } else { "" },
            report.created(),
            report.duplicates(),
            report.skipped(),
            report.failed()
        );
        Ok(())
    }

    fn evaluate_exits(&self, dry_run: bool) -> Result<()> {
        let config = &self.config;
        let engine = ShadowExecutionEngine::new(
            self.store.clone(),
            Arc::new(StorePriceSeries::new(self.store.clone())),
            Arc::new(StoreRegimeState::new(self.store.clone(), config.regime.interval.clone())),
            self.bandits.clone(),
            self.signer.clone(),
            self.clock.clone(),
            config.shadow_config(dry_run),
        );

        let opened = engine.open_pending().context("Failed to open pending shadow trades")?;
        info!(
            "👻 Shadow open{}: {} opened, {} rejected, {} already open, {} failed",
            if dry_run { " (dry run)" } else { "" },
            opened.opened.len(),
            opened.rejected.len(),
            opened.already_open,
            opened.failed.len()
        );

        let exits = engine.run_exit_pass().context("Failed to run exit pass")?;
        info!(
            "👻 Exit pass{}: {} closed, {} holding, {} data gaps, {} bad bar series, {} lost races, {} failed",
            if dry_run { " (dry run)" } else { "" },
            exits.closed.len(),
            exits.holding,
            exits.data_gaps.len(),
            exits.bad_bars.len(),
            exits.lost_races,
            exits.failed.len()
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.logging.log_level.as_str()))
        .init();
    config.validate().context("Invalid configuration")?;
    info!("✅ Configuration: Loaded");

    let runtime = Runtime::init(config)?;

    match cli.command {
        Commands::RunCycle { continuous } => runtime.run_cycle(continuous).await,
        Commands::GeneratePacks { dry_run } => runtime.generate_packs(dry_run),
        Commands::EvaluateExits { dry_run } => runtime.evaluate_exits(dry_run),
    }
}

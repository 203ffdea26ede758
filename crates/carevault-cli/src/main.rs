//! carevault: workspace encryption CLI
//!
//! Commands:
//!   status                 - session, lock state, and unencrypted record counts
//!   init                   - set the workspace passphrase (owner only)
//!   migrate                - encrypt legacy plaintext records
//!   reset --yes            - delete all workspace records and crypto metadata (owner only)
//!   patients list|add      - read and write patients through the record codec
//!   config show            - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use carevault_core::config::CarevaultConfig;
use carevault_core::types::{MigrationPhase, PatientInput, Role};
use carevault_workspace::{open_workspace, LocalBackend, LockState, ProgressFn, Workspace};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "carevault",
    version,
    about = "CareVault workspace encryption client",
    long_about = "carevault: set up, unlock, migrate, and reset client-side encryption for a shared patient workspace"
)]
struct Cli {
    /// Path to carevault.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "CAREVAULT_CONFIG",
        default_value = "~/.config/carevault/config.toml"
    )]
    config: PathBuf,

    /// Workspace store file (overrides [storage].data_file)
    #[arg(long, env = "CAREVAULT_DATA_FILE")]
    data_file: Option<PathBuf>,

    /// Signed-in user (overrides [session].user_id)
    #[arg(long, env = "CAREVAULT_USER")]
    user: Option<String>,

    /// Active workspace (overrides [session].workspace_id)
    #[arg(long, env = "CAREVAULT_WORKSPACE")]
    workspace: Option<String>,

    /// Role in the active workspace (overrides [session].role)
    #[arg(long)]
    role: Option<RoleArg>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CAREVAULT_LOG")]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, env = "CAREVAULT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show session, lock state, and migration status
    Status {
        /// Print the lock snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Set the workspace passphrase for the first time (owner only)
    Init {
        #[arg(long, env = "CAREVAULT_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
    },

    /// Encrypt every legacy plaintext record in the workspace
    Migrate {
        #[arg(long, env = "CAREVAULT_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
    },

    /// Irreversibly delete all workspace records and crypto metadata (owner only)
    Reset {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Patient records
    Patients {
        #[command(subcommand)]
        action: PatientsAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum PatientsAction {
    /// List patients, most recently assessed first
    List {
        /// Case-insensitive match on alias or external id
        #[arg(long, short = 's')]
        search: Option<String>,

        #[arg(long, env = "CAREVAULT_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
    },

    /// Add a patient
    Add {
        #[arg(long)]
        alias: Option<String>,
        #[arg(long)]
        external_id: Option<String>,
        #[arg(long)]
        country: Option<String>,
        /// inpatient or outpatient
        #[arg(long)]
        inpatient_status: Option<String>,
        #[arg(long)]
        age_months: Option<f64>,
        /// 0 or 1
        #[arg(long)]
        sex: Option<f64>,
        #[arg(long)]
        weight: Option<f64>,
        /// kg or lbs
        #[arg(long)]
        weight_unit: Option<String>,

        #[arg(long, env = "CAREVAULT_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Owner,
    Member,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Owner => Role::Owner,
            RoleArg::Member => Role::Member,
        }
    }
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let mut config = load_config(&config_path)?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli.log_format.clone().unwrap_or_else(|| {
        if config.logging.format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    });
    init_logging(&level, &format);

    apply_overrides(&mut config, &cli);
    if config.crypto.enabled && config.crypto.is_weak_kdf() {
        tracing::warn!(
            iterations = config.crypto.kdf_iterations,
            "crypto.kdf_iterations is below the recommended minimum; new workspaces will be easier to brute-force"
        );
    }

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
        Commands::Status { json } => cmd_status(&open(&config)?, json).await,
        Commands::Init { passphrase } => cmd_init(&open(&config)?, passphrase).await,
        Commands::Migrate { passphrase } => cmd_migrate(&open(&config)?, passphrase).await,
        Commands::Reset { yes } => cmd_reset(&open(&config)?, yes).await,
        Commands::Patients {
            action: PatientsAction::List { search, passphrase },
        } => cmd_patients_list(&open(&config)?, search.as_deref(), passphrase).await,
        Commands::Patients {
            action:
                PatientsAction::Add {
                    alias,
                    external_id,
                    country,
                    inpatient_status,
                    age_months,
                    sex,
                    weight,
                    weight_unit,
                    passphrase,
                },
        } => {
            let input = PatientInput {
                alias,
                external_id,
                country,
                inpatient_status,
                age_months,
                sex,
                weight_value: weight,
                weight_unit,
            };
            cmd_patients_add(&open(&config)?, &input, passphrase).await
        }
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<CarevaultConfig> {
    CarevaultConfig::load(path).with_context(|| format!("loading config: {}", path.display()))
}

fn apply_overrides(config: &mut CarevaultConfig, cli: &Cli) {
    if let Some(path) = &cli.data_file {
        config.storage.data_file = path.clone();
    }
    if let Some(user) = &cli.user {
        config.session.user_id = Some(user.clone());
    }
    if let Some(ws) = &cli.workspace {
        config.session.workspace_id = Some(ws.clone());
    }
    if let Some(role) = cli.role {
        config.session.role = Some(role.into());
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

fn open(config: &CarevaultConfig) -> Result<Workspace> {
    let data_file = expand_tilde(&config.storage.data_file);
    let backend = LocalBackend::open(&data_file)?;
    info!(data_file = %data_file.display(), "opened workspace store");
    Ok(open_workspace(
        &config.crypto,
        config.session.to_session(),
        Arc::new(backend),
    ))
}

// ── Passphrase handling ───────────────────────────────────────────────────────

fn read_passphrase(provided: Option<String>, prompt: &str) -> Result<SecretString> {
    match provided {
        Some(p) => Ok(SecretString::from(p)),
        None => {
            let p = rpassword::prompt_password(prompt).context("reading passphrase")?;
            Ok(SecretString::from(p))
        }
    }
}

/// Bring the workspace to a state where records can be read and written,
/// asking for the passphrase only when it is actually needed.
async fn ensure_unlocked(ws: &Workspace, passphrase: Option<String>) -> Result<()> {
    let status = ws.crypto.refresh_lock_state().await?;
    if status.requires_setup {
        anyhow::bail!("workspace encryption is not set up yet; run `carevault init` first");
    }
    if ws.crypto.snapshot().state == LockState::Unlocked {
        return Ok(());
    }
    let passphrase = read_passphrase(passphrase, "Workspace passphrase: ")?;
    ws.crypto
        .unlock_workspace(&passphrase)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style =
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

// ── `carevault status` ────────────────────────────────────────────────────────

async fn cmd_status(ws: &Workspace, json: bool) -> Result<()> {
    let session = ws.crypto.session();
    let status = ws.crypto.refresh_lock_state().await?;
    let snapshot = ws.crypto.snapshot();

    if json {
        let rendered =
            serde_json::to_string_pretty(&snapshot).context("serializing lock snapshot")?;
        println!("{rendered}");
        return Ok(());
    }

    println!("carevault v{}", env!("CARGO_PKG_VERSION"));
    match (&session.user_id, &session.workspace_id) {
        (Some(user), Some(workspace)) => {
            let role = if session.is_owner() { "owner" } else { "member" };
            println!("  session:     {user} in {workspace} ({role})");
        }
        (Some(user), None) => println!("  session:     {user} (no active workspace)"),
        _ => println!("  session:     guest"),
    }

    if !ws.crypto.is_enabled() {
        println!("  encryption:  disabled (records stored in plaintext)");
        return Ok(());
    }

    println!("  encryption:  {}", snapshot.state);
    if let Some(meta) = &status.meta {
        println!(
            "  kdf:         {}-{} x {}",
            meta.kdf.algorithm, meta.kdf.hash, meta.kdf.iterations
        );
        println!(
            "  initialized: {} by {}",
            meta.initialized_at.to_rfc3339(),
            meta.initialized_by.as_deref().unwrap_or("unknown")
        );
    }
    if status.requires_setup {
        println!("  next step:   carevault init");
        return Ok(());
    }

    let counts = ws.crypto.count_unencrypted_records().await?;
    println!(
        "  plaintext:   {} patients, {} assessments",
        counts.patients, counts.assessments
    );
    let migrated = ws.crypto.has_migration_marker().await?;
    println!("  migrated:    {}", if migrated { "yes" } else { "no" });
    if counts.total() > 0 {
        println!("  next step:   carevault migrate");
    }
    Ok(())
}

// ── `carevault init` ──────────────────────────────────────────────────────────

async fn cmd_init(ws: &Workspace, passphrase: Option<String>) -> Result<()> {
    ws.crypto.refresh_lock_state().await?;

    let passphrase = match passphrase {
        Some(p) => SecretString::from(p),
        None => {
            use secrecy::ExposeSecret;
            let first = read_passphrase(None, "New workspace passphrase: ")?;
            let again = read_passphrase(None, "Repeat passphrase: ")?;
            if first.expose_secret() != again.expose_secret() {
                anyhow::bail!("passphrases do not match");
            }
            first
        }
    };

    ws.crypto
        .initialize_workspace_passphrase(&passphrase)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    println!("Workspace encryption initialized.");
    println!("Share the passphrase with workspace members out of band; it cannot be recovered.");

    let counts = ws.crypto.count_unencrypted_records().await?;
    if counts.total() > 0 {
        println!(
            "{} patients and {} assessments are still plaintext. Run `carevault migrate`.",
            counts.patients, counts.assessments
        );
    }
    Ok(())
}

// ── `carevault migrate` ───────────────────────────────────────────────────────

async fn cmd_migrate(ws: &Workspace, passphrase: Option<String>) -> Result<()> {
    ensure_unlocked(ws, passphrase).await?;

    let counts = ws.crypto.count_unencrypted_records().await?;
    let pb = make_progress_bar(counts.total() as u64, "migrate");
    let bar = pb.clone();
    let on_progress: ProgressFn = Box::new(move |p| {
        bar.set_length(p.total as u64);
        bar.set_position(p.done as u64);
        bar.set_message(match p.phase {
            MigrationPhase::Patients => "patients",
            MigrationPhase::Assessments => "assessments",
        });
    });

    // Ctrl-C locks the workspace; the migration stops before the next record.
    let crypto = ws.crypto.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            crypto.lock_workspace();
        }
    });

    let result = ws.crypto.migrate_plaintext_records(Some(&on_progress)).await;
    interrupt.abort();

    match result {
        Ok(report) => {
            pb.finish_with_message("done");
            println!(
                "Encrypted {} patients and {} assessments.",
                report.migrated_patients, report.migrated_assessments
            );
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("stopped");
            Err(anyhow::anyhow!(e.user_message()))
                .context("migration did not complete; run `carevault migrate` again to resume")
        }
    }
}

// ── `carevault reset` ─────────────────────────────────────────────────────────

async fn cmd_reset(ws: &Workspace, yes: bool) -> Result<()> {
    let workspace = ws
        .crypto
        .session()
        .workspace_id
        .unwrap_or_else(|| "(none)".into());
    if !yes {
        anyhow::bail!(
            "refusing to reset without --yes: this permanently deletes every patient, \
             assessment, and the encryption setup of workspace {workspace}"
        );
    }
    ws.crypto.reset_workspace_encrypted_data().await?;
    println!("Workspace {workspace} reset. Run `carevault init` to set a new passphrase.");
    Ok(())
}

// ── `carevault patients` ──────────────────────────────────────────────────────

async fn cmd_patients_list(
    ws: &Workspace,
    search: Option<&str>,
    passphrase: Option<String>,
) -> Result<()> {
    ensure_unlocked(ws, passphrase).await?;
    let patients = ws.records.list_patients(search).await?;

    if patients.is_empty() {
        println!("no patients");
        return Ok(());
    }
    println!("{:<36}  {:<24}  {:<12}  last assessment", "id", "alias", "external id");
    for p in &patients {
        println!(
            "{:<36}  {:<24}  {:<12}  {}",
            p.id,
            p.profile.alias,
            p.profile.external_id.as_deref().unwrap_or("-"),
            p.last_assessment_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into())
        );
    }
    Ok(())
}

async fn cmd_patients_add(
    ws: &Workspace,
    input: &PatientInput,
    passphrase: Option<String>,
) -> Result<()> {
    ensure_unlocked(ws, passphrase).await?;
    let patient = ws.records.create_patient(input).await?;
    println!("{}  {}", patient.id, patient.profile.alias);
    Ok(())
}

// ── `carevault config show` ───────────────────────────────────────────────────

fn cmd_config_show(config: &CarevaultConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

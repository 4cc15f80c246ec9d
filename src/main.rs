//! masterkey-migrate - Re-encrypt all user files under a single master key
//!
//! Usage:
//!   masterkey-migrate init      - Write a configuration file
//!   masterkey-migrate run       - Decrypt, reconfigure and re-encrypt everything
//!   masterkey-migrate decrypt   - Decrypt all files and switch to master-key mode
//!   masterkey-migrate encrypt   - Encrypt all files under the master key
//!   masterkey-migrate users     - List users per backend
//!   masterkey-migrate status    - Show the encryption configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use masterkey_migrate::{
    appconfig::{
        AppConfig, JsonAppConfig, ENCRYPTION_APP, INSTALLED_VERSION, LEGACY_ENCRYPTION_APP,
    },
    config::Config,
    crypto::LocalKeyManager,
    reencrypt::{Reencryptor, RunReport, RunState},
    storage::LocalStorage,
    users::{DirectoryUserBackend, StaticUserBackend, UserBackend, UserEnumerator},
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "masterkey-migrate")]
#[command(version = "0.1.0")]
#[command(about = "Re-encrypt all user files under a single master key")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/masterkey-migrate/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Storage root holding <uid>/files
        #[arg(long)]
        data_root: PathBuf,
    },

    /// Decrypt, reconfigure and re-encrypt every file
    Run {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Decrypt every file and switch to master-key mode
    Decrypt {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Encrypt every file under the master key
    Encrypt {
        #[command(flatten)]
        run: RunArgs,
    },

    /// List users per backend
    Users,

    /// Show the encryption configuration
    Status,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Walk and count without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Users processed in parallel
    #[arg(short, long)]
    workers: Option<usize>,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy)]
enum Phases {
    All,
    DecryptOnly,
    EncryptOnly,
}

fn main() {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config_path = expand_tilde(&cli.config);

    match run_command(cli.command, &config_path) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("masterkey_migrate=debug,warn")
        } else {
            EnvFilter::new("masterkey_migrate=info,warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run_command(command: Commands, config_path: &Path) -> Result<i32> {
    match command {
        Commands::Init { data_root } => cmd_init(config_path, data_root).map(|_| 0),
        Commands::Run { run } => cmd_migrate(config_path, &run, Phases::All),
        Commands::Decrypt { run } => cmd_migrate(config_path, &run, Phases::DecryptOnly),
        Commands::Encrypt { run } => cmd_migrate(config_path, &run, Phases::EncryptOnly),
        Commands::Users => cmd_users(config_path).map(|_| 0),
        Commands::Status => cmd_status(config_path).map(|_| 0),
    }
}

fn cmd_init(config_path: &Path, data_root: PathBuf) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("Configuration already exists at {:?}", config_path);
    }

    std::fs::create_dir_all(&data_root)
        .with_context(|| format!("Failed to create data root {:?}", data_root))?;

    let config = Config {
        app_config_path: data_root.join(masterkey_migrate::config::APP_CONFIG_FILE),
        data_root,
        ..Config::default()
    };
    config.validate()?;

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path)?;

    println!("Configuration written to {:?}", config_path);
    println!("Data root: {:?}", config.data_root);
    Ok(())
}

/// Everything a run needs, opened from the configuration
struct Components {
    config: Config,
    storage: Arc<LocalStorage>,
    app_config: Arc<JsonAppConfig>,
    users: UserEnumerator,
}

fn open(config_path: &Path) -> Result<Components> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", config_path))?;

    let app_config = Arc::new(
        JsonAppConfig::open(&config.app_config_path).context("Failed to open app configuration")?,
    );
    let storage = Arc::new(
        LocalStorage::new(&config.data_root, app_config.clone())
            .context("Failed to open storage")?,
    );

    let backend: Arc<dyn UserBackend> = match &config.users {
        Some(users) => Arc::new(StaticUserBackend::new("config", users.clone())),
        None => Arc::new(DirectoryUserBackend::new(storage.root())),
    };
    let users = UserEnumerator::new(vec![backend]).with_page_size(config.page_size);

    Ok(Components {
        config,
        storage,
        app_config,
        users,
    })
}

fn cmd_migrate(config_path: &Path, args: &RunArgs, phases: Phases) -> Result<i32> {
    let Components {
        mut config,
        storage,
        app_config,
        users,
    } = open(config_path)?;

    if args.dry_run {
        config.dry_run = true;
    }
    if let Some(workers) = args.workers {
        config.max_concurrent_users = workers;
    }
    config.validate()?;

    let key_manager = Arc::new(LocalKeyManager::new(storage.keys().clone(), app_config.clone()));
    let reencryptor = Reencryptor::new(storage, users, app_config, key_manager)
        .with_options(config.reencrypt_options());

    // Stop at the next file boundary on Ctrl-C
    let shutdown_flag = reencryptor.shutdown_flag();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, finishing current file...");
        shutdown_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let report = match phases {
        Phases::All => reencryptor.run(),
        Phases::DecryptOnly => reencryptor.decrypt_and_reconfigure(),
        Phases::EncryptOnly => reencryptor.reencrypt(),
    }
    .context("Re-encryption failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(if report.is_clean() { 0 } else { 2 })
}

fn print_report(report: &RunReport) {
    println!();
    println!("Run {}", report.id);
    println!("State: {:?}{}", report.state, if report.dry_run { " (dry run)" } else { "" });
    if let Some(total) = report.total_users {
        println!("Users: {}", total);
    }

    for phase in [&report.decrypt, &report.encrypt].into_iter().flatten() {
        println!(
            "{:?}: {} users, {} rewritten, {} skipped, {} shared, {} failed{}",
            phase.operation,
            phase.users,
            phase.rewritten,
            phase.skipped,
            phase.shared_skipped,
            phase.failed,
            if phase.cancelled { " (cancelled)" } else { "" }
        );
        for backend_error in &phase.backend_errors {
            println!("  backend error: {}", backend_error);
        }
    }

    if !report.failures.is_empty() {
        println!();
        println!("Failed files:");
        for (uid, paths) in report.failures.iter() {
            println!("  {}:", uid);
            for path in paths {
                println!("    {}", path.display());
            }
        }
    }

    if !report.orphans.is_empty() {
        println!();
        println!("Temporary files that could not be removed:");
        for path in report.orphans.paths() {
            println!("  {}", path.display());
        }
    }

    if report.state == RunState::Aborted {
        warn!("Run aborted; encryption configuration was not changed by the failing phase");
    } else {
        info!("Run finished");
    }
}

fn cmd_users(config_path: &Path) -> Result<()> {
    let Components { users, .. } = open(config_path)?;

    for backend in users.backends() {
        println!("Backend: {}", backend.name());
    }

    let mut count = 0;
    for user in users.users() {
        match user {
            Ok(user) => {
                println!("  {} ({})", user.uid, user.backend);
                count += 1;
            }
            Err(e) => warn!("{}", e),
        }
    }
    println!("{} users", count);
    Ok(())
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let Components {
        config,
        storage,
        app_config,
        users,
    } = open(config_path)?;

    println!("masterkey-migrate Status");
    println!("========================");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Data root: {:?}", config.data_root);
    println!("App configuration: {:?}", config.app_config_path);
    println!(
        "Encryption app: {}",
        if app_config.is_enabled(ENCRYPTION_APP) { "enabled" } else { "disabled" }
    );
    println!(
        "Master-key mode: {}",
        if app_config.master_key_enabled() { "on" } else { "off" }
    );
    println!(
        "Legacy installed version: {}",
        app_config
            .get_value(LEGACY_ENCRYPTION_APP, INSTALLED_VERSION)
            .unwrap_or_else(|| "-".to_string())
    );
    println!(
        "Master key: {}",
        if storage.keys().master_key_path().exists() { "present" } else { "missing" }
    );

    let mut per_backend: BTreeMap<String, usize> = users
        .backends()
        .iter()
        .map(|b| (b.name().to_string(), 0))
        .collect();
    for user in users.users() {
        match user {
            Ok(user) => *per_backend.entry(user.backend).or_default() += 1,
            Err(e) => warn!("{}", e),
        }
    }
    for (backend, count) in per_backend {
        println!("Users ({}): {}", backend, count);
    }

    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

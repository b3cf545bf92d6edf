use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;

use mail_relay::credentials::CredentialManager;
use mail_relay::{Config, Forwarder, ImapStore, Poller, SmtpSender, WorkerPool};

/// Polls an IMAP inbox and forwards every new message over SMTP
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to config file
    #[clap(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll forever (default)
    Run,

    /// Run a single poll cycle and exit
    Once,

    /// Write a default config file
    Init,

    /// Check the configuration without connecting
    CheckConfig,

    /// Store a password in the system keyring (read from the terminal)
    SetPassword {
        /// Which account the password belongs to
        #[clap(short, long, value_enum)]
        account: AccountKind,
    },

    /// Remove a stored password from the system keyring
    DeletePassword {
        #[clap(short, long, value_enum)]
        account: AccountKind,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AccountKind {
    Imap,
    Smtp,
}

impl AccountKind {
    fn keyring_entry(self, config: &Config) -> (&str, &'static str) {
        match self {
            AccountKind::Imap => (config.imap.username.as_str(), "imap"),
            AccountKind::Smtp => (config.smtp.username.as_str(), "smtp"),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .parse_env("MAIL_RELAY_LOG")
        .init();

    let config_path = match &args.config {
        Some(path) => shellexpand::tilde(path).into_owned(),
        None => Config::default_path().to_string_lossy().into_owned(),
    };

    match args.command.unwrap_or(Commands::Run) {
        Commands::Init => init(&config_path),
        Commands::CheckConfig => {
            let config = load_config(&config_path)?;
            println!("Configuration OK: {}", config.imap.store_url(&config.poller.folder));
            Ok(())
        }
        Commands::SetPassword { account } => {
            let config = load_config(&config_path)?;
            let (username, kind) = account.keyring_entry(&config);

            print!("Password for {} ({}): ", username, kind);
            io::stdout().flush()?;
            let password = rpassword::read_password().context("Failed to read password")?;
            if password.is_empty() {
                bail!("Empty password, nothing stored");
            }

            CredentialManager::new().store_password(username, kind, &password)?;
            println!("Password stored for {} ({})", username, kind);
            Ok(())
        }
        Commands::DeletePassword { account } => {
            let config = load_config(&config_path)?;
            let (username, kind) = account.keyring_entry(&config);
            CredentialManager::new().delete_password(username, kind)?;
            println!("Password removed for {} ({})", username, kind);
            Ok(())
        }
        Commands::Once => {
            let config = load_config(&config_path)?;
            let poller = build_poller(&config)?;
            let report = poller.poll_once();
            println!("{}", report);
            for error in &report.errors {
                println!("  error: {}", error);
            }
            Ok(())
        }
        Commands::Run => {
            let config = load_config(&config_path)?;
            let mut poller = build_poller(&config)?;
            poller.start().context("Failed to start poller")?;
            poller.join();
            Ok(())
        }
    }
}

fn init(config_path: &str) -> Result<()> {
    if Path::new(config_path).exists() {
        bail!("Config file already exists at {}", config_path);
    }
    Config::default()
        .save(config_path)
        .with_context(|| format!("Failed to write {}", config_path))?;
    println!("Default config written to {}", config_path);
    Ok(())
}

fn load_config(config_path: &str) -> Result<Config> {
    let mut config = Config::load(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn build_poller(config: &Config) -> Result<Poller> {
    let credentials = CredentialManager::new();
    let imap_password = config.imap.get_password(&credentials)?;
    let smtp_password = config.smtp.get_password(&credentials)?;

    let store = Arc::new(ImapStore::new(config.imap.clone(), imap_password));
    let sender = Arc::new(SmtpSender::new(&config.smtp, smtp_password)?);
    let forwarder = Arc::new(Forwarder::new(store.clone(), sender, config.forward.clone()));

    info!("Creating worker pool '{}*'", config.pool.thread_name_prefix);
    let pool = Arc::new(WorkerPool::new(&config.pool)?);

    Ok(Poller::new(store, forwarder, pool, config.poller.clone()))
}

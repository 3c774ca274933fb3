use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use securefs::config::{self, MountFlags};
use securefs::enumerate::scan_ids;
use securefs::key_manager::KeyManager;
use securefs::store::DirStore;
use securefs::{BlockRead, Id, BLOCK_SIZE};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use zeroize::Zeroizing;

/// Environment variable consulted before prompting for a password
const ENV_PASSWORD: &str = "SECUREFS_PASSWORD";

/// SecureFS - encrypted block storage with per-object keys
#[derive(Parser)]
#[command(name = "securefs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (default: $SECUREFS_CONFIG or config.json)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize SecureFS (write config and password-protected key file)
    Init {
        /// Storage directory path
        #[arg(short, long, default_value = "./storage")]
        storage_dir: String,

        /// Minimum PBKDF2 iterations
        #[arg(long, default_value_t = 160_000)]
        min_iterations: u32,

        /// Minimum seconds of key derivation work on this host
        #[arg(long, default_value_t = 1.0)]
        min_seconds: f64,

        /// Skip tag verification on read (tags are still written)
        #[arg(long)]
        no_authentication: bool,
    },

    /// Encrypt a file into a new object and print its id
    Put {
        /// Input file to encrypt
        input: PathBuf,
    },

    /// Decrypt an object
    Get {
        /// Object id (64 hex characters)
        id: String,

        /// Output file path (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List all object ids in storage
    Ids,

    /// Read every block of every object and report integrity failures
    Verify,

    /// Change the key file password
    Passwd,

    /// Show storage status and statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Use RUST_LOG environment variable to control log level (e.g., RUST_LOG=info,securefs=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    info!(command = ?cli.command, "SecureFS starting");
    let config_path = config::resolve_config_path(cli.config.as_deref());

    match cli.command {
        Commands::Init {
            storage_dir,
            min_iterations,
            min_seconds,
            no_authentication,
        } => {
            let flags = if no_authentication {
                MountFlags::NO_AUTHENTICATION
            } else {
                MountFlags::empty()
            };
            cmd_init(&config_path, &storage_dir, min_iterations, min_seconds, flags).await
        }

        Commands::Put { input } => cmd_put(&config_path, &input).await,

        Commands::Get { id, output } => cmd_get(&config_path, &id, output.as_ref()).await,

        Commands::Ids => cmd_ids(&config_path).await,

        Commands::Verify => cmd_verify(&config_path).await,

        Commands::Passwd => cmd_passwd(&config_path).await,

        Commands::Status => cmd_status(&config_path).await,
    }
}

/// Create a styled progress bar for block operations
fn create_progress_bar(total: u64, message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    Ok(pb)
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    Ok(pb)
}

/// Password from the environment, else one line from stdin
fn read_password(prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    if let Ok(pw) = std::env::var(ENV_PASSWORD) {
        return Ok(Zeroizing::new(pw.into_bytes()));
    }
    eprint!("{}: ", prompt);
    io::stderr().flush()?;
    let mut line = Zeroizing::new(String::new());
    io::stdin().lock().read_line(&mut line)?;
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        anyhow::bail!("password cannot be empty");
    }
    Ok(Zeroizing::new(trimmed.as_bytes().to_vec()))
}

async fn unlock(cfg: &config::Config) -> Result<KeyManager> {
    let password = read_password("Password")?;
    let spinner = create_spinner("Deriving key...")?;
    let km = KeyManager::unlock(cfg, &password).await;
    spinner.finish_and_clear();
    km
}

/// Initialize SecureFS configuration and key file
async fn cmd_init(
    config_path: &str,
    storage_dir: &str,
    min_iterations: u32,
    min_seconds: f64,
    flags: MountFlags,
) -> Result<()> {
    println!("Initializing SecureFS...");

    if fs::try_exists(config_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Configuration file '{}' already exists. Remove it first or use a different path.",
            config_path
        );
    }

    let cfg = config::Config::new(storage_dir)
        .with_kdf(min_iterations, min_seconds)
        .with_flags(flags);
    cfg.validate()?;

    fs::create_dir_all(storage_dir)
        .await
        .with_context(|| format!("creating storage directory '{}'", storage_dir))?;

    let password = read_password("New password")?;
    let spinner = create_spinner("Calibrating key derivation...")?;
    let created = KeyManager::create(&cfg, &password).await;
    spinner.finish_and_clear();
    created?;

    let config_json = serde_json::to_string_pretty(&cfg)?;
    fs::write(config_path, config_json)
        .await
        .with_context(|| format!("writing config to '{}'", config_path))?;

    println!("Initialization complete!");
    println!("Config:   {}", config_path);
    println!("Key file: {}", cfg.key_file_path().display());
    println!("Storage:  {}", storage_dir);
    println!();
    println!("IMPORTANT: Back up the key file and remember the password!");
    println!("Without both, your encrypted objects cannot be recovered.");

    Ok(())
}

/// Encrypt a file into a fresh object
async fn cmd_put(config_path: &str, input: &Path) -> Result<()> {
    let cfg = config::Config::load(config_path)?;
    let km = unlock(&cfg).await?;
    let store = DirStore::new(&cfg.storage_dir);

    let data = fs::read(input)
        .await
        .with_context(|| format!("reading {:?}", input))?;

    let id = Id::generate();
    let pb = create_progress_bar(data.len() as u64, "Encrypting")?;
    let mut ctx = km.open_object(&store, id)?;
    for (index, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
        ctx.write_block(index as u64, chunk)?;
        pb.inc(chunk.len() as u64);
    }
    if data.is_empty() {
        // Records the zero size so the object is listed
        ctx.truncate(0)?;
    }
    pb.finish_with_message(format!("Encrypted {} bytes", data.len()));

    println!("{}", id);
    Ok(())
}

/// Decrypt an object
async fn cmd_get(config_path: &str, id: &str, output: Option<&PathBuf>) -> Result<()> {
    let cfg = config::Config::load(config_path)?;
    let id: Id = id.parse()?;
    let km = unlock(&cfg).await?;
    let store = DirStore::new(&cfg.storage_dir);

    let ctx = km.open_object(&store, id)?;
    let pb = create_progress_bar(ctx.logical_size(), &format!("Decrypting {}", id))?;
    // The size comes from unauthenticated metadata, so grow as blocks verify
    let mut data = Vec::new();
    let mut index = 0u64;
    while let BlockRead::Data(block) = ctx.read_block(index)? {
        pb.inc(block.len() as u64);
        data.extend_from_slice(&block);
        index += 1;
    }

    match output {
        Some(output_path) => {
            fs::write(output_path, &data)
                .await
                .with_context(|| format!("writing to {:?}", output_path))?;
            pb.finish_with_message(format!("Decrypted {} bytes -> {:?}", data.len(), output_path));
        }
        None => {
            pb.finish_and_clear();
            io::stdout().write_all(&data)?;
            eprintln!("Decrypted {} bytes to stdout", data.len());
        }
    }

    Ok(())
}

/// List all object ids
async fn cmd_ids(config_path: &str) -> Result<()> {
    let cfg = config::Config::load(config_path)?;
    let scan = scan_ids(Path::new(&cfg.storage_dir))?;

    let mut ids: Vec<Id> = scan.ids.into_iter().collect();
    ids.sort();
    for id in &ids {
        println!("{}", id);
    }
    eprintln!("{} object(s)", ids.len());
    if !scan.malformed.is_empty() {
        eprintln!("WARNING: {} malformed entr(ies) skipped", scan.malformed.len());
    }
    Ok(())
}

/// Integrity sweep over every object
async fn cmd_verify(config_path: &str) -> Result<()> {
    let cfg = config::Config::load(config_path)?;
    if cfg.flags.no_authentication() {
        warn!("no-authentication mount: verify still checks tags");
    }
    let km = KeyManager::from_master_key(
        unlock(&cfg).await?.master_key().clone(),
        MountFlags::READ_ONLY,
    );
    let store = DirStore::new(&cfg.storage_dir);
    let scan = scan_ids(Path::new(&cfg.storage_dir))?;

    let pb = ProgressBar::new(scan.ids.len() as u64);
    let mut corrupt = Vec::new();
    for id in &scan.ids {
        let ctx = km.open_object(&store, *id)?;
        for index in 0..ctx.block_count() {
            match ctx.read_block(index) {
                Ok(_) => {}
                Err(e) if e.is_authentication_failure() => {
                    corrupt.push((*id, index));
                }
                Err(e) => return Err(e.into()),
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    println!(
        "Checked {} object(s), {} corrupt block(s)",
        scan.ids.len(),
        corrupt.len()
    );
    for (id, index) in &corrupt {
        println!("  {} block {}", id, index);
    }
    if !corrupt.is_empty() {
        anyhow::bail!("integrity check failed");
    }
    Ok(())
}

/// Change the key file password
async fn cmd_passwd(config_path: &str) -> Result<()> {
    let cfg = config::Config::load(config_path)?;
    let old = read_password("Current password")?;
    let new = read_password("New password")?;
    let spinner = create_spinner("Re-wrapping master key...")?;
    let result = KeyManager::change_password(&cfg, &old, &new).await;
    spinner.finish_and_clear();
    result?;
    println!("Password changed.");
    Ok(())
}

/// Show storage status and statistics
async fn cmd_status(config_path: &str) -> Result<()> {
    let cfg = config::Config::load_with_env(Some(config_path))?;

    println!("SecureFS Status");
    println!();

    println!("Configuration:");
    println!("  Config file:   {}", config_path);
    println!("  Key file:      {}", cfg.key_file_path().display());
    println!("  Storage dir:   {}", cfg.storage_dir);
    println!("  Flags:         {:#x}", cfg.flags.bits());
    println!();

    let key_exists = fs::try_exists(cfg.key_file_path()).await.unwrap_or(false);
    println!("Key Status:      {}", if key_exists { "Present" } else { "Missing" });
    println!();

    let store = DirStore::new(&cfg.storage_dir);
    let scan = scan_ids(store.root())?;
    let mut total_blocks = 0u64;
    for id in &scan.ids {
        total_blocks += securefs::store::BlockStore::stored_blocks(&store, id)?;
    }

    println!("Storage Statistics:");
    println!("  Objects:           {}", scan.ids.len());
    println!("  Stored blocks:     {}", total_blocks);
    println!(
        "  Stored size:       {:.2} MB",
        (total_blocks * securefs::RECORD_LENGTH as u64) as f64 / 1_048_576.0
    );

    if !scan.malformed.is_empty() {
        println!();
        println!("WARNING: {} malformed entr(ies) in storage", scan.malformed.len());
    }

    Ok(())
}

use std::io::BufRead as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use gatepass_core::{
    config::GatepassConfig,
    debounce::DebounceCache,
    engine::{ScanObserver, ScanOutcome, VerificationEngine},
    export, import, issue,
    store::AttendanceStore,
    token::{TokenCodec, TokenIssuer},
    util,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "gatepass",
    version = util::VERSION,
    about = "QR-credential attendance: issue, verify, export (offline)"
)]
struct Cli {
    /// Path to the attendance database (SQLite).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Read the token encryption key from this environment variable.
    #[arg(long, global = true, default_value = "GATEPASS_KEY")]
    key_env: String,

    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create (or open) the attendance database.
    InitDb,

    /// Generate a fresh URL-safe base64 token encryption key.
    Keygen,

    /// Import a participant roster CSV (columns: name, identifier, contact).
    Import {
        #[arg(long)]
        csv: PathBuf,
    },

    /// Issue credentials: the whole roster, or one participant via --id.
    Issue {
        #[arg(long)]
        id: Option<String>,
        /// Directory receiving one `<identifier>.txt` token artifact each.
        #[arg(long)]
        tokens_dir: Option<PathBuf>,
    },

    /// Verify scans: one token via --token, or a stdin line loop.
    Verify {
        #[arg(long)]
        token: Option<String>,
        /// Source tag recorded with each verification.
        #[arg(long)]
        source: Option<String>,
    },

    /// Write the attendance export pack (attendance.csv + manifest.json).
    Export {
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Required when an admin passphrase is configured.
        #[arg(long)]
        admin_pass: Option<String>,
    },

    /// Print roster and attendance counts.
    Status,

    /// Print version information.
    Version,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = GatepassConfig::load(cli.config.as_deref()).context("load config")?;
    cfg.apply_env();

    // The CLI-named key variable wins over config and GATEPASS_KEY.
    if let Ok(key) = std::env::var(&cli.key_env) {
        cfg.security.encryption_key = Some(key);
    }

    init_logging(&cfg.logging);

    let db_path = cli.db.unwrap_or(cfg.paths.db.clone());

    match cli.cmd {
        Commands::InitDb => {
            let store =
                AttendanceStore::open(&db_path, &cfg.store).context("open attendance store")?;
            info!(
                db = %db_path.display(),
                participants = store.count_participants()?,
                "attendance store initialized"
            );
        }

        Commands::Keygen => {
            println!("{}", TokenCodec::generate_key());
        }

        Commands::Import { csv } => {
            let store =
                AttendanceStore::open(&db_path, &cfg.store).context("open attendance store")?;
            let summary = import::import_roster(&store, &csv).context("import roster")?;
            println!(
                "Imported: {}. Failures: {}.",
                summary.imported,
                summary.failures.len()
            );
            for f in &summary.failures {
                println!("  line {}: '{}' {}", f.line, f.identifier, f.reason);
            }
        }

        Commands::Issue { id, tokens_dir } => {
            // Key problems surface here, before any roster row is touched.
            let key = cfg.security.require_key()?;
            let codec = TokenCodec::from_base64_key(&key).context("load encryption key")?;
            let issuer = TokenIssuer::new(codec);
            let store =
                AttendanceStore::open(&db_path, &cfg.store).context("open attendance store")?;
            let tokens_dir = tokens_dir.unwrap_or(cfg.paths.tokens_dir.clone());

            match id {
                Some(id) => {
                    let cred = issue::issue_one(&store, &issuer, &id, Some(&tokens_dir))
                        .context("issue credential")?;
                    println!("{}", cred.token);
                }
                None => {
                    let summary = issue::issue_all(&store, &issuer, Some(&tokens_dir))
                        .context("issue credentials")?;
                    println!(
                        "Issued: {}. Failures: {}.",
                        summary.issued,
                        summary.failures.len()
                    );
                    for f in &summary.failures {
                        println!("  {}: {}", f.participant_id, f.reason);
                    }
                }
            }
        }

        Commands::Verify { token, source } => {
            let key = cfg.security.require_key()?;
            let codec = TokenCodec::from_base64_key(&key).context("load encryption key")?;
            let store =
                AttendanceStore::open(&db_path, &cfg.store).context("open attendance store")?;
            let debounce =
                DebounceCache::new(cfg.scan.debounce_window(), cfg.scan.debounce_capacity);
            let observer = Arc::new(ConsoleObserver::default());
            let source = source.unwrap_or(cfg.scan.source.clone());
            let engine =
                VerificationEngine::new(codec, store, debounce, observer.clone(), source);

            match token {
                Some(raw) => {
                    let outcome = engine.handle(raw.trim());
                    if !matches!(outcome, Some(ScanOutcome::Verified { .. })) {
                        std::process::exit(1);
                    }
                }
                None => {
                    info!("scan loop started; one token per line, EOF ends the session");
                    let stdin = std::io::stdin();
                    for line in stdin.lock().lines() {
                        let line = line.context("read scan line")?;
                        let raw = line.trim();
                        if raw.is_empty() {
                            continue;
                        }
                        let _ = engine.handle(raw);
                    }
                    println!("Session summary: {}", observer.summary());
                }
            }
        }

        Commands::Export { out_dir, admin_pass } => {
            if let Some(expected) = cfg.security.admin_passphrase.as_deref() {
                anyhow::ensure!(
                    admin_pass.as_deref() == Some(expected),
                    "export requires the configured admin passphrase (--admin-pass)"
                );
            }
            let store =
                AttendanceStore::open(&db_path, &cfg.store).context("open attendance store")?;
            let out = out_dir.unwrap_or(cfg.paths.export_dir.clone());
            let manifest =
                export::write_attendance_pack(&store, &out).context("write attendance pack")?;
            info!(
                out_dir = %out.display(),
                rows = manifest.attendance_rows,
                "attendance pack written"
            );
        }

        Commands::Status => {
            let store =
                AttendanceStore::open(&db_path, &cfg.store).context("open attendance store")?;
            println!("Participants: {}", store.count_participants()?);
            println!("Attendance:   {}", store.count_attendance()?);
        }

        Commands::Version => {
            println!("{}", util::version_string());
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Console observer
// ---------------------------------------------------------------------------

/// Prints one line per scan outcome and keeps session counters.
#[derive(Debug, Default)]
struct ConsoleObserver {
    verified: AtomicUsize,
    duplicate: AtomicUsize,
    unknown: AtomicUsize,
    invalid: AtomicUsize,
    store_errors: AtomicUsize,
}

impl ScanObserver for ConsoleObserver {
    fn on_outcome(&self, outcome: &ScanOutcome) {
        match outcome {
            ScanOutcome::Verified { participant, ts_utc } => {
                self.verified.fetch_add(1, Ordering::Relaxed);
                println!(
                    "VERIFIED  {} {} at {}",
                    participant.participant_id, participant.name, ts_utc
                );
            }
            ScanOutcome::Duplicate { participant } => {
                self.duplicate.fetch_add(1, Ordering::Relaxed);
                println!(
                    "DUPLICATE {} already marked present",
                    participant.participant_id
                );
            }
            ScanOutcome::Unknown { participant_id } => {
                self.unknown.fetch_add(1, Ordering::Relaxed);
                println!("UNKNOWN   {participant_id}");
            }
            ScanOutcome::Invalid { reason } => {
                self.invalid.fetch_add(1, Ordering::Relaxed);
                println!("INVALID   {reason}");
            }
            ScanOutcome::StoreError { message } => {
                self.store_errors.fetch_add(1, Ordering::Relaxed);
                println!("STORE-ERR {message}");
            }
        }
    }
}

impl ConsoleObserver {
    fn summary(&self) -> String {
        format!(
            "verified {}, duplicate {}, unknown {}, invalid {}, store errors {}",
            self.verified.load(Ordering::Relaxed),
            self.duplicate.load(Ordering::Relaxed),
            self.unknown.load(Ordering::Relaxed),
            self.invalid.load(Ordering::Relaxed),
            self.store_errors.load(Ordering::Relaxed)
        )
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_logging(cfg: &gatepass_core::config::LoggingConfig) {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));

    let registry = tracing_subscriber::registry().with(filter);

    if cfg.json_stdout {
        // Structured stdout for container log collectors.
        let json_layer = tracing_subscriber::fmt::layer().json();
        registry.with(json_layer).init();
    } else if !cfg.json_log_file.is_empty() {
        // JSON lines to a file, console view on stderr alongside.
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.json_log_file)
            .expect("failed to open json log file");
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::sync::Mutex::new(log_file));
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(file_layer).with(console_layer).init();
    } else {
        // Scan outcome lines go to stdout; diagnostics stay on stderr.
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(console_layer).init();
    }
}

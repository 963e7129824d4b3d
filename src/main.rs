//! CLI entry point for `mailmirror`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use mailmirror::config::{self, Config};
use mailmirror::export::mbox::{self, ExportStats};
use mailmirror::remote::imap::ImapInventory;
use mailmirror::remote::{FolderFilter, RemoteInventory};
use mailmirror::store::path;
use mailmirror::sync::{RunReport, SyncOptions, SyncReconciler};

/// Exit status when the run completed but the consistency check failed.
const EXIT_INCONSISTENT: u8 = 2;

#[derive(Parser)]
#[command(name = "mailmirror", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Server and folder selection shared by the commands that talk to the server.
#[derive(clap::Args)]
struct ServerArgs {
    /// IMAP server host name
    #[arg(long)]
    host: Option<String>,
    /// IMAPS port
    #[arg(long)]
    port: Option<u16>,
    /// Login user name
    #[arg(short, long)]
    user: Option<String>,
    /// Login password
    #[arg(long, env = "MAILMIRROR_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Only process this remote folder
    #[arg(long)]
    folder: Option<String>,
    /// Skip this remote folder (repeatable)
    #[arg(long = "ignore", value_name = "FOLDER")]
    ignore: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror the mailbox into the backup directory
    Backup {
        #[command(flatten)]
        server: ServerArgs,
        /// Backup root directory
        #[arg(short, long)]
        root: Option<PathBuf>,
        /// Name of the per-directory quarantine folder
        #[arg(long, value_name = "NAME")]
        quarantine: Option<String>,
        /// Output the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// List live remote messages and the paths they map to
    Scan {
        #[command(flatten)]
        server: ServerArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export every live message into one mbox file per folder
    ExportMbox {
        #[command(flatten)]
        server: ServerArgs,
        /// Output directory
        #[arg(short, long)]
        output: PathBuf,
        /// Output the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config {
        /// Write it to the configuration file
        #[arg(long)]
        save: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page
    Manpage,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = config::load_config();

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.clone(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    setup_logging(&log_level, &config);

    match cli.command {
        Commands::Backup {
            server,
            root,
            quarantine,
            json,
        } => {
            if let Some(root) = root {
                config.backup.root = Some(root);
            }
            if let Some(name) = quarantine {
                config.backup.quarantine_dir = name;
            }
            cmd_backup(server, config, json)
        }
        Commands::Scan { server, json } => cmd_scan(server, config, json),
        Commands::ExportMbox {
            server,
            output,
            json,
        } => cmd_export_mbox(server, config, &output, json),
        Commands::Config { save } => cmd_config(&config, save),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Try to set up file logging
    let log_path = config::log_file_path(config);
    let log_dir = log_path.parent().unwrap_or(std::path::Path::new("."));
    let log_name = log_path.file_name().unwrap_or_default();
    if std::fs::create_dir_all(log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(log_dir, log_name);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Fold command-line overrides into the configuration and build the folder
/// filter. Returns the password to log in with.
fn apply_server_args(
    args: ServerArgs,
    config: &mut Config,
) -> anyhow::Result<(String, FolderFilter)> {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(user) = args.user {
        config.server.username = user;
    }
    config.backup.ignore_folders.extend(args.ignore);

    if config.server.host.is_empty() {
        anyhow::bail!("No IMAP host given (use --host or [server] host in the config file)");
    }
    if config.server.username.is_empty() {
        anyhow::bail!("No user name given (use --user or [server] username in the config file)");
    }
    let password = args
        .password
        .or_else(|| config.server.password.clone())
        .ok_or_else(|| anyhow::anyhow!("No password given (set MAILMIRROR_PASSWORD)"))?;

    let filter = FolderFilter {
        only: args.folder,
        ignore: config.backup.ignore_folders.clone(),
    };
    Ok((password, filter))
}

/// Run one backup and print the summary.
fn cmd_backup(args: ServerArgs, mut config: Config, json: bool) -> anyhow::Result<ExitCode> {
    let (password, filter) = apply_server_args(args, &mut config)?;
    config.backup.validate()?;
    let root = config
        .backup
        .root
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No backup root given (use --root or [backup] root)"))?;

    let mut remote = ImapInventory::connect(&config.server, &password, &config.pacing)?;

    let options = SyncOptions {
        root: root.clone(),
        quarantine_dir: config.backup.quarantine_dir.clone(),
        filter,
        fsync: config.backup.fsync,
    };

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Backing up [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .expect("valid template")
            .progress_chars("#>-"),
    );

    let result = SyncReconciler::new(&mut remote, options).run(Some(&|current, total| {
        pb.set_length(total);
        pb.set_position(current);
    }));
    pb.finish_and_clear();
    remote.logout();

    let report = result?;
    if json {
        print_report_json(&root, &report)?;
    } else {
        print_report_table(&root, &report);
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INCONSISTENT)
    })
}

/// List live remote messages with their derived local paths.
fn cmd_scan(args: ServerArgs, mut config: Config, json: bool) -> anyhow::Result<ExitCode> {
    let (password, filter) = apply_server_args(args, &mut config)?;
    let mut remote = ImapInventory::connect(&config.server, &password, &config.pacing)?;
    let listed = remote.list_live(&filter);
    remote.logout();
    let refs = listed?;

    if json {
        let items: Vec<serde_json::Value> = refs
            .iter()
            .map(|r| {
                serde_json::json!({
                    "folder": r.folder,
                    "message_id": r.message_id,
                    "date": r.date,
                    "from": r.from,
                    "subject": r.subject,
                    "path": path::derive(r).ok().map(|p| p.to_string_lossy().into_owned()),
                })
            })
            .collect();
        let output = serde_json::json!({
            "message_count": refs.len(),
            "messages": items,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<16} {:<20} {:<28} SUBJECT", "FOLDER", "DATE", "FROM");
    println!("{}", "-".repeat(100));
    for r in &refs {
        let date = mailmirror::parser::header::parse_date(&r.date)
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "{:<16} {:<20} {:<28} {}",
            truncate(&r.folder, 16),
            date,
            truncate(&r.from, 28),
            truncate(&r.subject, 60)
        );
        match path::derive(r) {
            Ok(p) => println!("  -> {}", p.display()),
            Err(e) => println!("  !! {e}"),
        }
    }
    println!();
    println!("{} messages", refs.len());
    Ok(ExitCode::SUCCESS)
}

/// Export the mailbox to mbox files and print a summary.
fn cmd_export_mbox(
    args: ServerArgs,
    mut config: Config,
    output: &std::path::Path,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let (password, filter) = apply_server_args(args, &mut config)?;
    let mut remote = ImapInventory::connect(&config.server, &password, &config.pacing)?;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Exporting [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("valid template")
            .progress_chars("#>-"),
    );

    let result = mbox::export_mailboxes(&mut remote, &filter, output, &|current, total, folder| {
        pb.set_length(total as u64);
        pb.set_position(current as u64);
        pb.set_message(folder.to_string());
    });
    pb.finish_and_clear();
    remote.logout();

    let stats = result?;
    if json {
        print_export_json(output, &stats)?;
    } else {
        print_export_table(output, &stats);
    }
    Ok(ExitCode::SUCCESS)
}

/// Print the effective configuration as TOML, optionally saving it.
fn cmd_config(config: &Config, save: bool) -> anyhow::Result<ExitCode> {
    if save {
        config::save_config(config)?;
        if let Some(path) = config::config_file_path() {
            println!("Configuration written to {}", path.display());
        }
        return Ok(ExitCode::SUCCESS);
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(ExitCode::SUCCESS)
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<ExitCode> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mailmirror", &mut std::io::stdout());
    Ok(ExitCode::SUCCESS)
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<ExitCode> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(ExitCode::SUCCESS)
}

/// Print the run summary in a human-readable table.
fn print_report_table(root: &std::path::Path, report: &RunReport) {
    use humansize::{format_size, BINARY};

    let c = &report.counters;
    println!();
    println!("  {:<32} {}", "Backup root", root.display());
    println!("  {:<32} {}", "(A) Downloaded", c.downloaded);
    println!("  {:<32} {}", "(B) Already existing", c.already_existing);
    println!("  {:<32} {}", "(C) Kept after sweep", c.kept);
    println!("  {:<32} {}", "(D) Moved to quarantine", c.moved_to_quarantine);
    if c.duplicates > 0 {
        println!("  {:<32} {}", "Duplicates", c.duplicates);
    }
    if c.failed > 0 {
        println!("  {:<32} {}", "Failed", c.failed);
    }
    if c.repaired > 0 {
        println!("  {:<32} {}", "Repaired before writing", c.repaired);
    }
    println!("  {:<32} {}", "Written", format_size(c.bytes_written, BINARY));
    println!("  {:<32} {:.2?}", "Elapsed", report.elapsed);
    println!();
    println!(
        "  Consistency check: A+B==C; {}+{}=={}: {}",
        c.downloaded, c.already_existing, c.kept, report.verdict
    );
    println!();
}

/// Print the run summary as JSON.
fn print_report_json(root: &std::path::Path, report: &RunReport) -> anyhow::Result<()> {
    let output = serde_json::json!({
        "root": root.to_string_lossy(),
        "counters": report.counters,
        "verdict": report.verdict,
        "elapsed_ms": report.elapsed.as_millis() as u64,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Print the export summary in a human-readable table.
fn print_export_table(output: &std::path::Path, stats: &ExportStats) {
    use humansize::{format_size, BINARY};

    println!();
    println!("  {:<32} {}", "Output directory", output.display());
    println!("  {:<32} {}", "Mailboxes", stats.folders);
    println!("  {:<32} {}", "Messages", stats.messages);
    if stats.duplicates > 0 {
        println!("  {:<32} {}", "Duplicates", stats.duplicates);
    }
    if stats.skipped > 0 {
        println!("  {:<32} {}", "Skipped", stats.skipped);
    }
    println!("  {:<32} {}", "Written", format_size(stats.bytes, BINARY));
    println!();
}

/// Print the export summary as JSON.
fn print_export_json(output: &std::path::Path, stats: &ExportStats) -> anyhow::Result<()> {
    let result = serde_json::json!({
        "output": output.to_string_lossy(),
        "stats": stats,
    });
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Truncate a string to `max` characters, adding "..." if needed.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

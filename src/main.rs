//! exthost - Inspect and maintain extension roots.
//!
//! Usage:
//!   exthost scan                 List discovered extensions
//!   exthost prune                Delete outdated extension copies
//!   exthost quarantine <ID>      Disable an extension at next start
//!   exthost markers              List pending quarantine markers
//!   exthost --help               Show help

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use exthost_core::{ExtensionRoot, HostConfig};
use exthost_runtime::{
    DescriptorLoader, DescriptorSummary, list_markers, remove_outdated_paths, write_marker,
};

#[derive(Parser)]
#[command(
    name = "exthost",
    version,
    about = "Inspect and maintain extension roots",
    long_about = "exthost scans the directories an extension host loads from.\n\n\
                  It reports which copy of each extension wins, removes outdated \
                  copies and manages crash quarantine markers."
)]
struct Cli {
    /// Host config file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// User extension root, scanned before bundled roots (repeatable)
    #[arg(long = "root", global = true)]
    roots: Vec<PathBuf>,

    /// Bundled extension root (repeatable)
    #[arg(long = "bundled", global = true)]
    bundled: Vec<PathBuf>,

    /// Directory holding quarantine markers
    #[arg(long, global = true)]
    temp_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the extensions that would be loaded
    Scan {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Delete outdated copies from user roots
    Prune {
        /// Only show what would be deleted
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Disable an extension the next time the host starts
    Quarantine {
        /// Extension id
        id: String,
    },

    /// List pending quarantine markers
    Markers,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Serialize)]
struct ScanReport {
    extensions: Vec<DescriptorSummary>,
    outdated: Vec<PathBuf>,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Scan { format } => run_scan(&config, format)?,
        Command::Prune { dry_run } => run_prune(&config, dry_run),
        Command::Quarantine { id } => {
            let path = write_marker(&config.temp_dir, &id)
                .with_context(|| format!("Failed to quarantine '{id}'"))?;
            println!("'{id}' will be disabled at next start ({})", path.display());
        }
        Command::Markers => run_markers(&config.temp_dir)?,
    }

    Ok(())
}

/// Config file first, command line roots replace the configured ones.
fn load_config(cli: &Cli) -> Result<HostConfig> {
    let mut config = match &cli.config {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => HostConfig::default(),
    };

    if !cli.roots.is_empty() || !cli.bundled.is_empty() {
        config.roots = cli
            .roots
            .iter()
            .map(ExtensionRoot::user)
            .chain(cli.bundled.iter().map(ExtensionRoot::bundled))
            .collect();
    }
    if let Some(temp_dir) = &cli.temp_dir {
        config.temp_dir = temp_dir.clone();
    }
    Ok(config)
}

fn run_scan(config: &HostConfig, format: OutputFormat) -> Result<()> {
    let scan = DescriptorLoader::new(config).scan();
    let report = ScanReport {
        extensions: scan.descriptors.iter().map(|d| d.summary()).collect(),
        outdated: scan.outdated,
    };

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!();
            println!("{}", "─".repeat(60));
            for root in config.ordered_roots() {
                let kind = if root.bundled { "bundled" } else { "user" };
                println!(" {kind:<8} {}", root.path.display());
            }
            println!("{}", "─".repeat(60));
            println!();

            if report.extensions.is_empty() {
                println!("No extensions found.");
            }
            for ext in &report.extensions {
                let version = if ext.version.is_empty() { "-" } else { ext.version.as_str() };
                let origin = if ext.bundled { " (bundled)" } else { "" };
                println!("  {:<30} {:>10}{origin}", ext.name, version);
                if ext.namespace != ext.name {
                    println!("  {:<30} namespace: {}", "", ext.namespace);
                }
            }

            if !report.outdated.is_empty() {
                println!();
                println!("{} outdated cop(ies):", report.outdated.len());
                for path in &report.outdated {
                    println!("  {}", path.display());
                }
            }
        }
    }

    Ok(())
}

fn run_prune(config: &HostConfig, dry_run: bool) {
    let outdated = DescriptorLoader::new(config).scan().outdated;
    if outdated.is_empty() {
        println!("Nothing to prune.");
        return;
    }

    if dry_run {
        for path in &outdated {
            println!("would remove {}", path.display());
        }
        return;
    }

    let removed = remove_outdated_paths(config, &outdated);
    for path in &removed {
        println!("removed {}", path.display());
    }
    let kept = outdated.len() - removed.len();
    if kept > 0 {
        println!("{kept} outdated cop(ies) left in place");
    }
}

fn run_markers(temp_dir: &Path) -> Result<()> {
    let markers = list_markers(temp_dir)
        .with_context(|| format!("Failed to read {}", temp_dir.display()))?;
    if markers.is_empty() {
        println!("No quarantined extensions.");
    }
    for id in markers {
        println!("{id}");
    }
    Ok(())
}

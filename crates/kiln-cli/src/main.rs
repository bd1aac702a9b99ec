//! Kiln CLI - Inspect incremental build decisions
//!
//! Commands:
//! - kiln inspect <manifest>          - Properties, diagnostics and caching verdict of every task
//! - kiln deps <manifest> <task>      - Resolved dependencies and build order
//! - kiln report <manifest> <task>    - JSON task inputs report
//! - kiln hash <file>                 - Content hash of a file

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kiln_core::caching::CachingState;
use kiln_core::validation::Severity;
use kiln_core::walker::PropertySummary;
use kiln_core::{
    hash_content, BuildContext, KilnConfig, Manifest, Task, TaskAnalysis, TaskContainer, TaskGraph,
    TaskPath,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::Level;

/// Kiln - Incremental build decision engine
#[derive(Parser)]
#[command(name = "kiln", version, about = "Incremental build decision engine")]
struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyse the tasks of a manifest against the file system
    Inspect {
        /// Task manifest (JSON)
        manifest: PathBuf,
        /// Only show this task
        #[arg(short, long)]
        task: Option<String>,
    },
    /// Show the dependencies of a task and the resulting build order
    Deps {
        manifest: PathBuf,
        task: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Print the inputs report of a task as JSON
    Report { manifest: PathBuf, task: String },
    /// Hash a file the way file inputs are hashed
    Hash {
        file: PathBuf,
        /// Treat CRLF and CR like LF
        #[arg(long)]
        normalize_line_endings: bool,
    },
}

#[derive(Serialize)]
struct DepsOutput {
    task: String,
    depends_on: Vec<String>,
    must_run_after: Vec<String>,
    should_run_after: Vec<String>,
    finalized_by: Vec<String>,
    build_order: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Inspect { manifest, task } => inspect(&manifest, task.as_deref()),
        Commands::Deps {
            manifest,
            task,
            json,
        } => deps(&manifest, &task, json),
        Commands::Report { manifest, task } => report(&manifest, &task),
        Commands::Hash {
            file,
            normalize_line_endings,
        } => {
            let content =
                std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let hash = hash_content(&content, normalize_line_endings);
            if normalize_line_endings {
                println!("📄 Line endings normalized");
            }
            println!("🔑 Hash: {}", hash);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Directory the manifest's relative paths are resolved against
fn base_dir(manifest: &Path) -> Result<PathBuf> {
    let absolute = std::fs::canonicalize(manifest)
        .with_context(|| format!("manifest not found: {}", manifest.display()))?;
    Ok(absolute
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/")))
}

/// Build context and container for a manifest; lazy tasks stay registered
fn load(manifest: &Path) -> Result<(BuildContext, TaskContainer)> {
    let base = base_dir(manifest)?;
    let config = KilnConfig::load(&base)?;
    let ctx = BuildContext::with_disk(config)?;
    ctx.metrics().start();

    let container = Manifest::load(manifest)?.into_container(&base, Arc::clone(ctx.metrics()))?;
    Ok((ctx, container))
}

/// Like [`load`], with every task realized
fn load_all(manifest: &Path) -> Result<(BuildContext, TaskContainer)> {
    let (ctx, mut container) = load(manifest)?;
    container.realize_all()?;
    ctx.metrics().flush();
    Ok((ctx, container))
}

/// Analyse every task so output overlaps are known, keeping the order of `paths`
fn analyze(ctx: &BuildContext, container: &TaskContainer) -> Result<Vec<TaskAnalysis>> {
    let tasks: Vec<&Task> = container
        .paths()
        .iter()
        .filter_map(|path| container.get(path))
        .collect();
    Ok(ctx.analyze_all(&tasks)?)
}

fn inspect(manifest: &Path, only: Option<&str>) -> Result<()> {
    let start = Instant::now();
    let (ctx, container) = load_all(manifest)?;
    let only = only.map(TaskPath::parse).transpose()?;
    if let Some(path) = &only {
        if !container.contains(path) {
            bail!("Task '{}' not found.", path);
        }
    }

    let analyses = analyze(&ctx, &container)?;
    for analysis in &analyses {
        if only.as_ref().is_some_and(|path| path != &analysis.task) {
            continue;
        }
        print_analysis(analysis)?;
    }

    println!(
        "✅ {} task(s) analysed in {:?}",
        analyses.len(),
        start.elapsed()
    );
    Ok(())
}

fn print_analysis(analysis: &TaskAnalysis) -> Result<()> {
    println!("📦 {}", analysis.task);

    let summary = PropertySummary::from(&analysis.properties);
    println!(
        "{}",
        serde_json::to_string_pretty(&summary)?
            .lines()
            .map(|line| format!("   {}", line))
            .collect::<Vec<_>>()
            .join("\n")
    );

    for diagnostic in analysis.properties.validation.diagnostics() {
        let marker = match diagnostic.severity {
            Severity::Warning => "⚠️ ",
            Severity::Error => "❌",
        };
        println!("   {} {}", marker, diagnostic.message);
    }

    match &analysis.caching {
        CachingState::Enabled { key, .. } => {
            println!("   ⚡ Cacheable, key {}", key);
        }
        CachingState::Disabled { reasons, .. } => {
            println!("   ⏭  Not cacheable:");
            for reason in reasons {
                println!("      • {:?}: {}", reason.category, reason.description);
            }
        }
    }
    println!();
    Ok(())
}

fn deps(manifest: &Path, task: &str, json: bool) -> Result<()> {
    let (ctx, mut container) = load(manifest)?;
    let path = TaskPath::parse(task)?;
    let graph = TaskGraph::build(&mut container, std::slice::from_ref(&path))?;
    ctx.metrics().flush();
    let order = graph.build_order()?;
    let resolved = graph
        .resolved(&path)
        .with_context(|| format!("Task '{}' not found.", path))?;

    let names = |paths: &std::collections::BTreeSet<TaskPath>| -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    };
    let output = DepsOutput {
        task: path.to_string(),
        depends_on: names(&resolved.depends_on),
        must_run_after: names(&resolved.must_run_after),
        should_run_after: names(&resolved.should_run_after),
        finalized_by: names(&resolved.finalized_by),
        build_order: order.iter().map(|p| p.to_string()).collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("🕸️  {}", output.task);
    for (label, tasks) in [
        ("dependsOn", &output.depends_on),
        ("mustRunAfter", &output.must_run_after),
        ("shouldRunAfter", &output.should_run_after),
        ("finalizedBy", &output.finalized_by),
    ] {
        if !tasks.is_empty() {
            println!("   {}: {}", label, tasks.join(", "));
        }
    }
    println!();
    println!("🔨 Build Order (dependencies first):");
    for (i, task) in output.build_order.iter().enumerate() {
        println!("   {}. {}", i + 1, task);
    }
    Ok(())
}

fn report(manifest: &Path, task: &str) -> Result<()> {
    let (ctx, container) = load_all(manifest)?;
    let path = TaskPath::parse(task)?;
    if !container.contains(&path) {
        bail!("Task '{}' not found.", path);
    }
    let analysis = analyze(&ctx, &container)?
        .into_iter()
        .find(|analysis| analysis.task == path)
        .with_context(|| format!("Task '{}' not found.", path))?;
    println!("{}", analysis.report.to_json()?);
    Ok(())
}

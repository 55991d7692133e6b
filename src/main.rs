use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use treepatch::action::PatchAction;
use treepatch::util::PathMatcher;
use treepatch::{digest, patch_format, runner};
use treepatch::{ConsoleUi, PatchSpec, ValidationOption};

const BACKUP_FILES_DIR: &str = "files";
const JOURNAL_FILE: &str = "applied.bin";

#[derive(Parser)]
#[command(name = "treepatch", about = "Directory tree patch creator, applier and reverter")]
struct Cli {
    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch by comparing old and new directories
    Create {
        /// Path to the old (original) directory
        #[arg(long)]
        old: PathBuf,
        /// Path to the new (updated) directory
        #[arg(long)]
        new: PathBuf,
        /// Output path for the patch file
        #[arg(long, short)]
        output: PathBuf,
        /// JSON file with patch policy (patterns, versions, root)
        #[arg(long)]
        spec: Option<PathBuf>,
        /// Require the target to match the old tree exactly
        #[arg(long)]
        strict: bool,
        /// Glob of paths to leave out of the patch (repeatable)
        #[arg(long)]
        ignore: Vec<String>,
    },
    /// Check a target directory against a patch without changing it
    Validate {
        /// Path to the target directory
        #[arg(long)]
        target: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
    },
    /// Apply a patch to a target directory
    Apply {
        /// Path to the target directory to patch
        #[arg(long)]
        target: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Directory for pre-images; required to revert later
        #[arg(long)]
        backup: Option<PathBuf>,
        /// Answer for a validation result, as PATH=OPTION (repeatable)
        #[arg(long, value_parser = parse_resolution)]
        resolve: Vec<(String, ValidationOption)>,
        /// Ignore every error that can be ignored
        #[arg(long)]
        ignore_errors: bool,
    },
    /// Undo an applied patch from its backup directory
    Revert {
        /// Path to the patched directory
        #[arg(long)]
        target: PathBuf,
        /// Path to the patch file that was applied
        #[arg(long, short)]
        patch: PathBuf,
        /// Backup directory given to `apply`
        #[arg(long)]
        backup: PathBuf,
    },
    /// Print the signature of a file, or of every entry under a directory
    Digest { path: PathBuf },
}

fn parse_resolution(s: &str) -> Result<(String, ValidationOption), String> {
    let (path, option) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected PATH=OPTION, got '{s}'"))?;
    Ok((path.to_string(), option.parse()?))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Run blocking engine work off the async runtime; Ctrl-C flips the UI's
/// cancel flag so the engine stops at its next check.
async fn run_blocking<T, F>(ui: ConsoleUi, work: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&ConsoleUi) -> anyhow::Result<T> + Send + 'static,
{
    let cancel = ui.cancel_flag();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            cancel.store(true, Ordering::SeqCst);
        }
    });
    let result = tokio::task::spawn_blocking(move || work(&ui)).await;
    watcher.abort();
    result.context("Engine task panicked")?
}

fn print_summary(summary: treepatch::PatchSummary, elapsed: f64) {
    println!("{summary}");
    println!("  Time elapsed: {elapsed:.3}s");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Create {
            old,
            new,
            output,
            spec,
            strict,
            ignore,
        } => {
            println!("Creating patch...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let mut patch_spec = match &spec {
                Some(file) => PatchSpec::from_json_file(file)
                    .with_context(|| format!("Failed to load {}", file.display()))?,
                None => PatchSpec::default(),
            };
            patch_spec.old_folder = old;
            patch_spec.new_folder = new;
            patch_spec.strict |= strict;
            patch_spec.ignored_files.extend(ignore);

            let start = Instant::now();
            let patch = run_blocking(ConsoleUi::default(), move |ui| {
                runner::create(&patch_spec, &output, ui).context("Failed to create patch")
            })
            .await?;

            println!("\nPatch created successfully!");
            print_summary(patch.summary(), start.elapsed().as_secs_f64());
        }
        Commands::Validate { target, patch } => {
            let prep = run_blocking(ConsoleUi::default(), move |ui| {
                runner::prepare(&patch, &target, ui, None).context("Failed to validate target")
            })
            .await?;

            if prep.validation_results.is_empty() {
                println!("Target is ready to patch.");
            } else {
                for result in &prep.validation_results {
                    println!("{result}");
                }
                bail!("{} validation result(s) need attention", prep.validation_results.len());
            }
        }
        Commands::Apply {
            target,
            patch,
            backup,
            resolve,
            ignore_errors,
        } => {
            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());

            let options: HashMap<String, ValidationOption> = resolve.into_iter().collect();
            let ui = ConsoleUi::new(options, ignore_errors);
            let start = Instant::now();
            let (summary, result) = run_blocking(ui, move |ui| {
                let prep = runner::prepare(&patch, &target, ui, None)
                    .context("Failed to prepare patch")?;
                let files = backup.as_ref().map(|dir| dir.join(BACKUP_FILES_DIR));
                let result = runner::apply(&prep, &HashMap::new(), files.as_deref(), ui);
                if let Some(dir) = &backup {
                    write_journal(dir, &result.actions_to_revert())?;
                }
                Ok((prep.patch.summary(), result))
            })
            .await?;

            if let Some(err) = result.error {
                if result.applied_actions.is_empty() && result.failed_action.is_none() {
                    return Err(err).context("Patch not applied");
                }
                return Err(err).context(format!(
                    "Patch failed after {} action(s); run `revert` with the same backup directory to undo",
                    result.applied_actions.len()
                ));
            }

            println!("\nPatch applied successfully!");
            println!("  Actions executed: {}", result.applied_actions.len());
            print_summary(summary, start.elapsed().as_secs_f64());
        }
        Commands::Revert {
            target,
            patch,
            backup,
        } => {
            println!("Reverting patch...");
            println!("  Target: {}", target.display());
            println!("  Backup: {}", backup.display());

            let start = Instant::now();
            let reverted = run_blocking(ConsoleUi::default(), move |ui| {
                let (patch, payload) = patch_format::read_patch_file(&patch)
                    .with_context(|| format!("Failed to read {}", patch.display()))?;
                let actions: Vec<PatchAction> =
                    patch_format::read_journal(&backup.join(JOURNAL_FILE))
                        .context("No applied-actions journal in backup directory")?;
                let prep = runner::PreparationResult {
                    patch,
                    payload,
                    target,
                    validation_results: Vec::new(),
                };
                runner::revert(&prep, &actions, &backup.join(BACKUP_FILES_DIR), ui)
                    .context("Revert incomplete")?;
                Ok(actions.len())
            })
            .await?;

            println!("\nPatch reverted successfully!");
            println!("  Actions reverted: {reverted}");
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Digest { path } => print_digests(&path)?,
    }

    Ok(())
}

fn write_journal(backup: &Path, actions: &[PatchAction]) -> anyhow::Result<()> {
    std::fs::create_dir_all(backup)
        .with_context(|| format!("Failed to create {}", backup.display()))?;
    patch_format::write_journal(&backup.join(JOURNAL_FILE), &actions.to_vec())
        .context("Failed to write applied-actions journal")
}

fn print_digests(path: &Path) -> anyhow::Result<()> {
    if path.is_dir() {
        let digests = digest::digest_files(path, &PathMatcher::empty())
            .with_context(|| format!("Failed to digest {}", path.display()))?;
        for (relative_path, signature) in digests {
            println!("{signature}  {relative_path}");
        }
    } else {
        let signature = digest::digest_path(path)
            .with_context(|| format!("Failed to digest {}", path.display()))?;
        println!("{signature}  {}", path.display());
    }
    Ok(())
}

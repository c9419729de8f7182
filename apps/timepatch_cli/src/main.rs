use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dialoguer::{Confirm, Input};
use indicatif::{ProgressBar, ProgressStyle};
use timepatch_adapters::configuration;
use timepatch_adapters::telemetry::{self, LogFormat};
use timepatch_adapters::{CpkRepacker, CtrContainerReader, MagicContainerProbe, VcdiffApplier};
use timepatch_core::entities::{PatchReport, TargetOutcome};
use timepatch_core::layout::OverrideLayout;
use timepatch_core::use_cases::{ApplyPatchUseCase, PatchProgress, PatchRequest, PatchStage};
use tracing::{error, info};

/// Applies a Time Travelers patch file to a decrypted game image and writes
/// a LayeredFS folder for it.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Decrypted game image (.3ds or .cia)
    game: Option<PathBuf>,

    /// Patch file (.pat)
    patch: Option<PathBuf>,

    /// Output root; the title folder is created inside it
    output: Option<PathBuf>,

    /// Print the run report as JSON and log as JSON
    #[arg(long, default_value = "false")]
    json: bool,

    /// Never prompt: missing paths are an error, existing output is overwritten
    #[arg(short, long, default_value = "false")]
    yes: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let settings = configuration::get_configuration().context("configuration loading failed")?;

    let format = if cli.json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    let _guard = telemetry::init_subscriber("timepatch", &settings.log_level, format)
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))?;

    let game_path = resolve_path(cli.game, "Game image (.3ds or .cia)", None, cli.yes)?;
    let patch_path = resolve_path(cli.patch, "Patch file (.pat)", None, cli.yes)?;
    let output_path = resolve_path(
        cli.output,
        "Output folder",
        settings.output.directory.as_deref(),
        cli.yes,
    )?;
    let output_path = absolute(&output_path)?;

    let title_dir = OverrideLayout::new(&output_path).title_dir().to_path_buf();
    if title_dir.exists() && !cli.yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "{} already exists, overwrite the patched files in it?",
                title_dir.display()
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_on_signal.store(true, Ordering::SeqCst);
        }
    });

    let use_case = ApplyPatchUseCase::new(
        Arc::new(MagicContainerProbe),
        Arc::new(CtrContainerReader),
        Arc::new(CpkRepacker),
        Arc::new(VcdiffApplier::new(settings.delta.verify_checksums)),
    )
    .with_bundle_verification(settings.bundle.verify_checksums);

    let request = PatchRequest {
        game_path,
        patch_path,
        output_path,
    };

    let pb = if cli.json {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% {msg}")?
                .progress_chars("#>-"),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    };

    let pb_clone = pb.clone();
    let progress = move |progress: PatchProgress| {
        pb_clone.set_position(progress.overall_progress as u64);
        pb_clone.set_message(describe(&progress.stage));
    };

    let result = use_case.run(&request, progress, cancel).await;
    pb.finish_and_clear();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "patch run failed");
            return Err(anyhow::anyhow!(e).context("patching failed"));
        }
    };
    info!(
        patched = report.patched.len(),
        dropped = report.dropped.len(),
        failed = report.failed.len(),
        "patch run finished"
    );

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
        println!("{}", report.output_dir.display());
    }

    Ok(())
}

/// Use the given path, or ask for one unless prompting is disabled.
fn resolve_path(
    given: Option<PathBuf>,
    prompt: &str,
    default: Option<&Path>,
    no_prompt: bool,
) -> anyhow::Result<PathBuf> {
    if let Some(path) = given {
        return Ok(path);
    }
    if no_prompt {
        return match default {
            Some(path) => Ok(path.to_path_buf()),
            None => anyhow::bail!("{} is required with --yes", prompt),
        };
    }

    let mut input = Input::<String>::new().with_prompt(prompt);
    if let Some(path) = default {
        input = input.default(path.display().to_string());
    }
    let answer = input.interact_text()?;
    Ok(PathBuf::from(answer.trim()))
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

fn describe(stage: &PatchStage) -> String {
    match stage {
        PatchStage::LoadingPatch => "Loading patch file".to_string(),
        PatchStage::OpeningGame => "Opening game image".to_string(),
        PatchStage::OpeningPartition => "Reading GameData.cxi".to_string(),
        PatchStage::LoadingArchive => "Reading resource archive".to_string(),
        PatchStage::PatchingEntry { index, total, path } => {
            format!("[{}/{}] {}", index, total, path)
        }
        PatchStage::SavingArchive => "Writing patch.cpk".to_string(),
        PatchStage::PatchingTarget(target) => format!("Patching {}", target),
        PatchStage::Completed => "Done".to_string(),
    }
}

fn print_summary(report: &PatchReport) {
    println!(
        "Patched {} files of the {} image ({} without a patch were left out).",
        report.patched.len(),
        report.container,
        report.dropped.len()
    );

    if !report.failed.is_empty() {
        println!("{} files could not be patched:", report.failed.len());
        for failed in report.failed.iter().take(10) {
            println!("  {}: {}", failed.path, failed.error);
        }
        if report.failed.len() > 10 {
            println!("  ... and {} more", report.failed.len() - 10);
        }
    }

    for (target, outcome) in &report.targets {
        match outcome {
            TargetOutcome::Written { .. } => println!("  {}: patched", target),
            TargetOutcome::NoPatch => println!("  {}: no patch", target),
            TargetOutcome::TargetMissing => println!("  {}: not found in game image", target),
            TargetOutcome::Failed { error } => println!("  {}: FAILED ({})", target, error),
        }
    }
}

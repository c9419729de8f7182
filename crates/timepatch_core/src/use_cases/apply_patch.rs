use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::instrument;

use crate::entities::{
    find_entry, ArchiveEntry, ContainerEntry, ContainerKind, FailedEntry, FlatTarget,
    PatchDecision, PatchReport, TargetOutcome, GAME_DATA_PATH, RESOURCE_ARCHIVE_PATH,
};
use crate::error::{DeltaError, Error};
use crate::layout::OverrideLayout;
use crate::manifest::PatchManifest;
use crate::ports::{ArchiveRepacker, ArchiveState, ContainerProbe, ContainerReader, DeltaApplier};
use crate::source::ByteSource;

/// Stage of a patch run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchStage {
    /// Opening and validating the patch file
    LoadingPatch,
    /// Identifying and listing the game image
    OpeningGame,
    /// Listing the executable partition
    OpeningPartition,
    /// Reading the resource archive's entry table
    LoadingArchive,
    /// Deciding and applying the patch of one archive entry; `index` counts
    /// from 1
    PatchingEntry {
        index: usize,
        total: usize,
        path: String,
    },
    /// Writing patch.cpk
    SavingArchive,
    /// Patching code.bin or exheader.bin
    PatchingTarget(FlatTarget),
    /// Run finished
    Completed,
}

/// Progress information for a patch run
#[derive(Debug, Clone)]
pub struct PatchProgress {
    pub stage: PatchStage,
    pub overall_progress: f64,
}

impl PatchProgress {
    fn at(stage: PatchStage, overall_progress: f64) -> Self {
        Self {
            stage,
            overall_progress,
        }
    }
}

/// Inputs of a patch run
#[derive(Debug, Clone)]
pub struct PatchRequest {
    pub game_path: PathBuf,
    pub patch_path: PathBuf,
    pub output_path: PathBuf,
}

/// Archive-wide share of the overall progress, the rest is split between
/// loading and the flat targets.
const ENTRY_PROGRESS_START: f64 = 20.0;
const ENTRY_PROGRESS_SPAN: f64 = 65.0;

/// Builds a LayeredFS patch tree from a game image and a patch file:
/// - Patch file loading and validation
/// - Game image identification and partition listing
/// - Per-entry patching of the resource archive
/// - Archive repacking into romfs/patch.cpk
/// - code.bin and exheader.bin patching
///
/// Steps run strictly one after another. Container parsing, delta decoding
/// and archive writing run on the blocking pool.
pub struct ApplyPatchUseCase<P, R, A, D>
where
    P: ContainerProbe,
    R: ContainerReader + 'static,
    A: ArchiveRepacker + 'static,
    D: DeltaApplier + 'static,
{
    probe: Arc<P>,
    reader: Arc<R>,
    repacker: Arc<A>,
    applier: Arc<D>,
    verify_bundle: bool,
}

impl<P, R, A, D> ApplyPatchUseCase<P, R, A, D>
where
    P: ContainerProbe,
    R: ContainerReader + 'static,
    A: ArchiveRepacker + 'static,
    D: DeltaApplier + 'static,
{
    pub fn new(probe: Arc<P>, reader: Arc<R>, repacker: Arc<A>, applier: Arc<D>) -> Self {
        Self {
            probe,
            reader,
            repacker,
            applier,
            verify_bundle: true,
        }
    }

    /// Whether payload checksums are verified when the patch file is opened.
    pub fn with_bundle_verification(mut self, verify: bool) -> Self {
        self.verify_bundle = verify;
        self
    }

    /// Run the whole pipeline.
    ///
    /// `Err` means the run was aborted. Files written by steps that completed
    /// before the error are left on disk. Per-entry and per-target failures
    /// are part of the returned report instead.
    #[instrument(skip_all, fields(game = ?request.game_path, patch = ?request.patch_path))]
    pub async fn run<F>(
        &self,
        request: &PatchRequest,
        progress: F,
        cancel: Arc<AtomicBool>,
    ) -> Result<PatchReport, Error>
    where
        F: Fn(PatchProgress) + Send + Sync + Clone + 'static,
    {
        // Step 1: patch file
        progress(PatchProgress::at(PatchStage::LoadingPatch, 0.0));
        let patch_path = request.patch_path.clone();
        let verify = self.verify_bundle;
        let manifest =
            Arc::new(blocking(move || PatchManifest::open_with(&patch_path, verify)).await?);
        check_cancelled(&cancel)?;

        // Step 2: game image
        progress(PatchProgress::at(PatchStage::OpeningGame, 5.0));
        let (kind, partitions) = self.load_partitions(&request.game_path).await?;
        check_cancelled(&cancel)?;

        let layout = OverrideLayout::new(&request.output_path);
        layout.prepare().await?;

        // Steps 3-4: executable partition
        progress(PatchProgress::at(PatchStage::OpeningPartition, 10.0));
        let game_data = require_entry(&partitions, GAME_DATA_PATH, &request.game_path)?;
        let reader = self.reader.clone();
        let files = blocking(move || reader.load_filesystem(game_data)).await?;
        drop(partitions);
        check_cancelled(&cancel)?;

        let archive = require_entry(&files, RESOURCE_ARCHIVE_PATH, &request.game_path)?;

        // Step 5: resource archive
        progress(PatchProgress::at(PatchStage::LoadingArchive, 15.0));
        let repacker = self.repacker.clone();
        let state = blocking(move || repacker.load(archive)).await?;
        check_cancelled(&cancel)?;

        // Steps 6-7: per-entry patching and repack
        let summary = {
            let manifest = manifest.clone();
            let applier = self.applier.clone();
            let layout = layout.clone();
            let progress = progress.clone();
            let cancel = cancel.clone();
            blocking(move || repack_archive(state, &manifest, &*applier, &layout, &progress, &cancel))
                .await?
        };

        // Step 8: flat targets
        let mut targets = Vec::with_capacity(FlatTarget::ALL.len());
        for (i, target) in FlatTarget::ALL.into_iter().enumerate() {
            check_cancelled(&cancel)?;
            progress(PatchProgress::at(
                PatchStage::PatchingTarget(target),
                ENTRY_PROGRESS_START + ENTRY_PROGRESS_SPAN + 5.0 * (i as f64 + 1.0),
            ));
            let outcome = self.patch_target(target, &manifest, &files, &layout).await?;
            targets.push((target, outcome));
        }

        progress(PatchProgress::at(PatchStage::Completed, 100.0));

        tracing::info!(
            "Patched {} entries, dropped {}, failed {}",
            summary.patched.len(),
            summary.dropped.len(),
            summary.failed.len()
        );

        Ok(PatchReport {
            container: kind,
            output_dir: layout.title_dir().to_path_buf(),
            archive_path: layout.archive_path(),
            patched: summary.patched,
            dropped: summary.dropped,
            failed: summary.failed,
            targets,
        })
    }

    async fn load_partitions(
        &self,
        game_path: &Path,
    ) -> Result<(ContainerKind, Vec<ContainerEntry>), Error> {
        match tokio::fs::try_exists(game_path).await {
            Ok(true) => {}
            Ok(false) => return Err(Error::GameImageNotFound(game_path.to_path_buf())),
            Err(source) => {
                return Err(Error::GameImageUnreadable {
                    path: game_path.to_path_buf(),
                    source,
                })
            }
        }

        let image = ByteSource::open(game_path).map_err(|source| Error::GameImageUnreadable {
            path: game_path.to_path_buf(),
            source,
        })?;

        let kind = self.probe.probe(game_path).await?;
        tracing::info!("Game image {:?} identified as {}", game_path, kind);

        let reader = self.reader.clone();
        let partitions = blocking(move || reader.load_partitions(image, kind)).await?;
        Ok((kind, partitions))
    }

    async fn patch_target(
        &self,
        target: FlatTarget,
        manifest: &Arc<PatchManifest>,
        files: &[ContainerEntry],
        layout: &OverrideLayout,
    ) -> Result<TargetOutcome, Error> {
        if !manifest.has_patch(target.manifest_key()) {
            tracing::debug!("No patch for {}", target);
            return Ok(TargetOutcome::NoPatch);
        }

        let Some(entry) = find_entry(files, target.container_path()) else {
            tracing::info!("{} not found in game data, skipping", target.container_path());
            return Ok(TargetOutcome::TargetMissing);
        };

        let source = entry.data.clone();
        let manifest = manifest.clone();
        let applier = self.applier.clone();
        let result = blocking(move || {
            let base = source.read_all().map_err(|e| DeltaError::Base(e.to_string()));
            let base = match base {
                Ok(base) => base,
                Err(e) => return Ok(Err(e)),
            };
            let mut delta = manifest.get_patch(target.manifest_key())?;
            let result = applier.apply(&base, &mut delta);
            drop(delta);
            Ok(result)
        })
        .await?;

        match result {
            Ok(content) => {
                let path = layout.write_target(target, &content).await?;
                tracing::info!("Wrote {:?}", path);
                Ok(TargetOutcome::Written { path })
            }
            Err(e) => {
                tracing::error!("An error occurred applying the patch to {}: {}", target, e);
                Ok(TargetOutcome::Failed {
                    error: e.to_string(),
                })
            }
        }
    }
}

#[derive(Debug, Default)]
struct RepackSummary {
    patched: Vec<String>,
    dropped: Vec<String>,
    failed: Vec<FailedEntry>,
}

/// Decide the fate of one archive entry. Only bundle I/O errors are fatal.
fn decide_entry<S: ArchiveState, D: DeltaApplier + ?Sized>(
    state: &S,
    entry: &ArchiveEntry,
    manifest: &PatchManifest,
    applier: &D,
) -> Result<PatchDecision, Error> {
    if !manifest.has_patch(&entry.path) {
        return Ok(PatchDecision::Drop);
    }

    let base = match state.read_entry(entry.index) {
        Ok(base) => base,
        Err(e) => return Ok(PatchDecision::Failed(DeltaError::Base(e.to_string()))),
    };

    let mut delta = manifest.get_patch(&entry.path)?;
    let result = applier.apply(&base, &mut delta);
    drop(delta);

    Ok(match result {
        Ok(content) => PatchDecision::Patched(content),
        Err(e) => PatchDecision::Failed(e),
    })
}

fn repack_archive<S, D, F>(
    mut state: S,
    manifest: &PatchManifest,
    applier: &D,
    layout: &OverrideLayout,
    progress: &F,
    cancel: &AtomicBool,
) -> Result<RepackSummary, Error>
where
    S: ArchiveState,
    D: DeltaApplier + ?Sized,
    F: Fn(PatchProgress),
{
    let entries = state.entries();
    let total = entries.len();
    let mut summary = RepackSummary::default();
    let mut keep = Vec::new();

    tracing::info!("Applying patches to {} archive entries", total);

    for (i, entry) in entries.into_iter().enumerate() {
        check_cancelled(cancel)?;
        progress(PatchProgress::at(
            PatchStage::PatchingEntry {
                index: i + 1,
                total,
                path: entry.path.clone(),
            },
            ENTRY_PROGRESS_START + ENTRY_PROGRESS_SPAN * i as f64 / total.max(1) as f64,
        ));

        match decide_entry(&state, &entry, manifest, applier)? {
            PatchDecision::Drop => {
                state.delete_entry(entry.index)?;
                summary.dropped.push(entry.path);
            }
            PatchDecision::Patched(content) => {
                state.set_content(entry.index, content)?;
                keep.push(entry.index);
                summary.patched.push(entry.path);
            }
            PatchDecision::Failed(e) => {
                tracing::error!(
                    "An error occurred applying the patch to {:?}: {}",
                    entry.path,
                    e
                );
                summary.failed.push(FailedEntry {
                    path: entry.path,
                    error: e.to_string(),
                });
            }
        }
    }

    check_cancelled(cancel)?;
    progress(PatchProgress::at(
        PatchStage::SavingArchive,
        ENTRY_PROGRESS_START + ENTRY_PROGRESS_SPAN,
    ));

    let mut writer = BufWriter::new(layout.create_archive_file()?);
    state.save(&mut writer, &keep)?;
    writer.flush()?;

    tracing::info!(
        "Saved {:?} with {} entries",
        layout.archive_path(),
        keep.len()
    );

    Ok(summary)
}

fn require_entry(
    entries: &[ContainerEntry],
    path: &str,
    game_path: &Path,
) -> Result<ByteSource, Error> {
    find_entry(entries, path)
        .map(|entry| entry.data.clone())
        .ok_or_else(|| Error::EntryNotFound {
            entry: path.trim_start_matches('/').to_string(),
            container: game_path.display().to_string(),
        })
}

fn check_cancelled(cancel: &AtomicBool) -> Result<(), Error> {
    if cancel.load(Ordering::Relaxed) {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Run synchronous work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Task(e.to_string()))?
}

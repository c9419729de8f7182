use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::DeltaError;
use crate::source::ByteSource;

/// Title ID of Time Travelers, used as the LayeredFS folder name.
pub const TITLE_ID: &str = "000400000008C600";

/// Executable partition inside the game card or installable.
pub const GAME_DATA_PATH: &str = "/GameData.cxi";

/// Resource pack inside the executable partition's RomFS.
pub const RESOURCE_ARCHIVE_PATH: &str = "/RomFs/tt1_ctr.cpk";

/// Top-level container format of a game image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// Game card dump (`.3ds`)
    Ncsd,
    /// Installable archive (`.cia`)
    Cia,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Ncsd => write!(f, "NCSD"),
            ContainerKind::Cia => write!(f, "CIA"),
        }
    }
}

/// A named file inside a container.
#[derive(Debug, Clone)]
pub struct ContainerEntry {
    pub path: String,
    pub data: ByteSource,
}

impl ContainerEntry {
    pub fn new(path: impl Into<String>, data: ByteSource) -> Self {
        Self {
            path: path.into(),
            data,
        }
    }
}

/// Find an entry by exact logical path.
pub fn find_entry<'a>(entries: &'a [ContainerEntry], path: &str) -> Option<&'a ContainerEntry> {
    entries.iter().find(|entry| entry.path == path)
}

/// An entry of the inner resource archive, as listed by its entry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Position in the archive's entry table
    pub index: usize,
    /// Full logical path, e.g. `/script/main.bin`
    pub path: String,
    /// Size of the decoded content
    pub size: u64,
}

/// Single files patched outside of the resource archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlatTarget {
    Code,
    ExHeader,
}

impl FlatTarget {
    pub const ALL: [FlatTarget; 2] = [FlatTarget::Code, FlatTarget::ExHeader];

    /// Key of the target's delta in the patch bundle.
    pub fn manifest_key(self) -> &'static str {
        match self {
            FlatTarget::Code => ".code",
            FlatTarget::ExHeader => "exheader.bin",
        }
    }

    /// Path of the base file in the executable partition.
    pub fn container_path(self) -> &'static str {
        match self {
            FlatTarget::Code => "/ExeFs/.code",
            FlatTarget::ExHeader => "/ExHeader.bin",
        }
    }

    /// File name inside the title folder.
    pub fn output_file_name(self) -> &'static str {
        match self {
            FlatTarget::Code => "code.bin",
            FlatTarget::ExHeader => "exheader.bin",
        }
    }
}

impl fmt::Display for FlatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.output_file_name())
    }
}

/// What happens to one archive entry, decided once per entry.
#[derive(Debug)]
pub enum PatchDecision {
    /// No patch in the bundle; the entry is left out of the output.
    Drop,
    /// The delta applied; the entry ships with these bytes.
    Patched(Vec<u8>),
    /// The delta did not apply; the entry is reported and left out.
    Failed(DeltaError),
}

impl PatchDecision {
    /// Whether the entry is written to the output archive.
    pub fn is_kept(&self) -> bool {
        matches!(self, PatchDecision::Patched(_))
    }
}

/// Result of one flat target patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TargetOutcome {
    Written { path: PathBuf },
    NoPatch,
    TargetMissing,
    Failed { error: String },
}

/// An archive entry whose delta could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub path: String,
    pub error: String,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchReport {
    pub container: ContainerKind,
    /// The LayeredFS title folder
    pub output_dir: PathBuf,
    pub archive_path: PathBuf,
    pub patched: Vec<String>,
    pub dropped: Vec<String>,
    pub failed: Vec<FailedEntry>,
    pub targets: Vec<(FlatTarget, TargetOutcome)>,
}

impl PatchReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
            || self
                .targets
                .iter()
                .any(|(_, outcome)| matches!(outcome, TargetOutcome::Failed { .. }))
    }

    pub fn target(&self, target: FlatTarget) -> Option<&TargetOutcome> {
        self.targets
            .iter()
            .find(|(t, _)| *t == target)
            .map(|(_, outcome)| outcome)
    }
}

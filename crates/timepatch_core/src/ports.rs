use std::io::{Read, Write};
use std::path::Path;

use async_trait::async_trait;

use crate::entities::{ArchiveEntry, ContainerEntry, ContainerKind};
use crate::error::{DeltaError, Error};
use crate::source::ByteSource;

// ============================================================================
// Container Ports
// ============================================================================

/// Classifies a game image as one of the two top-level container formats.
#[async_trait]
pub trait ContainerProbe: Send + Sync {
    /// May open and close its own handle on `image_path`.
    async fn probe(&self, image_path: &Path) -> Result<ContainerKind, Error>;
}

/// Lists the files of the game image and of its executable partition.
pub trait ContainerReader: Send + Sync {
    /// Partitions of the top-level container, e.g. `/GameData.cxi`
    fn load_partitions(
        &self,
        image: ByteSource,
        kind: ContainerKind,
    ) -> Result<Vec<ContainerEntry>, Error>;

    /// Files of an executable partition, e.g. `/ExeFs/.code`, `/RomFs/tt1_ctr.cpk`
    fn load_filesystem(&self, partition: ByteSource) -> Result<Vec<ContainerEntry>, Error>;
}

// ============================================================================
// Archive Ports
// ============================================================================

/// Loads the inner resource archive into an editable state.
pub trait ArchiveRepacker: Send + Sync {
    type State: ArchiveState + Send + 'static;

    fn load(&self, archive: ByteSource) -> Result<Self::State, Error>;
}

/// In-memory entry table of an inner archive plus pending edits.
pub trait ArchiveState {
    /// Entries in entry-table order
    fn entries(&self) -> Vec<ArchiveEntry>;

    /// Current content of an entry, decoded.
    ///
    /// Returns the staged content if [`ArchiveState::set_content`] was called.
    fn read_entry(&self, index: usize) -> Result<Vec<u8>, Error>;

    fn delete_entry(&mut self, index: usize) -> Result<(), Error>;

    fn set_content(&mut self, index: usize, content: Vec<u8>) -> Result<(), Error>;

    /// Serialize an archive holding only the entries in `keep`.
    ///
    /// Fails if `keep` names a deleted entry.
    fn save(&self, output: &mut dyn Write, keep: &[usize]) -> Result<(), Error>;
}

// ============================================================================
// Delta Port
// ============================================================================

/// Reconstructs a target from a base and a delta.
pub trait DeltaApplier: Send + Sync {
    /// Consumes `delta` fully. `base` is never modified. On error any partial
    /// output has already been discarded.
    fn apply(&self, base: &[u8], delta: &mut dyn Read) -> Result<Vec<u8>, DeltaError>;
}

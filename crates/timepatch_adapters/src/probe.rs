use std::io;
use std::path::Path;

use async_trait::async_trait;
use timepatch_core::entities::ContainerKind;
use timepatch_core::ports::ContainerProbe;
use timepatch_core::Error;
use tokio::io::AsyncReadExt;

const NCSD_MAGIC_OFFSET: usize = 0x100;
const NCSD_MAGIC: &[u8; 4] = b"NCSD";

/// Tells `.3ds` game card dumps from `.cia` installables by the NCSD magic.
#[derive(Debug, Default, Clone)]
pub struct MagicContainerProbe;

#[async_trait]
impl ContainerProbe for MagicContainerProbe {
    async fn probe(&self, image_path: &Path) -> Result<ContainerKind, Error> {
        let mut file = tokio::fs::File::open(image_path)
            .await
            .map_err(|source| Error::GameImageUnreadable {
                path: image_path.to_path_buf(),
                source,
            })?;

        let mut head = [0u8; NCSD_MAGIC_OFFSET + 4];
        let kind = match file.read_exact(&mut head).await {
            Ok(_) if &head[NCSD_MAGIC_OFFSET..] == NCSD_MAGIC => ContainerKind::Ncsd,
            Ok(_) => ContainerKind::Cia,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => ContainerKind::Cia,
            Err(e) => return Err(e.into()),
        };

        tracing::debug!("Probed {:?} as {}", image_path, kind);
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn image(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    #[tokio::test]
    async fn test_ncsd_magic() {
        let mut bytes = vec![0u8; 0x200];
        bytes[0x100..0x104].copy_from_slice(b"NCSD");
        let file = image(&bytes);

        let kind = MagicContainerProbe.probe(file.path()).await.unwrap();
        assert_eq!(kind, ContainerKind::Ncsd);
    }

    #[tokio::test]
    async fn test_other_magic_is_cia() {
        let mut bytes = vec![0u8; 0x200];
        bytes[0x100..0x104].copy_from_slice(b"NCCH");
        let file = image(&bytes);

        let kind = MagicContainerProbe.probe(file.path()).await.unwrap();
        assert_eq!(kind, ContainerKind::Cia);
    }

    #[tokio::test]
    async fn test_short_file_is_cia() {
        let file = image(b"tiny");

        let kind = MagicContainerProbe.probe(file.path()).await.unwrap();
        assert_eq!(kind, ContainerKind::Cia);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();

        let result = MagicContainerProbe.probe(&dir.path().join("none.3ds")).await;
        assert!(matches!(result, Err(Error::GameImageUnreadable { .. })));
    }
}

//! The patch pipeline driven by the real adapters: an NCSD image holding a
//! CPK, a `.pat` bundle of VCDIFF deltas, and a LayeredFS tree on disk.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};
use oxidelta::compress::encoder::{encode_all, CompressOptions};
use oxidelta::vcdiff::varint;
use tempfile::{NamedTempFile, TempDir};
use timepatch_core::entities::{ContainerKind, FlatTarget, PatchReport, TargetOutcome};
use timepatch_core::manifest::{BUNDLE_MAGIC, BUNDLE_VERSION, HEADER_SIZE};
use timepatch_core::ports::{ArchiveRepacker, ArchiveState};
use timepatch_core::source::ByteSource;
use timepatch_core::use_cases::{ApplyPatchUseCase, PatchProgress, PatchRequest};

use crate::cpk::fixtures::cpk;
use crate::ctr::fixtures::{ncch, ncsd};
use crate::{CpkRepacker, CtrContainerReader, MagicContainerProbe, VcdiffApplier};

const BASE_A: &[u8] = b"entry a: the original dialogue line";
const BASE_B: &[u8] = b"entry b: menu labels and other strings";
const BASE_C: &[u8] = b"entry c: untouched sound bank";
const TARGET_A: &[u8] = b"entry a: the translated dialogue line";
const TARGET_B: &[u8] = b"entry b: menu labels, now a good deal longer than before";

fn delta(base: &[u8], target: &[u8]) -> Vec<u8> {
    encode_all(Vec::new(), base, target, CompressOptions::default()).unwrap()
}

/// One window whose section lengths overflow a u64 when added up.
fn overflowing_delta() -> Vec<u8> {
    let mut window = Vec::new();
    varint::write_u64(&mut window, 5).unwrap();
    window.push(0);
    for len in [1u64 << 63, 1 << 63, 5] {
        varint::write_u64(&mut window, len).unwrap();
    }
    window.extend_from_slice(b"hello");

    let mut out = vec![0xD6, 0xC3, 0xC4, 0x00, 0x00, 0x00];
    varint::write_u64(&mut out, window.len() as u64).unwrap();
    out.extend_from_slice(&window);
    out
}

fn bundle(patches: &[(&str, Vec<u8>)]) -> NamedTempFile {
    let index_len: usize = patches.iter().map(|(p, _)| 2 + p.len() + 20).sum();
    let mut offset = HEADER_SIZE + index_len as u64 + 4;

    let mut out = BUNDLE_MAGIC.to_vec();
    out.write_u16::<BigEndian>(BUNDLE_VERSION).unwrap();
    out.write_u16::<BigEndian>(0).unwrap();
    out.write_u32::<BigEndian>(patches.len() as u32).unwrap();
    for (path, payload) in patches {
        out.write_u16::<BigEndian>(path.len() as u16).unwrap();
        out.extend_from_slice(path.as_bytes());
        out.write_u64::<BigEndian>(offset).unwrap();
        out.write_u64::<BigEndian>(payload.len() as u64).unwrap();
        out.write_u32::<BigEndian>(crc32fast::hash(payload)).unwrap();
        offset += payload.len() as u64;
    }
    let index_crc = crc32fast::hash(&out);
    out.write_u32::<BigEndian>(index_crc).unwrap();
    for (_, payload) in patches {
        out.extend_from_slice(payload);
    }

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&out).unwrap();
    file.flush().unwrap();
    file
}

fn game_image() -> NamedTempFile {
    let archive = cpk(
        &[
            ("", "a", BASE_A, BASE_A.len() as u64),
            ("", "b", BASE_B, BASE_B.len() as u64),
            ("", "c", BASE_C, BASE_C.len() as u64),
        ],
        true,
        false,
    );
    let partition = ncch(
        &[0xE0; 0x800],
        &[(".code", b"CODE1")],
        &[("/tt1_ctr.cpk", &archive)],
        true,
    );
    let image = ncsd(&[(0, &partition)]);

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&image).unwrap();
    file.flush().unwrap();
    file
}

async fn run(game: &NamedTempFile, patches: &NamedTempFile, output: &TempDir) -> PatchReport {
    let use_case = ApplyPatchUseCase::new(
        Arc::new(MagicContainerProbe),
        Arc::new(CtrContainerReader),
        Arc::new(CpkRepacker),
        Arc::new(VcdiffApplier::default()),
    );
    let request = PatchRequest {
        game_path: game.path().to_path_buf(),
        patch_path: patches.path().to_path_buf(),
        output_path: output.path().to_path_buf(),
    };

    use_case
        .run(&request, |_: PatchProgress| {}, Arc::new(AtomicBool::new(false)))
        .await
        .unwrap()
}

fn read_archive(report: &PatchReport) -> Vec<(String, Vec<u8>)> {
    let state = CpkRepacker
        .load(ByteSource::open(&report.archive_path).unwrap())
        .unwrap();
    state
        .entries()
        .into_iter()
        .map(|entry| {
            let content = state.read_entry(entry.index).unwrap();
            (entry.path, content)
        })
        .collect()
}

#[tokio::test]
async fn test_patches_ncsd_image_into_layered_fs() {
    let game = game_image();
    let patches = bundle(&[
        ("/a", delta(BASE_A, TARGET_A)),
        ("/b", delta(BASE_B, TARGET_B)),
        (".code", delta(b"CODE1", b"CODE2")),
    ]);
    let output = tempfile::tempdir().unwrap();

    let report = run(&game, &patches, &output).await;

    assert_eq!(report.container, ContainerKind::Ncsd);
    assert_eq!(report.patched, vec!["/a", "/b"]);
    assert_eq!(report.dropped, vec!["/c"]);
    assert!(report.failed.is_empty());

    let title_dir = output.path().join("000400000008C600");
    assert_eq!(report.output_dir, title_dir);
    assert_eq!(report.archive_path, title_dir.join("romfs/patch.cpk"));
    assert_eq!(
        read_archive(&report),
        vec![
            ("/a".to_string(), TARGET_A.to_vec()),
            ("/b".to_string(), TARGET_B.to_vec()),
        ]
    );

    assert_eq!(std::fs::read(title_dir.join("code.bin")).unwrap(), b"CODE2");
    assert!(!title_dir.join("exheader.bin").exists());
    assert!(report
        .targets
        .contains(&(FlatTarget::ExHeader, TargetOutcome::NoPatch)));
}

#[tokio::test]
async fn test_malformed_delta_fails_only_its_entry() {
    let game = game_image();
    let patches = bundle(&[
        ("/a", delta(BASE_A, TARGET_A)),
        ("/b", overflowing_delta()),
    ]);
    let output = tempfile::tempdir().unwrap();

    let report = run(&game, &patches, &output).await;

    assert_eq!(report.patched, vec!["/a"]);
    assert_eq!(report.dropped, vec!["/c"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].path, "/b");
    assert_eq!(
        read_archive(&report),
        vec![("/a".to_string(), TARGET_A.to_vec())]
    );
}

#![no_main]

use libfuzzer_sys::fuzz_target;
use timepatch_adapters::cpk::CpkArchive;
use timepatch_core::ports::ArchiveState;
use timepatch_core::source::ByteSource;

fuzz_target!(|data: &[u8]| {
    let Ok(archive) = CpkArchive::load(ByteSource::from_vec(data.to_vec())) else {
        return;
    };
    let entries = archive.entries();
    for entry in &entries {
        let _ = archive.read_entry(entry.index);
    }
    let keep: Vec<usize> = entries.iter().map(|e| e.index).collect();
    let _ = archive.save(&mut std::io::sink(), &keep);
});

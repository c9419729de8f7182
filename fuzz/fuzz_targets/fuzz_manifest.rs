#![no_main]

use std::io::{Read, Write};

use libfuzzer_sys::fuzz_target;
use timepatch_core::manifest::PatchManifest;

fuzz_target!(|data: &[u8]| {
    let Ok(mut file) = tempfile::NamedTempFile::new() else {
        return;
    };
    if file.write_all(data).is_err() {
        return;
    }

    // Opening may fail on arbitrary input, but must not panic. Every payload
    // of a bundle that opens must be readable to its declared length.
    if let Ok(manifest) = PatchManifest::open(file.path()) {
        for entry in manifest.entries() {
            if let Ok(mut stream) = manifest.get_patch(&entry.path) {
                let mut payload = Vec::new();
                let _ = stream.read_to_end(&mut payload);
            }
        }
    }
});

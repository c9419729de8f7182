#![no_main]

use libfuzzer_sys::fuzz_target;
use timepatch_adapters::VcdiffApplier;
use timepatch_core::ports::DeltaApplier;

fuzz_target!(|data: &[u8]| {
    // First byte picks how much of the rest serves as the base
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let (base, mut delta) = rest.split_at((split as usize).min(rest.len()));
    let _ = VcdiffApplier::new(true).apply(base, &mut delta);
});

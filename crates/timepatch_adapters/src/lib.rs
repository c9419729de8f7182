pub mod configuration;
pub mod cpk;
pub mod ctr;
pub mod probe;
pub mod telemetry;
pub mod vcdiff;

#[cfg(test)]
mod end_to_end;

// Re-exports for convenience
pub use cpk::CpkRepacker;
pub use ctr::CtrContainerReader;
pub use probe::MagicContainerProbe;
pub use vcdiff::VcdiffApplier;

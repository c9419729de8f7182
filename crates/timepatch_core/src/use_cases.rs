mod apply_patch;

pub use apply_patch::{ApplyPatchUseCase, PatchProgress, PatchRequest, PatchStage};

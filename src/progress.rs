//! Progress reporting types for `Loader::load`'s `on_progress` callback
//! (spec §4.1, §4.9).

/// Coarse stage a `load()` call is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ParsingManifest,
    CheckingIntegrity,
    MaterializingLayer,
    MaterializingHead,
    Done,
}

/// One progress tick. `layer`/`total_layers` are only meaningful during
/// `Stage::MaterializingLayer`; `fraction` is always in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub layer: Option<usize>,
    pub total_layers: Option<usize>,
    pub fraction: f32,
}

impl ProgressEvent {
    pub fn stage_only(stage: Stage, fraction: f32) -> Self {
        Self { stage, layer: None, total_layers: None, fraction }
    }

    pub fn layer(stage: Stage, layer: usize, total_layers: usize) -> Self {
        let fraction = if total_layers == 0 { 1.0 } else { layer as f32 / total_layers as f32 };
        Self { stage, layer: Some(layer), total_layers: Some(total_layers), fraction }
    }
}

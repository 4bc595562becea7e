use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Rescanning,
    Importing,
    Patching,
    CopyingAssets,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Rescanning => "Rescanning",
            Stage::Importing => "Importing",
            Stage::Patching => "Patching",
            Stage::CopyingAssets => "Copying assets",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub stage: Stage,
    pub current: usize,
    pub total: usize,
    pub detail: Option<String>,
}

impl Progress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 1.0;
        }
        (self.current as f32 / self.total as f32).clamp(0.0, 1.0)
    }
}

/// Progress sink: ticks plus an optional message.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

pub fn report(
    progress: Option<&ProgressCallback>,
    stage: Stage,
    current: usize,
    total: usize,
    detail: Option<String>,
) {
    if let Some(progress) = progress {
        progress(Progress {
            stage,
            current,
            total,
            detail,
        });
    }
}

pub mod backend_ops;
pub mod commands;
pub mod descriptors;
pub mod reply;
pub mod runtime;
pub mod trigger;

use crate::canvas::ExtendVariant;
use crate::pipeline::descriptors::OperationDescriptor;

/// Which image a stage operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageInput {
    /// The untouched source image of the request.
    Original,
    /// The first image of the most recent image-producing stage.
    PreviousFirst,
}

/// Mask sent along with an img2img stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageMask {
    /// No mask field; the prompt (or the backend) decides the edited region.
    None,
    /// The mask produced by the most recent preview stage.
    Preview,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOp {
    Img2Img {
        op: &'static OperationDescriptor,
        prompt: String,
        mask: StageMask,
    },
    /// Downscale, extend, whiten the mask, then inpaint the extended region.
    Outpaint {
        op: &'static OperationDescriptor,
        prompt: String,
        variant: ExtendVariant,
        scale: f64,
    },
    /// Ask the backend for a selection preview; yields a mask, not replies.
    PreviewMask {
        op: &'static OperationDescriptor,
        prompt: String,
    },
    Upscale {
        factor: u8,
    },
}

impl StageOp {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Img2Img { .. } => "img2img",
            Self::Outpaint { .. } => "outpaint",
            Self::PreviewMask { .. } => "preview_mask",
            Self::Upscale { .. } => "upscale",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub label: String,
    pub input: StageInput,
    pub op: StageOp,
}

impl StageSpec {
    pub fn new(label: impl Into<String>, input: StageInput, op: StageOp) -> Self {
        Self {
            label: label.into(),
            input,
            op,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    pub stages: Vec<StageSpec>,
}

impl StagePlan {
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self { stages }
    }

    pub fn labels(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.label.as_str()).collect()
    }
}

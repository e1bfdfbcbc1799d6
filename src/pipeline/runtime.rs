//! Stage executor. Runs a [`StagePlan`] for one request while the caller
//! holds an admission ticket, forwarding every produced image as soon as its
//! stage returns. Each blocking backend job keeps its own handle on the
//! ticket, so dropping the caller's future never frees capacity while a job
//! is still running on the backend.

use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::access::Sender;
use crate::canvas::{build_selection_mask, preview_map_from_batch, prepare_outpaint, CanvasError};
use crate::pipeline::backend_ops::{
    BackendOpsError, Img2ImgRequest, SharedImageBackendOps, UpscaleRequest,
};
use crate::pipeline::commands::{Command, CommandError};
use crate::pipeline::descriptors::OperationDescriptor;
use crate::pipeline::reply::{Reply, ReplySink};
use crate::pipeline::{StageInput, StageMask, StageOp, StagePlan, StageSpec};
use crate::worker::gate::{GateError, Ticket};
use crate::worker::{RequestLifecycle, RequestState};

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub request_id: Uuid,
    pub requester: Sender,
    pub source: Option<DynamicImage>,
    pub command: Command,
}

/// Carried from stage to stage within one request; never shared.
#[derive(Debug, Default)]
struct StageState {
    previous_first: Option<DynamicImage>,
    preview_mask: Option<GrayImage>,
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    backend: SharedImageBackendOps,
}

impl PipelineOrchestrator {
    pub fn new(backend: SharedImageBackendOps) -> Self {
        Self { backend }
    }

    /// Execute `plan` in order and return how many images were forwarded.
    /// The first failing stage aborts the rest; images already forwarded
    /// stay delivered.
    pub async fn run(
        &self,
        request: &PipelineRequest,
        plan: &StagePlan,
        sink: &dyn ReplySink,
        lifecycle: &mut RequestLifecycle,
        ticket: &Arc<Ticket>,
    ) -> Result<usize, PipelineError> {
        if plan.stages.is_empty() {
            return Ok(0);
        }
        let source = request
            .source
            .as_ref()
            .ok_or_else(|| PipelineError::MalformedInput(String::from("no image attached")))?;

        let mut state = StageState::default();
        let mut forwarded = 0_usize;
        for (index, stage) in plan.stages.iter().enumerate() {
            info!(
                request_id = %request.request_id,
                stage = stage.label.as_str(),
                kind = stage.op.kind(),
                index,
                "running pipeline stage"
            );
            let input = match stage.input {
                StageInput::Original => source.clone(),
                StageInput::PreviousFirst => state.previous_first.clone().ok_or_else(|| {
                    PipelineError::InvalidPlan(format!(
                        "stage '{}' reads a previous output but none exists",
                        stage.label
                    ))
                })?,
            };

            let produced = self.run_stage(stage, input, &mut state, ticket).await?;
            if let Some(first) = produced.first() {
                state.previous_first = Some(first.clone());
            }
            for image in produced {
                sink.send(Reply::Image(image));
                lifecycle.advance(RequestState::Streaming);
                forwarded += 1;
            }
        }
        debug!(request_id = %request.request_id, forwarded, "pipeline finished");
        Ok(forwarded)
    }

    /// Returns the images to forward; preview stages return none.
    async fn run_stage(
        &self,
        stage: &StageSpec,
        input: DynamicImage,
        state: &mut StageState,
        ticket: &Arc<Ticket>,
    ) -> Result<Vec<DynamicImage>, PipelineError> {
        let backend = self.backend.clone();
        let held = ticket.clone();
        match &stage.op {
            StageOp::Img2Img { op, prompt, mask } => {
                let mask = match mask {
                    StageMask::None => None,
                    StageMask::Preview => {
                        let mask = state.preview_mask.as_ref().ok_or_else(|| {
                            PipelineError::InvalidPlan(format!(
                                "stage '{}' needs a preview mask but none was produced",
                                stage.label
                            ))
                        })?;
                        Some(fit_mask(mask, &input))
                    }
                };
                let request = img2img_request(*op, prompt, input, mask);
                run_blocking(held, move || Ok(backend.img2img(&request)?)).await
            }
            StageOp::Outpaint {
                op,
                prompt,
                variant,
                scale,
            } => {
                let (op, prompt, variant, scale) = (*op, prompt.clone(), *variant, *scale);
                run_blocking(held, move || {
                    let prepared = prepare_outpaint(&input, scale, variant, op.params.padding)?;
                    debug!(
                        variant = variant.as_str(),
                        placed_width = prepared.geometry.placed_width,
                        placed_height = prepared.geometry.placed_height,
                        "outpaint canvas prepared"
                    );
                    let request =
                        img2img_request(op, &prompt, prepared.canvas, Some(prepared.mask));
                    Ok(backend.img2img(&request)?)
                })
                .await
            }
            StageOp::PreviewMask { op, prompt } => {
                let request = img2img_request(*op, prompt, input, None);
                let params = op.params;
                let mask = run_blocking(held, move || {
                    let batch = backend.img2img(&request)?;
                    let preview = preview_map_from_batch(&batch)?;
                    Ok(build_selection_mask(
                        &[preview],
                        &[],
                        params.precision,
                        params.padding,
                    )?)
                })
                .await?;
                state.preview_mask = Some(mask);
                Ok(Vec::new())
            }
            StageOp::Upscale { factor } => {
                let request = UpscaleRequest {
                    image: input,
                    factor: *factor,
                };
                run_blocking(held, move || Ok(vec![backend.upscale(&request)?])).await
            }
        }
    }
}

fn img2img_request(
    op: &'static OperationDescriptor,
    prompt: &str,
    image: DynamicImage,
    mask: Option<GrayImage>,
) -> Img2ImgRequest {
    Img2ImgRequest {
        operation: op.name,
        images: vec![image],
        prompt: prompt.to_string(),
        negative_prompt: op.negative_prompt.to_string(),
        mask,
        params: op.params,
    }
}

/// The backend may return a preview at a different size than the image it
/// will be applied to.
fn fit_mask(mask: &GrayImage, target: &DynamicImage) -> GrayImage {
    let (width, height) = (target.width(), target.height());
    if mask.dimensions() == (width, height) {
        return mask.clone();
    }
    image::imageops::resize(mask, width, height, FilterType::Nearest)
}

/// `ticket` moves into the job and is dropped only when `work` returns.
async fn run_blocking<T, F>(ticket: Arc<Ticket>, work: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let _ticket = ticket;
        work()
    })
    .await
        .map_err(|e| PipelineError::Worker(e.to_string()))?
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("sender is not allowed to use this bot")]
    PermissionDenied,
    #[error("queue is full ({depth} of {cap})")]
    QueueSaturated { depth: usize, cap: usize },
    #[error("service is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Backend(#[from] BackendOpsError),
    #[error("invalid image geometry: {0}")]
    Geometry(String),
    #[error("{0}")]
    MalformedInput(String),
    #[error("no selection preview in a batch of {batch_len}")]
    NoMaskAvailable { batch_len: usize },
    #[error("invalid stage plan: {0}")]
    InvalidPlan(String),
    #[error("pipeline worker failed: {0}")]
    Worker(String),
}

impl PipelineError {
    /// Text sent back to the requester.
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied => String::from("Sorry, you are not allowed to use this bot."),
            Self::QueueSaturated { .. } => {
                String::from("The queue is full right now. Please try again in a few minutes.")
            }
            Self::ShuttingDown => {
                String::from("The bot is restarting. Please send your request again shortly.")
            }
            Self::Backend(_) | Self::Worker(_) => {
                String::from("The image generator failed to process your request. Please try again.")
            }
            Self::Geometry(detail) => format!("This image cannot be processed: {detail}"),
            Self::MalformedInput(detail) => detail.clone(),
            Self::NoMaskAvailable { .. } => {
                String::from("Could not find the requested object in the image.")
            }
            Self::InvalidPlan(_) => String::from("Internal error while planning your request."),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::QueueSaturated { .. } => "queue_saturated",
            Self::ShuttingDown => "shutting_down",
            Self::Backend(_) => "backend_failed",
            Self::Geometry(_) => "invalid_geometry",
            Self::MalformedInput(_) => "malformed_input",
            Self::NoMaskAvailable { .. } => "no_mask_available",
            Self::InvalidPlan(_) => "invalid_plan",
            Self::Worker(_) => "worker_failed",
        }
    }

    /// Errors raised before a ticket is granted reject the request; the rest
    /// fail it.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied
                | Self::QueueSaturated { .. }
                | Self::ShuttingDown
                | Self::MalformedInput(_)
        )
    }
}

impl From<CanvasError> for PipelineError {
    fn from(value: CanvasError) -> Self {
        match value {
            CanvasError::Geometry(detail) => Self::Geometry(detail),
            CanvasError::NoMaskAvailable { batch_len } => Self::NoMaskAvailable { batch_len },
        }
    }
}

impl From<CommandError> for PipelineError {
    fn from(value: CommandError) -> Self {
        Self::MalformedInput(value.to_string())
    }
}

impl From<GateError> for PipelineError {
    fn from(value: GateError) -> Self {
        match value {
            GateError::Saturated { depth, cap } => Self::QueueSaturated { depth, cap },
            GateError::Closed => Self::ShuttingDown,
        }
    }
}

//! Entry point for one inbound chat request: permission check, command
//! routing, admission through the gate, then the stage pipeline.

use std::sync::Arc;

use image::DynamicImage;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::{Sender, SharedAccessPolicy};
use crate::pipeline::commands::{help_text, Command};
use crate::pipeline::reply::{Reply, ReplySink};
use crate::pipeline::runtime::{PipelineError, PipelineOrchestrator, PipelineRequest};
use crate::worker::gate::{AdmissionGate, QueueEntry};
use crate::worker::{RequestLifecycle, RequestState};

#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub sender: Sender,
    pub caption: Option<String>,
    /// Attached photos; only the first one is processed.
    pub images: Vec<DynamicImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestOutcome {
    pub request_id: Uuid,
    pub command: &'static str,
    pub state: &'static str,
    pub images_forwarded: usize,
    /// Entries that were already admitted or waiting when this one arrived.
    pub queued_behind: usize,
}

#[derive(Clone)]
pub struct RequestRouter {
    access: SharedAccessPolicy,
    gate: AdmissionGate,
    orchestrator: PipelineOrchestrator,
    max_queue_depth: i64,
}

impl RequestRouter {
    pub fn new(
        access: SharedAccessPolicy,
        gate: AdmissionGate,
        orchestrator: PipelineOrchestrator,
        max_queue_depth: i64,
    ) -> Self {
        Self {
            access,
            gate,
            orchestrator,
            max_queue_depth,
        }
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Handle one request end to end. Every error is also reported to the
    /// requester through `sink` before it is returned.
    pub async fn handle(
        &self,
        inbound: InboundRequest,
        sink: &dyn ReplySink,
    ) -> Result<RequestOutcome, PipelineError> {
        match self.admit(inbound, sink)? {
            Admission::Answered(outcome) => Ok(outcome),
            Admission::Queued(admitted) => admitted.run(sink).await,
        }
    }

    /// Everything that can be decided without waiting: permission, command
    /// routing, help replies and the queue cap. On success the request holds
    /// a place in the gate and the "N ahead of you" notice has been sent.
    pub fn admit(
        &self,
        inbound: InboundRequest,
        sink: &dyn ReplySink,
    ) -> Result<Admission, PipelineError> {
        let mut lifecycle = RequestLifecycle::new();
        info!(
            request_id = %lifecycle.request_id(),
            sender_id = inbound.sender.id,
            sender = inbound.sender.name.as_str(),
            images = inbound.images.len(),
            "received request"
        );
        match self.screen(inbound, sink, &mut lifecycle) {
            Ok(admission) => Ok(admission),
            Err(err) => Err(report_failure(&mut lifecycle, err, sink)),
        }
    }

    fn screen(
        &self,
        inbound: InboundRequest,
        sink: &dyn ReplySink,
        lifecycle: &mut RequestLifecycle,
    ) -> Result<Admission, PipelineError> {
        if !self.access.is_allowed(&inbound.sender) {
            return Err(PipelineError::PermissionDenied);
        }

        let command = Command::parse(inbound.caption.as_deref(), !inbound.images.is_empty())?;
        let request_id = lifecycle.request_id();
        if command == Command::Help {
            sink.send(Reply::Text(help_text()));
            lifecycle.advance(RequestState::Done);
            return Ok(Admission::Answered(outcome(
                request_id, &command, lifecycle, 0, 0,
            )));
        }

        let entry = self.gate.enter(self.max_queue_depth)?;
        lifecycle.advance(RequestState::Queued);
        let queued_behind = entry.ahead();
        if queued_behind > 0 {
            sink.send(Reply::Text(format!(
                "Your request is queued. {queued_behind} ahead of you."
            )));
        }

        Ok(Admission::Queued(AdmittedRequest {
            orchestrator: self.orchestrator.clone(),
            lifecycle: lifecycle.clone(),
            entry,
            request: PipelineRequest {
                request_id,
                requester: inbound.sender,
                source: inbound.images.into_iter().next(),
                command,
            },
            queued_behind,
        }))
    }
}

/// Result of [`RequestRouter::admit`].
#[derive(Debug)]
pub enum Admission {
    /// Fully answered without touching the backend.
    Answered(RequestOutcome),
    Queued(AdmittedRequest),
}

/// A request holding a place in the gate. Dropping it before [`run`]
/// completes gives the place back.
///
/// [`run`]: AdmittedRequest::run
pub struct AdmittedRequest {
    orchestrator: PipelineOrchestrator,
    lifecycle: RequestLifecycle,
    entry: QueueEntry,
    request: PipelineRequest,
    queued_behind: usize,
}

impl std::fmt::Debug for AdmittedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmittedRequest")
            .field("request_id", &self.request.request_id)
            .field("command", &self.request.command.name())
            .field("queued_behind", &self.queued_behind)
            .finish()
    }
}

impl AdmittedRequest {
    pub fn request_id(&self) -> Uuid {
        self.request.request_id
    }

    pub fn queued_behind(&self) -> usize {
        self.queued_behind
    }

    /// Wait for a ticket, then run the command's stages.
    pub async fn run(self, sink: &dyn ReplySink) -> Result<RequestOutcome, PipelineError> {
        let Self {
            orchestrator,
            mut lifecycle,
            entry,
            request,
            queued_behind,
        } = self;
        match execute(&orchestrator, entry, &request, sink, &mut lifecycle).await {
            Ok(forwarded) => {
                lifecycle.advance(RequestState::Done);
                Ok(outcome(
                    request.request_id,
                    &request.command,
                    &lifecycle,
                    forwarded,
                    queued_behind,
                ))
            }
            Err(err) => Err(report_failure(&mut lifecycle, err, sink)),
        }
    }
}

async fn execute(
    orchestrator: &PipelineOrchestrator,
    entry: QueueEntry,
    request: &PipelineRequest,
    sink: &dyn ReplySink,
    lifecycle: &mut RequestLifecycle,
) -> Result<usize, PipelineError> {
    let ticket = Arc::new(entry.acquire().await?);
    lifecycle.advance(RequestState::Running);
    info!(
        request_id = %request.request_id,
        command = request.command.name(),
        ticket = ticket.number(),
        "request admitted"
    );
    let plan = request.command.stage_plan();
    orchestrator
        .run(request, &plan, sink, lifecycle, &ticket)
        .await
}

fn report_failure(
    lifecycle: &mut RequestLifecycle,
    err: PipelineError,
    sink: &dyn ReplySink,
) -> PipelineError {
    let next = if err.is_rejection() {
        RequestState::Rejected
    } else {
        RequestState::Failed
    };
    lifecycle.advance(next);
    warn!(
        request_id = %lifecycle.request_id(),
        code = err.code(),
        state = lifecycle.state().as_str(),
        error = %err,
        "request did not complete"
    );
    sink.send(Reply::Text(err.user_message()));
    err
}

fn outcome(
    request_id: Uuid,
    command: &Command,
    lifecycle: &RequestLifecycle,
    images_forwarded: usize,
    queued_behind: usize,
) -> RequestOutcome {
    RequestOutcome {
        request_id,
        command: command.name(),
        state: lifecycle.state().as_str(),
        images_forwarded,
        queued_behind,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::access::AllowList;
    use crate::pipeline::backend_ops::{
        BackendOpsError, ImageBackendOps, Img2ImgRequest, UpscaleRequest,
    };
    use crate::pipeline::reply::BufferedReplySink;
    use image::{Rgb, RgbImage};

    #[derive(Default)]
    struct EchoBackend {
        operations: Mutex<Vec<&'static str>>,
    }

    impl ImageBackendOps for EchoBackend {
        fn img2img(
            &self,
            request: &Img2ImgRequest,
        ) -> Result<Vec<DynamicImage>, BackendOpsError> {
            self.operations
                .lock()
                .expect("operations")
                .push(request.operation);
            Ok(request.images.clone())
        }

        fn upscale(&self, request: &UpscaleRequest) -> Result<DynamicImage, BackendOpsError> {
            self.operations.lock().expect("operations").push("upscale");
            Ok(request.image.clone())
        }
    }

    fn router(allowed: &str, backend: Arc<EchoBackend>) -> RequestRouter {
        RequestRouter::new(
            Arc::new(AllowList::parse(allowed, "-").expect("policy")),
            AdmissionGate::new(1),
            PipelineOrchestrator::new(backend),
            10,
        )
    }

    fn photo() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 20, Rgb([1, 2, 3])))
    }

    fn texts(replies: &[Reply]) -> Vec<&str> {
        replies
            .iter()
            .filter_map(|reply| match reply {
                Reply::Text(text) => Some(text.as_str()),
                Reply::Image(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn denied_sender_never_touches_gate_or_backend() {
        let backend = Arc::new(EchoBackend::default());
        let router = router("7", backend.clone());
        let sink = BufferedReplySink::new();

        let err = router
            .handle(
                InboundRequest {
                    sender: Sender::new(8, "stranger"),
                    caption: None,
                    images: vec![photo()],
                },
                &sink,
            )
            .await
            .expect_err("sender should be denied");

        assert!(matches!(err, PipelineError::PermissionDenied));
        assert_eq!(router.gate().tickets_issued(), 0);
        assert!(backend.operations.lock().expect("operations").is_empty());
        let replies = sink.take();
        assert_eq!(replies.len(), 1);
        assert_eq!(texts(&replies), vec![err.user_message().as_str()]);
    }

    #[tokio::test]
    async fn help_replies_without_admission() {
        let router = router("*", Arc::new(EchoBackend::default()));
        let sink = BufferedReplySink::new();
        let outcome = router
            .handle(
                InboundRequest {
                    sender: Sender::new(1, "a"),
                    caption: Some(String::from("/help")),
                    images: Vec::new(),
                },
                &sink,
            )
            .await
            .expect("help");
        assert_eq!(outcome.state, "done");
        assert_eq!(router.gate().tickets_issued(), 0);
        assert!(texts(&sink.take())[0].contains("/outpaint"));
    }

    #[tokio::test]
    async fn photo_runs_outpaint_and_releases_ticket() {
        let backend = Arc::new(EchoBackend::default());
        let router = router("*", backend.clone());
        let sink = BufferedReplySink::new();
        let outcome = router
            .handle(
                InboundRequest {
                    sender: Sender::new(1, "a"),
                    caption: None,
                    images: vec![photo()],
                },
                &sink,
            )
            .await
            .expect("outpaint");

        assert_eq!(outcome.command, "outpaint");
        assert_eq!(outcome.images_forwarded, 2);
        assert_eq!(outcome.state, "done");
        assert_eq!(
            *backend.operations.lock().expect("operations"),
            vec!["outpaint", "upscale"]
        );
        assert_eq!(router.gate().size(), 0);
        assert_eq!(router.gate().queue_depth(), 0);
    }

    #[tokio::test]
    async fn malformed_caption_is_rejected_before_queueing() {
        let router = router("*", Arc::new(EchoBackend::default()));
        let sink = BufferedReplySink::new();
        let err = router
            .handle(
                InboundRequest {
                    sender: Sender::new(1, "a"),
                    caption: Some(String::from("/upscale 12")),
                    images: vec![photo()],
                },
                &sink,
            )
            .await
            .expect_err("bad factor");
        assert!(matches!(err, PipelineError::MalformedInput(_)));
        assert_eq!(router.gate().tickets_issued(), 0);
        assert_eq!(sink.take().len(), 1);
    }

    #[tokio::test]
    async fn outcome_serializes_with_request_id() {
        let router = router("*", Arc::new(EchoBackend::default()));
        let outcome = router
            .handle(
                InboundRequest {
                    sender: Sender::new(1, "a"),
                    caption: Some(String::from("/upscale")),
                    images: vec![photo()],
                },
                &BufferedReplySink::new(),
            )
            .await
            .expect("upscale");

        let value = serde_json::to_value(&outcome).expect("outcome serializes");
        assert_eq!(
            value["request_id"].as_str(),
            Some(outcome.request_id.to_string().as_str())
        );
        assert_eq!(value["command"], "upscale");
        assert_eq!(value["state"], "done");
    }

    #[tokio::test]
    async fn dropping_an_admitted_request_returns_its_place() {
        let router = router("*", Arc::new(EchoBackend::default()));
        let sink = BufferedReplySink::new();
        let admission = router
            .admit(
                InboundRequest {
                    sender: Sender::new(1, "a"),
                    caption: None,
                    images: vec![photo()],
                },
                &sink,
            )
            .expect("admitted");
        let Admission::Queued(admitted) = admission else {
            panic!("photo requests are queued");
        };
        assert_eq!(admitted.queued_behind(), 0);
        assert_eq!(router.gate().queue_depth(), 1);

        drop(admitted);
        assert_eq!(router.gate().queue_depth(), 0);
        assert_eq!(router.gate().tickets_issued(), 0);
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn closed_gate_rejects_with_shutdown_message() {
        let router = router("*", Arc::new(EchoBackend::default()));
        router.gate().close();
        let sink = BufferedReplySink::new();
        let err = router
            .handle(
                InboundRequest {
                    sender: Sender::new(1, "a"),
                    caption: Some(String::from("/upscale")),
                    images: vec![photo()],
                },
                &sink,
            )
            .await
            .expect_err("closed");
        assert!(matches!(err, PipelineError::ShuttingDown));
    }
}

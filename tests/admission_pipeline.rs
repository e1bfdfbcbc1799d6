use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{DynamicImage, Rgb, RgbImage};

use sdbot_core::access::{AllowList, Sender};
use sdbot_core::pipeline::backend_ops::{
    BackendOpsError, ImageBackendOps, Img2ImgRequest, UpscaleRequest,
};
use sdbot_core::pipeline::reply::{BufferedReplySink, Reply};
use sdbot_core::pipeline::runtime::{PipelineError, PipelineOrchestrator};
use sdbot_core::pipeline::trigger::{InboundRequest, RequestRouter};
use sdbot_core::worker::gate::AdmissionGate;

/// Echoes its input after `delay`, logging `start`/`end` events tagged with
/// the red channel of the input's first pixel.
struct SlowBackend {
    delay: Duration,
    events: Mutex<Vec<String>>,
}

impl SlowBackend {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            events: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().expect("events lock").clone()
    }

    fn record(&self, image: &DynamicImage) {
        let tag = image.to_rgb8().get_pixel(0, 0).0[0];
        self.events
            .lock()
            .expect("events lock")
            .push(format!("start {tag}"));
        std::thread::sleep(self.delay);
        self.events
            .lock()
            .expect("events lock")
            .push(format!("end {tag}"));
    }
}

impl ImageBackendOps for SlowBackend {
    fn img2img(&self, request: &Img2ImgRequest) -> Result<Vec<DynamicImage>, BackendOpsError> {
        self.record(&request.images[0]);
        Ok(request.images.clone())
    }

    fn upscale(&self, request: &UpscaleRequest) -> Result<DynamicImage, BackendOpsError> {
        self.record(&request.image);
        Ok(request.image.clone())
    }
}

fn router(backend: Arc<SlowBackend>, max_concurrency: i64, max_queue_depth: i64) -> RequestRouter {
    RequestRouter::new(
        Arc::new(AllowList::parse("1,2,3", "-").expect("policy")),
        AdmissionGate::new(max_concurrency),
        PipelineOrchestrator::new(backend),
        max_queue_depth,
    )
}

fn photo(tag: u8) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 20, Rgb([tag, 0, 0])))
}

fn upscale_request(sender: i64, tag: u8) -> InboundRequest {
    InboundRequest {
        sender: Sender::new(sender, format!("user{sender}")),
        caption: Some(String::from("/upscale")),
        images: vec![photo(tag)],
    }
}

fn texts(replies: &[Reply]) -> Vec<String> {
    replies
        .iter()
        .filter_map(|reply| match reply {
            Reply::Text(text) => Some(text.clone()),
            Reply::Image(_) => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_capacity_gate_never_interleaves_backend_calls() {
    let backend = Arc::new(SlowBackend::new(Duration::from_millis(40)));
    let router = router(backend.clone(), 1, 10);

    let mut tasks = Vec::new();
    for (sender, tag) in [(1, 11), (2, 22), (3, 33)] {
        let router = router.clone();
        tasks.push(tokio::spawn(async move {
            let sink = BufferedReplySink::new();
            let outcome = router.handle(upscale_request(sender, tag), &sink).await;
            (outcome, sink.take())
        }));
    }
    for task in tasks {
        let (outcome, replies) = task.await.expect("request task should finish");
        let outcome = outcome.expect("request should succeed");
        assert_eq!(outcome.images_forwarded, 1);
        assert_eq!(
            replies
                .iter()
                .filter(|reply| matches!(reply, Reply::Image(_)))
                .count(),
            1
        );
    }

    let events = backend.events();
    assert_eq!(events.len(), 6);
    for pair in events.chunks(2) {
        let started = pair[0].strip_prefix("start ").expect("start event");
        let ended = pair[1].strip_prefix("end ").expect("end event");
        assert_eq!(started, ended, "backend calls interleaved: {events:?}");
    }
    assert_eq!(router.gate().tickets_issued(), 3);
    assert_eq!(router.gate().size(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiting_request_is_told_its_queue_position() {
    let backend = Arc::new(SlowBackend::new(Duration::from_millis(150)));
    let router = router(backend, 1, 10);

    let first = {
        let router = router.clone();
        tokio::spawn(async move {
            let sink = BufferedReplySink::new();
            router.handle(upscale_request(1, 11), &sink).await
        })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;

    let sink = BufferedReplySink::new();
    let outcome = router
        .handle(upscale_request(2, 22), &sink)
        .await
        .expect("second request should run after the first");
    assert_eq!(outcome.queued_behind, 1);

    let replies = sink.take();
    assert!(matches!(replies.first(), Some(Reply::Text(text)) if text.contains("1 ahead")));
    assert!(matches!(replies.last(), Some(Reply::Image(_))));
    first
        .await
        .expect("first task")
        .expect("first request should succeed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saturated_queue_rejects_immediately() {
    let backend = Arc::new(SlowBackend::new(Duration::from_millis(200)));
    let router = router(backend.clone(), 1, 1);

    let first = {
        let router = router.clone();
        tokio::spawn(async move {
            let sink = BufferedReplySink::new();
            router.handle(upscale_request(1, 11), &sink).await
        })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;

    let sink = BufferedReplySink::new();
    let err = tokio::time::timeout(
        Duration::from_millis(100),
        router.handle(upscale_request(2, 22), &sink),
    )
    .await
    .expect("saturation must not wait for the running request")
    .expect_err("queue is full");
    assert!(matches!(err, PipelineError::QueueSaturated { depth: 1, cap: 1 }));
    assert_eq!(texts(&sink.take()), vec![err.user_message()]);

    first
        .await
        .expect("first task")
        .expect("first request should succeed");
    assert_eq!(router.gate().tickets_issued(), 1);
    assert_eq!(router.gate().queue_depth(), 0);
}

#[tokio::test]
async fn denied_sender_never_receives_a_ticket() {
    let backend = Arc::new(SlowBackend::new(Duration::ZERO));
    let router = router(backend.clone(), 1, 10);
    let sink = BufferedReplySink::new();

    let err = router
        .handle(upscale_request(99, 1), &sink)
        .await
        .expect_err("sender 99 is not on the allow list");

    assert!(matches!(err, PipelineError::PermissionDenied));
    assert_eq!(router.gate().tickets_issued(), 0);
    assert!(backend.events().is_empty());
    let replies = sink.take();
    assert_eq!(replies.len(), 1);
    assert_eq!(texts(&replies), vec![err.user_message()]);
}

#[tokio::test]
async fn closed_gate_tells_requester_to_retry() {
    let backend = Arc::new(SlowBackend::new(Duration::ZERO));
    let router = router(backend, 1, 10);
    router.gate().close();

    let sink = BufferedReplySink::new();
    let err = router
        .handle(upscale_request(1, 1), &sink)
        .await
        .expect_err("closed gate");
    assert!(matches!(err, PipelineError::ShuttingDown));
    assert_eq!(texts(&sink.take()), vec![err.user_message()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aborted_request_keeps_backend_slot_until_its_job_returns() {
    let backend = Arc::new(SlowBackend::new(Duration::from_millis(300)));
    let router = router(backend.clone(), 1, 10);

    let abandoned = {
        let router = router.clone();
        tokio::spawn(async move {
            let sink = BufferedReplySink::new();
            router.handle(upscale_request(1, 11), &sink).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    abandoned.abort();
    assert!(abandoned.await.is_err_and(|err| err.is_cancelled()));
    assert_eq!(router.gate().size(), 1, "running backend job still holds the ticket");

    let sink = BufferedReplySink::new();
    let outcome = router
        .handle(upscale_request(2, 22), &sink)
        .await
        .expect("next request runs once the backend is free");
    assert_eq!(outcome.images_forwarded, 1);

    assert_eq!(
        backend.events(),
        vec!["start 11", "end 11", "start 22", "end 22"]
    );
    assert_eq!(router.gate().size(), 0);
    assert_eq!(router.gate().queue_depth(), 0);
}

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::access::Sender;
use crate::api::error::ErrorKind;
use crate::api::handler_utils::{
    error_response, internal_error, into_json, map_pipeline_error, ApiObject,
};
use crate::api::server::AppState;
use crate::canvas::codec::{decode_base64_image, encode_png_base64, CodecError};
use crate::pipeline::reply::{ChannelReplySink, Reply};
use crate::pipeline::runtime::PipelineError;
use crate::pipeline::trigger::{Admission, AdmittedRequest, InboundRequest, RequestOutcome};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequestInput {
    pub sender: Sender,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyPayload {
    Image { data_base64: String },
    Text { text: String },
}

#[derive(Debug, Clone, Serialize)]
struct SubmitRequestResponse {
    ok: bool,
    request: RequestOutcome,
    replies: Vec<ReplyPayload>,
}

/// Requests rejected before queueing (and help) get one JSON body with the
/// matching status. Admitted requests get `200` and an NDJSON stream: one
/// line per reply as it is produced, then a final `outcome` or `error` line.
pub async fn submit_request_handler(
    State(state): State<AppState>,
    Json(payload): Json<SubmitRequestInput>,
) -> Response {
    let encoded = payload.images;
    let decoded = tokio::task::spawn_blocking(move || {
        encoded
            .iter()
            .map(|image| decode_base64_image(image))
            .collect::<Result<Vec<_>, _>>()
    })
    .await;
    let images = match decoded {
        Ok(Ok(images)) => images,
        Ok(Err(error)) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorKind::Validation,
                "invalid_image",
                format!("Attached image could not be decoded: {error}"),
            )
            .into_response();
        }
        Err(join_error) => {
            return internal_error(format!("image decode task failed: {join_error}"))
                .into_response();
        }
    };

    let (sink, mut replies) = ChannelReplySink::new();
    let admission = state.router.admit(
        InboundRequest {
            sender: payload.sender,
            caption: payload.caption,
            images,
        },
        &sink,
    );
    match admission {
        Ok(Admission::Queued(admitted)) => stream_admitted(admitted, sink, replies),
        Ok(Admission::Answered(request)) => {
            drop(sink);
            match encode_pending(&mut replies).await {
                Ok(replies) => (
                    StatusCode::OK,
                    into_json(SubmitRequestResponse {
                        ok: true,
                        request,
                        replies,
                    }),
                )
                    .into_response(),
                Err(response) => response.into_response(),
            }
        }
        Err(error) => {
            drop(sink);
            let (status, Json(mut body)) = map_pipeline_error(&error);
            match encode_pending(&mut replies).await {
                Ok(replies) => {
                    if let (Some(object), Ok(replies)) =
                        (body.as_object_mut(), serde_json::to_value(&replies))
                    {
                        object.insert(String::from("replies"), replies);
                    }
                    (status, Json(body)).into_response()
                }
                Err(response) => response.into_response(),
            }
        }
    }
}

/// Runs the request in its own task so it finishes (and releases its
/// ticket) on its own schedule even if the client goes away mid-stream.
fn stream_admitted(
    admitted: AdmittedRequest,
    sink: ChannelReplySink,
    mut replies: mpsc::UnboundedReceiver<Reply>,
) -> Response {
    let request_id = admitted.request_id();
    let (lines_tx, lines_rx) = mpsc::unbounded_channel::<Result<String, Infallible>>();

    let running = tokio::spawn(async move { admitted.run(&sink).await });
    tokio::spawn(async move {
        while let Some(reply) = replies.recv().await {
            let line = match tokio::task::spawn_blocking(move || encode_reply(reply)).await {
                Ok(Ok(payload)) => ndjson_line(&payload),
                Ok(Err(error)) => {
                    warn!(request_id = %request_id, error = %error, "reply encoding failed");
                    continue;
                }
                Err(join_error) => {
                    warn!(request_id = %request_id, error = %join_error, "reply encoding task failed");
                    continue;
                }
            };
            if lines_tx.send(Ok(line)).is_err() {
                debug!(request_id = %request_id, "client went away; request keeps running");
                return;
            }
        }

        let trailer = match running.await {
            Ok(Ok(outcome)) => json!({"kind": "outcome", "ok": true, "request": outcome}),
            Ok(Err(error)) => error_line(&error),
            Err(join_error) => {
                warn!(request_id = %request_id, error = %join_error, "request task failed");
                error_line(&PipelineError::Worker(join_error.to_string()))
            }
        };
        let _ = lines_tx.send(Ok(ndjson_line(&trailer)));
    });

    (
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(UnboundedReceiverStream::new(lines_rx)),
    )
        .into_response()
}

/// The error body a rejected request would have received, tagged as the
/// stream's last line and carrying the status it would have had.
fn error_line(error: &PipelineError) -> Value {
    let (status, Json(mut body)) = map_pipeline_error(error);
    if let Some(object) = body.as_object_mut() {
        object.insert(String::from("kind"), json!("error"));
        object.insert(String::from("status"), json!(status.as_u16()));
    }
    body
}

fn ndjson_line(payload: &impl Serialize) -> String {
    let mut line = serde_json::to_string(payload)
        .unwrap_or_else(|_| String::from(r#"{"kind":"error","ok":false}"#));
    line.push('\n');
    line
}

/// Drains whatever the router already sent; only valid once the sink is gone.
async fn encode_pending(
    replies: &mut mpsc::UnboundedReceiver<Reply>,
) -> Result<Vec<ReplyPayload>, ApiObject<Value>> {
    let mut pending = Vec::new();
    while let Ok(reply) = replies.try_recv() {
        pending.push(reply);
    }
    debug!(replies = pending.len(), "encoding replies");
    match tokio::task::spawn_blocking(move || encode_replies(pending)).await {
        Ok(Ok(replies)) => Ok(replies),
        Ok(Err(error)) => Err(internal_error(format!("reply encoding failed: {error}"))),
        Err(join_error) => Err(internal_error(format!(
            "reply encoding task failed: {join_error}"
        ))),
    }
}

fn encode_reply(reply: Reply) -> Result<ReplyPayload, CodecError> {
    match reply {
        Reply::Image(image) => Ok(ReplyPayload::Image {
            data_base64: encode_png_base64(&image)?,
        }),
        Reply::Text(text) => Ok(ReplyPayload::Text { text }),
    }
}

fn encode_replies(replies: Vec<Reply>) -> Result<Vec<ReplyPayload>, CodecError> {
    replies.into_iter().map(encode_reply).collect()
}

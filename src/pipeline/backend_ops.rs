use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, GrayImage};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::canvas::codec::{
    decode_base64_image, encode_mask_base64, encode_png_base64, CodecError,
};
use crate::pipeline::descriptors::{OperationParams, DEFAULT_UPSCALER};

pub const DEFAULT_SAMPLER: &str = "DPM++ SDE Karras";
pub const DEFAULT_STEPS: u32 = 10;
pub const DEFAULT_MASK_BLUR: u32 = 4;
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct Img2ImgRequest {
    /// Operation name, for logs only.
    pub operation: &'static str,
    pub images: Vec<DynamicImage>,
    pub prompt: String,
    pub negative_prompt: String,
    pub mask: Option<GrayImage>,
    pub params: OperationParams,
}

#[derive(Debug, Clone)]
pub struct UpscaleRequest {
    pub image: DynamicImage,
    pub factor: u8,
}

/// Image-generation backend. Calls block; run them off the async runtime.
pub trait ImageBackendOps: Send + Sync + 'static {
    fn img2img(&self, request: &Img2ImgRequest) -> Result<Vec<DynamicImage>, BackendOpsError>;
    fn upscale(&self, request: &UpscaleRequest) -> Result<DynamicImage, BackendOpsError>;
}

pub type SharedImageBackendOps = Arc<dyn ImageBackendOps>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Img2ImgPayload {
    pub init_images: Vec<String>,
    pub prompt: String,
    pub negative_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    pub mask_blur: u32,
    pub inpainting_fill: u8,
    pub denoising_strength: f32,
    pub cfg_scale: f32,
    pub steps: u32,
    pub batch_size: u32,
    pub sampler_name: String,
    pub include_init_images: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpscalePayload {
    pub image: String,
    pub upscaling_resize: u8,
    pub upscaler_1: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Img2ImgResponse {
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub info: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpscaleResponse {
    #[serde(default)]
    pub image: Option<String>,
}

/// HTTP client for an AUTOMATIC1111-compatible web UI.
#[derive(Debug, Clone)]
pub struct WebUiBackendOps {
    base_url: Url,
    sampler: String,
    default_steps: u32,
    upscaler: String,
    timeout: Duration,
}

impl WebUiBackendOps {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            sampler: String::from(DEFAULT_SAMPLER),
            default_steps: DEFAULT_STEPS,
            upscaler: String::from(DEFAULT_UPSCALER),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_sampler(mut self, sampler: impl Into<String>) -> Self {
        self.sampler = sampler.into();
        self
    }

    pub fn with_default_steps(mut self, steps: u32) -> Self {
        self.default_steps = steps;
        self
    }

    pub fn with_upscaler(mut self, upscaler: impl Into<String>) -> Self {
        self.upscaler = upscaler.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, BackendOpsError> {
        self.base_url
            .join(path)
            .map_err(|e| BackendOpsError::Url(e.to_string()))
    }

    pub fn build_img2img_payload(
        &self,
        request: &Img2ImgRequest,
    ) -> Result<Img2ImgPayload, BackendOpsError> {
        if request.images.is_empty() {
            return Err(BackendOpsError::EmptyBatch);
        }
        let init_images = request
            .images
            .iter()
            .map(encode_png_base64)
            .collect::<Result<Vec<_>, _>>()?;
        let mask = request.mask.as_ref().map(encode_mask_base64).transpose()?;
        let params = &request.params;

        Ok(Img2ImgPayload {
            init_images,
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            mask,
            mask_blur: DEFAULT_MASK_BLUR,
            inpainting_fill: params.inpainting_fill.as_wire(),
            denoising_strength: params.denoising_strength,
            cfg_scale: params.cfg_scale,
            steps: params.steps.unwrap_or(self.default_steps),
            batch_size: params.batch_size.max(1),
            sampler_name: self.sampler.clone(),
            include_init_images: false,
        })
    }

    pub fn build_upscale_payload(
        &self,
        request: &UpscaleRequest,
    ) -> Result<UpscalePayload, BackendOpsError> {
        Ok(UpscalePayload {
            image: encode_png_base64(&request.image)?,
            upscaling_resize: request.factor,
            upscaler_1: self.upscaler.clone(),
        })
    }

    fn post_json<P, T>(&self, path: &str, payload: &P) -> Result<T, BackendOpsError>
    where
        P: Serialize,
        T: for<'de> Deserialize<'de>,
    {
        let url = self.endpoint(path)?;
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| BackendOpsError::ClientInit(e.to_string()))?;
        let resp = client
            .post(url.clone())
            .json(payload)
            .send()
            .map_err(|e| BackendOpsError::Http(format!("POST {url} failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let cut = (0..=ERROR_BODY_LIMIT)
                    .rev()
                    .find(|idx| body.is_char_boundary(*idx))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            return Err(BackendOpsError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<T>()
            .map_err(|e| BackendOpsError::Decode(e.to_string()))
    }
}

/// Decode every image of an img2img batch, preserving order.
pub fn parse_img2img_response(
    response: &Img2ImgResponse,
) -> Result<Vec<DynamicImage>, BackendOpsError> {
    if response.images.is_empty() {
        return Err(BackendOpsError::EmptyBatch);
    }
    response
        .images
        .iter()
        .map(|encoded| decode_base64_image(encoded).map_err(BackendOpsError::from))
        .collect()
}

pub fn parse_upscale_response(response: &UpscaleResponse) -> Result<DynamicImage, BackendOpsError> {
    let encoded = response
        .image
        .as_deref()
        .filter(|encoded| !encoded.is_empty())
        .ok_or(BackendOpsError::EmptyBatch)?;
    Ok(decode_base64_image(encoded)?)
}

impl ImageBackendOps for WebUiBackendOps {
    fn img2img(&self, request: &Img2ImgRequest) -> Result<Vec<DynamicImage>, BackendOpsError> {
        let payload = self.build_img2img_payload(request)?;
        debug!(
            operation = request.operation,
            batch_size = payload.batch_size,
            steps = payload.steps,
            masked = payload.mask.is_some(),
            "sending img2img request"
        );
        let response: Img2ImgResponse = self.post_json("sdapi/v1/img2img", &payload)?;
        parse_img2img_response(&response)
    }

    fn upscale(&self, request: &UpscaleRequest) -> Result<DynamicImage, BackendOpsError> {
        let payload = self.build_upscale_payload(request)?;
        debug!(factor = request.factor, upscaler = %payload.upscaler_1, "sending upscale request");
        let response: UpscaleResponse = self.post_json("sdapi/v1/extra-single-image", &payload)?;
        parse_upscale_response(&response)
    }
}

#[derive(Debug, Error)]
pub enum BackendOpsError {
    #[error("backend http client init failed: {0}")]
    ClientInit(String),
    #[error("backend request failed: {0}")]
    Http(String),
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("backend response decode failed: {0}")]
    Decode(String),
    #[error("backend image payload invalid: {0}")]
    Image(#[from] CodecError),
    #[error("backend returned no images")]
    EmptyBatch,
    #[error("invalid backend url: {0}")]
    Url(String),
}

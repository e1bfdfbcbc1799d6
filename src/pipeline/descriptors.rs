//! Pre-baked operation descriptors sent to the image backend.

use serde::Serialize;

/// How the backend seeds the masked region before denoising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InpaintingFill {
    Fill,
    Original,
    LatentNoise,
    LatentNothing,
}

impl InpaintingFill {
    pub fn as_wire(self) -> u8 {
        match self {
            Self::Fill => 0,
            Self::Original => 1,
            Self::LatentNoise => 2,
            Self::LatentNothing => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OperationParams {
    /// Threshold a preview map must exceed to count as selected.
    pub precision: u8,
    pub padding: u32,
    pub denoising_strength: f32,
    pub batch_size: u32,
    pub cfg_scale: f32,
    /// `None` uses the client's configured step count.
    pub steps: Option<u32>,
    pub inpainting_fill: InpaintingFill,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OperationDescriptor {
    pub name: &'static str,
    pub prompt_template: &'static str,
    pub negative_prompt: &'static str,
    pub params: OperationParams,
}

impl OperationDescriptor {
    /// Substitute `{key}` placeholders in the prompt template.
    pub fn render_prompt(&self, vars: &[(&str, &str)]) -> String {
        render_template(self.prompt_template, vars)
    }
}

pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(format!("{{{key}}}").as_str(), value)
    })
}

pub const DEFAULT_NEGATIVE_PROMPT: &str = "(worst quality:2), (low quality:2), (normal quality:2), lowres, ((monochrome)), ((grayscale)), blurry, jpeg artifacts, watermark, text, signature, (bad anatomy:1.21), (bad proportions:1.331), deformed, mutated hands, extra limbs, missing fingers, extra digit";

pub const OUTPAINT_SCALE: f64 = 0.6;

pub const OUTPAINT: OperationDescriptor = OperationDescriptor {
    name: "outpaint",
    prompt_template: "(RAW photo, best quality:1.2), seamless continuation of the scene, consistent lighting and perspective, natural background, highly detailed",
    negative_prompt: DEFAULT_NEGATIVE_PROMPT,
    params: OperationParams {
        precision: 100,
        padding: 4,
        denoising_strength: 0.85,
        batch_size: 1,
        cfg_scale: 7.0,
        steps: None,
        inpainting_fill: InpaintingFill::Original,
    },
};

pub const OUTPAINT_FULL: OperationDescriptor = OperationDescriptor {
    name: "outpaint_full",
    prompt_template: "(RAW photo, best quality:1.2), wide shot, seamless continuation of the scene on every side, consistent lighting and perspective, highly detailed",
    negative_prompt: DEFAULT_NEGATIVE_PROMPT,
    params: OperationParams {
        precision: 100,
        padding: 4,
        denoising_strength: 0.85,
        batch_size: 1,
        cfg_scale: 7.0,
        steps: None,
        inpainting_fill: InpaintingFill::Original,
    },
};

pub const RECOLOR: OperationDescriptor = OperationDescriptor {
    name: "recolor",
    prompt_template: "[txt2mask mode=\"add\" precision=100.0 padding=4.0 smoothing=20.0 negative_mask=\"face|hands\" neg_precision=100.0 neg_padding=4.0 neg_smoothing=20.0 sketch_color=\"{color}\" sketch_alpha={alpha}]shirt|jacket|dress|coat[/txt2mask](RAW photo, best quality:1.2), (photo-realistic:1.37), outfit in rgb({color}), natural fabric texture, detailed stitching",
    negative_prompt: DEFAULT_NEGATIVE_PROMPT,
    params: OperationParams {
        precision: 100,
        padding: 4,
        denoising_strength: 0.45,
        batch_size: 1,
        cfg_scale: 7.0,
        steps: None,
        inpainting_fill: InpaintingFill::Original,
    },
};

/// Sketch alpha per chained recolor pass.
pub const RECOLOR_ALPHAS: [u32; 3] = [100, 80, 60];

pub const DEFAULT_RECOLOR_RGB: [u8; 3] = [229, 205, 197];

pub const REPLACE_PREVIEW: OperationDescriptor = OperationDescriptor {
    name: "replace_preview",
    prompt_template: "[txt2mask mode=\"add\" precision=100.0 padding=0.0 smoothing=20.0 show]{target}[/txt2mask]",
    negative_prompt: "",
    params: OperationParams {
        precision: 100,
        padding: 4,
        denoising_strength: 0.0,
        batch_size: 1,
        cfg_scale: 7.0,
        steps: Some(1),
        inpainting_fill: InpaintingFill::Original,
    },
};

pub const REPLACE: OperationDescriptor = OperationDescriptor {
    name: "replace",
    prompt_template: "(RAW photo, best quality:1.2), {replacement}, consistent lighting, natural shadows, highly detailed",
    negative_prompt: DEFAULT_NEGATIVE_PROMPT,
    params: OperationParams {
        precision: 100,
        padding: 4,
        denoising_strength: 0.75,
        batch_size: 2,
        cfg_scale: 7.0,
        steps: None,
        inpainting_fill: InpaintingFill::Original,
    },
};

pub const DEFAULT_UPSCALER: &str = "R-ESRGAN 4x+";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_placeholders() {
        let prompt = RECOLOR.render_prompt(&[("color", "1,2,3"), ("alpha", "80")]);
        assert!(prompt.contains("sketch_color=\"1,2,3\""));
        assert!(prompt.contains("sketch_alpha=80"));
        assert!(prompt.contains("rgb(1,2,3)"));
        assert!(!prompt.contains('{'));
    }

    #[test]
    fn unknown_placeholders_are_left_untouched() {
        assert_eq!(render_template("{a} {b}", &[("a", "x")]), "x {b}");
    }

    #[test]
    fn inpainting_fill_wire_values() {
        assert_eq!(InpaintingFill::Fill.as_wire(), 0);
        assert_eq!(InpaintingFill::Original.as_wire(), 1);
        assert_eq!(InpaintingFill::LatentNothing.as_wire(), 3);
    }
}

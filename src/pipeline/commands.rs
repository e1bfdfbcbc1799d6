//! Caption routing: a caption is resolved into a [`Command`] once, at the
//! boundary, and every later step matches on the enum.

use thiserror::Error;

use crate::canvas::ExtendVariant;
use crate::pipeline::descriptors::{
    DEFAULT_RECOLOR_RGB, OUTPAINT, OUTPAINT_FULL, OUTPAINT_SCALE, RECOLOR, RECOLOR_ALPHAS,
    REPLACE, REPLACE_PREVIEW,
};
use crate::pipeline::{StageInput, StageMask, StageOp, StagePlan, StageSpec};

const MIN_REPLACE_PART_CHARS: usize = 2;
const MAX_UPSCALE_FACTOR: u8 = 4;
const DEFAULT_UPSCALE_FACTOR: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Outpaint,
    OutpaintFull,
    Recolor { rgb: [u8; 3] },
    Replace { target: String, replacement: String },
    Upscale { factor: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    pub name: &'static str,
    pub usage: &'static str,
    pub description: &'static str,
}

pub const COMMANDS: [CommandInfo; 6] = [
    CommandInfo {
        name: "help",
        usage: "/help",
        description: "Show this help message",
    },
    CommandInfo {
        name: "outpaint",
        usage: "/outpaint",
        description: "Extend the photo downwards and upscale the result",
    },
    CommandInfo {
        name: "outpaint_full",
        usage: "/outpaint_full",
        description: "Extend the photo downwards and to both sides",
    },
    CommandInfo {
        name: "recolor",
        usage: "/recolor [r,g,b]",
        description: "Recolor the outfit in three progressively lighter passes",
    },
    CommandInfo {
        name: "replace",
        usage: "/replace <target>|<replacement>",
        description: "Replace an object found by a text description",
    },
    CommandInfo {
        name: "upscale",
        usage: "/upscale [1-4]",
        description: "Upscale the photo",
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Unknown command '{0}'. Send /help for the list of commands.")]
    Unknown(String),
    #[error("/{0} needs a photo. Send the command as the caption of an image.")]
    MissingImage(&'static str),
    #[error("/{command} is missing a parameter. Usage: {usage}")]
    MissingParameter {
        command: &'static str,
        usage: &'static str,
    },
    #[error("/{command}: {detail}")]
    InvalidParameter {
        command: &'static str,
        detail: String,
    },
}

impl Command {
    /// Resolve a caption. A photo without caption runs the default outpaint.
    pub fn parse(caption: Option<&str>, has_image: bool) -> Result<Self, CommandError> {
        let caption = caption.map(str::trim).unwrap_or_default();
        let command = if caption.is_empty() {
            Self::Outpaint
        } else {
            let (head, rest) = match caption.split_once(char::is_whitespace) {
                Some((head, rest)) => (head, rest.trim()),
                None => (caption, ""),
            };
            let name = head.trim_start_matches('/');
            // "/cmd@botname" addresses a specific bot in group chats.
            let name = name.split_once('@').map_or(name, |(name, _)| name);
            Self::from_parts(name.to_ascii_lowercase().as_str(), rest)?
        };

        if command.needs_image() && !has_image {
            return Err(CommandError::MissingImage(command.name()));
        }
        Ok(command)
    }

    fn from_parts(name: &str, rest: &str) -> Result<Self, CommandError> {
        match name {
            "help" | "start" => Ok(Self::Help),
            "outpaint" => Ok(Self::Outpaint),
            "outpaint_full" | "outpaintfull" => Ok(Self::OutpaintFull),
            "recolor" => parse_recolor(rest),
            "replace" => parse_replace(rest),
            "upscale" => parse_upscale(rest),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Outpaint => "outpaint",
            Self::OutpaintFull => "outpaint_full",
            Self::Recolor { .. } => "recolor",
            Self::Replace { .. } => "replace",
            Self::Upscale { .. } => "upscale",
        }
    }

    pub fn needs_image(&self) -> bool {
        !matches!(self, Self::Help)
    }

    /// Ordered stages for this command. Each stage names its input explicitly;
    /// pipelines branch off the original wherever the previous output would
    /// compound artefacts.
    pub fn stage_plan(&self) -> StagePlan {
        match self {
            Self::Help => StagePlan::new(Vec::new()),
            Self::Outpaint => StagePlan::new(vec![
                StageSpec::new(
                    "outpaint",
                    StageInput::Original,
                    StageOp::Outpaint {
                        op: &OUTPAINT,
                        prompt: OUTPAINT.render_prompt(&[]),
                        variant: ExtendVariant::Vertical,
                        scale: OUTPAINT_SCALE,
                    },
                ),
                StageSpec::new(
                    "upscale",
                    StageInput::PreviousFirst,
                    StageOp::Upscale {
                        factor: DEFAULT_UPSCALE_FACTOR,
                    },
                ),
            ]),
            Self::OutpaintFull => StagePlan::new(vec![StageSpec::new(
                "outpaint_full",
                StageInput::Original,
                StageOp::Outpaint {
                    op: &OUTPAINT_FULL,
                    prompt: OUTPAINT_FULL.render_prompt(&[]),
                    variant: ExtendVariant::Full,
                    scale: OUTPAINT_SCALE,
                },
            )]),
            Self::Recolor { rgb } => {
                let color = format!("{},{},{}", rgb[0], rgb[1], rgb[2]);
                let stages = RECOLOR_ALPHAS
                    .iter()
                    .enumerate()
                    .map(|(pass, alpha)| {
                        let alpha = alpha.to_string();
                        StageSpec::new(
                            format!("recolor_{}", pass + 1),
                            if pass == 0 {
                                StageInput::Original
                            } else {
                                StageInput::PreviousFirst
                            },
                            StageOp::Img2Img {
                                op: &RECOLOR,
                                prompt: RECOLOR.render_prompt(&[
                                    ("color", color.as_str()),
                                    ("alpha", alpha.as_str()),
                                ]),
                                mask: StageMask::None,
                            },
                        )
                    })
                    .collect();
                StagePlan::new(stages)
            }
            Self::Replace {
                target,
                replacement,
            } => StagePlan::new(vec![
                StageSpec::new(
                    "replace_preview",
                    StageInput::Original,
                    StageOp::PreviewMask {
                        op: &REPLACE_PREVIEW,
                        prompt: REPLACE_PREVIEW.render_prompt(&[("target", target.as_str())]),
                    },
                ),
                StageSpec::new(
                    "replace",
                    StageInput::Original,
                    StageOp::Img2Img {
                        op: &REPLACE,
                        prompt: REPLACE.render_prompt(&[("replacement", replacement.as_str())]),
                        mask: StageMask::Preview,
                    },
                ),
            ]),
            Self::Upscale { factor } => StagePlan::new(vec![StageSpec::new(
                "upscale",
                StageInput::Original,
                StageOp::Upscale { factor: *factor },
            )]),
        }
    }
}

pub fn help_text() -> String {
    let lines = COMMANDS
        .iter()
        .map(|info| format!("{} - {}", info.usage, info.description))
        .collect::<Vec<_>>();
    format!(
        "I relay your photos to an image generator.\n\n{}\n\nSend a photo without a caption to outpaint it.",
        lines.join("\n")
    )
}

fn parse_recolor(rest: &str) -> Result<Command, CommandError> {
    if rest.is_empty() {
        return Ok(Command::Recolor {
            rgb: DEFAULT_RECOLOR_RGB,
        });
    }
    let parts = rest.split(',').map(str::trim).collect::<Vec<_>>();
    let invalid = || CommandError::InvalidParameter {
        command: "recolor",
        detail: format!("expected three 0-255 values like 229,205,197, got '{rest}'"),
    };
    if parts.len() != 3 {
        return Err(invalid());
    }
    let mut rgb = [0_u8; 3];
    for (slot, part) in rgb.iter_mut().zip(parts) {
        *slot = part.parse::<u8>().map_err(|_| invalid())?;
    }
    Ok(Command::Recolor { rgb })
}

fn parse_replace(rest: &str) -> Result<Command, CommandError> {
    let Some((target, replacement)) = rest.split_once('|') else {
        return Err(CommandError::MissingParameter {
            command: "replace",
            usage: "/replace <target>|<replacement>",
        });
    };
    let target = target.trim();
    let replacement = replacement.trim();
    for (label, value) in [("target", target), ("replacement", replacement)] {
        if value.chars().count() < MIN_REPLACE_PART_CHARS {
            return Err(CommandError::InvalidParameter {
                command: "replace",
                detail: format!(
                    "{label} must be at least {MIN_REPLACE_PART_CHARS} characters"
                ),
            });
        }
    }
    if target.contains(['[', ']']) || replacement.contains(['[', ']']) {
        return Err(CommandError::InvalidParameter {
            command: "replace",
            detail: String::from("square brackets are not allowed"),
        });
    }
    Ok(Command::Replace {
        target: target.to_string(),
        replacement: replacement.to_string(),
    })
}

fn parse_upscale(rest: &str) -> Result<Command, CommandError> {
    if rest.is_empty() {
        return Ok(Command::Upscale {
            factor: DEFAULT_UPSCALE_FACTOR,
        });
    }
    let factor = rest
        .parse::<u8>()
        .ok()
        .filter(|factor| (1..=MAX_UPSCALE_FACTOR).contains(factor))
        .ok_or_else(|| CommandError::InvalidParameter {
            command: "upscale",
            detail: format!("factor must be between 1 and {MAX_UPSCALE_FACTOR}, got '{rest}'"),
        })?;
    Ok(Command::Upscale { factor })
}

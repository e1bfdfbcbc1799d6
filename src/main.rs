use std::path::{Path, PathBuf};

use sdbot_core::api::server::serve;
use sdbot_core::canvas::{prepare_outpaint, ExtendVariant};
use sdbot_core::config::BotConfig;
use sdbot_core::pipeline::descriptors::{OUTPAINT, OUTPAINT_SCALE};
use serde_json::json;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    if matches!(
        cli_args.first().map(String::as_str),
        Some("outpaint-preview")
    ) {
        run_outpaint_preview_cli(cli_args.into_iter().skip(1).collect::<Vec<_>>())?;
        return Ok(());
    }
    if matches!(cli_args.first().map(String::as_str), Some("print-config")) {
        let config = BotConfig::from_env(std::env::current_dir()?.as_path())?;
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    if let Some(unknown) = cli_args.first() {
        print_usage();
        return Err(std::io::Error::other(format!("Unknown command: {unknown}")).into());
    }

    let config = BotConfig::from_env(std::env::current_dir()?.as_path())?;
    serve(config).await
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
struct OutpaintPreviewCliArgs {
    input: PathBuf,
    output: PathBuf,
    mask_output: PathBuf,
    scale: f64,
    padding: u32,
    variant: ExtendVariant,
}

fn parse_outpaint_preview_cli_args(
    args: &[String],
) -> Result<OutpaintPreviewCliArgs, Box<dyn std::error::Error>> {
    let mut input = None::<PathBuf>;
    let mut output = None::<PathBuf>;
    let mut mask_output = None::<PathBuf>;
    let mut scale = OUTPAINT_SCALE;
    let mut padding = OUTPAINT.params.padding;
    let mut variant = ExtendVariant::Vertical;

    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--input" => {
                input = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--output" => {
                output = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--mask-output" => {
                mask_output = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--scale" => {
                let raw = needs_value(i)?;
                scale = raw
                    .parse::<f64>()
                    .map_err(|_| std::io::Error::other(format!("Invalid --scale: {raw}")))?;
                i += 2;
            }
            "--padding" => {
                let raw = needs_value(i)?;
                padding = raw
                    .parse::<u32>()
                    .map_err(|_| std::io::Error::other(format!("Invalid --padding: {raw}")))?;
                i += 2;
            }
            "--full" => {
                variant = ExtendVariant::Full;
                i += 1;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }

    let input = input.ok_or_else(|| std::io::Error::other("Missing required --input"))?;
    let output = output.ok_or_else(|| std::io::Error::other("Missing required --output"))?;
    let mask_output = mask_output.unwrap_or_else(|| default_mask_path(output.as_path()));
    Ok(OutpaintPreviewCliArgs {
        input,
        output,
        mask_output,
        scale,
        padding,
        variant,
    })
}

fn default_mask_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| String::from("outpaint"));
    output.with_file_name(format!("{stem}.mask.png"))
}

fn run_outpaint_preview_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    if args
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_outpaint_preview_usage();
        return Ok(());
    }
    let parsed = parse_outpaint_preview_cli_args(args.as_slice())?;
    let source = image::open(parsed.input.as_path())?;
    let prepared = prepare_outpaint(&source, parsed.scale, parsed.variant, parsed.padding)?;
    prepared.canvas.save(parsed.output.as_path())?;
    prepared.mask.save(parsed.mask_output.as_path())?;
    info!(
        output = %parsed.output.display(),
        mask = %parsed.mask_output.display(),
        "outpaint preview written"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": true,
            "variant": parsed.variant.as_str(),
            "canvas": [prepared.geometry.canvas_width, prepared.geometry.canvas_height],
            "placed": [prepared.geometry.placed_width, prepared.geometry.placed_height],
            "x_offset": prepared.geometry.x_offset,
            "split_row": prepared.geometry.split_row(parsed.padding),
            "output": parsed.output.display().to_string(),
            "mask_output": parsed.mask_output.display().to_string(),
        }))?
    );
    Ok(())
}

fn print_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  sdbot-core                     serve the HTTP surface (config from env / .env)\n",
        "  sdbot-core outpaint-preview    write an outpaint canvas and mask locally\n",
        "  sdbot-core print-config        print the resolved configuration as JSON\n"
    ));
}

fn print_outpaint_preview_usage() {
    eprintln!(
        concat!(
            "Usage:\n",
            "  sdbot-core outpaint-preview --input PATH --output PATH ",
            "[--mask-output PATH] [--scale S] [--padding P] [--full]\n\n",
            "Defaults:\n",
            "  --scale 0.6, --padding 4, vertical extension\n",
            "  --mask-output defaults to <output stem>.mask.png next to --output\n"
        )
    );
}

mod terminal;
mod web;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use vesper_contracts::effects::EffectSettings;
use vesper_contracts::events::EventWriter;
use vesper_contracts::render::Variant;
use vesper_engine::effects::{
    apply_effects, decode_image, encode_png, BackgroundRemover, RembgRemover, UnavailableRemover,
};
use vesper_engine::{AppConfig, ChatApp, Secrets};

#[derive(Debug, Parser)]
#[command(
    name = "vesper",
    version,
    about = "Gemini chat with Stability image generation"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat in the terminal.
    Chat(ChatArgs),
    /// Browser front end over HTTP.
    Serve(ServeArgs),
    /// Apply image effects to a local file.
    Effects(EffectsArgs),
}

#[derive(Debug, Args)]
struct AppArgs {
    #[arg(long, default_value = "studio")]
    variant: Variant,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    secrets: Option<PathBuf>,
    #[arg(long)]
    rembg_endpoint: Option<String>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    app: AppArgs,
    /// Print replies at once instead of revealing them progressively.
    #[arg(long)]
    no_animation: bool,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[command(flatten)]
    app: AppArgs,
    #[arg(long, default_value = "127.0.0.1:8501")]
    bind: String,
}

#[derive(Debug, Parser)]
struct EffectsArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    brightness: f32,
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    contrast: f32,
    #[arg(long)]
    grayscale: bool,
    #[arg(long)]
    bw: bool,
    #[arg(long)]
    nobg: bool,
    #[arg(long)]
    rembg_endpoint: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("vesper error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            let app = build_app(&args.app)?;
            terminal::run_chat(&app, !args.no_animation)?;
            Ok(0)
        }
        Command::Serve(args) => run_serve(args),
        Command::Effects(args) => run_effects(args),
    }
}

fn build_app(args: &AppArgs) -> Result<ChatApp> {
    let config = AppConfig::from_env(args.variant)
        .with_text_model(args.text_model.clone())
        .with_image_model(args.image_model.clone())
        .with_rembg_endpoint(args.rembg_endpoint.clone());
    let secrets = Secrets::load(args.secrets.as_deref())?;
    let events = match args.events.as_ref() {
        Some(path) => EventWriter::new(path, format!("vesper-{}", std::process::id())),
        None => EventWriter::discard(),
    };
    ChatApp::from_config(&config, &secrets, events)
}

fn run_serve(args: ServeArgs) -> Result<i32> {
    // Built before the runtime exists and dropped after it is gone: the
    // blocking HTTP clients inside must not live or die on an async thread.
    let app = Arc::new(build_app(&args.app)?);
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(web::serve(Arc::clone(&app), &args.bind))?;
    drop(runtime);
    Ok(0)
}

fn run_effects(args: EffectsArgs) -> Result<i32> {
    let bytes = fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let source = decode_image(&bytes)?;
    let settings = EffectSettings {
        brightness: args.brightness,
        contrast: args.contrast,
        grayscale: args.grayscale,
        black_and_white: args.bw,
        remove_background: args.nobg,
    }
    .normalized();

    let remover: Box<dyn BackgroundRemover> = match args.rembg_endpoint {
        Some(endpoint) => Box::new(RembgRemover::new(endpoint)),
        None if settings.remove_background => Box::new(RembgRemover::new(RembgRemover::DEFAULT_ENDPOINT)),
        None => Box::new(UnavailableRemover),
    };
    let output = apply_effects(&source, &settings, remover.as_ref());
    for warning in &output.warnings {
        eprintln!("warning: {warning}");
    }

    if let Some(parent) = args.out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&args.out, encode_png(&output.image)?)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    println!("Wrote {} ({})", args.out.display(), settings.describe());
    Ok(if output.warnings.is_empty() { 0 } else { 2 })
}

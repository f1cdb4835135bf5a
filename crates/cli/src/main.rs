#![deny(warnings)]

use anyhow::Context;
use bytes::Bytes;
use clap::{Args as ClapArgs, Parser, Subcommand};
use linguaphon_core::analysis::AcousticReport;
use linguaphon_core::config::{
    resolve_optional_string, resolve_string_with_default, resolve_voice, validate_timeout,
    AnalysisConfig, AppConfig, Env, LanguageCode, RecognizerConfig, RendererConfig, StdEnv,
    DEFAULT_ESPEAK_BINARY, DEFAULT_LANGUAGE, DEFAULT_PYTHON, DEFAULT_RECOGNIZER_TIMEOUT_SECS,
    DEFAULT_RENDERER_TIMEOUT_SECS, ENV_ALLOSAURUS_MODEL, ENV_ESPEAK_BINARY, ENV_PYTHON,
    ENV_SCRATCH_DIR,
};
use linguaphon_core::pipeline::{PipelineError, PipelineOrchestrator};
use linguaphon_core::recognize::PhoneticString;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "linguaphon")]
#[command(about = "Speech to IPA and IPA to speech, with pitch and intensity analysis")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct GlobalArgs {
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Python interpreter with the allosaurus package installed.
    #[arg(long, global = true)]
    python: Option<String>,

    #[arg(long, global = true)]
    allosaurus_model: Option<String>,

    /// eSpeak NG executable.
    #[arg(long, global = true)]
    espeak: Option<String>,

    /// Directory for transient audio files.
    #[arg(long, global = true)]
    scratch_dir: Option<PathBuf>,

    #[arg(long, global = true, default_value_t = DEFAULT_RECOGNIZER_TIMEOUT_SECS)]
    recognizer_timeout_secs: u64,

    #[arg(long, global = true, default_value_t = DEFAULT_RENDERER_TIMEOUT_SECS)]
    renderer_timeout_secs: u64,

    #[arg(long, global = true)]
    pitch_floor: Option<f64>,

    #[arg(long, global = true)]
    pitch_ceiling: Option<f64>,

    /// Print the full report, spectrogram included, as JSON.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transcribe a WAV recording into IPA phones and analyze it.
    Recognize {
        /// WAV file, or `-` for stdin.
        input: String,

        #[arg(long, default_value = DEFAULT_LANGUAGE)]
        lang: String,
    },
    /// Render IPA phones to speech and analyze the result.
    Synthesize {
        /// Space-separated IPA phones, e.g. "h ə l oʊ".
        ipa: String,

        #[arg(long, default_value = DEFAULT_LANGUAGE)]
        lang: String,

        /// Renderer voice; defaults to the language's voice.
        #[arg(long)]
        voice: Option<String>,

        /// Also save the rendered audio here.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List supported languages and their default voices.
    Languages,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.global.log_level)?;

    let env = StdEnv;
    match cli.command {
        Command::Languages => {
            for lang in LanguageCode::ALL {
                println!("{lang}\t{}\t{}", lang.display_name(), lang.voice());
            }
            Ok(())
        }
        Command::Recognize { input, lang } => {
            let cfg = build_config(&cli.global, &lang, None, &env)?;
            run_recognize(&cfg, &input, cli.global.json).await
        }
        Command::Synthesize {
            ipa,
            lang,
            voice,
            out,
        } => {
            let cfg = build_config(&cli.global, &lang, voice, &env)?;
            run_synthesize(&cfg, &ipa, out, cli.global.json).await
        }
    }
}

async fn run_recognize(cfg: &AppConfig, input: &str, json: bool) -> anyhow::Result<()> {
    let orchestrator = PipelineOrchestrator::from_config(cfg);
    let audio = read_input(input).await?;
    tracing::info!(
        language = %cfg.language,
        bytes = audio.len(),
        "recognizing"
    );

    let result = orchestrator
        .recognize_and_analyze(audio, cfg.language)
        .await
        .map_err(for_user)?;

    if json {
        let mut result = result;
        result.report = presentable(result.report);
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("IPA: /{}/", result.ipa);
        print_report(&result.report);
    }
    Ok(())
}

async fn run_synthesize(
    cfg: &AppConfig,
    ipa: &str,
    out: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let orchestrator = PipelineOrchestrator::from_config(cfg);
    let phonetic = PhoneticString::parse(ipa);
    tracing::info!(voice = %cfg.voice, phones = phonetic.len(), "synthesizing");

    let result = orchestrator
        .synthesize_and_verify(&phonetic, &cfg.voice)
        .await
        .map_err(for_user)?;

    if let Some(path) = &out {
        result
            .audio
            .write_wav(path)
            .with_context(|| format!("failed to save audio to {}", path.display()))?;
        tracing::info!(path = %path.display(), "saved rendered audio");
    }

    if json {
        let mut result = result;
        result.report = presentable(result.report);
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Voice: {}", result.voice);
        println!("IPA: /{}/", result.phonetic);
        print_report(&result.report);
    }
    Ok(())
}

async fn read_input(input: &str) -> anyhow::Result<Bytes> {
    let bytes = if input == "-" {
        let mut buf = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut buf)
            .await
            .context("failed to read audio from stdin")?;
        buf
    } else {
        tokio::fs::read(input)
            .await
            .with_context(|| format!("failed to read {input}"))?
    };
    Ok(Bytes::from(bytes))
}

/// Spectrogram power converted to dB for display.
fn presentable(mut report: AcousticReport) -> AcousticReport {
    report.spectrogram = report.spectrogram.to_db();
    report
}

fn print_report(report: &AcousticReport) {
    println!("Duration: {:.2} s", report.duration);
    println!("Mean F0: {:.1} Hz", report.mean_f0);
    println!("Mean intensity: {:.1} dB", report.mean_intensity);
    println!(
        "Voiced frames: {}/{}",
        report.pitch.voiced_count(),
        report.pitch.len()
    );
}

fn for_user(e: PipelineError) -> anyhow::Error {
    let message = e.user_message();
    anyhow::Error::new(e).context(message)
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid --log-level: {level}"))?,
        )
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn build_config(
    args: &GlobalArgs,
    lang: &str,
    voice: Option<String>,
    env: &impl Env,
) -> anyhow::Result<AppConfig> {
    let language: LanguageCode = lang.parse()?;
    let voice = resolve_voice(voice, language)?;

    let defaults = AnalysisConfig::default();
    let analysis = AnalysisConfig {
        pitch_floor: args.pitch_floor.unwrap_or(defaults.pitch_floor),
        pitch_ceiling: args.pitch_ceiling.unwrap_or(defaults.pitch_ceiling),
        ..defaults
    }
    .validate()?;

    let recognizer = RecognizerConfig {
        python: resolve_string_with_default(args.python.clone(), ENV_PYTHON, env, DEFAULT_PYTHON)
            .into(),
        model: resolve_optional_string(args.allosaurus_model.clone(), ENV_ALLOSAURUS_MODEL, env),
        timeout_secs: validate_timeout(args.recognizer_timeout_secs)?,
    };
    let renderer = RendererConfig {
        binary: resolve_string_with_default(
            args.espeak.clone(),
            ENV_ESPEAK_BINARY,
            env,
            DEFAULT_ESPEAK_BINARY,
        )
        .into(),
        timeout_secs: validate_timeout(args.renderer_timeout_secs)?,
    };
    let scratch_dir = args.scratch_dir.clone().or_else(|| {
        resolve_optional_string(None, ENV_SCRATCH_DIR, env).map(PathBuf::from)
    });

    let cfg = AppConfig {
        language,
        voice,
        analysis,
        recognizer,
        renderer,
        scratch_dir,
    };
    tracing::debug!(
        language = %cfg.language,
        voice = %cfg.voice,
        python = %cfg.recognizer.python.display(),
        espeak = %cfg.renderer.binary.display(),
        "config loaded"
    );
    Ok(cfg)
}

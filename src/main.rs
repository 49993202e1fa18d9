use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use recorder_lib::delivery::{DeliveryError, DeliverySink, LogNotifier, SinkAction};
use recorder_lib::device::CpalMicrophone;
use recorder_lib::effects::{Capabilities, CaptureEffectRunner};
use recorder_lib::postprocess::SymphoniaDecoder;
use recorder_lib::settings::{self, OutputFormat};
use recorder_lib::ui::SessionPhase;

/// Record one clip from the default microphone and print it as base64.
#[derive(Debug, Parser)]
#[command(name = "audio-recorder", version, about)]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Override the recording ceiling in minutes (1-300)
    #[arg(long)]
    max_minutes: Option<u32>,

    /// Override the output format
    #[arg(long)]
    format: Option<OutputFormat>,

    /// Write the base64 payload to this file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

/// Writes the payload to a file or stdout.
struct TextSink {
    output: Option<PathBuf>,
    stored: Arc<AtomicBool>,
}

impl DeliverySink for TextSink {
    fn set_value(&self, content: String) -> Result<(), DeliveryError> {
        match &self.output {
            Some(path) => std::fs::write(path, content.as_bytes())
                .map_err(|e| DeliveryError::SetValue(format!("write {:?}: {}", path, e)))?,
            None => {
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{}", content)
                    .and_then(|_| stdout.flush())
                    .map_err(|e| DeliveryError::SetValue(e.to_string()))?;
            }
        }
        self.stored.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn action(&self) -> Option<Arc<dyn SinkAction>> {
        Some(Arc::new(AnnounceAction {
            output: self.output.clone(),
        }))
    }
}

struct AnnounceAction {
    output: Option<PathBuf>,
}

impl SinkAction for AnnounceAction {
    fn can_execute(&self) -> bool {
        self.output.is_some()
    }

    fn execute(&self) -> Result<(), String> {
        if let Some(path) = &self.output {
            log::info!("Audio stored in {}", path.display());
        }
        Ok(())
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();
    init_logging();

    let cli = Cli::parse();

    let settings_path = match cli.settings.clone() {
        Some(path) => Some(path),
        None => match settings::default_settings_path() {
            Ok(path) => Some(path),
            Err(e) => {
                log::warn!("Using default settings: {}", e);
                None
            }
        },
    };
    let mut settings = settings_path
        .as_deref()
        .map(settings::load_settings)
        .unwrap_or_default();
    if let Some(minutes) = cli.max_minutes {
        settings.max_recording_minutes = minutes;
        if minutes != settings.effective_max_minutes() {
            log::warn!(
                "--max-minutes {} out of range, using {}",
                minutes,
                settings.effective_max_minutes()
            );
        }
    }
    if let Some(format) = cli.format {
        settings.output_format = format;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let stored = Arc::new(AtomicBool::new(false));
    let sink = TextSink {
        output: cli.output,
        stored: stored.clone(),
    };

    runtime.block_on(async move {
        let runner = CaptureEffectRunner::new(
            Capabilities {
                microphone: Arc::new(CpalMicrophone::new(Duration::from_millis(
                    settings.chunk_interval_ms,
                ))),
                sink: Some(Arc::new(sink)),
                notifier: Arc::new(LogNotifier),
                decoder: Arc::new(SymphoniaDecoder),
            },
            settings.bar_count,
        );
        let session = recorder_lib::spawn_session(settings.clone(), runner.clone());
        let mut ui = session.subscribe_ui();

        if session.start_and_wait_live().await {
            eprintln!(
                "{} (limit {} min, {}). Press Enter to stop.",
                settings.recording_text,
                settings.effective_max_minutes(),
                settings.output_format
            );

            let enter = tokio::task::spawn_blocking(|| {
                let mut line = String::new();
                std::io::stdin().read_line(&mut line).map(|_| ())
            });

            tokio::select! {
                _ = enter => {
                    if session.stop().await.is_err() {
                        log::error!("Session loop is not running");
                    }
                }
                _ = ui.wait_for(|s| !s.can_stop) => {}
            }

            let _ = ui.wait_for(|s| s.phase == SessionPhase::Idle).await;
            let done = ui.borrow().clone();
            eprintln!("{} ({})", done.status_text, done.elapsed);
        }

        runner.shutdown().await;
        session.shutdown().await;
    });

    // Don't wait on a stdin reader left behind by an automatic stop.
    runtime.shutdown_background();

    if stored.load(Ordering::SeqCst) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

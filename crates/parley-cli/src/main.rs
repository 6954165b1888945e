use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use parley_agent::{ModeRequest, Services, SessionManager, SessionNotice};
use parley_core::config::{Config, LoggingConfig};
use parley_core::session::{Difficulty, SessionIdentity};
use parley_media::device::LocalVoiceGateway;
use parley_media::synthesis::MurfSynthesizer;
use parley_media::transcription::AssemblyAiTranscriber;
use parley_providers::GeminiReasoner;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Voice interview and conversation sessions over your microphone and speakers",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mock interview for a role
    Interview {
        /// Role being interviewed for
        #[arg(short, long)]
        role: String,

        /// junior, intermediate or senior
        #[arg(short, long, default_value_t = Difficulty::Intermediate)]
        difficulty: Difficulty,
    },

    /// Open-ended voice conversation
    Converse,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    init_logging(&config.logging(), cli.verbose);
    tracing::debug!(path = %config_path.display(), "Config loaded");

    match cli.command {
        Commands::Interview { role, difficulty } => {
            run_session(&config, ModeRequest::Interview { role, difficulty }).await?;
        }
        Commands::Converse => {
            run_session(&config, ModeRequest::Conversation).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".into())
    };
    let mut directives = vec![level];
    directives.extend(logging.filters.iter().cloned());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives.join(",")));

    let writer = if logging.output == "stdout" {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run one local session until Ctrl-C or until the interview wraps up,
/// then print its summary.
async fn run_session(config: &Config, mode: ModeRequest) -> anyhow::Result<()> {
    let services = Services {
        gateway: Arc::new(LocalVoiceGateway::new(&config.voice())),
        transcription: Arc::new(AssemblyAiTranscriber::new(config.transcription())?),
        synthesis: Arc::new(MurfSynthesizer::new(config.tts())?),
        reasoner: Arc::new(GeminiReasoner::from_config(&config.reasoning())?),
    };
    let (manager, mut notices) = SessionManager::new(services, config.voice());

    let participant = std::env::var("USER").unwrap_or_else(|_| "local".into());
    let identity = SessionIdentity {
        participant_id: participant.clone(),
        room_id: "local".into(),
        channel_id: "default".into(),
    };

    let snapshot = match manager.create(identity, mode).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("Failed to start session: {e}");
            return Err(e.into());
        }
    };
    match &snapshot.current_question {
        Some(question) => println!("Interview started. First question: {question}"),
        None => println!("Conversation started. Press Ctrl-C to finish."),
    }

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Interrupted, ending session");
                break;
            }
            notice = notices.recv() => match notice {
                Some(SessionNotice::InterviewComplete { .. }) => {
                    tracing::info!("Interview complete");
                    break;
                }
                Some(SessionNotice::Failed { reason, .. }) => {
                    tracing::error!(reason = %reason, "Session failed");
                    break;
                }
                None => break,
            },
        }
    }

    match manager.end_session(&participant).await {
        Ok(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
        Err(e) => tracing::warn!(error = %e, "Could not summarize session"),
    }
    manager.shutdown().await;
    Ok(())
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use posso_voice::Config;

/// `posso-voice` - Posso Ltd voice assistant on the command line.
#[derive(Parser, Debug)]
#[command(name = "posso-voice")]
#[command(version)]
#[command(about = "Talk to the Posso AI voice assistant over Gemini Live.", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.posso-voice/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a live voice session on the default microphone and speaker
    Talk,

    /// Show the effective configuration
    Config {
        /// Print the JSON schema of the config file instead
        #[arg(long)]
        schema: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("posso_voice=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { schema } => {
            if schema {
                println!("{}", Config::json_schema()?);
                return Ok(());
            }
            let config = Config::load(cli.config.as_deref())?;
            println!("# {}", config.config_path.display());
            print!(
                "{}",
                toml::to_string_pretty(&config.redacted())
                    .map_err(|e| anyhow::anyhow!("Failed to render config: {e}"))?
            );
            Ok(())
        }
        Commands::Talk => {
            let config = Config::load(cli.config.as_deref())?;
            talk(config).await
        }
    }
}

#[cfg(feature = "audio-device")]
async fn talk(config: Config) -> Result<()> {
    use posso_voice::enquiry::whatsapp::WhatsAppHandoff;
    use posso_voice::voice::device::{CpalMicrophone, CpalSpeaker};
    use posso_voice::voice::{Assistant, ConnectionState, GeminiLiveConnector, Role};
    use std::sync::Arc;

    let Some(api_key) = config.api_key() else {
        anyhow::bail!("No API key: set api_key in the config file or GEMINI_API_KEY");
    };

    let (speaker, playback_ended) = tokio::task::spawn_blocking(CpalSpeaker::open).await??;
    let (handoff, mut prepared) = WhatsAppHandoff::new(config.handoff.whatsapp_number.clone());

    let assistant = Assistant {
        connector: Arc::new(GeminiLiveConnector::new(
            config.endpoint.clone(),
            api_key,
            config.setup_timeout(),
        )),
        microphone: Arc::new(CpalMicrophone::new(config.audio.input_sample_rate)),
        output: Box::new(speaker),
        playback_ended,
        handoff: Arc::new(handoff),
        model: config.model.clone(),
        voice: config.voice.clone(),
        frame_size: config.audio.frame_size,
    };
    let (handle, task) = assistant.spawn();
    let mut snapshots = handle.subscribe();

    println!("Connecting to the Posso assistant... (Ctrl-C to hang up)");
    handle.start();

    let mut printed = 0;
    let mut last_state = ConnectionState::Disconnected;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nHanging up.");
                break;
            }
            Some(message) = prepared.recv() => {
                println!("\nEnquiry ready for {}. Open to send on WhatsApp:\n  {}\n", message.customer_name, message.url);
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                for entry in &snapshot.transcript[printed..] {
                    let speaker = match entry.role {
                        Role::User => "You",
                        Role::Assistant => "Posso",
                    };
                    println!("[{}] {speaker}: {}", entry.timestamp.format("%H:%M:%S"), entry.text);
                }
                printed = snapshot.transcript.len();

                if snapshot.state != last_state {
                    last_state = snapshot.state;
                    match snapshot.state {
                        ConnectionState::Connected => println!("Connected. Start speaking."),
                        ConnectionState::Error => {
                            let message = snapshot.last_error.unwrap_or_default();
                            eprintln!("{message}");
                            break;
                        }
                        ConnectionState::Disconnected => {
                            println!("Session ended.");
                            break;
                        }
                        ConnectionState::Connecting => {}
                    }
                }
            }
        }
    }

    handle.shutdown();
    task.await
        .map_err(|e| anyhow::anyhow!("Assistant task failed: {e}"))?;
    Ok(())
}

#[cfg(not(feature = "audio-device"))]
async fn talk(_config: Config) -> Result<()> {
    anyhow::bail!("`talk` needs audio device support; rebuild with `--features audio-device`")
}

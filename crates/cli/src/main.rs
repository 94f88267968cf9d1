use clap::{Parser, Subcommand};
use event_buffer::DEFAULT_COMPONENT;
use event_buffer_cli::commands::{compact, inspect, replay, stream};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "event-buffer")]
#[command(about = "Inspect and maintain event buffer stores", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize the store: log health, positions, buffered events.
    Inspect {
        /// Directory containing buffer.log
        #[arg(long, short)]
        dir: PathBuf,
    },
    /// Show position and buffered events for one stream
    Stream {
        #[arg(long, short)]
        dir: PathBuf,

        /// Stream id (UUID)
        #[arg(long, short)]
        stream: Uuid,

        /// Only this source (default: every source seen for the stream)
        #[arg(long)]
        source: Option<String>,

        #[arg(long, default_value = DEFAULT_COMPONENT)]
        component: String,
    },
    /// Rewrite the log keeping only live rows
    Compact {
        #[arg(long, short)]
        dir: PathBuf,
    },
    /// Feed a JSONL file of events through the ordering engine
    Replay {
        #[arg(long, short)]
        dir: PathBuf,

        /// One JSON event envelope per line
        #[arg(long, short)]
        events: PathBuf,

        #[arg(long, default_value = DEFAULT_COMPONENT)]
        component: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { dir } => inspect::run(&dir),
        Commands::Stream {
            dir,
            stream: stream_id,
            source,
            component,
        } => stream::run(&dir, stream_id, source.as_deref(), &component),
        Commands::Compact { dir } => compact::run(&dir).map(|_| ()),
        Commands::Replay {
            dir,
            events,
            component,
        } => replay::run(&dir, &events, &component).map(|_| ()),
    }
}

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use mgdi_chat::api::HttpChatClient;
use mgdi_chat::config::ClientConfig;
use mgdi_chat::console;
use mgdi_chat::settings::ChatSettingsPatch;
use mgdi_chat::storage::{MemorySnapshotRepository, SnapshotRepository, SqliteSnapshotRepository, STORE_KEY};
use mgdi_chat::store::ChatStore;

#[derive(Debug, Parser)]
#[command(name = "mgdi_chat")]
#[command(about = "Terminal client for the MGDI chat API", long_about = None)]
struct Cli {
    /// Chat API base URL (defaults to $MGDI_API_BASE or http://localhost:8000/api)
    #[arg(long, global = true)]
    api_base: Option<String>,
    /// SQLite URL for the saved conversation
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// Keep the conversation in memory only
    #[arg(long, global = true)]
    ephemeral: bool,
    /// Expose Prometheus metrics on this address
    #[arg(long, global = true)]
    metrics_listen: Option<SocketAddr>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive chat (the default)
    Chat,
    /// Send one message and print the reply
    Send {
        #[arg(required = true)]
        message: Vec<String>,
        #[arg(long = "attach", short = 'a')]
        attachments: Vec<PathBuf>,
    },
    Models,
    Providers,
    Health,
    /// Show stored memories, newest first
    Timeline,
    History,
    Clear,
    /// Show settings, or change them with key=value pairs
    Settings {
        assignments: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Some(addr) = cli.metrics_listen {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        tracing::info!(%addr, "metrics exporter listening");
    }

    let config = ClientConfig::from_env().with_api_base(cli.api_base);
    let transport = Arc::new(HttpChatClient::new(&config)?);
    let repo: Arc<dyn SnapshotRepository> = if cli.ephemeral {
        Arc::new(MemorySnapshotRepository::new())
    } else {
        Arc::new(SqliteSnapshotRepository::initialize(cli.database_url).await?)
    };
    let store = ChatStore::open(transport, repo, STORE_KEY).await;

    let mut out = std::io::stdout();
    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => console::run_repl(&store).await?,
        Commands::Send { message, attachments } => {
            let mut composer = console::Composer::new();
            for path in &attachments {
                composer.attach(console::attachment_from_path(path)?);
            }
            let Some((text, attachments)) = composer.submit(&message.join(" "), false) else {
                anyhow::bail!("message is empty");
            };
            let outcome = console::send_and_print(&store, text, attachments, &mut out, console::interrupted()).await?;
            if outcome == console::TurnOutcome::Interrupted {
                anyhow::bail!("interrupted");
            }
        }
        Commands::Models => {
            store.load_models().await;
            console::print_models(&store, &mut out)?;
        }
        Commands::Providers => console::print_providers(&store, &mut out).await?,
        Commands::Health => console::print_health(&store, &mut out).await?,
        Commands::Timeline => console::print_timeline(&store, &mut out).await?,
        Commands::History => console::print_history(&store, &mut out)?,
        Commands::Clear => store.clear_messages().await,
        Commands::Settings { assignments } => {
            let patch = ChatSettingsPatch::from_assignments(&assignments)?;
            if !patch.is_empty() {
                store.update_settings(patch).await;
            }
            println!("{}", console::render_settings(&store.snapshot().settings));
        }
    }
    Ok(())
}

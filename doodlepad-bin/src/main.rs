use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use doodlepad_core::{
    client::{GenerationClient, Identity},
    config::Config,
    event::Failure,
    library::{LibraryClient, ResourceFilter, ResourceType},
    model::{DocumentKind, ImageMap, PartialDocument},
    observer::SessionObserver,
    session::{SessionHandle, SessionState},
    telemetry::{self, LogSink},
};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

const TOKEN_ENV: &str = "DOODLEPAD_TOKEN";

#[derive(Parser)]
#[command(author, version, about = "doodlepad console harness", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a document and print updates as they stream in
    Generate {
        #[arg(long)]
        kind: DocumentKind,
        #[arg(long)]
        topic: String,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Apply a free-text edit to a saved document
    Edit {
        #[arg(long)]
        kind: DocumentKind,
        #[arg(long)]
        id: String,
        #[arg(long)]
        request: String,
    },
    /// Fetch a document with its images
    Fetch {
        #[arg(long)]
        kind: DocumentKind,
        #[arg(long)]
        id: String,
    },
    /// Saved resources (needs DOODLEPAD_TOKEN)
    Library {
        #[command(subcommand)]
        command: LibraryCommands,
    },
    /// Show subscription status (needs DOODLEPAD_TOKEN)
    Subscription,
}

#[derive(Subcommand)]
enum LibraryCommands {
    List {
        #[arg(long = "type")]
        resource_type: Option<ResourceType>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

/// Prints session updates to stdout as they arrive.
#[derive(Default)]
struct ConsoleObserver {
    last_image_count: usize,
}

impl SessionObserver for ConsoleObserver {
    fn on_init(&mut self, document_id: Option<&str>) {
        match document_id {
            Some(id) => println!("started ({id})"),
            None => println!("started"),
        }
    }

    fn on_document(&mut self, document: &PartialDocument, images: &ImageMap) {
        println!("document: {} [{}] v{}, {} image(s)", document.title, document.id, document.version, images.len());
        self.last_image_count = images.len();
    }

    fn on_images(&mut self, _document: Option<&PartialDocument>, images: &ImageMap) {
        if images.len() > self.last_image_count {
            let keys: Vec<&str> = images.keys().collect();
            println!("images: {}", keys.join(", "));
        }
        self.last_image_count = images.len();
    }

    fn on_status(&mut self, message: &str) {
        println!("... {message}");
        io::stdout().flush().ok();
    }

    fn on_complete(&mut self, message: &str) {
        println!("done: {message}");
    }

    fn on_error(&mut self, failure: &Failure) {
        if failure.is_entitlement() {
            eprintln!("upgrade required: {}", failure.code.as_deref().unwrap_or("subscription_required"));
        } else {
            eprintln!("failed: {}", failure.reason);
        }
    }
}

/// Wait for the session; Ctrl-C cancels it.
async fn follow(handle: SessionHandle) -> anyhow::Result<ExitCode> {
    let canceller = handle.canceller();
    let join = handle.join();
    tokio::pin!(join);
    let report = tokio::select! {
        r = &mut join => r?,
        _ = tokio::signal::ctrl_c() => {
            canceller.cancel();
            eprintln!("cancelled");
            join.await?
        }
    };
    tracing::debug!(session_id = report.id, state = report.state.as_str(), events = report.events_folded, "session finished");
    Ok(match report.state {
        SessionState::Completed => ExitCode::SUCCESS,
        SessionState::Cancelled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    telemetry::set_telemetry_sink(Arc::new(LogSink));

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    let token = std::env::var(TOKEN_ENV).ok().map(SecretString::from);

    match cli.command {
        Commands::Generate { kind, topic, user_id } => {
            let client = GenerationClient::new(&cfg)?;
            let identity = Identity { token, user_id };
            let handle = client.start_generation(&topic, kind, &identity, ConsoleObserver::default())?;
            follow(handle).await
        }
        Commands::Edit { kind, id, request } => {
            let client = GenerationClient::new(&cfg)?;
            let identity = Identity { token, user_id: None };
            let handle = client.start_edit(kind, &id, &request, &identity, ConsoleObserver::default())?;
            follow(handle).await
        }
        Commands::Fetch { kind, id } => {
            let client = GenerationClient::new(&cfg)?;
            let identity = Identity { token, user_id: None };
            let doc = client.fetch_document(kind, &id, &identity).await?;
            println!("{} [{}] v{}", doc.document.title, doc.document.id, doc.document.version);
            for key in doc.images.keys() {
                println!("  image: {key}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Library {
            command: LibraryCommands::List { resource_type, limit },
        } => {
            let library = LibraryClient::new(&cfg, token)?;
            let filter = ResourceFilter {
                resource_type,
                limit,
                ..ResourceFilter::default()
            };
            for r in library.list_resources(&filter).await? {
                println!("{}\t{}\t{}", r.id, r.resource_type.as_str(), r.title);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Subscription => {
            let library = LibraryClient::new(&cfg, token)?;
            let status = library.subscription_status().await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "status": format!("{:?}", status.subscription_status).to_lowercase(),
                "can_create_content": status.can_create_content,
                "days_remaining": status.days_remaining,
            }))?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

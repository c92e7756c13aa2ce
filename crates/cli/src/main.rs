use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, bail};
use assistant::{ChatSession, adopt_unsaved};
use chat_stream::ChatClient;
use chrono::Utc;
use clap::{Parser, Subcommand};
use core_model::{SnippetDraft, UNSAVED_SCOPE, new_snippet_id, sort_recent_first};
use formatter::Indent;
use store_sqlite::SqliteStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod ui;

use config::Config;

#[derive(Parser)]
#[command(name = "jsonpad")]
#[command(about = "JSON formatter with saved snippets and an AI chat helper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Re-indent JSON from a file or stdin.
    Format {
        file: Option<PathBuf>,
        /// Spaces per level: 2, 4 or 8.
        #[arg(long)]
        indent: Option<Indent>,
        /// Print on one line instead.
        #[arg(long, default_value_t = false, conflicts_with = "indent")]
        compact: bool,
    },
    Snippets {
        #[command(subcommand)]
        command: SnippetsCommand,
    },
    Chat {
        #[command(subcommand)]
        command: ChatCommand,
    },
    Doctor,
}

#[derive(Subcommand)]
enum SnippetsCommand {
    List,
    Show {
        id: String,
    },
    New {
        #[arg(long)]
        name: String,
        #[arg(long)]
        file: Option<PathBuf>,
        /// Move the chat started before saving into the new snippet.
        #[arg(long, default_value_t = false)]
        adopt_unsaved: bool,
    },
    Save {
        id: String,
        file: Option<PathBuf>,
    },
    Rename {
        id: String,
        name: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum ChatCommand {
    Ask {
        text: String,
        #[arg(long)]
        snippet: Option<String>,
        /// JSON to ask about; defaults to the snippet's content.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    History {
        #[arg(long)]
        snippet: Option<String>,
    },
    Clear {
        #[arg(long)]
        snippet: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let config = Config::load()?;
    let t = Instant::now();

    if let Commands::Format {
        file,
        indent,
        compact,
    } = &cli.command
    {
        let input = read_input(file.as_deref())?;
        let width = if *compact {
            0
        } else {
            indent.unwrap_or_else(|| config.indent()).width()
        };
        let output = formatter::format_json(&input, width)?;
        println!("{output}");
        return Ok(());
    }

    info!("opening database");
    let store = open_store(&config)?;

    match cli.command {
        Commands::Format { .. } => unreachable!("handled before opening the store"),
        Commands::Snippets { command } => match command {
            SnippetsCommand::List => {
                let loaded = store.load_snippets();
                if loaded.is_degraded() {
                    warn!("snippet list could not be read; showing nothing");
                }
                let mut snippets = loaded.into_inner();
                sort_recent_first(&mut snippets);
                info!(snippets = snippets.len(), "snippets listed");
                ui::print_snippet_list(&snippets, Utc::now());
            }
            SnippetsCommand::Show { id } => {
                let snippet = store
                    .try_get_snippet(&id)?
                    .with_context(|| format!("snippet {id} not found"))?;
                println!("{}", snippet.content);
            }
            SnippetsCommand::New {
                name,
                file,
                adopt_unsaved: adopt,
            } => {
                let name = snippet_name(&name)?;
                let content = match file {
                    Some(path) => read_input(Some(path.as_path()))?,
                    None => String::new(),
                };
                let draft = SnippetDraft::new(new_snippet_id(Utc::now()))
                    .name(name)
                    .content(content);
                let snippet = if adopt {
                    adopt_unsaved(&store, draft)?
                } else {
                    store.create_snippet(draft)?
                };
                info!(id = %snippet.id, name = %snippet.name, "snippet created");
                println!("{}", snippet.id);
            }
            SnippetsCommand::Save { id, file } => {
                let content = read_input(file.as_deref())?;
                let snippet = store.save_snippet_content(&id, &content)?;
                info!(id = %snippet.id, bytes = content.len(), "snippet saved");
            }
            SnippetsCommand::Rename { id, name } => {
                let snippet = store.rename_snippet(&id, &name)?;
                info!(id = %snippet.id, name = %snippet.name, "snippet renamed");
            }
            SnippetsCommand::Delete { id } => {
                store.delete_snippet(&id)?;
                info!(id = %id, "snippet deleted");
            }
        },
        Commands::Chat { command } => match command {
            ChatCommand::Ask {
                text,
                snippet,
                file,
            } => {
                let json_content = match (&file, &snippet) {
                    (Some(path), _) => read_input(Some(path.as_path()))?,
                    (None, Some(id)) => {
                        store
                            .try_get_snippet(id)?
                            .with_context(|| format!("snippet {id} not found"))?
                            .content
                    }
                    (None, None) => String::new(),
                };
                let chat = config.chat_client();
                if chat.api_key.is_empty() {
                    bail!(
                        "no chat API key configured; set {} or [chat] api_key",
                        config::API_KEY_ENV
                    );
                }
                let client = ChatClient::new(chat)?;
                let mut session = ChatSession::load(&store, scope_of(snippet.as_deref()));
                let mut live = ui::LiveAnswer::new();
                let runtime = tokio::runtime::Runtime::new()?;
                let result = runtime.block_on(session.send(&client, &json_content, &text, &mut live));
                live.finish();
                match result {
                    Ok(Some(_)) => {
                        info!(scope = %session.scope(), elapsed = ?t.elapsed(), "chat answered")
                    }
                    Ok(None) => info!("empty question ignored"),
                    Err(err) => {
                        if let Some(last) = session.history().last() {
                            ui::print_history(std::slice::from_ref(last));
                        }
                        return Err(err).context("chat request failed");
                    }
                }
            }
            ChatCommand::History { snippet } => {
                let session = ChatSession::load(&store, scope_of(snippet.as_deref()));
                info!(
                    scope = %session.scope(),
                    messages = session.history().len(),
                    "chat history loaded"
                );
                ui::print_history(session.history());
            }
            ChatCommand::Clear { snippet } => {
                let mut session = ChatSession::load(&store, scope_of(snippet.as_deref()));
                session.clear()?;
                info!(scope = %session.scope(), "chat cleared");
            }
        },
        Commands::Doctor => {
            info!("running integrity check");
            let version = store.schema_version()?;
            let check = store.integrity_check()?;
            let snippets = store.try_load_snippets()?;
            info!(elapsed = ?t.elapsed(), "integrity check done");
            println!("path={}", store.path().display());
            println!("schema_version={version}");
            println!("integrity_check={check}");
            println!("snippets={}", snippets.len());
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<SqliteStore> {
    let store = match &config.store.path {
        Some(path) => SqliteStore::open(path),
        None => SqliteStore::open_default(),
    };
    store.context("failed to open snippet store")
}

fn scope_of(snippet: Option<&str>) -> String {
    snippet.unwrap_or(UNSAVED_SCOPE).to_string()
}

fn snippet_name(raw: &str) -> anyhow::Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        bail!("snippet name must not be blank");
    }
    Ok(name.to_string())
}

/// Reads a whole file, or stdin when no path is given.
fn read_input(path: Option<&Path>) -> anyhow::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            Ok(buf)
        }
    }
}

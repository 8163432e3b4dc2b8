use std::fs;
use std::sync::{Arc, RwLock};

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flywheel::config::AppConfig;
use flywheel::db::{async_db, initialize_db, migrate_db, state_db};
use flywheel::embedding::{EmbedCache, Embedder, embedder_for};
use flywheel::fts::schema::{entity_schema, note_schema};
use flywheel::fts::utils::recreate_index;
use flywheel::pipeline::{IndexState, Pipeline};
use flywheel::score::{ScoreRequest, Strictness};
use flywheel::search::search_notes;
use flywheel::server::{self, AppState};
use flywheel::watch::run_watcher;
use flywheel::write::{self, WriteContext, WriteGuards};
use flywheel::{score, store};

#[derive(Subcommand)]
enum Command {
    /// Initialize the state db and search indices inside the vault
    Init {
        #[arg(long, action, default_value = "false")]
        db: bool,
        #[arg(long, action, default_value = "false")]
        index: bool,
    },
    /// Migrate the db schema and recreate the search indices
    Migrate {
        #[arg(long, action, default_value = "false")]
        db: bool,
        #[arg(long, action, default_value = "false")]
        index: bool,
    },
    /// Run the API server with the file watcher attached
    Serve {
        /// Set the server host address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Set the server port
        #[arg(long, default_value = "2224")]
        port: String,

        /// Index and serve without watching for changes
        #[arg(long, default_value = "false")]
        no_watch: bool,
    },
    /// Build the index once and exit
    Index {},
    /// Drop all derived state and rebuild from the markdown
    Rebuild {},
    /// Query the search index
    Query {
        #[arg(long)]
        term: String,
        #[arg(long, default_value = "false")]
        vector: bool,
    },
    /// Auto-link entity mentions across the whole vault
    Link {},
    /// Rank wikilink suggestions for a piece of content
    Suggest {
        #[arg(long)]
        content: String,
        #[arg(long, default_value = "")]
        path: String,
        #[arg(long, default_value = "balanced")]
        strictness: String,
        #[arg(long, default_value = "3")]
        max: usize,
    },
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=debug", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn build_pipeline(config: &AppConfig) -> Result<(Arc<Pipeline>, Option<Arc<dyn Embedder>>)> {
    fs::create_dir_all(&config.state_path)?;
    let db = async_db(&config.db_path()).await?;
    db.call(|conn| {
        initialize_db(conn)?;
        Ok(())
    })
    .await?;

    let embedder: Option<Arc<dyn Embedder>> = match embedder_for(&config.embedder) {
        Ok(embedder) => Some(Arc::from(embedder)),
        Err(err) => {
            tracing::warn!("Embedder unavailable, semantic scoring disabled: {}", err);
            None
        }
    };

    let pipeline = Arc::new(Pipeline {
        config: config.clone(),
        db,
        state: Arc::new(RwLock::new(IndexState::new())),
        embedder: embedder
            .clone()
            .unwrap_or_else(|| Arc::new(flywheel::embedding::HashEmbedder)),
        embed_cache: Arc::new(EmbedCache::default()),
    });
    Ok((pipeline, embedder))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let config = AppConfig::from_env()?;

    match args.command {
        Some(Command::Init { db, index }) => {
            if !db && !index {
                return Err(anyhow!("Missing value for init \"--db\" and/or \"--index\""));
            }
            if db {
                println!("Initializing db...");
                fs::create_dir_all(&config.state_path)?;
                let conn = state_db(&config.db_path())?;
                initialize_db(&conn)?;
                println!("Finished initializing db");
            }
            if index {
                println!("Initializing search indices...");
                fs::create_dir_all(config.notes_fts_path())?;
                fs::create_dir_all(config.entities_fts_path())?;
                println!("Finished initializing search indices");
            }
        }
        Some(Command::Migrate { db, index }) => {
            if db {
                println!("Migrating db...");
                let mut conn = state_db(&config.db_path())?;
                initialize_db(&conn)?;
                migrate_db(&mut conn)?;
                println!("Finished migrating db");
            }
            if index {
                println!("Migrating search indices...");
                recreate_index(&config.notes_fts_path(), note_schema())?;
                recreate_index(&config.entities_fts_path(), entity_schema())?;
                println!("Finished migrating search indices");
                println!("NOTE: You will need to re-populate them by running index");
            }
        }
        Some(Command::Serve {
            host,
            port,
            no_watch,
        }) => {
            let (pipeline, embedder) = build_pipeline(&config).await?;
            let app_state = Arc::new(RwLock::new(AppState::new(Arc::clone(&pipeline), embedder)));

            // Index in the background so the server can answer status
            // probes while it builds.
            let init_pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                if let Err(err) = init_pipeline.initialize().await {
                    tracing::error!("Index build failed: {}", err);
                }
            });

            if !no_watch {
                let (tx, rx) = mpsc::channel(64);
                let watch_config = config.clone();
                tokio::spawn(async move {
                    run_watcher(watch_config, tx).await;
                });
                let batch_pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    batch_pipeline.run(rx).await;
                });
            }

            server::serve(host, port, app_state).await;
        }
        Some(Command::Index {}) => {
            init_tracing();
            let (pipeline, _) = build_pipeline(&config).await?;
            pipeline.initialize().await?;
            println!("Indexed {} notes", {
                let state = pipeline.state.read().unwrap();
                state.vault.as_ref().map(|v| v.notes.len()).unwrap_or(0)
            });
        }
        Some(Command::Rebuild {}) => {
            init_tracing();
            println!("Deleting all derived state...");
            {
                let conn = state_db(&config.db_path())?;
                initialize_db(&conn)?;
                conn.execute_batch(
                    r"DELETE FROM entities;
                      DELETE FROM recency;
                      DELETE FROM cooccurrence;
                      DELETE FROM note_links;
                      DELETE FROM note_link_history;
                      DELETE FROM note_embedding_meta;
                      DELETE FROM entity_embedding_meta;
                      DELETE FROM vault_index_cache;
                      DELETE FROM note_tags;
                      DELETE FROM task_cache;
                      DELETE FROM metadata;",
                )?;
            }
            println!("Recreating search indices...");
            recreate_index(&config.notes_fts_path(), note_schema())?;
            recreate_index(&config.entities_fts_path(), entity_schema())?;

            let (pipeline, _) = build_pipeline(&config).await?;
            pipeline.initialize().await?;
            println!("Rebuild finished");
        }
        Some(Command::Query { term, vector }) => {
            let (pipeline, embedder) = build_pipeline(&config).await?;
            let index_dir = config.notes_fts_path();
            let embed_cache = Arc::clone(&pipeline.embed_cache);
            let results = pipeline
                .db
                .call(move |conn| {
                    Ok(search_notes(
                        &index_dir,
                        conn,
                        embedder.as_deref(),
                        &embed_cache,
                        vector,
                        &term,
                        20,
                    ))
                })
                .await?;
            println!("{}", json!({ "results": results }));
        }
        Some(Command::Link {}) => {
            init_tracing();
            let (pipeline, embedder) = build_pipeline(&config).await?;
            pipeline.initialize().await?;

            let guards = WriteGuards::default();
            let ctx = WriteContext {
                config: &pipeline.config,
                db: &pipeline.db,
                state: &pipeline.state,
                embedder: embedder.as_deref(),
                embed_cache: &pipeline.embed_cache,
                guards: &guards,
            };
            let report = write::link_vault(&ctx).await?;
            println!(
                "{}",
                json!({
                    "notes_changed": report.notes_changed,
                    "links_added": report.links_added,
                    "notes_skipped": report.notes_skipped,
                })
            );
        }
        Some(Command::Suggest {
            content,
            path,
            strictness,
            max,
        }) => {
            init_tracing();
            let strictness = Strictness::parse(&strictness)
                .ok_or_else(|| anyhow!("Unknown strictness {:?}", strictness))?;
            let (pipeline, embedder) = build_pipeline(&config).await?;
            pipeline.initialize().await?;

            let suggest_index = {
                let state = pipeline.state.read().unwrap();
                Arc::clone(&state.suggest)
            };
            let request = ScoreRequest {
                content,
                host_path: path,
                max_suggestions: max,
                strictness,
            };
            let suggestions = score::suggest(
                &suggest_index,
                embedder.as_deref(),
                &pipeline.embed_cache,
                &request,
            );
            println!("{}", json!({ "suggestions": suggestions }));
        }
        None => {
            println!("vault: {}", config.vault_path.display());
            println!("state: {}", config.state_path.display());
            let conn = state_db(&config.db_path()).ok();
            if let Some(conn) = conn {
                if let Ok(Some(value)) = store::events::metadata_get(&conn, "last_batch") {
                    println!("last batch: {}", value);
                }
            }
        }
    }

    Ok(())
}

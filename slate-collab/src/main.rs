//! `slate-server`: runs the whiteboard collaboration server and provides
//! operator commands against its RocksDB store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use slate_collab::auth::{TokenAuth, DEFAULT_TOKEN_TTL};
use slate_collab::server::{open_store, ServerConfig, SyncServer};
use slate_collab::storage::{Member, PermissionLevel, RocksStore, StoreConfig};

const DEFAULT_STORAGE: &str = "slate_data";

#[derive(Parser)]
#[command(name = "slate-server", about = "Real-time whiteboard collaboration server")]
struct Cli {
    /// RocksDB directory
    #[arg(long, global = true, env = "SLATE_STORAGE", default_value = DEFAULT_STORAGE)]
    storage: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket server (default when no subcommand given)
    Serve {
        /// Address to listen on
        #[arg(long, env = "SLATE_BIND", default_value = "127.0.0.1:9090")]
        bind: String,

        /// HS256 secret used to verify join tokens
        #[arg(long, env = "SLATE_JWT_SECRET")]
        jwt_secret: String,

        #[arg(long, env = "SLATE_MAX_PEERS", default_value_t = 100)]
        max_peers: usize,

        #[arg(long, default_value_t = 30)]
        heartbeat_secs: u64,

        /// Close silent connections after this many seconds (0 = never)
        #[arg(long, default_value_t = 90)]
        idle_timeout_secs: u64,

        /// Reject mutations from viewers and commenters
        #[arg(long, env = "SLATE_ENFORCE_EDIT")]
        enforce_edit_permission: bool,
    },
    /// Register a member
    AddMember {
        name: String,
        #[arg(long)]
        email: Option<String>,
    },
    /// Create an empty whiteboard
    CreateWhiteboard {
        title: String,
        #[arg(long)]
        owner: Uuid,
    },
    /// Grant a member access to a whiteboard
    Grant {
        whiteboard: Uuid,
        member: Uuid,
        /// viewer, commenter or editor
        #[arg(long, default_value = "editor")]
        level: String,
    },
    /// List stored whiteboards
    List,
    /// Mint a join token for a member
    Token {
        member: Uuid,
        #[arg(long, env = "SLATE_JWT_SECRET")]
        jwt_secret: String,
        /// Token lifetime in seconds
        #[arg(long, default_value_t = DEFAULT_TOKEN_TTL.as_secs())]
        ttl_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve {
            bind,
            jwt_secret,
            max_peers,
            heartbeat_secs,
            idle_timeout_secs,
            enforce_edit_permission,
        }) => {
            let config = ServerConfig {
                bind_addr: bind,
                max_peers_per_room: max_peers,
                heartbeat_interval_secs: heartbeat_secs,
                idle_timeout_secs,
                enforce_edit_permission,
                storage_path: Some(cli.storage),
                ..ServerConfig::default()
            };
            serve(config, jwt_secret).await
        }
        None => {
            let Ok(jwt_secret) = std::env::var("SLATE_JWT_SECRET") else {
                bail!("SLATE_JWT_SECRET must be set to run the server");
            };
            let config = ServerConfig {
                storage_path: Some(cli.storage),
                ..ServerConfig::default()
            };
            serve(config, jwt_secret).await
        }
        Some(Commands::AddMember { name, email }) => {
            let store = open_rocks(cli.storage)?;
            let mut member = Member::new(Uuid::new_v4(), name);
            member.email = email;
            store.put_member(&member)?;
            println!("{}", member.id);
            Ok(())
        }
        Some(Commands::CreateWhiteboard { title, owner }) => {
            let store = open_rocks(cli.storage)?;
            if store.load_member(owner)?.is_none() {
                bail!("no member with id {owner}");
            }
            let whiteboard = store.create_whiteboard(title, owner)?;
            println!("{}", whiteboard.id);
            Ok(())
        }
        Some(Commands::Grant {
            whiteboard,
            member,
            level,
        }) => {
            let Some(level) = PermissionLevel::parse(&level) else {
                bail!("unknown permission level '{level}'");
            };
            let store = open_rocks(cli.storage)?;
            store.load_metadata(whiteboard)?;
            store.put_permission(whiteboard, member, level)?;
            println!("{member} is now {} on {whiteboard}", level.as_str());
            Ok(())
        }
        Some(Commands::List) => {
            let store = open_rocks(cli.storage)?;
            for meta in store.list_whiteboards()? {
                println!(
                    "{}  v{:<6} {:>4} objects  {}",
                    meta.id, meta.version, meta.object_count, meta.title
                );
            }
            Ok(())
        }
        Some(Commands::Token {
            member,
            jwt_secret,
            ttl_secs,
        }) => {
            let auth = TokenAuth::new(jwt_secret).with_ttl(Duration::from_secs(ttl_secs));
            println!("{}", auth.issue(member)?);
            Ok(())
        }
    }
}

async fn serve(config: ServerConfig, jwt_secret: String) -> anyhow::Result<()> {
    if jwt_secret.is_empty() {
        bail!("JWT secret must not be empty");
    }
    let store = open_store(&config).context("failed to open whiteboard store")?;
    let auth = Arc::new(TokenAuth::new(jwt_secret));
    let server = SyncServer::new(config, auth, store);

    tokio::select! {
        result = server.run() => result.context("server stopped")?,
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down"),
    }
    Ok(())
}

fn open_rocks(path: PathBuf) -> anyhow::Result<RocksStore> {
    RocksStore::open(StoreConfig::new(&path))
        .with_context(|| format!("failed to open store at {}", path.display()))
}

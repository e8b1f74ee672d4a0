//! Scopesync CLI
//!
//! Runs an in-memory synchronization demo and validates server config files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use scopesync::client::MirrorCache;
use scopesync::host::NativeHost;
use scopesync::identity::ObjectId;
use scopesync::link::{ClientLink, MemoryLink};
use scopesync::protocol::{self, ClientMessage, Handshake, Query, ServerMessage};
use scopesync::scope::ScopeKind;
use scopesync::{Server, ServerConfig, Value, VERSION};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scopesync")]
#[command(author, version, about = "Reactive scope tree and object synchronization engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-memory session with several clients sharing a counter
    Demo {
        /// Number of connected clients
        #[arg(short, long, default_value_t = 2)]
        clients: usize,
        /// Increments issued per client
        #[arg(short, long, default_value_t = 2)]
        increments: usize,
        /// Server config file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Validate a server config file and print the effective settings
    CheckConfig {
        /// The config file
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Demo {
            clients,
            increments,
            config,
        } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => ServerConfig::default(),
            };
            run_demo(config, clients, increments)
        }
        Commands::CheckConfig { file } => {
            let config = load_config(&file)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path) -> anyhow::Result<ServerConfig> {
    ServerConfig::from_file(path).with_context(|| format!("invalid config '{}'", path.display()))
}

/// One simulated browser
struct DemoClient {
    name: String,
    memory: Arc<MemoryLink>,
    link: Arc<dyn ClientLink>,
    mirror: MirrorCache,
}

impl DemoClient {
    fn new(index: usize) -> Self {
        let memory = MemoryLink::new();
        let link: Arc<dyn ClientLink> = memory.clone();
        Self {
            name: format!("client-{}", index),
            memory,
            link,
            mirror: MirrorCache::new(),
        }
    }

    /// Feed queued server messages into the mirror, printing each one
    fn drain(&mut self) -> anyhow::Result<()> {
        for message in self.memory.take() {
            println!("  {} <- {}", self.name, protocol::encode(&message)?);
            self.mirror.apply(&message)?;
        }
        Ok(())
    }

    fn send(&self, server: &Server, message: ClientMessage) -> anyhow::Result<()> {
        println!("  {} -> {}", self.name, protocol::encode(&message)?);
        server.handle(&self.link, message)?;
        Ok(())
    }
}

fn run_demo(config: ServerConfig, clients: usize, increments: usize) -> anyhow::Result<()> {
    if clients == 0 {
        bail!("the demo needs at least one client");
    }
    println!("scopesync {} demo: {} clients, {} increments each", VERSION, clients, increments);

    let host = NativeHost::new()
        .on_create(ScopeKind::Page, |ctx, scope| {
            ctx.set(scope.object(), "count", 0.0)?;
            Ok(())
        })
        .method("increment", |ctx, this, _args| {
            let next = ctx.get(this, "count").as_number().unwrap_or(0.0) + 1.0;
            ctx.set(this, "count", next)?;
            Ok(Value::Number(next))
        });
    let server = Server::new(config);
    server.register_application(1, "counter", host.into_host());

    let mut peers: Vec<DemoClient> = (0..clients).map(DemoClient::new).collect();
    let mut callback = 0;
    let mut target = ObjectId(0);

    println!("\n# handshakes");
    for peer in peers.iter_mut() {
        callback += 1;
        peer.send(&server, ClientMessage::Handshake(Handshake::view(1, "demo", "home", callback)))?;
        for message in peer.memory.messages() {
            if let ServerMessage::HandshakeInform { target: bound, .. } = message {
                target = bound;
            }
        }
        peer.drain()?;
    }

    println!("\n# increments");
    for round in 0..increments {
        for i in 0..peers.len() {
            callback += 1;
            let query = Query::new("demo", callback, target, "increment");
            peers[i].send(&server, ClientMessage::Query(query))?;
            for peer in peers.iter_mut() {
                peer.drain()?;
            }
        }
        tracing::debug!(round, "round complete");
    }

    println!("\n# local edit from {}", peers[0].name);
    if let Some(serde_json::Value::Object(state)) = peers[0].mirror.live_mut(target) {
        state.insert("title".into(), serde_json::json!("edited locally"));
    }
    let edits = peers[0].mirror.diff(target);
    peers[0].mirror.acknowledge(target);
    for notify in edits {
        peers[0].send(&server, ClientMessage::Notify(notify))?;
    }
    for peer in peers.iter_mut() {
        peer.drain()?;
    }

    println!("\n# final state");
    for peer in &peers {
        let state = peer.mirror.materialize(target).unwrap_or_default();
        println!("  {}: {}", peer.name, state);
    }
    if let Some(channel) = server.session(1, "demo").and_then(|s| s.channel()) {
        let stats = channel.stats();
        println!(
            "  channel: {} broadcasts, {} delivered, {} suppressed, {} failed",
            stats.broadcasts, stats.delivered, stats.suppressed, stats.failed
        );
    }

    for peer in &peers {
        server.disconnect(peer.memory.id());
    }
    Ok(())
}

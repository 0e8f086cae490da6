//! agentbusd - coordination daemon for AI coding agents
//!
//! `agentbusd` (or `agentbusd run`) starts the daemon. The other subcommands
//! talk to a running daemon over its socket, or run the relay broker.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use agentbus::daemon::{Client, Daemon, Request, Response};
use agentbus::events::{EventFilter, EventType};
use agentbus::messaging::{Intent, OutgoingMessage};
use agentbus::relay::{serve_broker, BrokerCore, ControlAction};
use agentbus::sessions::{SessionStatus, ToolKind};
use agentbus::{Bus, DaemonConfig};
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// agentbusd - message bus and event log for agent sessions
#[derive(Parser, Debug)]
#[command(name = "agentbusd")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/agentbus/config.json)
    #[arg(short, long, global = true, env = "AGENTBUS_CONFIG")]
    config: Option<PathBuf>,

    /// Socket path override
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Enable debug logging (equivalent to RUST_LOG=debug)
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    /// Enable verbose logging (equivalent to RUST_LOG=trace)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Run {
        /// Database path override
        #[arg(long)]
        db: Option<PathBuf>,
        /// Relay broker address (host:port)
        #[arg(long)]
        relay_url: Option<String>,
        /// Relay namespace shared by cooperating devices
        #[arg(long)]
        relay_id: Option<String>,
        /// Disable the relay even if configured
        #[arg(long)]
        no_relay: bool,
    },
    /// Run a relay broker for several daemons
    Broker {
        #[arg(long, default_value = "127.0.0.1:7883")]
        listen: String,
    },
    /// Print the effective configuration
    Config {
        /// Print only the config file path
        #[arg(long)]
        path: bool,
    },
    /// Check that the daemon answers
    Ping,
    /// Print daemon health as JSON
    Health,
    /// List sessions
    Sessions {
        #[arg(long)]
        status: Option<SessionStatus>,
    },
    /// Send a message
    Send {
        #[arg(long)]
        from: String,
        /// Explicit recipient (repeatable)
        #[arg(long = "to")]
        to: Vec<String>,
        #[arg(long)]
        thread: Option<String>,
        #[arg(long)]
        reply_to: Option<u64>,
        #[arg(long)]
        broadcast: bool,
        #[arg(long)]
        request: bool,
        body: Vec<String>,
    },
    /// Stop or start a session on another device (`name:DEVICE`)
    Remote {
        action: ControlAction,
        session: String,
    },
    /// Forward a native hook payload read from stdin
    Hook {
        #[arg(long)]
        tool: ToolKind,
        /// Bus identity to record instead of the tool's session id
        #[arg(long)]
        origin: Option<String>,
    },
    /// Stream events as JSON lines
    Tail {
        /// Event types to include (repeatable)
        #[arg(long = "type")]
        types: Vec<EventType>,
        /// Replay stored events after this sequence number first
        #[arg(long)]
        from: Option<u64>,
        /// Payload predicate, e.g. `path ~ "src/"`
        #[arg(long = "where")]
        predicate: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.verbose);

    let mut config = DaemonConfig::load_or_default(args.config.as_deref())?;
    config.apply_env()?;
    if let Some(socket) = &args.socket {
        config.socket_path = socket.clone();
    }

    match args.command.unwrap_or(Command::Run {
        db: None,
        relay_url: None,
        relay_id: None,
        no_relay: false,
    }) {
        Command::Run {
            db,
            relay_url,
            relay_id,
            no_relay,
        } => {
            if let Some(db) = db {
                config.db_path = db;
            }
            if let Some(url) = relay_url {
                config.relay.url = Some(url);
            }
            if let Some(id) = relay_id {
                config.relay.namespace = id;
            }
            if no_relay {
                config.relay.enabled = false;
            }
            config.validate()?;
            runtime()?.block_on(run_daemon(config))
        }
        Command::Broker { listen } => runtime()?.block_on(run_broker(listen)),
        Command::Config { path } => {
            if path {
                let path = args.config.unwrap_or_else(DaemonConfig::default_config_path);
                println!("{}", path.display());
            } else {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            Ok(())
        }
        Command::Ping => runtime()?.block_on(one_shot(&config, Request::Ping)),
        Command::Health => runtime()?.block_on(one_shot(&config, Request::Health)),
        Command::Sessions { status } => {
            runtime()?.block_on(one_shot(&config, Request::ListSessions { status }))
        }
        Command::Send {
            from,
            to,
            thread,
            reply_to,
            broadcast,
            request,
            body,
        } => {
            let mut message = OutgoingMessage::new(from, body.join(" "));
            message.mentions = to;
            message.thread = thread;
            message.reply_to = reply_to;
            if broadcast {
                message = message.broadcast();
            }
            if request {
                message = message.intent(Intent::Request);
            }
            runtime()?.block_on(one_shot(&config, Request::Send { message }))
        }
        Command::Remote { action, session } => {
            runtime()?.block_on(one_shot(&config, Request::RelayControl { action, session }))
        }
        Command::Hook { tool, origin } => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            let payload = serde_json::from_str(&input).context("hook payload is not JSON")?;
            runtime()?.block_on(one_shot(
                &config,
                Request::IngestNative {
                    tool,
                    origin,
                    payload,
                },
            ))
        }
        Command::Tail {
            types,
            from,
            predicate,
        } => {
            let filter = EventFilter {
                types,
                predicate,
                ..Default::default()
            };
            runtime()?.block_on(tail(&config, filter, from))
        }
    }
}

fn init_tracing(debug: bool, verbose: bool) {
    let default_filter = if verbose {
        "trace"
    } else if debug {
        "debug"
    } else {
        "warn" // Quiet by default for normal use
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if debug || verbose {
        tracing::info!("Debug logging enabled");
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

async fn run_daemon(config: DaemonConfig) -> anyhow::Result<()> {
    let bus = Arc::new(Bus::open(&config).context("failed to open event store")?);
    let daemon = Daemon::start(bus, &config).await?;
    eprintln!("agentbusd listening on {}", daemon.socket_path().display());

    tokio::select! {
        _ = daemon.stopped() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Interrupted");
        }
    }
    daemon.stop().await;
    Ok(())
}

async fn run_broker(listen: String) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    eprintln!("agentbusd broker listening on {}", listener.local_addr()?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let server = tokio::spawn(serve_broker(listener, Arc::new(BrokerCore::new()), shutdown_rx));
    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(true);
    server.await??;
    Ok(())
}

async fn connect(config: &DaemonConfig) -> anyhow::Result<Client> {
    Client::connect(&config.socket_path)
        .await
        .with_context(|| format!("daemon not reachable at {}", config.socket_path.display()))
}

/// Send one request and print the response as JSON. Error frames fail the command.
async fn one_shot(config: &DaemonConfig, request: Request) -> anyhow::Result<()> {
    let mut client = connect(config).await?;
    let response = client.request(&request).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if let Response::Error { kind, message } = response {
        anyhow::bail!("{}: {}", kind, message);
    }
    Ok(())
}

async fn tail(config: &DaemonConfig, filter: EventFilter, from: Option<u64>) -> anyhow::Result<()> {
    let mut client = connect(config).await?;
    if let Response::Error { kind, message } = client.request(&Request::Subscribe { filter, from }).await? {
        anyhow::bail!("{}: {}", kind, message);
    }
    loop {
        tokio::select! {
            frame = client.recv() => match frame? {
                Response::Event { event, .. } => println!("{}", serde_json::to_string(&event)?),
                Response::Gap { missed, resume_after, .. } => {
                    eprintln!("... {} events dropped (query --after {} to re-read)", missed, resume_after)
                }
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

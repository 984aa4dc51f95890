//! # rinvoke CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Host the echo and events handlers
//! rinvoke serve socket://0.0.0.0:5400
//!
//! # One invocation, raw JSON on stdout
//! rinvoke call socket://127.0.0.1:5400 echo -p '{"hello": "world"}'
//!
//! # Print callbacks published to the events subsystem
//! rinvoke listen bisocket://127.0.0.1:5401 events
//! ```
//!
//! Locators take the usual query parameters, e.g.
//! `http://127.0.0.1:8080/?timeout=5000&serializationtype=postcard`.

use std::sync::Arc;

use anyhow::{Context, Result};
use argh::FromArgs;
use rinvoke_cli::handlers::{EchoHandler, EventsHandler, ECHO, EVENTS};
use rinvoke_cli::{parse_metadata, parse_payload};
use rinvoke_client::Client;
use rinvoke_common::{Callback, ConnectionFailureEvent, Locator};
use rinvoke_server::Connector;
use tokio::sync::mpsc;

#[derive(FromArgs)]
/// rinvoke - transport-agnostic remote invocation
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    Listen(ListenArgs),
}

/// Hosts the built-in `echo` and `events` handlers.
///
/// The bound locator is printed on stdout once the listener is up, which
/// resolves port 0 for scripts.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// host the echo and events handlers on a locator
struct ServeArgs {
    /// locator to bind, e.g. socket://0.0.0.0:5400
    #[argh(positional)]
    locator: String,
}

/// Makes one invocation and prints the raw JSON result, so output can be
/// piped to `jq`.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// invoke a subsystem and print the JSON result
struct CallArgs {
    /// locator of the server
    #[argh(positional)]
    locator: String,

    /// subsystem to invoke
    #[argh(positional)]
    subsystem: String,

    /// payload as JSON; bare words are sent as strings. Defaults to null
    #[argh(option, short = 'p', default = "\"null\".into()")]
    payload: String,

    /// request metadata as key=value, repeatable
    #[argh(option, short = 'm', long = "meta")]
    metadata: Vec<String>,

    /// send as a oneway invocation and print nothing
    #[argh(switch)]
    oneway: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "listen")]
/// register a callback listener and print callbacks as JSON lines
struct ListenArgs {
    /// locator of the server
    #[argh(positional)]
    locator: String,

    /// subsystem to listen to
    #[argh(positional)]
    subsystem: String,

    /// exit after this many callbacks
    #[argh(option, short = 'n')]
    count: Option<usize>,

    /// host a callback server here instead of polling (HTTP transports)
    #[argh(option, long = "callback-locator")]
    callback_locator: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // `call` output stays clean for piping
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Listen(args) => run_listen(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut connector = Connector::parse(&args.locator)?;
    connector.add_invocation_handler(ECHO, Arc::new(EchoHandler));
    connector.add_invocation_handler(EVENTS, Arc::new(EventsHandler));
    connector.add_connection_listener(Arc::new(|event: &ConnectionFailureEvent| {
        tracing::warn!("{}", event);
    }));
    connector.start().await?;

    tracing::info!("Serving {:?} on {}", connector.subsystems(), connector.locator());
    println!("{}", connector.locator());

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    tracing::info!("Shutting down");
    connector.destroy().await?;
    Ok(())
}

async fn run_call(args: CallArgs) -> Result<()> {
    let payload = parse_payload(&args.payload);
    let metadata = parse_metadata(&args.metadata)?;

    let client = Client::parse(&args.locator, &args.subsystem)?;
    client
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", args.locator))?;

    let outcome = if args.oneway {
        client.invoke_oneway(payload, metadata, false).await.map(|_| None)
    } else {
        client.invoke(payload, metadata).await.map(Some)
    };
    client.disconnect().await?;

    if let Some(result) = outcome? {
        println!("{}", serde_json::to_string(&result)?);
    }
    Ok(())
}

async fn run_listen(args: ListenArgs) -> Result<()> {
    let mut client = Client::parse(&args.locator, &args.subsystem)?;
    if let Some(callback_locator) = &args.callback_locator {
        let callback_locator: Locator = callback_locator.parse()?;
        client = client.with_callback_locator(callback_locator);
    }
    client.add_connection_listener(Arc::new(|event: &ConnectionFailureEvent| {
        tracing::error!("{}", event);
    }));
    client.connect().await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Callback>();
    let listener_id = client
        .add_listener(
            Arc::new(move |callback: &Callback| {
                let _ = tx.send(callback.clone());
            }),
            Default::default(),
            None,
        )
        .await?;
    tracing::info!(
        "Listening to {} as {} ({:?} delivery)",
        args.subsystem,
        listener_id,
        client.callback_mode()
    );

    let mut received = 0;
    loop {
        tokio::select! {
            callback = rx.recv() => {
                let Some(callback) = callback else { break };
                println!("{}", serde_json::to_string(&callback.payload)?);
                received += 1;
                if args.count.is_some_and(|count| received >= count) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect().await?;
    Ok(())
}

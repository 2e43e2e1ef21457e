//! docsync-server: the relay binary.
//!
//! Uses the same docsync-core as every client, but runs as a native process
//! terminating WebSocket connections instead of a daemon dialing out to
//! peers.
//!
//! Grounded on `sync-daemon/src/main.rs`'s `clap::Parser` args, `FmtSubscriber`
//! init, and `tokio::select!` main loop with `ctrl_c()` shutdown —
//! restructured around a single `Relay` instead of a `Vault` + file
//! watcher, since this process has no local filesystem to watch.

use std::sync::Arc;

use clap::Parser;
use docsync_core::{AuthPayload, DocType, InMemoryServerProvider, LoroBinding, LoroOperations, LoroSnapshot};
use loro::{ExportMode, LoroDoc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use docsync_server::relay::{AuthContext, BoxFuture, Relay};
use docsync_server::{run_event_loop, WebSocketServer};

#[derive(Parser, Debug)]
#[command(name = "docsync-server")]
#[command(about = "Local-first document sync relay")]
struct Args {
    /// Address to listen on for incoming connections.
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Unsquashed operations a doc accumulates before the relay
    /// materializes a snapshot and compacts its log (spec §4.4.2 step 3,
    /// §9 "server squash threshold").
    #[arg(long, default_value_t = 100)]
    squash_threshold: usize,

    /// Accept any non-empty token, using it verbatim as the user id.
    ///
    /// The spec places the authentication scheme out of scope for the core
    /// library (§1); this flag is the relay binary's only built-in
    /// validator, meant for local development and the end-to-end tests,
    /// never production deployments.
    #[arg(long)]
    dev_accept_any_token: bool,

    /// Enable verbose (debug-level) logging.
    #[arg(long)]
    verbose: bool,
}

/// Materialize a squashed snapshot from an optional prior snapshot plus the
/// operations accumulated since, by replaying them through a scratch
/// `LoroDoc`. Used as the `InMemoryServerProvider`'s `squash` callback; kept
/// in the binary rather than `docsync-core` because it is specific to the
/// reference `LoroBinding` wire format, not part of the `ServerProvider`
/// contract itself.
fn loro_squash(base: Option<&LoroSnapshot>, ops: &[LoroOperations]) -> LoroSnapshot {
    let doc_type = base
        .map(|s| s.doc_type.clone())
        .or_else(|| ops.first().map(|o| o.doc_type.clone()))
        .unwrap_or_else(|| DocType::new("unknown"));

    let scratch = LoroDoc::new();
    if let Some(snapshot) = base {
        let _ = scratch.import(&snapshot.bytes);
    }
    for op in ops {
        let _ = scratch.import(&op.bytes);
    }
    scratch.commit();

    LoroSnapshot { doc_type, bytes: scratch.export(ExportMode::Snapshot).unwrap() }
}

fn dev_authenticator(accept_any: bool) -> Arc<dyn Fn(AuthPayload) -> BoxFuture<'static, Option<AuthContext>> + Send + Sync> {
    Arc::new(move |auth: AuthPayload| {
        Box::pin(async move {
            accept_any.then(|| AuthContext { user_id: auth.token, context: serde_json::Value::Null })
        })
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    info!(listen = %args.listen, squash_threshold = args.squash_threshold, "starting docsync-server");

    // The reference binding only exists here to validate doc types at
    // startup the way a real deployment sharing this binding between
    // client and server would; the relay itself never constructs documents.
    let _binding = LoroBinding::new(vec![DocType::new("note")], 0)?;

    let provider = Arc::new(
        InMemoryServerProvider::new(Arc::new(loro_squash)).with_squash_threshold(args.squash_threshold),
    );

    let relay = Arc::new(Relay::new(provider, dev_authenticator(args.dev_accept_any_token), None));
    let (mut server, event_rx) = WebSocketServer::new(relay.clone());
    let listener = WebSocketServer::<InMemoryServerProvider<LoroOperations, LoroSnapshot>>::bind(&args.listen).await?;

    tokio::spawn(run_event_loop(relay, event_rx));

    info!("relay running, press ctrl+c to stop");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => server.accept_connection(stream, addr).await,
                    Err(e) => error!(error = %e, "failed to accept connection"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    info!("shutting down");
    Ok(())
}

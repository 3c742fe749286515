//! lsp-sidecar: multiplexes LSP traffic between many host sessions and a
//! capped pool of language-server child processes.
//!
//! Control is a newline-delimited JSON protocol on stdin/stdout; LSP traffic
//! never appears on this process's own stdio except as framed bytes destined
//! for (or arriving from) a child language server.

use anyhow::Result;
use tokio::sync::mpsc::UnboundedSender;
use tracing_subscriber::EnvFilter;

use lsp_sidecar::control::{self, InboundEnvelope, OutboundEnvelope};
use lsp_sidecar::dispatcher::{self, Event, Sidecar};
use lsp_sidecar::policy::Policy;
use lsp_sidecar::resolver::{LanguageServerResolver, PathResolver};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let policy = Policy::from_env();
    let resolver: Box<dyn LanguageServerResolver> = Box::new(PathResolver::new());
    let outbound = control::spawn_writer(tokio::io::stdout());

    let (sidecar, events_rx) = Sidecar::new(policy, resolver, outbound.clone());
    let events_tx = sidecar.events_sender();

    spawn_control_reader(events_tx.clone());
    spawn_signal_handler(events_tx);

    outbound.send(OutboundEnvelope::Ready {
        pid: std::process::id(),
        started_at: dispatcher::now_millis(),
    });

    let exit_code = sidecar.run(events_rx).await;
    std::process::exit(exit_code)
}

/// Read control envelopes from stdin until EOF. An EOF that wasn't preceded
/// by an explicit `shutdown` means the parent went away without warning —
/// treated as the transport-fatal case (§7 class 1).
fn spawn_control_reader(events_tx: UnboundedSender<Event>) {
    tokio::spawn(async move {
        control::read_inbound(tokio::io::stdin(), |envelope| {
            let _ = events_tx.send(Event::Inbound(envelope));
        })
        .await;
        let _ = events_tx.send(Event::Fatal("control channel closed unexpectedly".to_string()));
    });
}

/// Treat SIGINT/SIGTERM as an orderly `shutdown` request.
fn spawn_signal_handler(events_tx: UnboundedSender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                tracing::warn!("failed to install SIGTERM handler");
                return;
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = events_tx.send(Event::Inbound(InboundEnvelope::Shutdown));
    });
}

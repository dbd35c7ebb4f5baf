//! Signal handling for a sync run.
//!
//! The first SIGINT, SIGTERM or SIGHUP cancels the run's
//! [`CancellationToken`]: indexing stops between pages and the download
//! pass finishes what is in flight. Committed progress is already in the
//! ledger, so nothing else needs saving. Any further signal exits at once.

use std::fmt;

use tokio_util::sync::CancellationToken;

/// Exit status after a forced exit, as for a shell killed by SIGINT.
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Interrupt,
    #[cfg_attr(not(unix), allow(dead_code))]
    Terminate,
    #[cfg_attr(not(unix), allow(dead_code))]
    Hangup,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Hangup => "SIGHUP",
        })
    }
}

/// Registered signal listeners.
struct Listeners {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl Listeners {
    fn register() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                terminate: signal(SignalKind::terminate())?,
                hangup: signal(SignalKind::hangup())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    #[cfg(unix)]
    async fn next(&mut self) -> std::io::Result<Signal> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|()| Signal::Interrupt),
            _ = self.terminate.recv() => Ok(Signal::Terminate),
            _ = self.hangup.recv() => Ok(Signal::Hangup),
        }
    }

    #[cfg(not(unix))]
    async fn next(&mut self) -> std::io::Result<Signal> {
        tokio::signal::ctrl_c().await.map(|()| Signal::Interrupt)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Response {
    /// The run was asked to stop and drain.
    Drain,
    ForceExit,
}

/// Tracks how many signals the run has received.
struct Escalation {
    token: CancellationToken,
    received: u32,
}

impl Escalation {
    fn new(token: CancellationToken) -> Self {
        Self { token, received: 0 }
    }

    fn on_signal(&mut self, signal: Signal) -> Response {
        self.received += 1;
        if self.received > 1 {
            tracing::warn!(signal = %signal, "Second signal received, exiting immediately");
            return Response::ForceExit;
        }
        tracing::info!(
            signal = %signal,
            "Stopping after in-flight downloads; signal again to exit immediately"
        );
        self.token.cancel();
        Response::Drain
    }
}

/// Register signal listeners and return the token they cancel.
///
/// Fails if a listener cannot be registered.
pub(crate) fn install_signal_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut listeners = Listeners::register()?;
    let mut escalation = Escalation::new(token.clone());

    tokio::spawn(async move {
        loop {
            let signal = match listeners.next().await {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!(error = %e, "Stopped listening for signals");
                    return;
                }
            };
            if escalation.on_signal(signal) == Response::ForceExit {
                std::process::exit(FORCED_EXIT_CODE);
            }
        }
    });

    Ok(token)
}

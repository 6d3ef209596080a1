use crate::error::Result;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}

/// Forward the usual termination signals as `Signal::Shutdown`. Jobs check the receiver between
/// batches, so a batch in flight always finishes or rolls back as a whole.
pub fn listen() -> Result<broadcast::Receiver<Signal>> {
    let (tx, rx) = broadcast::channel(4);

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = int.recv() => "SIGINT",
            _ = term.recv() => "SIGTERM",
            _ = hup.recv() => "SIGHUP",
            _ = quit.recv() => "SIGQUIT",
        };
        info!(signal = name, "Shutdown requested, stopping after the current batch");
        // nobody listening means the job is already done
        let _ = tx.send(Signal::Shutdown);
    });
    Ok(rx)
}

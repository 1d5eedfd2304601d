//! Process-level termination handling: installs exactly one OS signal
//! listener per process and cancels every registered client's context when
//! it fires, so a second [`install`] call chains onto the first instead of
//! clobbering it.

use std::sync::{Mutex, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

static REGISTRY: OnceLock<Mutex<Vec<CancellationToken>>> = OnceLock::new();
static LISTENER_INSTALLED: OnceLock<()> = OnceLock::new();

fn registry() -> &'static Mutex<Vec<CancellationToken>> {
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Registers `ctx` to be cancelled on SIGINT/SIGTERM. Spawns the listener
/// task only on the first call; later calls just add `ctx` to the set that
/// gets cancelled when it fires.
pub fn install(ctx: CancellationToken) {
    registry().lock().unwrap().push(ctx);

    if LISTENER_INSTALLED.set(()).is_ok() {
        tokio::spawn(async {
            wait_for_termination().await;
            info!("termination signal received, cancelling all registered clients");
            for token in registry().lock().unwrap().iter() {
                token.cancel();
            }
        });
    } else {
        debug!("signal listener already installed, chaining new client onto it");
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn install_is_idempotent_about_the_listener_task() {
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        install(a.clone());
        install(b.clone());
        assert!(registry().lock().unwrap().len() >= 2);
    }
}

//! Background memory monitor.

use crate::context::GraphContext;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Timer thread that samples the memory probe and evicts under pressure
pub(crate) struct Monitor {
    shutdown: Sender<()>,
    thread: JoinHandle<()>,
}

impl Monitor {
    /// Start sampling every `interval`. The thread exits when stopped or
    /// when the graph context goes away.
    pub fn spawn(ctx: Weak<GraphContext>, interval: Duration) -> std::io::Result<Self> {
        let (shutdown, signal) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("spillgraph-evict".to_string())
            .spawn(move || loop {
                match signal.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let Some(ctx) = ctx.upgrade() else {
                    break;
                };
                if ctx.is_closed() {
                    break;
                }
                match ctx.eviction.relieve_pressure(&ctx) {
                    Ok(0) => {}
                    Ok(n) => debug!("Memory monitor evicted {} bodies", n),
                    Err(e) => warn!("Background eviction failed: {}", e),
                }
            })?;

        debug!("Memory monitor started ({:?} interval)", interval);
        Ok(Self { shutdown, thread })
    }

    /// Signal the thread and wait for it to exit
    pub fn stop(self) {
        let _ = self.shutdown.send(());
        if self.thread.join().is_err() {
            warn!("Memory monitor thread panicked");
        }
    }
}

use std::collections::HashSet;
use std::time::Duration;

use bitcoin::Txid;
use smol::channel::{Receiver, Sender};
use smol_timeout::TimeoutExt;

use crate::flow::FlowControl;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to the confirmation watcher.
///
/// The watcher only records interest for now. A confirmation detector plugged in
/// here would, on confirming a watched transaction, tell the tracker to mark its
/// outputs confirmed (and reset their ancestor depth) and tell the relay buffer
/// to evict the corresponding record.
#[derive(Clone)]
pub struct BlockWatcher {
    watch_send: Sender<Txid>,
}

impl BlockWatcher {
    pub fn spawn(flow: FlowControl) -> (Self, smol::Task<()>) {
        let (watch_send, watch_recv) = smol::channel::unbounded();
        let task = smolscale::spawn(run(flow, watch_recv));
        (Self { watch_send }, task)
    }

    /// Registers interest in the confirmation of `txid`.
    pub fn watch(&self, txid: Txid) {
        let _ = self.watch_send.try_send(txid);
    }
}

async fn run(flow: FlowControl, watch_recv: Receiver<Txid>) {
    let mut watched: HashSet<Txid> = HashSet::new();
    while !flow.is_shutting_down() {
        match watch_recv.recv().timeout(POLL_INTERVAL).await {
            Some(Ok(txid)) => {
                if watched.insert(txid) {
                    log::info!("watching for confirmation of {}", txid);
                }
            }
            // every handle dropped, nothing left to watch for
            Some(Err(_)) => break,
            None => continue,
        }
    }
    log::debug!("block watcher exiting with {} transactions watched", watched.len());
}

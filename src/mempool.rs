use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::{Transaction, Txid};
use smol::channel::{Receiver, Sender};
use smol_timeout::TimeoutExt;

use crate::blockwatcher::BlockWatcher;
use crate::flow::FlowControl;
use crate::peer::PeerSession;
use crate::utxodb::UtxoDb;

/// Pause generation once this many transactions are held.
const HARD_CAP: u64 = 10_000;
/// Resume generation once the held count drops below this. Kept well under the
/// hard cap so the generation flag does not flap around a single threshold.
const SOFT_CAP: u64 = 5_000;
/// Max entries in one inv announcement, must be <= 50000.
const MAX_INV_ENTRIES: usize = 5_000;
/// Announce at most once per this interval.
const INV_INTERVAL: Duration = Duration::from_secs(1);
/// Re-announce a record this long after its last announcement if it has never
/// been fetched.
const INV_RESEND: Duration = Duration::from_secs(60);
const STATUS_INTERVAL: Duration = Duration::from_secs(60);
/// Bound on the wait for the actor's reply to a data request.
const SERVE_TIMEOUT: Duration = Duration::from_secs(1);
/// How long the actor waits for a command before doing housekeeping.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A transaction held for relay, with announcement bookkeeping.
struct TxRecord {
    tx: Transaction,
    announced_at: Option<Instant>,
    served_at: Option<Instant>,
}

enum MemPoolCmd {
    Accept(Transaction),
    ServeData {
        items: Vec<Txid>,
        reply: Sender<Vec<Transaction>>,
    },
}

/// Handle to the relay-buffer actor.
#[derive(Clone)]
pub struct MemPool {
    cmd_send: Sender<MemPoolCmd>,
}

impl MemPool {
    pub fn spawn(
        flow: FlowControl,
        peers: Arc<dyn PeerSession>,
        utxodb: UtxoDb,
        watcher: BlockWatcher,
    ) -> (Self, smol::Task<()>) {
        let (cmd_send, cmd_recv) = smol::channel::unbounded();
        let actor = MemPoolActor {
            flow,
            peers,
            utxodb,
            watcher,
            held: 0,
            relayed: 0,
            tx_map: HashMap::new(),
            announce_queue: VecDeque::new(),
            resend_queue: VecDeque::new(),
            last_inv: None,
            last_status: None,
        };
        let task = smolscale::spawn(actor.run(cmd_recv));
        (Self { cmd_send }, task)
    }

    /// Queues a freshly built transaction for announcement. Asynchronous.
    pub fn accept(&self, tx: Transaction) {
        let _ = self.cmd_send.try_send(MemPoolCmd::Accept(tx));
    }

    /// Serves a peer data request: returns every requested transaction still in
    /// the buffer, or `None` if the actor does not reply within the bound.
    pub async fn serve_data_request(&self, items: Vec<Txid>) -> Option<Vec<Transaction>> {
        let (reply_send, reply_recv) = smol::channel::bounded(1);
        self.cmd_send
            .try_send(MemPoolCmd::ServeData {
                items,
                reply: reply_send,
            })
            .ok()?;
        reply_recv.recv().timeout(SERVE_TIMEOUT).await?.ok()
    }
}

struct MemPoolActor {
    flow: FlowControl,
    peers: Arc<dyn PeerSession>,
    utxodb: UtxoDb,
    watcher: BlockWatcher,
    held: u64,
    relayed: u64,
    tx_map: HashMap<Txid, TxRecord>,
    announce_queue: VecDeque<Txid>,
    resend_queue: VecDeque<Txid>,
    last_inv: Option<Instant>,
    last_status: Option<Instant>,
}

impl MemPoolActor {
    async fn run(mut self, cmd_recv: Receiver<MemPoolCmd>) {
        while !self.flow.is_shutting_down() {
            match cmd_recv.recv().timeout(POLL_INTERVAL).await {
                Some(Ok(cmd)) => self.perform(cmd),
                Some(Err(_)) => break,
                None => {
                    // nothing queued, catch up on housekeeping
                    let now = Instant::now();
                    self.maybe_announce(now);
                    self.maybe_log_status(now);
                }
            }
            self.check_admission();
        }
        log::debug!("mempool exiting: {} held, {} relayed", self.held, self.relayed);
    }

    fn perform(&mut self, cmd: MemPoolCmd) {
        match cmd {
            MemPoolCmd::Accept(tx) => {
                let txid = tx.compute_txid();
                log::debug!("mempool: received transaction {}", txid);
                self.tx_map.insert(
                    txid,
                    TxRecord {
                        tx,
                        announced_at: None,
                        served_at: None,
                    },
                );
                self.announce_queue.push_back(txid);
                self.held += 1;
            }
            MemPoolCmd::ServeData { items, reply } => {
                let served = self.serve(items);
                // if the requester has already given up, the reply is abandoned
                let _ = reply.try_send(served);
            }
        }
    }

    /// Answers a getdata request: each requested transaction still indexed is
    /// returned, stamped, reported to the tracker as relayed, and watched for
    /// confirmation.
    fn serve(&mut self, items: Vec<Txid>) -> Vec<Transaction> {
        let mut served = Vec::new();
        for txid in items {
            if let Some(record) = self.tx_map.get_mut(&txid) {
                record.served_at = Some(Instant::now());
                served.push(record.tx.clone());
                self.utxodb.notify_relayed(record.tx.clone());
                self.watcher.watch(txid);
                self.relayed += 1;
            }
        }
        served
    }

    /// Admission hysteresis: pause the generator at the hard cap, resume it only
    /// once the buffer has drained below the soft cap.
    fn check_admission(&mut self) {
        let enabled = self.flow.is_generation_enabled();
        if enabled && self.held >= HARD_CAP {
            log::info!("mempool at {} transactions, pausing generation", self.held);
            self.flow.set_generation_enabled(false);
        } else if !enabled && self.held < SOFT_CAP {
            log::info!(
                "mempool down to {} transactions, resuming generation",
                self.held
            );
            self.flow.set_generation_enabled(true);
        }
    }

    /// Sends one batched inv per interval: newly queued records first, then due
    /// resends that were never fetched. Served records drop out of the resend
    /// rotation.
    fn maybe_announce(&mut self, now: Instant) {
        if let Some(last) = self.last_inv {
            if now.duration_since(last) < INV_INTERVAL {
                return;
            }
        }
        let mut batch: Vec<Txid> = Vec::new();
        while batch.len() < MAX_INV_ENTRIES {
            match self.announce_queue.pop_front() {
                Some(txid) => batch.push(txid),
                None => break,
            }
        }
        while batch.len() < MAX_INV_ENTRIES {
            let due = match self.resend_queue.front() {
                Some(txid) => match self.tx_map.get(txid) {
                    Some(record) => match record.announced_at {
                        Some(at) => now.duration_since(at) >= INV_RESEND,
                        None => true,
                    },
                    // evicted in the meantime, flush it from the queue
                    None => true,
                },
                None => break,
            };
            if !due {
                break;
            }
            let txid = self.resend_queue.pop_front().expect("front was just due");
            match self.tx_map.get(&txid) {
                Some(record) if record.served_at.is_none() => batch.push(txid),
                // already fetched (or gone): no further announcements
                _ => {}
            }
        }
        if batch.is_empty() {
            return;
        }
        self.last_inv = Some(now);
        for txid in &batch {
            if let Some(record) = self.tx_map.get_mut(txid) {
                record.announced_at = Some(now);
            }
            self.resend_queue.push_back(*txid);
        }
        let count = batch.len();
        self.peers.announce(batch);
        log::info!("announced {} transactions to peers", count);
    }

    fn maybe_log_status(&mut self, now: Instant) {
        if let Some(last) = self.last_status {
            if now.duration_since(last) < STATUS_INTERVAL {
                return;
            }
        }
        log::info!(
            "mempool status: {} transactions held, {} relayed",
            self.held,
            self.relayed
        );
        self.last_status = Some(now);
    }
}

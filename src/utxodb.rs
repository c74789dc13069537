use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use bitcoin::bip32::Xpriv;
use bitcoin::{Network, ScriptBuf, Transaction, Txid};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use smol::channel::{Receiver, Sender};
use smol_timeout::TimeoutExt;
use stdcode::StdcodeSerializeExt;

use crate::blockwatcher::BlockWatcher;
use crate::flow::FlowControl;

/// Number of unconfirmed ancestors an output may have before it must wait for a
/// confirmation.
pub const MAX_ANCESTOR_DEPTH: u32 = 1;

/// How long the actor waits for a command before re-checking the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A spendable transaction output tracked by the daemon.
///
/// Durably stored from the moment it is known (deposit or change) until it is
/// consumed as the input of a later relayed transaction.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrackedUtxo {
    pub txid: Txid,
    pub vout: u32,
    /// Value in satoshis.
    pub value: u64,
    pub script_pubkey: ScriptBuf,
    pub confirmed: bool,
    pub deposit: bool,
    /// Count of unconfirmed ancestor transactions.
    pub ancestor_depth: u32,
}

impl TrackedUtxo {
    /// Key of this output in the durable store.
    pub fn store_key(&self) -> String {
        utxo_store_key(&self.txid, self.vout)
    }

    /// Whether this output may be spent right away. Unconfirmed deposits and
    /// outputs at the ancestor-depth ceiling must wait for a confirmation.
    pub fn is_ready(&self) -> bool {
        self.confirmed || (!self.deposit && self.ancestor_depth < MAX_ANCESTOR_DEPTH)
    }
}

fn utxo_store_key(txid: &Txid, vout: u32) -> String {
    format!("o:{}:{}", txid, vout)
}

enum UtxoDbCmd {
    Deposit(TrackedUtxo),
    TxSent(Transaction),
}

/// Handle to the spendable-output tracker actor.
///
/// The actor exclusively owns the durable store. Commands are processed strictly
/// in submission order.
#[derive(Clone)]
pub struct UtxoDb {
    cmd_send: Sender<UtxoDbCmd>,
    ready_recv: Receiver<TrackedUtxo>,
    master_key: Xpriv,
}

impl UtxoDb {
    /// Opens the durable store at `path`, loading or deriving the master key and
    /// replaying every stored output, then spawns the actor loop. Store failures
    /// here are fatal; the pipeline cannot start without its key material and
    /// utxo set.
    pub fn open(
        path: &Path,
        network: Network,
        flow: FlowControl,
        watcher: BlockWatcher,
    ) -> anyhow::Result<(Self, smol::Task<()>)> {
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open utxo store at {}", path.display()))?;
        conn.execute(
            "create table if not exists store (key text primary key, value blob not null)",
            [],
        )?;
        let master_key = load_or_derive_key(&conn, network)?;

        let (cmd_send, cmd_recv) = smol::channel::unbounded();
        let (ready_send, ready_recv) = smol::channel::unbounded();
        let mut actor = UtxoDbActor {
            conn,
            flow,
            watcher,
            ready_send,
            waiting_confirm: HashMap::new(),
        };
        actor.recover()?;
        let task = smolscale::spawn(actor.run(cmd_recv));
        Ok((
            Self {
                cmd_send,
                ready_recv,
                master_key,
            },
            task,
        ))
    }

    /// The stored master key. Loaded before the actor starts, so this never blocks.
    pub fn master_key(&self) -> Xpriv {
        self.master_key
    }

    /// Records a newly observed deposit output. Asynchronous; processed in
    /// arrival order.
    pub fn submit_deposit(&self, utxo: TrackedUtxo) {
        let _ = self.cmd_send.try_send(UtxoDbCmd::Deposit(utxo));
    }

    /// Records that `tx` has been handed to a peer: its inputs are removed from
    /// the store and its outputs become tracked. Asynchronous.
    pub fn notify_relayed(&self, tx: Transaction) {
        let _ = self.cmd_send.try_send(UtxoDbCmd::TxSent(tx));
    }

    /// Waits up to `timeout` for an output that is eligible to spend. `None` on
    /// timeout is not an error, just an empty ready queue.
    pub async fn pull_ready(&self, timeout: Duration) -> Option<TrackedUtxo> {
        self.ready_recv.recv().timeout(timeout).await?.ok()
    }
}

fn load_or_derive_key(conn: &Connection, network: Network) -> anyhow::Result<Xpriv> {
    let existing: Option<Vec<u8>> = conn
        .query_row("select value from store where key = 'key'", [], |row| {
            row.get(0)
        })
        .optional()?;
    if let Some(bytes) = existing {
        return Xpriv::decode(&bytes).context("malformed master key in store");
    }
    let mut seed = [0u8; 32];
    getrandom::getrandom(&mut seed).context("cannot gather entropy for master key")?;
    let key = Xpriv::new_master(network, &seed).context("cannot derive master key")?;
    conn.execute(
        "insert into store (key, value) values ('key', ?1)",
        params![key.encode().to_vec()],
    )?;
    log::info!("derived and stored a new master key");
    Ok(key)
}

struct UtxoDbActor {
    conn: Connection,
    flow: FlowControl,
    watcher: BlockWatcher,
    ready_send: Sender<TrackedUtxo>,
    waiting_confirm: HashMap<Txid, Vec<TrackedUtxo>>,
}

impl UtxoDbActor {
    async fn run(mut self, cmd_recv: Receiver<UtxoDbCmd>) {
        while !self.flow.is_shutting_down() {
            match cmd_recv.recv().timeout(POLL_INTERVAL).await {
                Some(Ok(cmd)) => self.perform(cmd),
                // every handle dropped
                Some(Err(_)) => break,
                // poll timeout, loop to observe shutdown
                None => continue,
            }
        }
        // drain whatever was queued before the shutdown request so that already
        // submitted deposits still reach the store
        while let Ok(cmd) = cmd_recv.try_recv() {
            self.perform(cmd);
        }
        log::debug!("utxo tracker exiting");
    }

    fn perform(&mut self, cmd: UtxoDbCmd) {
        let result = match cmd {
            UtxoDbCmd::Deposit(utxo) => self.store_and_classify(utxo),
            UtxoDbCmd::TxSent(tx) => self.perform_tx_sent(&tx),
        };
        if let Err(err) = result {
            log::error!("utxodb command failed: {:?}", err);
        }
    }

    /// Persists the output, then routes it to the ready queue or the
    /// waiting-for-confirmation set.
    fn store_and_classify(&mut self, utxo: TrackedUtxo) -> anyhow::Result<()> {
        self.put(&utxo)?;
        self.classify(utxo);
        Ok(())
    }

    fn classify(&mut self, utxo: TrackedUtxo) {
        if utxo.is_ready() {
            log::debug!("{} ready to spend ({} sat)", utxo.store_key(), utxo.value);
            let _ = self.ready_send.try_send(utxo);
        } else {
            log::debug!("{} waiting for confirmation", utxo.store_key());
            self.wait_for_confirm(utxo);
        }
    }

    fn wait_for_confirm(&mut self, utxo: TrackedUtxo) {
        let waiters = self.waiting_confirm.entry(utxo.txid).or_insert_with(Vec::new);
        if waiters.is_empty() {
            self.watcher.watch(utxo.txid);
        }
        waiters.push(utxo);
    }

    /// A transaction has been handed to a peer: remove the outputs it spends,
    /// carry the largest unconfirmed ancestor depth over to its own outputs
    /// (plus one), and track those.
    fn perform_tx_sent(&mut self, tx: &Transaction) -> anyhow::Result<()> {
        let mut max_depth = 0u32;
        for input in &tx.input {
            let prev = input.previous_output;
            if let Some(old) = self.get(&prev.txid, prev.vout)? {
                if !old.confirmed && old.ancestor_depth > max_depth {
                    max_depth = old.ancestor_depth;
                }
            }
            self.remove(&prev.txid, prev.vout)?;
        }
        let depth = max_depth + 1;
        let txid = tx.compute_txid();
        for (vout, output) in tx.output.iter().enumerate() {
            self.store_and_classify(TrackedUtxo {
                txid,
                vout: vout as u32,
                value: output.value.to_sat(),
                script_pubkey: output.script_pubkey.clone(),
                confirmed: false,
                deposit: false,
                ancestor_depth: depth,
            })?;
        }
        Ok(())
    }

    /// Replays every stored output through classification. Malformed records are
    /// logged and skipped; the rest of the store still recovers.
    fn recover(&mut self) -> anyhow::Result<()> {
        let rows: Vec<(String, Vec<u8>)> = {
            let mut stmt = self
                .conn
                .prepare("select key, value from store where key like 'o:%'")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };
        let mut count = 0usize;
        for (key, blob) in rows {
            match stdcode::deserialize::<TrackedUtxo>(&blob) {
                Ok(utxo) => {
                    self.classify(utxo);
                    count += 1;
                }
                Err(err) => log::warn!("cannot decode stored output {}, ignoring: {}", key, err),
            }
        }
        log::info!("recovered {} outputs from the store", count);
        Ok(())
    }

    fn put(&self, utxo: &TrackedUtxo) -> anyhow::Result<()> {
        self.conn.execute(
            "insert or replace into store (key, value) values (?1, ?2)",
            params![utxo.store_key(), utxo.stdcode()],
        )?;
        Ok(())
    }

    /// Looks an output up by key. A record that no longer decodes is treated as
    /// absent; the caller proceeds with the degraded default.
    fn get(&self, txid: &Txid, vout: u32) -> anyhow::Result<Option<TrackedUtxo>> {
        let key = utxo_store_key(txid, vout);
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row("select value from store where key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        match blob {
            Some(blob) => match stdcode::deserialize::<TrackedUtxo>(&blob) {
                Ok(utxo) => Ok(Some(utxo)),
                Err(err) => {
                    log::warn!("cannot decode stored output {}: {}", key, err);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn remove(&self, txid: &Txid, vout: u32) -> anyhow::Result<()> {
        self.conn.execute(
            "delete from store where key = ?1",
            params![utxo_store_key(txid, vout)],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{absolute, transaction, Amount, OutPoint, Sequence, TxIn, TxOut, Witness};
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn temp_db_path() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("loadgend_utxodb_test_{}.sqlite", fastrand::u64(..)));
        p
    }

    fn dummy_txid(fill: u8) -> Txid {
        Txid::from_byte_array([fill; 32])
    }

    fn deposit(fill: u8, value: u64, confirmed: bool) -> TrackedUtxo {
        TrackedUtxo {
            txid: dummy_txid(fill),
            vout: 0,
            value,
            script_pubkey: ScriptBuf::new(),
            confirmed,
            deposit: true,
            ancestor_depth: MAX_ANCESTOR_DEPTH,
        }
    }

    fn test_actor(path: &Path) -> (UtxoDbActor, Receiver<TrackedUtxo>) {
        let flow = FlowControl::new();
        let (watcher, task) = BlockWatcher::spawn(flow.clone());
        task.detach();
        let conn = Connection::open(path).unwrap();
        conn.execute(
            "create table if not exists store (key text primary key, value blob not null)",
            [],
        )
        .unwrap();
        let (ready_send, ready_recv) = smol::channel::unbounded();
        (
            UtxoDbActor {
                conn,
                flow,
                watcher,
                ready_send,
                waiting_confirm: HashMap::new(),
            },
            ready_recv,
        )
    }

    fn spend_tx(prev: &TrackedUtxo, n_outputs: usize) -> Transaction {
        Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(prev.txid, prev.vout),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: (0..n_outputs)
                .map(|i| TxOut {
                    value: Amount::from_sat(prev.value / n_outputs as u64 - i as u64),
                    script_pubkey: ScriptBuf::new(),
                })
                .collect(),
        }
    }

    fn drain_ready_keys(recv: &Receiver<TrackedUtxo>) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        while let Ok(utxo) = recv.try_recv() {
            out.insert(utxo.store_key());
        }
        out
    }

    #[test]
    fn confirmed_deposit_is_ready_immediately() {
        let (mut actor, ready) = test_actor(&temp_db_path());
        let utxo = deposit(1, 1_000_000, true);
        actor.store_and_classify(utxo.clone()).unwrap();
        let got = ready.try_recv().expect("deposit should be ready");
        assert_eq!(got.store_key(), utxo.store_key());
        assert_eq!(got.value, 1_000_000);
    }

    #[test]
    fn unconfirmed_deposit_waits_until_confirmed() {
        let (mut actor, ready) = test_actor(&temp_db_path());
        let utxo = deposit(2, 1_000_000, false);
        actor.store_and_classify(utxo.clone()).unwrap();
        assert!(ready.try_recv().is_err(), "unconfirmed deposit must wait");
        assert!(actor.waiting_confirm.contains_key(&utxo.txid));

        // simulate a confirmation event by marking the output confirmed and
        // reclassifying it
        let mut waiters = actor.waiting_confirm.remove(&utxo.txid).unwrap();
        let mut confirmed = waiters.pop().unwrap();
        confirmed.confirmed = true;
        actor.store_and_classify(confirmed).unwrap();
        assert!(ready.try_recv().is_ok(), "confirmed deposit must become ready");
    }

    #[test]
    fn depth_ceiling_holds_back_unconfirmed_chains() {
        let (mut actor, ready) = test_actor(&temp_db_path());
        let utxo = TrackedUtxo {
            deposit: false,
            confirmed: false,
            ancestor_depth: MAX_ANCESTOR_DEPTH,
            ..deposit(3, 500_000, false)
        };
        actor.store_and_classify(utxo).unwrap();
        assert!(ready.try_recv().is_err());
    }

    #[test]
    fn store_key_is_unique() {
        let (mut actor, _ready) = test_actor(&temp_db_path());
        let utxo = deposit(4, 1_000_000, true);
        actor.store_and_classify(utxo.clone()).unwrap();
        actor.store_and_classify(utxo.clone()).unwrap();
        let count: i64 = actor
            .conn
            .query_row(
                "select count(*) from store where key = ?1",
                params![utxo.store_key()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn relayed_tx_bumps_depth_and_consumes_input() {
        let (mut actor, _ready) = test_actor(&temp_db_path());
        // X: unconfirmed, depth 1
        let x = TrackedUtxo {
            deposit: false,
            confirmed: false,
            ancestor_depth: 1,
            ..deposit(5, 3_000_000, false)
        };
        actor.store_and_classify(x.clone()).unwrap();

        let tx = spend_tx(&x, 3);
        actor.perform_tx_sent(&tx).unwrap();

        // X is gone from the store
        assert!(actor.get(&x.txid, x.vout).unwrap().is_none());
        // each new output carries depth 2 and waits for confirmation
        let waiters = actor
            .waiting_confirm
            .get(&tx.compute_txid())
            .expect("outputs should wait on their transaction");
        assert_eq!(waiters.len(), 3);
        assert!(waiters.iter().all(|o| o.ancestor_depth == 2));
        // and they are all in the store
        for o in waiters {
            assert!(actor.get(&o.txid, o.vout).unwrap().is_some());
        }
    }

    #[test]
    fn unknown_input_defaults_to_depth_zero() {
        let (mut actor, ready) = test_actor(&temp_db_path());
        let phantom = deposit(6, 800_000, false);
        // never stored: spending it should still proceed with depth 0 + 1
        let tx = spend_tx(&phantom, 1);
        actor.perform_tx_sent(&tx).unwrap();
        assert!(ready.try_recv().is_err(), "depth 1 output is at the ceiling");
        let waiters = actor.waiting_confirm.get(&tx.compute_txid()).unwrap();
        assert_eq!(waiters[0].ancestor_depth, 1);
    }

    #[test]
    fn recovery_rebuilds_identical_ready_set() {
        let path = temp_db_path();
        let before = {
            let (mut actor, ready) = test_actor(&path);
            actor.store_and_classify(deposit(7, 1_000_000, true)).unwrap();
            actor.store_and_classify(deposit(8, 2_000_000, true)).unwrap();
            actor.store_and_classify(deposit(9, 3_000_000, false)).unwrap();
            drain_ready_keys(&ready)
        };
        assert_eq!(before.len(), 2);

        let (mut actor, ready) = test_actor(&path);
        actor.recover().unwrap();
        let after = drain_ready_keys(&ready);
        assert_eq!(before, after);
        // the unconfirmed deposit is back in the waiting set, not lost
        assert_eq!(actor.waiting_confirm.len(), 1);
    }

    #[test]
    fn malformed_record_is_skipped_during_recovery() {
        let path = temp_db_path();
        {
            let (mut actor, _ready) = test_actor(&path);
            actor.store_and_classify(deposit(10, 1_000_000, true)).unwrap();
            actor
                .conn
                .execute(
                    "insert into store (key, value) values ('o:garbage:0', x'00ff')",
                    [],
                )
                .unwrap();
        }
        let (mut actor, ready) = test_actor(&path);
        actor.recover().unwrap();
        assert_eq!(drain_ready_keys(&ready).len(), 1);
    }

    #[test]
    fn handle_pull_ready_roundtrip() {
        smol::block_on(async {
            let flow = FlowControl::new();
            let (watcher, watcher_task) = BlockWatcher::spawn(flow.clone());
            watcher_task.detach();
            let (utxodb, task) =
                UtxoDb::open(&temp_db_path(), Network::Regtest, flow.clone(), watcher).unwrap();
            task.detach();
            utxodb.submit_deposit(deposit(11, 1_000_000, true));
            let got = utxodb
                .pull_ready(Duration::from_secs(2))
                .await
                .expect("deposit should arrive on the ready queue");
            assert_eq!(got.value, 1_000_000);
            // queue now empty: a short pull times out without error
            assert!(utxodb.pull_ready(Duration::from_millis(50)).await.is_none());
            flow.request_shutdown();
        });
    }

    #[test]
    fn master_key_is_stable_across_reopens() {
        let path = temp_db_path();
        let flow = FlowControl::new();
        let (watcher, watcher_task) = BlockWatcher::spawn(flow.clone());
        watcher_task.detach();
        let first = {
            let (utxodb, task) =
                UtxoDb::open(&path, Network::Regtest, flow.clone(), watcher.clone()).unwrap();
            task.detach();
            utxodb.master_key()
        };
        let (utxodb, task) = UtxoDb::open(&path, Network::Regtest, flow.clone(), watcher).unwrap();
        task.detach();
        assert_eq!(first.encode(), utxodb.master_key().encode());
        flow.request_shutdown();
    }
}

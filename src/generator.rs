use std::time::Duration;

use anyhow::Context;
use bitcoin::{Amount, Transaction, TxOut};

use crate::flow::FlowControl;
use crate::keys::KeyChain;
use crate::mempool::MemPool;
use crate::signer;
use crate::utxodb::{TrackedUtxo, UtxoDb};

/// Target per-output value; outputs worth more than twice this get split.
pub const TARGET_VALUE: u64 = 1_000_000;
/// Split large outputs into at most this many pieces.
pub const MAX_SPLIT: u64 = 20;
/// Flat fee left behind on direct spends.
const SPEND_FEE: u64 = 400;

/// Sleep while generation is paused, and the bound on each ready-queue pull.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Runs the transaction producer until shutdown: pull a ready output, spend it
/// (splitting large values), and hand the result to the relay buffer.
pub async fn run(flow: FlowControl, utxodb: UtxoDb, mempool: MemPool, keys: KeyChain) {
    while !flow.is_shutting_down() {
        if !flow.is_generation_enabled() {
            smol::Timer::after(IDLE_SLEEP).await;
            continue;
        }
        let utxo = match utxodb.pull_ready(IDLE_SLEEP).await {
            Some(utxo) => utxo,
            None => continue,
        };
        let built = if utxo.value > 2 * TARGET_VALUE {
            build_split(&utxo, &keys)
        } else {
            build_spend(&utxo, &keys)
        };
        match built {
            Ok(tx) => mempool.accept(tx),
            Err(err) => log::error!(
                "cannot build transaction spending {}: {:?}",
                utxo.store_key(),
                err
            ),
        }
    }
    log::debug!("generator exiting");
}

/// Divides a large output into equal pieces paying the work address; the
/// integer-division remainder is left as the fee.
fn build_split(utxo: &TrackedUtxo, keys: &KeyChain) -> anyhow::Result<Transaction> {
    let pieces = (utxo.value / TARGET_VALUE).min(MAX_SPLIT);
    let piece_value = utxo.value / pieces;
    let script = keys.work_script();
    let outputs = (0..pieces)
        .map(|_| TxOut {
            value: Amount::from_sat(piece_value),
            script_pubkey: script.clone(),
        })
        .collect();
    signer::spend_utxo(utxo, outputs, keys.signing_key_for(utxo), keys.secp())
}

/// Spends an output whole to the work address, minus the flat fee.
fn build_spend(utxo: &TrackedUtxo, keys: &KeyChain) -> anyhow::Result<Transaction> {
    let value = utxo
        .value
        .checked_sub(SPEND_FEE)
        .context("output not worth spending")?;
    let outputs = vec![TxOut {
        value: Amount::from_sat(value),
        script_pubkey: keys.work_script(),
    }];
    signer::spend_utxo(utxo, outputs, keys.signing_key_for(utxo), keys.secp())
}

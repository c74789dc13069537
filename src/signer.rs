use anyhow::Context;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    absolute, ecdsa, transaction, Amount, OutPoint, PrivateKey, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Witness,
};

use crate::utxodb::TrackedUtxo;

/// Builds a signed transaction spending `utxo` into `outputs`.
///
/// The tracked output must be locked to the p2wpkh script of `key`; the input
/// is ECDSA-signed with SIGHASH_ALL. Whatever value `outputs` leaves unclaimed
/// becomes the fee.
pub fn spend_utxo(
    utxo: &TrackedUtxo,
    outputs: Vec<TxOut>,
    key: PrivateKey,
    secp: &Secp256k1<All>,
) -> anyhow::Result<Transaction> {
    let mut tx = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(utxo.txid, utxo.vout),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs,
    };
    let sighash = SighashCache::new(&tx)
        .p2wpkh_signature_hash(
            0,
            &utxo.script_pubkey,
            Amount::from_sat(utxo.value),
            EcdsaSighashType::All,
        )
        .context("cannot compute sighash")?;
    let msg = Message::from_digest(sighash.to_byte_array());
    let signature = ecdsa::Signature {
        signature: secp.sign_ecdsa(&msg, &key.inner),
        sighash_type: EcdsaSighashType::All,
    };
    tx.input[0].witness = Witness::p2wpkh(&signature, &key.public_key(secp).inner);
    Ok(tx)
}

use anyhow::Context;
use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, Network, PrivateKey, ScriptBuf, WPubkeyHash};

use crate::utxodb::TrackedUtxo;

/// Child index of the key outside deposits are paid to.
const DEPOSIT_INDEX: u32 = 1;
/// Child index of the key that churns work transactions.
const WORK_INDEX: u32 = 2;

/// Deposit and work keys derived from the tracker's master key, plus their
/// p2wpkh addresses.
pub struct KeyChain {
    secp: Secp256k1<All>,
    network: Network,
    deposit: Xpriv,
    work: Xpriv,
}

impl KeyChain {
    /// Derives the deposit and work child keys from `master`.
    pub fn new(master: Xpriv, network: Network) -> anyhow::Result<Self> {
        let secp = Secp256k1::new();
        let deposit = master
            .derive_priv(&secp, &[ChildNumber::from_normal_idx(DEPOSIT_INDEX)?])
            .context("cannot derive deposit key")?;
        let work = master
            .derive_priv(&secp, &[ChildNumber::from_normal_idx(WORK_INDEX)?])
            .context("cannot derive work key")?;
        Ok(Self {
            secp,
            network,
            deposit,
            work,
        })
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    /// The key that can spend `utxo`: the deposit key for deposit outputs, the
    /// work key for everything the generator created itself.
    pub fn signing_key_for(&self, utxo: &TrackedUtxo) -> PrivateKey {
        if utxo.deposit {
            self.deposit.to_priv()
        } else {
            self.work.to_priv()
        }
    }

    /// Locking script of the deposit address.
    pub fn deposit_script(&self) -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&self.wpkh(&self.deposit))
    }

    /// Locking script of the work address.
    pub fn work_script(&self) -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&self.wpkh(&self.work))
    }

    /// Address operators fund to seed the generator.
    pub fn deposit_address(&self) -> Address {
        self.address(self.deposit_script())
    }

    /// Address all generated transactions pay to.
    pub fn work_address(&self) -> Address {
        self.address(self.work_script())
    }

    fn wpkh(&self, key: &Xpriv) -> WPubkeyHash {
        let pk = key.to_priv().public_key(&self.secp);
        WPubkeyHash::from_byte_array(hash160::Hash::hash(&pk.to_bytes()).to_byte_array())
    }

    fn address(&self, script: ScriptBuf) -> Address {
        Address::from_script(&script, self.network).expect("p2wpkh scripts always map to an address")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chain() -> KeyChain {
        let master = Xpriv::new_master(Network::Regtest, &[7u8; 32]).unwrap();
        KeyChain::new(master, Network::Regtest).unwrap()
    }

    #[test]
    fn deposit_and_work_keys_differ() {
        let chain = test_chain();
        assert_ne!(chain.deposit_script(), chain.work_script());
        assert_ne!(chain.deposit_address(), chain.work_address());
    }

    #[test]
    fn addresses_match_their_scripts() {
        let chain = test_chain();
        assert_eq!(
            chain.deposit_address().script_pubkey(),
            chain.deposit_script()
        );
        assert_eq!(chain.work_address().script_pubkey(), chain.work_script());
    }
}

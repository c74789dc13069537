mod blockwatcher;
mod flow;
mod generator;
mod keys;
mod mempool;
mod peer;
mod signer;
mod utxodb;

use std::ffi::CString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use bitcoin::{Network, Txid};
use clap::Parser;

use crate::blockwatcher::BlockWatcher;
use crate::flow::FlowControl;
use crate::keys::KeyChain;
use crate::mempool::MemPool;
use crate::peer::PeerConnection;
use crate::utxodb::{TrackedUtxo, UtxoDb, MAX_ANCESTOR_DEPTH};

/// A transaction-load generator for bitcoin test networks. Only suitable for
/// test networks: key material is not encrypted, recovery is best-effort, and
/// exactly one peer connection is trusted.
#[derive(Parser)]
#[clap(name = "loadgend")]
struct Args {
    /// Directory holding the utxo store and key material
    #[clap(long, default_value = "~/.loadgend")]
    datadir: String,

    /// Network the generated transactions are for
    #[clap(long, default_value = "regtest")]
    network: Network,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Connect to a peer and generate transaction load until interrupted
    Run {
        /// Address of the trusted peer
        #[clap(long)]
        peer: SocketAddr,
    },
    /// Print the address to fund with deposits
    DepositAddress,
    /// Print the address generated transactions pay to
    WorkAddress,
    /// Print a short summary of the daemon configuration
    Status,
    /// Record a deposit paying the deposit address
    AddUtxo {
        #[clap(long)]
        txid: Txid,
        #[clap(long)]
        vout: u32,
        /// Value of the output in satoshis
        #[clap(long)]
        value: u64,
        /// Mark the deposit as not yet confirmed
        #[clap(long)]
        unconfirmed: bool,
    },
}

fn main() -> anyhow::Result<()> {
    smolscale::block_on(async {
        let log_conf = std::env::var("RUST_LOG").unwrap_or_else(|_| "loadgend=debug,warn".into());
        std::env::set_var("RUST_LOG", log_conf);
        tracing_subscriber::fmt::init();
        let args = Args::parse();

        let datadir = expand_home(&args.datadir);
        std::fs::create_dir_all(&datadir).context("cannot create datadir")?;
        // SAFETY: this is perfectly safe because chmod cannot lead to memory unsafety.
        unsafe {
            libc::chmod(
                CString::new(datadir.to_string_lossy().as_bytes().to_vec())?.as_ptr(),
                0o700,
            );
        }

        let flow = FlowControl::new();
        let (watcher, watcher_task) = BlockWatcher::spawn(flow.clone());
        let (utxodb, utxodb_task) = UtxoDb::open(
            &datadir.join("utxodb.sqlite"),
            args.network,
            flow.clone(),
            watcher.clone(),
        )?;
        let keys = KeyChain::new(utxodb.master_key(), args.network)?;

        match args.command {
            Command::DepositAddress => {
                println!("{}", keys.deposit_address());
                flow.request_shutdown();
            }
            Command::WorkAddress => {
                println!("{}", keys.work_address());
                flow.request_shutdown();
            }
            Command::Status => {
                println!("deposit address: {}", keys.deposit_address());
                println!("work address:    {}", keys.work_address());
                println!("network:         {}", args.network);
                println!("datadir:         {}", datadir.display());
                flow.request_shutdown();
            }
            Command::AddUtxo {
                txid,
                vout,
                value,
                unconfirmed,
            } => {
                utxodb.submit_deposit(TrackedUtxo {
                    txid,
                    vout,
                    value,
                    script_pubkey: keys.deposit_script(),
                    confirmed: !unconfirmed,
                    deposit: true,
                    ancestor_depth: MAX_ANCESTOR_DEPTH,
                });
                println!("recorded deposit {}:{} ({} sat)", txid, vout, value);
                // the tracker drains its queue before exiting, so the deposit is
                // persisted by the time the task is joined
                flow.request_shutdown();
            }
            Command::Run { peer } => {
                println!("deposit address: {}", keys.deposit_address());
                println!("work address:    {}", keys.work_address());
                install_shutdown_handler(flow.clone());

                let conn = PeerConnection::new(peer, args.network);
                let (mempool, mempool_task) = MemPool::spawn(
                    flow.clone(),
                    conn.handle(),
                    utxodb.clone(),
                    watcher.clone(),
                );
                let generator_task = smolscale::spawn(generator::run(
                    flow.clone(),
                    utxodb.clone(),
                    mempool.clone(),
                    keys,
                ));
                let peer_flow = flow.clone();
                let peer_task = smolscale::spawn(async move {
                    if let Err(err) = conn.run(peer_flow, mempool).await {
                        log::warn!("peer session ended: {:?}", err);
                    }
                });

                flow.wait_for_shutdown().await;
                log::info!("closing ...");
                peer_task.await;
                generator_task.await;
                mempool_task.await;
            }
        }
        utxodb_task.await;
        watcher_task.await;
        Ok(())
    })
}

static SIGNALED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SIGNALED.store(true, Ordering::SeqCst);
}

/// Turns SIGINT/SIGTERM into a shutdown request. The signal handler only flips
/// an atomic; a small task forwards it to the flow-control latch.
fn install_shutdown_handler(flow: FlowControl) {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
    smolscale::spawn(async move {
        while !SIGNALED.load(Ordering::SeqCst) && !flow.is_shutting_down() {
            smol::Timer::after(Duration::from_millis(100)).await;
        }
        flow.request_shutdown();
    })
    .detach();
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(format!("{}{}", home, rest))
        }
        None => PathBuf::from(path),
    }
}

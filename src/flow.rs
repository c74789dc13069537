use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use smol::channel::{Receiver, Sender};

/// Process-wide flow-control signals shared by every actor in the pipeline.
///
/// Cheaply cloneable. The generation flag is written by the relay buffer and read
/// by the producer; the shutdown flag is observed by every actor loop within one
/// poll tick. A shutdown request issued before anyone waits on it still releases
/// later waiters.
#[derive(Clone)]
pub struct FlowControl {
    inner: Arc<Inner>,
}

struct Inner {
    generate: AtomicBool,
    shutdown: AtomicBool,
    latch_send: Sender<()>,
    latch_recv: Receiver<()>,
}

impl FlowControl {
    pub fn new() -> Self {
        let (latch_send, latch_recv) = smol::channel::bounded(1);
        Self {
            inner: Arc::new(Inner {
                generate: AtomicBool::new(true),
                shutdown: AtomicBool::new(false),
                latch_send,
                latch_recv,
            }),
        }
    }

    /// Whether the producer may keep building transactions.
    pub fn is_generation_enabled(&self) -> bool {
        self.inner.generate.load(Ordering::SeqCst)
    }

    /// Pauses or resumes transaction generation.
    pub fn set_generation_enabled(&self, enabled: bool) {
        self.inner.generate.store(enabled, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Requests shutdown of the whole pipeline. Idempotent.
    pub fn request_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        // closing the latch channel releases every waiter, present and future
        self.inner.latch_send.close();
        log::info!("shutdown requested");
    }

    /// Waits until shutdown is requested.
    pub async fn wait_for_shutdown(&self) {
        let _ = self.inner.latch_recv.recv().await;
    }
}

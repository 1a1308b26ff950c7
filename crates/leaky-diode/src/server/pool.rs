//! Bounded connection pool: slot table, accept loop and per-connection
//! workers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::encoder::{ChannelEncoder, CloseDelayEncoder, FlowModulationEncoder};
use crate::bits::{Bit, BitSource};
use crate::wire;

/// Fixed table of worker slots.
///
/// Slots are indexed `0..capacity`. A slot is claimed with a compare-exchange,
/// so the number of held slots can never exceed the capacity.
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<AtomicBool>,
    active: AtomicUsize,
}

impl SlotTable {
    /// Create a table with `capacity` free slots.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            active: AtomicUsize::new(0),
        })
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently held.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Claim a free slot, or `None` if every slot is taken.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        let index = self.slots.iter().position(|slot| {
            slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })?;
        self.active.fetch_add(1, Ordering::AcqRel);
        Some(SlotGuard {
            table: Arc::clone(self),
            index,
        })
    }
}

/// A held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct SlotGuard {
    table: Arc<SlotTable>,
    index: usize,
}

impl SlotGuard {
    /// Index of the held slot.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.table.active.fetch_sub(1, Ordering::AcqRel);
        self.table.slots[self.index].store(false, Ordering::Release);
    }
}

/// Everything the accept loop needs, moved into its task.
#[derive(Debug)]
pub(crate) struct ConnectionPool {
    pub(crate) listener: TcpListener,
    pub(crate) slots: Arc<SlotTable>,
    pub(crate) encoder: ChannelEncoder,
    pub(crate) source: BitSource,
    pub(crate) cancel: CancellationToken,
    pub(crate) stop_grace: Duration,
}

impl ConnectionPool {
    /// Accept connections until cancelled, then drain the workers.
    pub(crate) async fn run(self) {
        let Self {
            listener,
            slots,
            encoder,
            source,
            cancel,
            stop_grace,
        } = self;
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let Some(slot) = slots.try_acquire() else {
                        tracing::warn!(%peer, capacity = slots.capacity(), "pool full, rejecting connection");
                        drop(stream);
                        continue;
                    };
                    tracing::info!(%peer, slot = slot.index(), "connection accepted");
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                    }
                    let worker = Worker {
                        stream,
                        peer,
                        slot,
                        source: source.clone(),
                        cancel: cancel.child_token(),
                    };
                    workers.spawn(worker.serve(encoder.clone()));
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        tracing::error!(error = %e, "worker panicked");
                    }
                }
            }
        }

        drop(listener);
        tracing::debug!(workers = workers.len(), "accept loop stopped, draining workers");

        let drain = async { while workers.join_next().await.is_some() {} };
        if tokio::time::timeout(stop_grace, drain).await.is_err() {
            tracing::warn!(
                remaining = workers.len(),
                grace_ms = stop_grace.as_millis() as u64,
                "workers did not stop in time, aborting"
            );
            workers.shutdown().await;
        }
        tracing::info!("server stopped");
    }
}

/// Owns one accepted connection for its whole life.
#[derive(Debug)]
struct Worker {
    stream: TcpStream,
    peer: SocketAddr,
    slot: SlotGuard,
    source: BitSource,
    cancel: CancellationToken,
}

impl Worker {
    async fn serve(self, encoder: ChannelEncoder) {
        let peer = self.peer;
        let slot = self.slot.index();
        match encoder {
            ChannelEncoder::CloseDelay(encoder) => self.serve_close_delay(&encoder).await,
            ChannelEncoder::FlowModulation(encoder) => self.serve_flow(&encoder).await,
        }
        tracing::debug!(%peer, slot, "connection closed");
    }

    /// One request, one timed close.
    async fn serve_close_delay(mut self, encoder: &CloseDelayEncoder) {
        let peer = self.peer;
        let request = tokio::select! {
            () = self.cancel.cancelled() => return,
            request = wire::read_index(&mut self.stream) => request,
        };
        let index = match request {
            Ok(Some(index)) => index,
            Ok(None) => {
                tracing::debug!(%peer, "peer closed before sending an index");
                return;
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "failed to read index");
                return;
            }
        };
        let Some(bit) = resolve(&self.source, index, peer) else {
            return;
        };

        let delay = encoder.delay(bit);
        tracing::debug!(
            %peer,
            index,
            bit = bit.value(),
            delay_ms = delay.as_millis() as u64,
            "encoding bit as close delay"
        );
        tokio::select! {
            () = self.cancel.cancelled() => {}
            result = encoder.encode(&mut self.stream, bit) => {
                if let Err(e) = result {
                    tracing::debug!(%peer, error = %e, "shutdown after close delay failed");
                }
            }
        }
    }

    /// Many requests on one connection, each retargeting the filler rate.
    async fn serve_flow(self, encoder: &FlowModulationEncoder) {
        let Self {
            stream,
            peer,
            source,
            cancel,
            ..
        } = self;
        let (mut reader, mut writer) = stream.into_split();
        let (target_tx, target_rx) = watch::channel(None);

        let requests = async move {
            loop {
                let index = match wire::read_index(&mut reader).await {
                    Ok(Some(index)) => index,
                    Ok(None) => {
                        tracing::debug!(%peer, "peer finished sending indices");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "failed to read index");
                        return;
                    }
                };
                let Some(bit) = resolve(&source, index, peer) else {
                    return;
                };
                tracing::debug!(
                    %peer,
                    index,
                    bit = bit.value(),
                    rate = encoder.rate(bit),
                    "retargeting flow rate"
                );
                // The filler side only ends early on a write error, which
                // also ends this worker.
                if target_tx.send(Some(bit)).is_err() {
                    return;
                }
            }
        };

        tokio::select! {
            () = cancel.cancelled() => {}
            () = requests => {}
            result = encoder.run(&mut writer, target_rx) => {
                if let Err(e) = result {
                    tracing::debug!(%peer, error = %e, "filler stream ended");
                }
            }
        }
    }
}

/// Look up the bit for `index`, logging requests outside the secret.
fn resolve(source: &BitSource, index: u32, peer: SocketAddr) -> Option<Bit> {
    match source.get_bit(index) {
        Ok(bit) => Some(bit),
        Err(e) => {
            tracing::error!(%peer, index, total = e.total, "{e}, dropping connection");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn slot_table_never_exceeds_capacity() {
        let table = SlotTable::new(3);
        let guards: Vec<_> = (0..5).filter_map(|_| table.try_acquire()).collect();
        assert_eq!(guards.len(), 3);
        assert_eq!(table.active(), 3);

        let indices: HashSet<_> = guards.iter().map(SlotGuard::index).collect();
        assert_eq!(indices, HashSet::from([0, 1, 2]));
        assert!(table.try_acquire().is_none());
    }

    #[test]
    fn dropped_guard_frees_its_slot() {
        let table = SlotTable::new(2);
        let first = table.try_acquire().unwrap();
        let second = table.try_acquire().unwrap();
        assert_eq!((first.index(), second.index()), (0, 1));

        drop(first);
        assert_eq!(table.active(), 1);
        let again = table.try_acquire().unwrap();
        assert_eq!(again.index(), 0);
        assert!(table.try_acquire().is_none());

        drop(second);
        drop(again);
        assert_eq!(table.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_respect_capacity() {
        let table = SlotTable::new(4);
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = JoinSet::new();
        for _ in 0..64 {
            let table = Arc::clone(&table);
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                for _ in 0..100 {
                    if let Some(guard) = table.try_acquire() {
                        peak.fetch_max(table.active(), Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        drop(guard);
                    }
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(table.active(), 0);
    }

    #[test]
    fn out_of_range_index_is_not_resolved() {
        let source = BitSource::new(b"x".to_vec()).unwrap();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert_eq!(resolve(&source, 23, peer), Some(Bit::Low));
        assert_eq!(resolve(&source, 24, peer), None);
    }
}

//! Validation notifications delivered to registered listeners on a dedicated
//! thread, in the order they were raised.

use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use stakd_chainstate::ChainTip;
use stakd_primitives::block::Block;
use stakd_primitives::transaction::Transaction;

/// Why a transaction is being reported.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SyncType {
    MempoolAdd,
    /// Evicted from the pool because a block spent one of its inputs.
    Conflicted,
    BlockDisconnect,
    NewBlock,
}

pub trait ValidationListener: Send + Sync {
    fn sync_transaction(&self, _tx: &Transaction, _block: Option<&Block>, _kind: SyncType) {}

    fn updated_block_tip(&self, _tip: &ChainTip) {}
}

enum Event {
    SyncTransaction {
        tx: Transaction,
        block: Option<Arc<Block>>,
        kind: SyncType,
    },
    UpdatedBlockTip(ChainTip),
    Flush(Sender<()>),
    Shutdown,
}

type Listeners = Arc<RwLock<Vec<Arc<dyn ValidationListener>>>>;

pub struct NotificationHub {
    sender: Sender<Event>,
    listeners: Listeners,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationHub {
    pub fn new() -> std::io::Result<Self> {
        let (sender, receiver) = unbounded();
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let thread_listeners = Arc::clone(&listeners);
        let handle = std::thread::Builder::new()
            .name("stakd-notify".to_string())
            .spawn(move || dispatch(receiver, thread_listeners))?;
        Ok(Self {
            sender,
            listeners,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn register(&self, listener: Arc<dyn ValidationListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    pub fn sync_transaction(&self, tx: &Transaction, block: Option<&Arc<Block>>, kind: SyncType) {
        self.send(Event::SyncTransaction {
            tx: tx.clone(),
            block: block.cloned(),
            kind,
        });
    }

    pub fn updated_block_tip(&self, tip: &ChainTip) {
        self.send(Event::UpdatedBlockTip(tip.clone()));
    }

    /// Blocks until every notification raised before the call has been delivered.
    pub fn flush(&self) {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        if self.sender.send(Event::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Delivers what is queued, then stops the dispatcher.
    pub fn shutdown(&self) {
        let handle = match self.handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return;
        };
        let _ = self.sender.send(Event::Shutdown);
        if handle.join().is_err() {
            stakd_log::log_error!("notification thread panicked");
        }
    }

    fn send(&self, event: Event) {
        if self.sender.send(event).is_err() {
            stakd_log::log_warn!("notification dropped: dispatcher stopped");
        }
    }
}

impl Drop for NotificationHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch(receiver: Receiver<Event>, listeners: Listeners) {
    while let Ok(event) = receiver.recv() {
        let current: Vec<Arc<dyn ValidationListener>> = match listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        match event {
            Event::SyncTransaction { tx, block, kind } => {
                for listener in &current {
                    listener.sync_transaction(&tx, block.as_deref(), kind);
                }
            }
            Event::UpdatedBlockTip(tip) => {
                for listener in &current {
                    listener.updated_block_tip(&tip);
                }
            }
            Event::Flush(done) => {
                let _ = done.send(());
            }
            Event::Shutdown => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::U256;
    use stakd_primitives::outpoint::OutPoint;
    use stakd_primitives::transaction::{TxIn, TxOut};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ValidationListener for Recorder {
        fn sync_transaction(&self, tx: &Transaction, block: Option<&Block>, kind: SyncType) {
            let label = format!("{kind:?}:{}:{}", tx.lock_time, block.is_some());
            self.events.lock().expect("events").push(label);
        }

        fn updated_block_tip(&self, tip: &ChainTip) {
            self.events.lock().expect("events").push(format!("tip:{}", tip.height));
        }
    }

    fn tx(lock_time: u32) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new([1u8; 32], 0), Vec::new())],
            vout: vec![TxOut::new(1, vec![0x51])],
            lock_time,
        }
    }

    #[test]
    fn delivers_in_order_and_flushes() {
        let hub = NotificationHub::new().expect("hub");
        let recorder = Arc::new(Recorder::default());
        hub.register(recorder.clone());

        hub.sync_transaction(&tx(1), None, SyncType::MempoolAdd);
        hub.sync_transaction(&tx(2), None, SyncType::Conflicted);
        hub.updated_block_tip(&ChainTip {
            hash: [0u8; 32],
            height: 5,
            chain_work: U256::zero(),
            chain_tx: 6,
            time: 0,
        });
        hub.flush();

        assert_eq!(
            *recorder.events.lock().expect("events"),
            vec!["MempoolAdd:1:false", "Conflicted:2:false", "tip:5"]
        );

        hub.shutdown();
        hub.sync_transaction(&tx(3), None, SyncType::MempoolAdd);
        hub.flush();
        assert_eq!(recorder.events.lock().expect("events").len(), 3);
    }
}

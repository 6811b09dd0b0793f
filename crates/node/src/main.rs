//! The stakd node: chain state, transaction pool and the process around them.

pub mod admission;
pub mod context;
pub mod fees;
pub mod mempool;
pub mod notify;
pub mod policy;
pub mod settings;
pub mod worker;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use fs2::FileExt;
use stakd_chainstate::flatfiles::DEFAULT_MAX_BLOCKFILE_SIZE;
use stakd_chainstate::{ChainState, FlatFileStore, SystemClock};
use stakd_consensus::hash256_to_hex;
use stakd_pos::KernelProofGenerator;
use stakd_script::TemplateVerifier;
use stakd_storage::fjall::FjallStore;

use crate::admission::TxPool;
use crate::context::NodeContext;
use crate::notify::NotificationHub;
use crate::settings::{parse_args, usage, CliAction, Settings};
use crate::worker::ActivationWorker;

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const DB_DIR_NAME: &str = "db";
const BLOCKS_DIR_NAME: &str = "blocks";

/// Held for the life of the process; the OS drops the lock with the file.
pub struct DataDirLock {
    _file: File,
}

pub fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "data dir {} is already in use by another stakd; lock file {}{suffix}",
                data_dir.display(),
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

/// An opened node: storage, chain and pool wired together.
pub struct Node {
    pub context: NodeContext<FjallStore>,
    store: Arc<FjallStore>,
    _lock: DataDirLock,
}

impl Node {
    pub fn open(settings: &Settings) -> Result<Self, String> {
        fs::create_dir_all(&settings.data_dir).map_err(|err| {
            format!("failed to create data dir {}: {err}", settings.data_dir.display())
        })?;
        let lock = lock_data_dir(&settings.data_dir)?;

        let params = settings.chain_params();
        let chain_settings = settings.chain_settings(&params);
        let policy = settings.mempool_policy(&params);

        let store = Arc::new(
            FjallStore::open(settings.data_dir.join(DB_DIR_NAME))
                .map_err(|err| format!("failed to open database: {err}"))?,
        );
        let blocks = FlatFileStore::open(
            settings.data_dir.join(BLOCKS_DIR_NAME),
            params.message_start,
            DEFAULT_MAX_BLOCKFILE_SIZE,
        )
        .map_err(|err| format!("failed to open block files: {err}"))?;

        let verifier = Arc::new(TemplateVerifier);
        let chain = ChainState::new(
            Arc::clone(&store),
            blocks,
            params,
            chain_settings,
            Arc::new(KernelProofGenerator::new(0)),
            verifier.clone(),
            Arc::new(SystemClock),
        );
        let loaded = chain
            .load()
            .map_err(|err| format!("failed to load block index: {err}"))?;
        chain
            .init_genesis()
            .map_err(|err| format!("failed to initialize genesis: {err}"))?;
        if chain.settings().check_block_index {
            chain
                .verify_block_index()
                .map_err(|err| format!("block index inconsistent: {err}"))?;
        }
        match chain.tip().map_err(|err| err.to_string())? {
            Some(tip) => stakd_log::log_info!(
                "Loaded {} block index entries; tip {} height {}",
                loaded,
                hash256_to_hex(&tip.hash),
                tip.height
            ),
            None => stakd_log::log_warn!("no active chain after load"),
        }

        let hub = Arc::new(NotificationHub::new().map_err(|err| err.to_string())?);
        let pool = Arc::new(TxPool::new(policy, verifier, hub));
        Ok(Self {
            context: NodeContext::new(Arc::new(chain), pool),
            store,
            _lock: lock,
        })
    }

    /// Stops notifications and writes the index and database to disk.
    pub fn close(self) -> Result<(), String> {
        self.context.pool().hub().shutdown();
        let written = self
            .context
            .chain()
            .flush()
            .map_err(|err| format!("failed to flush chain state: {err}"))?;
        self.store
            .persist()
            .map_err(|err| format!("failed to persist database: {err}"))?;
        stakd_log::log_info!("Flushed {} block index entries", written);
        Ok(())
    }
}

pub async fn run_entry() -> Result<(), String> {
    let settings = match parse_args().map_err(|err| err.to_string())? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            return Ok(());
        }
        CliAction::PrintVersion => {
            println!("stakd {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        CliAction::Run(settings) => settings,
    };

    stakd_log::init(settings.log_config());
    for key in &settings.ignored_conf_keys {
        stakd_log::log_warn!("ignoring unknown setting '{key}' in {}", settings.conf_path.display());
    }
    stakd_log::log_info!(
        "stakd {} starting on {} with data dir {}",
        env!("CARGO_PKG_VERSION"),
        settings.network.as_str(),
        settings.data_dir.display()
    );

    let node = Node::open(&settings)?;
    let mut worker = ActivationWorker::spawn(node.context.clone())
        .map_err(|err| format!("failed to start activation worker: {err}"))?;

    wait_for_shutdown_signal().await;
    stakd_log::log_info!("Signal received; requesting shutdown.");

    worker.stop();
    node.close()?;
    stakd_log::log_info!("Shutdown complete.");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                stakd_log::log_warn!("failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

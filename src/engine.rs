use crate::memory::{is_allocation_size_valid, ChunkManager, MemoryManager, ObjectOffset};
use crate::txn::gc::{reclaim_txn_log, GcCoordinator};
use crate::txn::log::{LogHandle, LogOperation, LogRecord, NullView, SharedView, TxnLogs};
use crate::txn::metadata::TxnMetadata;
use crate::txn::safe_ts::{SafeTsFailure, SafeTsRegistry, SafeTsSlot};
use crate::txn::timestamp::Timestamp;
use crate::txn::validation::decide_txn;
use crate::txn::watermark::Watermarks;
use crate::util::logger;
use crate::util::options::Options;
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

/// Errors reported to sessions. Everything below the session level either retries internally or
/// reports exhaustion with `None`/`false`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxnError {
    /// The session has no transaction in progress.
    NotInTransaction,
    /// The session already has a transaction in progress.
    AlreadyInTransaction,
    /// Every transaction log is in use.
    NoFreeLogHandle,
    /// Every chunk is in use.
    OutOfMemory,
    /// The requested size exceeds the largest allocation.
    ObjectTooLarge(usize),
    /// The transaction registered at this commit timestamp conflicted with a committed one and
    /// was aborted.
    Conflict(Timestamp),
    SafeTs(SafeTsFailure),
}

impl fmt::Display for TxnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnError::NotInTransaction => write!(f, "no transaction in progress"),
            TxnError::AlreadyInTransaction => write!(f, "a transaction is already in progress"),
            TxnError::NoFreeLogHandle => write!(f, "no free transaction log"),
            TxnError::OutOfMemory => write!(f, "no free chunk"),
            TxnError::ObjectTooLarge(bytes) => write!(f, "cannot allocate an object of {} bytes", bytes),
            TxnError::Conflict(commit_ts) => write!(f, "txn {} aborted on a write conflict", commit_ts),
            TxnError::SafeTs(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for TxnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TxnError::SafeTs(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SafeTsFailure> for TxnError {
    fn from(e: SafeTsFailure) -> Self {
        TxnError::SafeTs(e)
    }
}

/// Collects options and creates an [`Engine`].
pub struct EngineBuilder {
    /// The options for the engine. Starts from the defaults, which honor `TXCORE_*` environment
    /// variables.
    pub options: Options,
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder {
            options: Options::default(),
        }
    }

    /// Set an option by name. Returns `false` if the option is unknown or the value is invalid.
    pub fn set_option(&mut self, name: &str, val: &str) -> bool {
        self.options.set_from_str(name, val)
    }

    /// Set options from whitespace separated `key=value` pairs.
    pub fn set_options_bulk_by_str(&mut self, options: &str) -> bool {
        self.options.set_bulk_from_str(options)
    }

    /// Create an engine whose committed transactions are not applied anywhere.
    pub fn build(&self) -> io::Result<Engine> {
        self.build_with_view(NullView)
    }

    /// Create an engine that applies committed transactions to `view`.
    pub fn build_with_view(&self, view: impl SharedView + 'static) -> io::Result<Engine> {
        Engine::new(self.options.clone(), Box::new(view))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An MVCC engine instance: the transaction metadata, the watermarks, the safe timestamp
/// registry, the transaction logs and the object memory.
pub struct Engine {
    options: Options,
    metadata: TxnMetadata,
    registry: SafeTsRegistry,
    logs: TxnLogs,
    memory: MemoryManager,
    view: Box<dyn SharedView>,
}

impl Engine {
    fn new(options: Options, view: Box<dyn SharedView>) -> io::Result<Self> {
        logger::init();
        let engine = Engine {
            metadata: TxnMetadata::new(options.txn_metadata_capacity)?,
            registry: SafeTsRegistry::new(options.max_workers, Arc::new(Watermarks::new())),
            logs: TxnLogs::new(options.max_txn_logs),
            memory: MemoryManager::new(options.chunk_count)?,
            view,
            options,
        };
        info!("Initialized txcore engine with {:?}", engine.options);
        Ok(engine)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn metadata(&self) -> &TxnMetadata {
        &self.metadata
    }

    pub fn watermarks(&self) -> &Watermarks {
        self.registry.watermarks()
    }

    pub fn safe_ts_registry(&self) -> &SafeTsRegistry {
        &self.registry
    }

    pub fn txn_logs(&self) -> &TxnLogs {
        &self.logs
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Open a session for the calling worker. Returns `None` if `max_workers` sessions are
    /// already open.
    pub fn open_session(&self) -> Option<Session<'_>> {
        let slot = self.registry.register()?;
        debug!("Opened session {}", slot.index());
        Some(Session {
            engine: self,
            slot,
            chunks: ChunkManager::new(&self.memory),
            txn: None,
        })
    }

    /// Record that the decision of the transaction at `commit_ts` is durable, whether it committed
    /// or aborted. With persistence on, its log is not collected before this.
    pub fn mark_txn_durable(&self, commit_ts: Timestamp) -> bool {
        self.metadata.set_txn_durable(commit_ts)
    }

    /// Run maintenance on a temporary safe timestamp index. Returns `false` if no index was free.
    pub fn perform_maintenance(&self) -> bool {
        match self.registry.register() {
            Some(slot) => {
                self.gc().perform_maintenance(&slot);
                true
            }
            None => false,
        }
    }

    pub fn dump_txn_metadata(&self, ts: Timestamp) -> String {
        self.metadata.dump_txn_metadata(ts)
    }

    fn gc(&self) -> GcCoordinator<'_> {
        GcCoordinator::new(&self.metadata, &self.registry, &self.logs, &self.memory, self.view.as_ref())
            .with_persistence(self.options.persistence)
            .with_truncation(self.options.truncate_txn_table)
    }
}

struct ActiveTxn {
    begin_ts: Timestamp,
    log: LogHandle,
}

/// A worker's handle on the engine. Runs one transaction at a time and allocates from a chunk it
/// owns. Dropping a session rolls back its transaction and retires its chunk.
pub struct Session<'e> {
    engine: &'e Engine,
    slot: SafeTsSlot<'e>,
    chunks: ChunkManager<'e>,
    txn: Option<ActiveTxn>,
}

impl<'e> Session<'e> {
    pub fn safe_ts_slot(&self) -> &SafeTsSlot<'e> {
        &self.slot
    }

    /// The begin timestamp of the transaction in progress.
    pub fn current_txn(&self) -> Option<Timestamp> {
        self.txn.as_ref().map(|txn| txn.begin_ts)
    }

    pub fn begin_transaction(&mut self) -> Result<Timestamp, TxnError> {
        if self.txn.is_some() {
            return Err(TxnError::AlreadyInTransaction);
        }
        let metadata = &self.engine.metadata;
        let begin_ts = metadata.register_begin();
        // Maintenance does not pass an active transaction, so the reservation holds.
        if let Err(e) = self.slot.protect_unguarded(begin_ts) {
            error!("Failed to protect begin timestamp: {}", e);
            metadata.set_active_txn_terminated(begin_ts);
            return Err(e.into());
        }
        let Some(log) = self.engine.logs.allocate(begin_ts) else {
            metadata.set_active_txn_terminated(begin_ts);
            self.slot.unprotect(begin_ts);
            return Err(TxnError::NoFreeLogHandle);
        };
        trace!("Began txn {} with {:?}", begin_ts, log);
        self.txn = Some(ActiveTxn { begin_ts, log });
        Ok(begin_ts)
    }

    /// Allocate space for an object of `bytes` bytes, moving to a fresh chunk when the owned one is
    /// full.
    pub fn allocate_object(&mut self, bytes: usize) -> Result<ObjectOffset, TxnError> {
        if !is_allocation_size_valid(bytes) {
            return Err(TxnError::ObjectTooLarge(bytes));
        }
        if let Some(offset) = self.chunks.allocate(bytes) {
            return Ok(offset);
        }
        self.chunks.retire_chunk();
        let chunk = self.engine.memory.allocate_chunk().ok_or(TxnError::OutOfMemory)?;
        self.chunks.initialize(chunk);
        self.chunks.allocate(bytes).ok_or(TxnError::OutOfMemory)
    }

    pub fn object_ptr(&self, offset: ObjectOffset) -> NonNull<u8> {
        self.engine.memory.object_ptr(offset)
    }

    /// Log a change of the current transaction.
    pub fn record(
        &self,
        locator: u64,
        old_offset: ObjectOffset,
        new_offset: ObjectOffset,
        operation: LogOperation,
    ) -> Result<(), TxnError> {
        let txn = self.txn.as_ref().ok_or(TxnError::NotInTransaction)?;
        self.engine.logs.append(
            txn.log,
            LogRecord {
                locator,
                old_offset,
                new_offset,
                operation,
            },
        );
        Ok(())
    }

    /// Submit the current transaction and wait for its decision. Returns the commit timestamp, or
    /// [`TxnError::Conflict`] if it was aborted. Either way the transaction is over.
    pub fn commit_transaction(&mut self) -> Result<Timestamp, TxnError> {
        let txn = self.txn.take().ok_or(TxnError::NotInTransaction)?;
        let metadata = &self.engine.metadata;
        let commit_ts = metadata.register_commit(txn.begin_ts, txn.log);
        metadata.set_active_txn_submitted(txn.begin_ts, commit_ts);
        let committed = decide_txn(metadata, &self.engine.logs, &self.slot, commit_ts);
        self.slot.unprotect(txn.begin_ts);
        if committed {
            debug!("Committed txn {} at {}", txn.begin_ts, commit_ts);
            Ok(commit_ts)
        } else {
            debug!("Aborted txn {} at {}", txn.begin_ts, commit_ts);
            Err(TxnError::Conflict(commit_ts))
        }
    }

    /// Abandon the current transaction. The versions it created are freed right away.
    pub fn rollback_transaction(&mut self) -> Result<(), TxnError> {
        let txn = self.txn.take().ok_or(TxnError::NotInTransaction)?;
        self.engine.metadata.set_active_txn_terminated(txn.begin_ts);
        reclaim_txn_log(&self.engine.logs, &self.engine.memory, txn.log, false);
        self.slot.unprotect(txn.begin_ts);
        debug!("Rolled back txn {}", txn.begin_ts);
        Ok(())
    }

    pub fn perform_maintenance(&self) {
        self.engine.gc().perform_maintenance(&self.slot);
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Some(begin_ts) = self.current_txn() {
            warn!("Session {} dropped in txn {}", self.slot.index(), begin_ts);
            if let Err(e) = self.rollback_transaction() {
                warn!("Failed to roll back txn {}: {}", begin_ts, e);
            }
        }
    }
}

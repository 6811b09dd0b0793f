//! Loose transaction admission: consensus and policy checks against the chain tip
//! plus the pool, then insertion and notification.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use stakd_chainstate::inputs::{check_input_scripts, check_tx_inputs};
use stakd_chainstate::validation::{
    check_transaction, legacy_sigop_count, REJECT_DUPLICATE, REJECT_INVALID, REJECT_NONSTANDARD,
};
use stakd_chainstate::{ChainReadView, ChainState, Coin, CoinsError, CoinsView, ValidationError};
use stakd_consensus::{hash256_to_hex, Hash256};
use stakd_log::Category;
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::Transaction;
use stakd_script::{
    p2sh_sigops, ScriptVerifier, MANDATORY_SCRIPT_VERIFY_FLAGS, STANDARD_SCRIPT_VERIFY_FLAGS,
};
use stakd_storage::KeyValueStore;

use crate::fees::{calculate_modified_size, check_fees_paid, FeeCheck, FreeRelayLimiter};
use crate::mempool::{Mempool, MempoolEntry, MempoolError, MempoolErrorKind};
use crate::notify::{NotificationHub, SyncType};
use crate::policy::{are_inputs_standard, is_standard_tx, MempoolPolicy};

/// Height reported for outputs of unconfirmed transactions.
pub const MEMPOOL_HEIGHT: i32 = 0x7FFF_FFFF;

/// Chain coins with the outputs of pooled transactions layered on top.
struct PoolCoinsView<'a> {
    chain: &'a dyn CoinsView,
    pool: &'a Mempool,
}

impl CoinsView for PoolCoinsView<'_> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        if let Some(output) = self.pool.output(outpoint) {
            return Ok(Some(Coin {
                value: output.value,
                script_pubkey: output.script_pubkey,
                height: MEMPOOL_HEIGHT,
                is_coinbase: false,
                is_coinstake: false,
            }));
        }
        self.chain.coin(outpoint)
    }

    fn have_outputs(&self, txid: &Hash256) -> Result<bool, CoinsError> {
        Ok(self.pool.contains(txid) || self.chain.have_outputs(txid)?)
    }
}

/// The transaction pool together with the policy and verifier used to admit into it.
pub struct TxPool {
    mempool: Mutex<Mempool>,
    policy: MempoolPolicy,
    limiter: FreeRelayLimiter,
    verifier: Arc<dyn ScriptVerifier>,
    hub: Arc<NotificationHub>,
}

impl TxPool {
    pub fn new(
        policy: MempoolPolicy,
        verifier: Arc<dyn ScriptVerifier>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            mempool: Mutex::new(Mempool::new(policy.max_orphans)),
            limiter: FreeRelayLimiter::new(policy.limit_free_relay_kb_per_minute),
            policy,
            verifier,
            hub,
        }
    }

    pub fn policy(&self) -> &MempoolPolicy {
        &self.policy
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Runs `f` with the pool locked. Callers that also need the chain must take
    /// the chain lock first.
    pub fn with_mempool<R>(&self, f: impl FnOnce(&mut Mempool) -> R) -> Result<R, MempoolError> {
        let mut pool = self
            .mempool
            .lock()
            .map_err(|_| MempoolError::new(MempoolErrorKind::Internal, "mempool lock poisoned"))?;
        Ok(f(&mut pool))
    }

    pub fn size(&self) -> usize {
        self.with_mempool(|pool| pool.size()).unwrap_or(0)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.with_mempool(|pool| pool.contains(txid)).unwrap_or(false)
    }

    pub fn prioritise_transaction(
        &self,
        txid: Hash256,
        priority_delta: f64,
        fee_delta: i64,
    ) -> Result<(), MempoolError> {
        self.with_mempool(|pool| pool.prioritise_transaction(txid, priority_delta, fee_delta))
    }

    /// Admits `tx` if it is valid against the current tip and pool and meets relay
    /// policy. `limit_free` applies the free-relay limits; `ignore_fees` skips the
    /// fee gate entirely.
    pub fn accept_to_memory_pool<S: KeyValueStore>(
        &self,
        chain: &ChainState<S>,
        tx: &Transaction,
        limit_free: bool,
        ignore_fees: bool,
    ) -> Result<(), MempoolError> {
        let txid = tx.txid();
        check_transaction(tx, &mut HashSet::new())?;
        if tx.is_coinbase() {
            return Err(ValidationError::dos(100, REJECT_INVALID, "coinbase", "coinbase as individual tx").into());
        }
        if tx.is_coinstake() {
            return Err(ValidationError::dos(100, REJECT_INVALID, "coinstake", "coinstake as individual tx").into());
        }

        let (pool_size, pool_bytes) =
            chain.with_view(|view| self.admit(chain, view, tx, txid, limit_free, ignore_fees))??;

        stakd_log::log_debug_cat!(
            Category::Mempool,
            "AcceptToMemoryPool: accepted {} (poolsz {} bytes {})",
            hash256_to_hex(&txid),
            pool_size,
            pool_bytes
        );
        self.hub.sync_transaction(tx, None, SyncType::MempoolAdd);
        Ok(())
    }

    fn admit<S: KeyValueStore>(
        &self,
        chain: &ChainState<S>,
        view: &ChainReadView<'_>,
        tx: &Transaction,
        txid: Hash256,
        limit_free: bool,
        ignore_fees: bool,
    ) -> Result<(usize, usize), MempoolError> {
        let tip_height = view.tip.as_ref().map_or(0, |tip| tip.height);
        let next_height = tip_height + 1;
        let now = chain.clock().adjusted_time();

        if self.policy.require_standard {
            if let Err(reason) = is_standard_tx(tx, &self.policy, next_height, now) {
                return Err(ValidationError::invalid(
                    REJECT_NONSTANDARD,
                    reason,
                    format!("nonstandard transaction {}", hash256_to_hex(&txid)),
                )
                .into());
            }
        }

        let mut pool = self
            .mempool
            .lock()
            .map_err(|_| MempoolError::new(MempoolErrorKind::Internal, "mempool lock poisoned"))?;
        if pool.contains(&txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInMempool,
                format!("{} already in mempool", hash256_to_hex(&txid)),
            ));
        }
        for input in &tx.vin {
            if let Some(conflict) = pool.spender(&input.prevout) {
                return Err(MempoolError::new(
                    MempoolErrorKind::ConflictingInput,
                    format!(
                        "{} conflicts with in-pool {}",
                        hash256_to_hex(&txid),
                        hash256_to_hex(&conflict)
                    ),
                ));
            }
        }

        let coins = PoolCoinsView {
            chain: view.coins,
            pool: &pool,
        };
        let internal = |err: CoinsError| MempoolError::new(MempoolErrorKind::Internal, err.to_string());
        if coins.have_outputs(&txid).map_err(internal)? {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyHaveOutputs,
                format!("outputs of {} already exist", hash256_to_hex(&txid)),
            ));
        }
        let mut missing = Vec::new();
        let mut spent_known = false;
        for input in &tx.vin {
            if coins.coin(&input.prevout).map_err(internal)?.is_some() {
                continue;
            }
            if coins.have_outputs(&input.prevout.hash).map_err(internal)? {
                spent_known = true;
            } else {
                missing.push(input.prevout.clone());
            }
        }
        if !missing.is_empty() {
            return Err(MempoolError::missing_inputs(missing));
        }
        if spent_known {
            return Err(ValidationError::invalid(
                REJECT_DUPLICATE,
                "bad-txns-inputs-spent",
                "inputs already spent",
            )
            .into());
        }

        let params = chain.params();
        let spent = check_tx_inputs(tx, &coins, next_height, params.coinbase_maturity)?;
        let spent_outputs = spent.outputs();

        if self.policy.require_standard && !are_inputs_standard(tx, &spent_outputs) {
            return Err(ValidationError::invalid(
                REJECT_NONSTANDARD,
                "bad-txns-nonstandard-inputs",
                "nonstandard transaction input",
            )
            .into());
        }

        let mut sigops = legacy_sigop_count(tx);
        for (input, prev) in tx.vin.iter().zip(&spent_outputs) {
            sigops = sigops.saturating_add(p2sh_sigops(&prev.script_pubkey, &input.script_sig));
        }
        if sigops > self.policy.max_standard_tx_sigops {
            return Err(ValidationError::invalid(
                REJECT_NONSTANDARD,
                "bad-txns-too-many-sigops",
                format!("{sigops} sigops"),
            )
            .into());
        }

        let size = tx.serialized_size();
        let coin_age: f64 = spent
            .coins
            .iter()
            .filter(|coin| coin.height < tip_height)
            .map(|coin| coin.value as f64 * f64::from(tip_height - coin.height))
            .sum();
        let parents: Vec<Hash256> = {
            let mut parents: Vec<Hash256> = tx
                .vin
                .iter()
                .map(|input| input.prevout.hash)
                .filter(|hash| pool.contains(hash))
                .collect();
            parents.sort();
            parents.dedup();
            parents
        };
        let deltas = pool.deltas(&txid);
        let entry = MempoolEntry {
            txid,
            tx: tx.clone(),
            size,
            time: now,
            height: tip_height,
            fee: spent.fee,
            value_in: spent.value_in,
            coin_age,
            modified_size: calculate_modified_size(tx, size),
            fee_delta: deltas.fee_delta,
            priority_delta: deltas.priority_delta,
            spent_outpoints: tx.vin.iter().map(|input| input.prevout.clone()).collect(),
            parents,
        };

        if !ignore_fees {
            let check = FeeCheck {
                size,
                fee: entry.fee,
                priority: entry.priority_at(next_height),
                priority_delta: entry.priority_delta,
                fee_delta: entry.fee_delta,
            };
            check_fees_paid(&check, limit_free, &self.policy, &self.limiter, now)?;
        }

        let verifier = self.verifier.as_ref();
        check_input_scripts(verifier, tx, &spent_outputs, STANDARD_SCRIPT_VERIFY_FLAGS)?;
        if let Err(err) = check_input_scripts(verifier, tx, &spent_outputs, MANDATORY_SCRIPT_VERIFY_FLAGS) {
            stakd_log::log_error!(
                "{} passed standard script checks but failed mandatory ones: {}",
                hash256_to_hex(&txid),
                err
            );
            panic!("BUG: mandatory script flags rejected a standard-valid transaction");
        }

        pool.insert(entry)?;
        Ok((pool.size(), pool.bytes()))
    }

    /// Admits a relayed transaction. A transaction with unknown parents is kept as an
    /// orphan; admitting a parent retries the orphans waiting on it. Returns the
    /// txids admitted, `tx` first.
    pub fn process_transaction<S: KeyValueStore>(
        &self,
        chain: &ChainState<S>,
        tx: &Transaction,
    ) -> Result<Vec<Hash256>, MempoolError> {
        let txid = tx.txid();
        if let Err(err) = self.accept_to_memory_pool(chain, tx, true, false) {
            if err.kind == MempoolErrorKind::MissingInput && !err.missing_inputs.is_empty() {
                self.with_mempool(|pool| pool.add_orphan(tx.clone(), &err.missing_inputs))?;
            }
            return Err(err);
        }

        let mut accepted = vec![txid];
        let mut queue = VecDeque::from([txid]);
        while let Some(parent) = queue.pop_front() {
            let orphans = self.with_mempool(|pool| pool.take_orphans_for_parent(&parent))?;
            for orphan in orphans {
                let orphan_id = orphan.txid();
                match self.accept_to_memory_pool(chain, &orphan, true, false) {
                    Ok(()) => {
                        accepted.push(orphan_id);
                        queue.push_back(orphan_id);
                    }
                    Err(err) if err.kind == MempoolErrorKind::MissingInput => {
                        self.with_mempool(|pool| pool.add_orphan(orphan, &err.missing_inputs))?;
                    }
                    Err(err) => {
                        stakd_log::log_debug_cat!(
                            Category::Mempool,
                            "dropped orphan {}: {}",
                            hash256_to_hex(&orphan_id),
                            err
                        );
                    }
                }
            }
        }
        Ok(accepted)
    }
}

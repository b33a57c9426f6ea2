//! Registry of the wallet's UTXOs and their mix bookkeeping
//!
//! Cloneable and shared between the wallet refresh loop and the mix scheduler.
//! The pool assignment and mix target of each UTXO are mirrored into the
//! optional [`UtxoConfigHandler`] so they survive restarts.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info};

use crate::persistence::{PersistError, UtxoConfig, UtxoConfigHandler};
use crate::tx0::Tx0;
use crate::types::{Pool, UnspentOutput, WhirlpoolAccount, WhirlpoolUtxo, WhirlpoolUtxoStatus};

/// Keys affected by a [`UtxoStore::refresh`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshChanges {
    /// New UTXOs, now `READY`
    pub detected: Vec<String>,
    /// UTXOs whose confirmations crossed the threshold
    pub confirmed: Vec<String>,
    /// UTXOs no longer reported (spent)
    pub removed: Vec<String>,
}

impl RefreshChanges {
    pub fn is_empty(&self) -> bool {
        self.detected.is_empty() && self.confirmed.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    utxos: HashMap<String, WhirlpoolUtxo>,
    config_handler: Option<UtxoConfigHandler>,
    // accounts refreshed since the last config clean
    refreshed: HashSet<WhirlpoolAccount>,
}

#[derive(Debug, Clone, Default)]
pub struct UtxoStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl UtxoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by persisted utxo configs
    pub fn with_config_handler(handler: UtxoConfigHandler) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                config_handler: Some(handler),
                ..StoreInner::default()
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a UTXO as is
    pub fn insert(&self, utxo: WhirlpoolUtxo) {
        self.write().utxos.insert(utxo.key(), utxo);
    }

    pub fn get(&self, key: &str) -> Option<WhirlpoolUtxo> {
        self.read().utxos.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().utxos.contains_key(key)
    }

    /// Mutate a UTXO in place
    pub fn update<R>(&self, key: &str, f: impl FnOnce(&mut WhirlpoolUtxo) -> R) -> Option<R> {
        self.write().utxos.get_mut(key).map(f)
    }

    pub fn list(&self) -> Vec<WhirlpoolUtxo> {
        self.read().utxos.values().cloned().collect()
    }

    pub fn list_by_account(&self, account: WhirlpoolAccount) -> Vec<WhirlpoolUtxo> {
        self.read()
            .utxos
            .values()
            .filter(|utxo| utxo.account == account)
            .cloned()
            .collect()
    }

    /// Queued UTXOs of the mixable accounts
    pub fn count_queued(&self) -> usize {
        self.read()
            .utxos
            .values()
            .filter(|utxo| {
                utxo.status == WhirlpoolUtxoStatus::MixQueue
                    && utxo.account != WhirlpoolAccount::Deposit
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.read().utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().utxos.is_empty()
    }

    /// Assign a pool and persist it
    pub fn set_pool(&self, key: &str, pool_id: Option<String>) -> bool {
        self.set_utxo_config(key, |utxo| utxo.pool_id = pool_id)
    }

    /// Change the mix target and persist it
    pub fn set_mixs_target(&self, key: &str, mixs_target: u32) -> bool {
        self.set_utxo_config(key, |utxo| utxo.mixs_target = mixs_target)
    }

    fn set_utxo_config(&self, key: &str, f: impl FnOnce(&mut WhirlpoolUtxo)) -> bool {
        let mut inner = self.write();
        let config = match inner.utxos.get_mut(key) {
            Some(utxo) => {
                f(utxo);
                UtxoConfig::new(utxo.pool_id.clone(), utxo.mixs_target)
            }
            None => return false,
        };
        if let Some(handler) = inner.config_handler.as_mut() {
            handler.set(key, config);
        }
        true
    }

    /// Hand the premix outputs of a Tx0 over for mixing in `pool`
    ///
    /// Each output enters the premix account unconfirmed and `MIX_QUEUE`, with
    /// its pool and mix target persisted. The scheduler admits them once a
    /// refresh reports them confirmed.
    pub fn register_tx0(&self, tx0: &Tx0, pool: &Pool, mixs_target: u32) -> Vec<String> {
        let mut inner = self.write();
        let mut keys = Vec::with_capacity(tx0.premix_outputs.len());

        for outpoint in &tx0.premix_outputs {
            let unspent =
                UnspentOutput::new(outpoint.txid, outpoint.vout, tx0.preview.premix_value, 0);
            let mut utxo = WhirlpoolUtxo::new(unspent, WhirlpoolAccount::Premix)
                .with_pool(pool.pool_id.clone());
            utxo.mixs_target = mixs_target;
            utxo.set_status(WhirlpoolUtxoStatus::MixQueue);

            let key = utxo.key();
            if let Some(handler) = inner.config_handler.as_mut() {
                handler.set(&key, UtxoConfig::new(Some(pool.pool_id.clone()), mixs_target));
            }
            inner.utxos.insert(key.clone(), utxo);
            keys.push(key);
        }

        info!(
            "tx0 {} registered: {} premix outputs queued for {}",
            tx0.txid(),
            keys.len(),
            pool.pool_id
        );
        keys
    }

    /// Replace the UTXOs of `account` with a fresh backend snapshot
    ///
    /// New UTXOs start `READY`, restoring pool and mix target from the
    /// persisted config when known. Confirmation counts are updated and
    /// missing UTXOs removed. Once every account has been refreshed, persisted
    /// configs of UTXOs absent from all of them go through the two-pass clean,
    /// so a cleanup pass only ever sees a complete UTXO set.
    pub fn refresh(
        &self,
        account: WhirlpoolAccount,
        fresh: Vec<UnspentOutput>,
        min_confirmations: u32,
    ) -> RefreshChanges {
        let mut changes = RefreshChanges::default();
        let mut inner = self.write();

        let fresh_keys: HashSet<String> = fresh.iter().map(UnspentOutput::key).collect();
        let stale: Vec<String> = inner
            .utxos
            .iter()
            .filter(|(key, utxo)| utxo.account == account && !fresh_keys.contains(*key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            inner.utxos.remove(&key);
            changes.removed.push(key);
        }

        for unspent in fresh {
            let key = unspent.key();
            let persisted = inner
                .config_handler
                .as_ref()
                .and_then(|handler| handler.get(&key).cloned());

            match inner.utxos.get_mut(&key) {
                Some(existing) => {
                    let was_confirmed = existing.utxo.confirmations >= min_confirmations;
                    existing.utxo = unspent;
                    if !was_confirmed && existing.utxo.confirmations >= min_confirmations {
                        changes.confirmed.push(key);
                    }
                }
                None => {
                    let mut utxo = WhirlpoolUtxo::new(unspent, account);
                    if let Some(config) = persisted {
                        utxo.pool_id = config.pool_id;
                        utxo.mixs_target = config.mixs_target;
                    }
                    debug!("utxo detected: {}", utxo);
                    inner.utxos.insert(key.clone(), utxo);
                    changes.detected.push(key);
                }
            }
        }

        inner.refreshed.insert(account);
        if WhirlpoolAccount::ALL
            .iter()
            .all(|account| inner.refreshed.contains(account))
        {
            inner.refreshed.clear();
            let known: HashSet<String> = inner.utxos.keys().cloned().collect();
            if let Some(handler) = inner.config_handler.as_mut() {
                handler.clean(&known);
            }
        }

        if !changes.is_empty() {
            info!(
                "refresh {}: {} detected, {} confirmed, {} removed",
                account,
                changes.detected.len(),
                changes.confirmed.len(),
                changes.removed.len()
            );
        }
        changes
    }

    /// Persist utxo configs if anything changed
    pub fn save_config(&self) -> Result<bool, PersistError> {
        match self.write().config_handler.as_mut() {
            Some(handler) => handler.save(),
            None => Ok(false),
        }
    }
}

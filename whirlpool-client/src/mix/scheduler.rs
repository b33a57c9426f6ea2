//! Mix admission loop
//!
//! A single actor thread owns the map of mixing UTXOs. Every queue, stop and
//! completion event reaches it as a [`Command`] on a crossbeam channel, so
//! admission decisions are serialized without any lock on the map. Wakes that
//! arrive while a pass is running only mark the scheduler for another pass.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bitcoin::Txid;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error};
use serde_json::json;

use super::priority::UtxoPriority;
use super::session::{MixListener, MixOutcome, MixSessionHandle, MixSessionRunner};
use super::SchedulerError;
use crate::config::MixConfig;
use crate::logging::{log_mix, sanitize_for_logging, LogLevel};
use crate::types::{WhirlpoolAccount, WhirlpoolUtxo, WhirlpoolUtxoStatus};
use crate::utxo_store::{RefreshChanges, UtxoStore};

pub(crate) enum Command {
    MixQueue {
        key: String,
        reply: Sender<Result<(), SchedulerError>>,
    },
    MixStop {
        key: String,
        reply: Sender<Result<(), SchedulerError>>,
    },
    Notify,
    UtxoDetected(String),
    UtxoConfirmed(String),
    MixCompleted {
        key: String,
        outcome: MixOutcome,
    },
    Shutdown,
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Default)]
pub struct MixSchedulerState {
    pub utxos_mixing: Vec<WhirlpoolUtxo>,
    pub max_clients: usize,
    pub nb_idle: usize,
    pub nb_queued: usize,
}

/// Cloneable front end of the scheduler thread
#[derive(Clone)]
pub struct MixSchedulerHandle {
    sender: Sender<Command>,
    mixing: Arc<RwLock<Vec<WhirlpoolUtxo>>>,
    store: UtxoStore,
    max_clients: usize,
}

impl MixSchedulerHandle {
    /// Queue a UTXO for mixing
    ///
    /// Fails without any state change when the UTXO has no pool or is already
    /// mixing.
    pub fn mix_queue(&self, key: &str) -> Result<(), SchedulerError> {
        self.request(|reply| Command::MixQueue {
            key: key.to_string(),
            reply,
        })
    }

    /// Take a queued UTXO back to `READY`, or ask the runner to cancel a
    /// running session
    pub fn mix_stop(&self, key: &str) -> Result<(), SchedulerError> {
        self.request(|reply| Command::MixStop {
            key: key.to_string(),
            reply,
        })
    }

    /// Ask for an admission pass
    pub fn notify(&self) -> Result<(), SchedulerError> {
        self.send(Command::Notify)
    }

    pub fn on_utxo_detected(&self, key: &str) -> Result<(), SchedulerError> {
        self.send(Command::UtxoDetected(key.to_string()))
    }

    pub fn on_utxo_confirmed(&self, key: &str) -> Result<(), SchedulerError> {
        self.send(Command::UtxoConfirmed(key.to_string()))
    }

    /// Forward the outcome of a [`UtxoStore::refresh`]
    pub fn on_refresh(&self, changes: &RefreshChanges) -> Result<(), SchedulerError> {
        for key in &changes.detected {
            self.on_utxo_detected(key)?;
        }
        for key in &changes.confirmed {
            self.on_utxo_confirmed(key)?;
        }
        Ok(())
    }

    /// Snapshot without going through the scheduler thread
    pub fn state(&self) -> MixSchedulerState {
        let utxos_mixing = self
            .mixing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        MixSchedulerState {
            nb_idle: self.max_clients.saturating_sub(utxos_mixing.len()),
            utxos_mixing,
            max_clients: self.max_clients,
            nb_queued: self.store.count_queued(),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.sender
            .send(command)
            .map_err(|_| SchedulerError::Stopped)
    }

    fn request(
        &self,
        command: impl FnOnce(Sender<Result<(), SchedulerError>>) -> Command,
    ) -> Result<(), SchedulerError> {
        let (reply, response) = bounded(1);
        self.send(command(reply))?;
        response.recv().map_err(|_| SchedulerError::Stopped)?
    }
}

/// Owner of the scheduler thread; shuts it down when dropped
pub struct MixScheduler {
    handle: MixSchedulerHandle,
    thread: Option<JoinHandle<()>>,
}

impl MixScheduler {
    pub fn start(
        config: &MixConfig,
        store: UtxoStore,
        runner: Arc<dyn MixSessionRunner>,
        priority: Arc<dyn UtxoPriority>,
    ) -> io::Result<Self> {
        let (sender, receiver) = unbounded();
        let mixing = Arc::new(RwLock::new(Vec::new()));

        let handle = MixSchedulerHandle {
            sender: sender.clone(),
            mixing: mixing.clone(),
            store: store.clone(),
            max_clients: config.max_clients,
        };

        let actor = SchedulerActor {
            config: config.clone(),
            store,
            runner,
            priority,
            sender,
            receiver,
            mixing: HashMap::new(),
            published: mixing,
            last_dispatch: None,
            wake_pending: false,
        };

        let thread = thread::Builder::new()
            .name("whirlpool-mix-scheduler".to_string())
            .spawn(move || actor.run())?;

        log_mix(
            LogLevel::Info,
            "Mix scheduler started",
            Some(json!({
                "max_clients": config.max_clients,
                "client_delay_secs": config.client_delay_secs,
            })),
        );

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> MixSchedulerHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> MixSchedulerState {
        self.handle.state()
    }

    /// Stop the thread and wait for it
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shutdown();
            if thread.join().is_err() {
                error!("mix scheduler thread panicked");
            }
        }
    }
}

impl Drop for MixScheduler {
    fn drop(&mut self) {
        self.join();
    }
}

enum Flow {
    Continue,
    Stop,
}

struct InFlight {
    utxo: WhirlpoolUtxo,
    session: MixSessionHandle,
    // stopped by the user: a failure goes back to READY
    stop_requested: bool,
}

struct SchedulerActor {
    config: MixConfig,
    store: UtxoStore,
    runner: Arc<dyn MixSessionRunner>,
    priority: Arc<dyn UtxoPriority>,
    sender: Sender<Command>,
    receiver: Receiver<Command>,
    mixing: HashMap<String, InFlight>,
    published: Arc<RwLock<Vec<WhirlpoolUtxo>>>,
    last_dispatch: Option<Instant>,
    wake_pending: bool,
}

impl SchedulerActor {
    fn run(mut self) {
        debug!("mix scheduler thread running");
        // Initial pass picks up UTXOs queued before start
        self.wake_pending = true;

        'outer: loop {
            while let Ok(command) = self.receiver.try_recv() {
                if let Flow::Stop = self.handle_command(command) {
                    break 'outer;
                }
            }

            if self.wake_pending {
                self.wake_pending = false;
                if let Flow::Stop = self.run_pass() {
                    break;
                }
                continue;
            }

            match self.receiver.recv() {
                Ok(command) => {
                    if let Flow::Stop = self.handle_command(command) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        for (key, in_flight) in self.mixing.iter_mut() {
            debug!("cancel mix on shutdown: {}", key);
            in_flight.session.cancel();
        }
        self.mixing.clear();
        self.publish();
        log_mix(LogLevel::Info, "Mix scheduler stopped", None);
    }

    fn nb_idle(&self) -> usize {
        self.config.max_clients.saturating_sub(self.mixing.len())
    }

    /// One admission pass: start sessions while capacity and candidates remain
    fn run_pass(&mut self) -> Flow {
        while self.nb_idle() > 0 {
            if let Flow::Stop = self.wait_client_delay() {
                return Flow::Stop;
            }
            if self.nb_idle() == 0 {
                return Flow::Continue;
            }

            match self.find_to_mix() {
                Some(utxo) => self.start_mix(utxo),
                None => {
                    debug!("no more utxo to mix");
                    return Flow::Continue;
                }
            }
        }
        Flow::Continue
    }

    // Throttle session starts, still serving commands meanwhile
    fn wait_client_delay(&mut self) -> Flow {
        let last = match self.last_dispatch {
            Some(last) => last,
            None => return Flow::Continue,
        };
        let deadline = last + self.config.client_delay();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Flow::Continue;
            }
            match self.receiver.recv_timeout(deadline - now) {
                Ok(command) => {
                    if let Flow::Stop = self.handle_command(command) {
                        return Flow::Stop;
                    }
                    if self.nb_idle() == 0 {
                        return Flow::Continue;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Flow::Continue,
                Err(RecvTimeoutError::Disconnected) => return Flow::Stop,
            }
        }
    }

    /// Highest priority queued UTXO that may start now
    fn find_to_mix(&self) -> Option<WhirlpoolUtxo> {
        let mixing_txids: HashSet<Txid> = self
            .mixing
            .values()
            .map(|in_flight| in_flight.utxo.utxo.tx_hash)
            .collect();

        self.store
            .list()
            .into_iter()
            .filter(|utxo| {
                matches!(
                    utxo.account,
                    WhirlpoolAccount::Premix | WhirlpoolAccount::Postmix
                ) && utxo.status == WhirlpoolUtxoStatus::MixQueue
                    && !self.mixing.contains_key(&utxo.key())
                    // never two outputs of the same tx at once
                    && !mixing_txids.contains(&utxo.utxo.tx_hash)
                    && utxo.utxo.confirmations >= self.config.min_confirmations
            })
            .min_by(|a, b| self.priority.compare(a, b))
    }

    fn start_mix(&mut self, utxo: WhirlpoolUtxo) {
        let key = utxo.key();
        if self.mixing.contains_key(&key) {
            return;
        }

        self.last_dispatch = Some(Instant::now());
        let listener = MixListener::new(key.clone(), self.sender.clone());

        match self.runner.start_mix(&utxo, listener) {
            Ok(session) => {
                let utxo = self
                    .store
                    .update(&key, |stored| {
                        stored.set_status(WhirlpoolUtxoStatus::Mixing);
                        stored.clone()
                    })
                    .unwrap_or(utxo);
                log_mix(
                    LogLevel::Info,
                    "Mix started",
                    Some(json!({
                        "utxo": sanitize_for_logging(&key),
                        "pool": utxo.pool_id,
                        "mixs_done": utxo.mixs_done,
                    })),
                );
                self.mixing.insert(
                    key,
                    InFlight {
                        utxo,
                        session,
                        stop_requested: false,
                    },
                );
                self.publish();
            }
            Err(err) => {
                log_mix(
                    LogLevel::Error,
                    &format!("Mix could not start: {}", err),
                    Some(json!({ "utxo": sanitize_for_logging(&key) })),
                );
                self.store
                    .update(&key, |stored| stored.set_status(WhirlpoolUtxoStatus::MixFailed));
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::MixQueue { key, reply } => {
                let result = self.mix_queue(&key);
                let _ = reply.send(result);
            }
            Command::MixStop { key, reply } => {
                let result = self.mix_stop(&key);
                let _ = reply.send(result);
            }
            Command::Notify => self.wake_pending = true,
            Command::UtxoDetected(key) => self.on_utxo_detected(&key),
            Command::UtxoConfirmed(key) => self.on_utxo_confirmed(&key),
            Command::MixCompleted { key, outcome } => self.on_mix_completed(&key, outcome),
            Command::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    fn mix_queue(&mut self, key: &str) -> Result<(), SchedulerError> {
        let utxo = self
            .store
            .get(key)
            .ok_or_else(|| SchedulerError::UnknownUtxo(key.to_string()))?;

        if utxo.pool_id.is_none() {
            log_mix(
                LogLevel::Warn,
                "mixQueue ignored: utxo has no pool",
                Some(json!({ "utxo": sanitize_for_logging(key) })),
            );
            return Err(SchedulerError::NoPool(key.to_string()));
        }
        if self.mixing.contains_key(key) {
            log_mix(
                LogLevel::Warn,
                "mixQueue ignored: utxo already mixing",
                Some(json!({ "utxo": sanitize_for_logging(key) })),
            );
            return Err(SchedulerError::AlreadyMixing(key.to_string()));
        }

        self.store
            .update(key, |stored| stored.set_status(WhirlpoolUtxoStatus::MixQueue));
        self.wake_pending = true;
        Ok(())
    }

    fn mix_stop(&mut self, key: &str) -> Result<(), SchedulerError> {
        if let Some(in_flight) = self.mixing.get_mut(key) {
            debug!("mix_stop: cancelling running mix {}", key);
            in_flight.stop_requested = true;
            in_flight.session.cancel();
            return Ok(());
        }

        let status = self
            .store
            .get(key)
            .map(|utxo| utxo.status)
            .ok_or_else(|| SchedulerError::UnknownUtxo(key.to_string()))?;
        if status == WhirlpoolUtxoStatus::MixQueue {
            self.store
                .update(key, |stored| stored.set_status(WhirlpoolUtxoStatus::Ready));
            debug!("mix_stop: {} dequeued", key);
        }
        Ok(())
    }

    // Premix outputs with a pool and postmix outputs short of their target
    fn on_utxo_detected(&mut self, key: &str) {
        let utxo = match self.store.get(key) {
            Some(utxo) => utxo,
            None => return,
        };
        if matches!(utxo.account, WhirlpoolAccount::Premix | WhirlpoolAccount::Postmix)
            && utxo.status == WhirlpoolUtxoStatus::Ready
            && utxo.has_mixs_remaining()
            && utxo.pool_id.is_some()
        {
            if let Err(err) = self.mix_queue(key) {
                debug!("auto-queue of {} skipped: {}", key, err);
            }
        }
    }

    fn on_utxo_confirmed(&mut self, key: &str) {
        let ready = self
            .store
            .get(key)
            .map(|utxo| {
                utxo.status == WhirlpoolUtxoStatus::MixQueue
                    && utxo.utxo.confirmations >= self.config.min_confirmations
            })
            .unwrap_or(false);
        if ready {
            self.wake_pending = true;
        }
    }

    fn on_mix_completed(&mut self, key: &str, outcome: MixOutcome) {
        let stop_requested = match self.mixing.remove(key) {
            Some(in_flight) => in_flight.stop_requested,
            None => {
                debug!("completion for unknown mix {}", key);
                return;
            }
        };

        let requeue = self.config.requeue_on_failure && !stop_requested;
        self.store.update(key, |stored| match outcome {
            MixOutcome::Success => {
                stored.mixs_done += 1;
                stored.set_status(WhirlpoolUtxoStatus::MixSuccess);
            }
            MixOutcome::Failed if stop_requested => {
                stored.set_status(WhirlpoolUtxoStatus::Ready);
            }
            MixOutcome::Failed => {
                stored.set_status(WhirlpoolUtxoStatus::MixFailed);
                if requeue {
                    stored.set_status(WhirlpoolUtxoStatus::MixQueue);
                }
            }
        });

        let level = match outcome {
            MixOutcome::Success => LogLevel::Info,
            MixOutcome::Failed => LogLevel::Warn,
        };
        log_mix(
            level,
            "Mix finished",
            Some(json!({
                "utxo": sanitize_for_logging(key),
                "outcome": format!("{:?}", outcome),
                "nb_mixing": self.mixing.len(),
            })),
        );

        self.publish();
        self.wake_pending = true;
    }

    fn publish(&self) {
        let snapshot: Vec<WhirlpoolUtxo> = self
            .mixing
            .values()
            .map(|in_flight| in_flight.utxo.clone())
            .collect();
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use bitcoin::secp256k1::{PublicKey as SecpPublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, Network, PublicKey, Txid};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::LevelFilter;

use whirlpool_client::backend::{AddressSource, BackendApi, BackendError};
use whirlpool_client::mix::{MixListener, MixSessionHandle, MixSessionRunner, SchedulerError};
use whirlpool_client::tx0::fee_proof::{notification_secret_key, PaymentCode};
use whirlpool_client::types::{
    Pool, SpendFromKey, Tx0Data, Tx0DataResponse, UnspentOutput, WhirlpoolAccount,
    WhirlpoolUtxo,
};

static INIT: Once = Once::new();

pub const NETWORK: Network = Network::Testnet;

/// Initialize logging for tests
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(LevelFilter::Debug)
            .try_init();
    });
}

/// Deterministic secret key; `prefix` separates key families
pub fn secret_key(prefix: u8, index: u32) -> SecretKey {
    let mut bytes = [0u8; 32];
    bytes[0] = prefix;
    bytes[28..].copy_from_slice(&(index + 1).to_be_bytes());
    SecretKey::from_slice(&bytes).expect("valid secret key")
}

pub fn public_key(secret_key: &SecretKey) -> SecpPublicKey {
    SecpPublicKey::from_secret_key(&Secp256k1::new(), secret_key)
}

pub fn p2wpkh_address(secret_key: &SecretKey) -> Address {
    let public_key = PublicKey::new(public_key(secret_key));
    Address::p2wpkh(&public_key, NETWORK).expect("compressed key")
}

pub fn txid(n: u64) -> Txid {
    Txid::from_str(&format!("{:064x}", n)).expect("valid txid")
}

pub fn spend_from(value: u64) -> (SpendFromKey, UnspentOutput) {
    let key = secret_key(0x01, 0);
    (SpendFromKey::from(key), UnspentOutput::new(txid(0xf00d), 3, value, 6))
}

/// The 0.5 BTC pool with a 500k flat fee
pub fn pool_05btc() -> Pool {
    Pool::new_with_defaults("0.5btc", 50_000_000, 500_000, 5, 5)
}

pub fn pool_001btc() -> Pool {
    Pool::new_with_defaults("0.01btc", 1_000_000, 50_000, 5, 5)
}

/// Owner side of the coordinator's fee payment code
pub struct FeeRecipient {
    pub secret_key: SecretKey,
    pub chain_code: [u8; 32],
    pub payment_code: String,
}

impl FeeRecipient {
    pub fn new() -> Self {
        let secret_key = secret_key(0x47, 0);
        let chain_code = [0x42; 32];
        let payment_code = PaymentCode::from_parts(public_key(&secret_key), chain_code).to_base58();
        Self {
            secret_key,
            chain_code,
            payment_code,
        }
    }

    pub fn notification_secret_key(&self) -> SecretKey {
        notification_secret_key(&Secp256k1::new(), &self.secret_key, &self.chain_code)
            .expect("child key")
    }

    pub fn fee_address(&self) -> Address {
        p2wpkh_address(&secret_key(0x48, 0))
    }

    /// Tx0 data paying `fee_value` to the coordinator now
    pub fn tx0_data(&self, fee_value: i64) -> Tx0Data {
        Tx0Data {
            fee_payment_code: self.payment_code.clone(),
            fee_value,
            fee_change: 0,
            fee_payload: b"whirlpool-test".to_vec(),
            fee_address: Some(self.fee_address().to_string()),
            fee_indice: 7,
        }
    }

    /// Tx0 data deferring the fee: `fee_change` goes back to the wallet
    pub fn deferred_tx0_data(&self, fee_change: i64) -> Tx0Data {
        Tx0Data {
            fee_payment_code: self.payment_code.clone(),
            fee_value: 0,
            fee_change,
            fee_payload: vec![0xab; 20],
            fee_address: None,
            fee_indice: 0,
        }
    }

    pub fn tx0_data_response(&self, fee_value: i64) -> Tx0DataResponse {
        let data = self.tx0_data(fee_value);
        Tx0DataResponse {
            fee_payment_code: data.fee_payment_code,
            fee_value: data.fee_value,
            fee_change: data.fee_change,
            fee_payload64: Some(base64::encode(&data.fee_payload)),
            fee_address: data.fee_address,
            fee_indice: data.fee_indice,
        }
    }
}

/// Sequential premix and change addresses
#[derive(Debug, Default)]
pub struct SequentialAddresses {
    pub premix_index: u32,
    pub change_index: u32,
}

impl AddressSource for SequentialAddresses {
    fn next_premix_address(&mut self) -> Address {
        let address = p2wpkh_address(&secret_key(0x10, self.premix_index));
        self.premix_index += 1;
        address
    }

    fn next_change_address(&mut self) -> Address {
        let address = p2wpkh_address(&secret_key(0x20, self.change_index));
        self.change_index += 1;
        address
    }
}

/// Always returns the same premix address
pub struct StuckAddresses;

impl AddressSource for StuckAddresses {
    fn next_premix_address(&mut self) -> Address {
        p2wpkh_address(&secret_key(0x30, 0))
    }

    fn next_change_address(&mut self) -> Address {
        p2wpkh_address(&secret_key(0x31, 0))
    }
}

/// Scripted backend
pub struct MockBackend {
    pub fee_rates: Mutex<VecDeque<Result<u64, BackendError>>>,
    pub tx0_data: Result<Tx0DataResponse, BackendError>,
    pub utxos: Mutex<HashMap<WhirlpoolAccount, Vec<UnspentOutput>>>,
    pub fee_calls: AtomicUsize,
    pub tx0_data_calls: AtomicUsize,
    pub pushed: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new(tx0_data: Result<Tx0DataResponse, BackendError>) -> Self {
        Self {
            fee_rates: Mutex::new(VecDeque::new()),
            tx0_data,
            utxos: Mutex::new(HashMap::new()),
            fee_calls: AtomicUsize::new(0),
            tx0_data_calls: AtomicUsize::new(0),
            pushed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fee_rates(self, rates: Vec<Result<u64, BackendError>>) -> Self {
        *self.fee_rates.lock().unwrap() = rates.into_iter().collect();
        self
    }

    pub fn fee_calls(&self) -> usize {
        self.fee_calls.load(Ordering::SeqCst)
    }

    pub fn tx0_data_calls(&self) -> usize {
        self.tx0_data_calls.load(Ordering::SeqCst)
    }
}

impl BackendApi for MockBackend {
    fn fetch_utxos(&self, account: WhirlpoolAccount) -> Result<Vec<UnspentOutput>, BackendError> {
        Ok(self
            .utxos
            .lock()
            .unwrap()
            .get(&account)
            .cloned()
            .unwrap_or_default())
    }

    fn fetch_fee_per_byte(&self) -> Result<u64, BackendError> {
        self.fee_calls.fetch_add(1, Ordering::SeqCst);
        self.fee_rates
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Unavailable("no more rates".to_string())))
    }

    fn fetch_tx0_data(&self, _pool_id: &str) -> Result<Tx0DataResponse, BackendError> {
        self.tx0_data_calls.fetch_add(1, Ordering::SeqCst);
        self.tx0_data.clone()
    }

    fn push_tx(&self, tx_hex: &str) -> Result<(), BackendError> {
        self.pushed.lock().unwrap().push(tx_hex.to_string());
        Ok(())
    }
}

/// Mix runner that records sessions and leaves completion to the test
pub struct RecordingRunner {
    started: Sender<(String, MixListener)>,
    cancelled: Sender<String>,
    refuse: Mutex<HashSet<String>>,
}

pub struct RunnerProbe {
    pub started: Receiver<(String, MixListener)>,
    pub cancelled: Receiver<String>,
}

impl RecordingRunner {
    pub fn new() -> (Arc<Self>, RunnerProbe) {
        let (started_tx, started_rx) = unbounded();
        let (cancelled_tx, cancelled_rx) = unbounded();
        let runner = Arc::new(Self {
            started: started_tx,
            cancelled: cancelled_tx,
            refuse: Mutex::new(HashSet::new()),
        });
        let probe = RunnerProbe {
            started: started_rx,
            cancelled: cancelled_rx,
        };
        (runner, probe)
    }

    /// Make `start_mix` fail for `key`
    pub fn refuse(&self, key: &str) {
        self.refuse.lock().unwrap().insert(key.to_string());
    }
}

impl MixSessionRunner for RecordingRunner {
    fn start_mix(
        &self,
        utxo: &WhirlpoolUtxo,
        listener: MixListener,
    ) -> Result<MixSessionHandle, SchedulerError> {
        let key = utxo.key();
        if self.refuse.lock().unwrap().contains(&key) {
            return Err(SchedulerError::Runner("refused".to_string()));
        }
        let _ = self.started.send((key.clone(), listener));
        let cancelled = self.cancelled.clone();
        Ok(MixSessionHandle::with_cancel(move || {
            let _ = cancelled.send(key);
        }))
    }
}

impl RunnerProbe {
    pub fn next_started(&self) -> (String, MixListener) {
        self.started
            .recv_timeout(Duration::from_secs(5))
            .expect("a mix should have started")
    }

    pub fn assert_none_started(&self) {
        assert!(
            self.started.recv_timeout(Duration::from_millis(200)).is_err(),
            "no mix should have started"
        );
    }
}

/// Poll `condition` until it holds or five seconds pass
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

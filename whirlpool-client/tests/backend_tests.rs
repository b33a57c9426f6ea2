//! Fee rate policy and Tx0 data fetching

mod common;

use std::convert::TryFrom;

use common::*;

use whirlpool_client::backend::{BackendError, FeeRateProvider};
use whirlpool_client::config::BackendConfig;
use whirlpool_client::error::Tx0Error;
use whirlpool_client::tx0::Tx0Service;
use whirlpool_client::types::{Tx0Data, Tx0DataResponse};

#[test]
fn fee_rate_is_returned_as_is() {
    init_test_logging();
    let backend = MockBackend::new(Err(BackendError::Unavailable("unused".into())))
        .with_fee_rates(vec![Ok(12)]);
    assert_eq!(FeeRateProvider::default().fetch_fee_per_byte(&backend), 12);
    assert_eq!(backend.fee_calls(), 1);
}

#[test]
fn fee_rate_is_capped() {
    let backend = MockBackend::new(Err(BackendError::Unavailable("unused".into())))
        .with_fee_rates(vec![Ok(10_000)]);
    assert_eq!(FeeRateProvider::default().fetch_fee_per_byte(&backend), 500);
}

#[test]
fn fee_rate_failure_is_retried_once() {
    let backend = MockBackend::new(Err(BackendError::Unavailable("unused".into())))
        .with_fee_rates(vec![Err(BackendError::Unavailable("down".into())), Ok(7)]);
    assert_eq!(FeeRateProvider::default().fetch_fee_per_byte(&backend), 7);
    assert_eq!(backend.fee_calls(), 2);
}

#[test]
fn zero_fee_rate_counts_as_failure() {
    let backend = MockBackend::new(Err(BackendError::Unavailable("unused".into())))
        .with_fee_rates(vec![Ok(0), Ok(0), Ok(9)]);
    assert_eq!(FeeRateProvider::default().fetch_fee_per_byte(&backend), 400);
    assert_eq!(backend.fee_calls(), 2);
}

#[test]
fn failover_comes_from_config() {
    let provider = FeeRateProvider::from_config(&BackendConfig {
        max_fee_per_byte: 80,
        failover_fee_per_byte: 30,
    });
    let backend = MockBackend::new(Err(BackendError::Unavailable("unused".into())));
    assert_eq!(provider.fetch_fee_per_byte(&backend), 30);

    let backend = MockBackend::new(Err(BackendError::Unavailable("unused".into())))
        .with_fee_rates(vec![Ok(81)]);
    assert_eq!(provider.fetch_fee_per_byte(&backend), 80);
}

#[test]
fn tx0_data_response_decodes_base64_payload() {
    let recipient = FeeRecipient::new();
    let data = Tx0Data::try_from(recipient.tx0_data_response(500_000)).unwrap();
    assert_eq!(data, recipient.tx0_data(500_000));

    let mut response = recipient.tx0_data_response(500_000);
    response.fee_payload64 = Some("%%%".to_string());
    assert!(matches!(
        Tx0Data::try_from(response),
        Err(Tx0Error::InvalidTx0Data(_))
    ));
}

#[test]
fn tx0_data_response_parses_coordinator_json() {
    let json = r#"{
        "feePaymentCode": "PM8T",
        "feeValue": 0,
        "feeChange": 42500,
        "feePayload64": "AQID",
        "feeIndice": 0
    }"#;
    let response: Tx0DataResponse = serde_json::from_str(json).unwrap();
    let data = Tx0Data::try_from(response).unwrap();
    assert_eq!(data.fee_change, 42_500);
    assert_eq!(data.fee_payload, vec![1, 2, 3]);
    assert!(data.fee_address.is_none());
}

#[test]
fn service_fetches_tx0_data() {
    init_test_logging();
    let recipient = FeeRecipient::new();
    let service = Tx0Service::with_defaults(NETWORK);

    let backend = MockBackend::new(Ok(recipient.tx0_data_response(500_000)));
    let data = service.fetch_tx0_data(&backend, "0.5btc").unwrap();
    assert_eq!(data.fee_indice, 7);
    assert_eq!(backend.tx0_data_calls(), 1);

    let backend = MockBackend::new(Err(BackendError::Unavailable("timeout".into())));
    let err = service.fetch_tx0_data(&backend, "0.5btc").unwrap_err();
    assert!(matches!(err, Tx0Error::Tx0DataUnavailable { .. }));
    // never retried here
    assert_eq!(backend.tx0_data_calls(), 1);
}

//! Fee-proof payload carried by the Tx0 OP_RETURN output
//!
//! The payload tells the coordinator which fee index and opaque fee payload a
//! Tx0 belongs to, without letting anybody else link the Tx0 to the
//! coordinator. It is XOR-masked with a secret only the payer and the owner of
//! the fee payment code can compute:
//!
//! ```text
//! shared = x(ECDH(payer_sk, notification_pubkey(payment_code)))
//! mask   = HMAC-SHA512(key = shared, data = serialize(outpoint))
//! proof  = mask XOR (version | fee_indice BE32 | payload_len | payload | zero pad)
//! ```
//!
//! Binding the outpoint into the mask makes every proof single-use.

use std::fmt;

use bitcoin::base58;
use bitcoin::consensus::encode::serialize;
use bitcoin::secp256k1::{self, All, PublicKey, Scalar, Secp256k1, SecretKey};
use bitcoin::OutPoint;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use thiserror::Error;

/// Fixed length of the fee-proof output data
pub const FEE_PROOF_LENGTH: usize = 64;
/// Plaintext framing version
pub const FEE_PROOF_VERSION: u8 = 1;
/// Largest fee payload that fits the frame
pub const FEE_PAYLOAD_MAX_LENGTH: usize = FEE_PROOF_LENGTH - 6;

const PAYMENT_CODE_PREFIX: u8 = 0x47;
const PAYMENT_CODE_PAYLOAD_LENGTH: usize = 80;

type HmacSha512 = Hmac<Sha512>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeeProofError {
    #[error("Invalid payment code: {0}")]
    InvalidPaymentCode(String),

    #[error("Fee payload too long: {len} bytes, max {max}")]
    PayloadTooLong { len: usize, max: usize },

    #[error("Invalid fee-proof length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Unsupported fee-proof version: {0}")]
    UnsupportedVersion(u8),

    #[error("Key derivation failed: {0}")]
    Crypto(String),
}

impl FeeProofError {
    /// Bad fee instructions from the coordinator rather than a local bug
    pub fn is_service_data(&self) -> bool {
        matches!(
            self,
            FeeProofError::InvalidPaymentCode(_) | FeeProofError::PayloadTooLong { .. }
        )
    }
}

impl From<secp256k1::Error> for FeeProofError {
    fn from(err: secp256k1::Error) -> Self {
        FeeProofError::Crypto(err.to_string())
    }
}

/// Fee index and payload recovered from a proof
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeProof {
    pub fee_indice: u32,
    pub fee_payload: Vec<u8>,
}

/// Produces and reads the fee-proof payload of a Tx0
pub trait FeeProofCodec: Send + Sync {
    /// Encode a proof for a Tx0 spending `outpoint` with `secret_key`
    ///
    /// The result is always exactly [`FEE_PROOF_LENGTH`] bytes and is a pure
    /// function of its inputs.
    fn encode(
        &self,
        secret_key: &SecretKey,
        fee_payment_code: &str,
        fee_indice: u32,
        fee_payload: &[u8],
        outpoint: &OutPoint,
    ) -> Result<Vec<u8>, FeeProofError>;

    /// Recover the fee index and payload on the fee recipient's side
    fn decode(
        &self,
        notification_secret_key: &SecretKey,
        payer_public_key: &PublicKey,
        proof: &[u8],
        outpoint: &OutPoint,
    ) -> Result<FeeProof, FeeProofError>;
}

/// BIP47 payment code: a public key plus chain code, base58check encoded
#[derive(Clone, PartialEq, Eq)]
pub struct PaymentCode {
    version: u8,
    public_key: PublicKey,
    chain_code: [u8; 32],
}

impl fmt::Debug for PaymentCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentCode({})", self.to_base58())
    }
}

impl PaymentCode {
    pub fn from_parts(public_key: PublicKey, chain_code: [u8; 32]) -> Self {
        Self {
            version: 1,
            public_key,
            chain_code,
        }
    }

    pub fn from_base58(encoded: &str) -> Result<Self, FeeProofError> {
        let data = base58::decode_check(encoded)
            .map_err(|e| FeeProofError::InvalidPaymentCode(e.to_string()))?;

        if data.len() != PAYMENT_CODE_PAYLOAD_LENGTH + 1 {
            return Err(FeeProofError::InvalidPaymentCode(format!(
                "expected {} bytes, got {}",
                PAYMENT_CODE_PAYLOAD_LENGTH + 1,
                data.len()
            )));
        }
        if data[0] != PAYMENT_CODE_PREFIX {
            return Err(FeeProofError::InvalidPaymentCode(format!(
                "bad prefix 0x{:02x}",
                data[0]
            )));
        }

        let payload = &data[1..];
        let version = payload[0];
        if version != 1 && version != 2 {
            return Err(FeeProofError::InvalidPaymentCode(format!(
                "unsupported version {}",
                version
            )));
        }

        let public_key = PublicKey::from_slice(&payload[2..35])
            .map_err(|e| FeeProofError::InvalidPaymentCode(e.to_string()))?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&payload[35..67]);

        Ok(Self {
            version,
            public_key,
            chain_code,
        })
    }

    pub fn to_base58(&self) -> String {
        let mut data = Vec::with_capacity(PAYMENT_CODE_PAYLOAD_LENGTH + 1);
        data.push(PAYMENT_CODE_PREFIX);
        data.push(self.version);
        data.push(0x00); // features
        data.extend_from_slice(&self.public_key.serialize());
        data.extend_from_slice(&self.chain_code);
        data.resize(PAYMENT_CODE_PAYLOAD_LENGTH + 1, 0);
        base58::encode_check(&data)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Public key of the notification address (non-hardened child 0)
    pub fn notification_public_key(
        &self,
        secp: &Secp256k1<All>,
    ) -> Result<PublicKey, FeeProofError> {
        let tweak = child_zero_tweak(&self.chain_code, &self.public_key)?;
        Ok(self.public_key.add_exp_tweak(secp, &tweak)?)
    }
}

/// Secret key of the notification address, for the owner of a payment code
pub fn notification_secret_key(
    secp: &Secp256k1<All>,
    secret_key: &SecretKey,
    chain_code: &[u8; 32],
) -> Result<SecretKey, FeeProofError> {
    let public_key = PublicKey::from_secret_key(secp, secret_key);
    let tweak = child_zero_tweak(chain_code, &public_key)?;
    Ok(secret_key.add_tweak(&tweak)?)
}

// BIP32 CKDpub/CKDpriv tweak for non-hardened index 0
fn child_zero_tweak(chain_code: &[u8; 32], parent: &PublicKey) -> Result<Scalar, FeeProofError> {
    let mut mac = HmacSha512::new_from_slice(chain_code)
        .map_err(|e| FeeProofError::Crypto(e.to_string()))?;
    mac.update(&parent.serialize());
    mac.update(&0u32.to_be_bytes());
    let derived = mac.finalize().into_bytes();

    let mut il = [0u8; 32];
    il.copy_from_slice(&derived[..32]);
    Scalar::from_be_bytes(il).map_err(|e| FeeProofError::Crypto(e.to_string()))
}

/// Default codec: ECDH with the payment code's notification key
pub struct Bip47FeeProofCodec {
    secp: Secp256k1<All>,
}

impl Default for Bip47FeeProofCodec {
    fn default() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }
}

impl fmt::Debug for Bip47FeeProofCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Bip47FeeProofCodec")
    }
}

impl Bip47FeeProofCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn mask(
        &self,
        point: &PublicKey,
        scalar: &SecretKey,
        outpoint: &OutPoint,
    ) -> Result<[u8; FEE_PROOF_LENGTH], FeeProofError> {
        let shared = point.mul_tweak(&self.secp, &Scalar::from(*scalar))?;
        let shared_x = &shared.serialize()[1..33];

        let mut mac = HmacSha512::new_from_slice(shared_x)
            .map_err(|e| FeeProofError::Crypto(e.to_string()))?;
        mac.update(&serialize(outpoint));

        let mut mask = [0u8; FEE_PROOF_LENGTH];
        mask.copy_from_slice(&mac.finalize().into_bytes());
        Ok(mask)
    }
}

impl FeeProofCodec for Bip47FeeProofCodec {
    fn encode(
        &self,
        secret_key: &SecretKey,
        fee_payment_code: &str,
        fee_indice: u32,
        fee_payload: &[u8],
        outpoint: &OutPoint,
    ) -> Result<Vec<u8>, FeeProofError> {
        if fee_payload.len() > FEE_PAYLOAD_MAX_LENGTH {
            return Err(FeeProofError::PayloadTooLong {
                len: fee_payload.len(),
                max: FEE_PAYLOAD_MAX_LENGTH,
            });
        }

        let payment_code = PaymentCode::from_base58(fee_payment_code)?;
        let notification_key = payment_code.notification_public_key(&self.secp)?;
        let mask = self.mask(&notification_key, secret_key, outpoint)?;

        let mut proof = Vec::with_capacity(FEE_PROOF_LENGTH);
        proof.push(FEE_PROOF_VERSION);
        proof.extend_from_slice(&fee_indice.to_be_bytes());
        proof.push(fee_payload.len() as u8);
        proof.extend_from_slice(fee_payload);
        proof.resize(FEE_PROOF_LENGTH, 0);

        proof.iter_mut().zip(mask.iter()).for_each(|(a, b)| *a ^= b);
        Ok(proof)
    }

    fn decode(
        &self,
        notification_secret_key: &SecretKey,
        payer_public_key: &PublicKey,
        proof: &[u8],
        outpoint: &OutPoint,
    ) -> Result<FeeProof, FeeProofError> {
        if proof.len() != FEE_PROOF_LENGTH {
            return Err(FeeProofError::InvalidLength {
                expected: FEE_PROOF_LENGTH,
                actual: proof.len(),
            });
        }

        let mask = self.mask(payer_public_key, notification_secret_key, outpoint)?;
        let plain: Vec<u8> = proof.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect();

        if plain[0] != FEE_PROOF_VERSION {
            return Err(FeeProofError::UnsupportedVersion(plain[0]));
        }
        let mut indice = [0u8; 4];
        indice.copy_from_slice(&plain[1..5]);
        let payload_len = plain[5] as usize;
        if payload_len > FEE_PAYLOAD_MAX_LENGTH {
            return Err(FeeProofError::PayloadTooLong {
                len: payload_len,
                max: FEE_PAYLOAD_MAX_LENGTH,
            });
        }

        Ok(FeeProof {
            fee_indice: u32::from_be_bytes(indice),
            fee_payload: plain[6..6 + payload_len].to_vec(),
        })
    }
}

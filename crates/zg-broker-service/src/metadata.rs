//! Metering header validation.
//!
//! Every proxied request must carry the full set of metering headers of the
//! deployment. A request missing any of them is rejected before it is
//! forwarded or measured. Parsing is structural only; signatures are checked
//! by the prover at settlement time.

use std::fmt;
use std::str::FromStr;

use axum::http::HeaderMap;

use zg_broker_core::{AccountAddress, RequestHash, Signature};

/// Header names of the metering protocol.
pub mod headers {
    /// Paying user address.
    pub const ADDRESS: &str = "Address";
    /// Total fee the user authorizes.
    pub const FEE: &str = "Fee";
    /// Fee for the input side of this request.
    pub const INPUT_FEE: &str = "Input-Fee";
    /// Per-pair request counter.
    pub const NONCE: &str = "Nonce";
    /// Output fee of the previous request.
    pub const PREVIOUS_OUTPUT_FEE: &str = "Previous-Output-Fee";
    /// Client-computed request hash.
    pub const REQUEST_HASH: &str = "Request-Hash";
    /// Service the request is addressed to.
    pub const SERVICE_NAME: &str = "Service-Name";
    /// Client signature over the request.
    pub const SIGNATURE: &str = "Signature";
    /// Whether the client reached us through a proxy.
    pub const USE_PROXY: &str = "Use-Proxy";
}

const INFERENCE_HEADERS: [&str; 7] = [
    headers::ADDRESS,
    headers::FEE,
    headers::INPUT_FEE,
    headers::NONCE,
    headers::REQUEST_HASH,
    headers::SIGNATURE,
    headers::USE_PROXY,
];

const GENERAL_HEADERS: [&str; 7] = [
    headers::ADDRESS,
    headers::FEE,
    headers::INPUT_FEE,
    headers::NONCE,
    headers::PREVIOUS_OUTPUT_FEE,
    headers::SERVICE_NAME,
    headers::SIGNATURE,
];

/// The required header set of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSet {
    /// Inference deployments.
    Inference,
    /// General and fine-tuning-adjacent deployments.
    General,
}

impl HeaderSet {
    /// Required header names, in the order they are checked.
    #[must_use]
    pub const fn required(&self) -> &'static [&'static str] {
        match self {
            Self::Inference => &INFERENCE_HEADERS,
            Self::General => &GENERAL_HEADERS,
        }
    }

    /// Get the deployment kind name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inference => "inference",
            Self::General => "general",
        }
    }
}

impl fmt::Display for HeaderSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HeaderSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inference" => Ok(Self::Inference),
            "general" => Ok(Self::General),
            other => Err(format!("unknown deployment kind: {other}")),
        }
    }
}

/// Reasons a request's metering metadata is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A required header is absent or empty.
    #[error("missing required header {0}")]
    MissingHeader(&'static str),

    /// A header is present but does not parse.
    #[error("invalid header {header}: {reason}")]
    InvalidHeader {
        /// Header name.
        header: &'static str,
        /// Why it does not parse.
        reason: String,
    },

    /// The declared input fee does not cover the measured input.
    #[error("input fee {declared} is below the required {required}")]
    InsufficientInputFee {
        /// Fee from the `Input-Fee` header.
        declared: u128,
        /// Measured input units times the input price.
        required: u128,
    },

    /// The declared total fee is smaller than the input fee.
    #[error("fee {fee} is below input fee {input_fee}")]
    FeeBelowInputFee {
        /// Fee from the `Fee` header.
        fee: u128,
        /// Fee from the `Input-Fee` header.
        input_fee: u128,
    },

    /// The nonce was already used for this (user, provider) pair.
    #[error("nonce {nonce} is not greater than last nonce {last}")]
    NonceNotIncreasing {
        /// The refused nonce.
        nonce: u64,
        /// The highest nonce already recorded.
        last: u64,
    },
}

impl ValidationError {
    /// The header the error is about, if any.
    #[must_use]
    pub const fn header(&self) -> Option<&'static str> {
        match self {
            Self::MissingHeader(header) | Self::InvalidHeader { header, .. } => Some(*header),
            Self::InsufficientInputFee { .. } => Some(headers::INPUT_FEE),
            Self::FeeBelowInputFee { .. } => Some(headers::FEE),
            Self::NonceNotIncreasing { .. } => Some(headers::NONCE),
        }
    }
}

/// Parsed metering metadata of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMetadata {
    /// Paying user.
    pub address: AccountAddress,
    /// Total fee the user authorizes.
    pub fee: u128,
    /// Fee for the input side.
    pub input_fee: u128,
    /// Per-pair request counter.
    pub nonce: u64,
    /// Client signature.
    pub signature: Signature,
    /// Request hash (inference deployments).
    pub request_hash: Option<RequestHash>,
    /// Output fee of the previous request (general deployments).
    pub previous_output_fee: Option<u128>,
    /// Service name (general deployments).
    pub service_name: Option<String>,
    /// Whether the client came through a proxy.
    pub use_proxy: bool,
}

impl RequestMetadata {
    /// Check the declared fees against the measured input.
    ///
    /// # Errors
    ///
    /// Returns an error if `Input-Fee` does not cover `input_count` units at
    /// `input_price`, or if `Fee` is below `Input-Fee`.
    pub fn check_fees(&self, input_count: u64, input_price: u128) -> Result<(), ValidationError> {
        let required = u128::from(input_count).saturating_mul(input_price);
        if self.input_fee < required {
            return Err(ValidationError::InsufficientInputFee {
                declared: self.input_fee,
                required,
            });
        }
        if self.fee < self.input_fee {
            return Err(ValidationError::FeeBelowInputFee {
                fee: self.fee,
                input_fee: self.input_fee,
            });
        }
        Ok(())
    }
}

/// Validates inbound metering headers against a fixed required set.
#[derive(Debug, Clone, Copy)]
pub struct MetadataValidator {
    header_set: HeaderSet,
}

impl MetadataValidator {
    /// Create a validator for a deployment's header set.
    #[must_use]
    pub const fn new(header_set: HeaderSet) -> Self {
        Self { header_set }
    }

    /// The header set this validator enforces.
    #[must_use]
    pub const fn header_set(&self) -> HeaderSet {
        self.header_set
    }

    /// Check that every required header is present, then parse them.
    ///
    /// # Errors
    ///
    /// Returns the first missing header in canonical order, or the first
    /// header that does not parse.
    pub fn validate(&self, headers: &HeaderMap) -> Result<RequestMetadata, ValidationError> {
        for &name in self.header_set.required() {
            if text(headers, name)?.is_none() {
                return Err(ValidationError::MissingHeader(name));
            }
        }

        let address = parse_required(headers, headers::ADDRESS)?;
        let fee = parse_required(headers, headers::FEE)?;
        let input_fee = parse_required(headers, headers::INPUT_FEE)?;
        let nonce = parse_required(headers, headers::NONCE)?;
        let signature = parse_required(headers, headers::SIGNATURE)?;
        let request_hash = parse_optional(headers, headers::REQUEST_HASH)?;
        let previous_output_fee = parse_optional(headers, headers::PREVIOUS_OUTPUT_FEE)?;
        let service_name = text(headers, headers::SERVICE_NAME)?.map(str::to_string);
        // Unparseable values count as "not proxied".
        let use_proxy = text(headers, headers::USE_PROXY)?
            .and_then(|v| v.to_ascii_lowercase().parse().ok())
            .unwrap_or(false);

        Ok(RequestMetadata {
            address,
            fee,
            input_fee,
            nonce,
            signature,
            request_hash,
            previous_output_fee,
            service_name,
            use_proxy,
        })
    }
}

/// Header value as trimmed text; empty values count as absent.
fn text<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<Option<&'a str>, ValidationError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|e| ValidationError::InvalidHeader {
        header: name,
        reason: e.to_string(),
    })?;
    let value = value.trim();
    Ok((!value.is_empty()).then_some(value))
}

fn parse_optional<T>(
    headers: &HeaderMap,
    name: &'static str,
) -> Result<Option<T>, ValidationError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    text(headers, name)?
        .map(|value| {
            value.parse().map_err(|e: T::Err| ValidationError::InvalidHeader {
                header: name,
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_required<T>(headers: &HeaderMap, name: &'static str) -> Result<T, ValidationError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    parse_optional(headers, name)?.ok_or(ValidationError::MissingHeader(name))
}

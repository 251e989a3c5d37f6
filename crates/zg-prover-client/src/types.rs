//! Request and response types of the prover API.
//!
//! Big integers (fees, nonces, key words) travel as decimal strings.

use serde::{Deserialize, Serialize};

/// One metered request as the prover sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProverRequest {
    /// Input side fee.
    pub req_fee: String,
    /// Output side fee.
    pub res_fee: String,
    /// Client nonce.
    pub nonce: String,
    /// Provider address, `0x`-prefixed hex.
    pub provider_address: String,
    /// User address, `0x`-prefixed hex.
    pub user_address: String,
    /// Request hash bytes, each widened to an integer.
    pub request_hash: Vec<i64>,
}

/// Body of `POST /check-sign`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSignatureRequest {
    /// The user's two-part public key.
    pub pubkey: [String; 2],
    /// Requests to verify.
    pub requests: Vec<ProverRequest>,
    /// One signature per request, in the same order.
    pub signatures: Vec<Vec<i64>>,
}

/// Body of `POST /proof-input`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofInputRequest {
    /// Maximum number of requests the proof circuit folds.
    #[serde(rename = "l")]
    pub batch_size: usize,
    /// The user's two-part public key.
    pub pubkey: [String; 2],
    /// Requests covered by the proof.
    pub requests: Vec<ProverRequest>,
    /// One signature per request, in the same order.
    pub signatures: Vec<Vec<i64>>,
}

/// Proof input returned by `POST /proof-input`.
///
/// Its shape is private to the prover; it is only ever passed back to
/// `POST /solidity-calldata` unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProofInput(pub serde_json::Value);

/// Groth16-style calldata returned by `POST /solidity-calldata`.
///
/// All words are hex strings (`0x`-prefixed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolidityCalldata {
    /// Proof point A.
    #[serde(rename = "pA")]
    pub p_a: Vec<String>,
    /// Proof point B.
    #[serde(rename = "pB")]
    pub p_b: Vec<Vec<String>>,
    /// Proof point C.
    #[serde(rename = "pC")]
    pub p_c: Vec<String>,
    /// Public inputs of the proof.
    #[serde(rename = "pubInputs")]
    pub pub_inputs: Vec<String>,
}

/// Error body some prover builds return.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiErrorResponse {
    #[serde(alias = "message")]
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prover_request_uses_camel_case() {
        let request = ProverRequest {
            req_fee: "1".into(),
            res_fee: "2".into(),
            nonce: "3".into(),
            provider_address: "0xp".into(),
            user_address: "0xu".into(),
            request_hash: vec![4],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["reqFee"], "1");
        assert_eq!(json["resFee"], "2");
        assert_eq!(json["providerAddress"], "0xp");
        assert_eq!(json["requestHash"], serde_json::json!([4]));
    }

    #[test]
    fn proof_input_request_names_batch_size_l() {
        let body = ProofInputRequest {
            batch_size: 40,
            pubkey: ["1".into(), "2".into()],
            requests: vec![],
            signatures: vec![],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["l"], 40);
        assert_eq!(json["pubkey"], serde_json::json!(["1", "2"]));
    }

    #[test]
    fn calldata_field_names() {
        let calldata: SolidityCalldata = serde_json::from_value(serde_json::json!({
            "pA": ["0x1", "0x2"],
            "pB": [["0x3", "0x4"], ["0x5", "0x6"]],
            "pC": ["0x7", "0x8"],
            "pubInputs": ["0x9"]
        }))
        .unwrap();
        assert_eq!(calldata.p_b[1][0], "0x5");
        assert_eq!(calldata.pub_inputs, vec!["0x9"]);
    }
}

//! Request normalization and transaction classification
//!
//! Requests arrive with hex or decimal strings; everything past this module works
//! with typed `Address`/`U256` values.

use crate::error::{TxError, TxResult};
use crate::state::{TxParams, TxType};

use ethers::types::{Address, Bytes, U256};
use serde::Deserialize;

mod erc20 {
    alloy_sol_types::sol! {
        function transfer(address to, uint256 amount) external returns (bool);
        function transferFrom(address from, address to, uint256 amount) external returns (bool);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

use alloy_sol_types::SolCall;

/// Incoming transaction request as sent by callers
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRequest {
    pub from: String,
    pub to: Option<String>,
    pub value: Option<String>,
    pub data: Option<String>,
    pub gas: Option<String>,
    pub gas_price: Option<String>,
    pub nonce: Option<String>,
    /// Chain selector; the wallet's current chain when absent
    pub chain: Option<String>,
    pub expiration_timestamp_secs: Option<u64>,
    /// Request comes from a swap flow
    #[serde(default)]
    pub swap: bool,
}

/// Parse a `0x`-prefixed hex or plain decimal quantity
pub fn parse_quantity(field: &str, value: &str) -> TxResult<U256> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some("") => return Err(TxError::Validation(format!("{} is empty", field))),
        Some(hex) => U256::from_str_radix(hex, 16).map_err(|e| e.to_string()),
        None => U256::from_dec_str(value).map_err(|e| e.to_string()),
    };
    parsed.map_err(|e| TxError::Validation(format!("invalid {} {:?}: {}", field, value, e)))
}

fn parse_address(field: &str, value: &str) -> TxResult<Address> {
    value
        .trim()
        .parse::<Address>()
        .map_err(|e| TxError::Validation(format!("invalid {} address {:?}: {}", field, value, e)))
}

fn parse_data(value: &str) -> TxResult<Bytes> {
    let hex_str = value.trim();
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(hex_str)
        .map(Bytes::from)
        .map_err(|e| TxError::Validation(format!("invalid data: {}", e)))
}

/// Validate a request and convert it to typed parameters
pub fn normalize_tx_params(request: &TxRequest) -> TxResult<TxParams> {
    if request.from.trim().is_empty() {
        return Err(TxError::Validation("from address is required".to_string()));
    }
    let from = parse_address("from", &request.from)?;

    let to = match request.to.as_deref().map(str::trim) {
        None | Some("") | Some("0x") => None,
        Some(to) => Some(parse_address("to", to)?),
    };

    let data = match request.data.as_deref() {
        Some(data) => parse_data(data)?,
        None => Bytes::default(),
    };

    if to.is_none() && data.is_empty() {
        return Err(TxError::Validation(
            "to address is required unless deploying a contract".to_string(),
        ));
    }

    let value = match request.value.as_deref() {
        Some(value) => parse_quantity("value", value)?,
        None => U256::zero(),
    };

    let gas_limit = request
        .gas
        .as_deref()
        .map(|g| parse_quantity("gas", g))
        .transpose()?;
    if gas_limit == Some(U256::zero()) {
        return Err(TxError::Validation("gas must be positive".to_string()));
    }

    let gas_price = request
        .gas_price
        .as_deref()
        .map(|g| parse_quantity("gasPrice", g))
        .transpose()?;

    let nonce = match request.nonce.as_deref() {
        Some(n) => {
            let n = parse_quantity("nonce", n)?;
            if n > U256::from(u64::MAX) {
                return Err(TxError::Validation("nonce out of range".to_string()));
            }
            Some(n.as_u64())
        }
        None => None,
    };

    Ok(TxParams {
        from,
        to,
        value,
        data,
        nonce,
        gas_limit,
        gas_price,
        multisig_payload: None,
        expiration_timestamp_secs: request.expiration_timestamp_secs,
    })
}

/// Classify a transaction by the shape of its payload
pub fn determine_tx_type(params: &TxParams, swap: bool) -> TxType {
    if swap {
        return TxType::Swap;
    }
    if params.to.is_none() {
        return TxType::Deploy;
    }
    if params.data.is_empty() {
        return TxType::Transfer;
    }

    let selector = params.data.get(..4);
    let token_selectors = [
        erc20::transferCall::SELECTOR,
        erc20::transferFromCall::SELECTOR,
        erc20::approveCall::SELECTOR,
    ];
    match selector {
        Some(s) if token_selectors.iter().any(|t| t.as_slice() == s) => TxType::TokenTransfer,
        _ => TxType::ContractCall,
    }
}

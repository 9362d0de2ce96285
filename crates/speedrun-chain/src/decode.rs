//! ABI-driven Log Decoder (spec.md §4.2).
//!
//! Six event shapes, three semantic kinds: each kind has a plain variant and
//! a `WithCall` variant carrying an extra `bytes callData` tail. A decode
//! failure is logged and the log dropped; it never halts ingestion (§7).

use alloy::primitives::B256;
use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;
use speedrun_types::{
    DecodedEvent, DecodedFields, EventKind, FulfilledFields, InitiatedFields, SettledFields,
};
use thiserror::Error;
use tracing::warn;

sol! {
    event IntentInitiated(bytes32 indexed intentId, uint64 destinationChain, address token, address recipient, address sender, uint256 amount, uint256 intentFee);
    event IntentInitiatedWithCall(bytes32 indexed intentId, uint64 destinationChain, address token, address recipient, address sender, uint256 amount, uint256 intentFee, bytes callData);
    event IntentFulfilled(bytes32 indexed intentId, address asset, uint256 amount, address receiver);
    event IntentFulfilledWithCall(bytes32 indexed intentId, address asset, uint256 amount, address receiver, bytes callData);
    event IntentSettled(bytes32 indexed intentId, address asset, uint256 amount, address receiver, bool fulfilled, address fulfiller, uint256 actualAmount, uint256 paidTip);
    event IntentSettledWithCall(bytes32 indexed intentId, address asset, uint256 amount, address receiver, bool fulfilled, address fulfiller, uint256 actualAmount, uint256 paidTip, bytes callData);
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("log has no topics")]
    NoTopics,
    #[error("log topic0 {0} does not match any known event signature")]
    UnknownSignature(B256),
    #[error("log is missing block number")]
    MissingBlockNumber,
    #[error("log is missing block timestamp")]
    MissingBlockTimestamp,
    #[error("log is missing transaction hash")]
    MissingTxHash,
    #[error("log is missing log index")]
    MissingLogIndex,
    #[error(transparent)]
    Abi(#[from] alloy::sol_types::Error),
}

/// Topics for the phase-A catchup barrier: `Initiated` only (spec.md §4.6).
pub fn initiated_topics() -> [B256; 2] {
    [
        IntentInitiated::SIGNATURE_HASH,
        IntentInitiatedWithCall::SIGNATURE_HASH,
    ]
}

/// Topics for the phase-B catchup barrier: `Fulfilled` and `Settled`,
/// gated on phase A completing for every chain (spec.md §4.6).
pub fn fulfilled_settled_topics() -> [B256; 4] {
    [
        IntentFulfilled::SIGNATURE_HASH,
        IntentFulfilledWithCall::SIGNATURE_HASH,
        IntentSettled::SIGNATURE_HASH,
        IntentSettledWithCall::SIGNATURE_HASH,
    ]
}

/// The topic0 for every event this decoder recognizes, used by the live
/// Subscriber, which watches all three kinds at once.
pub fn known_topics() -> [B256; 6] {
    [
        IntentInitiated::SIGNATURE_HASH,
        IntentInitiatedWithCall::SIGNATURE_HASH,
        IntentFulfilled::SIGNATURE_HASH,
        IntentFulfilledWithCall::SIGNATURE_HASH,
        IntentSettled::SIGNATURE_HASH,
        IntentSettledWithCall::SIGNATURE_HASH,
    ]
}

/// Decode a single log into the tagged [`DecodedEvent`] shape shared across
/// the store and the state machine.
pub fn decode_log(log: &Log, chain_id: u64) -> Result<DecodedEvent, DecodeError> {
    let topic0 = log
        .topics()
        .first()
        .copied()
        .ok_or(DecodeError::NoTopics)?;
    let block_number = log.block_number.ok_or(DecodeError::MissingBlockNumber)?;
    let block_timestamp = log
        .block_timestamp
        .ok_or(DecodeError::MissingBlockTimestamp)?;
    let tx_hash = log.transaction_hash.ok_or(DecodeError::MissingTxHash)?;
    let log_index = log.log_index.ok_or(DecodeError::MissingLogIndex)?;

    let inner = log.inner.clone();

    let (kind, intent_id, fields, is_call, call_data) = if topic0 == IntentInitiated::SIGNATURE_HASH {
        let ev = IntentInitiated::decode_log(&inner)?;
        (
            EventKind::Initiated,
            ev.intentId,
            DecodedFields::Initiated(InitiatedFields {
                destination_chain: ev.destinationChain,
                token: ev.token,
                recipient: ev.recipient,
                sender: ev.sender,
                amount: ev.amount,
                intent_fee: ev.intentFee,
            }),
            false,
            None,
        )
    } else if topic0 == IntentInitiatedWithCall::SIGNATURE_HASH {
        let ev = IntentInitiatedWithCall::decode_log(&inner)?;
        (
            EventKind::Initiated,
            ev.intentId,
            DecodedFields::Initiated(InitiatedFields {
                destination_chain: ev.destinationChain,
                token: ev.token,
                recipient: ev.recipient,
                sender: ev.sender,
                amount: ev.amount,
                intent_fee: ev.intentFee,
            }),
            true,
            Some(ev.callData.clone()),
        )
    } else if topic0 == IntentFulfilled::SIGNATURE_HASH {
        let ev = IntentFulfilled::decode_log(&inner)?;
        (
            EventKind::Fulfilled,
            ev.intentId,
            DecodedFields::Fulfilled(FulfilledFields {
                asset: ev.asset,
                amount: ev.amount,
                receiver: ev.receiver,
            }),
            false,
            None,
        )
    } else if topic0 == IntentFulfilledWithCall::SIGNATURE_HASH {
        let ev = IntentFulfilledWithCall::decode_log(&inner)?;
        (
            EventKind::Fulfilled,
            ev.intentId,
            DecodedFields::Fulfilled(FulfilledFields {
                asset: ev.asset,
                amount: ev.amount,
                receiver: ev.receiver,
            }),
            true,
            Some(ev.callData.clone()),
        )
    } else if topic0 == IntentSettled::SIGNATURE_HASH {
        let ev = IntentSettled::decode_log(&inner)?;
        (
            EventKind::Settled,
            ev.intentId,
            DecodedFields::Settled(SettledFields {
                asset: ev.asset,
                amount: ev.amount,
                receiver: ev.receiver,
                fulfilled: ev.fulfilled,
                fulfiller: ev.fulfiller,
                actual_amount: ev.actualAmount,
                paid_tip: ev.paidTip,
            }),
            false,
            None,
        )
    } else if topic0 == IntentSettledWithCall::SIGNATURE_HASH {
        let ev = IntentSettledWithCall::decode_log(&inner)?;
        (
            EventKind::Settled,
            ev.intentId,
            DecodedFields::Settled(SettledFields {
                asset: ev.asset,
                amount: ev.amount,
                receiver: ev.receiver,
                fulfilled: ev.fulfilled,
                fulfiller: ev.fulfiller,
                actual_amount: ev.actualAmount,
                paid_tip: ev.paidTip,
            }),
            true,
            Some(ev.callData.clone()),
        )
    } else {
        return Err(DecodeError::UnknownSignature(topic0));
    };

    Ok(DecodedEvent {
        kind,
        intent_id,
        fields,
        block_number,
        block_timestamp,
        tx_hash,
        log_index,
        chain_id,
        is_call,
        call_data,
    })
}

/// Decode every log in `logs`, logging and skipping ones that fail rather
/// than aborting the whole batch (spec.md §7 "decode errors are logged and
/// the offending log is skipped").
pub fn decode_logs(logs: &[Log], chain_id: u64) -> Vec<DecodedEvent> {
    logs.iter()
        .filter_map(|log| match decode_log(log, chain_id) {
            Ok(ev) => Some(ev),
            Err(e) => {
                warn!(chain_id, err = %e, "dropping undecodable log");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, b256, Address, Bytes, LogData, U256};
    use alloy::rpc::types::Log as RpcLog;
    use alloy::sol_types::SolEvent;

    fn make_log(topics: Vec<B256>, data: Bytes) -> RpcLog {
        let inner = alloy::primitives::Log {
            address: address!("0x0000000000000000000000000000000000000001"),
            data: LogData::new_unchecked(topics, data),
        };
        RpcLog {
            inner,
            block_hash: Some(B256::ZERO),
            block_number: Some(100),
            block_timestamp: Some(1_700_000_000),
            transaction_hash: Some(b256!(
                "0x0000000000000000000000000000000000000000000000000000000000000002"
            )),
            transaction_index: Some(0),
            log_index: Some(0),
            removed: false,
        }
    }

    #[test]
    fn decodes_plain_initiated_event() {
        let intent_id = b256!("0x0000000000000000000000000000000000000000000000000000000000000003");
        let event = IntentInitiated {
            intentId: intent_id,
            destinationChain: 10,
            token: Address::ZERO,
            recipient: Address::ZERO,
            sender: Address::ZERO,
            amount: U256::from(1000u64),
            intentFee: U256::from(5u64),
        };
        let encoded = event.encode_log_data();
        let log = make_log(encoded.topics().to_vec(), encoded.data);

        let decoded = decode_log(&log, 1).unwrap();
        assert_eq!(decoded.kind, EventKind::Initiated);
        assert_eq!(decoded.intent_id, intent_id);
        assert!(!decoded.is_call);
        assert_eq!(decoded.call_data, None);
    }

    #[test]
    fn decodes_with_call_variant_and_captures_call_data() {
        let intent_id = b256!("0x0000000000000000000000000000000000000000000000000000000000000004");
        let event = IntentFulfilledWithCall {
            intentId: intent_id,
            asset: Address::ZERO,
            amount: U256::from(1u64),
            receiver: Address::ZERO,
            callData: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
        };
        let encoded = event.encode_log_data();
        let log = make_log(encoded.topics().to_vec(), encoded.data);

        let decoded = decode_log(&log, 1).unwrap();
        assert_eq!(decoded.kind, EventKind::Fulfilled);
        assert!(decoded.is_call);
        assert_eq!(decoded.call_data.as_deref(), Some(&[0xde, 0xad, 0xbe, 0xef][..]));
    }

    #[test]
    fn unknown_signature_is_rejected_not_panicked() {
        let log = make_log(vec![B256::repeat_byte(0xAB)], Bytes::new());
        assert!(matches!(
            decode_log(&log, 1),
            Err(DecodeError::UnknownSignature(_))
        ));
    }

    #[test]
    fn batch_decode_skips_bad_logs_and_keeps_good_ones() {
        let intent_id = b256!("0x0000000000000000000000000000000000000000000000000000000000000005");
        let good = {
            let event = IntentSettled {
                intentId: intent_id,
                asset: Address::ZERO,
                amount: U256::from(1u64),
                receiver: Address::ZERO,
                fulfilled: true,
                fulfiller: Address::ZERO,
                actualAmount: U256::from(1u64),
                paidTip: U256::ZERO,
            };
            let encoded = event.encode_log_data();
            make_log(encoded.topics().to_vec(), encoded.data)
        };
        let bad = make_log(vec![B256::repeat_byte(0xCD)], Bytes::new());

        let decoded = decode_logs(&[bad, good], 1);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].kind, EventKind::Settled);
    }
}

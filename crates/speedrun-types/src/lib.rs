//! Shared data model for the intent-indexing core (spec.md §3).
//!
//! No I/O lives here: this crate only defines the shapes that flow between
//! the chain client, the decoder, the store, and the state machine.

use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};

/// Forward-only lifecycle of an `Intent` (spec.md §3, §4.4).
///
/// Ordering matches transition rank: `Pending < Fulfilled < Settled`.
/// [`decide`] and the store's status-advance both rely on this `Ord` impl
/// to decide whether an observed event advances the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntentStatus {
    Pending,
    Fulfilled,
    Settled,
}

impl IntentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Fulfilled => "fulfilled",
            IntentStatus::Settled => "settled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IntentStatus::Pending),
            "fulfilled" => Some(IntentStatus::Fulfilled),
            "settled" => Some(IntentStatus::Settled),
            _ => None,
        }
    }
}

/// The three on-chain event kinds the core watches for (spec.md §1, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Initiated,
    Fulfilled,
    Settled,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::Initiated => "initiated",
            EventKind::Fulfilled => "fulfilled",
            EventKind::Settled => "settled",
        }
    }

    /// The status a fresh observation of this event kind implies, used both
    /// by the state machine and by the "late intent" backfill rule in
    /// spec.md §4.4 footnote 1.
    pub const fn implied_status(self) -> IntentStatus {
        match self {
            EventKind::Initiated => IntentStatus::Pending,
            EventKind::Fulfilled => IntentStatus::Fulfilled,
            EventKind::Settled => IntentStatus::Settled,
        }
    }
}

/// The user-originated cross-chain transfer request (spec.md §3 "Intent").
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub id: B256,
    pub source_chain: u64,
    pub destination_chain: u64,
    pub token: Address,
    pub recipient: Address,
    pub sender: Address,
    /// Decimal integer, up to 78 digits; stored as `alloy::U256` in-process
    /// and serialised to text at the persistence boundary (§9 REDESIGN
    /// FLAGS: "use a native big-integer type ... store as decimal string").
    pub amount: U256,
    pub intent_fee: U256,
    pub status: IntentStatus,
    pub is_call: bool,
    pub call_data: Option<Bytes>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Observation that some party delivered assets on the destination chain
/// (spec.md §3 "Fulfillment"). One row per intent id; re-observations are
/// ignored (§3 Lifecycles).
#[derive(Debug, Clone, PartialEq)]
pub struct Fulfillment {
    pub id: B256,
    pub asset: Address,
    pub amount: U256,
    pub receiver: Address,
    pub tx_hash: B256,
    pub block_number: u64,
    pub is_call: bool,
    pub call_data: Option<Bytes>,
    pub created_at: DateTime<Utc>,
}

/// The source-chain closure event (spec.md §3 "Settlement").
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub id: B256,
    pub asset: Address,
    pub amount: U256,
    pub receiver: Address,
    pub fulfilled: bool,
    pub fulfiller: Address,
    pub actual_amount: U256,
    pub paid_tip: U256,
    pub tx_hash: B256,
    pub block_number: u64,
    pub is_call: bool,
    pub call_data: Option<Bytes>,
    pub created_at: DateTime<Utc>,
}

/// Per-chain progress marker (spec.md §3 "ChainCursor").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainCursor {
    pub chain_id: u64,
    pub last_processed_block: u64,
    pub last_periodic_catchup_block: u64,
}

/// Fields carried by an `IntentInitiated`/`IntentInitiatedWithCall` log.
#[derive(Debug, Clone, PartialEq)]
pub struct InitiatedFields {
    pub destination_chain: u64,
    pub token: Address,
    pub recipient: Address,
    pub sender: Address,
    pub amount: U256,
    pub intent_fee: U256,
}

/// Fields carried by an `IntentFulfilled`/`IntentFulfilledWithCall` log.
#[derive(Debug, Clone, PartialEq)]
pub struct FulfilledFields {
    pub asset: Address,
    pub amount: U256,
    pub receiver: Address,
}

/// Fields carried by an `IntentSettled`/`IntentSettledWithCall` log.
#[derive(Debug, Clone, PartialEq)]
pub struct SettledFields {
    pub asset: Address,
    pub amount: U256,
    pub receiver: Address,
    pub fulfilled: bool,
    pub fulfiller: Address,
    pub actual_amount: U256,
    pub paid_tip: U256,
}

/// The kind-specific payload of a decoded log (spec.md §4.2).
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFields {
    Initiated(InitiatedFields),
    Fulfilled(FulfilledFields),
    Settled(SettledFields),
}

/// The tagged union a `LogDecoder` produces: `{kind, intentId, fields,
/// blockNumber, blockTimestamp, txHash, logIndex, chainId}` per spec.md
/// §4.2, plus the `is_call`/`call_data` carried by the `WithCall` variants.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub kind: EventKind,
    pub intent_id: B256,
    pub fields: DecodedFields,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub chain_id: u64,
    pub is_call: bool,
    pub call_data: Option<Bytes>,
}

/// What an observed event should do to the row, decided purely from the
/// current status and the event's implied status (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move (or create) the row at this status.
    Apply(IntentStatus),
    /// The event implies a status at or behind the current one; drop it.
    Ignore,
}

/// Decide the transition for an observed `event` given the intent's
/// `current` status (`None` if the intent row doesn't exist yet).
///
/// Forward-only: `Pending -> Fulfilled -> Settled`, never backward. An
/// event observed before its intent's `Initiated` event (the "late intent"
/// case, spec.md §4.4 footnote 1) is treated as `current = None` and
/// always applies. The store and the live subscribers both call this one
/// implementation so the transition rule can't drift between them.
pub fn decide(current: Option<IntentStatus>, event: EventKind) -> Transition {
    let implied = event.implied_status();
    match current {
        None => Transition::Apply(implied),
        Some(cur) if implied > cur => Transition::Apply(implied),
        Some(_) => Transition::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_rank_is_monotonic_increasing() {
        assert!(IntentStatus::Pending < IntentStatus::Fulfilled);
        assert!(IntentStatus::Fulfilled < IntentStatus::Settled);
        assert!(IntentStatus::Pending < IntentStatus::Settled);
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            IntentStatus::Pending,
            IntentStatus::Fulfilled,
            IntentStatus::Settled,
        ] {
            assert_eq!(IntentStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(IntentStatus::parse("processing"), None);
    }

    #[test]
    fn fresh_intent_applies_initiated() {
        assert_eq!(
            decide(None, EventKind::Initiated),
            Transition::Apply(IntentStatus::Pending)
        );
    }

    #[test]
    fn forward_transitions_apply() {
        assert_eq!(
            decide(Some(IntentStatus::Pending), EventKind::Fulfilled),
            Transition::Apply(IntentStatus::Fulfilled)
        );
        assert_eq!(
            decide(Some(IntentStatus::Fulfilled), EventKind::Settled),
            Transition::Apply(IntentStatus::Settled)
        );
        assert_eq!(
            decide(Some(IntentStatus::Pending), EventKind::Settled),
            Transition::Apply(IntentStatus::Settled)
        );
    }

    #[test]
    fn backward_and_stale_transitions_are_ignored() {
        assert_eq!(decide(Some(IntentStatus::Settled), EventKind::Fulfilled), Transition::Ignore);
        assert_eq!(decide(Some(IntentStatus::Fulfilled), EventKind::Initiated), Transition::Ignore);
        assert_eq!(decide(Some(IntentStatus::Settled), EventKind::Initiated), Transition::Ignore);
    }

    #[test]
    fn repeated_observation_of_current_status_is_ignored() {
        assert_eq!(decide(Some(IntentStatus::Fulfilled), EventKind::Fulfilled), Transition::Ignore);
    }

    #[test]
    fn late_intent_without_a_row_always_applies() {
        // A Fulfilled or Settled event observed ahead of its Initiated event
        // has no existing row to compare against, so it always creates one.
        assert_eq!(decide(None, EventKind::Settled), Transition::Apply(IntentStatus::Settled));
        assert_eq!(decide(None, EventKind::Fulfilled), Transition::Apply(IntentStatus::Fulfilled));
    }
}

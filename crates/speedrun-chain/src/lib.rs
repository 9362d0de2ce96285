//! Chain Client and Log Decoder (spec.md §4.1, §4.2).

pub mod client;
pub mod decode;

pub use client::{
    filter_logs_with_range_recovery, BlockHeader, ChainClient, ChainClientError, EvmChainClient,
    LogFilterRange, LogResultStream, LogSubscription, POLLING_ONLY_CHAIN_ID,
};
pub use decode::{
    decode_log, decode_logs, fulfilled_settled_topics, initiated_topics, known_topics, DecodeError,
};

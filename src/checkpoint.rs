/// Checkpoint Codec
///
/// Every event the engine touches is positioned by a fixed-width decimal
/// string, so that ordering, SQL predicates on the shadow tables and cursor
/// persistence all reduce to plain string comparison. Six zero-padded fields
/// are concatenated in this order and width:
///
///   block_timestamp(10) | chain_id(16) | block_number(16) |
///   transaction_index(16) | event_type(1) | event_index(16)
///
/// Lexicographic order of encoded strings MUST equal tuple order of the
/// underlying integers. That property is what lets the store filter with
/// `WHERE checkpoint > $1` without decoding anything.

use crate::errors::{EngineError, EngineResult};

pub const TIMESTAMP_DIGITS: usize = 10;
pub const CHAIN_ID_DIGITS: usize = 16;
pub const BLOCK_NUMBER_DIGITS: usize = 16;
pub const TRANSACTION_INDEX_DIGITS: usize = 16;
pub const EVENT_TYPE_DIGITS: usize = 1;
pub const EVENT_INDEX_DIGITS: usize = 16;

pub const CHECKPOINT_LEN: usize = TIMESTAMP_DIGITS
    + CHAIN_ID_DIGITS
    + BLOCK_NUMBER_DIGITS
    + TRANSACTION_INDEX_DIGITS
    + EVENT_TYPE_DIGITS
    + EVENT_INDEX_DIGITS;

/// Sentinel for setup events: sorts before every real checkpoint.
pub const ZERO_CHECKPOINT: &str =
    "000000000000000000000000000000000000000000000000000000000000000000000000000";

/// Sentinel used by the shadow-table triggers for rows whose event position
/// is not yet known: sorts after every real checkpoint.
pub const MAX_CHECKPOINT: &str =
    "999999999999999999999999999999999999999999999999999999999999999999999999999";

const MAX_TIMESTAMP: u64 = 9_999_999_999;
const MAX_WIDE_FIELD: u64 = 9_999_999_999_999_999;

/// Stable discriminant per event variant. Ties between variants inside the
/// same transaction break on this value: the block-level event first, then
/// the transaction envelope, then its traces, logs and derived transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    Setup = 0,
    Block = 1,
    Transaction = 2,
    Trace = 3,
    Log = 4,
    Transfer = 5,
}

impl EventType {
    pub fn as_digit(&self) -> u64 {
        *self as u64
    }

    pub fn from_digit(digit: u64) -> EngineResult<Self> {
        match digit {
            0 => Ok(EventType::Setup),
            1 => Ok(EventType::Block),
            2 => Ok(EventType::Transaction),
            3 => Ok(EventType::Trace),
            4 => Ok(EventType::Log),
            5 => Ok(EventType::Transfer),
            other => Err(EngineError::engine(format!(
                "invalid checkpoint: unknown event type {}",
                other
            ))),
        }
    }
}

/// The decoded form of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CheckpointFields {
    pub block_timestamp: u64,
    pub chain_id: u64,
    pub block_number: u64,
    pub transaction_index: u64,
    pub event_type: EventType,
    pub event_index: u64,
}

/// Encode checkpoint fields into the fixed-width string form.
///
/// Fails with an engine error if any field exceeds its width; a value that
/// wide cannot come from a well-formed block stream.
pub fn encode(fields: &CheckpointFields) -> EngineResult<String> {
    if fields.block_timestamp > MAX_TIMESTAMP {
        return Err(EngineError::engine(format!(
            "invalid checkpoint: block timestamp {} exceeds {} digits",
            fields.block_timestamp, TIMESTAMP_DIGITS
        )));
    }
    for (name, value) in [
        ("chain id", fields.chain_id),
        ("block number", fields.block_number),
        ("transaction index", fields.transaction_index),
        ("event index", fields.event_index),
    ] {
        if value > MAX_WIDE_FIELD {
            return Err(EngineError::engine(format!(
                "invalid checkpoint: {} {} exceeds {} digits",
                name, value, BLOCK_NUMBER_DIGITS
            )));
        }
    }
    Ok(format!(
        "{:010}{:016}{:016}{:016}{}{:016}",
        fields.block_timestamp,
        fields.chain_id,
        fields.block_number,
        fields.transaction_index,
        fields.event_type.as_digit(),
        fields.event_index,
    ))
}

/// Decode a checkpoint string back into its fields.
pub fn decode(checkpoint: &str) -> EngineResult<CheckpointFields> {
    if checkpoint.len() != CHECKPOINT_LEN {
        return Err(EngineError::engine(format!(
            "invalid checkpoint: expected {} characters, got {}",
            CHECKPOINT_LEN,
            checkpoint.len()
        )));
    }
    if !checkpoint.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EngineError::engine(
            "invalid checkpoint: non-digit character".to_string(),
        ));
    }

    let mut offset = 0;
    let mut take = |width: usize| -> u64 {
        let slice = &checkpoint[offset..offset + width];
        offset += width;
        // All-digit slice of <= 16 chars always parses
        slice.parse::<u64>().unwrap_or(0)
    };

    let block_timestamp = take(TIMESTAMP_DIGITS);
    let chain_id = take(CHAIN_ID_DIGITS);
    let block_number = take(BLOCK_NUMBER_DIGITS);
    let transaction_index = take(TRANSACTION_INDEX_DIGITS);
    let event_type_digit = take(EVENT_TYPE_DIGITS);
    let event_index = take(EVENT_INDEX_DIGITS);

    Ok(CheckpointFields {
        block_timestamp,
        chain_id,
        block_number,
        transaction_index,
        event_type: EventType::from_digit(event_type_digit)?,
        event_index,
    })
}

/// String comparison is the total order; this exists for call sites that
/// want the intent spelled out.
pub fn compare(a: &str, b: &str) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Checkpoint of the upper boundary of a block: compares greater than every
/// event inside the block and less than every event of any later block.
/// Used for reorg ancestors, finality watermarks and idle declarations.
pub fn block_boundary(block_timestamp: u64, chain_id: u64, block_number: u64) -> EngineResult<String> {
    if block_timestamp > MAX_TIMESTAMP || chain_id > MAX_WIDE_FIELD || block_number > MAX_WIDE_FIELD
    {
        return Err(EngineError::engine(
            "invalid checkpoint: block boundary field overflow".to_string(),
        ));
    }
    Ok(format!(
        "{:010}{:016}{:016}{}9{:016}",
        block_timestamp, chain_id, block_number, MAX_WIDE_FIELD, MAX_WIDE_FIELD,
    ))
}

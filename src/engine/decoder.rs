//! Event Decoder: raw log records into typed lending events.
//!
//! Decoding is strict: the topic count and data width must match the event
//! signature exactly, and indexed address topics must be left-padded words.

use crate::domain::primitives::{u256_to_u64, word_to_address};
use crate::domain::{Address, DecodedEvent, DomainEvent, RawEventRecord, B256, U256};
use crate::error::{DecodeError, DecodeFailure};
use alloy_primitives::b256;

/// Topic-0 hashes of every signature the decoder understands.
pub mod topics {
    use super::*;

    /// `ReserveDataUpdated(address,uint256,uint256,uint256,uint256,uint256)`
    pub const RESERVE_DATA_UPDATED: B256 =
        b256!("804c9b842b2748a22bb64b345453a3de7ca54a6ca45ce00d415894979e22897a");
    /// `Mint(address,address,uint256,uint256,uint256)`
    pub const MINT: B256 =
        b256!("458f5fa412d0f69b08dd84872b0215675cc67bc1d5b6fd93300a1c3878b86196");
    /// `Burn(address,address,uint256,uint256,uint256)`
    pub const BURN: B256 =
        b256!("4cf25bc1d991c17529c25213d3cc0cda295eeaad5f13f361969b12ea48015f90");
    /// `BalanceTransfer(address,address,uint256,uint256)`
    pub const BALANCE_TRANSFER: B256 =
        b256!("4beccb90f994c31aced7a23b5611020728a23d8ec5cddd1a3e9d97b96fda8666");
    /// `UserEModeSet(address,uint8)`
    pub const USER_E_MODE_SET: B256 =
        b256!("d728da875fc88944cbf17638bcbe4af0eedaef63becd1d1c57cc097eb4608d84");
    /// `Upgraded(address)`
    pub const UPGRADED: B256 =
        b256!("bc7cd75a20ee27fd9adebab32041f755214dbc6bffa90cc0225b39da2e5c2d3b");
    /// `DiscountTokenUpdated(address,address)`
    pub const DISCOUNT_TOKEN_UPDATED: B256 =
        b256!("6b489e1dbfbe36f55c511c098bcc9d92fec7f04f74ceb75018697ab68f7d3529");
    /// `DiscountRateStrategyUpdated(address,address)`
    pub const DISCOUNT_RATE_STRATEGY_UPDATED: B256 =
        b256!("194bd59f47b230edccccc2be58b92dde3a5dadd835751a621af59006928bccef");
    /// `Transfer(address,address,uint256)`
    pub const TRANSFER: B256 =
        b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

    /// Every topic a Log Source should request.
    pub const ALL: [B256; 9] = [
        RESERVE_DATA_UPDATED,
        MINT,
        BURN,
        BALANCE_TRANSFER,
        USER_E_MODE_SET,
        UPGRADED,
        DISCOUNT_TOKEN_UPDATED,
        DISCOUNT_RATE_STRATEGY_UPDATED,
        TRANSFER,
    ];
}

/// Market context the decoder needs to classify ambiguous logs.
#[derive(Debug, Clone, Default)]
pub struct DecodeContext {
    /// ERC-20 `Transfer` logs are only meaningful when emitted by one of
    /// these tokens: the configured discount token, plus any it is replaced
    /// by within the chunk being decoded.
    pub discount_tokens: Vec<Address>,
}

pub struct EventDecoder;

struct RecordReader<'a> {
    record: &'a RawEventRecord,
    event: &'static str,
}

impl<'a> RecordReader<'a> {
    fn new(
        record: &'a RawEventRecord,
        event: &'static str,
        topic_count: usize,
        data_words: usize,
    ) -> Result<Self, DecodeFailure> {
        if record.topics.len() != topic_count {
            return Err(DecodeFailure::TopicCount {
                event,
                expected: topic_count,
                found: record.topics.len(),
            });
        }
        if record.data.len() != data_words * 32 {
            return Err(DecodeFailure::DataLength {
                event,
                expected: data_words * 32,
                found: record.data.len(),
            });
        }
        Ok(RecordReader { record, event })
    }

    fn address_topic(&self, topic: usize) -> Result<Address, DecodeFailure> {
        word_to_address(&self.record.topics[topic]).ok_or(DecodeFailure::InvalidAddress {
            event: self.event,
            topic,
        })
    }

    fn word(&self, index: usize) -> U256 {
        U256::from_be_slice(&self.record.data[index * 32..(index + 1) * 32])
    }
}

impl EventDecoder {
    /// Decode one record.
    ///
    /// Returns `Ok(None)` only for ERC-20 `Transfer` logs of contracts other
    /// than the discount token; every other unrecognised or malformed record
    /// is a `DecodeError`.
    pub fn decode(
        record: &RawEventRecord,
        context: &DecodeContext,
    ) -> Result<Option<DecodedEvent>, DecodeError> {
        Self::decode_event(record, context)
            .map(|event| {
                event.map(|event| DecodedEvent {
                    emitter: record.address,
                    block_number: record.block_number,
                    log_index: record.log_index,
                    tx_hash: record.tx_hash,
                    event,
                })
            })
            .map_err(|reason| DecodeError {
                tx_hash: record.tx_hash,
                log_index: record.log_index,
                block_number: record.block_number,
                reason,
            })
    }

    fn decode_event(
        record: &RawEventRecord,
        context: &DecodeContext,
    ) -> Result<Option<DomainEvent>, DecodeFailure> {
        let signature = *record.topics.first().ok_or(DecodeFailure::MissingTopics)?;

        let event = match signature {
            topics::RESERVE_DATA_UPDATED => {
                let r = RecordReader::new(record, "ReserveDataUpdated", 2, 5)?;
                DomainEvent::ReserveDataUpdated {
                    asset: r.address_topic(1)?,
                    liquidity_rate: r.word(0),
                    stable_borrow_rate: r.word(1),
                    variable_borrow_rate: r.word(2),
                    liquidity_index: r.word(3),
                    variable_borrow_index: r.word(4),
                }
            }
            topics::MINT => {
                let r = RecordReader::new(record, "Mint", 3, 3)?;
                DomainEvent::Mint {
                    caller: r.address_topic(1)?,
                    on_behalf_of: r.address_topic(2)?,
                    value: r.word(0),
                    balance_increase: r.word(1),
                    index: r.word(2),
                }
            }
            topics::BURN => {
                let r = RecordReader::new(record, "Burn", 3, 3)?;
                DomainEvent::Burn {
                    from: r.address_topic(1)?,
                    target: r.address_topic(2)?,
                    value: r.word(0),
                    balance_increase: r.word(1),
                    index: r.word(2),
                }
            }
            topics::BALANCE_TRANSFER => {
                let r = RecordReader::new(record, "BalanceTransfer", 3, 2)?;
                DomainEvent::BalanceTransfer {
                    from: r.address_topic(1)?,
                    to: r.address_topic(2)?,
                    amount: r.word(0),
                    index: Some(r.word(1)),
                }
            }
            topics::USER_E_MODE_SET => {
                let r = RecordReader::new(record, "UserEModeSet", 2, 1)?;
                let category_id = u8::try_from(r.word(0)).map_err(|_| DecodeFailure::FieldRange {
                    event: "UserEModeSet",
                    field: "categoryId",
                })?;
                DomainEvent::UserEModeSet {
                    user: r.address_topic(1)?,
                    category_id,
                }
            }
            topics::UPGRADED => {
                let r = RecordReader::new(record, "Upgraded", 2, 1)?;
                let new_revision = u256_to_u64(r.word(0))
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or(DecodeFailure::FieldRange {
                        event: "Upgraded",
                        field: "revision",
                    })?;
                DomainEvent::Upgraded {
                    implementation: r.address_topic(1)?,
                    new_revision,
                }
            }
            topics::DISCOUNT_TOKEN_UPDATED => {
                let r = RecordReader::new(record, "DiscountTokenUpdated", 3, 0)?;
                DomainEvent::DiscountTokenUpdated {
                    old_address: r.address_topic(1)?,
                    new_address: r.address_topic(2)?,
                }
            }
            topics::DISCOUNT_RATE_STRATEGY_UPDATED => {
                let r = RecordReader::new(record, "DiscountRateStrategyUpdated", 3, 0)?;
                DomainEvent::DiscountRateStrategyUpdated {
                    old_address: r.address_topic(1)?,
                    new_address: r.address_topic(2)?,
                }
            }
            topics::TRANSFER => {
                if !context.discount_tokens.contains(&record.address) {
                    tracing::trace!(
                        emitter = %record.address,
                        position = %record.position(),
                        "ignoring Transfer from non-discount token"
                    );
                    return Ok(None);
                }
                let r = RecordReader::new(record, "Transfer", 3, 1)?;
                DomainEvent::BalanceTransfer {
                    from: r.address_topic(1)?,
                    to: r.address_topic(2)?,
                    amount: r.word(0),
                    index: None,
                }
            }
            other => return Err(DecodeFailure::UnknownSignature(other)),
        };

        Ok(Some(event))
    }
}

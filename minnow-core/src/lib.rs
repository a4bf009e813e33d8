//! # minnow-core
//!
//! Data-plane primitives shared by the minnow transport and runtime:
//!
//! - [`Token`]: an immutable, pre-encoded value
//! - [`Fifo`]: bounded token queue with local peek/commit/cancel and
//!   sequence-gated remote consumption
//! - [`codec`]: MessagePack and JSON codecs plus keyed access into
//!   schema-less map values
//! - [`BoundedTable`]: fixed-capacity collection with a typed overflow error
//! - [`gen_uuid`] and [`uuid_is_higher`] for message and tunnel ids

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod bounded;
pub mod codec;
pub mod fifo;
pub mod id;
pub mod token;

pub use bounded::{BoundedTable, CapacityError};
pub use codec::{
    decode_value, encode_value, map_of, str_or_nil, CodecError, JsonCodec, MessageCodec,
    MsgPackCodec, ValueExt,
};
pub use fifo::{Fifo, FifoError, QUEUE_TYPE};
pub use id::{compare_ids, gen_uuid, uuid_is_higher, MSG_PREFIX, TUNNEL_PREFIX};
pub use token::{Token, TokenError, MAX_TOKEN_SIZE};

pub use rmpv::Value;

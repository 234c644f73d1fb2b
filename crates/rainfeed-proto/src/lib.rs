//! # Rainfeed Protocol
//!
//! Wire format and topic naming shared by snapshot producers and consumers.
//!
//! ## Wire format
//!
//! Snapshots travel as CBOR maps with explicitly named keys (see
//! [`codec`]). Producers and consumers deploy independently, so decoders
//! ignore unknown keys and every new key carries a default.
//!
//! ## Topics
//!
//! Subscription scheme: `{topic}.{group}`, see [`topics`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod topics;

pub use codec::{decode, encode, CodecError, WIRE_VERSION};
pub use topics::{Durability, Subscription, TopicError, DEFAULT_TOPIC};

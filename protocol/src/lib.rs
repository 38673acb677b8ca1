//! Wire framing, tag constants, and SOCKS4a setup strings (§3, §6).
//!
//! This crate owns the byte-level contract `cc-network`'s `Connection`
//! reads and writes: the `size:u32 | tag:u32 | [pow:48] | body` message
//! shape, the tag namespaces that distinguish object kinds from command and
//! message verbs, and the Tor SOCKS4a handshake used to reach onion peers.
//! It does not know about peers, sockets, or retries — those live in
//! `cc-network`, which depends on this crate rather than the other way
//! around.

mod builder;
mod convert;
mod error;
mod socks;
mod tags;

pub use builder::{encode_header, encode_object, PowBlock, HEADER_LEN, NONCE_COUNT, POW_BLOCK_LEN, SIZE_LEN, TAG_LEN};
pub use convert::{parse_object, ParsedObject, CC_BLOCK_MAX_SIZE, CC_TX_MAX_SIZE};
pub use error::{Error, Result};
pub use socks::{check_reply, connect_string};
pub use tags::{
    block_tag, has_pow, obj_type, type_to_wire_tag, wire_tag, ObjType, CC_CMD_SEND_BLOCK,
    CC_CMD_SEND_TX, CC_MSG_HAVE_BLOCK, CC_MSG_HAVE_TX, CC_TAG_BLOCK, CC_TAG_BLOCK_FLAG,
    CC_TAG_LAST_OBJ, CC_TAG_MINT, CC_TAG_TX, CC_TAG_TX_XDOMAIN, CC_TAG_XCX_NAKED_BUY,
    CC_TAG_XCX_NAKED_SELL, CC_TAG_XCX_PAYMENT, CC_TAG_XCX_SIMPLE_BUY, CC_TAG_XCX_SIMPLE_SELL,
    CC_TAG_XCX_SIMPLE_TRADE,
};

//! Wire tag constants (§6). Object tags share one namespace with a single
//! high bit, `CC_TAG_BLOCK_FLAG`, reserved to mark a tag as the block-shaped
//! variant of the framing (blocks carry their own work-proof, embedded in
//! the block body itself, so they are excluded from [`has_pow`]). Command
//! and message tags are a separate namespace — they select the peer-level
//! verb wrapping an object, not the object's own type.

use crate::error::{Error, Result};

pub const CC_TAG_MINT: u32 = 1;
pub const CC_TAG_TX: u32 = 2;
pub const CC_TAG_TX_XDOMAIN: u32 = 3;
pub const CC_TAG_XCX_SIMPLE_BUY: u32 = 4;
pub const CC_TAG_XCX_SIMPLE_SELL: u32 = 5;
pub const CC_TAG_XCX_SIMPLE_TRADE: u32 = 6;
pub const CC_TAG_XCX_NAKED_BUY: u32 = 7;
pub const CC_TAG_XCX_NAKED_SELL: u32 = 8;
pub const CC_TAG_XCX_PAYMENT: u32 = 9;
pub const CC_TAG_LAST_OBJ: u32 = CC_TAG_XCX_PAYMENT;
pub const CC_TAG_BLOCK: u32 = 10;

/// ORed into an object tag to mark it as carrying a block rather than a
/// loose transaction/request. Never itself set on `CC_TAG_BLOCK`'s base
/// value above; always applied via [`block_tag`].
pub const CC_TAG_BLOCK_FLAG: u32 = 0x8000_0000;

pub const CC_CMD_SEND_BLOCK: u32 = 1;
pub const CC_CMD_SEND_TX: u32 = 2;

pub const CC_MSG_HAVE_BLOCK: u32 = 1;
pub const CC_MSG_HAVE_TX: u32 = 2;

/// The object kind a wire tag names, independent of the block flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjType {
    Block,
    Mint,
    Tx,
    TxXdomain,
    XcxSimpleBuy,
    XcxSimpleSell,
    XcxSimpleTrade,
    XcxNakedBuy,
    XcxNakedSell,
    XcxPayment,
}

/// Strips the block flag, recovering the plain object tag.
pub fn wire_tag(tag: u32) -> u32 {
    tag & !CC_TAG_BLOCK_FLAG
}

/// Sets the block flag on a plain object tag.
pub fn block_tag(tag: u32) -> u32 {
    tag | CC_TAG_BLOCK_FLAG
}

/// True when `tag` is a sender-supplied proof-of-work object (every
/// non-block object tag); blocks carry their consensus proof inline in the
/// body instead and are excluded here.
pub fn has_pow(tag: u32) -> bool {
    (CC_TAG_MINT..=CC_TAG_LAST_OBJ).contains(&tag) && tag & CC_TAG_BLOCK_FLAG == 0
}

pub fn obj_type(tag: u32) -> Result<ObjType> {
    Ok(match wire_tag(tag) {
        CC_TAG_BLOCK => ObjType::Block,
        CC_TAG_MINT => ObjType::Mint,
        CC_TAG_TX => ObjType::Tx,
        CC_TAG_TX_XDOMAIN => ObjType::TxXdomain,
        CC_TAG_XCX_SIMPLE_BUY => ObjType::XcxSimpleBuy,
        CC_TAG_XCX_SIMPLE_SELL => ObjType::XcxSimpleSell,
        CC_TAG_XCX_SIMPLE_TRADE => ObjType::XcxSimpleTrade,
        CC_TAG_XCX_NAKED_BUY => ObjType::XcxNakedBuy,
        CC_TAG_XCX_NAKED_SELL => ObjType::XcxNakedSell,
        CC_TAG_XCX_PAYMENT => ObjType::XcxPayment,
        other => return Err(Error::UnknownTag(other)),
    })
}

pub fn type_to_wire_tag(ty: ObjType) -> u32 {
    match ty {
        ObjType::Block => CC_TAG_BLOCK,
        ObjType::Mint => CC_TAG_MINT,
        ObjType::Tx => CC_TAG_TX,
        ObjType::TxXdomain => CC_TAG_TX_XDOMAIN,
        ObjType::XcxSimpleBuy => CC_TAG_XCX_SIMPLE_BUY,
        ObjType::XcxSimpleSell => CC_TAG_XCX_SIMPLE_SELL,
        ObjType::XcxSimpleTrade => CC_TAG_XCX_SIMPLE_TRADE,
        ObjType::XcxNakedBuy => CC_TAG_XCX_NAKED_BUY,
        ObjType::XcxNakedSell => CC_TAG_XCX_NAKED_SELL,
        ObjType::XcxPayment => CC_TAG_XCX_PAYMENT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_flag_round_trips() {
        let t = block_tag(CC_TAG_BLOCK);
        assert_eq!(wire_tag(t), CC_TAG_BLOCK);
        assert_ne!(t, CC_TAG_BLOCK);
    }

    #[test]
    fn has_pow_excludes_block_but_not_mint() {
        assert!(has_pow(CC_TAG_MINT));
        assert!(has_pow(CC_TAG_XCX_PAYMENT));
        assert!(!has_pow(CC_TAG_BLOCK));
        assert!(!has_pow(block_tag(CC_TAG_MINT)));
    }

    #[test]
    fn obj_type_round_trips_through_wire_tag() {
        for ty in [
            ObjType::Block,
            ObjType::Mint,
            ObjType::Tx,
            ObjType::TxXdomain,
            ObjType::XcxSimpleBuy,
            ObjType::XcxSimpleSell,
            ObjType::XcxSimpleTrade,
            ObjType::XcxNakedBuy,
            ObjType::XcxNakedSell,
            ObjType::XcxPayment,
        ] {
            assert_eq!(obj_type(type_to_wire_tag(ty)).unwrap(), ty);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(obj_type(0xdead), Err(Error::UnknownTag(0xdead)));
    }
}

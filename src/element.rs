//! Canonical byte serialization of one unspent output.
//!
//! The engine itself never looks past an element's leading nibbles; this
//! codec exists so that independent nodes hashing the same UTXO set feed
//! identical bytes into their multisets and arrive at identical digests.

use serde::{Deserialize, Serialize};
use std::io::{self, Write};

/// Reference to the transaction output an element commits to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// Identifier of the creating transaction.
    pub txid: [u8; 32],
    /// Index of the output within that transaction.
    pub vout: u32,
}

/// The unspent output itself, as carried by the chain state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// Height of the block that created the output.
    pub height: u32,
    /// Whether the creating transaction was a coinbase.
    pub is_coinbase: bool,
    /// Output value in base units.
    pub amount: u64,
    /// The locking script, verbatim.
    pub script: Vec<u8>,
}

/// Serializes one unspent output into the canonical element bytes:
///
/// ```text
/// txid[32] || vout_le[4] || varint(height * 2 + coinbase) ||
/// amount_le[8] || compact_size(script.len()) || script
/// ```
pub fn encode_element(out: &OutPoint, coin: &Coin) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + 4 + 5 + 8 + 3 + coin.script.len());
    buf.extend_from_slice(&out.txid);
    buf.extend_from_slice(&out.vout.to_le_bytes());
    let code = u64::from(coin.height) * 2 + u64::from(coin.is_coinbase);
    VarInt(code)
        .serialize(&mut buf)
        .expect("write to Vec cannot fail");
    buf.extend_from_slice(&coin.amount.to_le_bytes());
    write_compact_size(&mut buf, coin.script.len() as u64).expect("write to Vec cannot fail");
    buf.extend_from_slice(&coin.script);
    buf
}

/// Writes a length in the ledger's compact-size encoding.
pub fn write_compact_size<W: Write>(writer: &mut W, size: u64) -> io::Result<()> {
    if size < 253 {
        writer.write_all(&[size as u8])?;
    } else if size <= 0xFFFF {
        writer.write_all(&[253])?;
        writer.write_all(&(size as u16).to_le_bytes())?;
    } else if size <= 0xFFFF_FFFF {
        writer.write_all(&[254])?;
        writer.write_all(&(size as u32).to_le_bytes())?;
    } else {
        writer.write_all(&[255])?;
        writer.write_all(&size.to_le_bytes())?;
    }
    Ok(())
}

/// Variable-length unsigned integer, 7 bits per byte, low group first.
pub struct VarInt(pub u64);

impl VarInt {
    /// Writes the integer to `writer`.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut value = self.0;
        while value >= 0x80 {
            writer.write_all(&[((value & 0x7F) | 0x80) as u8])?;
            value >>= 7;
        }
        writer.write_all(&[value as u8])?;
        Ok(())
    }
}

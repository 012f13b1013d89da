//! The chain as the registry sees it.
//!
//! The registry is not a ledger client; it consumes a narrow read-only
//! view that the hosting node injects. Everything here is that view:
//! the [`Ledger`] trait and the handful of chain-side types crossing it.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::pubkey::PublicKey;

//------------ UtxoId --------------------------------------------------------

/// The hash identifying an unspent output on the chain.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd,
)]
pub struct UtxoId([u8; 32]);

impl UtxoId {
    pub fn from_bytes(octets: [u8; 32]) -> Self {
        UtxoId(octets)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The all-zero id used where no on-chain anchor exists.
    ///
    /// Payloads reconstructed from DNS answers on the caching path carry
    /// this value.
    pub fn zero() -> Self {
        UtxoId([0; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }
}

impl fmt::Display for UtxoId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for octet in self.0 {
            write!(f, "{octet:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for UtxoId {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err("utxo id must be 64 hex characters");
        }
        let mut octets = [0; 32];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|_| "utxo id must be hex")?;
        }
        Ok(UtxoId(octets))
    }
}

//------------ BlockHash -----------------------------------------------------

/// The hash of a block, used to confirm flash channel descriptors.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct BlockHash(pub [u8; 32]);

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for octet in self.0 {
            write!(f, "{octet:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for BlockHash {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err("block hash must be 64 hex characters");
        }
        let mut octets = [0; 32];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|_| "block hash must be hex")?;
        }
        Ok(BlockHash(octets))
    }
}

impl Serialize for BlockHash {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        BlockHash::from_str(&s).map_err(D::Error::custom)
    }
}

//------------ Amount --------------------------------------------------------

/// A quantity of coins.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

//------------ ValidatorInfo -------------------------------------------------

/// A validator active at some height.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidatorInfo {
    /// The key the validator signs with.
    pub address: PublicKey,

    /// The frozen output backing its enrollment.
    pub utxo: UtxoId,
}

//------------ StakeOutput ---------------------------------------------------

/// A frozen output that may back a future enrollment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StakeOutput {
    pub utxo: UtxoId,
    pub owner: PublicKey,
    pub amount: Amount,
}

//------------ BlockHeader ---------------------------------------------------

/// The part of a block the registry looks at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub height: u64,
    pub hash: BlockHash,
}

//------------ Ledger --------------------------------------------------------

/// Read-only view of the chain.
///
/// Injected by the hosting node. All methods are synchronous: the node is
/// expected to answer from its own in-memory chain state, not by touching
/// the network.
pub trait Ledger: Send + Sync {
    /// The height of the last externalised block.
    fn height(&self) -> u64;

    /// The validators active at the given height.
    fn validators_at(&self, height: u64) -> Vec<ValidatorInfo>;

    /// All currently frozen stake outputs.
    fn stakes(&self) -> Vec<StakeOutput>;

    /// The remaining penalty deposit of a stake.
    ///
    /// Zero means the stake was slashed; the registry drops the
    /// validator's records in response.
    fn penalty_deposit(&self, utxo: &UtxoId) -> Amount;

    /// The header of the block at the given height, if one exists.
    fn block_at(&self, height: u64) -> Option<BlockHeader>;
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utxo_id_hex_round_trips() {
        let id = UtxoId::from_bytes([0x5a; 32]);
        assert_eq!(id.to_string().parse::<UtxoId>().unwrap(), id);
    }

    #[test]
    fn zero_utxo_is_zero() {
        assert!(UtxoId::zero().is_zero());
        assert!(!UtxoId::from_bytes([1; 32]).is_zero());
    }
}

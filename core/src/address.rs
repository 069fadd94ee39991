//! Payout-address classification.
//!
//! Usernames are typically payout addresses. The pool only needs to know
//! what kind of output script the address pays to and the script bytes
//! themselves, computed once at authorize time.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("base58 decode failed: {0}")]
    Base58(#[from] bs58::decode::Error),
    #[error("bech32 decode failed: {0}")]
    Bech32(String),
    #[error("unknown base58 version byte {0:#04x}")]
    UnknownVersion(u8),
    #[error("bad payload length {0}")]
    BadLength(usize),
    #[error("unrecognized address format")]
    Unrecognized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    P2pkh,
    P2sh,
    WitnessV0Keyhash,
    WitnessV0Scripthash,
    WitnessV1Taproot,
}

/// A parsed payout address: its kind and the ready-to-embed output script.
#[derive(Debug, Clone)]
pub struct PayoutAddress {
    pub kind: AddressKind,
    pub script: Vec<u8>,
}

impl PayoutAddress {
    pub fn is_segwit(&self) -> bool {
        matches!(
            self.kind,
            AddressKind::WitnessV0Keyhash
                | AddressKind::WitnessV0Scripthash
                | AddressKind::WitnessV1Taproot
        )
    }

    pub fn is_script(&self) -> bool {
        self.kind == AddressKind::P2sh
    }

    /// Parse a Base58Check or Bech32 address into its output script.
    /// Mainnet, testnet and regtest version bytes / HRPs are all accepted;
    /// the pool does not police networks here.
    pub fn parse(addr: &str) -> Result<Self, AddressError> {
        if addr.is_empty() {
            return Err(AddressError::Empty);
        }

        if let Ok((_, version, program)) = bech32::segwit::decode(addr) {
            let v = version.to_u8();
            let kind = match (v, program.len()) {
                (0, 20) => AddressKind::WitnessV0Keyhash,
                (0, 32) => AddressKind::WitnessV0Scripthash,
                (1, 32) => AddressKind::WitnessV1Taproot,
                (_, len) => return Err(AddressError::BadLength(len)),
            };
            let mut script = Vec::with_capacity(2 + program.len());
            script.push(if v == 0 { 0x00 } else { 0x50 + v });
            script.push(program.len() as u8);
            script.extend_from_slice(&program);
            return Ok(Self { kind, script });
        }

        // Bech32 HRPs never survive base58check, so falling through is safe.
        let payload = bs58::decode(addr).with_check(None).into_vec()?;
        if payload.len() != 21 {
            return Err(AddressError::BadLength(payload.len()));
        }
        let hash = &payload[1..21];
        match payload[0] {
            // 0x00 mainnet P2PKH, 0x6f testnet
            0x00 | 0x6f => {
                let mut script = Vec::with_capacity(25);
                script.extend_from_slice(&[0x76, 0xa9, 0x14]);
                script.extend_from_slice(hash);
                script.extend_from_slice(&[0x88, 0xac]);
                Ok(Self {
                    kind: AddressKind::P2pkh,
                    script,
                })
            }
            // 0x05 mainnet P2SH, 0xc4 testnet
            0x05 | 0xc4 => {
                let mut script = Vec::with_capacity(23);
                script.extend_from_slice(&[0xa9, 0x14]);
                script.extend_from_slice(hash);
                script.push(0x87);
                Ok(Self {
                    kind: AddressKind::P2sh,
                    script,
                })
            }
            v => Err(AddressError::UnknownVersion(v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_p2pkh() {
        // The genesis-block address.
        let a = PayoutAddress::parse("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").unwrap();
        assert_eq!(a.kind, AddressKind::P2pkh);
        assert_eq!(a.script.len(), 25);
        assert_eq!(a.script[0], 0x76);
        assert_eq!(a.script[24], 0xac);
    }

    #[test]
    fn parses_p2sh() {
        let a = PayoutAddress::parse("3P14159f73E4gFr7JterCCQh9QjiTjiZrG").unwrap();
        assert_eq!(a.kind, AddressKind::P2sh);
        assert!(a.is_script());
        assert_eq!(a.script.len(), 23);
        assert_eq!(a.script[0], 0xa9);
        assert_eq!(a.script[22], 0x87);
    }

    #[test]
    fn parses_bech32_v0() {
        let a = PayoutAddress::parse("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4").unwrap();
        assert_eq!(a.kind, AddressKind::WitnessV0Keyhash);
        assert!(a.is_segwit());
        assert_eq!(a.script.len(), 22);
        assert_eq!(a.script[0], 0x00);
        assert_eq!(a.script[1], 0x14);
    }

    #[test]
    fn parses_bech32m_v1() {
        let a = PayoutAddress::parse(
            "bc1p0xlxvlhemja6c4dqv22uapctqupfhlxm9h8z3k2e72q4k9hcz7vqzk5jj0",
        )
        .unwrap();
        assert_eq!(a.kind, AddressKind::WitnessV1Taproot);
        assert_eq!(a.script[0], 0x51);
        assert_eq!(a.script[1], 0x20);
    }

    #[test]
    fn rejects_garbage() {
        assert!(PayoutAddress::parse("").is_err());
        assert!(PayoutAddress::parse("not-an-address").is_err());
        assert!(PayoutAddress::parse("1A1zP1eP5QGefi2DMPTfTL5SLmv7Divfff").is_err());
    }
}

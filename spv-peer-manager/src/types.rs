//! Common type definitions for the SPV peer manager.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Height recorded for transactions that are not in any verified block.
pub const TX_UNCONFIRMED: u32 = u32::MAX;

/// Double SHA-256 of `data`.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Current unix time in seconds.
pub fn unix_time_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Wraps raw bytes in internal (little-endian) order.
            pub const fn from_byte_array(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// The all-zero hash.
            pub const fn all_zeros() -> Self {
                Self([0u8; 32])
            }

            /// Double SHA-256 of `data`.
            pub fn hash(data: &[u8]) -> Self {
                Self(sha256d(data))
            }

            pub fn to_byte_array(self) -> [u8; 32] {
                self.0
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Parses the byte-reversed hex form used for display.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(s, &mut bytes)?;
                bytes.reverse();
                Ok(Self(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut reversed = self.0;
                reversed.reverse();
                f.write_str(&hex::encode(reversed))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }
    };
}

hash_newtype! {
    /// Hash of an 80-byte block header.
    BlockHash
}

hash_newtype! {
    /// Transaction identifier (hash of the legacy serialization).
    Txid
}

hash_newtype! {
    /// Merkle root committed to by a block header.
    TxMerkleNode
}

/// Writes a Bitcoin compact-size integer.
pub(crate) fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// An 80-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_blockhash: BlockHash,
    pub merkle_root: TxMerkleNode,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Consensus serialization of the header.
    pub fn consensus_encode(&self) -> [u8; 80] {
        let mut out = [0u8; 80];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_blockhash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn block_hash(&self) -> BlockHash {
        BlockHash::hash(&self.consensus_encode())
    }
}

/// Reference to a transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Txid,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Txid, vout: u32) -> Self {
        Self {
            txid,
            vout,
        }
    }

    /// Serialized form used for bloom filter matching: txid followed by vout (little-endian).
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut bytes = [0u8; 36];
        bytes[0..32].copy_from_slice(self.txid.as_bytes());
        bytes[32..36].copy_from_slice(&self.vout.to_le_bytes());
        bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// A transaction in legacy (non-witness) form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub input: Vec<TxIn>,
    pub output: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.input.len() * 148 + self.output.len() * 34);
        out.extend_from_slice(&self.version.to_le_bytes());
        write_compact_size(&mut out, self.input.len() as u64);
        for input in &self.input {
            out.extend_from_slice(&input.previous_output.to_bytes());
            write_compact_size(&mut out, input.script_sig.len() as u64);
            out.extend_from_slice(&input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_compact_size(&mut out, self.output.len() as u64);
        for output in &self.output {
            out.extend_from_slice(&output.value.to_le_bytes());
            write_compact_size(&mut out, output.script_pubkey.len() as u64);
            out.extend_from_slice(&output.script_pubkey);
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out
    }

    pub fn txid(&self) -> Txid {
        Txid::hash(&self.consensus_encode())
    }

    /// A transaction counts as signed when it has inputs and every input carries a script_sig.
    pub fn is_signed(&self) -> bool {
        !self.input.is_empty() && self.input.iter().all(|i| !i.script_sig.is_empty())
    }
}

/// A block header plus a partial merkle tree, as relayed in response to a filtered getdata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub total_transactions: u32,
    pub hashes: Vec<Txid>,
    pub flags: Vec<u8>,
}

impl MerkleBlock {
    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }
}

/// Identifier of one peer session. Allocated monotonically by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Network endpoint of a peer. IPv4-mapped IPv6 addresses are stored in their IPv4 form so
/// the same endpoint learned through different channels maps to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(SocketAddr);

impl PeerAddress {
    pub fn new(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        };
        Self(SocketAddr::new(ip, addr.port()))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

bitflags! {
    /// Service bits advertised in `version` and `addr` messages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ServiceFlags: u64 {
        const NETWORK = 1 << 0;
        const GETUTXO = 1 << 1;
        const BLOOM = 1 << 2;
        const WITNESS = 1 << 3;
        const NETWORK_LIMITED = 1 << 10;
    }
}

impl ServiceFlags {
    /// Services a peer must offer to be useful as an outbound SPV peer.
    pub fn required() -> Self {
        ServiceFlags::NETWORK | ServiceFlags::BLOOM
    }
}

const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;

/// Returns every data push in `script`. Parsing stops at the first truncated push.
pub fn script_pushes(script: &[u8]) -> Vec<&[u8]> {
    let mut pushes = Vec::new();
    let mut i = 0usize;
    while i < script.len() {
        let op = script[i];
        i += 1;
        let len = match op {
            1..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let Some(&n) = script.get(i) else {
                    break;
                };
                i += 1;
                n as usize
            }
            OP_PUSHDATA2 => {
                let Some(b) = script.get(i..i + 2) else {
                    break;
                };
                i += 2;
                u16::from_le_bytes([b[0], b[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let Some(b) = script.get(i..i + 4) else {
                    break;
                };
                i += 4;
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
            _ => continue,
        };
        let Some(data) = script.get(i..i + len) else {
            break;
        };
        pushes.push(data);
        i += len;
    }
    pushes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_genesis_block_hash() {
        let header = BlockHeader {
            version: 1,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::from_hex(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            )
            .unwrap(),
            time: 1231006505,
            bits: 0x1d00ffff,
            nonce: 2083236893,
        };
        assert_eq!(
            header.block_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_hash_hex_is_byte_reversed() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        let hash = BlockHash::from_byte_array(bytes);
        let shown = hash.to_string();
        assert!(shown.ends_with("ab"));
        assert_eq!(BlockHash::from_hex(&shown).unwrap(), hash);
        assert!(BlockHash::from_hex("zz").is_err());
    }

    #[test]
    fn test_outpoint_bytes() {
        let outpoint = OutPoint::new(Txid::from_byte_array([7u8; 32]), 0x01020304);
        let bytes = outpoint.to_bytes();
        assert_eq!(&bytes[..32], &[7u8; 32]);
        assert_eq!(&bytes[32..], &[4, 3, 2, 1]);
    }

    #[test]
    fn test_is_signed() {
        let mut tx = Transaction {
            version: 1,
            input: vec![],
            output: vec![],
            lock_time: 0,
        };
        assert!(!tx.is_signed());
        tx.input.push(TxIn {
            previous_output: OutPoint::new(Txid::all_zeros(), 0),
            script_sig: vec![],
            sequence: u32::MAX,
        });
        assert!(!tx.is_signed());
        tx.input[0].script_sig = vec![0x01, 0x02];
        assert!(tx.is_signed());
    }

    #[test]
    fn test_transaction_encoding_layout() {
        let tx = Transaction {
            version: 2,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), 1),
                script_sig: vec![0xaa; 3],
                sequence: 0xffff_fffe,
            }],
            output: vec![TxOut {
                value: 5000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 7,
        };
        let bytes = tx.consensus_encode();
        // version + count + outpoint + len + script + sequence + count + value + len + script + locktime
        assert_eq!(bytes.len(), 4 + 1 + 36 + 1 + 3 + 4 + 1 + 8 + 1 + 1 + 4);
        assert_eq!(&bytes[..4], &[2, 0, 0, 0]);
        assert_eq!(&bytes[bytes.len() - 4..], &[7, 0, 0, 0]);
        assert_ne!(tx.txid(), Txid::all_zeros());
    }

    #[test]
    fn test_compact_size() {
        let mut out = Vec::new();
        write_compact_size(&mut out, 0xfc);
        assert_eq!(out, vec![0xfc]);
        out.clear();
        write_compact_size(&mut out, 0xfd);
        assert_eq!(out, vec![0xfd, 0xfd, 0x00]);
        out.clear();
        write_compact_size(&mut out, 0x10000);
        assert_eq!(out, vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_script_pushes() {
        // P2PKH: OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[0x11; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        let pushes = script_pushes(&script);
        assert_eq!(pushes, vec![&[0x11u8; 20][..]]);

        let script = [OP_PUSHDATA1, 2, 0xde, 0xad, 0x02, 0xbe, 0xef];
        assert_eq!(script_pushes(&script), vec![&[0xde, 0xad][..], &[0xbe, 0xef][..]]);

        // Truncated push is ignored.
        assert!(script_pushes(&[0x05, 0x01]).is_empty());
    }

    #[test]
    fn test_peer_address_normalizes_mapped_ipv4() {
        let mapped = SocketAddr::new(IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped()), 8333);
        let plain = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8333);
        assert_eq!(PeerAddress::new(mapped), PeerAddress::new(plain));

        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 18444);
        assert_eq!(PeerAddress::new(v6).socket_addr(), v6);
    }
}

//! Protocol messages understood by the SPV client. The byte-level encoding
//! belongs to the transport; this module only fixes the message set.

use crate::error::SyncError;
use crate::network::handshake::Version;
use crate::types::{BlockHash, MerkleBlock, Transaction};
use serde::{Deserialize, Serialize};

/// Kind of object referenced by an inventory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvType {
    Tx,
    Block,
    FilteredBlock,
}

/// Inventory vector: a typed object hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvVect {
    pub kind: InvType,
    pub hash: BlockHash,
}

impl InvVect {
    pub fn tx(hash: BlockHash) -> Self {
        Self { kind: InvType::Tx, hash }
    }

    pub fn block(hash: BlockHash) -> Self {
        Self { kind: InvType::Block, hash }
    }

    pub fn filtered_block(hash: BlockHash) -> Self {
        Self { kind: InvType::FilteredBlock, hash }
    }

    pub fn is_block(&self) -> bool {
        matches!(self.kind, InvType::Block | InvType::FilteredBlock)
    }
}

/// Load a bloom filter on the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterLoad {
    pub filter: Vec<u8>,
    pub bit_count: usize,
    pub hash_count: u32,
    pub tweak: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Version(Version),
    VerAck,
    Ping { height: u64 },
    Pong { height: u64 },
    Inventory(Vec<InvVect>),
    GetBlocks { locator: Vec<BlockHash>, stop: BlockHash },
    GetData(Vec<InvVect>),
    NotFound(Vec<InvVect>),
    MerkleBlock(MerkleBlock),
    Tx(Transaction),
    FilterLoad(FilterLoad),
}

impl Message {
    /// Wire command name
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Inventory(_) => "inv",
            Message::GetBlocks { .. } => "getblocks",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::MerkleBlock(_) => "merkleblock",
            Message::Tx(_) => "tx",
            Message::FilterLoad(_) => "filterload",
        }
    }

    /// Inbound kind, or `UnsupportedMessage` for messages peers may not send us
    pub fn kind(&self) -> Result<MessageKind, SyncError> {
        MessageKind::from_command(self.command())
    }
}

/// Message kinds accepted from peers once the handshake is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    Inventory,
    Tx,
    MerkleBlock,
    NotFound,
}

impl MessageKind {
    /// Resolve a wire command; anything outside the SPV message set is unsupported
    pub fn from_command(command: &str) -> Result<Self, SyncError> {
        match command {
            "ping" => Ok(MessageKind::Ping),
            "pong" => Ok(MessageKind::Pong),
            "inv" => Ok(MessageKind::Inventory),
            "tx" => Ok(MessageKind::Tx),
            "merkleblock" => Ok(MessageKind::MerkleBlock),
            "notfound" => Ok(MessageKind::NotFound),
            other => Err(SyncError::UnsupportedMessage(other.to_string())),
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Inventory => "inv",
            MessageKind::Tx => "tx",
            MessageKind::MerkleBlock => "merkleblock",
            MessageKind::NotFound => "notfound",
        }
    }
}

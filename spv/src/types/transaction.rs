use crate::types::hash::{Hash256, TxHash};
use serde::{Deserialize, Serialize};

/// Reference to an output of a previous transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: TxHash,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub signature: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    /// Program hash of the receiving address
    pub address: Vec<u8>,
}

/// A transaction matched by the bloom filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: 1,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    pub fn txid(&self) -> TxHash {
        Hash256::digest(&self.serialize())
    }

    /// Length-prefixed little-endian encoding used for the transaction hash
    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&self.version.to_le_bytes());

        buffer.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            buffer.extend_from_slice(input.previous_output.txid.as_bytes());
            buffer.extend_from_slice(&input.previous_output.index.to_le_bytes());
            write_bytes(&mut buffer, &input.signature);
            buffer.extend_from_slice(&input.sequence.to_le_bytes());
        }

        buffer.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            buffer.extend_from_slice(&output.value.to_le_bytes());
            write_bytes(&mut buffer, &output.address);
        }

        buffer.extend_from_slice(&self.lock_time.to_le_bytes());
        buffer
    }

    /// Addresses paid by this transaction
    pub fn output_addresses(&self) -> impl Iterator<Item = &[u8]> {
        self.outputs.iter().map(|output| output.address.as_slice())
    }
}

fn write_bytes(buffer: &mut Vec<u8>, bytes: &[u8]) {
    buffer.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buffer.extend_from_slice(bytes);
}

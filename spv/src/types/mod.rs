//! Chain data types exchanged with full nodes.

pub mod block;
pub mod hash;
pub mod merkle;
pub mod transaction;

pub use block::BlockHeader;
pub use hash::{BlockHash, Hash256, TxHash};
pub use merkle::{MerkleBlock, MerkleError};
pub use transaction::{OutPoint, Transaction, TxInput, TxOutput};

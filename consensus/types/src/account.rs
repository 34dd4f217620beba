use crate::{Hash256, U256};

/// Encoded length of an [`Account`]: nonce (8) + balance (32) + storage
/// root (32) + code hash (32).
pub const ACCOUNT_ENCODED_LEN: usize = 104;

/// World-state account as stored in state-trie leaves.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: Hash256,
    pub code_hash: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountDecodeError {
    WrongLength { expected: usize, got: usize },
}

impl std::fmt::Display for AccountDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountDecodeError::WrongLength { expected, got } => {
                write!(f, "account payload is {} bytes, expected {}", got, expected)
            }
        }
    }
}

impl Account {
    /// Fixed-width big-endian layout. The surrounding system's generic
    /// codec never sees trie leaves, so the layout lives here.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ACCOUNT_ENCODED_LEN);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        let mut balance = [0u8; 32];
        self.balance.to_big_endian(&mut balance);
        out.extend_from_slice(&balance);
        out.extend_from_slice(self.storage_root.as_bytes());
        out.extend_from_slice(self.code_hash.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AccountDecodeError> {
        if bytes.len() != ACCOUNT_ENCODED_LEN {
            return Err(AccountDecodeError::WrongLength {
                expected: ACCOUNT_ENCODED_LEN,
                got: bytes.len(),
            });
        }
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&bytes[0..8]);
        Ok(Account {
            nonce: u64::from_be_bytes(nonce),
            balance: U256::from_big_endian(&bytes[8..40]),
            storage_root: Hash256::from_slice(&bytes[40..72]),
            code_hash: Hash256::from_slice(&bytes[72..104]),
        })
    }
}

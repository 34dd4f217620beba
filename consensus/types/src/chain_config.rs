use crate::Hash256;
use serde_derive::{Deserialize, Serialize};

/// Trusted anchor embedded in the chain configuration. Sync never goes
/// below the latest enabled checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckPoint {
    pub height: u64,
    pub round: u64,
    pub hash: Hash256,
}

/// Returns the highest checkpoint, if any.
pub fn latest_check_point(check_points: &[CheckPoint]) -> Option<CheckPoint> {
    check_points.iter().max_by_key(|cp| cp.height).copied()
}

/// Chain-level parameters the sync layer consumes. Loading these from disk
/// or genesis is the host's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// Sibling adoption depth limit.
    pub greedy: u64,
    pub check_point_enable: bool,
    pub check_points: Vec<CheckPoint>,
    /// Height distance after which a block is considered confirmed.
    pub confirm_height_distance: u64,
    /// Height distance for stake registrations to take effect.
    pub stake_register_height_distance: u64,
    /// Maximum height delay for a tx package relative to its related block.
    pub max_package_height_delay: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            chain_id: 1,
            greedy: 4,
            check_point_enable: false,
            check_points: Vec::new(),
            confirm_height_distance: 36,
            stake_register_height_distance: 128,
            max_package_height_delay: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_check_point_picks_highest() {
        let cps = vec![
            CheckPoint {
                height: 10,
                round: 100,
                hash: Hash256::repeat_byte(1),
            },
            CheckPoint {
                height: 30,
                round: 300,
                hash: Hash256::repeat_byte(3),
            },
            CheckPoint {
                height: 20,
                round: 200,
                hash: Hash256::repeat_byte(2),
            },
        ];
        assert_eq!(latest_check_point(&cps).unwrap().height, 30);
        assert!(latest_check_point(&[]).is_none());
    }
}

use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolStrategy {
    /// Highest-priority healthy pool; falls back down the list and returns
    /// once the better pool recovers.
    #[default]
    Failover,
    /// Next eligible pool on every fetch.
    RoundRobin,
    /// Stay on one pool for `rotate_period` fetches, then move on.
    Rotate,
    /// Spread fetches in proportion to each pool's responsiveness weight.
    LoadBalance,
}

impl PoolStrategy {
    pub const ALL: [PoolStrategy; 4] = [
        PoolStrategy::Failover,
        PoolStrategy::RoundRobin,
        PoolStrategy::Rotate,
        PoolStrategy::LoadBalance,
    ];
}

impl std::fmt::Display for PoolStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolStrategy::Failover => write!(f, "Failover"),
            PoolStrategy::RoundRobin => write!(f, "Round Robin"),
            PoolStrategy::Rotate => write!(f, "Rotate"),
            PoolStrategy::LoadBalance => write!(f, "Load Balance"),
        }
    }
}

impl FromStr for PoolStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match norm.as_str() {
            "failover" => Ok(PoolStrategy::Failover),
            "roundrobin" => Ok(PoolStrategy::RoundRobin),
            "rotate" => Ok(PoolStrategy::Rotate),
            "loadbalance" => Ok(PoolStrategy::LoadBalance),
            _ => Err(format!("unknown pool strategy '{s}'")),
        }
    }
}

use serde::{Deserialize, Serialize};

/// 100% expressed in basis points
pub const FULL_ALLOCATION_BPS: u32 = 10_000;

/// Protocol name identifying a yield venue
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FarmId(String);

impl FarmId {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self(protocol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FarmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for FarmId {
    fn from(protocol: &str) -> Self {
        Self::new(protocol)
    }
}

/// A yield-bearing venue holding a share of managed capital
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Farm {
    pub id: FarmId,
    /// APY in hundredths of a percent
    pub apy_bps: u32,
    /// Share of managed capital, 0..=10_000
    pub allocation_bps: u32,
    pub active: bool,
}

impl Farm {
    pub fn new(id: impl Into<FarmId>, apy_bps: u32, allocation_bps: u32) -> Self {
        Self {
            id: id.into(),
            apy_bps,
            allocation_bps,
            active: true,
        }
    }

    /// apy × share, the numerator of this farm's blended APY contribution
    pub fn weighted_apy(&self) -> u64 {
        u64::from(self.apy_bps) * u64::from(self.allocation_bps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_apy_does_not_overflow_u32() {
        let farm = Farm::new("Curve", u32::MAX, FULL_ALLOCATION_BPS);
        assert_eq!(farm.weighted_apy(), u64::from(u32::MAX) * 10_000);
    }

    #[test]
    fn farm_id_serializes_as_plain_string() {
        let id = FarmId::new("Aave");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"Aave\"");
    }
}

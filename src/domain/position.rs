use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of a tokenized yield position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Yield,
    Principal,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Yield => write!(f, "yield"),
            TokenKind::Principal => write!(f, "principal"),
        }
    }
}

/// Identifies one holder's balance of one token kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub holder: String,
    pub kind: TokenKind,
}

impl PositionKey {
    pub fn new(holder: impl Into<String>, kind: TokenKind) -> Self {
        Self {
            holder: holder.into(),
            kind,
        }
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.holder, self.kind)
    }
}

/// Balance of a tokenized position plus the amount reserved by in-flight requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YieldPosition {
    pub key: PositionKey,
    pub balance: Decimal,
    /// Sum of amounts reserved by unconfirmed mint/burn requests
    pub pending: Decimal,
    /// Balance not confirmed by a fresh read, or a mint/burn outcome still unknown
    #[serde(default)]
    pub stale: bool,
}

impl YieldPosition {
    pub fn new(key: PositionKey, balance: Decimal) -> Self {
        Self {
            key,
            balance,
            pending: Decimal::ZERO,
            stale: false,
        }
    }

    /// Balance not reserved by an in-flight request
    pub fn available(&self) -> Decimal {
        self.balance - self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn available_excludes_pending() {
        let mut position = YieldPosition::new(PositionKey::new("0xabc", TokenKind::Yield), dec!(100));
        position.pending = dec!(40);
        assert_eq!(position.available(), dec!(60));
    }
}

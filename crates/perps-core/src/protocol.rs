//! Tracked perpetuals venues and what data each one can provide.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PerpsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Drift,
    JupiterPerps,
    #[serde(rename = "flashtrade")]
    FlashTrade,
    Adrena,
}

/// Kinds of data a protocol can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    /// 24h/7d volume and rank from the protocol-volume API
    Volume,
    /// Signature counts from the Solana RPC, needs a program id
    Ledger,
    /// Unique trader counts from the analytics-query service
    Traders,
    /// Liquidation counts from the analytics-query service
    Liquidations,
    /// Membership in the cross-protocol wallet overlap query
    WalletOverlap,
    /// Per-market breakdown (funding, OI, trade counts)
    Markets,
}

const DRIFT_CAPABILITIES: &[DataCategory] = &[
    DataCategory::Volume,
    DataCategory::Ledger,
    DataCategory::Traders,
    DataCategory::Liquidations,
    DataCategory::WalletOverlap,
    DataCategory::Markets,
];

const JUPITER_CAPABILITIES: &[DataCategory] = &[
    DataCategory::Volume,
    DataCategory::Ledger,
    DataCategory::Traders,
    DataCategory::WalletOverlap,
    DataCategory::Markets,
];

// No program ids configured, so nothing ledger-derived.
const VOLUME_AND_TRADERS_ONLY: &[DataCategory] = &[DataCategory::Volume, DataCategory::Traders];

impl Protocol {
    pub const ALL: [Protocol; 4] = [
        Protocol::Drift,
        Protocol::JupiterPerps,
        Protocol::FlashTrade,
        Protocol::Adrena,
    ];

    /// Stable identifier used in config keys and the cache artifact
    pub fn slug(&self) -> &'static str {
        match self {
            Protocol::Drift => "drift",
            Protocol::JupiterPerps => "jupiter_perps",
            Protocol::FlashTrade => "flashtrade",
            Protocol::Adrena => "adrena",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Protocol::Drift => "Drift",
            Protocol::JupiterPerps => "Jupiter Perps",
            Protocol::FlashTrade => "FlashTrade",
            Protocol::Adrena => "Adrena",
        }
    }

    /// Name of the protocol in the DeFiLlama derivatives overview
    pub fn defillama_name(&self) -> &'static str {
        match self {
            Protocol::Drift => "Drift Trade",
            Protocol::JupiterPerps => "Jupiter Perpetual Exchange",
            Protocol::FlashTrade => "FlashTrade",
            Protocol::Adrena => "Adrena Protocol",
        }
    }

    pub fn program_id(&self) -> Option<&'static str> {
        match self {
            Protocol::Drift => Some("dRiftyHA39MWEi3m9aunc5MzRF1JYuBsbn6VPcn33UH"),
            Protocol::JupiterPerps => Some("PERPHjGBqRHArX4DySjwM6UJHiR3sWAatqfdBS2qQJu"),
            Protocol::FlashTrade | Protocol::Adrena => None,
        }
    }

    /// Taker fee rate used to estimate fees from volume.
    /// FlashTrade and Adrena are estimates.
    pub fn fee_rate(&self) -> Decimal {
        match self {
            Protocol::Drift => dec!(0.0005),
            Protocol::JupiterPerps => dec!(0.0006),
            Protocol::FlashTrade => dec!(0.0005),
            Protocol::Adrena => dec!(0.0005),
        }
    }

    pub fn capabilities(&self) -> &'static [DataCategory] {
        match self {
            Protocol::Drift => DRIFT_CAPABILITIES,
            Protocol::JupiterPerps => JUPITER_CAPABILITIES,
            Protocol::FlashTrade | Protocol::Adrena => VOLUME_AND_TRADERS_ONLY,
        }
    }

    pub fn supports(&self, category: DataCategory) -> bool {
        self.capabilities().contains(&category)
    }

    pub fn from_defillama_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.defillama_name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Protocol {
    type Err = PerpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drift" => Ok(Protocol::Drift),
            "jupiter" | "jupiter_perps" | "jupiter-perps" | "jup" => Ok(Protocol::JupiterPerps),
            "flashtrade" | "flash" | "flash_trade" => Ok(Protocol::FlashTrade),
            "adrena" => Ok(Protocol::Adrena),
            _ => Err(PerpsError::UnknownProtocol(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_capability_follows_program_id() {
        for protocol in Protocol::ALL {
            assert_eq!(
                protocol.supports(DataCategory::Ledger),
                protocol.program_id().is_some(),
                "{} ledger capability out of sync with program id",
                protocol
            );
        }
    }

    #[test]
    fn test_every_protocol_has_volume_and_traders() {
        for protocol in Protocol::ALL {
            assert!(protocol.supports(DataCategory::Volume));
            assert!(protocol.supports(DataCategory::Traders));
        }
        assert!(!Protocol::FlashTrade.supports(DataCategory::Markets));
    }

    #[test]
    fn test_parse_and_defillama_lookup() {
        assert_eq!("jupiter".parse::<Protocol>().unwrap(), Protocol::JupiterPerps);
        assert_eq!("FlashTrade".parse::<Protocol>().unwrap(), Protocol::FlashTrade);
        assert!("gmx".parse::<Protocol>().is_err());
        assert_eq!(Protocol::from_defillama_name("drift trade"), Some(Protocol::Drift));
        assert_eq!(Protocol::from_defillama_name("Hyperliquid"), None);
    }

    #[test]
    fn test_slug_round_trips_through_serde() {
        for protocol in Protocol::ALL {
            let json = serde_json::to_string(&protocol).unwrap();
            assert_eq!(json, format!("\"{}\"", protocol.slug()));
        }
    }
}

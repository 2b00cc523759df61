//! Tier catalog: the single source of per-tier limits.

use crate::models::{Limit, Tier, TierDefinition};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to load tier catalog: {0}")]
    Load(#[from] config::ConfigError),
}

/// Limits section for one tier in a catalog file.
#[derive(Debug, Clone, Deserialize)]
struct TierLimits {
    requests_per_minute: u64,
    characters_per_month: Limit,
    voice_clones: Limit,
}

/// Immutable mapping from tier to limits, loaded once at process start.
#[derive(Debug, Clone)]
pub struct TierCatalog {
    tiers: HashMap<Tier, TierDefinition>,
}

impl Default for TierCatalog {
    fn default() -> Self {
        Self::new([
            TierDefinition {
                tier_id: Tier::Free,
                requests_per_minute: 2,
                characters_per_month: Limit::Capped(6_000),
                voice_clones: Limit::Capped(0),
            },
            TierDefinition {
                tier_id: Tier::Pro,
                requests_per_minute: 10,
                characters_per_month: Limit::Capped(100_000),
                voice_clones: Limit::Capped(3),
            },
            TierDefinition {
                tier_id: Tier::Premium,
                requests_per_minute: 30,
                characters_per_month: Limit::Capped(500_000),
                voice_clones: Limit::Capped(10),
            },
        ])
    }
}

impl TierCatalog {
    /// Build a catalog from explicit definitions.
    ///
    /// Tiers without a definition resolve to the free definition, or to an
    /// all-zero one when free itself is absent.
    pub fn new(definitions: impl IntoIterator<Item = TierDefinition>) -> Self {
        let mut tiers: HashMap<Tier, TierDefinition> = definitions
            .into_iter()
            .map(|def| (def.tier_id, def))
            .collect();

        let free = tiers
            .get(&Tier::Free)
            .copied()
            .unwrap_or_else(|| closed(Tier::Free));

        for tier in Tier::ALL {
            tiers.entry(tier).or_insert(TierDefinition {
                tier_id: tier,
                ..free
            });
        }

        Self { tiers }
    }

    /// Load a catalog file (TOML, YAML or JSON) keyed by tier name.
    ///
    /// ```toml
    /// [pro]
    /// requests_per_minute = 10
    /// characters_per_month = 100000
    /// voice_clones = 3
    ///
    /// [premium]
    /// requests_per_minute = 30
    /// characters_per_month = "unlimited"
    /// voice_clones = "unlimited"
    /// ```
    pub fn from_file(path: &str) -> Result<Self, CatalogError> {
        let raw: HashMap<String, TierLimits> = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?
            .try_deserialize()?;

        let mut definitions = Vec::with_capacity(raw.len());
        for (name, limits) in raw {
            let Some(tier) = Tier::ALL.into_iter().find(|t| t.as_str() == name) else {
                tracing::warn!(tier = %name, path = %path, "Ignoring unknown tier in catalog");
                continue;
            };
            definitions.push(TierDefinition {
                tier_id: tier,
                requests_per_minute: limits.requests_per_minute,
                characters_per_month: limits.characters_per_month,
                voice_clones: limits.voice_clones,
            });
        }

        tracing::info!(path = %path, tiers = definitions.len(), "Tier catalog loaded");
        Ok(Self::new(definitions))
    }

    /// Limits for a tier. Never fails.
    pub fn limits_for(&self, tier: Tier) -> TierDefinition {
        self.tiers.get(&tier).copied().unwrap_or_else(|| closed(tier))
    }

    /// Limits for a tier name; unknown names get the free tier's limits.
    pub fn limits_for_name(&self, tier_id: &str) -> TierDefinition {
        self.limits_for(Tier::from_string(tier_id))
    }
}

/// A tier that admits nothing.
fn closed(tier: Tier) -> TierDefinition {
    TierDefinition {
        tier_id: tier,
        requests_per_minute: 0,
        characters_per_month: Limit::Capped(0),
        voice_clones: Limit::Capped(0),
    }
}

//! Subscription tiers and their limits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Subscription tier assigned by the billing collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Premium,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Pro, Tier::Premium];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Premium => "premium",
        }
    }

    /// Parse a tier name. Unknown names resolve to `Free`.
    pub fn from_string(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pro" => Tier::Pro,
            "premium" => Tier::Premium,
            _ => Tier::Free,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A usage ceiling. `Unlimited` authorizes any amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LimitRepr", into = "LimitRepr")]
pub enum Limit {
    Capped(u64),
    Unlimited,
}

impl Limit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Limit::Unlimited)
    }

    /// The ceiling as a number, `None` when unlimited.
    pub fn ceiling(&self) -> Option<u64> {
        match self {
            Limit::Capped(n) => Some(*n),
            Limit::Unlimited => None,
        }
    }

    /// Whether `current + requested` stays within the limit.
    pub fn admits(&self, current: u64, requested: u64) -> bool {
        match self {
            Limit::Capped(n) => current
                .checked_add(requested)
                .is_some_and(|total| total <= *n),
            Limit::Unlimited => true,
        }
    }

    pub fn remaining(&self, current: u64) -> Option<u64> {
        self.ceiling().map(|n| n.saturating_sub(current))
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Capped(n) => write!(f, "{}", n),
            Limit::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// Wire form: a non-negative integer or the word `"unlimited"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum LimitRepr {
    Count(u64),
    Word(String),
}

impl TryFrom<LimitRepr> for Limit {
    type Error = String;

    fn try_from(repr: LimitRepr) -> Result<Self, Self::Error> {
        match repr {
            LimitRepr::Count(n) => Ok(Limit::Capped(n)),
            LimitRepr::Word(w) if w.eq_ignore_ascii_case("unlimited") => Ok(Limit::Unlimited),
            LimitRepr::Word(w) => w
                .trim()
                .parse::<u64>()
                .map(Limit::Capped)
                .map_err(|_| format!("invalid limit '{}': expected a count or \"unlimited\"", w)),
        }
    }
}

impl From<Limit> for LimitRepr {
    fn from(limit: Limit) -> Self {
        match limit {
            Limit::Capped(n) => LimitRepr::Count(n),
            Limit::Unlimited => LimitRepr::Word("unlimited".to_string()),
        }
    }
}

/// Limits that apply to every user on a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierDefinition {
    pub tier_id: Tier,
    pub requests_per_minute: u64,
    pub characters_per_month: Limit,
    pub voice_clones: Limit,
}

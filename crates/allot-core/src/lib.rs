//! Core domain model for IPO allotment resolution.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "allot-core";

/// Per-ID resolution state. `InFlight` is stored like every other status so
/// concurrent readers observe a resolution already in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllotmentStatus {
    Allotted,
    NotAllotted,
    NotApplied,
    Unknown,
    Error,
    InFlight,
}

impl AllotmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allotted => "allotted",
            Self::NotAllotted => "not_allotted",
            Self::NotApplied => "not_applied",
            Self::Unknown => "unknown",
            Self::Error => "error",
            Self::InFlight => "in_flight",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allotted" => Some(Self::Allotted),
            "not_allotted" => Some(Self::NotAllotted),
            "not_applied" => Some(Self::NotApplied),
            "unknown" => Some(Self::Unknown),
            "error" => Some(Self::Error),
            "in_flight" => Some(Self::InFlight),
            _ => None,
        }
    }

    /// Everything except the in-flight marker. `Unknown` and `Error` count as
    /// terminal-but-inconclusive.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InFlight)
    }

    /// Freshness window after which a stored row must be re-resolved.
    /// Final outcomes keep for a day; inconclusive states retry sooner; an
    /// in-flight row older than a minute is treated as abandoned.
    pub fn ttl(&self) -> Duration {
        match self {
            Self::Allotted | Self::NotAllotted | Self::NotApplied => Duration::hours(24),
            Self::Unknown => Duration::minutes(45),
            Self::Error => Duration::minutes(15),
            Self::InFlight => Duration::seconds(60),
        }
    }
}

impl std::fmt::Display for AllotmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest known outcome for one (ipo, tax-ID) pair. At most one row exists
/// per pair; the store's uniqueness constraint is the backstop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllotmentResult {
    pub ipo_id: Uuid,
    pub tax_id: String,
    pub status: AllotmentStatus,
    pub units: i64,
    pub message: String,
    pub last_checked: DateTime<Utc>,
}

impl AllotmentResult {
    /// True when the row can no longer be trusted and must be re-resolved.
    pub fn needs_work(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_checked) > self.status.ttl()
    }
}

/// Tax IDs are stored uppercased and trimmed; every write path and request
/// entry point goes through this.
pub fn normalize_tax_id(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// One scrape task per (ipo, tax-ID). The job is the only carrier of the
/// ipo binding: the scrape capability knows nothing about internal IDs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub ipo_id: Uuid,
    pub tax_id: String,
    pub company_name: String,
    pub registrar_hint: Option<String>,
    pub client_ref: Option<String>,
}

impl ScrapeJob {
    pub fn for_ipo(ipo: &IpoRecord, tax_id: &str, client_ref: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ipo_id: ipo.ipo_id,
            tax_id: normalize_tax_id(tax_id),
            company_name: ipo.company_name.clone(),
            registrar_hint: Some(ipo.registrar_name.clone()),
            client_ref: client_ref.map(str::to_string),
        }
    }
}

/// Read-only IPO metadata supplied by the surrounding system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpoRecord {
    pub ipo_id: Uuid,
    pub company_name: String,
    pub registrar_name: String,
    pub listing_date: NaiveDate,
    pub allotment_out: bool,
}

pub mod matcher {
    //! Fuzzy company-name matching used to bridge inconsistent naming across
    //! registrar sources. Deterministic and side-effect-free.

    use std::collections::BTreeSet;

    /// Accept threshold for loose registrar-name routing.
    pub const LOOSE_MATCH_THRESHOLD: f64 = 0.3;
    /// Accept threshold for automatic company linking.
    pub const STRICT_MATCH_THRESHOLD: f64 = 0.6;

    /// Corporate-suffix tokens that carry no distinguishing signal.
    const STOP_TOKENS: [&str; 5] = ["limited", "ltd", "private", "pvt", "india"];

    fn token_set(input: &str) -> BTreeSet<String> {
        input
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .filter(|t| !STOP_TOKENS.contains(t))
            .map(str::to_string)
            .collect()
    }

    fn squash(input: &str) -> String {
        input
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect()
    }

    /// Jaccard similarity over cleaned token sets, in [0, 1]. Returns 0.0
    /// when either side has no tokens left after cleaning.
    pub fn similarity(a: &str, b: &str) -> f64 {
        let ta = token_set(a);
        let tb = token_set(b);
        if ta.is_empty() || tb.is_empty() {
            return 0.0;
        }
        let intersection = ta.intersection(&tb).count();
        let union = ta.union(&tb).count();
        intersection as f64 / union as f64
    }

    /// High-confidence short-circuit: exact containment of the
    /// alphanumeric-only lowercase forms. Far more reliable than token
    /// overlap for abbreviated names.
    pub fn is_substring_match(a: &str, b: &str) -> bool {
        let na = squash(a);
        let nb = squash(b);
        if na.is_empty() || nb.is_empty() {
            return false;
        }
        na.contains(&nb) || nb.contains(&na)
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Match<'a> {
        pub candidate: &'a str,
        pub index: usize,
        pub score: f64,
    }

    /// Selection policy for matching one name against candidates: a
    /// substring match wins outright (scored 1.0); otherwise the
    /// highest-scoring candidate at or above `threshold`; below that,
    /// no match is better than a weak guess.
    pub fn best_match<'a, I>(target: &str, candidates: I, threshold: f64) -> Option<Match<'a>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut best: Option<Match<'a>> = None;
        for (index, candidate) in candidates.into_iter().enumerate() {
            if is_substring_match(target, candidate) {
                return Some(Match {
                    candidate,
                    index,
                    score: 1.0,
                });
            }
            let score = similarity(target, candidate);
            if score >= threshold && best.as_ref().map(|m| score > m.score).unwrap_or(true) {
                best = Some(Match {
                    candidate,
                    index,
                    score,
                });
            }
        }
        best
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Final classification bucket for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Valid,
    ProbablyValid,
    ProbablyInvalid,
    Invalid,
    Skipped,
}

impl Verdict {
    pub const ALL: [Verdict; 5] = [
        Verdict::Valid,
        Verdict::ProbablyValid,
        Verdict::ProbablyInvalid,
        Verdict::Invalid,
        Verdict::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Valid => "VALID",
            Verdict::ProbablyValid => "PROBABLY_VALID",
            Verdict::ProbablyInvalid => "PROBABLY_INVALID",
            Verdict::Invalid => "INVALID",
            Verdict::Skipped => "SKIPPED",
        }
    }

    /// Stem used for bucket file names (`valid.txt`, `probably_valid.txt`, ...)
    pub fn file_stem(&self) -> &'static str {
        match self {
            Verdict::Valid => "valid",
            Verdict::ProbablyValid => "probably_valid",
            Verdict::ProbablyInvalid => "probably_invalid",
            Verdict::Invalid => "invalid",
            Verdict::Skipped => "skipped",
        }
    }

    /// Rank of a live verdict, higher is better. `Skipped` has no rank.
    fn rank(&self) -> Option<u8> {
        match self {
            Verdict::Valid => Some(3),
            Verdict::ProbablyValid => Some(2),
            Verdict::ProbablyInvalid => Some(1),
            Verdict::Invalid => Some(0),
            Verdict::Skipped => None,
        }
    }

    /// The more conservative of two live verdicts.
    pub fn min_live(self, other: Verdict) -> Verdict {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) if b < a => other,
            (Some(_), Some(_)) => self,
            _ => Verdict::Skipped,
        }
    }

    pub fn is_live(&self) -> bool {
        self.rank().is_some()
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Syntax,
    Reputation,
    Dns,
    Smtp,
    Geo,
    Score,
}

impl Stage {
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Syntax => Some(Stage::Reputation),
            Stage::Reputation => Some(Stage::Dns),
            Stage::Dns => Some(Stage::Smtp),
            Stage::Smtp => Some(Stage::Geo),
            Stage::Geo => Some(Stage::Score),
            Stage::Score => None,
        }
    }
}

pub const UNKNOWN_COUNTRY: &str = "Unknown";

/// One email address moving through the pipeline.
///
/// The secret is carried verbatim from the input line and never inspected.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub address: String,
    pub secret: String,
    pub source: String,
    pub stage: Stage,
    pub diagnostics: Vec<String>,
    pub verdict: Option<Verdict>,
    pub score: u8,
    pub country: String,
}

impl Record {
    pub fn new(address: &str, secret: &str, source: &str) -> Self {
        Self {
            address: address.trim().to_string(),
            secret: secret.to_string(),
            source: source.to_string(),
            stage: Stage::Syntax,
            diagnostics: Vec::new(),
            verdict: None,
            score: 0,
            country: UNKNOWN_COUNTRY.to_string(),
        }
    }

    /// Lowercased address used for dedup and checkpoint identity.
    pub fn normalized(&self) -> String {
        normalize_address(&self.address)
    }

    pub fn domain(&self) -> Option<String> {
        crate::domain_utils::DomainUtils::extract_domain(&self.address)
    }

    pub fn note(&mut self, message: impl Into<String>) {
        self.diagnostics.push(message.into());
    }

    /// Move to the next stage. Stages only ever move forward.
    pub fn enter(&mut self, stage: Stage) {
        debug_assert!(stage >= self.stage, "stage regression {:?} -> {:?}", self.stage, stage);
        if stage > self.stage {
            self.stage = stage;
        }
    }

    /// Seal the record with its verdict. Later calls are ignored.
    pub fn finalize(&mut self, verdict: Verdict, score: u8) {
        if self.verdict.is_some() {
            return;
        }
        self.stage = Stage::Score;
        self.verdict = Some(verdict);
        self.score = score;
    }
}

pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_live_prefers_conservative() {
        assert_eq!(Verdict::Valid.min_live(Verdict::Invalid), Verdict::Invalid);
        assert_eq!(
            Verdict::ProbablyInvalid.min_live(Verdict::ProbablyValid),
            Verdict::ProbablyInvalid
        );
        assert_eq!(Verdict::Valid.min_live(Verdict::Valid), Verdict::Valid);
    }

    #[test]
    fn test_stage_order() {
        let mut stage = Stage::Syntax;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            stage = next;
            seen.push(stage);
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(stage, Stage::Score);
    }

    #[test]
    fn test_finalize_is_sticky() {
        let mut record = Record::new("a@x.com", "p1", "list");
        record.finalize(Verdict::Skipped, 0);
        record.finalize(Verdict::Valid, 100);
        assert_eq!(record.verdict, Some(Verdict::Skipped));
        assert_eq!(record.stage, Stage::Score);
    }

    #[test]
    fn test_normalized_address() {
        let record = Record::new("  A@X.Com ", "secret", "list");
        assert_eq!(record.normalized(), "a@x.com");
        assert_eq!(record.domain(), Some("x.com".to_string()));
    }

    #[test]
    fn test_verdict_serializes_upper_snake() {
        let json = serde_json::to_string(&Verdict::ProbablyValid).unwrap();
        assert_eq!(json, "\"PROBABLY_VALID\"");
    }
}

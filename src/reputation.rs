use crate::config::DomainsConfig;
use crate::domain_utils::DomainUtils;
use regex::Regex;
use std::collections::HashSet;

/// Coarse class the scoring stage cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainClass {
    Disposable,
    Reputable,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainReputation {
    Disposable, // Throwaway inbox providers
    Trusted,    // Major mailbox providers
    Educational,
    Government,
    Business, // Common commercial suffixes
    Unknown,
}

impl DomainReputation {
    pub fn class(&self) -> DomainClass {
        match self {
            DomainReputation::Disposable => DomainClass::Disposable,
            DomainReputation::Trusted
            | DomainReputation::Educational
            | DomainReputation::Government => DomainClass::Reputable,
            DomainReputation::Business | DomainReputation::Unknown => DomainClass::Neutral,
        }
    }

    /// Points contributed to the quality score.
    pub fn bonus(&self) -> u8 {
        match self {
            DomainReputation::Trusted
            | DomainReputation::Educational
            | DomainReputation::Government => 10,
            DomainReputation::Business => 5,
            DomainReputation::Disposable | DomainReputation::Unknown => 0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DomainReputation::Disposable => "disposable",
            DomainReputation::Trusted => "major provider",
            DomainReputation::Educational => "educational",
            DomainReputation::Government => "government",
            DomainReputation::Business => "business",
            DomainReputation::Unknown => "unclassified",
        }
    }
}

/// Offline domain classifier. Never touches the network.
#[derive(Debug, Clone)]
pub struct DomainClassifier {
    disposable_domains: Vec<String>,
    disposable_patterns: Vec<Regex>,
    major_providers: HashSet<String>,
    educational_suffixes: Vec<String>,
    government_suffixes: Vec<String>,
    business_suffixes: Vec<String>,
}

impl DomainClassifier {
    pub fn new(config: &DomainsConfig) -> anyhow::Result<Self> {
        let disposable_patterns = config
            .disposable_patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            disposable_domains: config
                .disposable_domains
                .iter()
                .map(|d| d.to_lowercase())
                .collect(),
            disposable_patterns,
            major_providers: config
                .major_providers
                .iter()
                .map(|d| d.to_lowercase())
                .collect(),
            educational_suffixes: config.educational_suffixes.clone(),
            government_suffixes: config.government_suffixes.clone(),
            business_suffixes: config.business_suffixes.clone(),
        })
    }

    /// Classify the domain of an email address
    pub fn classify_address(&self, email: &str) -> DomainReputation {
        match DomainUtils::extract_domain(email) {
            Some(domain) => self.classify_domain(&domain),
            None => DomainReputation::Unknown,
        }
    }

    pub fn classify_domain(&self, domain: &str) -> DomainReputation {
        let domain_lower = domain.to_lowercase();

        // Disposable wins over every other signal
        if self.is_disposable(&domain_lower) {
            return DomainReputation::Disposable;
        }

        if self.major_providers.contains(&domain_lower) {
            return DomainReputation::Trusted;
        }

        if DomainUtils::matches_suffix(&domain_lower, &self.government_suffixes) {
            return DomainReputation::Government;
        }

        if DomainUtils::matches_suffix(&domain_lower, &self.educational_suffixes) {
            return DomainReputation::Educational;
        }

        if DomainUtils::matches_suffix(&domain_lower, &self.business_suffixes) {
            return DomainReputation::Business;
        }

        DomainReputation::Unknown
    }

    fn is_disposable(&self, domain: &str) -> bool {
        DomainUtils::matches_domain_list(domain, &self.disposable_domains)
            || self.disposable_patterns.iter().any(|re| re.is_match(domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> DomainClassifier {
        DomainClassifier::new(&DomainsConfig::default()).unwrap()
    }

    #[test]
    fn test_disposable_by_list_and_pattern() {
        let c = classifier();
        assert_eq!(c.classify_domain("mailinator.com"), DomainReputation::Disposable);
        assert_eq!(c.classify_domain("eu.mailinator.com"), DomainReputation::Disposable);
        assert_eq!(c.classify_domain("TempMail.net"), DomainReputation::Disposable);
        assert_eq!(c.classify_domain("20minutemail.io"), DomainReputation::Disposable);
        assert_eq!(c.classify_address("x@yopmail.com").class(), DomainClass::Disposable);
    }

    #[test]
    fn test_reputable_classes() {
        let c = classifier();
        assert_eq!(c.classify_domain("gmail.com"), DomainReputation::Trusted);
        assert_eq!(c.classify_domain("mit.edu"), DomainReputation::Educational);
        assert_eq!(c.classify_domain("ox.ac.uk"), DomainReputation::Educational);
        assert_eq!(c.classify_domain("hmrc.gov.uk"), DomainReputation::Government);
        assert_eq!(c.classify_domain("mit.edu").class(), DomainClass::Reputable);
    }

    #[test]
    fn test_neutral_classes() {
        let c = classifier();
        assert_eq!(c.classify_domain("acme.com"), DomainReputation::Business);
        assert_eq!(c.classify_domain("acme.com").class(), DomainClass::Neutral);
        assert_eq!(c.classify_domain("acme.xyz"), DomainReputation::Unknown);
        assert_eq!(c.classify_address("no-at-sign"), DomainReputation::Unknown);
    }

    #[test]
    fn test_bonus_ordering() {
        assert!(DomainReputation::Trusted.bonus() > DomainReputation::Business.bonus());
        assert_eq!(DomainReputation::Unknown.bonus(), 0);
    }
}

/// Minimal domain helpers shared by the reputation and lookup stages
pub struct DomainUtils;

impl DomainUtils {
    /// Extract the lowercased domain from an email address
    pub fn extract_domain(email: &str) -> Option<String> {
        let at_pos = email.rfind('@')?;
        if at_pos == 0 {
            return None;
        }
        let domain = email[at_pos + 1..].trim().trim_end_matches('.');
        if domain.is_empty() {
            return None;
        }
        Some(domain.to_lowercase())
    }

    /// Check if domain matches any in list (with hierarchy support)
    pub fn matches_domain_list(domain: &str, domain_list: &[String]) -> bool {
        let domain_lower = domain.to_lowercase();

        domain_list.iter().any(|pattern| {
            let pattern_lower = pattern.to_lowercase();
            domain_lower == pattern_lower || domain_lower.ends_with(&format!(".{}", pattern_lower))
        })
    }

    /// Check if the domain ends with one of the given label suffixes.
    ///
    /// Suffixes are written with their leading dot (`.edu`, `.ac.uk`). A suffix
    /// ending in a dot (`.ac.`) matches anywhere in the label sequence.
    pub fn matches_suffix(domain: &str, suffixes: &[String]) -> bool {
        let domain_lower = format!(".{}", domain.to_lowercase());

        suffixes.iter().any(|suffix| {
            let suffix_lower = suffix.to_lowercase();
            if suffix_lower.ends_with('.') {
                domain_lower.contains(&suffix_lower)
            } else {
                domain_lower.ends_with(&suffix_lower)
            }
        })
    }
}

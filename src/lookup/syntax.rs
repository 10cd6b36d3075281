use super::SyntaxChecker;
use regex::Regex;

const MAX_ADDRESS_LEN: usize = 254;
const MAX_LOCAL_LEN: usize = 64;

/// Pragmatic address grammar: dot-atom local part, hostname domain with an
/// alphabetic TLD. Quoted local parts and address literals are rejected.
pub struct RegexSyntaxChecker {
    local: Regex,
    domain: Regex,
}

impl RegexSyntaxChecker {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            local: Regex::new(r"^[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+(\.[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+)*$")?,
            domain: Regex::new(
                r"^([A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,63}$",
            )?,
        })
    }
}

impl SyntaxChecker for RegexSyntaxChecker {
    fn check_syntax(&self, address: &str) -> bool {
        if address.len() > MAX_ADDRESS_LEN {
            return false;
        }
        let Some((local, domain)) = address.split_once('@') else {
            return false;
        };
        if local.len() > MAX_LOCAL_LEN || domain.contains('@') {
            return false;
        }
        self.local.is_match(local) && self.domain.is_match(domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_common_addresses() {
        let checker = RegexSyntaxChecker::new().unwrap();
        assert!(checker.check_syntax("a@x.com"));
        assert!(checker.check_syntax("first.last+tag@mail.example.co.uk"));
        assert!(checker.check_syntax("o'brien@example.ie"));
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        let checker = RegexSyntaxChecker::new().unwrap();
        assert!(!checker.check_syntax("bad@@nodomain"));
        assert!(!checker.check_syntax("no-at-sign.com"));
        assert!(!checker.check_syntax("@x.com"));
        assert!(!checker.check_syntax("a@localhost"));
        assert!(!checker.check_syntax("a..b@x.com"));
        assert!(!checker.check_syntax(".a@x.com"));
        assert!(!checker.check_syntax("a@-x.com"));
        assert!(!checker.check_syntax(&format!("{}@x.com", "a".repeat(65))));
    }
}

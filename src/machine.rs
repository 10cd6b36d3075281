//! Per-record state machine.
//!
//! A record walks `Syntax -> Reputation -> Dns -> Smtp -> Geo -> Score`.
//! The first two stages are offline and run on the scheduler's thread in
//! input order, which is what makes duplicate detection deterministic. The
//! network stages run on the worker pool.

use crate::config::Config;
use crate::error::LookupError;
use crate::lookup::{Collaborators, SmtpSignal};
use crate::proxy::{ProxyEndpoint, ProxyPool};
use crate::record::{Record, Stage, Verdict, UNKNOWN_COUNTRY};
use crate::reputation::{DomainClass, DomainClassifier, DomainReputation};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One retry through a different route when the proxy itself fails.
const MAX_SMTP_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsOutcome {
    /// Mail exchanger found; the probe targets this host
    Mx(String),
    /// No MX but the domain has an address record (implicit MX)
    Host,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DnsStrategy {
    MailExchanger,
    HostAddress,
}

impl DnsStrategy {
    fn label(&self) -> &'static str {
        match self {
            DnsStrategy::MailExchanger => "MX",
            DnsStrategy::HostAddress => "A/AAAA",
        }
    }
}

const DNS_STRATEGIES: [DnsStrategy; 2] = [DnsStrategy::MailExchanger, DnsStrategy::HostAddress];

async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, LookupError>
where
    F: Future<Output = Result<T, LookupError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(LookupError::Timeout(limit.as_secs())),
    }
}

/// Everything the scoring stage looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signals {
    pub syntax_ok: bool,
    pub reputation: DomainReputation,
    pub dns: DnsOutcome,
    /// `None` when no probe ran
    pub smtp: Option<SmtpSignal>,
}

/// Map signals to a verdict and a 0-100 quality score.
///
/// The verdict follows fixed rules; the numeric score is a weighted sum
/// clamped into the band of the verdict so the two never disagree.
pub fn score(signals: &Signals) -> (Verdict, u8) {
    let reputable = signals.reputation.class() == DomainClass::Reputable;

    let verdict = if !signals.syntax_ok || signals.dns == DnsOutcome::Missing {
        Verdict::Invalid
    } else {
        match signals.smtp {
            Some(SmtpSignal::Accept) => Verdict::Valid,
            Some(SmtpSignal::Reject) if reputable => Verdict::ProbablyValid,
            Some(SmtpSignal::Reject) => Verdict::ProbablyInvalid,
            Some(SmtpSignal::Neutral) | None => Verdict::ProbablyValid,
        }
    };

    let mut points: u32 = 0;
    if signals.syntax_ok {
        points += 20;
    }
    match signals.dns {
        DnsOutcome::Mx(_) => points += 25 + 25,
        DnsOutcome::Host => points += 25 + 15,
        DnsOutcome::Missing => {}
    }
    match signals.smtp {
        Some(SmtpSignal::Accept) => points += 20,
        Some(SmtpSignal::Neutral) => points += 10,
        Some(SmtpSignal::Reject) | None => {}
    }
    points += u32::from(signals.reputation.bonus());

    let (low, high) = match verdict {
        Verdict::Valid => (80, 100),
        Verdict::ProbablyValid => (60, 79),
        Verdict::ProbablyInvalid => (40, 59),
        Verdict::Invalid => (0, 39),
        Verdict::Skipped => (0, 0),
    };
    (verdict, points.clamp(low, high) as u8)
}

/// A record that passed the offline stages and still needs network checks.
#[derive(Debug)]
pub struct PendingRecord {
    record: Record,
    reputation: DomainReputation,
}

impl PendingRecord {
    pub fn record(&self) -> &Record {
        &self.record
    }
}

#[derive(Debug)]
pub enum Screening {
    Finished(Record),
    Pending(PendingRecord),
}

pub struct RecordMachine {
    collaborators: Collaborators,
    classifier: DomainClassifier,
    proxies: Arc<ProxyPool>,
    dns_timeout: Duration,
    smtp_timeout: Duration,
    geo_timeout: Duration,
}

impl RecordMachine {
    pub fn new(
        config: &Config,
        collaborators: Collaborators,
        proxies: Arc<ProxyPool>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            collaborators,
            classifier: DomainClassifier::new(&config.domains)?,
            proxies,
            dns_timeout: config.dns_timeout(),
            smtp_timeout: config.smtp_timeout(),
            geo_timeout: config.geo_timeout(),
        })
    }

    pub fn proxies(&self) -> &ProxyPool {
        &self.proxies
    }

    /// Run a record through every stage.
    pub async fn advance(&self, record: Record, seen: &mut HashSet<String>) -> Record {
        match self.screen(record, seen) {
            Screening::Finished(record) => record,
            Screening::Pending(pending) => self.resolve(pending).await,
        }
    }

    /// Syntax and reputation stages. No network access.
    ///
    /// `seen` holds the normalized addresses already claimed in this run
    /// (including checkpointed ones); a first occurrence is added to it.
    pub fn screen(&self, mut record: Record, seen: &mut HashSet<String>) -> Screening {
        record.enter(Stage::Syntax);
        if !self.collaborators.syntax.check_syntax(&record.address) {
            record.note("Invalid syntax");
            let (verdict, score) = score(&Signals {
                syntax_ok: false,
                reputation: DomainReputation::Unknown,
                dns: DnsOutcome::Missing,
                smtp: None,
            });
            record.finalize(verdict, score);
            log::info!("Validation completed for {}: {}", record.address, verdict);
            return Screening::Finished(record);
        }
        record.note("Valid syntax");

        record.enter(Stage::Reputation);
        let reputation = self.classifier.classify_address(&record.address);
        if reputation == DomainReputation::Disposable {
            record.note("Disposable email domain");
            record.finalize(Verdict::Skipped, 0);
            log::info!("Skipped disposable address: {}", record.address);
            return Screening::Finished(record);
        }
        if !seen.insert(record.normalized()) {
            record.note("Duplicate address");
            record.finalize(Verdict::Skipped, 0);
            log::info!("Skipped duplicate address: {}", record.address);
            return Screening::Finished(record);
        }
        record.note(format!("Domain reputation: {}", reputation.label()));

        record.enter(Stage::Dns);
        Screening::Pending(PendingRecord { record, reputation })
    }

    /// DNS, SMTP, Geo and Score stages. Collaborator failures end up as
    /// diagnostics, never as errors.
    pub async fn resolve(&self, pending: PendingRecord) -> Record {
        let PendingRecord {
            mut record,
            reputation,
        } = pending;
        let mut cap = Verdict::Valid;

        // screen() only lets syntactically valid addresses through
        let domain = record.domain().unwrap_or_default();

        record.enter(Stage::Dns);
        let dns = self.resolve_domain(&mut record, &domain).await;
        if dns == DnsOutcome::Missing {
            cap = Verdict::Invalid;
        }

        record.enter(Stage::Smtp);
        let smtp = match &dns {
            DnsOutcome::Missing => {
                record.note("SMTP skipped: domain does not resolve");
                None
            }
            DnsOutcome::Mx(host) => self.probe_mailbox(&mut record, host).await,
            DnsOutcome::Host => self.probe_mailbox(&mut record, &domain).await,
        };

        record.enter(Stage::Geo);
        record.country = self.locate(&mut record).await;

        record.enter(Stage::Score);
        let signals = Signals {
            syntax_ok: true,
            reputation,
            dns,
            smtp,
        };
        let (scored, points) = score(&signals);
        let verdict = scored.min_live(cap);
        record.note(format!("Score {points}/100: {verdict}"));
        record.finalize(verdict, points);

        log::info!("Validation completed for {}: {}", record.address, verdict);
        record
    }

    async fn try_dns(
        &self,
        strategy: DnsStrategy,
        domain: &str,
    ) -> Result<Option<DnsOutcome>, LookupError> {
        let dns = &self.collaborators.dns;
        match strategy {
            DnsStrategy::MailExchanger => Ok(bounded(self.dns_timeout, dns.resolve_mx(domain))
                .await?
                .map(DnsOutcome::Mx)),
            DnsStrategy::HostAddress => Ok(bounded(self.dns_timeout, dns.resolve_host(domain))
                .await?
                .then_some(DnsOutcome::Host)),
        }
    }

    async fn resolve_domain(&self, record: &mut Record, domain: &str) -> DnsOutcome {
        for strategy in DNS_STRATEGIES {
            match self.try_dns(strategy, domain).await {
                Ok(Some(outcome)) => {
                    match &outcome {
                        DnsOutcome::Mx(host) => record.note(format!("Valid MX record: {host}")),
                        _ => record.note("No MX record, domain accessible via A records"),
                    }
                    return outcome;
                }
                Ok(None) => {
                    log::debug!("{} lookup for {domain} found nothing", strategy.label());
                }
                Err(e) => {
                    log::debug!("{} lookup for {domain} failed: {e}", strategy.label());
                    record.note(format!("{} lookup failed: {e}", strategy.label()));
                }
            }
        }
        record.note("No MX or A records");
        DnsOutcome::Missing
    }

    async fn probe_mailbox(&self, record: &mut Record, mail_host: &str) -> Option<SmtpSignal> {
        let Some(prober) = self.collaborators.smtp.clone() else {
            record.note("SMTP probing disabled");
            return None;
        };

        for attempt in 1..=MAX_SMTP_ATTEMPTS {
            let proxy = self.proxies.acquire();
            let outcome = bounded(
                self.smtp_timeout,
                prober.probe(&record.address, mail_host, proxy.as_ref()),
            )
            .await;

            match outcome {
                Ok(signal) => {
                    self.report(proxy.as_ref(), true);
                    record.note(match signal {
                        SmtpSignal::Accept => format!("SMTP {mail_host} accepted recipient"),
                        SmtpSignal::Reject => format!("SMTP {mail_host} rejected recipient"),
                        SmtpSignal::Neutral => format!("SMTP {mail_host} gave no verdict"),
                    });
                    return Some(signal);
                }
                Err(e) if e.is_proxy_fault() => {
                    self.report(proxy.as_ref(), false);
                    record.note(format!("SMTP attempt {attempt} proxy failure: {e}"));
                }
                Err(e @ LookupError::Timeout(_)) => {
                    record.note(format!("SMTP inconclusive: {e}"));
                    return Some(SmtpSignal::Neutral);
                }
                Err(e) => {
                    // The route worked; the mail host did not
                    self.report(proxy.as_ref(), true);
                    record.note(format!("SMTP inconclusive: {e}"));
                    return Some(SmtpSignal::Neutral);
                }
            }
        }

        record.note("SMTP inconclusive: no working route");
        Some(SmtpSignal::Neutral)
    }

    async fn locate(&self, record: &mut Record) -> String {
        if self.collaborators.geo.is_empty() {
            return UNKNOWN_COUNTRY.to_string();
        }

        for locator in &self.collaborators.geo {
            let proxy = self.proxies.acquire();
            let outcome = bounded(
                self.geo_timeout,
                locator.locate_country(&record.address, proxy.as_ref()),
            )
            .await;

            match outcome {
                Ok(Some(country)) => {
                    self.report(proxy.as_ref(), true);
                    record.note(format!("Country {country} via {}", locator.name()));
                    return country;
                }
                Ok(None) => {
                    self.report(proxy.as_ref(), true);
                    log::debug!("{} had no country for {}", locator.name(), record.address);
                }
                Err(e) => {
                    self.report(proxy.as_ref(), !e.is_proxy_fault());
                    log::debug!("Geo API {} failed: {e}", locator.name());
                }
            }
        }

        record.note("Country unknown: all geolocation providers failed");
        UNKNOWN_COUNTRY.to_string()
    }

    fn report(&self, proxy: Option<&ProxyEndpoint>, ok: bool) {
        if let Some(proxy) = proxy {
            if ok {
                self.proxies.report_success(proxy);
            } else {
                self.proxies.report_failure(proxy);
            }
        }
    }
}

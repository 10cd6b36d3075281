//! Scripted lookups for driving the state machine and scheduler in tests.

use crate::config::{Config, ProxyConfig};
use crate::domain_utils::DomainUtils;
use crate::error::LookupError;
use crate::lookup::{
    Collaborators, DnsResolver, GeoLocator, RegexSyntaxChecker, SmtpProber, SmtpSignal,
};
use crate::machine::RecordMachine;
use crate::proxy::{ProxyEndpoint, ProxyPool};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct Script {
    mx: HashMap<String, String>,
    hosts: HashSet<String>,
    dns_failures: HashSet<String>,
    smtp: HashMap<String, SmtpSignal>,
    smtp_delay: Option<Duration>,
    panic_on: HashSet<String>,
    countries: HashMap<String, String>,
    bad_proxies: HashSet<String>,
    failing_geo_providers: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub mx: usize,
    pub host: usize,
    pub smtp: usize,
    pub geo: usize,
}

impl CallCounts {
    pub fn network_total(&self) -> usize {
        self.mx + self.host + self.smtp + self.geo
    }
}

#[derive(Debug, Default)]
struct Recorded {
    calls: CallCounts,
    probe_targets: Vec<String>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Builder for a scripted network. Unscripted domains do not resolve and
/// unscripted SMTP probes come back neutral.
#[derive(Clone, Default)]
pub struct FakeLookups {
    script: Arc<Script>,
    recorded: Arc<Mutex<Recorded>>,
}

impl FakeLookups {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&mut self) -> &mut Script {
        Arc::make_mut(&mut self.script)
    }

    pub fn with_mx(mut self, domain: &str, host: &str) -> Self {
        self.script().mx.insert(domain.to_string(), host.to_string());
        self
    }

    pub fn with_host(mut self, domain: &str) -> Self {
        self.script().hosts.insert(domain.to_string());
        self
    }

    pub fn with_dns_failure(mut self, domain: &str) -> Self {
        self.script().dns_failures.insert(domain.to_string());
        self
    }

    pub fn with_smtp(mut self, address: &str, signal: SmtpSignal) -> Self {
        self.script().smtp.insert(address.to_lowercase(), signal);
        self
    }

    pub fn with_smtp_delay(mut self, delay: Duration) -> Self {
        self.script().smtp_delay = Some(delay);
        self
    }

    /// The SMTP probe for this address panics, taking its worker down.
    pub fn with_panic_on(mut self, address: &str) -> Self {
        self.script().panic_on.insert(address.to_lowercase());
        self
    }

    pub fn with_country(mut self, domain: &str, country: &str) -> Self {
        self.script()
            .countries
            .insert(domain.to_string(), country.to_string());
        self
    }

    /// Any call routed through a proxy on this host fails as a proxy fault.
    pub fn with_bad_proxy(mut self, host: &str) -> Self {
        self.script().bad_proxies.insert(host.to_string());
        self
    }

    /// Prepend providers that always fail before the scripted one.
    pub fn with_failing_geo_providers(mut self, count: usize) -> Self {
        self.script().failing_geo_providers = count;
        self
    }

    pub fn calls(&self) -> CallCounts {
        self.recorded.lock().unwrap().calls
    }

    /// Most SMTP probes that were running at the same moment.
    pub fn peak_concurrent_probes(&self) -> usize {
        self.recorded.lock().unwrap().peak_in_flight
    }

    pub fn probe_targets(&self) -> Vec<String> {
        self.recorded.lock().unwrap().probe_targets.clone()
    }

    pub fn collaborators(&self) -> Collaborators {
        let mut geo: Vec<Arc<dyn GeoLocator>> = (0..self.script.failing_geo_providers)
            .map(|_| {
                Arc::new(FailingGeo {
                    recorded: self.recorded.clone(),
                }) as Arc<dyn GeoLocator>
            })
            .collect();
        geo.push(Arc::new(self.clone()));

        Collaborators {
            syntax: Arc::new(RegexSyntaxChecker::new().unwrap()),
            dns: Arc::new(self.clone()),
            smtp: Some(Arc::new(self.clone())),
            geo,
        }
    }

    fn proxy_fault(&self, proxy: Option<&ProxyEndpoint>) -> Option<LookupError> {
        proxy
            .filter(|p| self.script.bad_proxies.contains(&p.host))
            .map(|p| LookupError::Proxy {
                endpoint: p.to_string(),
                reason: "connection refused".to_string(),
            })
    }
}

#[async_trait]
impl DnsResolver for FakeLookups {
    async fn resolve_mx(&self, domain: &str) -> Result<Option<String>, LookupError> {
        self.recorded.lock().unwrap().calls.mx += 1;
        if self.script.dns_failures.contains(domain) {
            return Err(LookupError::Dns("SERVFAIL".to_string()));
        }
        Ok(self.script.mx.get(domain).cloned())
    }

    async fn resolve_host(&self, domain: &str) -> Result<bool, LookupError> {
        self.recorded.lock().unwrap().calls.host += 1;
        if self.script.dns_failures.contains(domain) {
            return Err(LookupError::Dns("SERVFAIL".to_string()));
        }
        Ok(self.script.hosts.contains(domain))
    }
}

#[async_trait]
impl SmtpProber for FakeLookups {
    async fn probe(
        &self,
        address: &str,
        mail_host: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<SmtpSignal, LookupError> {
        {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.calls.smtp += 1;
            recorded.probe_targets.push(mail_host.to_string());
        }
        let address = address.to_lowercase();
        if self.script.panic_on.contains(&address) {
            panic!("scripted probe crash for {address}");
        }
        if let Some(fault) = self.proxy_fault(proxy) {
            return Err(fault);
        }
        {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.in_flight += 1;
            recorded.peak_in_flight = recorded.peak_in_flight.max(recorded.in_flight);
        }
        if let Some(delay) = self.script.smtp_delay {
            tokio::time::sleep(delay).await;
        }
        self.recorded.lock().unwrap().in_flight -= 1;
        Ok(self
            .script
            .smtp
            .get(&address)
            .copied()
            .unwrap_or(SmtpSignal::Neutral))
    }
}

#[async_trait]
impl GeoLocator for FakeLookups {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn locate_country(
        &self,
        address: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Option<String>, LookupError> {
        self.recorded.lock().unwrap().calls.geo += 1;
        if let Some(fault) = self.proxy_fault(proxy) {
            return Err(fault);
        }
        Ok(DomainUtils::extract_domain(address).and_then(|d| self.script.countries.get(&d).cloned()))
    }
}

struct FailingGeo {
    recorded: Arc<Mutex<Recorded>>,
}

#[async_trait]
impl GeoLocator for FailingGeo {
    fn name(&self) -> &str {
        "failing"
    }

    async fn locate_country(
        &self,
        _address: &str,
        _proxy: Option<&ProxyEndpoint>,
    ) -> Result<Option<String>, LookupError> {
        self.recorded.lock().unwrap().calls.geo += 1;
        Err(LookupError::Http("503 Service Unavailable".to_string()))
    }
}

/// Default config with one-second timeouts and paths under `root`.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.paths.input_dir = root.join("input");
    config.paths.output_dir = root.join("output");
    config.paths.progress_dir = root.join("progress");
    config.processing.batch_delay_ms = 0;
    config.processing.cleanup_progress_on_completion = false;
    config.network.dns_timeout_seconds = 1;
    config.network.smtp_timeout_seconds = 1;
    config.network.geo_timeout_seconds = 1;
    config
}

pub fn machine(fakes: &FakeLookups) -> RecordMachine {
    let config = test_config(Path::new("unused"));
    RecordMachine::new(
        &config,
        fakes.collaborators(),
        Arc::new(ProxyPool::empty(&config.proxy)),
    )
    .unwrap()
}

pub fn machine_with_proxies(
    fakes: &FakeLookups,
    proxies: &[&str],
    failure_threshold: u32,
) -> RecordMachine {
    let config = test_config(Path::new("unused"));
    let endpoints = proxies
        .iter()
        .map(|line| ProxyEndpoint::parse(line).unwrap())
        .collect();
    let pool = ProxyPool::new(
        endpoints,
        &ProxyConfig {
            rotation_count: 100,
            failure_threshold,
        },
    );
    RecordMachine::new(&config, fakes.collaborators(), Arc::new(pool)).unwrap()
}

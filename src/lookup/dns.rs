use super::DnsResolver;
use crate::error::LookupError;
use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::time::Duration;

/// System-configured resolver with a hard per-query timeout.
pub struct HickoryDnsResolver {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl HickoryDnsResolver {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let (config, mut opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(conf) => conf,
            Err(e) => {
                log::warn!("Failed to read system resolver config ({e}), using defaults");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        opts.timeout = timeout;
        opts.attempts = 1;

        Ok(Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            timeout,
        })
    }

    /// First public address of the domain, used by the geolocation providers
    pub async fn first_ip(&self, domain: &str) -> Result<Option<IpAddr>, LookupError> {
        let lookup = tokio::time::timeout(self.timeout, self.resolver.lookup_ip(domain))
            .await
            .map_err(|_| LookupError::Timeout(self.timeout.as_secs()))?;

        match lookup {
            Ok(response) => Ok(response.iter().find(|ip| !ip.is_loopback())),
            Err(e) if is_no_records(&e) => Ok(None),
            Err(e) => Err(LookupError::Dns(e.to_string())),
        }
    }
}

fn is_no_records(e: &ResolveError) -> bool {
    matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

#[async_trait]
impl DnsResolver for HickoryDnsResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Option<String>, LookupError> {
        log::debug!("Checking MX records for {domain}");

        let lookup = tokio::time::timeout(self.timeout, self.resolver.mx_lookup(domain))
            .await
            .map_err(|_| LookupError::Timeout(self.timeout.as_secs()))?;

        match lookup {
            Ok(mx_response) => {
                let primary = mx_response
                    .iter()
                    .min_by_key(|mx| mx.preference())
                    .map(|mx| mx.exchange().to_utf8().trim_end_matches('.').to_string());

                match primary {
                    // Null MX: the domain explicitly accepts no mail
                    Some(host) if host.is_empty() => Ok(None),
                    Some(host) => {
                        log::debug!("Primary MX for {domain}: {host}");
                        Ok(Some(host))
                    }
                    None => Ok(None),
                }
            }
            Err(e) if is_no_records(&e) => {
                log::debug!("No MX records found for {domain}");
                Ok(None)
            }
            Err(e) => Err(LookupError::Dns(e.to_string())),
        }
    }

    async fn resolve_host(&self, domain: &str) -> Result<bool, LookupError> {
        log::debug!("Checking A/AAAA records for {domain}");

        match self.first_ip(domain).await? {
            Some(ip) => {
                log::debug!("DNS found IP for {domain}: {ip}");
                Ok(true)
            }
            None => {
                log::debug!("DNS lookup returned no usable IPs for {domain}");
                Ok(false)
            }
        }
    }
}

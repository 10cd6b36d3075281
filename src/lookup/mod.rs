//! Network and offline checks the record state machine calls out to.
//!
//! Every check sits behind a small trait so the scheduler can be driven by
//! the real resolvers in production and by scripted fakes in tests.

pub mod dns;
pub mod geo;
pub mod smtp;
pub mod syntax;

use crate::config::Config;
use crate::error::LookupError;
use crate::proxy::ProxyEndpoint;
use async_trait::async_trait;
use std::sync::Arc;

pub use dns::HickoryDnsResolver;
pub use geo::HttpGeoLocator;
pub use smtp::TcpSmtpProber;
pub use syntax::RegexSyntaxChecker;

pub trait SyntaxChecker: Send + Sync {
    fn check_syntax(&self, address: &str) -> bool;
}

#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Primary mail exchanger of the domain, `Ok(None)` when it publishes none
    async fn resolve_mx(&self, domain: &str) -> Result<Option<String>, LookupError>;

    /// Whether the domain has at least one usable A/AAAA record
    async fn resolve_host(&self, domain: &str) -> Result<bool, LookupError>;
}

/// Outcome of an SMTP RCPT probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSignal {
    Accept,
    Reject,
    Neutral,
}

#[async_trait]
pub trait SmtpProber: Send + Sync {
    async fn probe(
        &self,
        address: &str,
        mail_host: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<SmtpSignal, LookupError>;
}

/// One geolocation provider. Providers are tried in configured order.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    fn name(&self) -> &str;

    /// Country for the address' domain, `Ok(None)` when the provider has no answer
    async fn locate_country(
        &self,
        address: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Option<String>, LookupError>;
}

/// The set of lookups handed to the state machine.
#[derive(Clone)]
pub struct Collaborators {
    pub syntax: Arc<dyn SyntaxChecker>,
    pub dns: Arc<dyn DnsResolver>,
    /// `None` when SMTP probing is disabled
    pub smtp: Option<Arc<dyn SmtpProber>>,
    pub geo: Vec<Arc<dyn GeoLocator>>,
}

impl Collaborators {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let resolver = Arc::new(HickoryDnsResolver::new(config.dns_timeout())?);

        let smtp: Option<Arc<dyn SmtpProber>> = if config.network.enable_smtp {
            Some(Arc::new(TcpSmtpProber::new(&config.network)))
        } else {
            log::info!("SMTP probing disabled");
            None
        };

        let geo: Vec<Arc<dyn GeoLocator>> = if config.network.enable_geo {
            config
                .network
                .geo_providers
                .iter()
                .map(|template| {
                    HttpGeoLocator::new(template, resolver.clone(), config.geo_timeout())
                        .map(|locator| Arc::new(locator) as Arc<dyn GeoLocator>)
                })
                .collect::<anyhow::Result<Vec<_>>>()?
        } else {
            log::info!("Country detection disabled");
            Vec::new()
        };

        Ok(Self {
            syntax: Arc::new(RegexSyntaxChecker::new()?),
            dns: resolver,
            smtp,
            geo,
        })
    }
}

use super::dns::HickoryDnsResolver;
use super::GeoLocator;
use crate::domain_utils::DomainUtils;
use crate::error::LookupError;
use crate::proxy::ProxyEndpoint;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Response fields that carry the country, in order of preference.
const COUNTRY_FIELDS: [&str; 4] = ["country", "country_name", "countryName", "country_code"];

/// JSON IP-geolocation endpoint. The domain is resolved to an address which
/// is substituted for `{ip}` in the URL template.
pub struct HttpGeoLocator {
    name: String,
    template: String,
    resolver: Arc<HickoryDnsResolver>,
    client: Client,
    timeout: Duration,
}

impl HttpGeoLocator {
    pub fn new(
        template: &str,
        resolver: Arc<HickoryDnsResolver>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let sample = Url::parse(&template.replace("{ip}", "127.0.0.1"))?;
        let name = sample.host_str().unwrap_or(template).to_string();

        Ok(Self {
            name,
            template: template.to_string(),
            resolver,
            client: Self::build_client(timeout, None)?,
            timeout,
        })
    }

    fn build_client(timeout: Duration, proxy: Option<&ProxyEndpoint>) -> reqwest::Result<Client> {
        let mut builder = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mailsift/", env!("CARGO_PKG_VERSION")));

        if let Some(endpoint) = proxy {
            let mut proxy = reqwest::Proxy::all(endpoint.url())?;
            if let Some(creds) = &endpoint.credentials {
                proxy = proxy.basic_auth(&creds.username, &creds.password);
            }
            builder = builder.proxy(proxy);
        }

        builder.build()
    }

    fn endpoint_for(&self, ip: &str) -> String {
        self.template.replace("{ip}", ip)
    }
}

fn extract_country(data: &Value) -> Option<String> {
    COUNTRY_FIELDS.iter().find_map(|field| {
        data.get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

#[async_trait]
impl GeoLocator for HttpGeoLocator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn locate_country(
        &self,
        address: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Option<String>, LookupError> {
        let Some(domain) = DomainUtils::extract_domain(address) else {
            return Ok(None);
        };
        let Some(ip) = self.resolver.first_ip(&domain).await? else {
            log::debug!("Could not resolve IP for domain: {domain}");
            return Ok(None);
        };

        let proxied;
        let client = match proxy {
            Some(endpoint) => {
                proxied = Self::build_client(self.timeout, Some(endpoint))?;
                &proxied
            }
            None => &self.client,
        };

        let url = self.endpoint_for(&ip.to_string());
        log::debug!("Trying geolocation API: {url}");

        let response = client.get(&url).send().await.map_err(|e| match proxy {
            Some(endpoint) if e.is_connect() => LookupError::Proxy {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            },
            _ => LookupError::from(e),
        })?;

        if !response.status().is_success() {
            return Err(LookupError::Http(format!(
                "{} returned status {}",
                self.name,
                response.status()
            )));
        }

        let data: Value = response.json().await?;
        Ok(extract_country(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_country_field_priority() {
        assert_eq!(
            extract_country(&json!({"country": "Germany", "country_code": "DE"})),
            Some("Germany".to_string())
        );
        assert_eq!(
            extract_country(&json!({"country_name": "France"})),
            Some("France".to_string())
        );
        assert_eq!(
            extract_country(&json!({"country": "", "countryName": "Japan"})),
            Some("Japan".to_string())
        );
        assert_eq!(extract_country(&json!({"ip": "1.2.3.4"})), None);
    }

    #[tokio::test]
    async fn test_provider_name_from_template() {
        let resolver = Arc::new(HickoryDnsResolver::new(Duration::from_secs(1)).unwrap());
        let locator =
            HttpGeoLocator::new("http://ip-api.com/json/{ip}", resolver, Duration::from_secs(1))
                .unwrap();
        assert_eq!(locator.name(), "ip-api.com");
        assert_eq!(locator.endpoint_for("1.2.3.4"), "http://ip-api.com/json/1.2.3.4");
    }
}

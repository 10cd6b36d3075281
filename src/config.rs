use anyhow::{bail, Context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub domains: DomainsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub progress_dir: PathBuf,
    /// Proxy list file name, looked up inside `input_dir` and never read as email input
    pub proxy_file: String,
    /// Prefix for checkpoint files so several runs can share a progress directory
    pub session: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub batch_size: usize,
    pub workers: usize,
    pub batch_delay_ms: u64,
    pub cleanup_progress_on_completion: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub dns_timeout_seconds: u64,
    pub smtp_timeout_seconds: u64,
    pub geo_timeout_seconds: u64,
    pub smtp_port: u16,
    pub helo_name: String,
    pub probe_sender: String,
    pub enable_smtp: bool,
    pub enable_geo: bool,
    /// Geolocation endpoints in priority order; `{ip}` is replaced with the domain's address
    pub geo_providers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Consecutive successful uses before the pool moves on to the next endpoint
    pub rotation_count: u32,
    /// Consecutive failures after which an endpoint is quarantined for the run
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainsConfig {
    pub disposable_domains: Vec<String>,
    pub disposable_patterns: Vec<String>,
    pub major_providers: Vec<String>,
    pub educational_suffixes: Vec<String>,
    pub government_suffixes: Vec<String>,
    pub business_suffixes: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("data/input"),
            output_dir: PathBuf::from("data/output"),
            progress_dir: PathBuf::from("data/progress"),
            proxy_file: "proxies.txt".to_string(),
            session: "default".to_string(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            workers: 5,
            batch_delay_ms: 500,
            cleanup_progress_on_completion: true,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            dns_timeout_seconds: 5,
            smtp_timeout_seconds: 15,
            geo_timeout_seconds: 10,
            smtp_port: 25,
            helo_name: "validator.test".to_string(),
            probe_sender: "test@validator.com".to_string(),
            enable_smtp: true,
            enable_geo: true,
            geo_providers: strings(&["http://ip-api.com/json/{ip}", "https://ipapi.co/{ip}/json/"]),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            rotation_count: 50,
            failure_threshold: 3,
        }
    }
}

impl Default for DomainsConfig {
    fn default() -> Self {
        Self {
            disposable_domains: strings(&[
                "10minutemail.com",
                "tempmail.org",
                "guerrillamail.com",
                "mailinator.com",
                "yopmail.com",
                "throwaway.email",
            ]),
            disposable_patterns: strings(&[r"^(temp|trash|throwaway)[-.]?mail\.", r"minutemail\."]),
            major_providers: strings(&[
                "gmail.com",
                "yahoo.com",
                "hotmail.com",
                "outlook.com",
                "live.com",
                "aol.com",
                "icloud.com",
                "protonmail.com",
            ]),
            educational_suffixes: strings(&[".edu", ".ac.uk", ".ac.", ".sch.uk", ".edu.au"]),
            government_suffixes: strings(&[".gov", ".gov.uk", ".gov.au"]),
            business_suffixes: strings(&[".com", ".co.uk", ".org", ".net", ".biz"]),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            processing: ProcessingConfig::default(),
            network: NetworkConfig::default(),
            proxy: ProxyConfig::default(),
            domains: DomainsConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML config: {path}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.processing.batch_size == 0 {
            bail!("processing.batch_size must be at least 1");
        }
        if self.processing.workers == 0 {
            bail!("processing.workers must be at least 1");
        }
        if self.proxy.rotation_count == 0 {
            bail!("proxy.rotation_count must be at least 1");
        }
        if self.proxy.failure_threshold == 0 {
            bail!("proxy.failure_threshold must be at least 1");
        }
        if self.network.dns_timeout_seconds == 0
            || self.network.smtp_timeout_seconds == 0
            || self.network.geo_timeout_seconds == 0
        {
            bail!("network timeouts must be non-zero");
        }
        for pattern in &self.domains.disposable_patterns {
            Regex::new(pattern)
                .with_context(|| format!("Invalid disposable pattern: {pattern}"))?;
        }
        for provider in &self.network.geo_providers {
            let sample = provider.replace("{ip}", "127.0.0.1");
            Url::parse(&sample)
                .with_context(|| format!("Invalid geolocation provider URL: {provider}"))?;
        }
        Ok(())
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.network.dns_timeout_seconds)
    }

    pub fn smtp_timeout(&self) -> Duration {
        Duration::from_secs(self.network.smtp_timeout_seconds)
    }

    pub fn geo_timeout(&self) -> Duration {
        Duration::from_secs(self.network.geo_timeout_seconds)
    }

    pub fn proxy_path(&self) -> PathBuf {
        self.paths.input_dir.join(&self.paths.proxy_file)
    }
}

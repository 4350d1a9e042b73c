use figment::providers::Format;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub external_uri: String,
    #[serde(default)]
    pub tos_uri: Option<String>,
    #[serde(default)]
    pub website_uri: Option<String>,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Seconds a nonce stays redeemable after being handed out.
    #[serde(default = "default_nonce_lifetime")]
    pub nonce_lifetime: u64,
    /// Seconds a new order has to reach `valid` before it expires.
    #[serde(default = "default_order_lifetime")]
    pub order_lifetime: u64,
    /// Unfinished orders an account may hold at once; zero disables the limit.
    #[serde(default = "default_max_pending_orders")]
    pub max_pending_orders: u32,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub issuance: IssuanceConfig,
    #[serde(default)]
    pub provisioners: Vec<ProvisionerConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    Postgres {
        url: String,
        #[serde(default = "default_pool_size")]
        pool_size: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_validation_timeout")]
    pub timeout: u64,
    #[serde(default = "default_http01_port")]
    pub http01_port: u16,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub dns_resolvers: Vec<std::net::IpAddr>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            timeout: default_validation_timeout(),
            http01_port: default_http01_port(),
            proxy: None,
            dns_resolvers: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssuanceConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Seconds a claimed order is hidden from other workers.
    #[serde(default = "default_claim_lease")]
    pub claim_lease: u64,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        IssuanceConfig {
            poll_interval: default_poll_interval(),
            claim_lease: default_claim_lease(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionerConfig {
    pub name: String,
    pub ca_cert: std::path::PathBuf,
    pub ca_key: std::path::PathBuf,
    #[serde(default)]
    pub ca_chain: Option<std::path::PathBuf>,
    #[serde(default = "default_cert_validity_days")]
    pub cert_validity_days: u32,
    #[serde(default)]
    pub allow_wildcards: bool,
    #[serde(default)]
    pub allow_ip: bool,
    #[serde(default)]
    pub domain_suffixes: Vec<String>,
}

/// Upper bound on every configured duration, ten years.
const MAX_DURATION_SECS: u64 = 10 * 366 * 86400;

fn default_nonce_lifetime() -> u64 { 3600 }
fn default_order_lifetime() -> u64 { 86400 }
fn default_max_pending_orders() -> u32 { 300 }
fn default_pool_size() -> u32 { 10 }
fn default_validation_timeout() -> u64 { 10 }
fn default_http01_port() -> u16 { 80 }
fn default_poll_interval() -> u64 { 20 }
fn default_claim_lease() -> u64 { 300 }
fn default_cert_validity_days() -> u32 { 90 }

impl Config {
    /// Rocket's own figment, overlaid with `Bjorn.toml` (or `$BJORN_CONFIG`) and `BJORN_` variables.
    pub fn figment() -> figment::Figment {
        let config_file = figment::providers::Env::var_or("BJORN_CONFIG", "Bjorn.toml");
        rocket::Config::figment()
            .merge(figment::providers::Toml::file(config_file).nested())
            .merge(figment::providers::Env::prefixed("BJORN_").global())
    }

    pub fn from_figment(figment: &figment::Figment) -> Result<Self, String> {
        let config: Config = figment.extract()
            .map_err(|e| format!("Unable to load config: {}", e))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), String> {
        let uri = url::Url::parse(&self.external_uri)
            .map_err(|e| format!("Invalid external URI '{}': {}", self.external_uri, e))?;
        if uri.cannot_be_a_base() || !matches!(uri.scheme(), "http" | "https") {
            return Err(format!("External URI '{}' must be an absolute HTTP(S) URL", self.external_uri));
        }
        for (name, value) in [
            ("nonce_lifetime", self.nonce_lifetime),
            ("order_lifetime", self.order_lifetime),
            ("validation.timeout", self.validation.timeout),
            ("issuance.poll_interval", self.issuance.poll_interval),
            ("issuance.claim_lease", self.issuance.claim_lease),
        ] {
            if value > MAX_DURATION_SECS {
                return Err(format!("'{}' of {}s is longer than the maximum of {}s", name, value, MAX_DURATION_SECS));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for provisioner in &self.provisioners {
            if provisioner.name.is_empty() || provisioner.name.contains('/') {
                return Err(format!("Invalid provisioner name '{}'", provisioner.name));
            }
            if !seen.insert(provisioner.name.as_str()) {
                return Err(format!("Provisioner '{}' configured more than once", provisioner.name));
            }
            if provisioner.cert_validity_days == 0 {
                return Err(format!("Provisioner '{}' must issue certificates valid for at least a day", provisioner.name));
            }
            if provisioner.cert_validity_days as u64 * 86400 > MAX_DURATION_SECS {
                return Err(format!("Provisioner '{}' certificate validity is too long", provisioner.name));
            }
        }
        Ok(())
    }

    /// External URI without a trailing slash, the prefix of every URL handed to clients.
    pub fn base_uri(&self) -> &str {
        self.external_uri.trim_end_matches('/')
    }

    pub fn nonce_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.nonce_lifetime as i64)
    }

    pub fn order_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.order_lifetime as i64)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            external_uri: "http://localhost:8000".to_string(),
            tos_uri: None,
            website_uri: None,
            storage: StorageConfig::default(),
            nonce_lifetime: default_nonce_lifetime(),
            order_lifetime: default_order_lifetime(),
            max_pending_orders: default_max_pending_orders(),
            validation: ValidationConfig::default(),
            issuance: IssuanceConfig::default(),
            provisioners: vec![],
        }
    }
}

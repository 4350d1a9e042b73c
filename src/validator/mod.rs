use crate::types;

/// TXT lookups used by dns-01, behind a trait so validation can run against any resolver.
#[rocket::async_trait]
pub trait TxtResolver: Send + Sync {
    /// Every TXT record at `name`, each record's strings concatenated. An empty answer is `Ok(vec![])`.
    async fn txt_records(&self, name: &str) -> Result<Vec<String>, String>;
}

#[rocket::async_trait]
impl TxtResolver for trust_dns_resolver::TokioAsyncResolver {
    async fn txt_records(&self, name: &str) -> Result<Vec<String>, String> {
        match self.txt_lookup(name).await {
            Ok(r) => Ok(r.iter()
                .map(|txt| txt.txt_data().iter()
                    .map(|d| String::from_utf8_lossy(d))
                    .collect::<String>())
                .collect()),
            Err(err) => match err.kind() {
                trust_dns_resolver::error::ResolveErrorKind::NoRecordsFound { .. } => Ok(vec![]),
                _ => Err(format!("SERVFAIL whilst getting records for {}", name)),
            }
        }
    }
}

pub struct Validator {
    dns_resolver: Box<dyn TxtResolver>,
    reqwest_client: reqwest::Client,
    http01_port: u16,
    timeout: std::time::Duration,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("Validator")
            .field("reqwest_client", &self.reqwest_client)
            .field("http01_port", &self.http01_port)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

pub fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{}.{}", token, thumbprint)
}

impl Validator {
    pub fn new(config: &crate::config::ValidationConfig) -> Result<Validator, String> {
        let timeout = std::time::Duration::from_secs(config.timeout);

        let resolver = if config.dns_resolvers.is_empty() {
            trust_dns_resolver::TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| format!("Unable to read DNS config: {}", e))?
        } else {
            let resolver_config = trust_dns_resolver::config::ResolverConfig::from_parts(
                None, vec![],
                trust_dns_resolver::config::NameServerConfigGroup::from_ips_clear(&config.dns_resolvers, 53, true),
            );
            let mut resolver_opts = trust_dns_resolver::config::ResolverOpts::default();
            resolver_opts.timeout = timeout;
            trust_dns_resolver::TokioAsyncResolver::tokio(resolver_config, resolver_opts)
                .map_err(|e| format!("Unable to create DNS resolver: {}", e))?
        };

        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .referer(true)
            .timeout(timeout);
        let client = match &config.proxy {
            Some(proxy) => client.proxy(
                reqwest::Proxy::all(proxy).map_err(|e| format!("Invalid validation proxy: {}", e))?
            ),
            None => client.no_proxy(),
        };
        let client = client.build()
            .map_err(|e| format!("Unable to build HTTP client: {}", e))?;

        Ok(Validator {
            dns_resolver: Box::new(resolver),
            reqwest_client: client,
            http01_port: config.http01_port,
            timeout,
        })
    }

    pub fn with_resolver(mut self, resolver: Box<dyn TxtResolver>) -> Self {
        self.dns_resolver = resolver;
        self
    }

    /// Proves control of `identifier` with the given challenge. The error is a human readable reason.
    pub async fn validate(
        &self, identifier: &types::identifier::Identifier, challenge_type: types::challenge::Type,
        token: &str, thumbprint: &str,
    ) -> Result<(), String> {
        let key_auth = key_authorization(token, thumbprint);
        let check = async {
            match challenge_type {
                types::challenge::Type::HTTP01 => self.check_http01(identifier, token, &key_auth).await,
                types::challenge::Type::DNS01 => self.check_dns01(identifier, &key_auth).await,
            }
        };
        match tokio::time::timeout(self.timeout, check).await {
            Ok(r) => r,
            Err(_) => Err(format!("Validation of {} timed out", identifier.value)),
        }
    }

    pub async fn check_http01(
        &self, identifier: &types::identifier::Identifier, token: &str, key_auth: &str,
    ) -> Result<(), String> {
        let host = match types::identifier::Type::from_str(&identifier.id_type) {
            Some(types::identifier::Type::DNS) => {
                if identifier.is_wildcard() {
                    return Err("http-01 cannot be used for wildcard identifiers".to_string());
                }
                identifier.value.clone()
            }
            Some(types::identifier::Type::IP) => match identifier.value.parse::<std::net::IpAddr>() {
                Ok(std::net::IpAddr::V4(ipv4)) => ipv4.to_string(),
                Ok(std::net::IpAddr::V6(ipv6)) => format!("[{}]", ipv6),
                Err(_) => return Err("Invalid IP address".to_string()),
            },
            None => return Err("Unsupported identifier type".to_string()),
        };
        let test_uri = format!("http://{}:{}/.well-known/acme-challenge/{}", host, self.http01_port, token);
        let test_uri = reqwest::Url::parse(&test_uri).map_err(|_| "Invalid URI".to_string())?;

        let resp = match self.reqwest_client.get(test_uri).send().await {
            Ok(u) => u,
            Err(err) => {
                return Err(if err.is_timeout() {
                    "Connection timed out"
                } else if err.is_connect() {
                    "Connection refused"
                } else if err.is_redirect() {
                    "Too many redirects"
                } else {
                    "Unknown request error"
                }.to_string());
            }
        };
        if !resp.status().is_success() {
            return Err(format!("HTTP {} received", resp.status().as_str()));
        }
        let resp_txt = match resp.text().await {
            Ok(u) => u.trim().to_string(),
            Err(_) => return Err("Text charset error".to_string()),
        };

        let received_token = resp_txt.split('.').next().unwrap_or_default();
        if received_token != token {
            return Err(format!("Expected token '{}', received '{}'", token, received_token));
        }
        if resp_txt != key_auth {
            return Err(format!("Expected '{}', received '{}'", key_auth, resp_txt));
        }
        Ok(())
    }

    pub async fn check_dns01(
        &self, identifier: &types::identifier::Identifier, key_auth: &str,
    ) -> Result<(), String> {
        if types::identifier::Type::from_str(&identifier.id_type) != Some(types::identifier::Type::DNS) {
            return Err("dns-01 must not be used for IP addresses".to_string());
        }
        let key_auth_hash = crate::util::sha256_b64(key_auth.as_bytes())
            .map_err(|e| format!("Unable to hash key authorization: {}", e))?;

        let domain = identifier.value.trim_start_matches("*.").trim_end_matches('.');
        let search_domain = format!("_acme-challenge.{}.", domain);
        let records = self.dns_resolver.txt_records(&search_domain).await?;
        if records.is_empty() {
            return Err(format!("No TXT records found for {}", search_domain));
        }
        if records.iter().any(|r| r == &key_auth_hash) {
            Ok(())
        } else {
            Err(format!("No TXT records found for {} with the value '{}'", search_domain, key_auth_hash))
        }
    }
}

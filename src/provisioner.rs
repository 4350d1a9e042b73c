//! Issuing CAs and the ACME directories that front them.
//!
//! Each provisioner is served under `/acme/<name>/` with its own issuer and identifier policy.
//! The registry is built once at startup and shared read-only afterwards.

use crate::config::ProvisionerConfig;

pub struct Issuer {
    pub certificate: openssl::x509::X509,
    pub key: openssl::pkey::PKey<openssl::pkey::Private>,
    /// Intermediates appended after the issuer certificate in served chains.
    pub chain: Vec<openssl::x509::X509>,
    pub not_after: chrono::DateTime<chrono::Utc>,
}

impl Issuer {
    pub fn new(
        certificate: openssl::x509::X509, key: openssl::pkey::PKey<openssl::pkey::Private>,
        chain: Vec<openssl::x509::X509>,
    ) -> Result<Self, String> {
        let cert_key = certificate.public_key()
            .map_err(|e| format!("Unable to read issuer public key: {}", e))?;
        if !cert_key.public_eq(&key) {
            return Err("Issuer key does not match issuer certificate".to_string());
        }
        let not_after = crate::util::asn1_time_to_chrono(certificate.not_after())
            .map_err(|e| format!("Invalid issuer expiry: {}", e))?;

        Ok(Issuer {
            certificate,
            key,
            chain,
            not_after,
        })
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], chain_pem: Option<&[u8]>) -> Result<Self, String> {
        let certificate = openssl::x509::X509::from_pem(cert_pem)
            .map_err(|e| format!("Unable to parse issuer certificate: {}", e))?;
        let key = openssl::pkey::PKey::private_key_from_pem(key_pem)
            .map_err(|e| format!("Unable to parse issuer key: {}", e))?;
        let chain = match chain_pem {
            Some(c) => openssl::x509::X509::stack_from_pem(c)
                .map_err(|e| format!("Unable to parse issuer chain: {}", e))?,
            None => vec![],
        };
        Self::new(certificate, key, chain)
    }
}

impl std::fmt::Debug for Issuer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("Issuer")
            .field("certificate", &self.certificate.subject_name())
            .field("chain", &self.chain.len())
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub cert_validity: chrono::Duration,
    pub allow_wildcards: bool,
    pub allow_ip: bool,
    pub domain_suffixes: Vec<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            cert_validity: chrono::Duration::days(90),
            allow_wildcards: false,
            allow_ip: false,
            domain_suffixes: vec![],
        }
    }
}

#[derive(Debug)]
pub struct Provisioner {
    pub name: String,
    pub issuer: Issuer,
    pub policy: Policy,
}

impl Provisioner {
    pub fn load(config: &ProvisionerConfig) -> Result<Self, String> {
        let read = |path: &std::path::Path| std::fs::read(path)
            .map_err(|e| format!("Unable to read '{}': {}", path.display(), e));

        let chain = match &config.ca_chain {
            Some(p) => Some(read(p)?),
            None => None,
        };
        let issuer = Issuer::from_pem(&read(&config.ca_cert)?, &read(&config.ca_key)?, chain.as_deref())
            .map_err(|e| format!("Provisioner '{}': {}", config.name, e))?;

        Ok(Provisioner {
            name: config.name.clone(),
            issuer,
            policy: Policy {
                cert_validity: chrono::Duration::days(config.cert_validity_days as i64),
                allow_wildcards: config.allow_wildcards,
                allow_ip: config.allow_ip,
                domain_suffixes: config.domain_suffixes.iter()
                    .map(|s| s.trim_matches('.').to_ascii_lowercase())
                    .collect(),
            },
        })
    }
}

#[derive(Debug, Default)]
pub struct ProvisionerRegistry {
    provisioners: std::collections::HashMap<String, Provisioner>,
}

impl ProvisionerRegistry {
    pub fn new(provisioners: Vec<Provisioner>) -> Self {
        ProvisionerRegistry {
            provisioners: provisioners.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    pub fn from_config(configs: &[ProvisionerConfig]) -> Result<Self, String> {
        let provisioners = configs.iter()
            .map(Provisioner::load)
            .collect::<Result<Vec<_>, _>>()?;
        for provisioner in &provisioners {
            info!(
                "Loaded provisioner '{}', issuer valid until {}",
                provisioner.name, provisioner.issuer.not_after
            );
        }
        Ok(Self::new(provisioners))
    }

    pub fn get(&self, name: &str) -> Option<&Provisioner> {
        self.provisioners.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.provisioners.keys().map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_issuer_from_pem() {
        let (cert, key) = testing::generate_ca("Test CA", 365);
        let issuer = Issuer::from_pem(
            &cert.to_pem().unwrap(), &key.private_key_to_pem_pkcs8().unwrap(), None,
        ).unwrap();
        let expected = chrono::Utc::now() + chrono::Duration::days(365);
        assert!((issuer.not_after - expected).num_seconds().abs() < 60);
        assert!(issuer.chain.is_empty());
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let (cert, _) = testing::generate_ca("Test CA", 365);
        let (_, other_key) = testing::generate_ca("Other CA", 365);
        assert!(Issuer::new(cert, other_key, vec![]).is_err());
    }

    #[test]
    fn test_load_from_files() {
        let dir = std::env::temp_dir().join(format!("bjorn-provisioner-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let (cert, key) = testing::generate_ca("Test CA", 365);
        std::fs::write(dir.join("ca.pem"), cert.to_pem().unwrap()).unwrap();
        std::fs::write(dir.join("ca.key"), key.private_key_to_pem_pkcs8().unwrap()).unwrap();

        let registry = ProvisionerRegistry::from_config(&[ProvisionerConfig {
            name: "default".to_string(),
            ca_cert: dir.join("ca.pem"),
            ca_key: dir.join("ca.key"),
            ca_chain: None,
            cert_validity_days: 30,
            allow_wildcards: true,
            allow_ip: false,
            domain_suffixes: vec![".Example.com".to_string()],
        }]).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        let provisioner = registry.get("default").unwrap();
        assert_eq!(provisioner.policy.cert_validity, chrono::Duration::days(30));
        assert_eq!(provisioner.policy.domain_suffixes, vec!["example.com".to_string()]);
        assert!(registry.get("other").is_none());
    }
}

use crate::types;

pub mod csr;

pub use crate::store::IssuedCertificate;

/// Hex form of a certificate serial, as stored against the order and used for revocation lookups.
pub fn serial_hex(serial: &openssl::bn::BigNumRef) -> Result<String, openssl::error::ErrorStack> {
    Ok(serial.to_hex_str()?.to_string())
}

fn asn1_time(time: chrono::DateTime<chrono::Utc>) -> Result<openssl::asn1::Asn1Time, openssl::error::ErrorStack> {
    openssl::asn1::Asn1Time::from_unix(time.timestamp())
}

/// Signs leaf certificates for one issuer.
pub struct CertificateFactory<'a> {
    issuer: &'a crate::provisioner::Issuer,
}

impl<'a> CertificateFactory<'a> {
    pub fn new(issuer: &'a crate::provisioner::Issuer) -> Self {
        CertificateFactory {
            issuer,
        }
    }

    /// Issues a certificate for `identifiers` over the key in `csr_der`.
    ///
    /// Every name the CSR asks for must be among `identifiers`; the certificate lists exactly
    /// `identifiers`. `not_after` is cut back to the issuer's own expiry.
    pub fn issue(
        &self, csr_der: &[u8], identifiers: &[types::identifier::Identifier],
        not_before: chrono::DateTime<chrono::Utc>, not_after: chrono::DateTime<chrono::Utc>,
    ) -> crate::acme::ACMEResult<IssuedCertificate> {
        let parsed = csr::parse_csr(csr_der)?;
        if identifiers.is_empty() {
            return Err(types::error::Error::bad_csr("No verified identifiers to issue for"));
        }
        for requested in &parsed.identifiers {
            if !identifiers.contains(requested) {
                return Err(types::error::Error::bad_csr(format!(
                    "CSR requests '{}' which has not been authorized", requested.value
                )).with_identifier(requested.clone()));
            }
        }

        let not_after = std::cmp::min(not_after, self.issuer.not_after);
        if not_after <= not_before {
            error!("Issuer expires at {}, unable to issue a certificate starting {}", self.issuer.not_after, not_before);
            return Err(crate::internal_server_error!());
        }

        let certificate_id = uuid::Uuid::new_v4();
        match self.build(certificate_id, &parsed.public_key, identifiers, not_before, not_after) {
            Ok((serial_number, pem_chain)) => Ok(IssuedCertificate {
                certificate_id,
                serial_number,
                pem_chain,
                not_before,
                not_after,
            }),
            Err(err) => {
                error!("Unable to sign certificate: {}", err);
                Err(crate::internal_server_error!())
            }
        }
    }

    fn build(
        &self, certificate_id: uuid::Uuid, public_key: &openssl::pkey::PKeyRef<openssl::pkey::Public>,
        identifiers: &[types::identifier::Identifier],
        not_before: chrono::DateTime<chrono::Utc>, not_after: chrono::DateTime<chrono::Utc>,
    ) -> Result<(String, String), openssl::error::ErrorStack> {
        let serial = openssl::bn::BigNum::from_slice(certificate_id.as_bytes())?;
        let subject = openssl::x509::X509NameBuilder::new()?.build();

        let mut builder = openssl::x509::X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_serial_number(&*serial.to_asn1_integer()?)?;
        builder.set_subject_name(&subject)?;
        builder.set_issuer_name(self.issuer.certificate.subject_name())?;
        builder.set_pubkey(public_key)?;
        builder.set_not_before(&*asn1_time(not_before)?)?;
        builder.set_not_after(&*asn1_time(not_after)?)?;

        builder.append_extension(openssl::x509::extension::BasicConstraints::new().critical().build()?)?;

        let mut key_usage = openssl::x509::extension::KeyUsage::new();
        key_usage.critical().digital_signature();
        if public_key.id() == openssl::pkey::Id::RSA {
            key_usage.key_encipherment();
        }
        builder.append_extension(key_usage.build()?)?;
        builder.append_extension(openssl::x509::extension::ExtendedKeyUsage::new()
            .server_auth()
            .client_auth()
            .build()?)?;

        let mut san = openssl::x509::extension::SubjectAlternativeName::new();
        san.critical();
        for identifier in identifiers {
            match types::identifier::Type::from_str(&identifier.id_type) {
                Some(types::identifier::Type::IP) => san.ip(&identifier.value),
                _ => san.dns(&identifier.value),
            };
        }
        let san = san.build(&builder.x509v3_context(Some(&self.issuer.certificate), None))?;
        builder.append_extension(san)?;

        let ski = openssl::x509::extension::SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(Some(&self.issuer.certificate), None))?;
        builder.append_extension(ski)?;
        let aki = openssl::x509::extension::AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(&self.issuer.certificate), None))?;
        builder.append_extension(aki)?;

        builder.sign(&self.issuer.key, openssl::hash::MessageDigest::sha256())?;
        let certificate = builder.build();

        let mut pem_chain = String::from_utf8_lossy(&certificate.to_pem()?).into_owned();
        pem_chain.push_str(&String::from_utf8_lossy(&self.issuer.certificate.to_pem()?));
        for intermediate in &self.issuer.chain {
            pem_chain.push_str(&String::from_utf8_lossy(&intermediate.to_pem()?));
        }

        Ok((serial_hex(&serial)?, pem_chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn leaf(issued: &IssuedCertificate) -> openssl::x509::X509 {
        openssl::x509::X509::stack_from_pem(issued.pem_chain.as_bytes()).unwrap().remove(0)
    }

    #[test]
    fn test_issues_for_verified_identifiers() {
        let issuer = testing::issuer(365);
        let key = testing::ec_key();
        let csr = testing::csr_der(&key, None, &["example.com"], &["192.0.2.1"]);
        let identifiers = vec![
            types::identifier::Identifier::dns("example.com"),
            types::identifier::Identifier::ip("192.0.2.1".parse().unwrap()),
        ];
        let now = chrono::Utc::now();

        let issued = CertificateFactory::new(&issuer)
            .issue(&csr, &identifiers, now, now + chrono::Duration::days(30))
            .unwrap();
        let cert = leaf(&issued);

        assert!(cert.verify(&issuer.certificate.public_key().unwrap()).unwrap());
        assert!(cert.public_key().unwrap().public_eq(&key));
        assert_eq!(cert.subject_name().entries().count(), 0);
        let sans = cert.subject_alt_names().unwrap();
        assert_eq!(sans.len(), 2);
        assert!(sans.iter().any(|n| n.dnsname() == Some("example.com")));
        assert!(sans.iter().any(|n| n.ipaddress() == Some(&[192, 0, 2, 1][..])));
        assert_eq!(serial_hex(&cert.serial_number().to_bn().unwrap()).unwrap(), issued.serial_number);
        assert_eq!(openssl::x509::X509::stack_from_pem(issued.pem_chain.as_bytes()).unwrap().len(), 2);
    }

    #[test]
    fn test_not_after_clamped_to_issuer() {
        let issuer = testing::issuer(10);
        let key = testing::ec_key();
        let csr = testing::csr_der(&key, None, &["example.com"], &[]);
        let now = chrono::Utc::now();

        let issued = CertificateFactory::new(&issuer)
            .issue(&csr, &[types::identifier::Identifier::dns("example.com")], now, now + chrono::Duration::days(90))
            .unwrap();
        assert_eq!(issued.not_after, issuer.not_after);
        let cert = leaf(&issued);
        assert_eq!(crate::util::asn1_time_to_chrono(cert.not_after()).unwrap(), issuer.not_after);
    }

    #[test]
    fn test_unauthorized_name_rejected() {
        let issuer = testing::issuer(365);
        let key = testing::ec_key();
        let csr = testing::csr_der(&key, None, &["example.com", "evil.example"], &[]);
        let now = chrono::Utc::now();

        let err = CertificateFactory::new(&issuer)
            .issue(&csr, &[types::identifier::Identifier::dns("example.com")], now, now + chrono::Duration::days(30))
            .unwrap_err();
        assert_eq!(err.error_type, types::error::Type::BadCSR);
        assert_eq!(err.identifier, Some(types::identifier::Identifier::dns("evil.example")));
    }
}

use crate::types;
use x509_parser::prelude::FromDer;

#[derive(Debug)]
pub struct ParsedCsr {
    pub public_key: openssl::pkey::PKey<openssl::pkey::Public>,
    /// Names from the subject CN and the requested SAN extension, deduplicated.
    pub identifiers: Vec<types::identifier::Identifier>,
}

fn ip_from_octets(octets: &[u8]) -> Option<std::net::IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(octets) {
        Some(std::net::IpAddr::from(v4))
    } else if let Ok(v6) = <[u8; 16]>::try_from(octets) {
        Some(std::net::IpAddr::from(v6))
    } else {
        None
    }
}

fn name_to_identifier(name: &str) -> types::identifier::Identifier {
    match name.parse::<std::net::IpAddr>() {
        Ok(ip) => types::identifier::Identifier::ip(ip),
        Err(_) => types::identifier::Identifier::dns(name.to_ascii_lowercase()),
    }
}

fn check_key(key: &openssl::pkey::PKeyRef<openssl::pkey::Public>) -> crate::acme::ACMEResult<()> {
    match key.id() {
        openssl::pkey::Id::RSA if key.bits() >= 2048 => Ok(()),
        openssl::pkey::Id::RSA => Err(types::error::Error::bad_csr(
            format!("RSA keys must be at least 2048 bits, got {}", key.bits())
        )),
        openssl::pkey::Id::EC => {
            let curve = key.ec_key().ok().and_then(|k| k.group().curve_name());
            match curve {
                Some(openssl::nid::Nid::X9_62_PRIME256V1) | Some(openssl::nid::Nid::SECP384R1) => Ok(()),
                _ => Err(types::error::Error::bad_csr("Only P-256 and P-384 EC keys are accepted")),
            }
        }
        _ => Err(types::error::Error::bad_csr("Unsupported CSR key type")),
    }
}

/// Parses a DER PKCS#10 request, checking its self-signature and key, and collects the names it asks for.
pub fn parse_csr(der: &[u8]) -> crate::acme::ACMEResult<ParsedCsr> {
    let req = openssl::x509::X509Req::from_der(der)
        .map_err(|_| types::error::Error::bad_csr("Unable to parse CSR"))?;
    let public_key = req.public_key()
        .map_err(|_| types::error::Error::bad_csr("Unable to read CSR public key"))?;
    match req.verify(&public_key) {
        Ok(true) => {}
        _ => return Err(types::error::Error::bad_csr("CSR signature does not verify")),
    }
    check_key(&public_key)?;

    let (_, csr) = x509_parser::certification_request::X509CertificationRequest::from_der(der)
        .map_err(|_| types::error::Error::bad_csr("Unable to parse CSR"))?;
    let info = &csr.certification_request_info;

    let mut identifiers = vec![];
    for cn in info.subject.iter_common_name() {
        let cn = cn.as_str()
            .map_err(|_| types::error::Error::bad_csr("CSR common name is not a string"))?;
        identifiers.push(name_to_identifier(cn));
    }

    let requested_exts = info.iter_attributes()
        .filter_map(|attr| {
            if let x509_parser::prelude::ParsedCriAttribute::ExtensionRequest(requested) = attr.parsed_attribute() {
                Some(requested.extensions.iter().collect::<Vec<_>>())
            } else {
                None
            }
        })
        .flatten()
        .collect::<Vec<_>>();

    for ext in requested_exts {
        if let x509_parser::extensions::ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                match name {
                    x509_parser::extensions::GeneralName::DNSName(n) => {
                        identifiers.push(types::identifier::Identifier::dns(n.to_ascii_lowercase()));
                    }
                    x509_parser::extensions::GeneralName::IPAddress(octets) => {
                        let ip = ip_from_octets(octets)
                            .ok_or_else(|| types::error::Error::bad_csr("Invalid IP address in CSR"))?;
                        identifiers.push(types::identifier::Identifier::ip(ip));
                    }
                    other => {
                        return Err(types::error::Error::bad_csr(format!("Unsupported SAN in CSR: {:?}", other)));
                    }
                }
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    identifiers.retain(|i| seen.insert(i.clone()));

    Ok(ParsedCsr {
        public_key,
        identifiers,
    })
}

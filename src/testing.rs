use base64::prelude::*;
use std::convert::TryFrom;

pub fn b64<D: AsRef<[u8]>>(data: D) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(data)
}

pub fn ec_key() -> openssl::pkey::PKey<openssl::pkey::Private> {
    let group = openssl::ec::EcGroup::from_curve_name(openssl::nid::Nid::X9_62_PRIME256V1).unwrap();
    openssl::pkey::PKey::from_ec_key(openssl::ec::EcKey::generate(&group).unwrap()).unwrap()
}

pub fn public_key(key: &openssl::pkey::PKeyRef<openssl::pkey::Private>) -> openssl::pkey::PKey<openssl::pkey::Public> {
    openssl::pkey::PKey::public_key_from_der(&key.public_key_to_der().unwrap()).unwrap()
}

pub enum KeyRef<'a> {
    Jwk,
    Kid(&'a str),
}

fn sign(key: &openssl::pkey::PKeyRef<openssl::pkey::Private>, input: &[u8]) -> (&'static str, Vec<u8>) {
    let mut signer = openssl::sign::Signer::new(openssl::hash::MessageDigest::sha256(), key).unwrap();
    let der = signer.sign_oneshot_to_vec(input).unwrap();
    match key.id() {
        openssl::pkey::Id::EC => {
            let sig = openssl::ecdsa::EcdsaSig::from_der(&der).unwrap();
            let mut raw = sig.r().to_vec_padded(32).unwrap();
            raw.extend(sig.s().to_vec_padded(32).unwrap());
            ("ES256", raw)
        }
        _ => ("RS256", der),
    }
}

fn sign_encoded(
    key: &openssl::pkey::PKeyRef<openssl::pkey::Private>, key_ref: KeyRef, nonce: Option<&str>, url: &str,
    payload: String,
) -> crate::types::jose::FlattenedJWS {
    let alg = match key.id() {
        openssl::pkey::Id::EC => "ES256",
        _ => "RS256",
    };
    let mut header = serde_json::json!({
        "alg": alg,
        "url": url,
    });
    if let Some(nonce) = nonce {
        header["nonce"] = serde_json::Value::String(nonce.to_string());
    }
    match key_ref {
        KeyRef::Jwk => {
            let jwk = crate::types::jose::JWK::try_from(&*public_key(key)).unwrap();
            header["jwk"] = serde_json::to_value(jwk).unwrap();
        }
        KeyRef::Kid(kid) => {
            header["kid"] = serde_json::Value::String(kid.to_string());
        }
    }
    let protected = b64(serde_json::to_vec(&header).unwrap());
    let (_, signature) = sign(key, format!("{}.{}", protected, payload).as_bytes());

    crate::types::jose::FlattenedJWS {
        payload,
        protected,
        signature: b64(signature),
    }
}

pub fn sign_jws(
    key: &openssl::pkey::PKeyRef<openssl::pkey::Private>, key_ref: KeyRef, nonce: Option<&str>, url: &str,
    payload: &serde_json::Value,
) -> crate::types::jose::FlattenedJWS {
    sign_encoded(key, key_ref, nonce, url, b64(serde_json::to_vec(payload).unwrap()))
}

pub fn sign_post_as_get(
    key: &openssl::pkey::PKeyRef<openssl::pkey::Private>, kid: &str, nonce: &str, url: &str,
) -> crate::types::jose::FlattenedJWS {
    sign_encoded(key, KeyRef::Kid(kid), Some(nonce), url, String::new())
}

pub fn account_record(key: &openssl::pkey::PKeyRef<openssl::pkey::Private>) -> crate::store::AccountRecord {
    crate::store::AccountRecord {
        id: uuid::Uuid::new_v4(),
        created_at: chrono::Utc::now(),
        public_key: key.public_key_to_der().unwrap(),
        emails: vec!["admin@example.com".to_string()],
        deactivated: false,
    }
}

pub fn generate_ca(name: &str, days: u32) -> (openssl::x509::X509, openssl::pkey::PKey<openssl::pkey::Private>) {
    let key = ec_key();

    let mut subject = openssl::x509::X509NameBuilder::new().unwrap();
    subject.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, name).unwrap();
    let subject = subject.build();

    let mut serial = openssl::bn::BigNum::new().unwrap();
    serial.rand(127, openssl::bn::MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = openssl::x509::X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    builder.set_subject_name(&subject).unwrap();
    builder.set_issuer_name(&subject).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&openssl::asn1::Asn1Time::days_from_now(days).unwrap()).unwrap();
    builder.append_extension(openssl::x509::extension::BasicConstraints::new().critical().ca().build().unwrap()).unwrap();
    builder.append_extension(openssl::x509::extension::KeyUsage::new()
        .critical()
        .key_cert_sign()
        .crl_sign()
        .build().unwrap()).unwrap();
    let ski = openssl::x509::extension::SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(None, None)).unwrap();
    builder.append_extension(ski).unwrap();
    builder.sign(&key, openssl::hash::MessageDigest::sha256()).unwrap();

    (builder.build(), key)
}

pub fn issuer(days: u32) -> crate::provisioner::Issuer {
    let (cert, key) = generate_ca("Test CA", days);
    crate::provisioner::Issuer::new(cert, key, vec![]).unwrap()
}

pub fn provisioner(policy: crate::provisioner::Policy) -> crate::provisioner::Provisioner {
    crate::provisioner::Provisioner {
        name: "default".to_string(),
        issuer: issuer(365),
        policy,
    }
}

pub fn csr_der(
    key: &openssl::pkey::PKeyRef<openssl::pkey::Private>, cn: Option<&str>, dns: &[&str], ips: &[&str],
) -> Vec<u8> {
    let mut builder = openssl::x509::X509ReqBuilder::new().unwrap();
    builder.set_version(0).unwrap();
    let mut subject = openssl::x509::X509NameBuilder::new().unwrap();
    if let Some(cn) = cn {
        subject.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, cn).unwrap();
    }
    builder.set_subject_name(&subject.build()).unwrap();
    builder.set_pubkey(key).unwrap();

    if !dns.is_empty() || !ips.is_empty() {
        let mut san = openssl::x509::extension::SubjectAlternativeName::new();
        for name in dns {
            san.dns(name);
        }
        for ip in ips {
            san.ip(ip);
        }
        let san = san.build(&builder.x509v3_context(None)).unwrap();
        let mut extensions = openssl::stack::Stack::new().unwrap();
        extensions.push(san).unwrap();
        builder.add_extensions(&extensions).unwrap();
    }

    builder.sign(key, openssl::hash::MessageDigest::sha256()).unwrap();
    builder.build().to_der().unwrap()
}

/// Serves `body` as the response to every HTTP request on a fresh loopback port.
pub async fn serve_http01(body: String) -> u16 {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => return,
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(), body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    port
}

#[derive(Default)]
pub struct FakeResolver {
    records: std::collections::HashMap<String, Vec<String>>,
}

impl FakeResolver {
    pub fn with_txt(mut self, name: &str, values: &[&str]) -> Self {
        self.records.insert(name.to_string(), values.iter().map(|v| v.to_string()).collect());
        self
    }
}

#[rocket::async_trait]
impl crate::validator::TxtResolver for FakeResolver {
    async fn txt_records(&self, name: &str) -> Result<Vec<String>, String> {
        Ok(self.records.get(name).cloned().unwrap_or_default())
    }
}

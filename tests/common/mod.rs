use base64::prelude::*;
use bjorn_ca::types;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const BASE: &str = "http://localhost:8000";

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

pub fn jwk(key: &openssl::pkey::PKeyRef<openssl::pkey::Private>) -> serde_json::Value {
    serde_json::to_value(types::jose::JWK::try_from(&*public_key(key)).unwrap()).unwrap()
}

pub fn thumbprint(key: &openssl::pkey::PKeyRef<openssl::pkey::Private>) -> String {
    bjorn_ca::acme::jws::make_jwk_thumbprint(&public_key(key)).unwrap()
}

pub enum Signer<'a> {
    Jwk,
    Kid(&'a str),
}

/// A flattened ES256 JWS. `payload: None` is a POST-as-GET.
pub fn sign(
    key: &openssl::pkey::PKeyRef<openssl::pkey::Private>, signer: Signer, nonce: Option<&str>, url: &str,
    payload: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut header = serde_json::json!({
        "alg": "ES256",
        "url": url,
    });
    if let Some(nonce) = nonce {
        header["nonce"] = nonce.into();
    }
    match signer {
        Signer::Jwk => header["jwk"] = jwk(key),
        Signer::Kid(kid) => header["kid"] = kid.into(),
    }
    let protected = b64(serde_json::to_vec(&header).unwrap());
    let payload = match payload {
        Some(p) => b64(serde_json::to_vec(p).unwrap()),
        None => String::new(),
    };

    let mut signer = openssl::sign::Signer::new(openssl::hash::MessageDigest::sha256(), key).unwrap();
    let der = signer.sign_oneshot_to_vec(format!("{}.{}", protected, payload).as_bytes()).unwrap();
    let sig = openssl::ecdsa::EcdsaSig::from_der(&der).unwrap();
    let mut raw = sig.r().to_vec_padded(32).unwrap();
    raw.extend(sig.s().to_vec_padded(32).unwrap());

    serde_json::json!({
        "protected": protected,
        "payload": payload,
        "signature": b64(raw),
    })
}

pub fn generate_ca() -> (openssl::x509::X509, openssl::pkey::PKey<openssl::pkey::Private>) {
    let key = ec_key();
    let mut subject = openssl::x509::X509NameBuilder::new().unwrap();
    subject.append_entry_by_nid(openssl::nid::Nid::COMMONNAME, "Integration CA").unwrap();
    let subject = subject.build();

    let mut builder = openssl::x509::X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&openssl::bn::BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap()).unwrap();
    builder.set_subject_name(&subject).unwrap();
    builder.set_issuer_name(&subject).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&openssl::asn1::Asn1Time::days_from_now(365).unwrap()).unwrap();
    builder.append_extension(openssl::x509::extension::BasicConstraints::new().critical().ca().build().unwrap()).unwrap();
    let ski = openssl::x509::extension::SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(None, None)).unwrap();
    builder.append_extension(ski).unwrap();
    builder.sign(&key, openssl::hash::MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

pub fn csr(key: &openssl::pkey::PKeyRef<openssl::pkey::Private>, names: &[&str]) -> String {
    let mut builder = openssl::x509::X509ReqBuilder::new().unwrap();
    builder.set_pubkey(key).unwrap();
    let mut san = openssl::x509::extension::SubjectAlternativeName::new();
    for name in names {
        san.dns(name);
    }
    let san = san.build(&builder.x509v3_context(None)).unwrap();
    let mut extensions = openssl::stack::Stack::new().unwrap();
    extensions.push(san).unwrap();
    builder.add_extensions(&extensions).unwrap();
    builder.sign(key, openssl::hash::MessageDigest::sha256()).unwrap();
    b64(builder.build().to_der().unwrap())
}

#[derive(Clone, Default)]
pub struct SharedTxt {
    records: Arc<Mutex<HashMap<String, Vec<String>>>>,
    lookups: Arc<AtomicUsize>,
}

impl SharedTxt {
    pub fn set(&self, name: &str, value: String) {
        self.records.lock().unwrap().insert(name.to_string(), vec![value]);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[rocket::async_trait]
impl bjorn_ca::validator::TxtResolver for SharedTxt {
    async fn txt_records(&self, name: &str) -> Result<Vec<String>, String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.lock().unwrap().get(name).cloned().unwrap_or_default())
    }
}

/// Answers every HTTP request with whatever body is currently set.
#[derive(Clone, Default)]
pub struct HttpResponder {
    body: Arc<Mutex<String>>,
    hits: Arc<AtomicUsize>,
}

impl HttpResponder {
    pub async fn bind(&self) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let body = self.body.clone();
        let hits = self.hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                hits.fetch_add(1, Ordering::SeqCst);
                let body = body.lock().unwrap().clone();
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

    pub fn set(&self, body: String) {
        *self.body.lock().unwrap() = body;
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub struct Reply {
    pub status: rocket::http::Status,
    pub location: Option<String>,
    pub links: Vec<String>,
    pub content_type: Option<String>,
    pub body: String,
}

impl Reply {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

pub struct TestCa {
    pub client: rocket::local::asynchronous::Client,
    pub store: Arc<bjorn_ca::store::MemoryStore>,
    pub pipeline: bjorn_ca::issuance::IssuancePipeline,
    pub txt: SharedTxt,
    pub http: HttpResponder,
}

impl TestCa {
    pub async fn new() -> Self {
        let http = HttpResponder::default();
        let port = http.bind().await;
        let txt = SharedTxt::default();

        let (cert, key) = generate_ca();
        let provisioners = bjorn_ca::provisioner::ProvisionerRegistry::new(vec![bjorn_ca::provisioner::Provisioner {
            name: "default".to_string(),
            issuer: bjorn_ca::provisioner::Issuer::new(cert, key, vec![]).unwrap(),
            policy: bjorn_ca::provisioner::Policy {
                allow_wildcards: true,
                allow_ip: true,
                ..Default::default()
            },
        }]);
        let validator = bjorn_ca::validator::Validator::new(&bjorn_ca::config::ValidationConfig {
            timeout: 5,
            http01_port: port,
            proxy: None,
            dns_resolvers: vec!["127.0.0.1".parse().unwrap()],
        }).unwrap().with_resolver(Box::new(txt.clone()));

        let config = bjorn_ca::config::Config {
            external_uri: BASE.to_string(),
            ..Default::default()
        };
        let store = Arc::new(bjorn_ca::store::MemoryStore::new());
        let context = bjorn_ca::acme::Context::new(config, store.clone(), provisioners, validator);
        let pipeline = bjorn_ca::issuance::IssuancePipeline::from_context(&context);

        let client = rocket::local::asynchronous::Client::tracked(
            bjorn_ca::acme::server(rocket::build(), context)
        ).await.unwrap();

        TestCa {
            client,
            store,
            pipeline,
            txt,
            http,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/acme/default{}", BASE, path)
    }

    pub async fn nonce(&self) -> String {
        let response = self.client.head("/acme/default/acme/new-nonce").dispatch().await;
        assert_eq!(response.status(), rocket::http::Status::Ok);
        response.headers().get_one("Replay-Nonce").unwrap().to_string()
    }

    pub async fn post_body(&self, url: &str, body: &serde_json::Value) -> Reply {
        let path = url.strip_prefix(BASE).unwrap().to_string();
        let response = self.client.post(path)
            .header(rocket::http::ContentType::new("application", "jose+json"))
            .body(body.to_string())
            .dispatch().await;
        Reply {
            status: response.status(),
            location: response.headers().get_one("Location").map(str::to_string),
            links: response.headers().get("Link").map(str::to_string).collect(),
            content_type: response.headers().get_one("Content-Type").map(str::to_string),
            body: response.into_string().await.unwrap_or_default(),
        }
    }

    pub async fn post(
        &self, key: &openssl::pkey::PKeyRef<openssl::pkey::Private>, signer: Signer<'_>, url: &str,
        payload: Option<&serde_json::Value>,
    ) -> Reply {
        let nonce = self.nonce().await;
        let body = sign(key, signer, Some(&nonce), url, payload);
        self.post_body(url, &body).await
    }

    /// Registers `key` and returns the account URL.
    pub async fn new_account(&self, key: &openssl::pkey::PKeyRef<openssl::pkey::Private>) -> String {
        let reply = self.post(key, Signer::Jwk, &self.url("/acme/new-acct"), Some(&serde_json::json!({
            "termsOfServiceAgreed": true,
            "contact": ["mailto:admin@example.com"],
        }))).await;
        assert_eq!(reply.status, rocket::http::Status::Created);
        reply.location.unwrap()
    }

    /// Places an order for DNS names and returns its URL and body.
    pub async fn new_order(
        &self, key: &openssl::pkey::PKeyRef<openssl::pkey::Private>, kid: &str, identifiers: serde_json::Value,
    ) -> (String, serde_json::Value) {
        let reply = self.post(key, Signer::Kid(kid), &self.url("/acme/new-order"), Some(&serde_json::json!({
            "identifiers": identifiers,
        }))).await;
        assert_eq!(reply.status, rocket::http::Status::Created, "{}", reply.body);
        (reply.location.clone().unwrap(), reply.json())
    }

    /// Stores a pending order for `kid` whose single authorization offers `challenge_type`,
    /// bypassing the rules that pick which challenges an identifier gets. Returns the challenge URL.
    pub async fn insert_authorization(
        &self, kid: &str, id_type: bjorn_ca::store::IdentifierType, value: &str,
        challenge_type: bjorn_ca::store::ChallengeType,
    ) -> String {
        use bjorn_ca::store::Store;

        let account_id = bjorn_ca::util::b64_to_uuid(kid.rsplit('/').next().unwrap()).unwrap();
        let now = chrono::Utc::now();
        let order = bjorn_ca::store::OrderRecord::new(
            account_id, "default", now, now + chrono::Duration::days(90), now + chrono::Duration::days(1),
        );
        let authorization_id = uuid::Uuid::new_v4();
        let challenge = bjorn_ca::store::ChallengeRecord {
            id: uuid::Uuid::new_v4(),
            authorization_id,
            challenge_type,
            token: "dG9rZW4".to_string(),
            status: bjorn_ca::store::ChallengeStatus::Pending,
            verified_at: None,
        };
        let authorization = bjorn_ca::store::AuthorizationRecord {
            identifier: bjorn_ca::store::IdentifierRecord {
                authorization_id,
                order_id: order.id,
                id_type,
                value: value.to_string(),
            },
            challenges: vec![challenge.clone()],
        };
        self.store.insert_order(&order, &[authorization]).await.unwrap();
        self.url(&format!(
            "/acme/chall/{}/{}", bjorn_ca::util::uuid_as_b64(&challenge.id),
            types::challenge::Type::from(challenge_type).as_str(),
        ))
    }

    /// Completes dns-01 for the authorization at `authz_url`.
    pub async fn complete_dns01(
        &self, key: &openssl::pkey::PKeyRef<openssl::pkey::Private>, kid: &str, authz_url: &str,
    ) -> Reply {
        let authz = self.post(key, Signer::Kid(kid), authz_url, None).await.json();
        let domain = authz["identifier"]["value"].as_str().unwrap();
        let challenge = authz["challenges"].as_array().unwrap().iter()
            .find(|c| c["type"] == "dns-01")
            .unwrap();
        let key_auth = format!("{}.{}", challenge["token"].as_str().unwrap(), thumbprint(key));
        self.txt.set(
            &format!("_acme-challenge.{}.", domain),
            bjorn_ca::util::sha256_b64(key_auth.as_bytes()).unwrap(),
        );
        self.post(key, Signer::Kid(kid), challenge["url"].as_str().unwrap(), Some(&serde_json::json!({}))).await
    }
}

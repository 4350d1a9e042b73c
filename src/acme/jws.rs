use crate::types;
use crate::types::jose::{FlattenedJWS, JWSProtectedHeader};
use std::convert::TryFrom;

#[derive(Debug)]
pub enum JWSRequestKey {
    JWK {
        kid: Option<String>,
        key: openssl::pkey::PKey<openssl::pkey::Public>,
    },
    KID(super::Account),
}

#[derive(Debug)]
pub struct JWSRequest<R> {
    pub payload: Option<R>,
    pub key: JWSRequestKey,
    pub url: String,
}

/// A JWS carried inside another one's payload, as used by key roll-over.
#[derive(Debug)]
pub struct JWSRequestInner<R> {
    pub payload: R,
    pub key: openssl::pkey::PKey<openssl::pkey::Public>,
}

fn invalid_jws<D: Into<String>>(detail: D) -> types::error::Error {
    types::error::Error::new(types::error::Type::Malformed, "Invalid JWS", detail)
}

fn signature_mismatch() -> types::error::Error {
    types::error::Error::new(
        types::error::Type::BadSignatureAlgorithm, "Invalid JWS signature", "The JWS signature does not match",
    )
}

async fn get_flattened_jws(
    request: &rocket::request::Request<'_>, data: rocket::data::Data<'_>,
) -> Result<FlattenedJWS, types::error::Error> {
    let ct = request.headers().get_one("Content-Type").unwrap_or_default();
    if ct != "application/jose+json" {
        return Err(types::error::Error::new(
            types::error::Type::Malformed, "Invalid content type",
            format!("'{}' is not an expected body content type", ct),
        ).with_status(415));
    }
    let body = match data.open(4 * rocket::data::ByteUnit::MiB).into_string().await {
        Ok(v) => v,
        Err(err) => {
            return Err(types::error::Error::new(
                types::error::Type::Malformed, "Invalid UTF8", format!("Invalid UTF8 received in body: '{}'", err),
            ));
        }
    };
    serde_json::from_str::<FlattenedJWS>(&body)
        .map_err(|err| invalid_jws(format!("Invalid JWS received in body: '{}'", err)))
}

/// Splits a flattened JWS into its decoded header, payload and signature.
pub fn start_decode_jws(jws: &FlattenedJWS) -> super::ACMEResult<(JWSProtectedHeader, Vec<u8>, Vec<u8>)> {
    let header_bytes = crate::util::decode_b64_url(&jws.protected)
        .map_err(|err| invalid_jws(format!("Invalid JWS header: '{}'", err)))?;
    let signature_bytes = crate::util::decode_b64_url(&jws.signature)
        .map_err(|err| invalid_jws(format!("Invalid JWS signature: '{}'", err)))?;
    let payload_bytes = crate::util::decode_b64_url(&jws.payload)
        .map_err(|err| invalid_jws(format!("Invalid JWS payload: '{}'", err)))?;

    let header = serde_json::from_slice::<JWSProtectedHeader>(&header_bytes)
        .map_err(|err| invalid_jws(format!("Invalid JWS header: '{}'", err)))?;

    let crit_vals = header.crit.as_deref().unwrap_or_default();
    if !crit_vals.is_empty() {
        return Err(invalid_jws(format!("Unsupported critical constraints: {:?}", crit_vals)));
    }
    if !header.b64.unwrap_or(true) {
        return Err(invalid_jws("Unencoded payload not supported"));
    }

    Ok((header, payload_bytes, signature_bytes))
}

/// Parses a JWK supplied by a client, accepting only P-256 and RSA keys of at least 2048 bits.
pub fn parse_client_jwk(
    jwk: &types::jose::JWK,
) -> super::ACMEResult<openssl::pkey::PKey<openssl::pkey::Public>> {
    let bad_key = |detail: String| types::error::Error::new(
        types::error::Type::BadPublicKey, "Invalid public key", detail,
    );
    let key = openssl::pkey::PKey::<openssl::pkey::Public>::try_from(jwk).map_err(bad_key)?;
    match key.id() {
        openssl::pkey::Id::EC => {
            let curve = key.ec_key().ok().and_then(|k| k.group().curve_name());
            if curve != Some(openssl::nid::Nid::X9_62_PRIME256V1) {
                return Err(bad_key("Only P-256 EC keys are accepted".to_string()));
            }
        }
        openssl::pkey::Id::RSA => {
            if key.bits() < 2048 {
                return Err(bad_key(format!("RSA keys must be at least 2048 bits, got {}", key.bits())));
            }
        }
        _ => return Err(bad_key("Unsupported key type".to_string())),
    }
    Ok(key)
}

fn ecdsa_der_signature(signature: &[u8]) -> Result<Vec<u8>, openssl::error::ErrorStack> {
    let (r, s) = signature.split_at(signature.len() / 2);
    let r = openssl::bn::BigNum::from_slice(r)?;
    let s = openssl::bn::BigNum::from_slice(s)?;
    openssl::ecdsa::EcdsaSig::from_private_components(r, s)?.to_der()
}

/// Checks `alg` fits the key and that the signature covers `signing_input`.
pub fn verify_signature(
    alg: &str, key: &openssl::pkey::PKeyRef<openssl::pkey::Public>, signing_input: &[u8], signature: &[u8],
) -> super::ACMEResult<()> {
    let unfit = || types::error::Error::new(
        types::error::Type::BadSignatureAlgorithm, "Invalid JWS",
        format!("'{}' is not an appropriate algorithm for the given key", alg),
    );

    let signature = match alg {
        "RS256" => {
            if key.id() != openssl::pkey::Id::RSA {
                return Err(unfit());
            }
            signature.to_vec()
        }
        "ES256" => {
            let curve = key.ec_key().ok().and_then(|k| k.group().curve_name());
            if curve != Some(openssl::nid::Nid::X9_62_PRIME256V1) {
                return Err(unfit());
            }
            if signature.len() != 64 {
                return Err(signature_mismatch());
            }
            match ecdsa_der_signature(signature) {
                Ok(v) => v,
                Err(_) => return Err(signature_mismatch()),
            }
        }
        a => {
            return Err(types::error::Error::new(
                types::error::Type::BadSignatureAlgorithm, "Invalid JWS",
                format!("'{}' is not a supported algorithm", a),
            ));
        }
    };

    let mut verifier = match openssl::sign::Verifier::new(openssl::hash::MessageDigest::sha256(), key) {
        Ok(v) => v,
        Err(err) => {
            error!("Unable to create signature verifier: {}", err);
            return Err(crate::internal_server_error!());
        }
    };
    match verifier.verify_oneshot(&signature, signing_input) {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(signature_mismatch()),
    }
}

fn decode_jws_payload<R: serde::de::DeserializeOwned>(payload_bytes: &[u8]) -> super::ACMEResult<R> {
    serde_json::from_slice(payload_bytes)
        .map_err(|err| invalid_jws(format!("Error decoding payload: '{}'", err)))
}

/// Authenticates signed ACME requests against the account store and the nonce registry.
pub struct RequestAuthenticator<'a> {
    store: &'a dyn crate::store::Store,
    nonces: &'a super::replay::NonceRegistry,
}

impl<'a> RequestAuthenticator<'a> {
    pub fn new(store: &'a dyn crate::store::Store, nonces: &'a super::replay::NonceRegistry) -> Self {
        RequestAuthenticator {
            store,
            nonces,
        }
    }

    async fn resolve_kid(&self, kid: &str) -> super::ACMEResult<super::Account> {
        let bad_kid = || types::error::Error::new(types::error::Type::Malformed, "Bad kid", "Invalid kid format");
        let kid_url = url::Url::parse(kid).map_err(|_| bad_kid())?;
        let mut segments = kid_url.path_segments().ok_or_else(bad_kid)?.rev();
        let account_id = segments.next().ok_or_else(bad_kid)?;
        if segments.next() != Some("acct") {
            return Err(bad_kid());
        }
        let account_id = crate::util::b64_to_uuid(account_id).ok_or_else(bad_kid)?;

        let record = crate::try_db_result!(
            self.store.get_account(account_id).await, "Unable to search for account: {}"
        )?;
        let record = match record {
            Some(r) => r,
            None => return Err(types::error::Error::new(
                types::error::Type::AccountDoesNotExist, "Account does not exist",
                format!("No account can be found with the ID {}", kid),
            )),
        };
        if record.deactivated {
            return Err(types::error::Error::unauthorized(format!("Account '{}' has been deactivated", kid)));
        }

        let key = match openssl::pkey::PKey::public_key_from_der(&record.public_key) {
            Ok(v) => v,
            Err(err) => {
                error!("Failed to decode public key from DB: {}", err);
                return Err(crate::internal_server_error!());
            }
        };
        Ok(super::Account {
            record,
            key,
        })
    }

    /// Verifies an outer JWS posted to `request_url` and consumes its nonce.
    pub async fn authenticate<R: serde::de::DeserializeOwned>(
        &self, jws: &FlattenedJWS, request_url: &str,
    ) -> super::ACMEResult<JWSRequest<R>> {
        let (header, payload_bytes, signature_bytes) = start_decode_jws(jws)?;

        if header.url != request_url {
            return Err(types::error::Error::new(
                types::error::Type::Malformed, "Invalid URI",
                format!("JWS is for '{}' but request made to '{}'", header.url, request_url),
            ));
        }

        let key = match &header.key {
            types::jose::JWKKey::JWK(jwk) => JWSRequestKey::JWK {
                key: parse_client_jwk(jwk)?,
                kid: jwk.kid.clone(),
            },
            types::jose::JWKKey::KID(kid) => JWSRequestKey::KID(self.resolve_kid(kid).await?),
        };
        let key_openssl = match &key {
            JWSRequestKey::JWK { key, .. } => key,
            JWSRequestKey::KID(a) => &a.key,
        };

        let signing_input = format!("{}.{}", jws.protected, jws.payload);
        verify_signature(&header.alg, key_openssl, signing_input.as_bytes(), &signature_bytes)?;

        match &header.nonce {
            Some(nonce) => self.nonces.consume(nonce).await?,
            None => return Err(types::error::Error::new(
                types::error::Type::BadNonce, "No nonce", "A nonce must be provided",
            )),
        }

        let payload = if payload_bytes.is_empty() {
            None
        } else {
            Some(decode_jws_payload(&payload_bytes)?)
        };

        Ok(JWSRequest {
            payload,
            key,
            url: header.url,
        })
    }
}

impl<R: serde::de::DeserializeOwned> JWSRequestInner<R> {
    /// Verifies a nested JWS, which must carry a `jwk`, no nonce, and the outer request's URL.
    pub fn from_jws(jws: &FlattenedJWS, outer_url: &str) -> super::ACMEResult<Self> {
        let (header, payload_bytes, signature_bytes) = start_decode_jws(jws)?;

        if header.url != outer_url {
            return Err(types::error::Error::new(
                types::error::Type::Malformed, "Invalid URI",
                format!("Inner JWS is for '{}' but outer JWS is for '{}'", header.url, outer_url),
            ));
        }
        if header.nonce.is_some() {
            return Err(invalid_jws("Inner JWS must not carry a nonce"));
        }
        let key = match &header.key {
            types::jose::JWKKey::JWK(jwk) => parse_client_jwk(jwk)?,
            types::jose::JWKKey::KID(_) => return Err(invalid_jws("Inner JWS must carry a 'jwk'")),
        };

        let signing_input = format!("{}.{}", jws.protected, jws.payload);
        verify_signature(&header.alg, &key, signing_input.as_bytes(), &signature_bytes)?;

        Ok(JWSRequestInner {
            payload: decode_jws_payload(&payload_bytes)?,
            key,
        })
    }
}

#[rocket::async_trait]
impl<'r, R: serde::de::DeserializeOwned + Send> rocket::data::FromData<'r> for JWSRequest<R> {
    type Error = types::error::Error;

    async fn from_data(
        request: &'r rocket::request::Request<'_>, data: rocket::data::Data<'r>,
    ) -> rocket::data::Outcome<'r, Self> {
        let context = match request.rocket().state::<super::Context>() {
            Some(v) => v,
            None => {
                error!("ACME context not managed by Rocket");
                return rocket::data::Outcome::Error((
                    rocket::http::Status::InternalServerError, crate::internal_server_error!()
                ));
            }
        };

        let result = match get_flattened_jws(request, data).await {
            Ok(jws) => {
                let request_url = format!("{}{}", context.config.base_uri(), request.uri().path());
                RequestAuthenticator::new(context.store.as_ref(), &context.nonces)
                    .authenticate(&jws, &request_url).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(v) => rocket::data::Outcome::Success(v),
            Err(e) => {
                let status = rocket::http::Status::from_code(e.status)
                    .unwrap_or(rocket::http::Status::BadRequest);
                rocket::data::Outcome::Error((status, e))
            }
        }
    }
}

/// RFC 7638 thumbprint of a public key.
pub fn make_jwk_thumbprint(key: &openssl::pkey::PKeyRef<openssl::pkey::Public>) -> super::ACMEResult<String> {
    let jwk = match types::jose::JWK::try_from(key) {
        Ok(v) => v,
        Err(err) => {
            error!("Unable to convert account key to JWK: {}", err);
            return Err(crate::internal_server_error!());
        }
    };
    let canonical = match serde_json::to_string(&jwk.required_members()) {
        Ok(v) => v,
        Err(err) => {
            error!("Unable to serialize JWK: {}", err);
            return Err(crate::internal_server_error!());
        }
    };
    match crate::util::sha256_b64(canonical.as_bytes()) {
        Ok(v) => Ok(v),
        Err(err) => {
            error!("Unable to hash JWK: {}", err);
            Err(crate::internal_server_error!())
        }
    }
}

use std::convert::TryFrom;
use base64::prelude::*;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlattenedJWS {
    pub payload: String,
    pub protected: String,
    pub signature: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct JWSProtectedHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crit: Option<Vec<String>>,
    #[serde(flatten)]
    pub key: JWKKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize)]
pub enum JWKKey {
    #[serde(rename = "kid")]
    KID(String),
    #[serde(rename = "jwk")]
    JWK(JWK)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JWK {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(flatten)]
    pub params: JWKType
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum JWKType {
    EC {
        crv: String,
        x: String,
        y: String,
    },
    RSA {
        n: String,
        e: String,
    },
}

impl JWK {
    /// The members RFC 7638 requires in a thumbprint, keyed so serialisation is lexicographic.
    pub fn required_members(&self) -> std::collections::BTreeMap<&'static str, &str> {
        let mut members = std::collections::BTreeMap::new();
        members.insert("kty", self.kty.as_str());
        match &self.params {
            JWKType::EC { crv, x, y } => {
                members.insert("crv", crv.as_str());
                members.insert("x", x.as_str());
                members.insert("y", y.as_str());
            }
            JWKType::RSA { n, e } => {
                members.insert("n", n.as_str());
                members.insert("e", e.as_str());
            }
        }
        members
    }
}

fn ec_curve_name(nid: Option<openssl::nid::Nid>) -> Option<&'static str> {
    match nid {
        Some(openssl::nid::Nid::X9_62_PRIME256V1) => Some("P-256"),
        Some(openssl::nid::Nid::SECP384R1) => Some("P-384"),
        Some(openssl::nid::Nid::SECP521R1) => Some("P-521"),
        _ => None,
    }
}

impl TryFrom<&openssl::pkey::PKeyRef<openssl::pkey::Public>> for JWK {
    type Error = String;

    fn try_from(from: &openssl::pkey::PKeyRef<openssl::pkey::Public>) -> Result<Self, Self::Error> {
        let (kty, params) = match from.id() {
            openssl::pkey::Id::EC => {
                let ec_key = from.ec_key().map_err(|e| e.to_string())?;
                let group = ec_key.group();

                let crv = ec_curve_name(group.curve_name())
                    .ok_or_else(|| "Unknown curve".to_string())?
                    .to_string();
                let coord_len = ((group.degree() + 7) / 8) as i32;

                let mut ctx = openssl::bn::BigNumContext::new().map_err(|e| e.to_string())?;
                let mut x = openssl::bn::BigNum::new().map_err(|e| e.to_string())?;
                let mut y = openssl::bn::BigNum::new().map_err(|e| e.to_string())?;
                ec_key.public_key().affine_coordinates_gfp(group, &mut x, &mut y, &mut ctx)
                    .map_err(|e| e.to_string())?;

                ("EC", JWKType::EC {
                    crv,
                    x: BASE64_URL_SAFE_NO_PAD.encode(x.to_vec_padded(coord_len).map_err(|e| e.to_string())?),
                    y: BASE64_URL_SAFE_NO_PAD.encode(y.to_vec_padded(coord_len).map_err(|e| e.to_string())?),
                })
            },
            openssl::pkey::Id::RSA => {
                let rsa_key = from.rsa().map_err(|e| e.to_string())?;

                ("RSA", JWKType::RSA {
                    n: BASE64_URL_SAFE_NO_PAD.encode(rsa_key.n().to_vec()),
                    e: BASE64_URL_SAFE_NO_PAD.encode(rsa_key.e().to_vec()),
                })
            },
            o => return Err(format!("{:?} keys cannot be represented as a JWK", o))
        };

        Ok(JWK {
            kty: kty.to_string(),
            params,
            kid: None,
            alg: None
        })
    }
}

impl TryFrom<&JWK> for openssl::pkey::PKey<openssl::pkey::Public> {
    type Error = String;

    fn try_from(from: &JWK) -> Result<Self, Self::Error> {
        match (from.kty.as_str(), &from.params) {
            ("EC", JWKType::EC { crv, x, y }) => {
                let nid = match crv.as_str() {
                    "P-256" => openssl::nid::Nid::X9_62_PRIME256V1,
                    "P-384" => openssl::nid::Nid::SECP384R1,
                    "P-521" => openssl::nid::Nid::SECP521R1,
                    o => return Err(format!("'{}' is not a supported curve", o))
                };
                let ec_group = openssl::ec::EcGroup::from_curve_name(nid)
                    .map_err(|e| format!("Unable to load curve: {}", e))?;
                let x = BASE64_URL_SAFE_NO_PAD.decode(x)
                    .map_err(|e| format!("Invalid x parameter: {}", e))?;
                let y = BASE64_URL_SAFE_NO_PAD.decode(y)
                    .map_err(|e| format!("Invalid y parameter: {}", e))?;
                let x = openssl::bn::BigNum::from_slice(&x)
                    .map_err(|e| format!("Invalid x parameter: {}", e))?;
                let y = openssl::bn::BigNum::from_slice(&y)
                    .map_err(|e| format!("Invalid y parameter: {}", e))?;
                let key = openssl::ec::EcKey::from_public_key_affine_coordinates(&ec_group, &x, &y)
                    .map_err(|e| format!("Invalid public key: {}", e))?;
                openssl::pkey::PKey::from_ec_key(key)
                    .map_err(|e| format!("Invalid public key: {}", e))
            },
            ("RSA", JWKType::RSA { n, e }) => {
                let n = BASE64_URL_SAFE_NO_PAD.decode(n)
                    .map_err(|e| format!("Invalid n parameter: {}", e))?;
                let e = BASE64_URL_SAFE_NO_PAD.decode(e)
                    .map_err(|e| format!("Invalid e parameter: {}", e))?;
                let n = openssl::bn::BigNum::from_slice(&n)
                    .map_err(|e| format!("Invalid n parameter: {}", e))?;
                let e = openssl::bn::BigNum::from_slice(&e)
                    .map_err(|e| format!("Invalid e parameter: {}", e))?;
                let key = openssl::rsa::Rsa::from_public_components(n, e)
                    .map_err(|e| format!("Invalid public key: {}", e))?;
                openssl::pkey::PKey::from_rsa(key)
                    .map_err(|e| format!("Invalid public key: {}", e))
            },
            ("EC", _) | ("RSA", _) => Err("Invalid key parameters".to_string()),
            (o, _) => Err(format!("'{}' is not a supported key type", o))
        }
    }
}

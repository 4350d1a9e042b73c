#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Error {
    #[serde(rename = "type")]
    pub error_type: Type,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, rename = "subproblems", skip_serializing_if = "Vec::is_empty")]
    pub sub_problems: Vec<Error>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<super::identifier::Identifier>
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    #[serde(rename = "urn:ietf:params:acme:error:accountDoesNotExist")]
    AccountDoesNotExist,
    #[serde(rename = "urn:ietf:params:acme:error:alreadyRevoked")]
    AlreadyRevoked,
    #[serde(rename = "urn:ietf:params:acme:error:badCSR")]
    BadCSR,
    #[serde(rename = "urn:ietf:params:acme:error:badNonce")]
    BadNonce,
    #[serde(rename = "urn:ietf:params:acme:error:badPublicKey")]
    BadPublicKey,
    #[serde(rename = "urn:ietf:params:acme:error:badRevocationReason")]
    BadRevocationReason,
    #[serde(rename = "urn:ietf:params:acme:error:badSignatureAlgorithm")]
    BadSignatureAlgorithm,
    #[serde(rename = "urn:ietf:params:acme:error:compound")]
    Compound,
    #[serde(rename = "urn:ietf:params:acme:error:connection")]
    Connection,
    #[serde(rename = "urn:ietf:params:acme:error:invalidContact")]
    InvalidContact,
    #[serde(rename = "urn:ietf:params:acme:error:malformed")]
    Malformed,
    #[serde(rename = "urn:ietf:params:acme:error:orderNotReady")]
    OrderNotReady,
    #[serde(rename = "urn:ietf:params:acme:error:rateLimited")]
    RateLimited,
    #[serde(rename = "urn:ietf:params:acme:error:rejectedIdentifier")]
    RejectedIdentifier,
    #[serde(rename = "urn:ietf:params:acme:error:serverInternal")]
    ServerInternal,
    #[serde(rename = "urn:ietf:params:acme:error:unauthorized")]
    Unauthorized,
    #[serde(rename = "urn:ietf:params:acme:error:unsupportedContact")]
    UnsupportedContact,
    #[serde(rename = "urn:ietf:params:acme:error:unsupportedIdentifier")]
    UnsupportedIdentifier,
}

impl Type {
    /// The HTTP status a problem of this type is served with unless a handler overrides it.
    pub fn status(&self) -> u16 {
        match self {
            Type::InvalidContact | Type::Unauthorized | Type::Connection | Type::OrderNotReady => 403,
            Type::AccountDoesNotExist => 404,
            Type::RateLimited => 429,
            Type::ServerInternal => 500,
            _ => 400,
        }
    }
}

impl Error {
    pub fn new<T: Into<String>, D: Into<String>>(error_type: Type, title: T, detail: D) -> Self {
        Error {
            error_type,
            title: title.into(),
            status: error_type.status(),
            detail: detail.into(),
            instance: None,
            sub_problems: vec![],
            identifier: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_identifier(mut self, identifier: super::identifier::Identifier) -> Self {
        self.identifier = Some(identifier);
        self
    }

    pub fn malformed<D: Into<String>>(detail: D) -> Self {
        Self::new(Type::Malformed, "Bad request", detail)
    }

    pub fn not_found<D: Into<String>>(detail: D) -> Self {
        Self::new(Type::Malformed, "Not found", detail).with_status(404)
    }

    pub fn bad_csr<D: Into<String>>(detail: D) -> Self {
        Self::new(Type::BadCSR, "Bad CSR", detail)
    }

    pub fn unauthorized<D: Into<String>>(detail: D) -> Self {
        Self::new(Type::Unauthorized, "Unauthorized", detail)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?}): {}", self.title, self.error_type, self.detail)
    }
}

impl std::error::Error for Error {}

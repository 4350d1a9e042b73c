//! Persistence for accounts, orders, their authorizations, and replay nonces.
//!
//! Everything the ACME handlers and the issuance worker share lives behind the [`Store`]
//! trait. Operations that must not interleave (nonce redemption, challenge transitions,
//! CSR acceptance, and the worker's claim on an order) are single calls here so each
//! backend can make them atomic.

use chrono::prelude::*;

pub mod memory;
pub mod models;
pub mod postgres;
pub mod schema;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug)]
pub enum StoreError {
    Database(diesel::result::Error),
    Pool(diesel::r2d2::PoolError),
    Migration(String),
    Task(tokio::task::JoinError),
    Poisoned,
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {}", e),
            StoreError::Pool(e) => write!(f, "unable to get database connection: {}", e),
            StoreError::Migration(e) => write!(f, "unable to run migrations: {}", e),
            StoreError::Task(e) => write!(f, "database task failed: {}", e),
            StoreError::Poisoned => f.write_str("store lock poisoned"),
            StoreError::Corrupt(e) => write!(f, "corrupt record: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        StoreError::Database(e)
    }
}

impl From<diesel::r2d2::PoolError> for StoreError {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        StoreError::Pool(e)
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e)
    }
}

#[derive(diesel_derive_enum::DbEnum, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierType {
    Dns,
    Ip,
}

#[derive(diesel_derive_enum::DbEnum, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeType {
    #[db_rename = "http-01"]
    Http01,
    #[db_rename = "dns-01"]
    Dns01,
}

#[derive(diesel_derive_enum::DbEnum, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeStatus {
    Pending,
    Valid,
    Invalid,
}

impl From<IdentifierType> for crate::types::identifier::Type {
    fn from(t: IdentifierType) -> Self {
        match t {
            IdentifierType::Dns => crate::types::identifier::Type::DNS,
            IdentifierType::Ip => crate::types::identifier::Type::IP,
        }
    }
}

impl From<crate::types::identifier::Type> for IdentifierType {
    fn from(t: crate::types::identifier::Type) -> Self {
        match t {
            crate::types::identifier::Type::DNS => IdentifierType::Dns,
            crate::types::identifier::Type::IP => IdentifierType::Ip,
        }
    }
}

impl From<ChallengeType> for crate::types::challenge::Type {
    fn from(t: ChallengeType) -> Self {
        match t {
            ChallengeType::Http01 => crate::types::challenge::Type::HTTP01,
            ChallengeType::Dns01 => crate::types::challenge::Type::DNS01,
        }
    }
}

impl From<crate::types::challenge::Type> for ChallengeType {
    fn from(t: crate::types::challenge::Type) -> Self {
        match t {
            crate::types::challenge::Type::HTTP01 => ChallengeType::Http01,
            crate::types::challenge::Type::DNS01 => ChallengeType::Dns01,
        }
    }
}

impl From<ChallengeStatus> for crate::types::challenge::Status {
    fn from(s: ChallengeStatus) -> Self {
        match s {
            ChallengeStatus::Pending => crate::types::challenge::Status::Pending,
            ChallengeStatus::Valid => crate::types::challenge::Status::Valid,
            ChallengeStatus::Invalid => crate::types::challenge::Status::Invalid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub id: uuid::Uuid,
    pub created_at: DateTime<Utc>,
    /// DER SubjectPublicKeyInfo of the account key.
    pub public_key: Vec<u8>,
    pub emails: Vec<String>,
    pub deactivated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRecord {
    pub id: uuid::Uuid,
    pub account_id: uuid::Uuid,
    pub provisioner: String,
    pub created_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub certificate_id: Option<uuid::Uuid>,
    pub csr: Option<Vec<u8>>,
    pub certificate_pem: Option<String>,
    pub serial_number: Option<String>,
    pub certificate_issued_at: Option<DateTime<Utc>>,
    pub certificate_expires_at: Option<DateTime<Utc>>,
    /// Problem document (JSON) explaining why the order became invalid.
    pub error: Option<String>,
    pub claimed_until: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<i32>,
}

impl OrderRecord {
    pub fn new(
        account_id: uuid::Uuid, provisioner: &str, now: DateTime<Utc>,
        not_after: DateTime<Utc>, expires_at: DateTime<Utc>,
    ) -> Self {
        OrderRecord {
            id: uuid::Uuid::new_v4(),
            account_id,
            provisioner: provisioner.to_string(),
            created_at: now,
            not_before: now,
            not_after,
            expires_at,
            certificate_id: None,
            csr: None,
            certificate_pem: None,
            serial_number: None,
            certificate_issued_at: None,
            certificate_expires_at: None,
            error: None,
            claimed_until: DateTime::<Utc>::default(),
            revoked_at: None,
            revocation_reason: None,
        }
    }

    pub fn error_document(&self) -> Option<crate::types::error::Error> {
        self.error.as_deref().and_then(|e| serde_json::from_str(e).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierRecord {
    pub authorization_id: uuid::Uuid,
    pub order_id: uuid::Uuid,
    pub id_type: IdentifierType,
    pub value: String,
}

impl IdentifierRecord {
    pub fn to_identifier(&self) -> crate::types::identifier::Identifier {
        crate::types::identifier::Identifier {
            id_type: crate::types::identifier::Type::from(self.id_type).as_str().to_string(),
            value: self.value.clone(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.id_type == IdentifierType::Dns && self.value.starts_with("*.")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    pub id: uuid::Uuid,
    pub authorization_id: uuid::Uuid,
    pub challenge_type: ChallengeType,
    pub token: String,
    pub status: ChallengeStatus,
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRecord {
    pub identifier: IdentifierRecord,
    pub challenges: Vec<ChallengeRecord>,
}

impl AuthorizationRecord {
    pub fn is_valid(&self) -> bool {
        self.challenges.iter().any(|c| c.status == ChallengeStatus::Valid)
    }
}

/// The outcome of a successful issuance, stored against the order in one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub certificate_id: uuid::Uuid,
    pub serial_number: String,
    pub pem_chain: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

#[rocket::async_trait]
pub trait Store: Send + Sync {
    async fn insert_nonce(&self, nonce: &str, issued_at: DateTime<Utc>) -> StoreResult<()>;
    async fn nonce_issued_at(&self, nonce: &str) -> StoreResult<Option<DateTime<Utc>>>;
    /// Records the first use of a nonce; `false` if it had already been redeemed.
    async fn redeem_nonce(&self, nonce: &str, redeemed_at: DateTime<Utc>) -> StoreResult<bool>;
    async fn prune_nonces(&self, issued_before: DateTime<Utc>) -> StoreResult<usize>;

    async fn insert_account(&self, account: &AccountRecord) -> StoreResult<()>;
    async fn get_account(&self, id: uuid::Uuid) -> StoreResult<Option<AccountRecord>>;
    async fn find_account_by_key(&self, public_key: &[u8]) -> StoreResult<Option<AccountRecord>>;
    async fn update_account_emails(&self, id: uuid::Uuid, emails: &[String]) -> StoreResult<()>;
    async fn deactivate_account(&self, id: uuid::Uuid) -> StoreResult<()>;
    /// `false` if another account already holds the key.
    async fn update_account_key(&self, id: uuid::Uuid, public_key: &[u8]) -> StoreResult<bool>;

    async fn insert_order(&self, order: &OrderRecord, authorizations: &[AuthorizationRecord]) -> StoreResult<()>;
    async fn get_order(&self, id: uuid::Uuid) -> StoreResult<Option<OrderRecord>>;
    async fn list_account_orders(&self, account_id: uuid::Uuid) -> StoreResult<Vec<OrderRecord>>;
    /// Orders of an account with no certificate or error that have not yet expired.
    async fn count_unfinished_orders(&self, account_id: uuid::Uuid, now: DateTime<Utc>) -> StoreResult<i64>;
    async fn order_authorizations(&self, order_id: uuid::Uuid) -> StoreResult<Vec<AuthorizationRecord>>;
    async fn get_authorization(&self, id: uuid::Uuid) -> StoreResult<Option<AuthorizationRecord>>;
    async fn get_challenge(&self, id: uuid::Uuid) -> StoreResult<Option<ChallengeRecord>>;
    /// Moves a pending challenge to valid; `None` if it was no longer pending.
    async fn mark_challenge_valid(
        &self, id: uuid::Uuid, verified_at: DateTime<Utc>,
    ) -> StoreResult<Option<ChallengeRecord>>;

    /// Attaches a CSR to an order that has none, is not invalid or expired, and has every
    /// identifier validated. `false` if any of that no longer holds.
    async fn store_csr(&self, order_id: uuid::Uuid, csr: &[u8], now: DateTime<Utc>) -> StoreResult<bool>;
    /// Claims the oldest order awaiting issuance whose lease has lapsed.
    async fn claim_processing_order(
        &self, now: DateTime<Utc>, lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<OrderRecord>>;
    async fn defer_order(&self, order_id: uuid::Uuid, retry_at: DateTime<Utc>) -> StoreResult<()>;
    /// `false` if the order already carries a certificate.
    async fn complete_order(
        &self, order_id: uuid::Uuid, certificate: &IssuedCertificate, issued_at: DateTime<Utc>,
    ) -> StoreResult<bool>;
    /// Marks an order invalid and any challenge still pending under it invalid too.
    async fn fail_order(&self, order_id: uuid::Uuid, error: &str) -> StoreResult<()>;

    async fn find_order_by_serial(&self, serial_number: &str) -> StoreResult<Option<OrderRecord>>;
    /// `false` if the certificate was already revoked.
    async fn revoke_certificate(
        &self, order_id: uuid::Uuid, reason: i32, revoked_at: DateTime<Utc>,
    ) -> StoreResult<bool>;
}

use super::schema::*;

#[derive(Insertable, Queryable, Debug)]
#[diesel(table_name = nonces)]
pub struct Nonce {
    pub value: String,
    pub issued_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = nonce_redemptions)]
pub struct NonceRedemption<'a> {
    pub value: &'a str,
    pub redeemed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Insertable, Queryable, Debug)]
#[diesel(table_name = accounts)]
pub struct Account {
    pub id: uuid::Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub public_key: Vec<u8>,
    pub emails: Vec<String>,
    pub deactivated: bool,
}

#[derive(Insertable, Queryable, Debug)]
#[diesel(table_name = orders)]
pub struct Order {
    pub id: uuid::Uuid,
    pub account_id: uuid::Uuid,
    pub provisioner: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub not_before: chrono::DateTime<chrono::Utc>,
    pub not_after: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub certificate_id: Option<uuid::Uuid>,
    pub csr: Option<Vec<u8>>,
    pub certificate_pem: Option<String>,
    pub serial_number: Option<String>,
    pub certificate_issued_at: Option<chrono::DateTime<chrono::Utc>>,
    pub certificate_expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
    pub claimed_until: chrono::DateTime<chrono::Utc>,
    pub revoked_at: Option<chrono::DateTime<chrono::Utc>>,
    pub revocation_reason: Option<i32>,
}

#[derive(Insertable, Queryable, Debug)]
#[diesel(table_name = identifiers)]
pub struct Identifier {
    pub authorization_id: uuid::Uuid,
    pub order_id: uuid::Uuid,
    pub identifier_type: super::IdentifierType,
    pub value: String,
}

#[derive(Insertable, Queryable, Debug)]
#[diesel(table_name = challenges)]
pub struct Challenge {
    pub id: uuid::Uuid,
    pub authorization_id: uuid::Uuid,
    pub challenge_type: super::ChallengeType,
    pub token: String,
    pub status: super::ChallengeStatus,
    pub verified_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<Account> for super::AccountRecord {
    fn from(a: Account) -> Self {
        super::AccountRecord {
            id: a.id,
            created_at: a.created_at,
            public_key: a.public_key,
            emails: a.emails,
            deactivated: a.deactivated,
        }
    }
}

impl From<&super::AccountRecord> for Account {
    fn from(a: &super::AccountRecord) -> Self {
        Account {
            id: a.id,
            created_at: a.created_at,
            public_key: a.public_key.clone(),
            emails: a.emails.clone(),
            deactivated: a.deactivated,
        }
    }
}

impl From<Order> for super::OrderRecord {
    fn from(o: Order) -> Self {
        super::OrderRecord {
            id: o.id,
            account_id: o.account_id,
            provisioner: o.provisioner,
            created_at: o.created_at,
            not_before: o.not_before,
            not_after: o.not_after,
            expires_at: o.expires_at,
            certificate_id: o.certificate_id,
            csr: o.csr,
            certificate_pem: o.certificate_pem,
            serial_number: o.serial_number,
            certificate_issued_at: o.certificate_issued_at,
            certificate_expires_at: o.certificate_expires_at,
            error: o.error,
            claimed_until: o.claimed_until,
            revoked_at: o.revoked_at,
            revocation_reason: o.revocation_reason,
        }
    }
}

impl From<&super::OrderRecord> for Order {
    fn from(o: &super::OrderRecord) -> Self {
        Order {
            id: o.id,
            account_id: o.account_id,
            provisioner: o.provisioner.clone(),
            created_at: o.created_at,
            not_before: o.not_before,
            not_after: o.not_after,
            expires_at: o.expires_at,
            certificate_id: o.certificate_id,
            csr: o.csr.clone(),
            certificate_pem: o.certificate_pem.clone(),
            serial_number: o.serial_number.clone(),
            certificate_issued_at: o.certificate_issued_at,
            certificate_expires_at: o.certificate_expires_at,
            error: o.error.clone(),
            claimed_until: o.claimed_until,
            revoked_at: o.revoked_at,
            revocation_reason: o.revocation_reason,
        }
    }
}

impl From<Identifier> for super::IdentifierRecord {
    fn from(i: Identifier) -> Self {
        super::IdentifierRecord {
            authorization_id: i.authorization_id,
            order_id: i.order_id,
            id_type: i.identifier_type,
            value: i.value,
        }
    }
}

impl From<&super::IdentifierRecord> for Identifier {
    fn from(i: &super::IdentifierRecord) -> Self {
        Identifier {
            authorization_id: i.authorization_id,
            order_id: i.order_id,
            identifier_type: i.id_type,
            value: i.value.clone(),
        }
    }
}

impl From<Challenge> for super::ChallengeRecord {
    fn from(c: Challenge) -> Self {
        super::ChallengeRecord {
            id: c.id,
            authorization_id: c.authorization_id,
            challenge_type: c.challenge_type,
            token: c.token,
            status: c.status,
            verified_at: c.verified_at,
        }
    }
}

impl From<&super::ChallengeRecord> for Challenge {
    fn from(c: &super::ChallengeRecord) -> Self {
        Challenge {
            id: c.id,
            authorization_id: c.authorization_id,
            challenge_type: c.challenge_type,
            token: c.token.clone(),
            status: c.status,
            verified_at: c.verified_at,
        }
    }
}

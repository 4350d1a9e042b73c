use chrono::prelude::*;
use std::collections::HashMap;
use super::{
    AccountRecord, AuthorizationRecord, ChallengeRecord, ChallengeStatus, ChallengeType, IdentifierRecord,
    IssuedCertificate, OrderRecord, StoreError, StoreResult,
};

#[derive(Default)]
struct Inner {
    nonces: HashMap<String, DateTime<Utc>>,
    redemptions: HashMap<String, DateTime<Utc>>,
    accounts: HashMap<uuid::Uuid, AccountRecord>,
    orders: HashMap<uuid::Uuid, OrderRecord>,
    identifiers: HashMap<uuid::Uuid, IdentifierRecord>,
    challenges: HashMap<uuid::Uuid, ChallengeRecord>,
}

impl Inner {
    fn authorization(&self, identifier: &IdentifierRecord) -> AuthorizationRecord {
        let mut challenges = self.challenges.values()
            .filter(|c| c.authorization_id == identifier.authorization_id)
            .cloned()
            .collect::<Vec<_>>();
        challenges.sort_by_key(|c| c.challenge_type == ChallengeType::Dns01);
        AuthorizationRecord {
            identifier: identifier.clone(),
            challenges,
        }
    }

    fn order_authorizations(&self, order_id: uuid::Uuid) -> Vec<AuthorizationRecord> {
        let mut idents = self.identifiers.values()
            .filter(|i| i.order_id == order_id)
            .collect::<Vec<_>>();
        idents.sort_by(|a, b| a.value.cmp(&b.value));
        idents.into_iter().map(|i| self.authorization(i)).collect()
    }
}

/// Single-process store kept entirely in memory; one lock serialises every operation.
#[derive(Default)]
pub struct MemoryStore {
    inner: std::sync::Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[rocket::async_trait]
impl super::Store for MemoryStore {
    async fn insert_nonce(&self, nonce: &str, issued_at: DateTime<Utc>) -> StoreResult<()> {
        self.lock()?.nonces.insert(nonce.to_string(), issued_at);
        Ok(())
    }

    async fn nonce_issued_at(&self, nonce: &str) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.lock()?.nonces.get(nonce).copied())
    }

    async fn redeem_nonce(&self, nonce: &str, redeemed_at: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        if inner.redemptions.contains_key(nonce) {
            return Ok(false);
        }
        inner.redemptions.insert(nonce.to_string(), redeemed_at);
        Ok(true)
    }

    async fn prune_nonces(&self, issued_before: DateTime<Utc>) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        inner.redemptions.retain(|_, at| *at >= issued_before);
        let before = inner.nonces.len();
        inner.nonces.retain(|_, at| *at >= issued_before);
        Ok(before - inner.nonces.len())
    }

    async fn insert_account(&self, account: &AccountRecord) -> StoreResult<()> {
        self.lock()?.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn get_account(&self, id: uuid::Uuid) -> StoreResult<Option<AccountRecord>> {
        Ok(self.lock()?.accounts.get(&id).cloned())
    }

    async fn find_account_by_key(&self, public_key: &[u8]) -> StoreResult<Option<AccountRecord>> {
        Ok(self.lock()?.accounts.values().find(|a| a.public_key == public_key).cloned())
    }

    async fn update_account_emails(&self, id: uuid::Uuid, emails: &[String]) -> StoreResult<()> {
        if let Some(account) = self.lock()?.accounts.get_mut(&id) {
            account.emails = emails.to_vec();
        }
        Ok(())
    }

    async fn deactivate_account(&self, id: uuid::Uuid) -> StoreResult<()> {
        if let Some(account) = self.lock()?.accounts.get_mut(&id) {
            account.deactivated = true;
        }
        Ok(())
    }

    async fn update_account_key(&self, id: uuid::Uuid, public_key: &[u8]) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        if inner.accounts.values().any(|a| a.public_key == public_key) {
            return Ok(false);
        }
        if let Some(account) = inner.accounts.get_mut(&id) {
            account.public_key = public_key.to_vec();
        }
        Ok(true)
    }

    async fn insert_order(&self, order: &OrderRecord, authorizations: &[AuthorizationRecord]) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.orders.insert(order.id, order.clone());
        for authorization in authorizations {
            inner.identifiers.insert(authorization.identifier.authorization_id, authorization.identifier.clone());
            for challenge in &authorization.challenges {
                inner.challenges.insert(challenge.id, challenge.clone());
            }
        }
        Ok(())
    }

    async fn get_order(&self, id: uuid::Uuid) -> StoreResult<Option<OrderRecord>> {
        Ok(self.lock()?.orders.get(&id).cloned())
    }

    async fn list_account_orders(&self, account_id: uuid::Uuid) -> StoreResult<Vec<OrderRecord>> {
        let inner = self.lock()?;
        let mut orders = inner.orders.values()
            .filter(|o| o.account_id == account_id)
            .cloned()
            .collect::<Vec<_>>();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn count_unfinished_orders(&self, account_id: uuid::Uuid, now: DateTime<Utc>) -> StoreResult<i64> {
        Ok(self.lock()?.orders.values()
            .filter(|o| o.account_id == account_id)
            .filter(|o| o.certificate_pem.is_none() && o.error.is_none() && o.expires_at > now)
            .count() as i64)
    }

    async fn order_authorizations(&self, order_id: uuid::Uuid) -> StoreResult<Vec<AuthorizationRecord>> {
        Ok(self.lock()?.order_authorizations(order_id))
    }

    async fn get_authorization(&self, id: uuid::Uuid) -> StoreResult<Option<AuthorizationRecord>> {
        let inner = self.lock()?;
        Ok(inner.identifiers.get(&id).map(|i| inner.authorization(i)))
    }

    async fn get_challenge(&self, id: uuid::Uuid) -> StoreResult<Option<ChallengeRecord>> {
        Ok(self.lock()?.challenges.get(&id).cloned())
    }

    async fn mark_challenge_valid(
        &self, id: uuid::Uuid, verified_at: DateTime<Utc>,
    ) -> StoreResult<Option<ChallengeRecord>> {
        let mut inner = self.lock()?;
        match inner.challenges.get_mut(&id) {
            Some(challenge) if challenge.status == ChallengeStatus::Pending => {
                challenge.status = ChallengeStatus::Valid;
                challenge.verified_at = Some(verified_at);
                Ok(Some(challenge.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn store_csr(&self, order_id: uuid::Uuid, csr: &[u8], now: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let authorizations = inner.order_authorizations(order_id);
        let order = match inner.orders.get_mut(&order_id) {
            Some(o) => o,
            None => return Ok(false),
        };
        if order.csr.is_some() || order.error.is_some() || order.expires_at <= now {
            return Ok(false);
        }
        if authorizations.is_empty() || !authorizations.iter().all(|a| a.is_valid()) {
            return Ok(false);
        }
        order.csr = Some(csr.to_vec());
        Ok(true)
    }

    async fn claim_processing_order(
        &self, now: DateTime<Utc>, lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<OrderRecord>> {
        let mut inner = self.lock()?;
        let next = inner.orders.values_mut()
            .filter(|o| o.csr.is_some() && o.certificate_pem.is_none() && o.error.is_none())
            .filter(|o| o.claimed_until <= now)
            .min_by_key(|o| o.created_at);
        Ok(next.map(|order| {
            order.claimed_until = lease_until;
            order.clone()
        }))
    }

    async fn defer_order(&self, order_id: uuid::Uuid, retry_at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(order) = self.lock()?.orders.get_mut(&order_id) {
            order.claimed_until = retry_at;
        }
        Ok(())
    }

    async fn complete_order(
        &self, order_id: uuid::Uuid, certificate: &IssuedCertificate, issued_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        match inner.orders.get_mut(&order_id) {
            Some(order) if order.certificate_pem.is_none() => {
                order.certificate_id = Some(certificate.certificate_id);
                order.certificate_pem = Some(certificate.pem_chain.clone());
                order.serial_number = Some(certificate.serial_number.clone());
                order.certificate_issued_at = Some(issued_at);
                order.certificate_expires_at = Some(certificate.not_after);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_order(&self, order_id: uuid::Uuid, error: &str) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if let Some(order) = inner.orders.get_mut(&order_id) {
            order.error = Some(error.to_string());
        }
        let authorization_ids = inner.identifiers.values()
            .filter(|i| i.order_id == order_id)
            .map(|i| i.authorization_id)
            .collect::<Vec<_>>();
        for challenge in inner.challenges.values_mut() {
            if authorization_ids.contains(&challenge.authorization_id) && challenge.status == ChallengeStatus::Pending {
                challenge.status = ChallengeStatus::Invalid;
            }
        }
        Ok(())
    }

    async fn find_order_by_serial(&self, serial_number: &str) -> StoreResult<Option<OrderRecord>> {
        Ok(self.lock()?.orders.values()
            .find(|o| o.serial_number.as_deref() == Some(serial_number))
            .cloned())
    }

    async fn revoke_certificate(
        &self, order_id: uuid::Uuid, reason: i32, revoked_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        match inner.orders.get_mut(&order_id) {
            Some(order) if order.certificate_pem.is_some() && order.revoked_at.is_none() => {
                order.revoked_at = Some(revoked_at);
                order.revocation_reason = Some(reason);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IdentifierType, Store};

    fn pending_order(store_now: DateTime<Utc>) -> (OrderRecord, Vec<AuthorizationRecord>) {
        let order = OrderRecord::new(
            uuid::Uuid::new_v4(), "default", store_now,
            store_now + chrono::Duration::days(90), store_now + chrono::Duration::days(1),
        );
        let authorization_id = uuid::Uuid::new_v4();
        let authorization = AuthorizationRecord {
            identifier: IdentifierRecord {
                authorization_id,
                order_id: order.id,
                id_type: IdentifierType::Dns,
                value: "example.com".to_string(),
            },
            challenges: vec![ChallengeRecord {
                id: uuid::Uuid::new_v4(),
                authorization_id,
                challenge_type: ChallengeType::Http01,
                token: "token".to_string(),
                status: ChallengeStatus::Pending,
                verified_at: None,
            }],
        };
        (order, vec![authorization])
    }

    #[tokio::test]
    async fn test_nonce_redeemed_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_nonce("abc", now).await.unwrap();
        assert_eq!(store.nonce_issued_at("abc").await.unwrap(), Some(now));
        assert!(store.redeem_nonce("abc", now).await.unwrap());
        assert!(!store.redeem_nonce("abc", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_challenge_only_leaves_pending_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let (order, authorizations) = pending_order(now);
        let challenge_id = authorizations[0].challenges[0].id;
        store.insert_order(&order, &authorizations).await.unwrap();

        let updated = store.mark_challenge_valid(challenge_id, now).await.unwrap().unwrap();
        assert_eq!(updated.status, ChallengeStatus::Valid);
        assert_eq!(updated.verified_at, Some(now));
        assert!(store.mark_challenge_valid(challenge_id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_csr_requires_validated_identifiers() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let (order, authorizations) = pending_order(now);
        let challenge_id = authorizations[0].challenges[0].id;
        store.insert_order(&order, &authorizations).await.unwrap();

        assert!(!store.store_csr(order.id, b"csr", now).await.unwrap());
        store.mark_challenge_valid(challenge_id, now).await.unwrap();
        assert!(store.store_csr(order.id, b"csr", now).await.unwrap());
        assert!(!store.store_csr(order.id, b"other", now).await.unwrap());
        assert_eq!(store.get_order(order.id).await.unwrap().unwrap().csr.as_deref(), Some(&b"csr"[..]));
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_leased() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut ids = vec![];
        for offset in 0..2 {
            let (mut order, authorizations) = pending_order(now - chrono::Duration::seconds(10 - offset));
            order.csr = Some(b"csr".to_vec());
            ids.push(order.id);
            store.insert_order(&order, &authorizations).await.unwrap();
        }

        let lease = now + chrono::Duration::seconds(300);
        let first = store.claim_processing_order(now, lease).await.unwrap().unwrap();
        assert_eq!(first.id, ids[0]);
        let second = store.claim_processing_order(now, lease).await.unwrap().unwrap();
        assert_eq!(second.id, ids[1]);
        assert!(store.claim_processing_order(now, lease).await.unwrap().is_none());
        assert!(store.claim_processing_order(lease, lease).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fail_order_invalidates_pending_challenges() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let (order, authorizations) = pending_order(now);
        store.insert_order(&order, &authorizations).await.unwrap();

        store.fail_order(order.id, "{}").await.unwrap();
        let authorization = store.get_authorization(authorizations[0].identifier.authorization_id)
            .await.unwrap().unwrap();
        assert_eq!(authorization.challenges[0].status, ChallengeStatus::Invalid);
        assert_eq!(store.get_order(order.id).await.unwrap().unwrap().error.as_deref(), Some("{}"));
    }
}

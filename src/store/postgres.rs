use chrono::prelude::*;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness};
use super::schema::{accounts, challenges, identifiers, nonce_redemptions, nonces, orders};
use super::{models, StoreError, StoreResult};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type PgPool = Pool<ConnectionManager<PgConnection>>;

/// PostgreSQL backed store. Diesel is synchronous so every call runs on tokio's blocking pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, pool_size: u32) -> StoreResult<Self> {
        let manager = ConnectionManager::<PgConnection>::new(url);
        let pool = tokio::task::spawn_blocking(move || {
            Pool::builder().max_size(pool_size).build(manager)
        }).await??;

        let store = PgStore { pool };
        store.run(|c| {
            let applied = c.run_pending_migrations(MIGRATIONS)
                .map_err(|e| StoreError::Migration(e.to_string()))?;
            for migration in applied {
                info!("Applied migration {}", migration);
            }
            Ok(())
        }).await?;

        Ok(store)
    }

    async fn run<F, T>(&self, f: F) -> StoreResult<T>
        where F: FnOnce(&mut PgConnection) -> StoreResult<T> + Send + 'static, T: Send + 'static
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        }).await?
    }
}

fn load_authorizations(
    c: &mut PgConnection, idents: Vec<models::Identifier>,
) -> QueryResult<Vec<super::AuthorizationRecord>> {
    let ids = idents.iter().map(|i| i.authorization_id).collect::<Vec<_>>();
    let mut challenges: Vec<models::Challenge> = challenges::table
        .filter(challenges::authorization_id.eq_any(&ids))
        .order(challenges::challenge_type.asc())
        .load(c)?;

    Ok(idents.into_iter().map(|i| {
        let (own, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut challenges)
            .into_iter()
            .partition(|ch| ch.authorization_id == i.authorization_id);
        challenges = rest;
        super::AuthorizationRecord {
            identifier: i.into(),
            challenges: own.into_iter().map(Into::into).collect(),
        }
    }).collect())
}

#[rocket::async_trait]
impl super::Store for PgStore {
    async fn insert_nonce(&self, nonce: &str, issued_at: DateTime<Utc>) -> StoreResult<()> {
        let new_nonce = models::Nonce {
            value: nonce.to_string(),
            issued_at,
        };
        self.run(move |c| {
            diesel::insert_into(nonces::table).values(&new_nonce).execute(c)?;
            Ok(())
        }).await
    }

    async fn nonce_issued_at(&self, nonce: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let nonce = nonce.to_string();
        self.run(move |c| {
            Ok(nonces::table.find(&nonce)
                .select(nonces::issued_at)
                .first::<DateTime<Utc>>(c)
                .optional()?)
        }).await
    }

    async fn redeem_nonce(&self, nonce: &str, redeemed_at: DateTime<Utc>) -> StoreResult<bool> {
        let nonce = nonce.to_string();
        self.run(move |c| {
            let inserted = diesel::insert_into(nonce_redemptions::table)
                .values(&models::NonceRedemption {
                    value: &nonce,
                    redeemed_at,
                })
                .on_conflict_do_nothing()
                .execute(c)?;
            Ok(inserted == 1)
        }).await
    }

    async fn prune_nonces(&self, issued_before: DateTime<Utc>) -> StoreResult<usize> {
        self.run(move |c| {
            diesel::delete(nonce_redemptions::table.filter(nonce_redemptions::redeemed_at.lt(issued_before)))
                .execute(c)?;
            Ok(diesel::delete(nonces::table.filter(nonces::issued_at.lt(issued_before))).execute(c)?)
        }).await
    }

    async fn insert_account(&self, account: &super::AccountRecord) -> StoreResult<()> {
        let account = models::Account::from(account);
        self.run(move |c| {
            diesel::insert_into(accounts::table).values(&account).execute(c)?;
            Ok(())
        }).await
    }

    async fn get_account(&self, id: uuid::Uuid) -> StoreResult<Option<super::AccountRecord>> {
        self.run(move |c| {
            Ok(accounts::table.find(id)
                .first::<models::Account>(c)
                .optional()?
                .map(Into::into))
        }).await
    }

    async fn find_account_by_key(&self, public_key: &[u8]) -> StoreResult<Option<super::AccountRecord>> {
        let public_key = public_key.to_vec();
        self.run(move |c| {
            Ok(accounts::table.filter(accounts::public_key.eq(&public_key))
                .first::<models::Account>(c)
                .optional()?
                .map(Into::into))
        }).await
    }

    async fn update_account_emails(&self, id: uuid::Uuid, emails: &[String]) -> StoreResult<()> {
        let emails = emails.to_vec();
        self.run(move |c| {
            diesel::update(accounts::table.find(id))
                .set(accounts::emails.eq(&emails))
                .execute(c)?;
            Ok(())
        }).await
    }

    async fn deactivate_account(&self, id: uuid::Uuid) -> StoreResult<()> {
        self.run(move |c| {
            diesel::update(accounts::table.find(id))
                .set(accounts::deactivated.eq(true))
                .execute(c)?;
            Ok(())
        }).await
    }

    async fn update_account_key(&self, id: uuid::Uuid, public_key: &[u8]) -> StoreResult<bool> {
        let public_key = public_key.to_vec();
        self.run(move |c| {
            Ok(c.transaction::<_, diesel::result::Error, _>(|c| {
                let holder = accounts::table.filter(accounts::public_key.eq(&public_key))
                    .select(accounts::id)
                    .first::<uuid::Uuid>(c)
                    .optional()?;
                if holder.is_some() {
                    return Ok(false);
                }
                diesel::update(accounts::table.find(id))
                    .set(accounts::public_key.eq(&public_key))
                    .execute(c)?;
                Ok(true)
            })?)
        }).await
    }

    async fn insert_order(
        &self, order: &super::OrderRecord, authorizations: &[super::AuthorizationRecord],
    ) -> StoreResult<()> {
        let order = models::Order::from(order);
        let idents = authorizations.iter()
            .map(|a| models::Identifier::from(&a.identifier))
            .collect::<Vec<_>>();
        let challenges = authorizations.iter()
            .flat_map(|a| a.challenges.iter().map(models::Challenge::from))
            .collect::<Vec<_>>();
        self.run(move |c| {
            c.transaction::<_, diesel::result::Error, _>(|c| {
                diesel::insert_into(orders::table).values(&order).execute(c)?;
                diesel::insert_into(identifiers::table).values(&idents).execute(c)?;
                diesel::insert_into(challenges::table).values(&challenges).execute(c)?;
                Ok(())
            })?;
            Ok(())
        }).await
    }

    async fn get_order(&self, id: uuid::Uuid) -> StoreResult<Option<super::OrderRecord>> {
        self.run(move |c| {
            Ok(orders::table.find(id)
                .first::<models::Order>(c)
                .optional()?
                .map(Into::into))
        }).await
    }

    async fn list_account_orders(&self, account_id: uuid::Uuid) -> StoreResult<Vec<super::OrderRecord>> {
        self.run(move |c| {
            Ok(orders::table.filter(orders::account_id.eq(account_id))
                .order(orders::created_at.asc())
                .load::<models::Order>(c)?
                .into_iter()
                .map(Into::into)
                .collect())
        }).await
    }

    async fn count_unfinished_orders(&self, account_id: uuid::Uuid, now: DateTime<Utc>) -> StoreResult<i64> {
        self.run(move |c| {
            Ok(orders::table.filter(orders::account_id.eq(account_id))
                .filter(orders::certificate_pem.is_null())
                .filter(orders::error.is_null())
                .filter(orders::expires_at.gt(now))
                .count()
                .get_result(c)?)
        }).await
    }

    async fn order_authorizations(&self, order_id: uuid::Uuid) -> StoreResult<Vec<super::AuthorizationRecord>> {
        self.run(move |c| {
            let idents: Vec<models::Identifier> = identifiers::table
                .filter(identifiers::order_id.eq(order_id))
                .order(identifiers::value.asc())
                .load(c)?;
            Ok(load_authorizations(c, idents)?)
        }).await
    }

    async fn get_authorization(&self, id: uuid::Uuid) -> StoreResult<Option<super::AuthorizationRecord>> {
        self.run(move |c| {
            let ident: Option<models::Identifier> = identifiers::table.find(id).first(c).optional()?;
            match ident {
                Some(i) => Ok(load_authorizations(c, vec![i])?.pop()),
                None => Ok(None),
            }
        }).await
    }

    async fn get_challenge(&self, id: uuid::Uuid) -> StoreResult<Option<super::ChallengeRecord>> {
        self.run(move |c| {
            Ok(challenges::table.find(id)
                .first::<models::Challenge>(c)
                .optional()?
                .map(Into::into))
        }).await
    }

    async fn mark_challenge_valid(
        &self, id: uuid::Uuid, verified_at: DateTime<Utc>,
    ) -> StoreResult<Option<super::ChallengeRecord>> {
        self.run(move |c| {
            Ok(diesel::update(challenges::table
                .filter(challenges::id.eq(id))
                .filter(challenges::status.eq(super::ChallengeStatus::Pending)))
                .set((
                    challenges::status.eq(super::ChallengeStatus::Valid),
                    challenges::verified_at.eq(Some(verified_at)),
                ))
                .get_result::<models::Challenge>(c)
                .optional()?
                .map(Into::into))
        }).await
    }

    async fn store_csr(&self, order_id: uuid::Uuid, csr: &[u8], now: DateTime<Utc>) -> StoreResult<bool> {
        let csr = csr.to_vec();
        self.run(move |c| {
            Ok(c.transaction::<_, diesel::result::Error, _>(|c| {
                let order: Option<models::Order> = orders::table.find(order_id)
                    .for_update()
                    .get_result(c)
                    .optional()?;
                let order = match order {
                    Some(o) => o,
                    None => return Ok(false),
                };
                if order.csr.is_some() || order.error.is_some() || order.expires_at <= now {
                    return Ok(false);
                }

                let authorization_ids: Vec<uuid::Uuid> = identifiers::table
                    .filter(identifiers::order_id.eq(order_id))
                    .select(identifiers::authorization_id)
                    .load(c)?;
                let validated: Vec<uuid::Uuid> = challenges::table
                    .filter(challenges::authorization_id.eq_any(&authorization_ids))
                    .filter(challenges::status.eq(super::ChallengeStatus::Valid))
                    .select(challenges::authorization_id)
                    .distinct()
                    .load(c)?;
                if authorization_ids.is_empty() || validated.len() != authorization_ids.len() {
                    return Ok(false);
                }

                diesel::update(orders::table.find(order_id))
                    .set(orders::csr.eq(Some(&csr)))
                    .execute(c)?;
                Ok(true)
            })?)
        }).await
    }

    async fn claim_processing_order(
        &self, now: DateTime<Utc>, lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<super::OrderRecord>> {
        self.run(move |c| {
            Ok(c.transaction::<_, diesel::result::Error, _>(|c| {
                let order: Option<models::Order> = orders::table
                    .filter(orders::csr.is_not_null())
                    .filter(orders::certificate_pem.is_null())
                    .filter(orders::error.is_null())
                    .filter(orders::claimed_until.le(now))
                    .order(orders::created_at.asc())
                    .limit(1)
                    .for_update()
                    .skip_locked()
                    .get_result(c)
                    .optional()?;
                let mut order = match order {
                    Some(o) => o,
                    None => return Ok(None),
                };
                diesel::update(orders::table.find(order.id))
                    .set(orders::claimed_until.eq(lease_until))
                    .execute(c)?;
                order.claimed_until = lease_until;
                Ok(Some(order.into()))
            })?)
        }).await
    }

    async fn defer_order(&self, order_id: uuid::Uuid, retry_at: DateTime<Utc>) -> StoreResult<()> {
        self.run(move |c| {
            diesel::update(orders::table.find(order_id))
                .set(orders::claimed_until.eq(retry_at))
                .execute(c)?;
            Ok(())
        }).await
    }

    async fn complete_order(
        &self, order_id: uuid::Uuid, certificate: &super::IssuedCertificate, issued_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let certificate = certificate.clone();
        self.run(move |c| {
            let updated = diesel::update(orders::table
                .filter(orders::id.eq(order_id))
                .filter(orders::certificate_pem.is_null()))
                .set((
                    orders::certificate_id.eq(Some(certificate.certificate_id)),
                    orders::certificate_pem.eq(Some(&certificate.pem_chain)),
                    orders::serial_number.eq(Some(&certificate.serial_number)),
                    orders::certificate_issued_at.eq(Some(issued_at)),
                    orders::certificate_expires_at.eq(Some(certificate.not_after)),
                ))
                .execute(c)?;
            Ok(updated == 1)
        }).await
    }

    async fn fail_order(&self, order_id: uuid::Uuid, error: &str) -> StoreResult<()> {
        let error = error.to_string();
        self.run(move |c| {
            c.transaction::<_, diesel::result::Error, _>(|c| {
                diesel::update(orders::table.find(order_id))
                    .set(orders::error.eq(Some(&error)))
                    .execute(c)?;
                let authorization_ids: Vec<uuid::Uuid> = identifiers::table
                    .filter(identifiers::order_id.eq(order_id))
                    .select(identifiers::authorization_id)
                    .load(c)?;
                diesel::update(challenges::table
                    .filter(challenges::authorization_id.eq_any(&authorization_ids))
                    .filter(challenges::status.eq(super::ChallengeStatus::Pending)))
                    .set(challenges::status.eq(super::ChallengeStatus::Invalid))
                    .execute(c)?;
                Ok(())
            })?;
            Ok(())
        }).await
    }

    async fn find_order_by_serial(&self, serial_number: &str) -> StoreResult<Option<super::OrderRecord>> {
        let serial_number = serial_number.to_string();
        self.run(move |c| {
            Ok(orders::table.filter(orders::serial_number.eq(&serial_number))
                .first::<models::Order>(c)
                .optional()?
                .map(Into::into))
        }).await
    }

    async fn revoke_certificate(
        &self, order_id: uuid::Uuid, reason: i32, revoked_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.run(move |c| {
            let updated = diesel::update(orders::table
                .filter(orders::id.eq(order_id))
                .filter(orders::certificate_pem.is_not_null())
                .filter(orders::revoked_at.is_null()))
                .set((
                    orders::revoked_at.eq(Some(revoked_at)),
                    orders::revocation_reason.eq(Some(reason)),
                ))
                .execute(c)?;
            Ok(updated == 1)
        }).await
    }
}

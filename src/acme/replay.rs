use crate::types;

/// Hands out replay nonces and accepts each at most once.
#[derive(Clone)]
pub struct NonceRegistry {
    store: std::sync::Arc<dyn crate::store::Store>,
    lifetime: chrono::Duration,
}

fn bad_nonce(detail: &str) -> types::error::Error {
    types::error::Error::new(types::error::Type::BadNonce, "Bad nonce", detail)
}

impl NonceRegistry {
    pub fn new(store: std::sync::Arc<dyn crate::store::Store>, lifetime: chrono::Duration) -> Self {
        NonceRegistry {
            store,
            lifetime,
        }
    }

    pub async fn issue(&self) -> super::ACMEResult<String> {
        let nonce = match crate::util::random_token(16) {
            Ok(v) => v,
            Err(err) => {
                error!("Unable to generate nonce: {}", err);
                return Err(crate::internal_server_error!());
            }
        };
        crate::try_db_result!(
            self.store.insert_nonce(&nonce, chrono::Utc::now()).await, "Error inserting new nonce: {}"
        )?;
        Ok(nonce)
    }

    pub async fn consume(&self, nonce: &str) -> super::ACMEResult<()> {
        let now = chrono::Utc::now();
        let issued_at = crate::try_db_result!(
            self.store.nonce_issued_at(nonce).await, "Error checking nonce validity: {}"
        )?;
        match issued_at {
            None => return Err(bad_nonce("The nonce was not issued by this server")),
            Some(t) if t + self.lifetime < now => {
                return Err(bad_nonce("The nonce has expired"));
            }
            Some(_) => {}
        }

        let fresh = crate::try_db_result!(
            self.store.redeem_nonce(nonce, now).await, "Error redeeming nonce: {}"
        )?;
        if !fresh {
            return Err(bad_nonce("The nonce has already been used"));
        }
        Ok(())
    }

    /// Drops nonces too old to be accepted any more.
    pub async fn prune(&self) -> Result<usize, crate::store::StoreError> {
        self.store.prune_nonces(chrono::Utc::now() - self.lifetime).await
    }
}

//! Background worker turning processing orders into certificates.
//!
//! Finalize only records the CSR; this task picks those orders up oldest first,
//! signs them with their provisioner's issuer and stores the result.

use chrono::prelude::*;
use crate::store::{self, StoreError};
use crate::types;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Stopping,
    Stopped,
}

pub struct IssuancePipeline {
    store: std::sync::Arc<dyn store::Store>,
    provisioners: std::sync::Arc<crate::provisioner::ProvisionerRegistry>,
    nonces: crate::acme::replay::NonceRegistry,
    poll_interval: std::time::Duration,
    retry_delay: chrono::Duration,
    claim_lease: chrono::Duration,
}

impl IssuancePipeline {
    pub fn new(
        store: std::sync::Arc<dyn store::Store>,
        provisioners: std::sync::Arc<crate::provisioner::ProvisionerRegistry>,
        nonces: crate::acme::replay::NonceRegistry,
        config: &crate::config::IssuanceConfig,
    ) -> Self {
        IssuancePipeline {
            store,
            provisioners,
            nonces,
            poll_interval: std::time::Duration::from_secs(config.poll_interval),
            retry_delay: chrono::Duration::seconds(config.poll_interval as i64),
            claim_lease: chrono::Duration::seconds(config.claim_lease as i64),
        }
    }

    pub fn from_context(context: &crate::acme::Context) -> Self {
        Self::new(
            context.store.clone(),
            context.provisioners.clone(),
            context.nonces.clone(),
            &context.config.issuance,
        )
    }

    /// Claims and issues a single order. `false` when nothing was waiting.
    pub async fn process_next(&self) -> Result<bool, StoreError> {
        let now = Utc::now();
        let order = match self.store.claim_processing_order(now, now + self.claim_lease).await? {
            Some(o) => o,
            None => return Ok(false),
        };
        let csr = match &order.csr {
            Some(c) => c,
            None => return Ok(true),
        };

        let provisioner = match self.provisioners.get(&order.provisioner) {
            Some(p) => p,
            None => {
                error!("Order {} belongs to unknown provisioner '{}'", order.id, order.provisioner);
                self.store.defer_order(order.id, now + self.retry_delay).await?;
                return Ok(true);
            }
        };

        let identifiers = self.store.order_authorizations(order.id).await?
            .iter()
            .filter(|a| a.is_valid())
            .map(|a| a.identifier.to_identifier())
            .collect::<Vec<_>>();

        // Never backdated to when the order was placed.
        let not_before = std::cmp::max(order.not_before, now);
        match crate::ca::CertificateFactory::new(&provisioner.issuer).issue(csr, &identifiers, not_before, order.not_after) {
            Ok(certificate) => {
                if self.store.complete_order(order.id, &certificate, Utc::now()).await? {
                    info!(
                        "Issued certificate {} for order {}, valid until {}",
                        certificate.serial_number, order.id, certificate.not_after
                    );
                } else {
                    warn!("Order {} already had a certificate, discarding {}", order.id, certificate.serial_number);
                }
            }
            Err(err) if err.error_type == types::error::Type::BadCSR => {
                info!("Rejecting CSR of order {}: {}", order.id, err.detail);
                let document = match serde_json::to_string(&err) {
                    Ok(d) => d,
                    Err(e) => {
                        error!("Unable to serialize order error: {}", e);
                        String::new()
                    }
                };
                self.store.fail_order(order.id, &document).await?;
            }
            Err(err) => {
                warn!("Unable to issue certificate for order {}, will retry: {}", order.id, err);
                self.store.defer_order(order.id, now + self.retry_delay).await?;
            }
        }
        Ok(true)
    }

    async fn run(
        self, mut stop: tokio::sync::watch::Receiver<bool>, state: std::sync::Arc<tokio::sync::watch::Sender<PipelineState>>,
    ) {
        info!("Issuance pipeline running");
        while !*stop.borrow() {
            let worked = match self.process_next().await {
                Ok(w) => w,
                Err(err) => {
                    error!("Unable to process orders: {}", err);
                    false
                }
            };
            if worked {
                continue;
            }

            match self.nonces.prune().await {
                Ok(0) => {}
                Ok(n) => debug!("Pruned {} expired nonces", n),
                Err(err) => warn!("Unable to prune nonces: {}", err),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                res = stop.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        state.send_replace(PipelineState::Stopped);
        info!("Issuance pipeline stopped");
    }

    pub fn spawn(self) -> PipelineHandle {
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let (state_tx, state_rx) = tokio::sync::watch::channel(PipelineState::Running);
        let state_tx = std::sync::Arc::new(state_tx);
        let task = tokio::spawn(self.run(stop_rx, state_tx.clone()));
        PipelineHandle {
            stop: stop_tx,
            state: state_tx,
            state_rx,
            task,
        }
    }
}

pub struct PipelineHandle {
    stop: tokio::sync::watch::Sender<bool>,
    state: std::sync::Arc<tokio::sync::watch::Sender<PipelineState>>,
    state_rx: tokio::sync::watch::Receiver<PipelineState>,
    task: tokio::task::JoinHandle<()>,
}

impl PipelineHandle {
    pub fn state(&self) -> PipelineState {
        *self.state_rx.borrow()
    }

    /// Signals the worker and waits for the order in hand to finish.
    pub async fn shutdown(self) {
        if *self.state_rx.borrow() == PipelineState::Running {
            self.state.send_replace(PipelineState::Stopping);
        }
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            error!("Issuance pipeline task failed: {}", err);
        }
    }
}

/// Starts the pipeline once Rocket has lifted off and stops it on shutdown.
#[derive(Default)]
pub struct IssuanceFairing {
    handle: tokio::sync::Mutex<Option<PipelineHandle>>,
}

#[rocket::async_trait]
impl rocket::fairing::Fairing for IssuanceFairing {
    fn info(&self) -> rocket::fairing::Info {
        rocket::fairing::Info {
            name: "Issuance pipeline",
            kind: rocket::fairing::Kind::Liftoff | rocket::fairing::Kind::Shutdown,
        }
    }

    async fn on_liftoff(&self, rocket: &rocket::Rocket<rocket::Orbit>) {
        let context = match rocket.state::<crate::acme::Context>() {
            Some(c) => c,
            None => {
                error!("No ACME context managed, issuance pipeline not started");
                return;
            }
        };
        *self.handle.lock().await = Some(IssuancePipeline::from_context(context).spawn());
    }

    async fn on_shutdown(&self, _rocket: &rocket::Rocket<rocket::Orbit>) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::testing;

    struct Harness {
        store: std::sync::Arc<store::MemoryStore>,
        pipeline: IssuancePipeline,
        account: store::AccountRecord,
        provisioner: crate::provisioner::Provisioner,
    }

    impl Harness {
        async fn new() -> Self {
            let store = std::sync::Arc::new(store::MemoryStore::new());
            let account = testing::account_record(&testing::ec_key());
            store.insert_account(&account).await.unwrap();
            let provisioners = crate::provisioner::ProvisionerRegistry::new(vec![
                testing::provisioner(Default::default()),
            ]);
            let nonces = crate::acme::replay::NonceRegistry::new(store.clone(), chrono::Duration::hours(1));
            let pipeline = IssuancePipeline::new(
                store.clone(), std::sync::Arc::new(provisioners), nonces, &Default::default(),
            );
            Harness {
                store,
                pipeline,
                account,
                provisioner: testing::provisioner(Default::default()),
            }
        }

        /// A ready order for `names` with `csr` attached.
        async fn processing_order(&self, names: &[&str], csr: &[u8]) -> store::OrderRecord {
            let config = crate::config::Config::default();
            let machine = crate::acme::orders::OrderStateMachine::new(self.store.as_ref(), &config);
            let (order, authorizations) = machine.create_order(&self.account, &self.provisioner, &types::order::OrderCreate {
                identifiers: names.iter().map(|n| types::identifier::Identifier::dns(*n)).collect(),
                not_before: None,
                not_after: None,
            }, Utc::now()).await.unwrap();
            for authorization in &authorizations {
                self.store.mark_challenge_valid(authorization.challenges[0].id, Utc::now()).await.unwrap();
            }
            assert!(self.store.store_csr(order.id, csr, Utc::now()).await.unwrap());
            order
        }
    }

    #[tokio::test]
    async fn test_processing_order_becomes_valid() {
        let harness = Harness::new().await;
        let key = testing::ec_key();
        let csr = testing::csr_der(&key, None, &["example.com", "www.example.com"], &[]);
        let order = harness.processing_order(&["example.com", "www.example.com"], &csr).await;

        assert!(harness.pipeline.process_next().await.unwrap());
        assert!(!harness.pipeline.process_next().await.unwrap());

        let order = harness.store.get_order(order.id).await.unwrap().unwrap();
        let authorizations = harness.store.order_authorizations(order.id).await.unwrap();
        assert_eq!(
            crate::acme::orders::order_status(&order, &authorizations, Utc::now()),
            types::order::Status::Valid
        );
        let pem = order.certificate_pem.unwrap();
        let chain = openssl::x509::X509::stack_from_pem(pem.as_bytes()).unwrap();
        assert!(chain[0].public_key().unwrap().public_eq(&key));
        let serial = crate::ca::serial_hex(&chain[0].serial_number().to_bn().unwrap()).unwrap();
        assert_eq!(order.serial_number, Some(serial.clone()));
        assert_eq!(harness.store.find_order_by_serial(&serial).await.unwrap().unwrap().id, order.id);
    }

    #[tokio::test]
    async fn test_bad_csr_invalidates_order() {
        let harness = Harness::new().await;
        let key = testing::ec_key();
        let csr = testing::csr_der(&key, None, &["example.com", "other.example.net"], &[]);
        let order = harness.processing_order(&["example.com"], &csr).await;

        assert!(harness.pipeline.process_next().await.unwrap());

        let order = harness.store.get_order(order.id).await.unwrap().unwrap();
        assert!(order.certificate_pem.is_none());
        let error = order.error_document().unwrap();
        assert_eq!(error.error_type, types::error::Type::BadCSR);
        assert_eq!(
            crate::acme::orders::order_status(&order, &[], Utc::now()),
            types::order::Status::Invalid
        );
        assert!(!harness.pipeline.process_next().await.unwrap());
    }

    #[tokio::test]
    async fn test_certificate_starts_at_order_not_before() {
        let harness = Harness::new().await;
        let key = testing::ec_key();
        let now = Utc::now();
        let mut order = store::OrderRecord::new(
            harness.account.id, "default", now, now + chrono::Duration::days(30), now + chrono::Duration::days(1),
        );
        order.not_before = now + chrono::Duration::days(2);
        order.csr = Some(testing::csr_der(&key, None, &["example.com"], &[]));
        let authorization_id = uuid::Uuid::new_v4();
        harness.store.insert_order(&order, &[store::AuthorizationRecord {
            identifier: store::IdentifierRecord {
                authorization_id,
                order_id: order.id,
                id_type: store::IdentifierType::Dns,
                value: "example.com".to_string(),
            },
            challenges: vec![store::ChallengeRecord {
                id: uuid::Uuid::new_v4(),
                authorization_id,
                challenge_type: store::ChallengeType::Dns01,
                token: "token".to_string(),
                status: store::ChallengeStatus::Valid,
                verified_at: Some(now),
            }],
        }]).await.unwrap();

        assert!(harness.pipeline.process_next().await.unwrap());

        let issued = harness.store.get_order(order.id).await.unwrap().unwrap();
        let chain = openssl::x509::X509::stack_from_pem(issued.certificate_pem.unwrap().as_bytes()).unwrap();
        let not_before = crate::util::asn1_time_to_chrono(chain[0].not_before()).unwrap();
        assert_eq!(not_before.timestamp(), order.not_before.timestamp());
    }

    #[tokio::test]
    async fn test_orders_issued_oldest_first() {
        let harness = Harness::new().await;
        let key = testing::ec_key();
        let first = harness.processing_order(&["a.example.com"], &testing::csr_der(&key, None, &["a.example.com"], &[])).await;
        let second = harness.processing_order(&["b.example.com"], &testing::csr_der(&key, None, &["b.example.com"], &[])).await;

        assert!(harness.pipeline.process_next().await.unwrap());
        assert!(harness.store.get_order(first.id).await.unwrap().unwrap().certificate_pem.is_some());
        assert!(harness.store.get_order(second.id).await.unwrap().unwrap().certificate_pem.is_none());

        assert!(harness.pipeline.process_next().await.unwrap());
        assert!(harness.store.get_order(second.id).await.unwrap().unwrap().certificate_pem.is_some());
    }

    #[tokio::test]
    async fn test_spawned_pipeline_issues_and_stops() {
        let harness = Harness::new().await;
        let key = testing::ec_key();
        let order = harness.processing_order(&["example.com"], &testing::csr_der(&key, None, &["example.com"], &[])).await;
        let store = harness.store.clone();

        let handle = harness.pipeline.spawn();
        assert_eq!(handle.state(), PipelineState::Running);

        let mut issued = false;
        for _ in 0..50 {
            if store.get_order(order.id).await.unwrap().unwrap().certificate_pem.is_some() {
                issued = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(issued);

        tokio::time::timeout(std::time::Duration::from_secs(5), handle.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_state_reported() {
        let harness = Harness::new().await;
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(true);
        let (state_tx, state_rx) = tokio::sync::watch::channel(PipelineState::Stopping);
        harness.pipeline.run(stop_rx, std::sync::Arc::new(state_tx)).await;
        assert_eq!(*state_rx.borrow(), PipelineState::Stopped);
        drop(stop_tx);
    }
}

//! Order, authorization and challenge lifecycle.
//!
//! Order status is never stored; it is derived from the order row and its
//! authorizations every time it is needed, in this precedence:
//! error, certificate, CSR, expiry, all-identifiers-valid, pending.

use chrono::prelude::*;
use crate::store::{self, AuthorizationRecord, ChallengeRecord, OrderRecord};
use crate::types;

pub fn order_status(order: &OrderRecord, authorizations: &[AuthorizationRecord], now: DateTime<Utc>) -> types::order::Status {
    if order.error.is_some() {
        types::order::Status::Invalid
    } else if order.certificate_pem.is_some() {
        types::order::Status::Valid
    } else if order.csr.is_some() {
        types::order::Status::Processing
    } else if order.expires_at <= now {
        types::order::Status::Invalid
    } else if !authorizations.is_empty() && authorizations.iter().all(|a| a.is_valid()) {
        types::order::Status::Ready
    } else {
        types::order::Status::Pending
    }
}

pub fn authorization_status(
    order: &OrderRecord, authorization: &AuthorizationRecord, now: DateTime<Utc>,
) -> types::authorization::Status {
    if authorization.is_valid() {
        types::authorization::Status::Valid
    } else if order.error.is_some() ||
        authorization.challenges.iter().all(|c| c.status == store::ChallengeStatus::Invalid) {
        types::authorization::Status::Invalid
    } else if order.expires_at <= now {
        types::authorization::Status::Expired
    } else {
        types::authorization::Status::Pending
    }
}

pub fn order_view(
    order: &OrderRecord, authorizations: &[AuthorizationRecord], urls: &super::links::Urls, now: DateTime<Utc>,
) -> types::order::Order {
    let status = order_status(order, authorizations, now);
    types::order::Order {
        status,
        expires: Some(order.expires_at),
        identifiers: authorizations.iter().map(|a| a.identifier.to_identifier()).collect(),
        not_before: Some(order.not_before),
        not_after: Some(order.not_after),
        error: order.error_document(),
        authorizations: authorizations.iter()
            .map(|a| urls.authorization(&a.identifier.authorization_id))
            .collect(),
        finalize: urls.finalize(&order.id),
        certificate: match status {
            types::order::Status::Valid => Some(urls.certificate(&order.id)),
            _ => None,
        },
    }
}

pub fn challenge_view(challenge: &ChallengeRecord, urls: &super::links::Urls) -> types::challenge::Challenge {
    let challenge_type = types::challenge::Type::from(challenge.challenge_type);
    types::challenge::Challenge {
        challenge_type,
        url: urls.challenge(&challenge.id, challenge_type),
        status: challenge.status.into(),
        validated: challenge.verified_at,
        error: None,
        token: challenge.token.clone(),
    }
}

pub fn authorization_view(
    order: &OrderRecord, authorization: &AuthorizationRecord, urls: &super::links::Urls, now: DateTime<Utc>,
) -> types::authorization::Authorization {
    let mut identifier = authorization.identifier.to_identifier();
    let wildcard = authorization.identifier.is_wildcard();
    if wildcard {
        identifier.value = identifier.value.trim_start_matches("*.").to_string();
    }
    types::authorization::Authorization {
        identifier,
        status: authorization_status(order, authorization, now),
        expires: Some(order.expires_at),
        challenges: authorization.challenges.iter().map(|c| challenge_view(c, urls)).collect(),
        wildcard: if wildcard { Some(true) } else { None },
    }
}

fn rejected<D: Into<String>>(identifier: &types::identifier::Identifier, detail: D) -> types::error::Error {
    types::error::Error::new(types::error::Type::RejectedIdentifier, "Rejected identifier", detail)
        .with_identifier(identifier.clone())
}

/// LDH hostname, optionally with `*` as the whole leftmost label. Returns the normalised name.
fn check_dns_name(value: &str) -> Result<String, String> {
    let value = value.trim_end_matches('.').to_ascii_lowercase();
    let name = trust_dns_proto::rr::Name::from_ascii(&value)
        .map_err(|e| format!("'{}' is not a valid domain name: {}", value, e))?;
    if value.len() > 253 {
        return Err(format!("'{}' is too long", value));
    }

    let labels = name.iter().collect::<Vec<_>>();
    if labels.len() < 2 {
        return Err(format!("'{}' is not a fully qualified domain name", value));
    }
    for (i, label) in labels.iter().enumerate() {
        if i == 0 && *label == b"*" {
            continue;
        }
        if label.is_empty() || label.len() > 63 {
            return Err(format!("'{}' has a label of invalid length", value));
        }
        if !label.iter().all(|c| c.is_ascii_alphanumeric() || *c == b'-') {
            return Err(format!("'{}' contains invalid characters", value));
        }
        if label.starts_with(b"-") || label.ends_with(b"-") {
            return Err(format!("'{}' has a label starting or ending with a hyphen", value));
        }
    }
    if labels.last().map_or(false, |tld| tld.iter().all(|c| c.is_ascii_digit())) {
        return Err(format!("'{}' has an all-numeric top level label", value));
    }
    Ok(value)
}

fn suffix_allowed(value: &str, suffixes: &[String]) -> bool {
    if suffixes.is_empty() {
        return true;
    }
    let value = value.trim_start_matches("*.");
    suffixes.iter().any(|s| value == s || value.ends_with(&format!(".{}", s)))
}

/// Checks requested identifiers against syntax and provisioner policy, returning them normalised
/// and deduplicated in request order.
pub fn check_identifiers(
    requested: &[types::identifier::Identifier], policy: &crate::provisioner::Policy,
) -> super::ACMEResult<Vec<types::identifier::Identifier>> {
    if requested.is_empty() {
        return Err(types::error::Error::malformed("At least one identifier is required"));
    }

    let mut errors = vec![];
    let mut identifiers: Vec<types::identifier::Identifier> = vec![];
    for identifier in requested {
        let normalised = match types::identifier::Type::from_str(&identifier.id_type) {
            Some(types::identifier::Type::DNS) => {
                match check_dns_name(&identifier.value) {
                    Ok(value) => {
                        let normalised = types::identifier::Identifier::dns(value);
                        if normalised.is_wildcard() && !policy.allow_wildcards {
                            errors.push(rejected(identifier, "Wildcard identifiers are not allowed"));
                            continue;
                        }
                        if !suffix_allowed(&normalised.value, &policy.domain_suffixes) {
                            errors.push(rejected(identifier, format!(
                                "'{}' is not within a domain this CA issues for", normalised.value
                            )));
                            continue;
                        }
                        normalised
                    }
                    Err(e) => {
                        errors.push(rejected(identifier, e));
                        continue;
                    }
                }
            }
            Some(types::identifier::Type::IP) => {
                if !policy.allow_ip {
                    errors.push(rejected(identifier, "IP address identifiers are not allowed"));
                    continue;
                }
                match identifier.value.parse::<std::net::IpAddr>() {
                    Ok(ip) => types::identifier::Identifier::ip(ip),
                    Err(_) => {
                        errors.push(rejected(identifier, format!("'{}' is not a valid IP address", identifier.value)));
                        continue;
                    }
                }
            }
            None => {
                errors.push(types::error::Error::new(
                    types::error::Type::UnsupportedIdentifier, "Unsupported identifier",
                    format!("'{}' is not an identifier type this CA supports", identifier.id_type),
                ).with_identifier(identifier.clone()));
                continue;
            }
        };
        if !identifiers.contains(&normalised) {
            identifiers.push(normalised);
        }
    }

    crate::util::error_list_to_result(errors, "Invalid identifiers requested".to_string())?;
    Ok(identifiers)
}

/// Challenge types offered for an identifier.
pub fn challenge_types(identifier: &types::identifier::Identifier) -> Vec<store::ChallengeType> {
    match types::identifier::Type::from_str(&identifier.id_type) {
        Some(types::identifier::Type::IP) => vec![store::ChallengeType::Http01],
        _ if identifier.is_wildcard() => vec![store::ChallengeType::Dns01],
        _ => vec![store::ChallengeType::Http01, store::ChallengeType::Dns01],
    }
}

pub struct OrderStateMachine<'a> {
    store: &'a dyn store::Store,
    max_pending_orders: u32,
    order_lifetime: chrono::Duration,
}

impl<'a> OrderStateMachine<'a> {
    pub fn new(store: &'a dyn store::Store, config: &crate::config::Config) -> Self {
        OrderStateMachine {
            store,
            max_pending_orders: config.max_pending_orders,
            order_lifetime: config.order_lifetime(),
        }
    }

    pub async fn create_order(
        &self, account: &store::AccountRecord, provisioner: &crate::provisioner::Provisioner,
        request: &types::order::OrderCreate, now: DateTime<Utc>,
    ) -> super::ACMEResult<(OrderRecord, Vec<AuthorizationRecord>)> {
        if account.emails.is_empty() {
            return Err(types::error::Error::new(
                types::error::Type::InvalidContact, "No contact",
                "An email contact is required on the account before ordering",
            ));
        }
        if self.max_pending_orders > 0 {
            let pending = crate::try_db_result!(
                self.store.count_unfinished_orders(account.id, now).await,
                "Unable to count pending orders: {}"
            )?;
            if pending >= self.max_pending_orders as i64 {
                return Err(types::error::Error::new(
                    types::error::Type::RateLimited, "Too many orders",
                    format!("Accounts may have at most {} unfinished orders", self.max_pending_orders),
                ));
            }
        }
        if request.not_before.is_some() {
            return Err(types::error::Error::malformed("notBefore is not supported"));
        }

        let identifiers = check_identifiers(&request.identifiers, &provisioner.policy)?;

        let max_not_after = now + provisioner.policy.cert_validity;
        let not_after = match request.not_after {
            Some(requested) if requested <= now => {
                return Err(types::error::Error::malformed("notAfter must be in the future"));
            }
            Some(requested) => std::cmp::min(requested, max_not_after),
            None => max_not_after,
        };
        let not_after = std::cmp::min(not_after, provisioner.issuer.not_after);
        if not_after <= now {
            error!("Issuer of provisioner '{}' has expired", provisioner.name);
            return Err(crate::internal_server_error!());
        }

        let order = OrderRecord::new(account.id, &provisioner.name, now, not_after, now + self.order_lifetime);
        let mut authorizations = vec![];
        for identifier in &identifiers {
            let authorization_id = uuid::Uuid::new_v4();
            let mut challenges = vec![];
            for challenge_type in challenge_types(identifier) {
                let token = crate::try_db_result!(
                    crate::util::random_token(32), "Unable to generate challenge token: {}"
                )?;
                challenges.push(ChallengeRecord {
                    id: uuid::Uuid::new_v4(),
                    authorization_id,
                    challenge_type,
                    token,
                    status: store::ChallengeStatus::Pending,
                    verified_at: None,
                });
            }
            let id_type = match types::identifier::Type::from_str(&identifier.id_type) {
                Some(t) => t,
                None => return Err(crate::internal_server_error!()),
            };
            authorizations.push(AuthorizationRecord {
                identifier: store::IdentifierRecord {
                    authorization_id,
                    order_id: order.id,
                    id_type: id_type.into(),
                    value: identifier.value.clone(),
                },
                challenges,
            });
        }

        crate::try_db_result!(
            self.store.insert_order(&order, &authorizations).await,
            "Unable to save order: {}"
        )?;
        info!(
            "Created order {} for account {} on '{}' with {} identifier(s)",
            order.id, account.id, provisioner.name, authorizations.len()
        );
        Ok((order, authorizations))
    }

    /// Applies a validation result to a challenge. A failed validation leaves the challenge
    /// pending and is returned as a connection problem.
    pub async fn record_challenge_outcome(
        &self, challenge: &ChallengeRecord, outcome: Result<(), String>, now: DateTime<Utc>,
    ) -> super::ACMEResult<ChallengeRecord> {
        match outcome {
            Ok(()) => {
                let updated = crate::try_db_result!(
                    self.store.mark_challenge_valid(challenge.id, now).await,
                    "Unable to update challenge: {}"
                )?;
                match updated {
                    Some(c) => {
                        info!("Challenge {} validated", c.id);
                        Ok(c)
                    }
                    None => {
                        let current = crate::try_db_result!(
                            self.store.get_challenge(challenge.id).await,
                            "Unable to get challenge: {}"
                        )?;
                        current.ok_or_else(|| types::error::Error::not_found("Challenge does not exist"))
                    }
                }
            }
            Err(reason) => {
                debug!("Challenge {} failed validation: {}", challenge.id, reason);
                Err(types::error::Error::new(types::error::Type::Connection, "Validation failed", reason))
            }
        }
    }

    /// Attaches a CSR to a ready order, moving it to processing.
    pub async fn accept_finalize(
        &self, account_key: &openssl::pkey::PKeyRef<openssl::pkey::Public>, order: &OrderRecord,
        csr_der: &[u8], now: DateTime<Utc>,
    ) -> super::ACMEResult<OrderRecord> {
        let authorizations = crate::try_db_result!(
            self.store.order_authorizations(order.id).await,
            "Unable to get order authorizations: {}"
        )?;
        match order_status(order, &authorizations, now) {
            types::order::Status::Ready => {}
            types::order::Status::Pending => {
                return Err(types::error::Error::bad_csr("Not all identifiers on the order have been validated"));
            }
            _ => {
                return Err(types::error::Error::new(
                    types::error::Type::OrderNotReady, "Order not ready", "The order cannot be finalized in its current state",
                ));
            }
        }

        let parsed = crate::ca::csr::parse_csr(csr_der)?;
        if parsed.identifiers.is_empty() {
            return Err(types::error::Error::bad_csr("CSR does not request any identifiers"));
        }
        for requested in &parsed.identifiers {
            let authorized = authorizations.iter()
                .any(|a| a.is_valid() && &a.identifier.to_identifier() == requested);
            if !authorized {
                return Err(types::error::Error::bad_csr(format!(
                    "'{}' is not a validated identifier on this order", requested.value
                )).with_identifier(requested.clone()));
            }
        }
        if parsed.public_key.public_eq(account_key) {
            return Err(types::error::Error::bad_csr("The certificate key must differ from the account key"));
        }

        let stored = crate::try_db_result!(
            self.store.store_csr(order.id, csr_der, now).await,
            "Unable to save CSR: {}"
        )?;
        if !stored {
            return Err(types::error::Error::new(
                types::error::Type::OrderNotReady, "Order not ready", "The order changed state while being finalized",
            ));
        }

        info!("Order {} finalized, awaiting issuance", order.id);
        let order = crate::try_db_result!(self.store.get_order(order.id).await, "Unable to get order: {}")?;
        order.ok_or_else(|| types::error::Error::not_found("Order does not exist"))
    }
}

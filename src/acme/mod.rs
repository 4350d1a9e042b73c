use std::convert::TryFrom;
use rocket::serde::json::Json;
use crate::{store, types};

pub mod jws;
pub mod links;
pub mod orders;
pub mod replay;
pub mod responses;

pub type ACMEResult<I> = Result<I, types::error::Error>;

#[macro_export]
macro_rules! try_db_result {
    ($src:expr, $err:expr) => {
        (match ($src) {
            Ok(inner) => Ok(inner),
            Err(err) => {
                error!($err, err);
                Err(crate::internal_server_error!())
            }
        })
    }
}

#[macro_export]
macro_rules! internal_server_error {
    () => {
        crate::types::error::Error {
            error_type: crate::types::error::Type::ServerInternal,
            status: 500,
            title: String::from("Internal Server Error"),
            detail: "Something really went wrong there, we have no idea what it was".to_string(),
            sub_problems: vec ! [],
            instance: None,
            identifier: None,
        }
    }
}

macro_rules! try_result {
    ($src:expr) => {
        (match ($src) {
            Ok(inner) => inner,
            Err(err) => {
                return responses::ACMEResponse::new_error(err);
            }
        })
    }
}

macro_rules! ensure_request_key_kid {
    ($src:expr) => {
        match $src {
            jws::JWSRequestKey::KID(k) => k,
            jws::JWSRequestKey::JWK { .. } => {
                return responses::ACMEResponse::new_error(types::error::Error::malformed("'jwk' field cannot be used"));
            }
        }
    }
}

macro_rules! ensure_request_key_jwk {
    ($src:expr) => {
        match $src {
            jws::JWSRequestKey::KID(_) => {
                return responses::ACMEResponse::new_error(types::error::Error::malformed("'kid' field cannot be used"));
            }
            jws::JWSRequestKey::JWK { kid: _, key } => key
        }
    }
}

macro_rules! ensure_not_post_as_get {
    ($src:expr) => {
        match $src {
            Some(v) => v,
            None => {
                return responses::ACMEResponse::new_error(
                    types::error::Error::new(types::error::Type::Malformed, "Method not allowed", "POST-as-GET is not allowed")
                        .with_status(405)
                );
            }
        }
    }
}

macro_rules! ensure_post_as_get {
    ($src:expr) => {
        match $src {
            None => {},
            Some(_) => {
                return responses::ACMEResponse::new_error(
                    types::error::Error::new(types::error::Type::Malformed, "Method not allowed", "POST-as-GET is required")
                        .with_status(405)
                );
            }
        }
    }
}

macro_rules! decode_id {
    ($oid:expr) => {
        (match crate::util::b64_to_uuid($oid) {
            Some(v) => Ok(v),
            None => Err(types::error::Error::new(types::error::Type::Malformed, "Bad ID", "Invalid ID format")),
        })
    }
}

macro_rules! get_provisioner {
    ($ctx:expr, $name:expr) => {
        match $ctx.provisioners.get($name) {
            Some(p) => p,
            None => {
                return responses::ACMEResponse::new_error(types::error::Error::not_found(
                    format!("Provisioner '{}' does not exist", $name)
                ));
            }
        }
    }
}

/// Everything the ACME handlers share, managed by Rocket.
pub struct Context {
    pub config: std::sync::Arc<crate::config::Config>,
    pub store: std::sync::Arc<dyn store::Store>,
    pub nonces: replay::NonceRegistry,
    pub provisioners: std::sync::Arc<crate::provisioner::ProvisionerRegistry>,
    pub validator: std::sync::Arc<crate::validator::Validator>,
}

impl Context {
    pub fn new(
        config: crate::config::Config, store: std::sync::Arc<dyn store::Store>,
        provisioners: crate::provisioner::ProvisionerRegistry, validator: crate::validator::Validator,
    ) -> Self {
        let nonces = replay::NonceRegistry::new(store.clone(), config.nonce_lifetime());
        Context {
            config: std::sync::Arc::new(config),
            store,
            nonces,
            provisioners: std::sync::Arc::new(provisioners),
            validator: std::sync::Arc::new(validator),
        }
    }

    /// Builds the store, provisioners and validator described by `config`.
    pub async fn from_config(config: crate::config::Config) -> Result<Self, String> {
        let store: std::sync::Arc<dyn store::Store> = match &config.storage {
            crate::config::StorageConfig::Memory => {
                warn!("Using in-memory storage, all state will be lost on restart");
                std::sync::Arc::new(store::MemoryStore::new())
            }
            crate::config::StorageConfig::Postgres { url, pool_size } => std::sync::Arc::new(
                store::PgStore::connect(url, *pool_size).await.map_err(|e| e.to_string())?
            ),
        };
        let provisioners = crate::provisioner::ProvisionerRegistry::from_config(&config.provisioners)?;
        let validator = crate::validator::Validator::new(&config.validation)?;
        Ok(Self::new(config, store, provisioners, validator))
    }

    pub fn urls(&self, provisioner: &str) -> links::Urls {
        links::Urls::new(self.config.base_uri(), provisioner)
    }

    fn orders(&self) -> orders::OrderStateMachine<'_> {
        orders::OrderStateMachine::new(self.store.as_ref(), &self.config)
    }
}

#[derive(Debug)]
pub struct Account {
    pub record: store::AccountRecord,
    pub key: openssl::pkey::PKey<openssl::pkey::Public>,
}

fn account_view(record: &store::AccountRecord, urls: &links::Urls) -> types::account::Account {
    types::account::Account {
        status: if record.deactivated {
            types::account::Status::Deactivated
        } else {
            types::account::Status::Valid
        },
        contact: record.emails.iter().map(|e| format!("mailto:{}", e)).collect(),
        terms_of_service_agreed: true,
        orders: urls.account_orders(&record.id),
    }
}

/// Contacts must each be a single `mailto:` address. Returns the bare addresses.
fn parse_contacts(contacts: &[String]) -> ACMEResult<Vec<String>> {
    let mut errors = vec![];
    let mut emails = vec![];
    for contact in contacts {
        let address = match contact.strip_prefix("mailto:") {
            Some(a) => a,
            None => {
                errors.push(types::error::Error::new(
                    types::error::Type::UnsupportedContact, "Unsupported contact",
                    format!("'{}' is not a supported contact URI", contact),
                ));
                continue;
            }
        };
        let valid = match address.split_once('@') {
            Some((local, domain)) => !local.is_empty() && domain.contains('.') &&
                !address.contains(|c: char| c == ',' || c == '?' || c.is_whitespace()) &&
                !domain.contains('@'),
            None => false,
        };
        if !valid {
            errors.push(types::error::Error::new(
                types::error::Type::InvalidContact, "Invalid contact",
                format!("'{}' is not a valid email address", address),
            ));
            continue;
        }
        emails.push(address.to_string());
    }
    crate::util::error_list_to_result(errors, "Invalid contacts".to_string())?;
    Ok(emails)
}

fn check_account(aid: &str, account: &Account) -> ACMEResult<()> {
    let aid_uuid = decode_id!(aid)?;
    if aid_uuid != account.record.id {
        return Err(types::error::Error::unauthorized("Signing key does not match account URL"));
    }
    Ok(())
}

async fn get_order(ctx: &Context, provisioner: &str, oid: &str, account: &Account) -> ACMEResult<store::OrderRecord> {
    let oid_uuid = decode_id!(oid)?;
    let order = match crate::try_db_result!(ctx.store.get_order(oid_uuid).await, "Unable to search for order: {}")? {
        Some(o) if o.provisioner == provisioner => o,
        _ => return Err(types::error::Error::not_found(format!("Order ID {} does not exist", oid))),
    };
    if order.account_id != account.record.id {
        return Err(types::error::Error::unauthorized(format!("Order ID {} does not belong to the account", oid)));
    }
    Ok(order)
}

async fn get_authz(
    ctx: &Context, provisioner: &str, aid: uuid::Uuid, account: &Account,
) -> ACMEResult<(store::OrderRecord, store::AuthorizationRecord)> {
    let not_found = || types::error::Error::not_found("Authorization does not exist");
    let authz = crate::try_db_result!(ctx.store.get_authorization(aid).await, "Unable to search for authorization: {}")?
        .ok_or_else(not_found)?;
    let order = crate::try_db_result!(ctx.store.get_order(authz.identifier.order_id).await, "Unable to search for order: {}")?
        .ok_or_else(not_found)?;
    if order.provisioner != provisioner {
        return Err(not_found());
    }
    if order.account_id != account.record.id {
        return Err(types::error::Error::unauthorized("Authorization does not belong to the account"));
    }
    Ok((order, authz))
}

async fn order_response(
    ctx: &Context, provisioner: &str, order: &store::OrderRecord,
) -> ACMEResult<types::order::Order> {
    let authorizations = crate::try_db_result!(
        ctx.store.order_authorizations(order.id).await, "Unable to get order authorizations: {}"
    )?;
    Ok(orders::order_view(order, &authorizations, &ctx.urls(provisioner), chrono::Utc::now()))
}

#[get("/<provisioner>/directory")]
pub fn directory(
    provisioner: &str, ctx: &rocket::State<Context>,
) -> responses::ACMEResponse<Json<types::directory::Directory>> {
    get_provisioner!(ctx, provisioner);
    let urls = ctx.urls(provisioner);

    responses::ACMEResponse::ok(Json(types::directory::Directory {
        new_nonce: urls.new_nonce(),
        new_account: urls.new_account(),
        new_order: urls.new_order(),
        revoke_cert: urls.revoke_cert(),
        key_change: urls.key_change(),
        meta: Some(types::directory::Meta {
            terms_of_service: ctx.config.tos_uri.clone(),
            website: ctx.config.website_uri.clone(),
        }),
    }), rocket::http::Status::Ok)
}

#[head("/<provisioner>/acme/new-nonce")]
pub fn new_nonce_head(
    provisioner: &str, ctx: &rocket::State<Context>,
) -> responses::ACMEResponse<responses::Headers<()>> {
    get_provisioner!(ctx, provisioner);
    responses::ACMEResponse::ok(responses::Headers {
        responder: (),
        headers: vec![("Cache-Control".to_string(), "no-store".to_string())],
    }, rocket::http::Status::Ok)
}

#[get("/<provisioner>/acme/new-nonce")]
pub fn new_nonce(
    provisioner: &str, ctx: &rocket::State<Context>,
) -> responses::ACMEResponse<responses::Headers<()>> {
    get_provisioner!(ctx, provisioner);
    responses::ACMEResponse::ok(responses::Headers {
        responder: (),
        headers: vec![("Cache-Control".to_string(), "no-store".to_string())],
    }, rocket::http::Status::NoContent)
}

#[post("/<provisioner>/acme/new-acct", data = "<acct>")]
pub async fn new_account(
    provisioner: &str,
    acct: ACMEResult<jws::JWSRequest<types::account::AccountCreate>>,
    ctx: &rocket::State<Context>,
) -> responses::ACMEResponse<responses::Headers<Json<types::account::Account>>> {
    let acct = try_result!(acct);
    get_provisioner!(ctx, provisioner);
    let acct_key = ensure_request_key_jwk!(acct.key);
    let payload = ensure_not_post_as_get!(acct.payload);
    let urls = ctx.urls(provisioner);

    let acct_key_bytes = match acct_key.public_key_to_der() {
        Ok(v) => v,
        Err(err) => {
            error!("Unable to encode account key: {}", err);
            return responses::ACMEResponse::new_error(crate::internal_server_error!());
        }
    };

    let existing_account = try_result!(crate::try_db_result!(
        ctx.store.find_account_by_key(&acct_key_bytes).await, "Unable to search for existing account: {}"
    ));
    if let Some(existing) = existing_account {
        return responses::ACMEResponse::ok(responses::Headers {
            responder: Json(account_view(&existing, &urls)),
            headers: vec![("Location".to_string(), urls.account(&existing.id))],
        }, rocket::http::Status::Ok);
    }

    if payload.only_return_existing {
        return responses::ACMEResponse::new_error(types::error::Error::new(
            types::error::Type::AccountDoesNotExist, "Account does not exist",
            "Account with the provided key does not exist, and onlyReturnExisting field set",
        ));
    }
    if ctx.config.tos_uri.is_some() && !payload.terms_of_service_agreed {
        return responses::ACMEResponse::new_error(types::error::Error::malformed("Terms of Service must be agreed to"));
    }
    let emails = try_result!(parse_contacts(&payload.contact));

    let account = store::AccountRecord {
        id: uuid::Uuid::new_v4(),
        created_at: chrono::Utc::now(),
        public_key: acct_key_bytes,
        emails,
        deactivated: false,
    };
    try_result!(crate::try_db_result!(ctx.store.insert_account(&account).await, "Unable to save account: {}"));
    info!("Created account {}", account.id);

    responses::ACMEResponse::ok(responses::Headers {
        responder: Json(account_view(&account, &urls)),
        headers: vec![("Location".to_string(), urls.account(&account.id))],
    }, rocket::http::Status::Created)
}

#[post("/<provisioner>/acme/acct/<aid>", data = "<acct>")]
pub async fn account(
    provisioner: &str,
    aid: &str,
    acct: ACMEResult<jws::JWSRequest<types::account::AccountUpdate>>,
    ctx: &rocket::State<Context>,
) -> responses::ACMEResponse<Json<types::account::Account>> {
    let acct = try_result!(acct);
    get_provisioner!(ctx, provisioner);
    let account = ensure_request_key_kid!(acct.key);
    try_result!(check_account(aid, &account));
    let urls = ctx.urls(provisioner);
    let mut record = account.record;

    if let Some(update) = acct.payload {
        if let Some(status) = update.status {
            if update.contact.is_some() {
                return responses::ACMEResponse::new_error(types::error::Error::malformed(
                    "'status' can only be updated on its own"
                ));
            }
            if status != types::account::Status::Deactivated {
                return responses::ACMEResponse::new_error(types::error::Error::malformed(
                    "'status' can only be set to 'deactivated'"
                ));
            }
            try_result!(crate::try_db_result!(
                ctx.store.deactivate_account(record.id).await, "Unable to deactivate account: {}"
            ));
            info!("Deactivated account {}", record.id);
            record.deactivated = true;
        } else if let Some(contact) = update.contact {
            let emails = try_result!(parse_contacts(&contact));
            try_result!(crate::try_db_result!(
                ctx.store.update_account_emails(record.id, &emails).await, "Unable to update account: {}"
            ));
            record.emails = emails;
        }
    }

    responses::ACMEResponse::ok(Json(account_view(&record, &urls)), rocket::http::Status::Ok)
}

#[post("/<provisioner>/acme/acct/<aid>/orders", data = "<acct>")]
pub async fn account_orders(
    provisioner: &str,
    aid: &str,
    acct: ACMEResult<jws::JWSRequest<()>>,
    ctx: &rocket::State<Context>,
) -> responses::ACMEResponse<Json<types::order::List>> {
    let acct = try_result!(acct);
    get_provisioner!(ctx, provisioner);
    let account = ensure_request_key_kid!(acct.key);
    ensure_post_as_get!(acct.payload);
    try_result!(check_account(aid, &account));
    let urls = ctx.urls(provisioner);

    let account_orders = try_result!(crate::try_db_result!(
        ctx.store.list_account_orders(account.record.id).await, "Failed to get account orders: {}"
    ));

    responses::ACMEResponse::ok(Json(types::order::List {
        orders: account_orders.iter()
            .filter(|o| o.provisioner == provisioner)
            .map(|o| urls.order(&o.id))
            .collect(),
    }), rocket::http::Status::Ok)
}

#[derive(Responder)]
pub enum KeyChangeResponse {
    Conflict(responses::Headers<Json<types::error::Error>>),
    Account(Json<types::account::Account>),
}

fn key_conflict(urls: &links::Urls, existing: &uuid::Uuid) -> responses::ACMEResponse<KeyChangeResponse> {
    responses::ACMEResponse::ok(KeyChangeResponse::Conflict(responses::Headers {
        responder: Json(types::error::Error::new(
            types::error::Type::Malformed, "Conflict", "Account already exists with the new key",
        ).with_status(409)),
        headers: vec![
            ("Location".to_string(), urls.account(existing)),
            ("Content-Type".to_string(), "application/problem+json".to_string()),
        ],
    }), rocket::http::Status::Conflict)
}

#[post("/<provisioner>/acme/key-change", data = "<acct>")]
pub async fn key_change(
    provisioner: &str,
    acct: ACMEResult<jws::JWSRequest<types::jose::FlattenedJWS>>,
    ctx: &rocket::State<Context>,
) -> responses::ACMEResponse<KeyChangeResponse> {
    let acct = try_result!(acct);
    get_provisioner!(ctx, provisioner);
    let account = ensure_request_key_kid!(acct.key);
    let payload = ensure_not_post_as_get!(acct.payload);
    let urls = ctx.urls(provisioner);

    let inner: jws::JWSRequestInner<types::account::KeyChange> = try_result!(
        jws::JWSRequestInner::from_jws(&payload, &acct.url)
    );
    let old_key = match openssl::pkey::PKey::<openssl::pkey::Public>::try_from(&inner.payload.old_key) {
        Ok(v) => v,
        Err(err) => {
            return responses::ACMEResponse::new_error(types::error::Error::new(
                types::error::Type::BadPublicKey, "Invalid public key", err,
            ));
        }
    };

    if inner.payload.account != urls.account(&account.record.id) {
        return responses::ACMEResponse::new_error(types::error::Error::malformed(
            "Key change object is for a different account"
        ));
    }
    if !account.key.public_eq(&old_key) {
        return responses::ACMEResponse::new_error(types::error::Error::malformed(
            "Key change object key does not match account key"
        ));
    }

    let new_key_bytes = match inner.key.public_key_to_der() {
        Ok(v) => v,
        Err(err) => {
            error!("Unable to encode account key: {}", err);
            return responses::ACMEResponse::new_error(crate::internal_server_error!());
        }
    };
    let existing_account = try_result!(crate::try_db_result!(
        ctx.store.find_account_by_key(&new_key_bytes).await, "Unable to search for existing account: {}"
    ));
    if let Some(existing) = existing_account {
        return key_conflict(&urls, &existing.id);
    }

    let updated = try_result!(crate::try_db_result!(
        ctx.store.update_account_key(account.record.id, &new_key_bytes).await, "Unable to update account: {}"
    ));
    if !updated {
        let existing = try_result!(crate::try_db_result!(
            ctx.store.find_account_by_key(&new_key_bytes).await, "Unable to search for existing account: {}"
        ));
        return match existing {
            Some(existing) => key_conflict(&urls, &existing.id),
            None => responses::ACMEResponse::new_error(crate::internal_server_error!()),
        };
    }
    info!("Rolled key of account {}", account.record.id);

    let mut record = account.record;
    record.public_key = new_key_bytes;
    responses::ACMEResponse::ok(KeyChangeResponse::Account(Json(account_view(&record, &urls))), rocket::http::Status::Ok)
}

#[post("/<provisioner>/acme/new-order", data = "<order>")]
pub async fn new_order(
    provisioner: &str,
    order: ACMEResult<jws::JWSRequest<types::order::OrderCreate>>,
    ctx: &rocket::State<Context>,
) -> responses::ACMEResponse<responses::Headers<Json<types::order::Order>>> {
    let order = try_result!(order);
    let prov = get_provisioner!(ctx, provisioner);
    let account = ensure_request_key_kid!(order.key);
    let payload = ensure_not_post_as_get!(order.payload);
    let urls = ctx.urls(provisioner);
    let now = chrono::Utc::now();

    let (db_order, authorizations) = try_result!(
        ctx.orders().create_order(&account.record, prov, &payload, now).await
    );

    responses::ACMEResponse::ok(responses::Headers {
        responder: Json(orders::order_view(&db_order, &authorizations, &urls, now)),
        headers: vec![("Location".to_string(), urls.order(&db_order.id))],
    }, rocket::http::Status::Created)
}

#[post("/<provisioner>/acme/authz/<aid>", data = "<authz>")]
pub async fn authorization(
    provisioner: &str,
    aid: &str,
    authz: ACMEResult<jws::JWSRequest<()>>,
    ctx: &rocket::State<Context>,
) -> responses::ACMEResponse<Json<types::authorization::Authorization>> {
    let authz = try_result!(authz);
    get_provisioner!(ctx, provisioner);
    let account = ensure_request_key_kid!(authz.key);
    ensure_post_as_get!(authz.payload);

    let aid = try_result!(decode_id!(aid));
    let (order, authorization) = try_result!(get_authz(ctx, provisioner, aid, &account).await);

    responses::ACMEResponse::ok(Json(orders::authorization_view(
        &order, &authorization, &ctx.urls(provisioner), chrono::Utc::now(),
    )), rocket::http::Status::Ok)
}

#[post("/<provisioner>/acme/chall/<cid>/<ctype>", data = "<chall>")]
pub async fn challenge(
    provisioner: &str,
    cid: &str,
    ctype: &str,
    chall: ACMEResult<jws::JWSRequest<types::challenge::ChallengeRespond>>,
    ctx: &rocket::State<Context>,
) -> responses::ACMEResponse<Json<types::challenge::Challenge>> {
    let chall = try_result!(chall);
    get_provisioner!(ctx, provisioner);
    let account = ensure_request_key_kid!(chall.key);
    let urls = ctx.urls(provisioner);

    let cid = try_result!(decode_id!(cid));
    let challenge = match try_result!(crate::try_db_result!(
        ctx.store.get_challenge(cid).await, "Unable to search for challenge: {}"
    )) {
        Some(c) if types::challenge::Type::from_str(ctype) == Some(types::challenge::Type::from(c.challenge_type)) => c,
        _ => return responses::ACMEResponse::new_error(types::error::Error::not_found("Challenge does not exist")),
    };
    let (order, authorization) = try_result!(get_authz(ctx, provisioner, challenge.authorization_id, &account).await);
    let up = vec![links::LinkHeader {
        url: urls.authorization(&authorization.identifier.authorization_id),
        relation: "up".to_string(),
    }];

    let challenge = match chall.payload {
        None => challenge,
        Some(_) if challenge.status != store::ChallengeStatus::Pending => challenge,
        Some(_) => {
            let identifier = authorization.identifier.to_identifier();
            let challenge_type = types::challenge::Type::from(challenge.challenge_type);
            if identifier.is_wildcard() && challenge_type != types::challenge::Type::DNS01 {
                return responses::ACMEResponse::new_error(types::error::Error::malformed(
                    "Wildcard identifiers can only be validated with dns-01"
                ));
            }
            if authorization.identifier.id_type == store::IdentifierType::Ip &&
                challenge_type == types::challenge::Type::DNS01 {
                return responses::ACMEResponse::new_error(types::error::Error::malformed(
                    "IP identifiers cannot be validated with dns-01"
                ));
            }
            if orders::order_status(&order, &[], chrono::Utc::now()) == types::order::Status::Invalid {
                return responses::ACMEResponse::new_error(types::error::Error::malformed(
                    "The order for this challenge is no longer valid"
                ));
            }

            let thumbprint = try_result!(jws::make_jwk_thumbprint(&account.key));
            let outcome = ctx.validator.validate(&identifier, challenge_type, &challenge.token, &thumbprint).await;
            try_result!(ctx.orders()
                .record_challenge_outcome(&challenge, outcome, chrono::Utc::now()).await
                .map_err(|e| e.with_identifier(identifier)))
        }
    };

    responses::ACMEResponse::new(responses::InnerACMEResponse::Ok(
        (Json(orders::challenge_view(&challenge, &urls)), rocket::http::Status::Ok)
    ), up)
}

#[post("/<provisioner>/acme/order/<oid>", data = "<order>")]
pub async fn order(
    provisioner: &str,
    oid: &str,
    order: ACMEResult<jws::JWSRequest<()>>,
    ctx: &rocket::State<Context>,
) -> responses::ACMEResponse<Json<types::order::Order>> {
    let order = try_result!(order);
    get_provisioner!(ctx, provisioner);
    let account = ensure_request_key_kid!(order.key);
    ensure_post_as_get!(order.payload);

    let existing_order = try_result!(get_order(ctx, provisioner, oid, &account).await);
    let order_obj = try_result!(order_response(ctx, provisioner, &existing_order).await);
    responses::ACMEResponse::ok(Json(order_obj), rocket::http::Status::Ok)
}

#[post("/<provisioner>/acme/order/<oid>/finalize", data = "<order>")]
pub async fn order_finalize(
    provisioner: &str,
    oid: &str,
    order: ACMEResult<jws::JWSRequest<types::order::OrderFinalize>>,
    ctx: &rocket::State<Context>,
) -> responses::ACMEResponse<responses::Headers<Json<types::order::Order>>> {
    let order = try_result!(order);
    get_provisioner!(ctx, provisioner);
    let account = ensure_request_key_kid!(order.key);
    let order_finalize = ensure_not_post_as_get!(order.payload);
    let urls = ctx.urls(provisioner);

    let existing_order = try_result!(get_order(ctx, provisioner, oid, &account).await);
    let csr = match crate::util::decode_b64_url(&order_finalize.csr) {
        Ok(c) => c,
        Err(_) => {
            return responses::ACMEResponse::new_error(types::error::Error::new(
                types::error::Type::Malformed, "Bad CSR", "Invalid Base64 encoding for the CSR",
            ));
        }
    };

    let updated = try_result!(
        ctx.orders().accept_finalize(&account.key, &existing_order, &csr, chrono::Utc::now()).await
    );
    let order_obj = try_result!(order_response(ctx, provisioner, &updated).await);
    responses::ACMEResponse::ok(responses::Headers {
        responder: Json(order_obj),
        headers: vec![("Location".to_string(), urls.order(&updated.id))],
    }, rocket::http::Status::Ok)
}

#[post("/<provisioner>/acme/order/<oid>/cert", data = "<cert>")]
pub async fn certificate(
    provisioner: &str,
    oid: &str,
    cert: ACMEResult<jws::JWSRequest<()>>,
    ctx: &rocket::State<Context>,
) -> responses::ACMEResponse<(rocket::http::ContentType, String)> {
    let cert = try_result!(cert);
    get_provisioner!(ctx, provisioner);
    let account = ensure_request_key_kid!(cert.key);
    ensure_post_as_get!(cert.payload);

    let existing_order = try_result!(get_order(ctx, provisioner, oid, &account).await);
    match existing_order.certificate_pem {
        Some(pem) => responses::ACMEResponse::ok(
            (rocket::http::ContentType::new("application", "pem-certificate-chain"), pem),
            rocket::http::Status::Ok,
        ),
        None => responses::ACMEResponse::new_error(types::error::Error::not_found(
            "No certificate has been issued for this order"
        )),
    }
}

#[post("/<provisioner>/acme/revoke-cert", data = "<revoke>")]
pub async fn revoke_cert(
    provisioner: &str,
    revoke: ACMEResult<jws::JWSRequest<types::revocation::RevokeCert>>,
    ctx: &rocket::State<Context>,
) -> responses::ACMEResponse<()> {
    let revoke = try_result!(revoke);
    get_provisioner!(ctx, provisioner);
    let payload = ensure_not_post_as_get!(revoke.payload);

    let reason = match payload.reason {
        None => types::revocation::Reason::Unspecified,
        Some(code) => match types::revocation::Reason::from_code(code) {
            Some(r) => r,
            None => return responses::ACMEResponse::new_error(types::error::Error::new(
                types::error::Type::BadRevocationReason, "Invalid revocation reason",
                format!("{} is not a revocation reason that can be requested", code),
            )),
        }
    };

    let certificate = match crate::util::decode_b64_url(&payload.certificate)
        .ok()
        .and_then(|der| openssl::x509::X509::from_der(&der).ok()) {
        Some(c) => c,
        None => return responses::ACMEResponse::new_error(types::error::Error::malformed("Invalid certificate")),
    };
    let serial = match certificate.serial_number().to_bn().and_then(|s| crate::ca::serial_hex(&s)) {
        Ok(s) => s,
        Err(_) => return responses::ACMEResponse::new_error(types::error::Error::malformed("Invalid certificate serial")),
    };
    let existing_order = match try_result!(crate::try_db_result!(
        ctx.store.find_order_by_serial(&serial).await, "Unable to search for certificate: {}"
    )) {
        Some(o) if o.provisioner == provisioner => o,
        _ => return responses::ACMEResponse::new_error(types::error::Error::not_found(
            "The certificate was not issued by this CA"
        )),
    };

    let authorized = match &revoke.key {
        jws::JWSRequestKey::KID(account) => account.record.id == existing_order.account_id,
        jws::JWSRequestKey::JWK { key, .. } => certificate.public_key()
            .map(|k| k.public_eq(key))
            .unwrap_or(false),
    };
    if !authorized {
        return responses::ACMEResponse::new_error(types::error::Error::unauthorized(
            "The signer may not revoke this certificate"
        ));
    }

    let revoked = try_result!(crate::try_db_result!(
        ctx.store.revoke_certificate(existing_order.id, reason.code(), chrono::Utc::now()).await,
        "Unable to revoke certificate: {}"
    ));
    if !revoked {
        return responses::ACMEResponse::new_error(types::error::Error::new(
            types::error::Type::AlreadyRevoked, "Already revoked", "The certificate has already been revoked",
        ));
    }
    info!("Revoked certificate {} with reason {:?}", serial, reason);

    responses::ACMEResponse::ok((), rocket::http::Status::Ok)
}

#[get("/<_provisioner>/acme/<_path..>", rank = 20)]
pub fn method_not_allowed(_provisioner: &str, _path: std::path::PathBuf) -> rocket::http::Status {
    rocket::http::Status::MethodNotAllowed
}

#[catch(400)]
pub fn acme_400() -> responses::ACMEResponse<()> {
    responses::ACMEResponse::new_error(types::error::Error::malformed("You tried to do something you shouldn't have."))
}

#[catch(404)]
pub fn acme_404(req: &rocket::Request) -> responses::ACMEResponse<()> {
    responses::ACMEResponse::new_error(types::error::Error::not_found(
        format!("'{}' is not path we know of", req.uri())
    ))
}

#[catch(405)]
pub fn acme_405(req: &rocket::Request) -> responses::ACMEResponse<()> {
    responses::ACMEResponse::new_error(types::error::Error::new(
        types::error::Type::Malformed, "Method not allowed",
        format!("{} is not allowed on '{}'", req.method(), req.uri()),
    ).with_status(405))
}

#[catch(415)]
pub fn acme_415(req: &rocket::Request) -> responses::ACMEResponse<()> {
    responses::ACMEResponse::new_error(types::error::Error::new(
        types::error::Type::Malformed, "Unsupported media type",
        match req.content_type() {
            Some(c) => format!("{} is not a supported media type", c),
            None => "No media type was given in the request".to_string(),
        },
    ).with_status(415))
}

#[catch(422)]
pub fn acme_422() -> responses::ACMEResponse<()> {
    responses::ACMEResponse::new_error(types::error::Error::new(
        types::error::Type::Malformed, "Unprocessable entity", "Ew! Untasty data, I can't parse that!",
    ).with_status(422))
}

#[catch(500)]
pub fn acme_500() -> responses::ACMEResponse<()> {
    responses::ACMEResponse::new_error(crate::internal_server_error!())
}

/// Mounts the ACME API under `/acme` and manages `context`.
pub fn server(rocket: rocket::Rocket<rocket::Build>, context: Context) -> rocket::Rocket<rocket::Build> {
    rocket
        .manage(context)
        .attach(responses::ACMEHeaders)
        .register("/acme", catchers![
            acme_400,
            acme_404,
            acme_405,
            acme_415,
            acme_422,
            acme_500,
        ])
        .mount("/acme", routes![
            directory,
            new_nonce_head,
            new_nonce,
            new_account,
            account,
            account_orders,
            key_change,
            new_order,
            authorization,
            challenge,
            order,
            order_finalize,
            certificate,
            revoke_cert,
            method_not_allowed,
        ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contacts_must_be_single_mailto() {
        assert_eq!(
            parse_contacts(&["mailto:admin@example.com".to_string()]).unwrap(),
            vec!["admin@example.com".to_string()]
        );

        let err = parse_contacts(&["tel:+15555550100".to_string()]).unwrap_err();
        assert_eq!(err.error_type, types::error::Type::UnsupportedContact);

        let err = parse_contacts(&["mailto:a@example.com,b@example.com".to_string()]).unwrap_err();
        assert_eq!(err.error_type, types::error::Type::InvalidContact);
        assert_eq!(err.status, 403);

        let err = parse_contacts(&["mailto:nobody".to_string(), "https://example.com".to_string()]).unwrap_err();
        assert_eq!(err.error_type, types::error::Type::Compound);
        assert_eq!(err.sub_problems.len(), 2);
    }

    #[test]
    fn test_account_view_lists_mailto_contacts() {
        let key = crate::testing::ec_key();
        let mut record = crate::testing::account_record(&key);
        let urls = links::Urls::new("https://ca.example", "default");
        let view = account_view(&record, &urls);
        assert_eq!(view.status, types::account::Status::Valid);
        assert_eq!(view.contact, vec!["mailto:admin@example.com".to_string()]);
        assert!(view.orders.ends_with("/orders"));

        record.deactivated = true;
        assert_eq!(account_view(&record, &urls).status, types::account::Status::Deactivated);
    }
}

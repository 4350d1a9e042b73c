table! {
    nonces (value) {
        value -> Varchar,
        issued_at -> Timestamptz,
    }
}

table! {
    nonce_redemptions (value) {
        value -> Varchar,
        redeemed_at -> Timestamptz,
    }
}

table! {
    accounts (id) {
        id -> Uuid,
        created_at -> Timestamptz,
        public_key -> Bytea,
        emails -> Array<Text>,
        deactivated -> Bool,
    }
}

table! {
    orders (id) {
        id -> Uuid,
        account_id -> Uuid,
        provisioner -> Varchar,
        created_at -> Timestamptz,
        not_before -> Timestamptz,
        not_after -> Timestamptz,
        expires_at -> Timestamptz,
        certificate_id -> Nullable<Uuid>,
        csr -> Nullable<Bytea>,
        certificate_pem -> Nullable<Text>,
        serial_number -> Nullable<Varchar>,
        certificate_issued_at -> Nullable<Timestamptz>,
        certificate_expires_at -> Nullable<Timestamptz>,
        error -> Nullable<Text>,
        claimed_until -> Timestamptz,
        revoked_at -> Nullable<Timestamptz>,
        revocation_reason -> Nullable<Int4>,
    }
}

table! {
    identifiers (authorization_id) {
        authorization_id -> Uuid,
        order_id -> Uuid,
        identifier_type -> crate::store::IdentifierTypeMapping,
        value -> Varchar,
    }
}

table! {
    challenges (id) {
        id -> Uuid,
        authorization_id -> Uuid,
        challenge_type -> crate::store::ChallengeTypeMapping,
        token -> Varchar,
        status -> crate::store::ChallengeStatusMapping,
        verified_at -> Nullable<Timestamptz>,
    }
}

joinable!(orders -> accounts (account_id));
joinable!(identifiers -> orders (order_id));
joinable!(challenges -> identifiers (authorization_id));

allow_tables_to_appear_in_same_query!(
    nonces,
    nonce_redemptions,
    accounts,
    orders,
    identifiers,
    challenges,
);

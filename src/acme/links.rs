#[derive(Debug)]
pub struct LinkHeader {
    pub url: String,
    pub relation: String,
}

#[derive(Debug)]
pub struct LinksHeaders<R> {
    pub responder: R,
    pub links: Vec<LinkHeader>,
}

impl<'r, 'o: 'r, R: rocket::response::Responder<'r, 'o>> rocket::response::Responder<'r, 'o> for LinksHeaders<R> {
    fn respond_to(self, request: &'r rocket::request::Request<'_>) -> rocket::response::Result<'o> {
        let mut result = self.responder.respond_to(request)?;
        for link in self.links {
            result.adjoin_raw_header("Link", format!("<{}>;rel=\"{}\"", link.url, link.relation));
        }
        Ok(result)
    }
}

/// Absolute URLs of one provisioner's ACME resources.
#[derive(Debug, Clone)]
pub struct Urls {
    base: String,
}

impl Urls {
    pub fn new(base_uri: &str, provisioner: &str) -> Self {
        Urls {
            base: format!("{}/acme/{}", base_uri.trim_end_matches('/'), provisioner),
        }
    }

    pub fn directory(&self) -> String {
        format!("{}/directory", self.base)
    }

    pub fn new_nonce(&self) -> String {
        format!("{}/acme/new-nonce", self.base)
    }

    pub fn new_account(&self) -> String {
        format!("{}/acme/new-acct", self.base)
    }

    pub fn new_order(&self) -> String {
        format!("{}/acme/new-order", self.base)
    }

    pub fn revoke_cert(&self) -> String {
        format!("{}/acme/revoke-cert", self.base)
    }

    pub fn key_change(&self) -> String {
        format!("{}/acme/key-change", self.base)
    }

    pub fn account(&self, id: &uuid::Uuid) -> String {
        format!("{}/acme/acct/{}", self.base, crate::util::uuid_as_b64(id))
    }

    pub fn account_orders(&self, id: &uuid::Uuid) -> String {
        format!("{}/orders", self.account(id))
    }

    pub fn order(&self, id: &uuid::Uuid) -> String {
        format!("{}/acme/order/{}", self.base, crate::util::uuid_as_b64(id))
    }

    pub fn finalize(&self, id: &uuid::Uuid) -> String {
        format!("{}/finalize", self.order(id))
    }

    pub fn certificate(&self, id: &uuid::Uuid) -> String {
        format!("{}/cert", self.order(id))
    }

    pub fn authorization(&self, id: &uuid::Uuid) -> String {
        format!("{}/acme/authz/{}", self.base, crate::util::uuid_as_b64(id))
    }

    pub fn challenge(&self, id: &uuid::Uuid, challenge_type: crate::types::challenge::Type) -> String {
        format!("{}/acme/chall/{}/{}", self.base, crate::util::uuid_as_b64(id), challenge_type.as_str())
    }
}

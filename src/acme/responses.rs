use crate::types;

#[derive(Debug)]
pub struct Headers<R> {
    pub responder: R,
    pub headers: Vec<(String, String)>,
}

impl<'r, 'o: 'r, R: rocket::response::Responder<'r, 'o>> rocket::response::Responder<'r, 'o> for Headers<R> {
    fn respond_to(self, request: &'r rocket::request::Request<'_>) -> rocket::response::Result<'o> {
        let mut result = self.responder.respond_to(request)?;
        for header in self.headers {
            result.set_raw_header(header.0, header.1);
        }
        Ok(result)
    }
}

pub enum InnerACMEResponse<R> {
    Ok((R, rocket::http::Status)),
    Error(rocket::serde::json::Json<types::error::Error>),
}

impl<'r, 'o: 'r, R: rocket::response::Responder<'r, 'o>> rocket::response::Responder<'r, 'o> for InnerACMEResponse<R> {
    fn respond_to(self, request: &'r rocket::request::Request<'_>) -> rocket::response::Result<'o> {
        match self {
            InnerACMEResponse::Ok((r, s)) => {
                let mut res = r.respond_to(request)?;
                res.set_status(s);
                Ok(res)
            },
            InnerACMEResponse::Error(e) => {
                let status = rocket::http::Status::from_code(e.status).unwrap_or(rocket::http::Status::InternalServerError);
                let mut r = e.respond_to(request)?;
                r.set_status(status);
                r.set_raw_header("Content-Type", "application/problem+json");
                Ok(r)
            }
        }
    }
}

pub type ACMEResponse<R> = super::links::LinksHeaders<InnerACMEResponse<R>>;

impl<R> ACMEResponse<R> {
    pub fn new(r: InnerACMEResponse<R>, links: Vec<super::links::LinkHeader>) -> ACMEResponse<R> {
        super::links::LinksHeaders {
            responder: r,
            links,
        }
    }

    pub fn ok(r: R, status: rocket::http::Status) -> ACMEResponse<R> {
        ACMEResponse::new(InnerACMEResponse::Ok((r, status)), vec![])
    }

    pub fn new_error(err: types::error::Error) -> ACMEResponse<R> {
        ACMEResponse::new(InnerACMEResponse::Error(rocket::serde::json::Json(err)), vec![])
    }
}

/// Adds the headers every ACME response carries: a fresh `Replay-Nonce`, the directory
/// `Link`, and `Cache-Control`. Only paths under a known provisioner are touched.
pub struct ACMEHeaders;

#[rocket::async_trait]
impl rocket::fairing::Fairing for ACMEHeaders {
    fn info(&self) -> rocket::fairing::Info {
        rocket::fairing::Info {
            name: "ACME response headers",
            kind: rocket::fairing::Kind::Response,
        }
    }

    async fn on_response<'r>(&self, request: &'r rocket::Request<'_>, response: &mut rocket::Response<'r>) {
        let context = match request.rocket().state::<super::Context>() {
            Some(c) => c,
            None => return,
        };
        let mut segments = request.uri().path().segments();
        if segments.next() != Some("acme") {
            return;
        }
        let provisioner = match segments.next() {
            Some(p) if context.provisioners.get(p).is_some() => p,
            _ => return,
        };
        let urls = super::links::Urls::new(context.config.base_uri(), provisioner);

        match context.nonces.issue().await {
            Ok(nonce) => {
                response.set_raw_header("Replay-Nonce", nonce);
            }
            Err(err) => warn!("Unable to attach nonce to response: {}", err),
        }
        response.adjoin_raw_header("Link", format!("<{}>;rel=\"index\"", urls.directory()));
        if !response.headers().contains("Cache-Control") {
            response.set_raw_header("Cache-Control", "public, max-age=0, no-cache");
        }
    }
}

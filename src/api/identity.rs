use actix_web::dev::Payload;
use actix_web::error::ErrorUnauthorized;
use actix_web::{Error, FromRequest, HttpRequest};
use futures::future::{ready, Ready};

/// Header carrying the authenticated voter id
pub const VOTER_HEADER: &str = "X-Voter-Id";

/// Header carrying the admin flag ("1" or "true")
pub const ADMIN_HEADER: &str = "X-Is-Admin";

/// Caller identity supplied by the session layer in front of this service
///
/// The headers are trusted as already authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub voter_id: String,
    pub is_admin: bool,
}

impl Identity {
    fn from_request_headers(req: &HttpRequest) -> Result<Self, Error> {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
        };

        let voter_id = header(VOTER_HEADER)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ErrorUnauthorized(format!("missing {} header", VOTER_HEADER)))?;

        let is_admin = matches!(
            header(ADMIN_HEADER).as_deref(),
            Some("1") | Some("true")
        );

        Ok(Identity { voter_id, is_admin })
    }
}

impl FromRequest for Identity {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Self::from_request_headers(req))
    }
}

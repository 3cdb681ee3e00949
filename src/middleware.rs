use actix_web::dev::{Payload, ServiceRequest, Transform};
use actix_web::error::ErrorUnauthorized;
use actix_web::{Error, FromRequest, HttpMessage, HttpRequest};
use actix_service::{forward_ready, Service};
use futures::future::{ok, ready, LocalBoxFuture, Ready};
use std::rc::Rc;

use crate::auth;

/// Identity decoded by the authorization gate.
///
/// Gated handlers take this in their signature; extraction fails with 401 if
/// the gate did not run, so a handler can never see an unauthenticated
/// request. Ownership checks against caller-supplied parameters remain each
/// handler's responsibility.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub email: String,
}

impl FromRequest for AuthUser {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let user = req.extensions().get::<AuthUser>().cloned();
        ready(user.ok_or_else(|| ErrorUnauthorized("Unauthorized Access")))
    }
}

// Middleware factory
pub struct AuthGate {
    secret: String,
}

impl AuthGate {
    pub fn new(secret: String) -> Self {
        AuthGate { secret }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AuthGate
where
    S: Service<ServiceRequest, Response = actix_web::dev::ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = actix_web::dev::ServiceResponse<B>;
    type Error = Error;
    type Transform = AuthGateMiddleware<S>;
    type InitError = ();

    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthGateMiddleware {
            service: Rc::new(service),
            secret: self.secret.clone(),
        })
    }
}

pub struct AuthGateMiddleware<S> {
    service: Rc<S>,
    secret: String,
}

impl<S, B> Service<ServiceRequest> for AuthGateMiddleware<S>
where
    S: Service<ServiceRequest, Response = actix_web::dev::ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = actix_web::dev::ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let secret = self.secret.clone();
        let service = self.service.clone();

        Box::pin(async move {
            // Extract the credential cookie; fail closed when it is absent.
            let token = match req.cookie(auth::TOKEN_COOKIE) {
                Some(cookie) => cookie.value().to_owned(),
                None => return Err(ErrorUnauthorized("Unauthorized Access")),
            };

            match auth::verify(&token, &secret) {
                Ok(claims) => {
                    req.extensions_mut().insert(AuthUser {
                        email: claims.email,
                    });
                    service.call(req).await
                }
                Err(_) => {
                    // Bad signature or expired token
                    Err(ErrorUnauthorized("Unauthorized Access"))
                }
            }
        })
    }
}

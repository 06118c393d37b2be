use std::future::{Future, Ready};
use std::pin::Pin;
use std::rc::Rc;

use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header;
use actix_web::web;
use argon2::password_hash::PasswordHashString;
use secrecy::SecretString;

use crate::auth::{crypto::verify_secret, header::auth_header};
use crate::error::Error;

/// Rejects requests whose `Authorization` header does not carry the
/// configured API key. With no hash configured every request passes.
#[derive(Clone)]
pub struct ApiKeyAuth {
    hash: Option<PasswordHashString>,
}

impl ApiKeyAuth {
    pub fn new(hash: Option<PasswordHashString>) -> Self {
        Self { hash }
    }

    pub fn disabled() -> Self {
        Self { hash: None }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ApiKeyAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type InitError = ();
    type Transform = ApiKeyAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(ApiKeyAuthMiddleware {
            service: Rc::new(service),
            hash: self.hash.clone(),
        }))
    }
}

pub struct ApiKeyAuthMiddleware<S> {
    service: Rc<S>,
    hash: Option<PasswordHashString>,
}

impl<S, B> Service<ServiceRequest> for ApiKeyAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let hash = self.hash.clone();

        Box::pin(async move {
            let Some(hash) = hash else {
                return service.call(req).await;
            };

            let secret = {
                let Some(value) = req.headers().get(header::AUTHORIZATION) else {
                    return Err(Error::Unauthorized.into());
                };

                let value = value.to_str().map_err(|_| Error::InvalidHeader {
                    header: "Authorization".to_owned(),
                })?;

                auth_header()
                    .parse(value.as_bytes())
                    .map_err(|_| Error::InvalidHeader {
                        header: "Authorization".to_owned(),
                    })?
                    .secret()
                    .to_owned()
            };

            let verified = web::block(move || verify_secret(SecretString::from(secret), hash))
                .await
                .map_err(|e| Error::internal(eyre::eyre!("{e}")))?;

            if let Err(e) = verified {
                tracing::warn!(path = req.path(), "Rejected API key: {e}");
                return Err(Error::Unauthorized.into());
            }

            service.call(req).await
        })
    }
}

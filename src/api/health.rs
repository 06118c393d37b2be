use actix_web::{get, web, Responder};

/// Liveness probe. Does not touch the store.
#[get("/v1/healthz")]
pub async fn healthz() -> impl Responder {
    web::Json("Queue Service is Healthy")
}

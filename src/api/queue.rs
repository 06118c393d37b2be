use actix_web::{get, post, web, Responder, Scope};
use chrono::TimeDelta;

use crate::{
    api::types::{
        ack::AckRequest,
        dequeue::{DequeueRequest, DequeueResponse, DequeuedMessage},
        enqueue::{EnqueueRequest, EnqueueResponse},
        register::RegisterRequest,
        seconds,
        stats::{StatsQuery, StatsResponse},
        topics::ListTopicsResponse,
        unack::{UnAckRequest, UnAckResponse},
        OkResponse,
    },
    engine::{Dequeue, Enqueue},
    error::Error,
    message::MessageId,
    service::Service,
    topic::TopicKey,
};

#[post("/queue")]
async fn enqueue(
    service: web::Data<Service>,
    body: web::Json<EnqueueRequest>,
) -> actix_web::Result<impl Responder> {
    let body = body.into_inner();

    let request = Enqueue::builder()
        .topic(body.topic)
        .subtopic(body.subtopic)
        .payload(body.payload)
        .delay(match body.delay {
            Some(delay) => seconds("delay", delay)?,
            None => TimeDelta::zero(),
        })
        .maybe_dedupe_key(body.dedupe_key)
        .maybe_producer(body.producer_name)
        .build();

    let message_id = service.enqueue(request).await?;

    Ok(web::Json(EnqueueResponse { message_id }))
}

#[post("/dequeue")]
async fn dequeue(
    service: web::Data<Service>,
    body: web::Json<DequeueRequest>,
) -> actix_web::Result<impl Responder> {
    let body = body.into_inner();

    let visibility_timeout = body
        .visibility_timeout
        .map(|secs| seconds("visibility_timeout", secs))
        .transpose()?;

    let request = Dequeue::builder()
        .topic(body.topic)
        .maybe_subtopic(body.subtopic)
        .maybe_batch_size(body.batch_size)
        .maybe_visibility_timeout(visibility_timeout)
        .maybe_consumer(body.consumer_name)
        .build();

    let messages = service
        .dequeue(request)
        .await?
        .into_iter()
        .map(DequeuedMessage::try_from)
        .collect::<Result<Vec<_>, Error>>()?;

    Ok(web::Json(DequeueResponse { messages }))
}

#[post("/ack")]
async fn ack(
    service: web::Data<Service>,
    body: web::Json<AckRequest>,
) -> actix_web::Result<impl Responder> {
    service.ack(body.message_id, &body.lease_token).await?;

    Ok(web::Json(OkResponse::ok()))
}

#[post("/unack")]
async fn unack(
    service: web::Data<Service>,
    body: web::Json<UnAckRequest>,
) -> actix_web::Result<impl Responder> {
    let body = body.into_inner();

    let retry_after = body
        .retry_after
        .map(|secs| seconds("retry_after", secs))
        .transpose()?;

    let response = match body {
        UnAckRequest {
            message_id: Some(message_id),
            lease_token: Some(lease_token),
            ..
        } => {
            let dead_lettered = service
                .unack(message_id, &lease_token, retry_after)
                .await?;

            UnAckResponse::Message {
                ok: true,
                dead_lettered,
            }
        }
        UnAckRequest {
            message_id: None,
            lease_token: None,
            topic: Some(topic),
            subtopic,
            ..
        } => {
            let key = TopicKey::new(topic, subtopic.unwrap_or_default());
            let results = service.unack_subtopic(&key, retry_after).await?;

            UnAckResponse::Subtopic { ok: true, results }
        }
        _ => {
            return Err(Error::validation(
                "expected either message_id and lease_token, or topic and subtopic",
            )
            .into())
        }
    };

    Ok(web::Json(response))
}

#[post("/register")]
async fn register(
    service: web::Data<Service>,
    body: web::Json<RegisterRequest>,
) -> actix_web::Result<impl Responder> {
    let body = body.into_inner();
    let config = body.config()?;

    service
        .register(TopicKey::new(body.topic, body.subtopic), config)
        .await?;

    Ok(web::Json(OkResponse::ok()))
}

#[get("/messages/{message_id}")]
async fn get_message(
    service: web::Data<Service>,
    path: web::Path<String>,
) -> actix_web::Result<impl Responder> {
    let id: MessageId = path
        .parse()
        .map_err(|_| Error::validation(format!("invalid message id: {path}")))?;

    Ok(web::Json(service.get_message(id).await?))
}

#[get("/topics")]
async fn list_topics(service: web::Data<Service>) -> actix_web::Result<impl Responder> {
    let topics = service
        .list_topics()
        .await?
        .into_iter()
        .map(Into::into)
        .collect();

    Ok(web::Json(ListTopicsResponse { topics }))
}

#[get("/stats")]
async fn stats(
    service: web::Data<Service>,
    query: web::Query<StatsQuery>,
) -> actix_web::Result<impl Responder> {
    let queues = service.statistics(query.topic.as_deref()).await?;

    Ok(web::Json(StatsResponse { queues }))
}

pub fn service() -> Scope {
    web::scope("/v1")
        .service(enqueue)
        .service(dequeue)
        .service(ack)
        .service(unack)
        .service(register)
        .service(get_message)
        .service(list_topics)
        .service(stats)
}

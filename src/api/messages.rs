use std::str::FromStr;

use actix_web::{get, post, web, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::{
    db::message::{Message, MessageFilter, MessageStatus, MessageSummary},
    error::Error,
    service::Service,
};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    status: Option<String>,
    from: Option<String>,
    to: Option<String>,
    q: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Serialize)]
pub struct ListMessagesResponse {
    items: Vec<MessageSummary>,
    limit: i64,
    offset: i64,
}

#[get("")]
async fn list_messages(
    service: web::Data<Service>,
    query: web::Query<ListQuery>,
) -> Result<impl Responder, Error> {
    let query = query.into_inner();

    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            MessageStatus::from_str(raw)
                .map_err(|_| Error::invalid_parameter(format!("unknown status {raw:?}")))?,
        ),
        None => None,
    };

    let filter = MessageFilter {
        status,
        from: query.from,
        to: query.to,
        q: query.q,
        limit: query.limit.unwrap_or(50).clamp(1, 200),
        offset: query.offset.unwrap_or(0).max(0),
    };

    let items = service.list_messages(&filter).await?;

    Ok(web::Json(ListMessagesResponse {
        items,
        limit: filter.limit,
        offset: filter.offset,
    }))
}

#[get("/{id}")]
async fn get_message(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<web::Json<Message>, Error> {
    Ok(web::Json(service.get_message(path.into_inner()).await?))
}

#[derive(Serialize)]
pub struct SendResponse {
    ok: bool,
    provider_message_id: Option<String>,
}

async fn trigger_send(service: &Service, id: i64) -> Result<web::Json<SendResponse>, Error> {
    let outcome = service.send_message(id).await?;

    Ok(web::Json(SendResponse {
        ok: true,
        provider_message_id: outcome.provider_message_id,
    }))
}

#[post("/{id}/send")]
async fn send_message(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<impl Responder, Error> {
    trigger_send(&service, path.into_inner()).await
}

#[post("/{id}/retry")]
async fn retry_message(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<impl Responder, Error> {
    trigger_send(&service, path.into_inner()).await
}

pub fn service() -> Scope {
    web::scope("/api/messages")
        .service(list_messages)
        .service(get_message)
        .service(send_message)
        .service(retry_message)
}

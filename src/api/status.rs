use actix_web::{get, web, Responder, Scope};
use serde::Serialize;

use crate::{error::Error, service::Service, smtp::ListenerStatus};

#[derive(Serialize)]
pub struct StatusResponse {
    smtp: ListenerStatus,
    db: DbStatus,
    totals: Totals,
    version: &'static str,
}

#[derive(Serialize)]
pub struct DbStatus {
    ok: bool,
}

#[derive(Serialize)]
pub struct Totals {
    messages: i64,
}

#[get("")]
async fn status(service: web::Data<Service>) -> Result<impl Responder, Error> {
    let messages = service.message_count().await?;

    Ok(web::Json(StatusResponse {
        smtp: service.smtp_status().await,
        db: DbStatus { ok: true },
        totals: Totals { messages },
        version: env!("CARGO_PKG_VERSION"),
    }))
}

pub fn service() -> Scope {
    web::scope("/api/status").service(status)
}

use actix_web::{get, post, web, Responder, Scope};
use serde::Serialize;

use crate::{error::Error, service::Service, smtp::ListenerStatus};

#[get("/status")]
async fn status(service: web::Data<Service>) -> Result<web::Json<ListenerStatus>, Error> {
    Ok(web::Json(service.smtp_status().await))
}

#[derive(Serialize)]
pub struct RestartResponse {
    ok: bool,
    port: u16,
}

#[post("/restart")]
async fn restart(service: web::Data<Service>) -> Result<impl Responder, Error> {
    let port = service.restart_smtp().await?;

    Ok(web::Json(RestartResponse { ok: true, port }))
}

pub fn service() -> Scope {
    web::scope("/api/smtp").service(status).service(restart)
}

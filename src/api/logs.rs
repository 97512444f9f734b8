use actix_web::{get, web, Responder, Scope};
use serde::Serialize;

use crate::{db::log::SystemLogEntry, error::Error, service::Service};

const LOG_PAGE_SIZE: i64 = 200;

#[derive(Serialize)]
pub struct LogsResponse {
    items: Vec<SystemLogEntry>,
}

#[get("/system")]
async fn system_logs(service: web::Data<Service>) -> Result<impl Responder, Error> {
    let items = service.recent_logs(LOG_PAGE_SIZE).await?;

    Ok(web::Json(LogsResponse { items }))
}

pub fn service() -> Scope {
    web::scope("/api/logs").service(system_logs)
}

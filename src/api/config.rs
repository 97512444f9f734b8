use std::collections::HashMap;

use actix_web::{get, post, put, web, Responder, Scope};
use serde::Serialize;

use crate::{db, error::Error, service::Service};

#[derive(Serialize)]
pub struct ConfigResponse {
    config: HashMap<String, String>,
}

#[get("")]
async fn read_config(service: web::Data<Service>) -> Result<impl Responder, Error> {
    Ok(web::Json(ConfigResponse {
        config: service.read_config().await?,
    }))
}

#[derive(Serialize)]
pub struct WriteConfigResponse {
    ok: bool,
    config: HashMap<String, String>,
}

#[put("")]
async fn write_config(
    service: web::Data<Service>,
    body: web::Json<serde_json::Map<String, serde_json::Value>>,
) -> Result<impl Responder, Error> {
    let mut updates = Vec::new();

    for (key, value) in body.into_inner() {
        if !db::config::ALLOWED_KEYS.contains(&key.as_str()) {
            continue;
        }

        let value = value
            .as_str()
            .ok_or_else(|| Error::invalid_parameter(format!("{key}: expected a string value")))?;

        if value.len() > db::config::MAX_VALUE_LEN {
            return Err(Error::invalid_parameter(format!("{key}: value too long")));
        }

        updates.push((key, value.to_owned()));
    }

    if updates.is_empty() {
        return Err(Error::invalid_parameter(
            "no allowed configuration keys in request",
        ));
    }

    service.write_config(updates).await?;

    Ok(web::Json(WriteConfigResponse {
        ok: true,
        config: service.read_config().await?,
    }))
}

#[derive(Serialize)]
pub struct TestResponse {
    ok: bool,
    provider: &'static str,
    expires_at: chrono::DateTime<chrono::Utc>,
}

#[post("/test")]
async fn test_connectivity(service: web::Data<Service>) -> Result<impl Responder, Error> {
    let report = service.test_connectivity().await?;

    Ok(web::Json(TestResponse {
        ok: true,
        provider: "azure",
        expires_at: report.expires_at,
    }))
}

pub fn service() -> Scope {
    web::scope("/api/config")
        .service(read_config)
        .service(write_config)
        .service(test_connectivity)
}

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Identity configuration incomplete: missing {missing}"))]
    IdentityConfigIncomplete { missing: String },

    #[snafu(display("Token acquisition failed: {detail}"))]
    AcquisitionFailed { detail: String },

    #[snafu(display("Delivery failed: {detail}"))]
    Delivery { detail: String },

    #[snafu(display("Message parsing failed: {detail}"))]
    ParseFailed { detail: String },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Missing parameter: {message}"))]
    MissingParameter { message: String },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Listener I/O error"))]
    Io {
        #[snafu(source)]
        source: std::io::Error,
    },

    #[snafu(display("Internal server error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }
}

impl Error {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn identity_config_incomplete(missing: impl Into<String>) -> Self {
        Self::IdentityConfigIncomplete {
            missing: missing.into(),
        }
    }

    pub fn acquisition_failed(detail: impl Into<String>) -> Self {
        Self::AcquisitionFailed {
            detail: detail.into(),
        }
    }

    pub fn delivery(detail: impl Into<String>) -> Self {
        Self::Delivery {
            detail: detail.into(),
        }
    }

    pub fn parse_failed(detail: impl Into<String>) -> Self {
        Self::ParseFailed {
            detail: detail.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn missing_parameter(message: impl Into<String>) -> Self {
        Self::MissingParameter {
            message: message.into(),
        }
    }

    /// Stable classification string surfaced to administrative callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::IdentityConfigIncomplete { .. } => "identity_config_incomplete",
            Self::AcquisitionFailed { .. } => "acquisition_failed",
            Self::Delivery { .. } => "delivery_failed",
            Self::ParseFailed { .. } => "parse_failed",
            Self::InvalidParameter { .. } => "invalid_parameter",
            Self::MissingParameter { .. } => "missing_parameter",
            Self::Sqlx { .. } | Self::Migration { .. } | Self::Io { .. } => "storage_error",
            Self::InternalServerError { .. } => "internal_error",
        }
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            Self::NotFound { .. } => actix_web::http::StatusCode::NOT_FOUND,

            Self::IdentityConfigIncomplete { .. }
            | Self::AcquisitionFailed { .. }
            | Self::Delivery { .. }
            | Self::ParseFailed { .. }
            | Self::InvalidParameter { .. }
            | Self::MissingParameter { .. } => actix_web::http::StatusCode::BAD_REQUEST,

            Self::Sqlx { .. }
            | Self::Migration { .. }
            | Self::Io { .. }
            | Self::InternalServerError { .. } => {
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        actix_web::HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.kind(),
            "detail": self.to_string(),
        }))
    }
}

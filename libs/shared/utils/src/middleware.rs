use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use shared_config::AppConfig;

pub const X_CONTENT_TYPE_OPTIONS: HeaderName = HeaderName::from_static("x-content-type-options");
pub const X_FRAME_OPTIONS: HeaderName = HeaderName::from_static("x-frame-options");
pub const X_LGPD_CONSENT: HeaderName = HeaderName::from_static("x-lgpd-consent");
pub const X_DATA_RETENTION: HeaderName = HeaderName::from_static("x-data-retention");

/// Security and LGPD labelling headers stamped on every response.
#[derive(Debug, Clone)]
pub struct ComplianceHeaders {
    pub lgpd_consent: HeaderValue,
    pub data_retention: HeaderValue,
}

impl ComplianceHeaders {
    pub fn from_config(config: &AppConfig) -> Self {
        let data_retention = HeaderValue::from_str(&format!("{} days", config.data_retention_days))
            .unwrap_or_else(|_| {
                warn!("Invalid data retention value, falling back to 365 days");
                HeaderValue::from_static("365 days")
            });

        Self {
            lgpd_consent: HeaderValue::from_static("required"),
            data_retention,
        }
    }
}

pub async fn compliance_headers(
    State(compliance): State<ComplianceHeaders>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(X_LGPD_CONSENT, compliance.lgpd_consent.clone());
    headers.insert(X_DATA_RETENTION, compliance.data_retention.clone());

    response
}

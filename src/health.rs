use reqwest::StatusCode;
use std::time::Duration;

use crate::error::HealthCheckError;

/// Path probed before any load is generated
pub const HEALTH_PATH: &str = "/health";

/// Verify the endpoint answers `GET /health` with 200.
///
/// No retries: an unhealthy endpoint aborts the run.
pub async fn check_health(base_url: &str, timeout: Duration) -> Result<(), HealthCheckError> {
    let url = format!("{}{}", base_url, HEALTH_PATH);
    tracing::info!("Checking endpoint: {}", url);

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|source| HealthCheckError::Unreachable {
            url: url.clone(),
            source,
        })?;

    let response = client.get(&url).send().await.map_err(|source| {
        if source.is_timeout() {
            HealthCheckError::Timeout { url: url.clone() }
        } else {
            HealthCheckError::Unreachable {
                url: url.clone(),
                source,
            }
        }
    })?;

    let status = response.status();
    if status != StatusCode::OK {
        return Err(HealthCheckError::BadStatus {
            url,
            status: status.as_u16(),
        });
    }

    tracing::info!("Endpoint healthy");
    Ok(())
}

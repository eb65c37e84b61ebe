use actix_web::{HttpResponse, Responder};

use crate::metrics::METRICS;

/// Gauges are refreshed by the control loop each cycle; this only renders them.
pub async fn get_metrics() -> impl Responder {
    match METRICS.render() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => {
            log::error!("Failed to render metrics: {}", e);
            HttpResponse::InternalServerError().body(format!("Error: {}", e))
        }
    }
}

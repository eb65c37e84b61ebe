use actix_web::{web, HttpResponse, Responder};

use crate::models::{HealthClass, Lifecycle};
use crate::state::StatusBoard;

pub async fn get_status(board: web::Data<StatusBoard>) -> impl Responder {
    match board.lock() {
        Ok(board) => HttpResponse::Ok().json(board.response()),
        Err(_) => HttpResponse::InternalServerError().json(serde_json::json!({
            "status": "error",
            "message": "status board unavailable"
        })),
    }
}

/// Liveness of the guardian itself plus a per-class summary.
pub async fn health(board: web::Data<StatusBoard>) -> impl Responder {
    let Ok(board) = board.lock() else {
        return HttpResponse::InternalServerError().json(serde_json::json!({
            "status": "error"
        }));
    };

    let count = |class: HealthClass| board.rows.iter().filter(|r| r.health == Some(class)).count();
    let gave_up: Vec<&str> = board
        .rows
        .iter()
        .filter(|r| r.lifecycle == Lifecycle::GaveUp)
        .map(|r| r.id.as_str())
        .collect();

    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "mode": board.mode,
        "processes": board.rows.len(),
        "healthy": count(HealthClass::Healthy),
        "degraded": count(HealthClass::Degraded),
        "failed": count(HealthClass::Failed),
        "gave_up": gave_up,
    }))
}

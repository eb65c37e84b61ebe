pub mod control;
pub mod metrics;
pub mod status;

pub use control::{restart_all, restart_process};
pub use metrics::get_metrics;
pub use status::{get_status, health};

use actix_web::web;

/// 注册全部路由
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/status", web::get().to(get_status))
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(get_metrics))
        .route("/restart", web::post().to(restart_all))
        .route("/restart/{id}", web::post().to(restart_process));
}

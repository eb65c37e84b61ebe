use actix_web::{web, HttpResponse, Responder};
use tokio::sync::oneshot;

use crate::state::{ControlRequest, StatusBoard};

type Reply = oneshot::Sender<Result<(), String>>;

/// 把请求交给控制循环，等它处理完再回复
async fn forward(
    board: &StatusBoard,
    request: impl FnOnce(Reply) -> ControlRequest,
) -> Result<(), HttpResponse> {
    let sender = match board.lock() {
        Ok(board) => board.control.clone(),
        Err(_) => None,
    };
    let Some(sender) = sender else {
        return Err(HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "error",
            "message": "control loop not available"
        })));
    };

    let (reply, response) = oneshot::channel();
    if sender.send(request(reply)).await.is_err() {
        return Err(HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "error",
            "message": "guardian is shutting down"
        })));
    }

    match response.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(message)) => Err(HttpResponse::BadRequest().json(serde_json::json!({
            "status": "error",
            "message": message
        }))),
        Err(_) => Err(HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "error",
            "message": "control loop dropped the request"
        }))),
    }
}

/// POST /restart/{id}
pub async fn restart_process(board: web::Data<StatusBoard>, path: web::Path<String>) -> impl Responder {
    let id = path.into_inner();
    let target = id.clone();
    match forward(&board, move |reply| ControlRequest::Restart { id: target, reply }).await {
        Ok(()) => {
            log::info!("Process '{}' restarted via API", id);
            HttpResponse::Ok().json(serde_json::json!({
                "status": "success",
                "id": id
            }))
        }
        Err(response) => response,
    }
}

/// POST /restart：重启全部托管进程
pub async fn restart_all(board: web::Data<StatusBoard>) -> impl Responder {
    match forward(&board, |reply| ControlRequest::RestartAll { reply }).await {
        Ok(()) => {
            log::info!("All managed processes restarted via API");
            HttpResponse::Ok().json(serde_json::json!({
                "status": "success"
            }))
        }
        Err(response) => response,
    }
}

// 名额与队列状态处理器

use crate::server::state::AppState;
use crate::uploader::{SlotStatus, UploadKind};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

/// 统一API响应格式
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// 状态码 (0: 成功, 其他: 错误码)
    pub code: i32,
    /// 消息
    pub message: String,
    /// 数据
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
        }
    }
}

/// GET /api/v1/uploads/:kind/slot
/// 查询上传名额（前端排队轮询用）
pub async fn check_slot(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<ApiResponse<SlotStatus>>, StatusCode> {
    let kind = match UploadKind::parse(&kind) {
        Some(k) => k,
        None => return Err(StatusCode::NOT_FOUND),
    };

    let slot = state.manager_for(kind).check_slot();
    Ok(Json(ApiResponse::success(slot)))
}

/// GET /api/v1/uploads/:kind/queue
#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    /// 可选：查询该上传在队列中的名次
    #[serde(default)]
    pub id: Option<String>,
}

/// 队列快照
#[derive(Debug, Serialize)]
pub struct QueueStatusData {
    /// 活跃上传 ID
    pub active: Vec<String>,
    /// 等待中的上传 ID（先进先出顺序）
    pub queued: Vec<String>,
    /// 等待队列长度
    pub queue_length: usize,
    /// 查询 ID 的名次（0 起算，活跃成员在前；-1 表示不在队列中）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
}

/// 查询队列快照，可带 ?id= 查询单个上传的名次
pub async fn queue_status(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    axum::extract::Query(query): axum::extract::Query<QueueQuery>,
) -> Result<Json<ApiResponse<QueueStatusData>>, StatusCode> {
    let kind = match UploadKind::parse(&kind) {
        Some(k) => k,
        None => return Err(StatusCode::NOT_FOUND),
    };

    let manager = state.manager_for(kind);
    let snapshot = manager.queue_snapshot();
    let position = query.id.as_deref().map(|id| match manager.queue_position(id) {
        Some(pos) => pos as i64,
        None => -1,
    });

    Ok(Json(ApiResponse::success(QueueStatusData {
        queue_length: snapshot.queued.len(),
        active: snapshot.active,
        queued: snapshot.queued,
        position,
    })))
}

//! TUS 协议处理器
//!
//! 实现 TUS 1.0.0 的 creation / termination 扩展子集：
//! 创建上传、查询偏移、分片续传、取消与能力发现。
//! 所有响应都携带 Tus-Resumable 头

use crate::repository::{UploadRecord, UploadRecordStatus};
use crate::server::paths::resolve_destination;
use crate::server::protocol::{
    encode_upload_metadata, parse_upload_metadata, HEADER_TUS_EXTENSION, HEADER_TUS_MAX_SIZE,
    HEADER_TUS_RESUMABLE, HEADER_TUS_VERSION, HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA,
    HEADER_UPLOAD_OFFSET, OFFSET_CONTENT_TYPE, TUS_EXTENSIONS, TUS_VERSION,
};
use crate::server::state::AppState;
use crate::uploader::{UploadDescriptor, UploadError, UploadKind, UploadMetadata};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ==================== 响应构造 ====================

/// 空体响应骨架：所有 TUS 响应都带 Tus-Resumable 头
fn tus_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(HEADER_TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    response
}

/// 核心错误到协议状态码的映射
fn upload_error_response(err: &UploadError) -> Response {
    match err {
        UploadError::NotFound(_) => tus_response(StatusCode::NOT_FOUND),
        UploadError::AlreadyExists(_) => tus_response(StatusCode::CONFLICT),
        UploadError::Conflict { current } => {
            // 409 必须携带实际偏移，客户端据此重新对齐
            let mut response = tus_response(StatusCode::CONFLICT);
            response
                .headers_mut()
                .insert(HEADER_UPLOAD_OFFSET, HeaderValue::from(*current));
            response
        }
        UploadError::PayloadTooLarge { .. } => tus_response(StatusCode::PAYLOAD_TOO_LARGE),
        UploadError::Validation(_) | UploadError::NotComplete { .. } => {
            tus_response(StatusCode::BAD_REQUEST)
        }
        UploadError::Io(_) | UploadError::Internal(_) => {
            tus_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// 读取并解析数值请求头
fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

/// 归档显示名：项目取 filename，模块取 name，缺失时退回上传 ID
fn display_filename(kind: UploadKind, metadata: &UploadMetadata, id: &str) -> String {
    let key = match kind {
        UploadKind::Project => "filename",
        UploadKind::Module => "name",
    };
    match metadata.get(key) {
        Some(name) => name.to_string(),
        None => id.to_string(),
    }
}

// ==================== 协议处理器 ====================

/// POST /api/v1/uploads/:kind
/// 创建上传（creation 扩展）：校验声明大小与元数据，落库并注册准入
pub async fn create_upload(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
) -> Response {
    let kind = match UploadKind::parse(&kind) {
        Some(k) => k,
        None => return tus_response(StatusCode::NOT_FOUND),
    };
    let manager = state.manager_for(kind);

    let size = match header_u64(&headers, HEADER_UPLOAD_LENGTH) {
        Some(size) => size,
        None => {
            debug!("创建上传被拒: kind={}, Upload-Length 缺失或非法", kind);
            return tus_response(StatusCode::BAD_REQUEST);
        }
    };

    let metadata = match headers.get(HEADER_UPLOAD_METADATA) {
        Some(value) => {
            let raw = match value.to_str() {
                Ok(raw) => raw,
                Err(_) => {
                    debug!("创建上传被拒: kind={}, Upload-Metadata 含非法字符", kind);
                    return tus_response(StatusCode::BAD_REQUEST);
                }
            };
            match parse_upload_metadata(raw) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("创建上传被拒: kind={}, 元数据解析失败: {}", kind, e);
                    return upload_error_response(&e);
                }
            }
        }
        None => UploadMetadata::default(),
    };

    if let Err(e) = manager.validate_metadata(&metadata) {
        warn!("创建上传被拒: kind={}, 元数据校验失败: {}", kind, e);
        return upload_error_response(&e);
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = manager.initiate_upload(&id, size, metadata.clone()).await {
        warn!("创建上传失败: kind={}, id={}, error={}", kind, id, e);
        return upload_error_response(&e);
    }

    let record = UploadRecord::new(
        id.clone(),
        display_filename(kind, &metadata, &id),
        size,
        Utc::now() + state.flavor_config(kind).expiry(),
    );
    if let Err(e) = state.repo_for(kind).insert(&record).await {
        error!("上传记录落库失败: kind={}, id={}, error={}", kind, id, e);
        // 回滚暂存条目，避免留下无记录的孤儿分片
        if let Err(e) = manager.cancel_upload(&id).await {
            warn!("回滚暂存条目失败: id={}, error={}", id, e);
        }
        return tus_response(StatusCode::INTERNAL_SERVER_ERROR);
    }

    manager.add_to_queue(&id);
    info!(
        "🚀 创建上传: kind={}, id={}, size={}, filename={}",
        kind, id, size, record.filename
    );

    let mut response = tus_response(StatusCode::CREATED);
    let location = format!("/api/v1/uploads/{}/{}", kind, id);
    match HeaderValue::from_str(&location) {
        Ok(value) => {
            response.headers_mut().insert(header::LOCATION, value);
        }
        Err(_) => return tus_response(StatusCode::INTERNAL_SERVER_ERROR),
    }
    response
}

/// HEAD /api/v1/uploads/:kind/:id
/// 查询当前偏移；响应不可被中间层缓存
pub async fn head_upload(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let kind = match UploadKind::parse(&kind) {
        Some(k) => k,
        None => return tus_response(StatusCode::NOT_FOUND),
    };

    let descriptor = match state.manager_for(kind).get_status(&id).await {
        Ok(descriptor) => descriptor,
        Err(e) => {
            debug!("查询上传失败: kind={}, id={}, error={}", kind, id, e);
            return upload_error_response(&e);
        }
    };

    let mut response = tus_response(StatusCode::OK);
    let headers = response.headers_mut();
    headers.insert(HEADER_UPLOAD_OFFSET, HeaderValue::from(descriptor.offset));
    headers.insert(HEADER_UPLOAD_LENGTH, HeaderValue::from(descriptor.size));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if !descriptor.metadata.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&encode_upload_metadata(&descriptor.metadata)) {
            headers.insert(HEADER_UPLOAD_METADATA, value);
        }
    }
    response
}

/// PATCH /api/v1/uploads/:kind/:id
/// 写入分片：偏移必须与服务端一致；写满声明大小后自动归档
pub async fn write_chunk(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let kind = match UploadKind::parse(&kind) {
        Some(k) => k,
        None => return tus_response(StatusCode::NOT_FOUND),
    };
    let manager = state.manager_for(kind);

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim());
    if content_type != Some(OFFSET_CONTENT_TYPE) {
        debug!("分片被拒: id={}, Content-Type 不是 {}", id, OFFSET_CONTENT_TYPE);
        return tus_response(StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    let client_offset = match header_u64(&headers, HEADER_UPLOAD_OFFSET) {
        Some(offset) => offset,
        None => {
            debug!("分片被拒: id={}, Upload-Offset 缺失或非法", id);
            return tus_response(StatusCode::BAD_REQUEST);
        }
    };

    // 先确认上传存在，再接收请求体
    let descriptor = match manager.get_status(&id).await {
        Ok(descriptor) => descriptor,
        Err(e) => {
            debug!("分片被拒: kind={}, id={}, error={}", kind, id, e);
            return upload_error_response(&e);
        }
    };

    // 偏移预检：不一致时不必接收请求体；写入时还会在锁内做权威校验
    if client_offset != descriptor.offset {
        debug!(
            "分片偏移不一致: id={}, client={}, server={}",
            id, client_offset, descriptor.offset
        );
        return upload_error_response(&UploadError::Conflict {
            current: descriptor.offset,
        });
    }

    // 以剩余空间为上限流式收包，超限立即断开
    let remaining = descriptor.size - descriptor.offset;
    let mut data: Vec<u8> = Vec::new();
    let mut stream = body.into_data_stream();
    while let Some(next) = stream.next().await {
        let chunk = match next {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("读取分片请求体失败: id={}, error={}", id, e);
                return tus_response(StatusCode::BAD_REQUEST);
            }
        };
        let incoming = data.len() as u64 + chunk.len() as u64;
        if incoming > remaining {
            warn!(
                "分片超出声明大小: id={}, remaining={}, incoming={}",
                id, remaining, incoming
            );
            return upload_error_response(&UploadError::PayloadTooLarge {
                size: incoming,
                limit: remaining,
            });
        }
        data.extend_from_slice(&chunk);
    }

    let new_offset = match manager.handle_chunk(&id, client_offset, &data).await {
        Ok(offset) => offset,
        Err(e) => {
            warn!("写入分片失败: kind={}, id={}, error={}", kind, id, e);
            return upload_error_response(&e);
        }
    };

    // 活跃时间戳尽力刷新，失败不阻塞传输
    if let Err(e) = state.repo_for(kind).touch(&id).await {
        warn!("刷新活跃时间失败: id={}, error={}", id, e);
    }

    if new_offset == descriptor.size {
        return finalize_completed(&state, kind, &id, &descriptor).await;
    }

    let mut response = tus_response(StatusCode::NO_CONTENT);
    response
        .headers_mut()
        .insert(HEADER_UPLOAD_OFFSET, HeaderValue::from(new_offset));
    response
}

/// 写满后的归档流程：解析归档路径、定稿、腾出名额、标记完成
async fn finalize_completed(
    state: &AppState,
    kind: UploadKind,
    id: &str,
    descriptor: &UploadDescriptor,
) -> Response {
    let manager = state.manager_for(kind);
    let flavor = state.flavor_config(kind);

    let desired = display_filename(kind, &descriptor.metadata, id);
    let destination = match resolve_destination(&flavor.final_dir, &desired).await {
        Ok(path) => path,
        Err(e) => {
            error!("解析归档路径失败: kind={}, id={}, error={}", kind, id, e);
            return upload_error_response(&e);
        }
    };

    if let Err(e) = manager.finalize_upload(id, &destination).await {
        error!("归档失败: kind={}, id={}, error={}", kind, id, e);
        return upload_error_response(&e);
    }

    // 腾出活跃名额，队首等待者（如有）自动顶上
    manager.finish_upload(id);

    if let Err(e) = state
        .repo_for(kind)
        .update_status(id, UploadRecordStatus::Completed)
        .await
    {
        warn!("标记完成状态失败: id={}, error={}", id, e);
    }

    info!(
        "✅ 上传完成: kind={}, id={}, size={}, destination={}",
        kind,
        id,
        descriptor.size,
        destination.display()
    );

    let mut response = tus_response(StatusCode::NO_CONTENT);
    response
        .headers_mut()
        .insert(HEADER_UPLOAD_OFFSET, HeaderValue::from(descriptor.size));
    response
}

/// DELETE /api/v1/uploads/:kind/:id
/// 取消上传（termination 扩展）：退出队列并清除暂存与记录
pub async fn delete_upload(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let kind = match UploadKind::parse(&kind) {
        Some(k) => k,
        None => return tus_response(StatusCode::NOT_FOUND),
    };

    // 不在队列中也照常清理
    let _ = state.manager_for(kind).remove_from_queue(&id);

    if let Err(e) = state.reconciler.cleanup_upload(kind, &id).await {
        error!("清理上传失败: kind={}, id={}, error={}", kind, id, e);
        return tus_response(StatusCode::INTERNAL_SERVER_ERROR);
    }

    tus_response(StatusCode::NO_CONTENT)
}

/// OPTIONS /api/v1/uploads/:kind
/// 能力发现：协议版本、支持的扩展与该类型的大小上限
pub async fn tus_options(State(state): State<AppState>, Path(kind): Path<String>) -> Response {
    let kind = match UploadKind::parse(&kind) {
        Some(k) => k,
        None => return tus_response(StatusCode::NOT_FOUND),
    };

    let mut response = tus_response(StatusCode::NO_CONTENT);
    let headers = response.headers_mut();
    headers.insert(HEADER_TUS_VERSION, HeaderValue::from_static(TUS_VERSION));
    headers.insert(HEADER_TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS));
    headers.insert(
        HEADER_TUS_MAX_SIZE,
        HeaderValue::from(state.manager_for(kind).max_upload_size()),
    );
    response
}

//! TUS 1.0.0 协议编解码
//!
//! 头部常量与 Upload-Metadata 的 base64 编解码。
//! 元数据格式为逗号分隔的 `key base64value` 对，值可省略

use crate::uploader::{UploadError, UploadMetadata};

/// 协议版本号
pub const TUS_VERSION: &str = "1.0.0";
/// 本服务支持的扩展
pub const TUS_EXTENSIONS: &str = "creation,termination";
/// PATCH 请求要求的内容类型
pub const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

pub const HEADER_TUS_RESUMABLE: &str = "Tus-Resumable";
pub const HEADER_TUS_VERSION: &str = "Tus-Version";
pub const HEADER_TUS_EXTENSION: &str = "Tus-Extension";
pub const HEADER_TUS_MAX_SIZE: &str = "Tus-Max-Size";
pub const HEADER_UPLOAD_OFFSET: &str = "Upload-Offset";
pub const HEADER_UPLOAD_LENGTH: &str = "Upload-Length";
pub const HEADER_UPLOAD_METADATA: &str = "Upload-Metadata";

/// 解析 Upload-Metadata 头
///
/// 空头视为空元数据；键不得为空，值经 base64 标准字母表解码，
/// 必须是合法 UTF-8。重复键保留第一个出现的值
pub fn parse_upload_metadata(header: &str) -> Result<UploadMetadata, UploadError> {
    let mut metadata = UploadMetadata::new();
    if header.trim().is_empty() {
        return Ok(metadata);
    }

    for pair in header.split(',') {
        let mut tokens = pair.split_whitespace();
        let key = match tokens.next() {
            Some(key) => key,
            None => {
                return Err(UploadError::Validation(
                    "Upload-Metadata 含有空的键值对".to_string(),
                ));
            }
        };

        let value = match tokens.next() {
            // 无值键（如标志位）在协议里是合法的
            None => String::new(),
            Some(encoded) => {
                let bytes =
                    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
                        .map_err(|e| {
                            UploadError::Validation(format!(
                                "Upload-Metadata 键 {:?} 的值不是合法 base64: {}",
                                key, e
                            ))
                        })?;
                String::from_utf8(bytes).map_err(|_| {
                    UploadError::Validation(format!(
                        "Upload-Metadata 键 {:?} 的值不是合法 UTF-8",
                        key
                    ))
                })?
            }
        };

        if tokens.next().is_some() {
            return Err(UploadError::Validation(format!(
                "Upload-Metadata 键 {:?} 后有多余内容",
                key
            )));
        }

        metadata.push(key.to_string(), value);
    }

    Ok(metadata)
}

/// 编码为 Upload-Metadata 头的值（HEAD 响应回显用）
pub fn encode_upload_metadata(metadata: &UploadMetadata) -> String {
    metadata
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.to_string()
            } else {
                format!(
                    "{} {}",
                    key,
                    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, value)
                )
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

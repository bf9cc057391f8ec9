//! 归档路径策略
//!
//! 把元数据里的展示文件名变成归档目录下安全且不冲突的落盘路径

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::uploader::UploadError;

/// 同名冲突时最多尝试的编号后缀
const MAX_COLLISION_SUFFIX: u32 = 1000;

/// 清洗文件名，使其可以安全用作单个路径分量
///
/// 丢弃路径分隔与控制字符，剥掉前导点（杜绝 `..` 与隐藏文件），
/// 全部被清掉时回退为 "unnamed"
pub fn sanitize_filename(raw: &str) -> String {
    // 只保留最后一个路径分量，客户端传整条路径时取文件名部分
    let base = raw
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(raw);

    let cleaned: String = base
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// 在归档目录下为文件名找一个不存在的落点
///
/// 已占用时在扩展名前追加 ` (1)`、` (2)` 依此类推
pub async fn resolve_destination(
    final_dir: &Path,
    desired_name: &str,
) -> Result<PathBuf, UploadError> {
    let name = sanitize_filename(desired_name);
    fs::create_dir_all(final_dir).await?;

    let first = final_dir.join(&name);
    if !fs::try_exists(&first).await? {
        return Ok(first);
    }

    let (stem, extension) = split_name(&name);
    for index in 1..=MAX_COLLISION_SUFFIX {
        let candidate = if extension.is_empty() {
            final_dir.join(format!("{} ({})", stem, index))
        } else {
            final_dir.join(format!("{} ({}).{}", stem, index, extension))
        };
        if !fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }

    Err(UploadError::Internal(format!(
        "归档目录下 {:?} 的重名已超过 {} 个",
        name, MAX_COLLISION_SUFFIX
    )))
}

/// 拆出文件名主体与扩展名（无扩展名时第二项为空）
fn split_name(name: &str) -> (&str, &str) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (name, ""),
    }
}

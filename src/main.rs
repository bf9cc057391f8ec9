use axum::{
    http::HeaderValue,
    routing::{get, head, post},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tus_upload_rust::{
    config::{self, LogConfig},
    logging,
    server::handlers,
    AppConfig, AppState,
};

/// 加载日志配置
///
/// 尝试从配置文件加载，失败时返回默认配置
async fn load_log_config() -> LogConfig {
    // 尝试读取配置文件中的日志配置
    let config_path = config::DEFAULT_CONFIG_PATH;
    if let Ok(content) = tokio::fs::read_to_string(config_path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }

    // 返回默认配置
    LogConfig::default()
}

/// 按配置构造 CORS 层
///
/// 浏览器端 TUS 客户端要读取 Upload-Offset / Location 等响应头，
/// 必须显式暴露
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|origin| origin == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 🔥 先尝试加载日志配置，失败时使用默认配置
    let log_config = load_log_config().await;

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&log_config);

    info!("TUS Upload Rust v1.2.0 启动中...");

    // 加载配置并组装应用状态
    let app_config = AppConfig::load_or_default(config::DEFAULT_CONFIG_PATH).await;
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let cors = build_cors_layer(&app_config.server.cors_origins);

    let app_state = AppState::new(app_config).await?;
    info!("应用状态初始化完成");

    // 🔥 重启恢复：把数据库里未完成的上传重新登记进准入队列
    app_state.recover().await?;

    // 启动后台对账服务
    app_state.reconciler.start();

    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(cors);

    // 健康检查响应结构
    #[derive(Serialize)]
    struct HealthResponse {
        status: String,
        service: String,
    }

    // 健康检查处理器
    async fn health_check() -> Json<HealthResponse> {
        Json(HealthResponse {
            status: "ok".to_string(),
            service: "tus-upload-rust".to_string(),
        })
    }

    // API 路由
    let api_routes = Router::new()
        // TUS 协议端点
        .route(
            "/uploads/:kind",
            post(handlers::create_upload).options(handlers::tus_options),
        )
        .route(
            "/uploads/:kind/:id",
            head(handlers::head_upload)
                .patch(handlers::write_chunk)
                .delete(handlers::delete_upload),
        )
        // 名额与队列查询
        .route("/uploads/:kind/slot", get(handlers::check_slot))
        .route("/uploads/:kind/queue", get(handlers::queue_status))
        // 健康检查
        .route("/health", get(health_check))
        .with_state(app_state.clone());

    // 构建完整应用
    let app = Router::new().nest("/api/v1", api_routes).layer(middleware);

    // 启动服务器
    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("健康检查: http://{}/api/v1/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // 🔥 使用 select! 监听关闭信号，支持优雅关闭
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    // 🔥 优雅关闭
    info!("正在停止后台对账服务...");
    app_state.shutdown().await;
    info!("应用已安全退出");

    Ok(())
}

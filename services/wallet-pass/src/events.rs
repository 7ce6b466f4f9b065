//! 安装遥测
//!
//! 唯一会落库的状态。事件只追加、不更新；写入对发卡主路径而言
//! 完全是尽力而为——失败记日志，绝不影响响应。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use cardlink_common::new_id;
use cardlink_errors::{AppError, AppResult};

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Install,
    Scan,
    Uninstall,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Scan => "scan",
            Self::Uninstall => "uninstall",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "install" => Some(Self::Install),
            "scan" => Some(Self::Scan),
            "uninstall" => Some(Self::Uninstall),
            _ => None,
        }
    }
}

/// 遥测事件（追加写一次，永不更新）
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub id: Uuid,
    pub member_id: Option<String>,
    pub pass_id: Option<String>,
    pub platform: String,
    pub source: String,
    pub event_type: EventType,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(event_type: EventType, platform: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            member_id: None,
            pass_id: None,
            platform: platform.into(),
            source: source.into(),
            event_type,
            user_agent: None,
            ip_address: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_member(mut self, member_id: impl Into<String>) -> Self {
        self.member_id = Some(member_id.into());
        self
    }

    pub fn with_pass(mut self, pass_id: impl Into<String>) -> Self {
        self.pass_id = Some(pass_id.into());
        self
    }

    pub fn with_request_info(
        mut self,
        user_agent: Option<String>,
        ip_address: Option<String>,
    ) -> Self {
        self.user_agent = user_agent;
        self.ip_address = ip_address;
        self
    }
}

/// 事件存储接口
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, event: &TelemetryEvent) -> AppResult<()>;

    /// 存储连通性探测，供 /health 使用
    async fn check(&self) -> AppResult<()>;
}

/// PostgreSQL 事件存储
pub struct PgEventSink {
    pool: PgPool,
}

impl PgEventSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSink for PgEventSink {
    async fn append(&self, event: &TelemetryEvent) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO telemetry_events
                (id, member_id, pass_id, platform, source, event_type,
                 user_agent, ip_address, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(&event.member_id)
        .bind(&event.pass_id)
        .bind(&event.platform)
        .bind(&event.source)
        .bind(event.event_type.as_str())
        .bind(&event.user_agent)
        .bind(&event.ip_address)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::database(format!("Failed to append telemetry event: {}", e)))?;

        Ok(())
    }

    async fn check(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Telemetry store health check failed: {}", e)))?;
        Ok(())
    }
}

/// 遥测记录器
///
/// record 是发即忘：写入挂到独立任务上，主路径不等待。
#[derive(Clone)]
pub struct TelemetryRecorder {
    sink: std::sync::Arc<dyn EventSink>,
}

impl TelemetryRecorder {
    pub fn new(sink: std::sync::Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub fn record(&self, event: TelemetryEvent) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.append(&event).await {
                warn!(
                    error = %e,
                    event_type = event.event_type.as_str(),
                    platform = %event.platform,
                    "Failed to persist telemetry event"
                );
            }
        });
    }
}

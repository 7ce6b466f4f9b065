//! 会员解析
//!
//! 对外部只读会员库的级联查找：先精确匹配 (client, campaign)，
//! 再退到单字段匹配（录入时两个编码写反是常见事故）。
//! 外部库存在两套字段命名（snake_case 与历史 camelCase），
//! 由同一个通用查找函数按字段映射表依次尝试。

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use thiserror::Error;
use tracing::debug;

use cardlink_errors::{AppError, AppResult};

/// 外部会员记录（只读，永不回写）
#[derive(Debug, Clone, PartialEq)]
pub struct MemberRecord {
    pub external_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub client_code: String,
    pub campaign_code: String,
    pub tier_raw: Option<String>,
}

impl MemberRecord {
    /// 卡面展示名：姓名拼接，缺失时退回外部 ID
    pub fn display_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if name.is_empty() {
            self.external_id.clone()
        } else {
            name
        }
    }
}

/// 一套字段命名方案
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMap {
    pub name: &'static str,
    pub table: &'static str,
    pub external_id: &'static str,
    pub first_name: &'static str,
    pub last_name: &'static str,
    pub client_code: &'static str,
    pub campaign_code: &'static str,
    pub tier: &'static str,
}

/// 首选命名（snake_case）
pub static PRIMARY_FIELDS: FieldMap = FieldMap {
    name: "primary",
    table: "members",
    external_id: "external_id",
    first_name: "first_name",
    last_name: "last_name",
    client_code: "client_code",
    campaign_code: "campaign_code",
    tier: "tier",
};

/// 历史命名（camelCase，需要加引号的列名）
pub static LEGACY_FIELDS: FieldMap = FieldMap {
    name: "legacy",
    table: "members",
    external_id: "\"externalId\"",
    first_name: "\"firstName\"",
    last_name: "\"lastName\"",
    client_code: "\"clientCode\"",
    campaign_code: "\"campaignCode\"",
    tier: "\"tierName\"",
};

/// 级联查找的匹配条件，按声明顺序尝试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupFilter {
    /// (client_code, campaign_code) 精确匹配
    Exact,
    /// 只按 client_code
    ClientOnly,
    /// 只按 campaign_code（兜住两码写反的数据）
    CampaignOnly,
}

const LOOKUP_ORDER: [LookupFilter; 3] = [
    LookupFilter::Exact,
    LookupFilter::ClientOnly,
    LookupFilter::CampaignOnly,
];

/// 查找错误：字段缺失与其他存储错误必须可区分，
/// 只有前者允许换一套字段映射重试。
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error(transparent)]
    Store(#[from] AppError),
}

/// 会员库查询接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MemberStore: Send + Sync {
    async fn find(
        &self,
        fields: &'static FieldMap,
        filter: LookupFilter,
        client_code: &str,
        campaign_code: &str,
    ) -> Result<Option<MemberRecord>, LookupError>;
}

/// 级联解析会员
///
/// 三个条件严格按序尝试，返回第一个非空结果；
/// 全部落空返回 Ok(None)，由调用方用原始 client code 兜底展示，
/// 解析失败不阻断发卡。
pub async fn resolve_member(
    store: &dyn MemberStore,
    client_code: &str,
    campaign_code: &str,
) -> AppResult<Option<MemberRecord>> {
    for filter in LOOKUP_ORDER {
        if let Some(record) =
            find_with_schema_fallback(store, filter, client_code, campaign_code).await?
        {
            debug!(?filter, external_id = %record.external_id, "Member resolved");
            return Ok(Some(record));
        }
    }
    Ok(None)
}

/// 单次条件查找，容忍字段命名漂移
///
/// 先用首选字段集；只有“字段不存在”这一类失败才换历史字段集重试，
/// 其余错误一律向上传播。
async fn find_with_schema_fallback(
    store: &dyn MemberStore,
    filter: LookupFilter,
    client_code: &str,
    campaign_code: &str,
) -> AppResult<Option<MemberRecord>> {
    match store
        .find(&PRIMARY_FIELDS, filter, client_code, campaign_code)
        .await
    {
        Ok(found) => Ok(found),
        Err(LookupError::UnknownColumn(column)) => {
            debug!(%column, "Primary field set missing, retrying with legacy field names");
            store
                .find(&LEGACY_FIELDS, filter, client_code, campaign_code)
                .await
                .map_err(|e| match e {
                    LookupError::UnknownColumn(column) => AppError::database(format!(
                        "member store schema matches no known field set (missing {})",
                        column
                    )),
                    LookupError::Store(e) => e,
                })
        }
        Err(LookupError::Store(e)) => Err(e),
    }
}

/// PostgreSQL 会员库实现
pub struct PgMemberStore {
    pool: PgPool,
}

impl PgMemberStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn build_query(fields: &FieldMap, filter: LookupFilter) -> String {
        let predicate = match filter {
            LookupFilter::Exact => format!(
                "{} = $1 AND {} = $2",
                fields.client_code, fields.campaign_code
            ),
            LookupFilter::ClientOnly => format!("{} = $1", fields.client_code),
            LookupFilter::CampaignOnly => format!("{} = $1", fields.campaign_code),
        };

        // 统一别名到首选命名，行映射只认一套列名
        format!(
            "SELECT {ext} AS external_id, {first} AS first_name, {last} AS last_name, \
             {client} AS client_code, {campaign} AS campaign_code, {tier} AS tier \
             FROM {table} WHERE {predicate} LIMIT 1",
            ext = fields.external_id,
            first = fields.first_name,
            last = fields.last_name,
            client = fields.client_code,
            campaign = fields.campaign_code,
            tier = fields.tier,
            table = fields.table,
        )
    }

    fn map_row(row: &PgRow) -> Result<MemberRecord, LookupError> {
        Ok(MemberRecord {
            external_id: row.try_get("external_id").map_err(classify_sqlx_error)?,
            first_name: row.try_get("first_name").map_err(classify_sqlx_error)?,
            last_name: row.try_get("last_name").map_err(classify_sqlx_error)?,
            client_code: row.try_get("client_code").map_err(classify_sqlx_error)?,
            campaign_code: row.try_get("campaign_code").map_err(classify_sqlx_error)?,
            tier_raw: row.try_get("tier").map_err(classify_sqlx_error)?,
        })
    }
}

#[async_trait]
impl MemberStore for PgMemberStore {
    async fn find(
        &self,
        fields: &'static FieldMap,
        filter: LookupFilter,
        client_code: &str,
        campaign_code: &str,
    ) -> Result<Option<MemberRecord>, LookupError> {
        let sql = Self::build_query(fields, filter);
        let mut query = sqlx::query(&sql);
        query = match filter {
            LookupFilter::Exact => query.bind(client_code).bind(campaign_code),
            LookupFilter::ClientOnly => query.bind(client_code),
            LookupFilter::CampaignOnly => query.bind(campaign_code),
        };

        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;

        row.as_ref().map(Self::map_row).transpose()
    }
}

/// 把 sqlx 错误分拣为“字段缺失”与其他存储错误
///
/// PostgreSQL 的 undefined_column 是 42703。
fn classify_sqlx_error(e: sqlx::Error) -> LookupError {
    match &e {
        sqlx::Error::ColumnNotFound(column) => LookupError::UnknownColumn(column.clone()),
        sqlx::Error::Database(db) if db.code().as_deref() == Some("42703") => {
            LookupError::UnknownColumn(db.message().to_string())
        }
        _ => LookupError::Store(AppError::database(format!("member lookup failed: {}", e))),
    }
}

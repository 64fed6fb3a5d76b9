use application::repository::{MessageStatusStore, ParticipantDirectory};
use async_trait::async_trait;
use chrono::Utc;
use domain::{
    ConversationId, DomainError, MessageId, MessageStatus, RepositoryError, RepositoryResult,
    StatusTransition, UserId,
};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use uuid::Uuid;

const FOREIGN_KEY_VIOLATION: &str = "23503";

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    if let Some(db_err) = err.as_database_error() {
        if db_err.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) {
            return RepositoryError::NotFound;
        }
    }
    RepositoryError::storage(err.to_string())
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

fn parse_status(value: &str) -> RepositoryResult<MessageStatus> {
    value
        .parse()
        .map_err(|err: DomainError| invalid_data(err.to_string()))
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// PostgreSQL实现的会话成员目录
#[derive(Clone)]
pub struct PgParticipantDirectory {
    pool: PgPool,
}

impl PgParticipantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ParticipantDirectory for PgParticipantDirectory {
    async fn participants(
        &self,
        conversation_id: ConversationId,
    ) -> RepositoryResult<Vec<UserId>> {
        let conversation = Uuid::from(conversation_id);
        let members: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT user_id
            FROM conversation_participants
            WHERE conversation_id = $1 AND left_at IS NULL
            ORDER BY joined_at ASC
            "#,
        )
        .bind(conversation)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if members.is_empty() {
            // 区分“没有成员”和“会话不存在”
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM conversations WHERE id = $1)")
                    .bind(conversation)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(map_sqlx_err)?;
            if !exists {
                return Err(RepositoryError::NotFound);
            }
        }

        Ok(members.into_iter().map(UserId::from).collect())
    }
}

/// PostgreSQL实现的消息状态存储
///
/// 一个事务内完成：锁定消息行 → 取得（或创建）该接收方的回执 → 按状态机推进
/// → 同步推进消息的汇总状态。
#[derive(Clone)]
pub struct PgMessageStatusStore {
    pool: PgPool,
}

impl PgMessageStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn advance_aggregate(
        tx: &mut Transaction<'_, Postgres>,
        message_id: Uuid,
        current: MessageStatus,
        to: MessageStatus,
    ) -> RepositoryResult<()> {
        // 汇总状态只向前走；已失败的消息保持不变
        let Ok(StatusTransition::Applied { .. }) = current.advance(to) else {
            return Ok(());
        };
        sqlx::query("UPDATE messages SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(message_id)
            .bind(to.as_str())
            .bind(Utc::now())
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl MessageStatusStore for PgMessageStatusStore {
    async fn update_status(
        &self,
        message_id: MessageId,
        user_id: UserId,
        status: MessageStatus,
    ) -> RepositoryResult<StatusTransition> {
        let message = Uuid::from(message_id);
        let user = Uuid::from(user_id);
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let aggregate: Option<String> =
            sqlx::query_scalar("SELECT status FROM messages WHERE id = $1 FOR UPDATE")
                .bind(message)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
        let aggregate = parse_status(&aggregate.ok_or(RepositoryError::NotFound)?)?;

        sqlx::query(
            r#"
            INSERT INTO message_receipts (message_id, user_id, status, updated_at)
            VALUES ($1, $2, 'sent', $3)
            ON CONFLICT (message_id, user_id) DO NOTHING
            "#,
        )
        .bind(message)
        .bind(user)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let current: String = sqlx::query_scalar(
            "SELECT status FROM message_receipts WHERE message_id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(message)
        .bind(user)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        let current = parse_status(&current)?;

        let transition = current.advance(status).map_err(|err| match err {
            DomainError::IllegalTransition { .. } => RepositoryError::Conflict,
            other => invalid_data(other.to_string()),
        })?;

        if let StatusTransition::Applied { to, .. } = transition {
            let now = Utc::now();
            sqlx::query(
                r#"
                UPDATE message_receipts
                SET status = $3,
                    delivered_at = CASE WHEN $3 IN ('delivered', 'read')
                                        THEN COALESCE(delivered_at, $4) ELSE delivered_at END,
                    read_at = CASE WHEN $3 = 'read' THEN COALESCE(read_at, $4) ELSE read_at END,
                    updated_at = $4
                WHERE message_id = $1 AND user_id = $2
                "#,
            )
            .bind(message)
            .bind(user)
            .bind(to.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

            Self::advance_aggregate(&mut tx, message, aggregate, to).await?;
        }

        tx.commit().await.map_err(map_sqlx_err)?;

        tracing::debug!(
            message_id = %message_id,
            user_id = %user_id,
            transition = ?transition,
            "消息状态已更新"
        );
        Ok(transition)
    }
}

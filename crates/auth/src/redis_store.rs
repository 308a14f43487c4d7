use async_trait::async_trait;
use redis::{AsyncCommands, Client as RedisClient, ExistenceCheck, SetExpiry, SetOptions, Value};
use std::time::Duration;

use crate::session_store::{lock_key, session_key, Lease, SessionRecord, SessionStore, StoreError};

/// Deletes the lock only while it still holds our token.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

#[async_trait]
impl SessionStore for RedisClient {
    #[tracing::instrument(skip(self, record), err)]
    async fn put_session(
        &self,
        username: &str,
        session_id: &str,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        let Some(ttl) = record.ttl(chrono::Utc::now().timestamp()) else {
            return self.delete_session(username, session_id).await;
        };
        let value = serde_json::to_string(record)?;
        self.get_multiplexed_async_connection()
            .await?
            .set_options::<_, _, ()>(
                session_key(username, session_id),
                value,
                SetOptions::default().with_expiration(SetExpiry::EX(ttl.as_secs().max(1))),
            )
            .await
            .map_err(|err| {
                tracing::error!("{err:?}");
                err
            })?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn get_session(
        &self,
        username: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let value: Option<String> = self
            .get_multiplexed_async_connection()
            .await?
            .get(session_key(username, session_id))
            .await
            .map_err(|err| {
                tracing::error!("{err:?}");
                err
            })?;
        Ok(value.map(|value| serde_json::from_str(&value)).transpose()?)
    }

    #[tracing::instrument(skip(self), err)]
    async fn delete_session(&self, username: &str, session_id: &str) -> Result<(), StoreError> {
        self.get_multiplexed_async_connection()
            .await?
            .del::<_, ()>(session_key(username, session_id))
            .await
            .map_err(|err| {
                tracing::error!("{err:?}");
                err
            })?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn try_lock(&self, session_id: &str, ttl: Duration) -> Result<Option<Lease>, StoreError> {
        let lease = Lease::new(session_id);
        let reply: Value = self
            .get_multiplexed_async_connection()
            .await?
            .set_options(
                lock_key(session_id),
                &lease.token,
                SetOptions::default()
                    .conditional_set(ExistenceCheck::NX)
                    .with_expiration(SetExpiry::EX(ttl.as_secs().max(1))),
            )
            .await
            .map_err(|err| {
                tracing::error!("{err:?}");
                err
            })?;
        Ok((!matches!(reply, Value::Nil)).then_some(lease))
    }

    #[tracing::instrument(skip(self, lease), fields(session_id = lease.session_id), err)]
    async fn unlock(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut conn = self.get_multiplexed_async_connection().await?;
        redis::Script::new(UNLOCK_SCRIPT)
            .key(lock_key(&lease.session_id))
            .arg(&lease.token)
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(|err| {
                tracing::error!("{err:?}");
                err
            })?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Needs a local redis-server: `cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn lease_against_live_redis() {
        let client = RedisClient::open("redis://127.0.0.1/").unwrap();
        client.ping().await.unwrap();
        let lease = client
            .try_lock("live-test", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(client
            .try_lock("live-test", Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());
        client.unlock(&lease).await.unwrap();
        client.unlock(&lease).await.unwrap();

        let now = chrono::Utc::now().timestamp();
        let record = SessionRecord::new(Some("sealed".into()), now + 30, now + 60);
        client.put_session("alice", "live", &record).await.unwrap();
        assert_eq!(client.get_session("alice", "live").await.unwrap(), Some(record));
        client.delete_session("alice", "live").await.unwrap();
        assert_eq!(client.get_session("alice", "live").await.unwrap(), None);
    }
}

//! A Redis [`Broker`] for jobhub.
//!
//! Each lane is a list, `<namespace>:lane:<lane>`, pushed on the left and popped on the right so
//! messages within a lane keep their publish order. Delayed messages wait in a sorted set,
//! `<namespace>:delayed`, scored by the millisecond timestamp at which they become visible, and are
//! moved onto their lane by a Lua script before each pop. Workers pop with `BRPOP` over the three
//! lane keys in priority order.
//!
//! A popped message is gone from Redis. If the worker holding it dies, the job record stays
//! `processing` until an operator re-enqueues or fails it.
use std::{
    fmt::Display,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use jobhub::{
    broker::{Broker, BrokerError, Delivery, TaskRef},
    job::Lane,
};
use redis::{
    aio::{ConnectionManager, MultiplexedConnection},
    AsyncCommands, Client, RedisError, Script, ToRedisArgs,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Moves due members of the delayed set onto their lanes and returns the score of the next
/// delayed member, or -1 when there is none.
const PROMOTE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local lanes = { high = KEYS[2], default = KEYS[3], low = KEYS[4] }
for _, member in ipairs(due) do
    local envelope = cjson.decode(member)
    redis.call('LPUSH', lanes[envelope.lane], cjson.encode(envelope.task))
    redis.call('ZREM', KEYS[1], member)
end
local next_due = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if next_due[2] then
    return tonumber(next_due[2])
end
return -1
"#;

const PROMOTE_BATCH: usize = 100;
const MAX_BLOCK: Duration = Duration::from_secs(1);
const MIN_BLOCK: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
    /// Connections reserved for `BRPOP`, which would stall every other command on a shared one.
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
    promote: Script,
    namespace: NameSpace,
}

fn map_err(error: RedisError) -> BrokerError {
    tracing::error!(?error, "Redis broker command failed: {error}");
    BrokerError::Connection(error.to_string())
}

impl RedisBroker {
    /// Connects to `redis_url`, prefixing every key with `namespace`.
    pub async fn connect(redis_url: &str, namespace: impl ToString) -> Result<Self, BrokerError> {
        let client = Client::open(redis_url).map_err(map_err)?;

        Ok(Self {
            conn: ConnectionManager::new(client.clone()).await.map_err(map_err)?,
            client,
            blocking: Default::default(),
            promote: Script::new(PROMOTE_DUE),
            namespace: NameSpace(namespace.to_string()),
        })
    }

    async fn checkout(&self) -> Result<MultiplexedConnection, BrokerError> {
        let idle = self
            .blocking
            .lock()
            .map_err(|_| BrokerError::BadState)?
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(map_err),
        }
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        if let Ok(mut idle) = self.blocking.lock() {
            idle.push(conn);
        }
    }

    /// Publishes every delayed message that is due, returning when the next one will be.
    async fn promote_due(&self) -> Result<Option<i64>, BrokerError> {
        let mut conn = self.conn.clone();
        let next_due: i64 = self
            .promote
            .key(self.namespace.delayed())
            .key(self.namespace.lane(Lane::High))
            .key(self.namespace.lane(Lane::Default))
            .key(self.namespace.lane(Lane::Low))
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok((next_due >= 0).then_some(next_due))
    }

    async fn pop(
        &self,
        conn: &mut MultiplexedConnection,
        block: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(self.namespace.lane(Lane::High))
            .arg(self.namespace.lane(Lane::Default))
            .arg(self.namespace.lane(Lane::Low))
            .arg(block.as_secs_f64())
            .query_async(conn)
            .await
            .map_err(map_err)?;
        let Some((key, payload)) = popped else {
            return Ok(None);
        };
        let lane = self.namespace.lane_of(&key).ok_or(BrokerError::BadState)?;
        let task = serde_json::from_str(&payload)?;
        Ok(Some(Delivery { lane, task }))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(
        &self,
        lane: Lane,
        task: TaskRef,
        delay: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let job_id = task.job_id;
        match delay.filter(|delay| !delay.is_zero()) {
            None => {
                let payload = serde_json::to_string(&task)?;
                conn.lpush::<_, _, ()>(self.namespace.lane(lane), payload)
                    .await
                    .map_err(map_err)?;
            }
            Some(delay) => {
                let visible_at = Utc::now().timestamp_millis()
                    + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
                let envelope = serde_json::to_string(&DelayedTask {
                    lane,
                    nonce: Uuid::new_v4(),
                    task,
                })?;
                conn.zadd::<_, _, _, ()>(self.namespace.delayed(), envelope, visible_at)
                    .await
                    .map_err(map_err)?;
            }
        }
        tracing::debug!(%job_id, %lane, ?delay, "Published task");
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        let mut conn = self.checkout().await?;
        loop {
            let mut block = deadline.saturating_duration_since(Instant::now()).min(MAX_BLOCK);
            if let Some(next_due) = self.promote_due().await? {
                let until_due = (next_due - Utc::now().timestamp_millis()).max(0);
                block = block.min(Duration::from_millis(until_due as u64));
            }

            if let Some(delivery) = self.pop(&mut conn, block.max(MIN_BLOCK)).await? {
                self.checkin(conn);
                return Ok(Some(delivery));
            }
            if Instant::now() >= deadline {
                self.checkin(conn);
                return Ok(None);
            }
        }
    }

    async fn pending(&self, lane: Lane) -> Result<usize, BrokerError> {
        let mut conn = self.conn.clone();
        let visible: usize = conn
            .llen(self.namespace.lane(lane))
            .await
            .map_err(map_err)?;
        let delayed: Vec<String> = conn
            .zrange(self.namespace.delayed(), 0, -1)
            .await
            .map_err(map_err)?;
        let delayed = delayed
            .iter()
            .filter_map(|member| serde_json::from_str::<DelayedTask>(member).ok())
            .filter(|member| member.lane == lane)
            .count();
        Ok(visible + delayed)
    }
}

/// Member of the delayed set. The nonce keeps two identical references distinct.
#[derive(Debug, Serialize, Deserialize)]
struct DelayedTask {
    lane: Lane,
    nonce: Uuid,
    task: TaskRef,
}

#[derive(Clone, Debug)]
struct NameSpace(String);

impl NameSpace {
    fn lane(&self, lane: Lane) -> NameSpacedKey<'_> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyType::Lane(lane),
        }
    }

    fn delayed(&self) -> NameSpacedKey<'_> {
        NameSpacedKey {
            namespace: &self.0,
            kind: KeyType::Delayed,
        }
    }

    fn lane_of(&self, key: &str) -> Option<Lane> {
        Lane::ALL
            .into_iter()
            .find(|lane| self.lane(*lane).to_string() == key)
    }
}

struct NameSpacedKey<'a> {
    namespace: &'a str,
    kind: KeyType,
}

impl Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.namespace)?;
        match self.kind {
            KeyType::Lane(lane) => write!(f, ":lane:{lane}"),
            KeyType::Delayed => write!(f, ":delayed"),
        }
    }
}

impl ToRedisArgs for NameSpacedKey<'_> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

enum KeyType {
    Lane(Lane),
    Delayed,
}

#[cfg(test)]
mod test {
    use jobhub::{broker_test_suite, job::JobId};

    use super::*;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_owned())
    }

    async fn broker() -> RedisBroker {
        RedisBroker::connect(&redis_url(), format!("jobhub-test-{}", Uuid::new_v4()))
            .await
            .unwrap()
    }

    broker_test_suite!(
        #[ignore = "requires a Redis server at REDIS_URL"]
        attr: tokio::test,
        args: (),
        broker: broker().await
    );

    #[test]
    fn keys_are_namespaced() {
        let namespace = NameSpace("grading".to_owned());

        assert_eq!(namespace.lane(Lane::High).to_string(), "grading:lane:high");
        assert_eq!(namespace.lane(Lane::Low).to_string(), "grading:lane:low");
        assert_eq!(namespace.delayed().to_string(), "grading:delayed");
    }

    #[test]
    fn popped_keys_map_back_to_lanes() {
        let namespace = NameSpace("grading".to_owned());

        assert_eq!(namespace.lane_of("grading:lane:default"), Some(Lane::Default));
        assert_eq!(namespace.lane_of("other:lane:default"), None);
        assert_eq!(namespace.lane_of("grading:delayed"), None);
    }

    #[test]
    fn delayed_envelope_has_the_fields_the_script_reads() {
        let task = TaskRef {
            job_id: JobId::new(),
            task_type: "send_email".to_owned(),
        };
        let envelope = serde_json::to_value(DelayedTask {
            lane: Lane::Low,
            nonce: Uuid::new_v4(),
            task: task.clone(),
        })
        .unwrap();

        assert_eq!(envelope["lane"], "low");
        assert_eq!(
            serde_json::from_value::<TaskRef>(envelope["task"].clone()).unwrap(),
            task
        );
    }
}

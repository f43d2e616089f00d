use super::script::{FIXED_WINDOW_LUA, LEAKY_BUCKET_LUA, TOKEN_BUCKET_LUA};
use super::{Batch, BatchReplies, Command, CommandResult, Reply, Script, Store};
use crate::error::{LimiterError, Result};
use ::redis::aio::ConnectionManager;
use ::redis::{Client, FromRedisValue, Pipeline, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::{debug, info};

// Hashed once; invocations go through EVALSHA and fall back to EVAL on NOSCRIPT.
static FIXED_WINDOW: LazyLock<::redis::Script> =
    LazyLock::new(|| ::redis::Script::new(FIXED_WINDOW_LUA));
static TOKEN_BUCKET: LazyLock<::redis::Script> =
    LazyLock::new(|| ::redis::Script::new(TOKEN_BUCKET_LUA));
static LEAKY_BUCKET: LazyLock<::redis::Script> =
    LazyLock::new(|| ::redis::Script::new(LEAKY_BUCKET_LUA));

fn cached(script: &Script) -> &'static ::redis::Script {
    match script {
        Script::FixedWindow { .. } => &*FIXED_WINDOW,
        Script::TokenBucket { .. } => &*TOKEN_BUCKET,
        Script::LeakyBucket { .. } => &*LEAKY_BUCKET,
    }
}

/// Redis-backed store. Holds one multiplexed, auto-reconnecting connection
/// that every limiter shares; cloning the handle does not open a new socket.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            LimiterError::Configuration(format!("Failed to create Redis client: {}", e))
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            LimiterError::StoreUnavailable(format!("Failed to connect to Redis: {}", e))
        })?;

        info!("Connected to Redis");
        Ok(Self { connection })
    }

    async fn invoke(
        &self,
        batch: &Batch,
        command: &Command,
        script: &Script,
        keys: &[String],
    ) -> Result<BatchReplies> {
        let mut invocation = cached(script).prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in script.args() {
            invocation.arg(arg);
        }

        let mut connection = self.connection.clone();
        let result = match invocation.invoke_async::<_, Value>(&mut connection).await {
            Ok(value) => convert(command, &value),
            // Script errors belong to the command; transport errors fail the batch.
            Err(err) => match LimiterError::from(err) {
                LimiterError::StoreBatchFailed(message) => Err(message),
                unavailable => return Err(unavailable),
            },
        };

        debug!(keys = keys.len(), "Evaluated Redis script");
        BatchReplies::new(batch, vec![result])
    }
}

fn append(pipe: &mut Pipeline, command: &Command) {
    match command {
        Command::Get { key } => {
            pipe.cmd("GET").arg(key);
        }
        Command::Set { key, value } => {
            pipe.cmd("SET").arg(key).arg(value);
        }
        Command::Incr { key } => {
            pipe.cmd("INCR").arg(key);
        }
        Command::Expire {
            key,
            seconds,
            only_if_no_expiry,
        } => {
            pipe.cmd("EXPIRE").arg(key).arg(*seconds);
            if *only_if_no_expiry {
                pipe.arg("NX");
            }
        }
        Command::PExpire { key, millis } => {
            pipe.cmd("PEXPIRE").arg(key).arg(*millis);
        }
        Command::ZAdd { key, score, member } => {
            pipe.cmd("ZADD").arg(key).arg(*score).arg(member);
        }
        Command::ZRemRangeByScore { key, min, max } => {
            pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg(*min).arg(*max);
        }
        Command::ZRange { key } => {
            pipe.cmd("ZRANGE").arg(key).arg(0).arg(-1);
        }
        Command::HGetAll { key } => {
            pipe.cmd("HGETALL").arg(key);
        }
        Command::HSet { key, field, value } => {
            pipe.cmd("HSET").arg(key).arg(field).arg(value);
        }
        Command::Del { key } => {
            pipe.cmd("DEL").arg(key);
        }
        Command::Eval { script, keys } => {
            pipe.cmd("EVAL")
                .arg(script.source())
                .arg(keys.len())
                .arg(keys)
                .arg(script.args());
        }
    }
}

/// Converts a raw reply into the shape the command is documented to return.
fn convert(command: &Command, value: &Value) -> CommandResult {
    let result = match command {
        Command::Get { .. } => Option::<String>::from_redis_value(value)
            .map(|v| v.map_or(Reply::Nil, Reply::Text)),
        Command::Set { .. } => Ok(Reply::Text("OK".to_string())),
        Command::ZRange { .. } => Vec::<String>::from_redis_value(value).map(Reply::List),
        Command::HGetAll { .. } => {
            HashMap::<String, String>::from_redis_value(value).map(Reply::Map)
        }
        Command::Incr { .. }
        | Command::Expire { .. }
        | Command::PExpire { .. }
        | Command::ZAdd { .. }
        | Command::ZRemRangeByScore { .. }
        | Command::HSet { .. }
        | Command::Del { .. } => i64::from_redis_value(value).map(Reply::Int),
        Command::Eval { .. } => Vec::<i64>::from_redis_value(value).map(Reply::Ints),
    };
    result.map_err(|e| e.to_string())
}

#[async_trait]
impl Store for RedisStore {
    async fn exec(&self, batch: &Batch) -> Result<BatchReplies> {
        // A lone script is already atomic; skip MULTI and use the cached hash.
        if let [command @ Command::Eval { script, keys }] = batch.commands() {
            return self.invoke(batch, command, script, keys).await;
        }

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for command in batch.commands() {
            append(&mut pipe, command);
        }

        let mut connection = self.connection.clone();
        let response: Value = pipe.query_async(&mut connection).await?;

        let values = match response {
            Value::Bulk(values) => values,
            Value::Nil => {
                return Err(LimiterError::StoreBatchFailed(
                    "Transaction was aborted".into(),
                ))
            }
            other => {
                return Err(LimiterError::StoreBatchFailed(format!(
                    "Unexpected transaction reply: {:?}",
                    other
                )))
            }
        };

        debug!(commands = batch.len(), "Executed Redis transaction");

        let results = batch
            .commands()
            .iter()
            .zip(values.iter())
            .map(|(command, value)| convert(command, value))
            .collect();

        BatchReplies::new(batch, results)
    }

    async fn ping(&self) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut connection).await?;
        Ok(())
    }
}

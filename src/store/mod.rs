//! Shared key-value store contract consumed by the limiters.
//!
//! A limiter never talks to a connection directly: it assembles a [`Batch`]
//! of commands and hands it to a [`Store`], which must execute the whole batch
//! as one indivisible unit relative to other batches. Both the Redis adapter
//! (`MULTI`/`EXEC`) and the in-process [`MemoryStore`] honour this.
//! Read-modify-write checks go through a single [`Script`] command.

pub mod memory;
pub mod redis;
pub mod script;

use crate::error::{LimiterError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::str::FromStr;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::script::{Script, ScriptOutcome};

/// A single store operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get { key: String },
    Set { key: String, value: String },
    Incr { key: String },
    Expire { key: String, seconds: u64, only_if_no_expiry: bool },
    PExpire { key: String, millis: u64 },
    ZAdd { key: String, score: f64, member: String },
    ZRemRangeByScore { key: String, min: f64, max: f64 },
    ZRange { key: String },
    HGetAll { key: String },
    HSet { key: String, field: String, value: String },
    Del { key: String },
    /// Runs `script` atomically over `keys`.
    Eval { script: Script, keys: Vec<String> },
}

/// The value a command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Int(i64),
    Text(String),
    List(Vec<String>),
    Map(HashMap<String, String>),
    Ints(Vec<i64>),
}

/// Per-command outcome inside a batch; errors are reported in place.
pub type CommandResult = std::result::Result<Reply, String>;

/// An ordered list of commands executed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn get(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::Get { key: key.into() })
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.push(Command::Set {
            key: key.into(),
            value: value.to_string(),
        })
    }

    pub fn incr(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::Incr { key: key.into() })
    }

    pub fn expire(&mut self, key: impl Into<String>, seconds: u64, only_if_no_expiry: bool) -> &mut Self {
        self.push(Command::Expire {
            key: key.into(),
            seconds,
            only_if_no_expiry,
        })
    }

    pub fn pexpire(&mut self, key: impl Into<String>, millis: u64) -> &mut Self {
        self.push(Command::PExpire {
            key: key.into(),
            millis,
        })
    }

    pub fn zadd(&mut self, key: impl Into<String>, score: f64, member: impl Into<String>) -> &mut Self {
        self.push(Command::ZAdd {
            key: key.into(),
            score,
            member: member.into(),
        })
    }

    pub fn zrem_range_by_score(&mut self, key: impl Into<String>, min: f64, max: f64) -> &mut Self {
        self.push(Command::ZRemRangeByScore {
            key: key.into(),
            min,
            max,
        })
    }

    pub fn zrange(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::ZRange { key: key.into() })
    }

    pub fn hgetall(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::HGetAll { key: key.into() })
    }

    pub fn hset(&mut self, key: impl Into<String>, field: impl Into<String>, value: impl ToString) -> &mut Self {
        self.push(Command::HSet {
            key: key.into(),
            field: field.into(),
            value: value.to_string(),
        })
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::Del { key: key.into() })
    }

    pub fn eval(&mut self, script: Script, keys: Vec<String>) -> &mut Self {
        self.push(Command::Eval { script, keys })
    }
}

/// Results of an executed batch, one slot per command, in order.
#[derive(Debug, Clone)]
pub struct BatchReplies {
    results: Vec<CommandResult>,
}

impl BatchReplies {
    /// Fails with `StoreBatchFailed` unless there is exactly one result per command.
    pub fn new(batch: &Batch, results: Vec<CommandResult>) -> Result<Self> {
        if results.len() != batch.len() {
            return Err(LimiterError::StoreBatchFailed(format!(
                "expected {} replies, store returned {}",
                batch.len(),
                results.len()
            )));
        }
        Ok(Self { results })
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Takes the reply at `index`, turning an in-place command error into a batch failure.
    pub fn take(&mut self, index: usize) -> Result<Reply> {
        match self.results.get_mut(index) {
            Some(slot) => match std::mem::replace(slot, Ok(Reply::Nil)) {
                Ok(reply) => Ok(reply),
                Err(message) => Err(LimiterError::StoreBatchFailed(message)),
            },
            None => Err(LimiterError::StoreBatchFailed(format!(
                "no reply at position {index}"
            ))),
        }
    }

    /// Fails if any command in the batch reported an error.
    pub fn check(self) -> Result<()> {
        for result in self.results {
            if let Err(message) = result {
                return Err(LimiterError::StoreBatchFailed(message));
            }
        }
        Ok(())
    }
}

impl Reply {
    /// Decodes a scalar reply. `Nil` is `Ok(None)`, anything unparsable is a `SchemaMismatch`.
    pub fn decode<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        let mismatch = || LimiterError::SchemaMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
        };
        match self {
            Reply::Nil => Ok(None),
            Reply::Int(value) => value.to_string().parse().map(Some).map_err(|_| mismatch()),
            Reply::Text(text) => text.trim().parse().map(Some).map_err(|_| mismatch()),
            Reply::List(_) | Reply::Map(_) | Reply::Ints(_) => Err(mismatch()),
        }
    }

    pub fn into_list(self) -> Vec<String> {
        match self {
            Reply::List(items) => items,
            _ => Vec::new(),
        }
    }

    pub fn into_map(self) -> HashMap<String, String> {
        match self {
            Reply::Map(map) => map,
            _ => HashMap::new(),
        }
    }
}

/// A shared store able to execute atomic batches.
#[async_trait]
pub trait Store: Send + Sync {
    /// Executes every command of `batch` as one atomic unit.
    async fn exec(&self, batch: &Batch) -> Result<BatchReplies>;

    /// Round-trips to the store to prove it is reachable.
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut batch = Batch::new();
        batch.get(key);
        let mut replies = self.exec(&batch).await?;
        match replies.take(0)? {
            Reply::Text(text) => Ok(Some(text)),
            Reply::Int(value) => Ok(Some(value.to_string())),
            _ => Ok(None),
        }
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut batch = Batch::new();
        for key in keys {
            batch.del(key.as_str());
        }
        self.exec(&batch).await?.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_builder_preserves_order() {
        let mut batch = Batch::new();
        batch.get("a").incr("a").expire("a", 10, true);
        assert_eq!(batch.len(), 3);
        assert_eq!(
            batch.commands()[2],
            Command::Expire {
                key: "a".into(),
                seconds: 10,
                only_if_no_expiry: true
            }
        );
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(Reply::Nil.decode::<i64>("k").unwrap(), None);
        assert_eq!(Reply::Text(" 42 ".into()).decode::<i64>("k").unwrap(), Some(42));
        assert_eq!(Reply::Int(3).decode::<f64>("k").unwrap(), Some(3.0));
        assert!(Reply::List(vec![]).decode::<i64>("k").is_err());
    }

    #[test]
    fn test_decode_reports_schema_mismatch() {
        let err = Reply::Text("abc".into()).decode::<i64>("k").unwrap_err();
        assert!(matches!(err, LimiterError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_batch_replies_length_mismatch() {
        let mut batch = Batch::new();
        batch.get("a").get("b");
        let err = BatchReplies::new(&batch, vec![Ok(Reply::Nil)]).unwrap_err();
        assert!(matches!(err, LimiterError::StoreBatchFailed(_)));
    }

    #[test]
    fn test_batch_replies_in_place_error() {
        let mut batch = Batch::new();
        batch.get("a").incr("a");
        let mut replies =
            BatchReplies::new(&batch, vec![Ok(Reply::Nil), Err("WRONGTYPE".into())]).unwrap();
        assert_eq!(replies.take(0).unwrap(), Reply::Nil);
        assert!(replies.take(1).is_err());
    }
}

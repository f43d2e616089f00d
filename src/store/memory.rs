//! In-process store with Redis-like semantics.
//!
//! Every batch runs under a single lock, which gives the same atomicity a
//! `MULTI`/`EXEC` block gives on Redis. Expiry is evaluated lazily against the
//! injected clock, so tests can move time forward without sleeping.
//! Scripts are interpreted with the same primitive commands their Lua
//! counterparts call.

use super::script::{leak, refill, FIELD_LAST_UPDATE, FIELD_LEVEL};
use super::{Batch, BatchReplies, Command, CommandResult, Reply, Script, ScriptOutcome, Store};
use crate::clock::{Clock, SystemClock};
use crate::error::{LimiterError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    SortedSet(Vec<(f64, String)>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Whether `key` currently holds a live (unexpired) value.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.entries
            .lock()
            .map(|entries| entries.get(key).map_or(false, |e| !is_expired(e, now)))
            .unwrap_or(false)
    }

    /// Remaining time to live of `key` in milliseconds, if it has one.
    pub fn ttl_ms(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_ms();
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(key).filter(|e| !is_expired(e, now))?;
        entry.expires_at.map(|at| at - now)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|e| !is_expired(e, now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_expired(entry: &Entry, now: i64) -> bool {
    entry.expires_at.map_or(false, |at| at <= now)
}

fn apply(entries: &mut HashMap<String, Entry>, command: &Command, now: i64) -> CommandResult {
    // Drop an expired entry before any command observes it.
    if let Some(key) = command_key(command) {
        if entries.get(key).map_or(false, |e| is_expired(e, now)) {
            entries.remove(key);
        }
    }

    match command {
        Command::Get { key } => match entries.get(key) {
            None => Ok(Reply::Nil),
            Some(Entry { value: Value::Text(text), .. }) => Ok(Reply::Text(text.clone())),
            Some(_) => Err(WRONGTYPE.to_string()),
        },
        Command::Set { key, value } => {
            entries.insert(
                key.clone(),
                Entry {
                    value: Value::Text(value.clone()),
                    expires_at: None,
                },
            );
            Ok(Reply::Text("OK".to_string()))
        }
        Command::Incr { key } => {
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::Text("0".to_string()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Text(text) => {
                    let current: i64 = text
                        .parse()
                        .map_err(|_| "ERR value is not an integer or out of range".to_string())?;
                    let next = current
                        .checked_add(1)
                        .ok_or_else(|| "ERR increment or decrement would overflow".to_string())?;
                    *text = next.to_string();
                    Ok(Reply::Int(next))
                }
                _ => Err(WRONGTYPE.to_string()),
            }
        }
        Command::Expire {
            key,
            seconds,
            only_if_no_expiry,
        } => match entries.get_mut(key) {
            None => Ok(Reply::Int(0)),
            Some(entry) if *only_if_no_expiry && entry.expires_at.is_some() => Ok(Reply::Int(0)),
            Some(entry) => {
                entry.expires_at = Some(now + (*seconds as i64) * 1000);
                Ok(Reply::Int(1))
            }
        },
        Command::PExpire { key, millis } => match entries.get_mut(key) {
            None => Ok(Reply::Int(0)),
            Some(entry) => {
                entry.expires_at = Some(now + *millis as i64);
                Ok(Reply::Int(1))
            }
        },
        Command::ZAdd { key, score, member } => {
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::SortedSet(Vec::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::SortedSet(set) => {
                    let added = match set.iter_mut().find(|(_, m)| m == member) {
                        Some(existing) => {
                            existing.0 = *score;
                            0
                        }
                        None => {
                            set.push((*score, member.clone()));
                            1
                        }
                    };
                    set.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                    Ok(Reply::Int(added))
                }
                _ => Err(WRONGTYPE.to_string()),
            }
        }
        Command::ZRemRangeByScore { key, min, max } => {
            let (removed, now_empty) = match entries.get_mut(key) {
                None => return Ok(Reply::Int(0)),
                Some(Entry {
                    value: Value::SortedSet(set),
                    ..
                }) => {
                    let before = set.len();
                    set.retain(|(score, _)| *score < *min || *score > *max);
                    ((before - set.len()) as i64, set.is_empty())
                }
                Some(_) => return Err(WRONGTYPE.to_string()),
            };
            if now_empty {
                entries.remove(key);
            }
            Ok(Reply::Int(removed))
        }
        Command::ZRange { key } => match entries.get(key) {
            None => Ok(Reply::List(Vec::new())),
            Some(Entry {
                value: Value::SortedSet(set),
                ..
            }) => Ok(Reply::List(set.iter().map(|(_, m)| m.clone()).collect())),
            Some(_) => Err(WRONGTYPE.to_string()),
        },
        Command::HGetAll { key } => match entries.get(key) {
            None => Ok(Reply::Map(HashMap::new())),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(Reply::Map(hash.clone())),
            Some(_) => Err(WRONGTYPE.to_string()),
        },
        Command::HSet { key, field, value } => {
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Hash(hash) => {
                    let added = hash.insert(field.clone(), value.clone()).is_none();
                    Ok(Reply::Int(added as i64))
                }
                _ => Err(WRONGTYPE.to_string()),
            }
        }
        Command::Del { key } => Ok(Reply::Int(entries.remove(key).is_some() as i64)),
        Command::Eval { script, keys } => run_script(entries, script, keys, now),
    }
}

fn run_script(
    entries: &mut HashMap<String, Entry>,
    script: &Script,
    keys: &[String],
    now: i64,
) -> CommandResult {
    if keys.len() != script.key_count() {
        return Err("ERR wrong number of keys for script".to_string());
    }
    let mut call = |command: Command| apply(entries, &command, now);

    let outcome = match script {
        Script::FixedWindow { limit, window_secs } => {
            let key = keys[0].clone();
            let (count, malformed) = stored_int(call(Command::Get { key: key.clone() })?, &key);
            let count = count.unwrap_or(0).max(0);
            let allowed = (count as u64) < *limit;
            if allowed {
                if malformed {
                    call(Command::Set {
                        key: key.clone(),
                        value: "0".to_string(),
                    })?;
                }
                call(Command::Incr { key: key.clone() })?;
                call(Command::Expire {
                    key,
                    seconds: *window_secs,
                    only_if_no_expiry: true,
                })?;
            }
            ScriptOutcome {
                allowed,
                value: count,
                malformed,
            }
        }
        Script::TokenBucket {
            now_ms,
            capacity,
            refill_rate,
            floor,
            ttl_ms,
        } => {
            let (last_key, count_key) = (keys[0].clone(), keys[1].clone());
            let (last, bad_last) =
                stored_int(call(Command::Get { key: last_key.clone() })?, &last_key);
            let (tokens, bad_tokens) =
                stored_int(call(Command::Get { key: count_key.clone() })?, &count_key);
            let (allowed, tokens) = refill(
                tokens.unwrap_or(*capacity as i64),
                last.unwrap_or(*now_ms),
                *now_ms,
                *capacity,
                *refill_rate,
                *floor,
            );

            call(Command::Set {
                key: last_key.clone(),
                value: now_ms.to_string(),
            })?;
            call(Command::Set {
                key: count_key.clone(),
                value: tokens.to_string(),
            })?;
            if let Some(millis) = ttl_ms {
                call(Command::PExpire {
                    key: last_key,
                    millis: *millis,
                })?;
                call(Command::PExpire {
                    key: count_key,
                    millis: *millis,
                })?;
            }
            ScriptOutcome {
                allowed,
                value: tokens,
                malformed: bad_last || bad_tokens,
            }
        }
        Script::LeakyBucket {
            now_ms,
            capacity,
            leak_rate,
            ttl_ms,
        } => {
            let key = keys[0].clone();
            let state = call(Command::HGetAll { key: key.clone() })?.into_map();
            let field = |name: &str| state.get(name).cloned().map_or(Reply::Nil, Reply::Text);
            let (level, bad_level) = stored_int(field(FIELD_LEVEL), &key);
            let (last, bad_last) = stored_int(field(FIELD_LAST_UPDATE), &key);
            let (allowed, level) = leak(
                level.unwrap_or(0),
                last.unwrap_or(*now_ms),
                *now_ms,
                *capacity,
                *leak_rate,
            );

            call(Command::HSet {
                key: key.clone(),
                field: FIELD_LAST_UPDATE.to_string(),
                value: now_ms.to_string(),
            })?;
            call(Command::HSet {
                key: key.clone(),
                field: FIELD_LEVEL.to_string(),
                value: level.to_string(),
            })?;
            call(Command::PExpire { key, millis: *ttl_ms })?;
            ScriptOutcome {
                allowed,
                value: level,
                malformed: bad_level || bad_last,
            }
        }
    };
    Ok(outcome.into_reply())
}

/// A stored integer, or `None` with the malformed flag set if it does not parse.
fn stored_int(reply: Reply, key: &str) -> (Option<i64>, bool) {
    match reply.decode::<i64>(key) {
        Ok(value) => (value, false),
        Err(_) => (None, true),
    }
}

fn command_key(command: &Command) -> Option<&str> {
    let key = match command {
        Command::Get { key }
        | Command::Set { key, .. }
        | Command::Incr { key }
        | Command::Expire { key, .. }
        | Command::PExpire { key, .. }
        | Command::ZAdd { key, .. }
        | Command::ZRemRangeByScore { key, .. }
        | Command::ZRange { key }
        | Command::HGetAll { key }
        | Command::HSet { key, .. }
        | Command::Del { key } => key,
        Command::Eval { .. } => return None,
    };
    Some(key)
}

#[async_trait]
impl Store for MemoryStore {
    async fn exec(&self, batch: &Batch) -> Result<BatchReplies> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().map_err(|_| {
            LimiterError::StoreUnavailable("Failed to acquire memory store lock".into())
        })?;

        let results = batch
            .commands()
            .iter()
            .map(|command| apply(&mut entries, command, now))
            .collect();

        BatchReplies::new(batch, results)
    }

    async fn ping(&self) -> Result<()> {
        self.entries
            .lock()
            .map(|_| ())
            .map_err(|_| LimiterError::StoreUnavailable("Failed to acquire memory store lock".into()))
    }
}

//! Redis-backed store
//!
//! Histories are sorted sets scored by creation time in milliseconds.
//! Members are `"{seq:020}|{entry json}"`, where `seq` comes from the
//! board's insertion counter, so members with equal scores sort (and are
//! evicted) in insertion order.
//!
//! A [`WriteBatch`] is sent as the argument list of one Lua script. Redis
//! runs scripts atomically, so insert, trim and expiry refresh commit as a
//! unit and the evicted members come back in the same reply. Announcements
//! are `PUBLISH`ed from inside the script, so subscribers see one board's
//! events in exactly the order the scripts ran. The insertion counter is
//! given the history's expiry at the end of every script and deleted with
//! an empty history.

use std::collections::HashSet;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, Script};

use super::{BatchOp, BatchOutcome, BoardId, Entry, Store, StoreError, WriteBatch};
use crate::payload::PayloadRef;

/// Default connection URL when `REDIS_URL` is unset
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

// KEYS: entries, authkey, seq
// ARGV: a flat op list, "put" json score | "trim" capacity | "ttl" seconds
//       | "zrem" member | "publish" channel payload
const WRITE_BATCH_SCRIPT: &str = r#"
local entries, authkey, seq = KEYS[1], KEYS[2], KEYS[3]
local evicted, removed = {}, {}
local changed, announced = false, 0
local i = 1
while i <= #ARGV do
  local op = ARGV[i]
  if op == 'put' then
    local n = redis.call('INCR', seq)
    redis.call('ZADD', entries, ARGV[i + 2], string.format('%020d', n) .. '|' .. ARGV[i + 1])
    changed = true
    i = i + 3
  elseif op == 'trim' then
    local stop = -(tonumber(ARGV[i + 1]) + 1)
    local dropped = redis.call('ZRANGE', entries, 0, stop)
    if #dropped > 0 then
      redis.call('ZREMRANGEBYRANK', entries, 0, stop)
      for _, member in ipairs(dropped) do
        table.insert(evicted, member)
      end
    end
    i = i + 2
  elseif op == 'ttl' then
    local secs = tonumber(ARGV[i + 1])
    redis.call('EXPIRE', entries, secs)
    if redis.call('EXISTS', authkey) == 1 then
      redis.call('EXPIRE', authkey, secs)
    end
    i = i + 2
  elseif op == 'zrem' then
    if redis.call('ZREM', entries, ARGV[i + 1]) == 1 then
      table.insert(removed, ARGV[i + 1])
      changed = true
    end
    i = i + 2
  elseif op == 'publish' then
    if changed then
      redis.call('PUBLISH', ARGV[i + 1], ARGV[i + 2])
      announced = 1
    end
    i = i + 3
  else
    return redis.error_reply('unknown batch op: ' .. tostring(op))
  end
end
local len = redis.call('ZCARD', entries)
if len == 0 then
  redis.call('DEL', seq)
else
  local pttl = redis.call('PTTL', entries)
  if pttl > 0 then
    redis.call('PEXPIRE', seq, pttl)
  else
    redis.call('PERSIST', seq)
  end
end
return {len, evicted, removed, announced}
"#;

// KEYS: authkey
// ARGV: has_current, current, has_new, new, ttl seconds
const REPLACE_KEY_SCRIPT: &str = r#"
local stored = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if stored ~= ARGV[2] then
    return 0
  end
elseif stored then
  return 0
end
if ARGV[3] == '1' then
  redis.call('SET', KEYS[1], ARGV[4], 'EX', ARGV[5])
else
  redis.call('DEL', KEYS[1])
end
return 1
"#;

fn unavailable(err: RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn protocol(err: serde_json::Error) -> StoreError {
    StoreError::Protocol(err.to_string())
}

fn flag(set: bool) -> &'static str {
    if set {
        "1"
    } else {
        "0"
    }
}

/// Decode a sorted-set member, skipping the sequence prefix
fn decode_member(member: &str) -> Option<Entry> {
    let json = match member.split_once('|') {
        Some((seq, json)) if seq.bytes().all(|b| b.is_ascii_digit()) => json,
        _ => member,
    };
    match serde_json::from_str(json) {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping malformed history member");
            None
        }
    }
}

fn decode_members(members: &[String]) -> Vec<Entry> {
    members.iter().filter_map(|m| decode_member(m)).collect()
}

/// Store backed by a Redis server shared by all processes
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    write_script: Script,
    replace_key_script: Script,
}

impl RedisStore {
    /// Connect and verify the server answers
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;

        let store = Self {
            conn,
            write_script: Script::new(WRITE_BATCH_SCRIPT),
            replace_key_script: Script::new(REPLACE_KEY_SCRIPT),
        };
        store.ping().await?;

        tracing::info!(url = url, "Connected to Redis store");
        Ok(store)
    }

    /// Connect to `REDIS_URL`, or the local default
    pub async fn from_env() -> Result<Self, StoreError> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        Self::connect(&url).await
    }

    async fn history_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> = conn
            .scan_match(BoardId::entries_pattern())
            .await
            .map_err(unavailable)?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

impl Store for RedisStore {
    async fn execute(&self, board: &BoardId, batch: WriteBatch) -> Result<BatchOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.write_script.prepare_invoke();
        invocation
            .key(board.entries_key())
            .key(board.authkey_key())
            .key(board.seq_key());

        // Members are looked up by id here and removed by exact value in the
        // script, so a member already gone by then is simply not reported.
        let mut members: Option<Vec<String>> = None;

        for op in batch.into_ops() {
            match op {
                BatchOp::Put(entry) => {
                    let json = serde_json::to_string(&entry).map_err(protocol)?;
                    invocation.arg("put").arg(json).arg(entry.score());
                }
                BatchOp::TrimToCapacity(capacity) => {
                    invocation.arg("trim").arg(capacity);
                }
                BatchOp::RefreshTtl(ttl) => {
                    invocation.arg("ttl").arg(ttl.as_secs().max(1));
                }
                BatchOp::Remove(id) => {
                    if members.is_none() {
                        let listed: Vec<String> = conn
                            .zrange(board.entries_key(), 0, -1)
                            .await
                            .map_err(unavailable)?;
                        members = Some(listed);
                    }
                    let member = members
                        .iter()
                        .flatten()
                        .find(|m| decode_member(m).is_some_and(|e| e.id == id));
                    if let Some(member) = member {
                        invocation.arg("zrem").arg(member.as_str());
                    }
                }
                BatchOp::Announce(event) => {
                    let payload = serde_json::to_string(&event).map_err(protocol)?;
                    invocation.arg("publish").arg(board.channel()).arg(payload);
                }
            }
        }

        let (len, evicted, removed, announced): (usize, Vec<String>, Vec<String>, i64) =
            invocation.invoke_async(&mut conn).await.map_err(unavailable)?;

        Ok(BatchOutcome {
            evicted: decode_members(&evicted),
            removed: decode_members(&removed),
            len,
            announced: announced != 0,
        })
    }

    async fn list(&self, board: &BoardId) -> Result<Vec<Entry>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrevrange(board.entries_key(), 0, -1)
            .await
            .map_err(unavailable)?;
        Ok(decode_members(&members))
    }

    async fn get_key(&self, board: &BoardId) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(board.authkey_key()).await.map_err(unavailable)
    }

    async fn replace_key(
        &self,
        board: &BoardId,
        current: Option<&str>,
        new: Option<&str>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let replaced: i64 = self
            .replace_key_script
            .key(board.authkey_key())
            .arg(flag(current.is_some()))
            .arg(current.unwrap_or_default())
            .arg(flag(new.is_some()))
            .arg(new.unwrap_or_default())
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(replaced != 0)
    }

    async fn referenced_payloads(&self) -> Result<HashSet<PayloadRef>, StoreError> {
        let keys = self.history_keys().await?;
        let mut conn = self.conn.clone();
        let mut refs = HashSet::new();

        for key in keys {
            let members: Vec<String> = conn.zrange(&key, 0, -1).await.map_err(unavailable)?;
            refs.extend(
                decode_members(&members)
                    .into_iter()
                    .filter_map(|e| e.payload().cloned()),
            );
        }

        Ok(refs)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    fn can_announce(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::bus::BoardEvent;
    use crate::store::EntryId;

    const TTL: Duration = Duration::from_secs(3600);

    /// Store for the server named by `REDIS_URL`; tests that need one are
    /// skipped when it is unset.
    async fn connect() -> Option<RedisStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        Some(RedisStore::connect(&url).await.expect("REDIS_URL is set but unreachable"))
    }

    fn fresh_board() -> BoardId {
        BoardId::new(format!("test-{}", EntryId::new()))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn text_at(content: &str, secs: i64) -> Entry {
        Entry::text(content).with_created_at(at(secs))
    }

    fn write(entry: Entry, capacity: usize) -> WriteBatch {
        WriteBatch::new()
            .put(entry)
            .trim_to_capacity(capacity)
            .refresh_ttl(TTL)
    }

    fn contents(entries: &[Entry]) -> Vec<&str> {
        entries.iter().filter_map(|e| e.content()).collect()
    }

    #[test]
    fn test_decode_member_strips_sequence() {
        let entry = Entry::text("hello");
        let member = format!("{:020}|{}", 7, serde_json::to_string(&entry).unwrap());

        assert_eq!(decode_member(&member), Some(entry));
    }

    #[test]
    fn test_decode_member_skips_garbage() {
        assert_eq!(decode_member("00000000000000000001|{not json"), None);
    }

    #[test]
    fn test_decode_member_with_pipe_in_content() {
        let entry = Entry::text("a|b|c");
        let member = format!("{:020}|{}", 1, serde_json::to_string(&entry).unwrap());

        assert_eq!(decode_member(&member), Some(entry));
    }

    #[tokio::test]
    async fn test_script_trims_to_capacity() {
        let Some(store) = connect().await else { return };
        let board = fresh_board();

        for (i, name) in ["A", "B", "C"].iter().enumerate() {
            let outcome = store.execute(&board, write(text_at(name, i as i64), 3)).await.unwrap();
            assert!(outcome.evicted.is_empty());
        }

        let outcome = store.execute(&board, write(text_at("D", 3), 3)).await.unwrap();
        assert_eq!(outcome.len, 3);
        assert_eq!(contents(&outcome.evicted), vec!["A"]);
        assert_eq!(contents(&store.list(&board).await.unwrap()), vec!["D", "C", "B"]);
    }

    #[tokio::test]
    async fn test_script_equal_timestamps_evicted_in_insertion_order() {
        let Some(store) = connect().await else { return };
        let board = fresh_board();

        for name in ["first", "second", "third", "fourth"] {
            store.execute(&board, write(text_at(name, 5), 10)).await.unwrap();
        }

        let evicted = store.trim_to_capacity(&board, 2).await.unwrap();
        assert_eq!(contents(&evicted), vec!["first", "second"]);
        assert_eq!(contents(&store.list(&board).await.unwrap()), vec!["fourth", "third"]);
    }

    #[tokio::test]
    async fn test_script_refreshes_every_sub_record() {
        let Some(store) = connect().await else { return };
        let board = fresh_board();
        let mut conn = store.conn.clone();

        assert!(store.replace_key(&board, None, Some("k"), Duration::from_secs(7200)).await.unwrap());
        store.execute(&board, write(Entry::text("x"), 20)).await.unwrap();

        for key in [board.entries_key(), board.seq_key(), board.authkey_key()] {
            let ttl: i64 = conn.ttl(&key).await.unwrap();
            assert!(ttl > 0 && ttl <= TTL.as_secs() as i64, "{key} has ttl {ttl}");
        }
    }

    #[tokio::test]
    async fn test_sequence_key_goes_with_history() {
        let Some(store) = connect().await else { return };
        let board = fresh_board();
        let mut conn = store.conn.clone();
        let entry = Entry::text("only");
        let id = entry.id;

        store.execute(&board, write(entry.clone(), 20)).await.unwrap();
        assert_eq!(store.remove(&board, id).await.unwrap(), Some(entry));
        assert_eq!(store.remove(&board, id).await.unwrap(), None);

        let exists: bool = conn.exists(board.seq_key()).await.unwrap();
        assert!(!exists);
        assert!(!store.board_exists(&board).await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_key_is_compare_and_set() {
        let Some(store) = connect().await else { return };
        let board = fresh_board();

        assert!(store.replace_key(&board, None, Some("k1"), TTL).await.unwrap());
        assert!(!store.replace_key(&board, None, Some("k2"), TTL).await.unwrap());
        assert!(store.replace_key(&board, Some("k1"), Some("k3"), TTL).await.unwrap());
        assert!(!store.replace_key(&board, Some("k1"), None, TTL).await.unwrap());
        assert_eq!(store.get_key(&board).await.unwrap().as_deref(), Some("k3"));

        assert!(store.replace_key(&board, Some("k3"), None, TTL).await.unwrap());
        assert!(store.get_key(&board).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_announce_only_when_history_changed() {
        let Some(store) = connect().await else { return };
        let board = fresh_board();
        let entry = Entry::text("x");
        let id = entry.id;

        let added = BoardEvent::entry_added(board.clone(), entry.view());
        let outcome = store
            .execute(&board, write(entry, 20).announce(added))
            .await
            .unwrap();
        assert!(outcome.announced);

        let removed = BoardEvent::entry_removed(board.clone(), id);
        let first = store
            .execute(&board, WriteBatch::new().remove(id).announce(removed.clone()))
            .await
            .unwrap();
        assert_eq!(first.removed.len(), 1);
        assert!(first.announced);

        let second = store
            .execute(&board, WriteBatch::new().remove(id).announce(removed))
            .await
            .unwrap();
        assert!(second.removed.is_empty());
        assert!(!second.announced);
    }
}

//! In-process coordination backend.
//!
//! Implements the full [`CoordStore`] contract over process-local state:
//! the same list, TTL-key, and windowed-admission semantics the Redis
//! backend provides, minus the network. Used by single-process deployments
//! and by the test suite, which exercises the whole pipeline against it.

use crate::coord::store::{CoordOp, CoordStore, TakeHandle};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

#[derive(Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<String>>,
    keys: HashMap<String, ExpiringValue>,
    windows: HashMap<String, Vec<(u64, String)>>,
}

struct ExpiringValue {
    value: String,
    deadline: Option<Instant>,
}

impl MemoryState {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.keys.retain(|_, entry| match entry.deadline {
            Some(deadline) => deadline > now,
            None => true,
        });
    }

    fn apply(&mut self, op: &CoordOp) {
        match op {
            CoordOp::PushTail { list, value } => {
                self.lists
                    .entry(list.clone())
                    .or_default()
                    .push_back(value.clone());
            }
            CoordOp::ListRemove { list, value } => {
                if let Some(entries) = self.lists.get_mut(list) {
                    if let Some(position) = entries.iter().position(|entry| entry == value) {
                        entries.remove(position);
                    }
                }
            }
            CoordOp::KeyDelete { key } => {
                self.keys.remove(key);
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryCoord {
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
}

impl MemoryCoord {
    pub fn new() -> Self {
        Self::default()
    }
}

fn try_move(state: &Mutex<MemoryState>, src: &str, dst: &str) -> Option<String> {
    let mut guard = state.lock().expect("coordination state poisoned");
    let value = guard.lists.get_mut(src)?.pop_front()?;
    guard
        .lists
        .entry(dst.to_owned())
        .or_default()
        .push_back(value.clone());
    Some(value)
}

async fn blocking_take(
    state: &Mutex<MemoryState>,
    notify: &Notify,
    src: &str,
    dst: &str,
    timeout: Duration,
) -> Option<String> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = try_move(state, src, dst) {
            return Some(value);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        // notify_one leaves a stored permit when no waiter is parked, so a
        // push landing between the check above and this await is not lost.
        if tokio::time::timeout(remaining, notify.notified())
            .await
            .is_err()
        {
            return None;
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

struct MemoryTakeHandle {
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl TakeHandle for MemoryTakeHandle {
    async fn take(&mut self, src: &str, dst: &str, timeout: Duration) -> Result<Option<String>> {
        Ok(blocking_take(&self.state, &self.notify, src, dst, timeout).await)
    }
}

#[async_trait]
impl CoordStore for MemoryCoord {
    async fn push_tail(&self, list: &str, values: &[String]) -> Result<()> {
        let mut guard = self.state.lock().expect("coordination state poisoned");
        let entries = guard.lists.entry(list.to_owned()).or_default();
        for value in values {
            entries.push_back(value.clone());
        }
        drop(guard);
        for _ in values {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn take_handle(&self) -> Result<Box<dyn TakeHandle>> {
        Ok(Box::new(MemoryTakeHandle {
            state: self.state.clone(),
            notify: self.notify.clone(),
        }))
    }

    async fn multi(&self, ops: &[CoordOp]) -> Result<()> {
        let mut guard = self.state.lock().expect("coordination state poisoned");
        for op in ops {
            guard.apply(op);
        }
        drop(guard);
        for op in ops {
            if matches!(op, CoordOp::PushTail { .. }) {
                self.notify.notify_one();
            }
        }
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut guard = self.state.lock().expect("coordination state poisoned");
        guard.keys.insert(
            key.to_owned(),
            ExpiringValue {
                value: value.to_owned(),
                deadline: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn refresh_ttl(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut guard = self.state.lock().expect("coordination state poisoned");
        guard.purge_expired();
        match guard.keys.get_mut(key) {
            Some(entry) => {
                entry.deadline = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut guard = self.state.lock().expect("coordination state poisoned");
        guard.purge_expired();
        Ok(guard.keys.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.state.lock().expect("coordination state poisoned");
        guard.keys.remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut guard = self.state.lock().expect("coordination state poisoned");
        guard.purge_expired();
        Ok(guard.keys.get(key).map(|entry| entry.value.clone()))
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>> {
        let guard = self.state.lock().expect("coordination state poisoned");
        Ok(guard
            .lists
            .get(list)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_len(&self, list: &str) -> Result<usize> {
        let guard = self.state.lock().expect("coordination state poisoned");
        Ok(guard.lists.get(list).map(VecDeque::len).unwrap_or(0))
    }

    async fn move_if_member(&self, src: &str, dst: &str, value: &str) -> Result<bool> {
        let mut guard = self.state.lock().expect("coordination state poisoned");
        let removed = match guard.lists.get_mut(src) {
            Some(entries) => match entries.iter().position(|entry| entry == value) {
                Some(position) => {
                    entries.remove(position);
                    true
                }
                None => false,
            },
            None => false,
        };
        if removed {
            guard
                .lists
                .entry(dst.to_owned())
                .or_default()
                .push_back(value.to_owned());
        }
        drop(guard);
        if removed {
            self.notify.notify_one();
        }
        Ok(removed)
    }

    async fn set_max(&self, key: &str, candidate: u64) -> Result<u64> {
        let mut guard = self.state.lock().expect("coordination state poisoned");
        let current = guard
            .keys
            .get(key)
            .and_then(|entry| entry.value.parse::<u64>().ok());
        let next = match current {
            Some(existing) if existing >= candidate => existing,
            _ => {
                guard.keys.insert(
                    key.to_owned(),
                    ExpiringValue {
                        value: candidate.to_string(),
                        deadline: None,
                    },
                );
                candidate
            }
        };
        Ok(next)
    }

    async fn window_admit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        member: &str,
    ) -> Result<bool> {
        let now = epoch_millis();
        let window_ms = window.as_millis() as u64;
        let mut guard = self.state.lock().expect("coordination state poisoned");
        let entries = guard.windows.entry(key.to_owned()).or_default();
        entries.retain(|(stamp, _)| *stamp + window_ms > now);
        if (entries.len() as u64) < limit {
            entries.push((now, member.to_owned()));
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn values(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| (*item).to_owned()).collect()
    }

    #[tokio::test]
    async fn take_moves_head_to_tail_in_order() {
        let coord = MemoryCoord::new();
        coord.push_tail("src", &values(&["a", "b"])).await.unwrap();

        let mut handle = coord.take_handle().await.unwrap();
        let first = handle
            .take("src", "dst", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(coord.list_range("dst").await.unwrap(), values(&["a"]));
        assert_eq!(coord.list_len("src").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn take_times_out_on_empty_list() {
        let coord = MemoryCoord::new();
        let mut handle = coord.take_handle().await.unwrap();
        let taken = handle
            .take("src", "dst", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(taken.is_none());
    }

    #[tokio::test]
    async fn blocked_take_wakes_on_push() {
        let coord = MemoryCoord::new();
        let pusher = coord.clone();
        let mut handle = coord.take_handle().await.unwrap();

        let waiter = tokio::spawn(async move {
            handle
                .take("src", "dst", Duration::from_secs(5))
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pusher.push_tail("src", &values(&["x"])).await.unwrap();

        let taken = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("take should wake promptly")
            .unwrap();
        assert_eq!(taken.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn keys_expire_after_ttl() {
        let coord = MemoryCoord::new();
        coord
            .set_with_ttl("lease", "1", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(coord.exists("lease").await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!coord.exists("lease").await.unwrap());
        assert!(!coord
            .refresh_ttl("lease", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn refresh_extends_the_deadline() {
        let coord = MemoryCoord::new();
        coord
            .set_with_ttl("lease", "1", Duration::from_millis(40))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coord
            .refresh_ttl("lease", Duration::from_millis(200))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(coord.exists("lease").await.unwrap());
    }

    #[tokio::test]
    async fn multi_applies_all_operations() {
        let coord = MemoryCoord::new();
        coord.push_tail("processing", &values(&["5-9"])).await.unwrap();
        coord
            .set_with_ttl("lock", "1", Duration::from_secs(60))
            .await
            .unwrap();

        coord
            .multi(&[
                CoordOp::ListRemove {
                    list: "processing".into(),
                    value: "5-9".into(),
                },
                CoordOp::KeyDelete { key: "lock".into() },
                CoordOp::PushTail {
                    list: "work".into(),
                    value: "5-9".into(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(coord.list_len("processing").await.unwrap(), 0);
        assert!(!coord.exists("lock").await.unwrap());
        assert_eq!(coord.list_range("work").await.unwrap(), values(&["5-9"]));
    }

    #[tokio::test]
    async fn move_if_member_only_moves_present_values() {
        let coord = MemoryCoord::new();
        coord.push_tail("src", &values(&["a"])).await.unwrap();

        assert!(coord.move_if_member("src", "dst", "a").await.unwrap());
        assert!(!coord.move_if_member("src", "dst", "a").await.unwrap());
        assert_eq!(coord.list_range("dst").await.unwrap(), values(&["a"]));
    }

    #[tokio::test]
    async fn set_max_is_monotonic() {
        let coord = MemoryCoord::new();
        assert_eq!(coord.set_max("watermark", 10).await.unwrap(), 10);
        assert_eq!(coord.set_max("watermark", 5).await.unwrap(), 10);
        assert_eq!(coord.set_max("watermark", 20).await.unwrap(), 20);
        assert_eq!(coord.get("watermark").await.unwrap().as_deref(), Some("20"));
    }

    #[tokio::test]
    async fn window_admission_enforces_the_limit() {
        let coord = MemoryCoord::new();
        let window = Duration::from_millis(80);
        for index in 0..3 {
            let member = format!("call-{index}");
            assert!(coord
                .window_admit("budget", 3, window, &member)
                .await
                .unwrap());
        }
        assert!(!coord
            .window_admit("budget", 3, window, "call-overflow")
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coord
            .window_admit("budget", 3, window, "call-after-window")
            .await
            .unwrap());
    }
}

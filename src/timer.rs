use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Armed deadlines keyed by `K`, each carrying a `V` for its fire action.
///
/// Every arm gets a new generation. A fired timer only acts if
/// [`TimerTable::fire`] still finds its own generation in the table, so a
/// timer that was cancelled or re-armed while its task was waking up is a
/// no-op. Callers hold the same lock for `cancel` and `fire`.
#[derive(Debug)]
pub struct TimerTable<K, V> {
    armed: HashMap<K, Armed<V>>,
    next_generation: u64,
    parent: CancellationToken,
}

#[derive(Debug)]
struct Armed<V> {
    generation: u64,
    token: CancellationToken,
    value: V,
}

#[derive(Debug, Clone)]
pub struct TimerHandle {
    pub generation: u64,
    pub token: CancellationToken,
}

impl<K: Eq + Hash, V> TimerTable<K, V> {
    /// Timers armed here are cancelled together with `parent`.
    pub fn new(parent: CancellationToken) -> TimerTable<K, V> {
        TimerTable { armed: HashMap::new(), next_generation: 0, parent }
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.armed.contains_key(key)
    }

    /// Arms a timer for `key`, replacing (and cancelling) any previous one.
    pub fn arm(&mut self, key: K, value: V) -> TimerHandle {
        self.next_generation += 1;
        let handle = TimerHandle {
            generation: self.next_generation,
            token: self.parent.child_token(),
        };
        let armed = Armed { generation: handle.generation, token: handle.token.clone(), value };
        if let Some(previous) = self.armed.insert(key, armed) {
            previous.token.cancel();
        }
        handle
    }

    pub fn cancel(&mut self, key: &K) -> Option<V> {
        let armed = self.armed.remove(key)?;
        armed.token.cancel();
        Some(armed.value)
    }

    /// Claims the timer for its fire action. `None` if it was cancelled or
    /// superseded in the meantime.
    pub fn fire(&mut self, key: &K, generation: u64) -> Option<V> {
        match self.armed.get(key) {
            Some(armed) if armed.generation == generation && !armed.token.is_cancelled() => {
                self.armed.remove(key).map(|armed| armed.value)
            }
            _ => None,
        }
    }
}

/// Runs `on_fire` after `timeout` unless `handle` is cancelled first.
pub fn spawn_timer<F>(handle: TimerHandle, timeout: Duration, on_fire: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = handle.token.cancelled() => {}
            _ = tokio::time::sleep(timeout) => on_fire(),
        }
    })
}

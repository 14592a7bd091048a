//! Per-client anti-replay windows and the bounded table that holds them.
//!
//! A [`ClientWindow`] remembers which connection identifiers a single client
//! has already used, and a [`ClientTable`] decides which clients may hold a
//! window at all. Both are consulted only by the server side of the
//! `auth_simple` stage.
use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, trace};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::specification::{
    CLIENT_ACTIVE_MILLIS, TABLE_MAX_ACTIVE, TABLE_MAX_ENTRIES, WINDOW_MAX_AHEAD, WINDOW_MAX_SPAN,
};

/// Returns the current Unix epoch timestamp in milliseconds.
pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The sliding admission window of a single client.
///
/// The window tracks the range `[front, back)` of connection identifiers.
/// Identifiers below `front` are resolved and always rejected, identifiers
/// inside the range are admitted at most once, and identifiers too far ahead
/// of `front` are rejected outright.
///
/// ```text
///        resolved        |<---- at most 0x1000 ---->|
///   ---------------------+--------------------------+---------------
///                      front                       back
///                        |<------------- at most 0x4000 ahead ---->|
/// ```
#[derive(Clone, Debug)]
pub struct ClientWindow {
    front: u64,
    back: u64,
    admitted: HashSet<u64>,
    enabled: bool,
    last_seen: u64,
}

impl ClientWindow {
    /// Creates an empty window starting at `begin_id`.
    pub fn new(begin_id: u32) -> Self {
        Self::new_at(begin_id, current_timestamp())
    }

    /// Creates an empty window starting at `begin_id`, last seen at `now`
    /// (Unix milliseconds).
    pub fn new_at(begin_id: u32, now: u64) -> Self {
        Self {
            front: u64::from(begin_id),
            back: u64::from(begin_id),
            admitted: HashSet::new(),
            enabled: true,
            last_seen: now,
        }
    }

    /// The lowest connection identifier that is not resolved yet.
    pub fn front(&self) -> u64 {
        self.front
    }

    /// One past the highest connection identifier ever admitted.
    pub fn back(&self) -> u64 {
        self.back
    }

    /// Returns `false` if the window was disabled by eviction.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns `true` if the client was seen less than 180 seconds ago.
    pub fn is_active(&self) -> bool {
        self.is_active_at(current_timestamp())
    }

    /// Like [`is_active`](Self::is_active), evaluated at `now` (Unix milliseconds).
    pub fn is_active_at(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen) < CLIENT_ACTIVE_MILLIS
    }

    pub(crate) fn touch(&mut self, now: u64) {
        self.last_seen = now;
    }

    pub(crate) fn disable(&mut self) {
        self.enabled = false;
    }

    pub(crate) fn re_enable(&mut self, connection_id: u32, now: u64) {
        self.enabled = true;
        self.reset(connection_id);
        self.last_seen = now;
    }

    fn reset(&mut self, connection_id: u32) {
        self.admitted.clear();
        self.front = u64::from(connection_id);
        self.back = u64::from(connection_id);
    }

    /// Tries to admit `connection_id`. Returns `true` if it was never seen
    /// before and lies inside the window.
    pub fn insert(&mut self, connection_id: u32) -> bool {
        self.insert_at(connection_id, current_timestamp())
    }

    /// Like [`insert`](Self::insert), evaluated at `now` (Unix milliseconds).
    pub fn insert_at(&mut self, connection_id: u32, now: u64) -> bool {
        let was_idle = !self.is_active_at(now);
        self.touch(now);
        if !self.enabled {
            return false;
        }
        let id = u64::from(connection_id);
        if id < self.front {
            return false;
        }
        if was_idle {
            // Prior admissions are forgotten across a long idle gap.
            trace!(target: "verifywire", "window idle, resync at {:#010x}", connection_id);
            self.reset(connection_id);
        }
        if id > self.front + WINDOW_MAX_AHEAD {
            return false;
        }
        if !self.admitted.insert(id) {
            return false;
        }
        if id >= self.back {
            self.back = id + 1;
        }
        while self.admitted.remove(&self.front) || self.front + WINDOW_MAX_SPAN < self.back {
            self.front += 1;
        }
        true
    }
}

/// A bounded, thread-safe collection of [`ClientWindow`]s keyed by client
/// identifier.
///
/// At most 16 clients may be active (seen within the last 180 seconds) at
/// once, and at most 256 windows are kept in total. When the table is full an
/// inactive client chosen at random is evicted to make room.
#[derive(Debug)]
pub struct ClientTable(Mutex<Inner>);

#[derive(Debug)]
struct Inner {
    clients: HashMap<u32, ClientWindow>,
    rng: StdRng,
}

impl Default for ClientTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientTable {
    /// Creates an empty table whose eviction order is seeded from the OS.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Creates an empty table with a deterministic eviction order.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self::with_rng(StdRng::from_seed(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        ClientTable(Mutex::new(Inner {
            clients: HashMap::with_capacity(TABLE_MAX_ACTIVE),
            rng,
        }))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits `connection_id` for `client_id`, creating or recycling a window
    /// if the client is not known yet.
    pub fn insert(&self, client_id: u32, connection_id: u32) -> bool {
        self.insert_at(client_id, connection_id, current_timestamp())
    }

    /// Like [`insert`](Self::insert), evaluated at `now` (Unix milliseconds).
    pub fn insert_at(&self, client_id: u32, connection_id: u32, now: u64) -> bool {
        let mut inner = self.lock();

        if let Some(window) = inner.clients.get_mut(&client_id) {
            if window.is_enabled() {
                return window.insert_at(connection_id, now);
            }
        }

        let active = inner.clients.values().filter(|w| w.is_active_at(now)).count();
        if active >= TABLE_MAX_ACTIVE {
            debug!(target: "verifywire", "too many active clients, refusing {:#010x}", client_id);
            return false;
        }

        if inner.clients.len() < TABLE_MAX_ACTIVE {
            return inner.admit(client_id, connection_id, now);
        }

        let Inner { clients, rng } = &mut *inner;
        let mut ids: Vec<u32> = clients.keys().copied().collect();
        ids.shuffle(rng);
        let victim = ids.into_iter().find(|id| {
            clients
                .get(id)
                .is_some_and(|w| w.is_enabled() && !w.is_active_at(now))
        });
        let Some(victim) = victim else {
            debug!(target: "verifywire", "no idle client to evict for {:#010x}", client_id);
            return false;
        };

        if clients.len() >= TABLE_MAX_ENTRIES {
            trace!(target: "verifywire", "removing idle client {:#010x}", victim);
            clients.remove(&victim);
        } else if let Some(window) = clients.get_mut(&victim) {
            trace!(target: "verifywire", "disabling idle client {:#010x}", victim);
            window.disable();
        }
        inner.admit(client_id, connection_id, now)
    }

    /// Refreshes the activity timestamp of `client_id`, if it is known.
    pub fn update(&self, client_id: u32, connection_id: u32) {
        self.update_at(client_id, connection_id, current_timestamp())
    }

    /// Like [`update`](Self::update), evaluated at `now` (Unix milliseconds).
    pub fn update_at(&self, client_id: u32, _connection_id: u32, now: u64) {
        if let Some(window) = self.lock().clients.get_mut(&client_id) {
            window.touch(now);
        }
    }

    /// The number of windows currently held, enabled or not.
    pub fn len(&self) -> usize {
        self.lock().clients.len()
    }

    /// Returns `true` if no client was ever admitted.
    pub fn is_empty(&self) -> bool {
        self.lock().clients.is_empty()
    }

    /// The number of clients seen within the last 180 seconds.
    pub fn active_clients(&self) -> usize {
        self.active_clients_at(current_timestamp())
    }

    /// Like [`active_clients`](Self::active_clients), evaluated at `now`.
    pub fn active_clients_at(&self, now: u64) -> usize {
        self.lock()
            .clients
            .values()
            .filter(|w| w.is_active_at(now))
            .count()
    }

    /// Returns a copy of the window of `client_id`, if any.
    pub fn window(&self, client_id: u32) -> Option<ClientWindow> {
        self.lock().clients.get(&client_id).cloned()
    }
}

impl Inner {
    fn admit(&mut self, client_id: u32, connection_id: u32, now: u64) -> bool {
        self.clients
            .entry(client_id)
            .and_modify(|w| w.re_enable(connection_id, now))
            .or_insert_with(|| ClientWindow::new_at(connection_id, now))
            .insert_at(connection_id, now)
    }
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use super::*;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn test_increasing_ids_always_admitted() {
        let mut window = ClientWindow::new_at(0, T0);
        for id in 0..0x3000u32 {
            assert!(window.insert_at(id, T0), "id {} refused", id);
            assert_eq!(window.front(), u64::from(id) + 1);
        }
    }

    #[test]
    fn test_replay_rejected() {
        let mut window = ClientWindow::new_at(100, T0);
        let ids = [100u32, 104, 101, 110, 103];
        for id in ids {
            assert!(window.insert_at(id, T0));
        }
        for id in ids {
            assert!(!window.insert_at(id, T0), "replayed id {} admitted", id);
        }
        // 102 was never used and still lies inside the window.
        assert!(window.insert_at(102, T0));
        assert_eq!(window.front(), 105);
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut rng = StdRng::from_seed([0u8; 32]);
        let mut ids: Vec<u32> = (0..1024).collect();
        ids.shuffle(&mut rng);
        let mut window = ClientWindow::new_at(0, T0);
        for id in ids {
            assert!(window.insert_at(id, T0));
        }
        assert_eq!(window.front(), 1024);
        assert_eq!(window.back(), 1024);
    }

    #[test]
    fn test_too_far_ahead_rejected() {
        let mut window = ClientWindow::new_at(0, T0);
        assert!(!window.insert_at(0x4001, T0));
        assert!(window.insert_at(0x4000, T0));
        // The window was force-advanced to keep its span bounded.
        assert_eq!(window.back() - window.front(), WINDOW_MAX_SPAN);
    }

    #[test]
    fn test_stale_id_rejected() {
        let mut window = ClientWindow::new_at(10, T0);
        assert!(window.insert_at(10, T0));
        assert!(!window.insert_at(9, T0));
    }

    #[test]
    fn test_sparse_ids_keep_span_bounded() {
        let mut window = ClientWindow::new_at(0, T0);
        for id in (0..0x2000u32).step_by(2) {
            assert!(window.insert_at(id, T0));
            assert!(window.front() <= window.back());
            assert!(window.back() - window.front() <= WINDOW_MAX_SPAN);
            assert!(window.admitted.iter().all(|&a| a >= window.front() && a < window.back()));
        }
    }

    #[test]
    fn test_random_ids_keep_invariants() {
        let mut rng = StdRng::from_seed([7u8; 32]);
        let mut window = ClientWindow::new_at(0, T0);
        for _ in 0..20000 {
            let id = rng.random_range(0..0x8000u32);
            window.insert_at(id, T0);
            assert!(window.front() <= window.back());
            assert!(window.back() - window.front() <= WINDOW_MAX_SPAN);
            assert!(window.admitted.len() as u64 <= WINDOW_MAX_SPAN + 1);
        }
    }

    #[test]
    fn test_idle_window_resyncs() {
        let mut window = ClientWindow::new_at(0, T0);
        assert!(window.insert_at(5, T0));
        assert!(!window.insert_at(5, T0 + 10));
        // After a long idle gap prior admissions are forgotten.
        let later = T0 + 10 + CLIENT_ACTIVE_MILLIS;
        assert!(window.insert_at(5, later));
        assert_eq!(window.front(), 6);
    }

    #[test]
    fn test_activity_has_sub_second_precision() {
        let window = ClientWindow::new_at(0, T0);
        assert!(window.is_active_at(T0 + CLIENT_ACTIVE_MILLIS - 900));
        assert!(window.is_active_at(T0 + CLIENT_ACTIVE_MILLIS - 1));
        assert!(!window.is_active_at(T0 + CLIENT_ACTIVE_MILLIS));

        // Seen 179.1 s ago: the window is still active and keeps its history.
        let mut window = ClientWindow::new_at(0, T0);
        assert!(window.insert_at(3, T0));
        assert!(!window.insert_at(3, T0 + CLIENT_ACTIVE_MILLIS - 900));
    }

    #[test]
    fn test_disabled_window_refuses() {
        let mut window = ClientWindow::new_at(0, T0);
        window.disable();
        assert!(!window.insert_at(0, T0));
        window.re_enable(50, T0);
        assert!(window.insert_at(50, T0));
    }

    #[test]
    fn test_table_admits_at_most_16_active_clients() {
        let table = ClientTable::with_seed([0u8; 32]);
        for client_id in 0..16u32 {
            assert!(table.insert_at(client_id, 1, T0));
        }
        assert!(!table.insert_at(16, 1, T0));
        assert_eq!(table.len(), 16);
        assert_eq!(table.active_clients_at(T0), 16);

        // Known clients are not affected by the limit.
        assert!(table.insert_at(3, 2, T0));
        assert!(!table.insert_at(3, 2, T0));
    }

    #[test]
    fn test_table_evicts_idle_client() {
        let table = ClientTable::with_seed([1u8; 32]);
        for client_id in 0..16u32 {
            assert!(table.insert_at(client_id, 1, T0));
        }
        let later = T0 + CLIENT_ACTIVE_MILLIS + 20;
        for client_id in 1..16u32 {
            table.update_at(client_id, 1, later);
        }
        assert_eq!(table.active_clients_at(later), 15);

        assert!(table.insert_at(16, 1, later));
        assert_eq!(table.len(), 17);
        assert!(!table.window(0).unwrap().is_enabled());

        // The evicted client cannot come back while 16 others are active.
        assert!(!table.insert_at(0, 2, later));
    }

    #[test]
    fn test_table_refuses_without_idle_victim() {
        let table = ClientTable::with_seed([2u8; 32]);
        for client_id in 0..16u32 {
            assert!(table.insert_at(client_id, 1, T0));
        }
        let later = T0 + CLIENT_ACTIVE_MILLIS + 1;
        // One client is idle, but its window is disabled and cannot be evicted.
        for client_id in 0..16u32 {
            table.lock().clients.get_mut(&client_id).unwrap().disable();
        }
        for client_id in 0..15u32 {
            table.update_at(client_id, 1, later);
        }
        assert!(!table.insert_at(99, 1, later));
    }

    #[test]
    fn test_table_removes_when_full() {
        let table = ClientTable::with_seed([3u8; 32]);
        let mut now = T0;
        let mut client_id = 0u32;
        // Each round, 16 clients are admitted then all go idle.
        while table.len() < TABLE_MAX_ENTRIES {
            assert!(table.insert_at(client_id, 0, now));
            client_id += 1;
            now += CLIENT_ACTIVE_MILLIS;
        }
        assert_eq!(table.len(), TABLE_MAX_ENTRIES);
        assert!(table.insert_at(client_id, 0, now));
        assert_eq!(table.len(), TABLE_MAX_ENTRIES);
    }

    #[test]
    fn test_table_re_enables_disabled_client() {
        let table = ClientTable::with_seed([4u8; 32]);
        for client_id in 0..16u32 {
            assert!(table.insert_at(client_id, 1, T0));
        }
        let later = T0 + CLIENT_ACTIVE_MILLIS;
        assert!(table.insert_at(100, 1, later));
        let evicted = (0..16u32)
            .find(|id| !table.window(*id).unwrap().is_enabled())
            .unwrap();

        // Nobody else is active any more, the evicted client is re-enabled
        // at its new connection identifier.
        let much_later = later + CLIENT_ACTIVE_MILLIS;
        assert!(table.insert_at(evicted, 500, much_later));
        let window = table.window(evicted).unwrap();
        assert!(window.is_enabled());
        assert_eq!(window.front(), 501);
    }

    #[test]
    fn test_update_unknown_client_is_noop() {
        let table = ClientTable::with_seed([5u8; 32]);
        table.update_at(42, 0, T0);
        assert!(table.is_empty());
    }
}

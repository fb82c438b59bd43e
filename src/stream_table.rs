//! Stream id allocation and the id -> exchange registry.
//!
//! Each side of a connection allocates ids of its own parity (client odd,
//! server even) so both can initiate exchanges without coordination. Ids
//! grow by two, wrap at the configured maximum, and skip ids that are open
//! or were released less than the reuse grace period ago.
//!
//! Every registration gets a fresh generation number. Handles that outlive
//! their exchange address it by [`StreamKey`], so they can never touch a
//! later exchange that reuses the same id.
//!
//! One `parking_lot::Mutex` guards the whole table. It is never held across
//! an `.await`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{RelayError, Result};
use crate::exchange::{Exchange, ExchangeInfo};
use crate::protocol::MAX_STREAM_ID;

/// Default time a released id stays unavailable.
pub const DEFAULT_REUSE_GRACE_PERIOD: Duration = Duration::ZERO;

/// Which end of the connection allocates ids here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Allocates odd ids.
    Client,
    /// Allocates even ids.
    Server,
}

impl Side {
    /// First id this side allocates.
    pub fn first_id(self) -> u32 {
        match self {
            Side::Client => 1,
            Side::Server => 2,
        }
    }

    /// Whether `id` belongs to this side's id space.
    pub fn owns(self, id: u32) -> bool {
        id != 0 && id % 2 == self.first_id() % 2
    }
}

/// A registered exchange: its stream id plus the registration it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    /// Stream id on the wire.
    pub id: u32,
    /// Distinguishes successive exchanges on the same id.
    pub generation: u64,
}

struct Inner {
    next_id: u32,
    next_generation: u64,
    open: HashMap<u32, Exchange>,
    /// Open exchanges with ids from our own space.
    local_open: usize,
    quarantine: VecDeque<(u32, Instant)>,
    quarantined: HashSet<u32>,
}

/// Registry of open exchanges for one connection.
pub struct StreamTable {
    side: Side,
    max_stream_id: u32,
    grace_period: Duration,
    inner: Mutex<Inner>,
}

impl StreamTable {
    /// Create a table with the default limits.
    pub fn new(side: Side) -> Self {
        Self::with_limits(side, MAX_STREAM_ID, DEFAULT_REUSE_GRACE_PERIOD)
    }

    /// Create a table with a custom id ceiling and reuse grace period.
    pub fn with_limits(side: Side, max_stream_id: u32, grace_period: Duration) -> Self {
        Self {
            side,
            max_stream_id: max_stream_id.clamp(2, MAX_STREAM_ID),
            grace_period,
            inner: Mutex::new(Inner {
                next_id: side.first_id(),
                next_generation: 1,
                open: HashMap::new(),
                local_open: 0,
                quarantine: VecDeque::new(),
                quarantined: HashSet::new(),
            }),
        }
    }

    /// Side this table allocates for.
    pub fn side(&self) -> Side {
        self.side
    }

    fn capacity(&self) -> usize {
        let first = self.side.first_id();
        ((self.max_stream_id - first) / 2 + 1) as usize
    }

    fn purge_quarantine(inner: &mut Inner) {
        let now = Instant::now();
        while let Some(&(id, until)) = inner.quarantine.front() {
            if until > now {
                break;
            }
            inner.quarantine.pop_front();
            inner.quarantined.remove(&id);
        }
    }

    fn allocate_locked(&self, inner: &mut Inner) -> Result<u32> {
        Self::purge_quarantine(inner);
        if inner.local_open + inner.quarantined.len() >= self.capacity() {
            return Err(RelayError::Exhausted);
        }

        loop {
            let id = inner.next_id;
            inner.next_id = match id.checked_add(2) {
                Some(next) if next <= self.max_stream_id => next,
                _ => self.side.first_id(),
            };
            if !inner.open.contains_key(&id) && !inner.quarantined.contains(&id) {
                return Ok(id);
            }
        }
    }

    /// Allocate a free id without registering anything under it.
    pub fn allocate(&self) -> Result<u32> {
        let mut inner = self.inner.lock();
        self.allocate_locked(&mut inner)
    }

    fn insert_locked(&self, inner: &mut Inner, id: u32, mut exchange: Exchange) -> StreamKey {
        let generation = inner.next_generation;
        inner.next_generation += 1;
        exchange.set_generation(generation);
        inner.open.insert(id, exchange);
        if self.side.owns(id) {
            inner.local_open += 1;
        }
        StreamKey { id, generation }
    }

    /// Allocate an id and register `exchange` under it in one step.
    pub fn allocate_and_register(&self, exchange: Exchange) -> Result<StreamKey> {
        let mut inner = self.inner.lock();
        let id = self.allocate_locked(&mut inner)?;
        Ok(self.insert_locked(&mut inner, id, exchange))
    }

    /// Register an exchange under an id chosen elsewhere (usually by the peer).
    ///
    /// An id that is already open is a protocol error; the existing exchange
    /// is left untouched.
    pub fn register(&self, id: u32, exchange: Exchange) -> Result<StreamKey> {
        let mut inner = self.inner.lock();
        if inner.open.contains_key(&id) {
            return Err(RelayError::Protocol(format!("stream {id} is already open")));
        }
        Ok(self.insert_locked(&mut inner, id, exchange))
    }

    /// Snapshot of an open exchange.
    pub fn lookup(&self, id: u32) -> Result<ExchangeInfo> {
        self.inner
            .lock()
            .open
            .get(&id)
            .map(|exchange| exchange.info(id))
            .ok_or(RelayError::UnknownStream(id))
    }

    /// Run `f` against an open exchange under the table lock.
    pub fn update<R>(&self, id: u32, f: impl FnOnce(&mut Exchange) -> R) -> Result<R> {
        let mut inner = self.inner.lock();
        let exchange = inner.open.get_mut(&id).ok_or(RelayError::UnknownStream(id))?;
        Ok(f(exchange))
    }

    /// Like [`update`](Self::update), but only for the exchange `key` names.
    pub fn update_key<R>(&self, key: StreamKey, f: impl FnOnce(&mut Exchange) -> R) -> Result<R> {
        let mut inner = self.inner.lock();
        match inner.open.get_mut(&key.id) {
            Some(exchange) if exchange.generation() == key.generation => Ok(f(exchange)),
            _ => Err(RelayError::UnknownStream(key.id)),
        }
    }

    /// Remove an exchange, returning it if it was open.
    pub fn release(&self, id: u32) -> Option<Exchange> {
        let mut inner = self.inner.lock();
        self.release_locked(&mut inner, id)
    }

    /// Remove the exchange `key` names; a later exchange on the same id is
    /// left alone.
    pub fn release_key(&self, key: StreamKey) -> Option<Exchange> {
        let mut inner = self.inner.lock();
        let current = inner
            .open
            .get(&key.id)
            .is_some_and(|exchange| exchange.generation() == key.generation);
        if !current {
            return None;
        }
        self.release_locked(&mut inner, key.id)
    }

    fn release_locked(&self, inner: &mut Inner, id: u32) -> Option<Exchange> {
        let exchange = inner.open.remove(&id)?;
        if self.side.owns(id) {
            inner.local_open -= 1;
            if !self.grace_period.is_zero() {
                inner.quarantine.push_back((id, Instant::now() + self.grace_period));
                inner.quarantined.insert(id);
            }
        }
        Some(exchange)
    }

    /// Remove every open exchange.
    pub fn drain(&self) -> Vec<(u32, Exchange)> {
        let mut inner = self.inner.lock();
        inner.local_open = 0;
        inner.open.drain().collect()
    }

    /// Ids of all open exchanges, ascending.
    pub fn open_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.inner.lock().open.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of open exchanges.
    pub fn len(&self) -> usize {
        self.inner.lock().open.len()
    }

    /// Whether no exchange is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Role;
    use crate::protocol::InteractionKind;

    fn exchange() -> Exchange {
        Exchange::new(InteractionKind::RequestResponse, Role::Requester)
    }

    #[test]
    fn test_parity_per_side() {
        let client = StreamTable::new(Side::Client);
        let server = StreamTable::new(Side::Server);

        assert_eq!(client.allocate().unwrap(), 1);
        assert_eq!(client.allocate().unwrap(), 3);
        assert_eq!(server.allocate().unwrap(), 2);
        assert_eq!(server.allocate().unwrap(), 4);
        assert!(Side::Client.owns(5));
        assert!(!Side::Client.owns(0));
        assert!(Side::Server.owns(6));
    }

    #[test]
    fn test_wrap_skips_open_ids() {
        let table = StreamTable::with_limits(Side::Client, 7, Duration::ZERO);
        let first = table.allocate_and_register(exchange()).unwrap().id;
        assert_eq!(first, 1);
        for expected in [3, 5, 7] {
            let id = table.allocate_and_register(exchange()).unwrap().id;
            assert_eq!(id, expected);
            table.release(id);
        }

        // Wrapped: 1 is still open, so 3 comes next.
        assert_eq!(table.allocate().unwrap(), 3);
    }

    #[test]
    fn test_exhausted_then_recovers() {
        let table = StreamTable::with_limits(Side::Server, 6, Duration::ZERO);
        let ids: Vec<u32> = (0..3)
            .map(|_| table.allocate_and_register(exchange()).unwrap().id)
            .collect();
        assert_eq!(ids, vec![2, 4, 6]);

        assert!(matches!(table.allocate(), Err(RelayError::Exhausted)));

        table.release(4);
        assert_eq!(table.allocate().unwrap(), 4);
    }

    #[test]
    fn test_grace_period_quarantines_released_ids() {
        let table = StreamTable::with_limits(Side::Client, 3, Duration::from_secs(60));
        let a = table.allocate_and_register(exchange()).unwrap().id;
        let b = table.allocate_and_register(exchange()).unwrap().id;
        table.release(a);
        table.release(b);

        assert!(matches!(table.allocate(), Err(RelayError::Exhausted)));
    }

    #[test]
    fn test_grace_period_expires() {
        let table = StreamTable::with_limits(Side::Client, 1, Duration::from_millis(5));
        let id = table.allocate_and_register(exchange()).unwrap().id;
        table.release(id);
        assert!(table.allocate().is_err());

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(table.allocate().unwrap(), 1);
    }

    #[test]
    fn test_register_duplicate_is_protocol_error() {
        let table = StreamTable::new(Side::Server);
        table.register(1, exchange()).unwrap();

        assert!(matches!(
            table.register(1, exchange()),
            Err(RelayError::Protocol(_))
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_lookup_and_release() {
        let table = StreamTable::new(Side::Client);
        let id = table.allocate_and_register(exchange()).unwrap().id;

        let info = table.lookup(id).unwrap();
        assert_eq!(info.stream_id, id);
        assert_eq!(info.kind, InteractionKind::RequestResponse);

        assert!(table.release(id).is_some());
        assert!(table.release(id).is_none());
        assert!(matches!(table.lookup(id), Err(RelayError::UnknownStream(i)) if i == id));
        assert!(matches!(table.update(id, |_| ()), Err(RelayError::UnknownStream(_))));
    }

    #[test]
    fn test_drain_and_open_ids() {
        let table = StreamTable::new(Side::Client);
        table.allocate_and_register(exchange()).unwrap();
        table.allocate_and_register(exchange()).unwrap();
        table.register(2, exchange()).unwrap();

        assert_eq!(table.open_ids(), vec![1, 2, 3]);
        assert_eq!(table.drain().len(), 3);
        assert!(table.is_empty());
        assert_eq!(table.allocate().unwrap(), 5);
    }

    #[test]
    fn test_stale_key_does_not_touch_reused_id() {
        let table = StreamTable::with_limits(Side::Client, 1, Duration::ZERO);
        let old = table.allocate_and_register(exchange()).unwrap();
        table.release(old.id);

        let new = table.allocate_and_register(exchange()).unwrap();
        assert_eq!(new.id, old.id);
        assert_ne!(new.generation, old.generation);

        assert!(table.release_key(old).is_none());
        assert!(matches!(table.update_key(old, |_| ()), Err(RelayError::UnknownStream(1))));
        assert_eq!(table.open_ids(), vec![1]);

        assert!(table.update_key(new, |_| ()).is_ok());
        assert!(table.release_key(new).is_some());
        assert!(table.is_empty());
    }
}

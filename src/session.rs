//! Session-facing API (§4.10): the thin handles an application actually
//! calls into. [`SwiftSession`] opens transactions against a [`Scout`];
//! [`TxnClient`] is the per-transaction handle returned by
//! `begin_txn`, wrapping `get`/`put`/`commit`/`discard` around the
//! corresponding `Scout` methods keyed by transaction serial.

use crate::crdt::{CrdtValue, ObjectId};
use crate::error::ScoutResult;
use crate::scout::Scout;
use crate::subscription::Listener;
use crate::txn::{CachePolicy, IsolationLevel, SessionId, TxnStatus};
use std::sync::Arc;

pub struct SwiftSession<V: CrdtValue> {
    scout: Arc<Scout<V>>,
    session_id: SessionId,
}

impl<V: CrdtValue> SwiftSession<V> {
    pub fn new(scout: Arc<Scout<V>>, session_id: SessionId) -> Self {
        SwiftSession { scout, session_id }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn begin_txn(
        &self,
        isolation: IsolationLevel,
        cache_policy: CachePolicy,
        read_only: bool,
    ) -> ScoutResult<TxnClient<V>> {
        let serial = self
            .scout
            .begin_txn(self.session_id.clone(), isolation, cache_policy, read_only)
            .await?;
        Ok(TxnClient {
            scout: self.scout.clone(),
            serial,
        })
    }
}

/// A handle to one open transaction. Dropping it without calling
/// `commit` or `discard` leaves the transaction PENDING in the scout;
/// callers are expected to always resolve a transaction they open.
pub struct TxnClient<V: CrdtValue> {
    scout: Arc<Scout<V>>,
    serial: u64,
}

impl<V: CrdtValue> TxnClient<V> {
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Read `id`. If `create_if_missing` is set and the object does not
    /// yet exist at the store, an empty CRDT is installed instead of
    /// failing with `NO_SUCH_OBJECT`. If `listener` is supplied, it fires
    /// at most once, the first time an update strictly newer than this
    /// read's snapshot becomes globally visible.
    pub async fn get(&self, id: &ObjectId, create_if_missing: bool, listener: Option<Listener>) -> ScoutResult<V> {
        self.scout.get(self.serial, id, create_if_missing, listener).await
    }

    pub fn put(&self, id: ObjectId, op: V::Op) -> ScoutResult<()> {
        self.scout.put(self.serial, id, &op)
    }

    pub async fn commit(&self) -> ScoutResult<TxnStatus> {
        self.scout.commit_txn(self.serial).await
    }

    pub async fn discard(&self) -> ScoutResult<()> {
        self.scout.discard_txn(self.serial).await
    }

    pub fn status(&self) -> ScoutResult<TxnStatus> {
        self.scout.txn_status(self.serial)
    }
}

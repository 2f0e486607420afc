// Copyright 2026 refetch Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use hashbrown::{hash_map::Entry as HashMapEntry, HashMap};
use refetch_common::error::Result;
use tokio::sync::oneshot;

use crate::{executor::FetchMode, key::QueryKey};

pub(crate) type Notifier<D> = oneshot::Sender<Result<Arc<D>>>;
pub(crate) type Waiter<D> = oneshot::Receiver<Result<Arc<D>>>;

struct Inflight<D> {
    seq: u64,
    epoch: u64,
    notifiers: Vec<Notifier<D>>,
}

pub(crate) enum Enqueue<D> {
    /// Attached to the in-flight fetch of the same entry.
    Attached(Waiter<D>),
    /// The caller leads a new fetch.
    ///
    /// `superseded` holds the notifiers of the fetch it replaces, to be cancelled out of the critical section.
    Lead {
        seq: u64,
        waiter: Waiter<D>,
        superseded: Vec<Notifier<D>>,
    },
}

/// In-flight fetches, at most one per key.
///
/// Each fetch is tagged with a sequence number. Only the fetch holding the current sequence of a key may settle, so
/// a superseded fetch can never overwrite the result of a newer one.
pub(crate) struct InflightMap<D> {
    inflights: HashMap<QueryKey, Inflight<D>>,
    next_seq: u64,
}

impl<D> Default for InflightMap<D> {
    fn default() -> Self {
        Self {
            inflights: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<D> InflightMap<D> {
    /// Attach to the in-flight fetch of `key`, or lead a new one.
    ///
    /// A fetch started for another entry epoch (the entry has been evicted or removed since) is always replaced.
    pub(crate) fn enqueue(&mut self, key: &QueryKey, epoch: u64, mode: FetchMode) -> Enqueue<D> {
        let (tx, rx) = oneshot::channel();
        match self.inflights.entry(key.clone()) {
            HashMapEntry::Occupied(mut o) if mode == FetchMode::Dedupe && o.get().epoch == epoch => {
                o.get_mut().notifiers.push(tx);
                Enqueue::Attached(rx)
            }
            entry => {
                self.next_seq += 1;
                let inflight = Inflight {
                    seq: self.next_seq,
                    epoch,
                    notifiers: vec![tx],
                };
                let superseded = match entry {
                    HashMapEntry::Occupied(mut o) => std::mem::replace(o.get_mut(), inflight).notifiers,
                    HashMapEntry::Vacant(v) => {
                        v.insert(inflight);
                        vec![]
                    }
                };
                Enqueue::Lead {
                    seq: self.next_seq,
                    waiter: rx,
                    superseded,
                }
            }
        }
    }

    /// If `seq` is the current fetch of `key`.
    pub(crate) fn is_current(&self, key: &QueryKey, seq: u64) -> bool {
        self.inflights.get(key).is_some_and(|inflight| inflight.seq == seq)
    }

    /// Take the notifiers of the fetch `seq` of `key` if it is still current.
    pub(crate) fn take(&mut self, key: &QueryKey, seq: u64) -> Option<Vec<Notifier<D>>> {
        if !self.is_current(key, seq) {
            return None;
        }
        self.inflights.remove(key).map(|inflight| inflight.notifiers)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &QueryKey) -> bool {
        self.inflights.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use refetch_common::error::{Error, ErrorKind};

    use super::*;
    use crate::query_key;

    #[test]
    fn test_dedupe_attaches() {
        let mut map = InflightMap::<u64>::default();
        let key = query_key!["a"];

        let Enqueue::Lead { seq, superseded, .. } = map.enqueue(&key, 1, FetchMode::Dedupe) else {
            panic!("first fetch must lead");
        };
        assert!(superseded.is_empty());
        assert!(matches!(map.enqueue(&key, 1, FetchMode::Dedupe), Enqueue::Attached(_)));

        let notifiers = map.take(&key, seq).unwrap();
        assert_eq!(notifiers.len(), 2);
        assert!(!map.contains(&key));
    }

    #[tokio::test]
    async fn test_replace_supersedes() {
        let mut map = InflightMap::<u64>::default();
        let key = query_key!["a"];

        let Enqueue::Lead { seq: first, waiter, .. } = map.enqueue(&key, 1, FetchMode::Dedupe) else {
            panic!("first fetch must lead");
        };
        let Enqueue::Lead {
            seq: second,
            superseded,
            ..
        } = map.enqueue(&key, 1, FetchMode::Replace)
        else {
            panic!("replace must lead");
        };
        assert!(second > first);
        assert_eq!(superseded.len(), 1);
        for notifier in superseded {
            let _ = notifier.send(Err(Error::cancelled("superseded")));
        }
        assert_eq!(waiter.await.unwrap().unwrap_err().kind(), ErrorKind::Cancelled);

        assert!(map.take(&key, first).is_none());
        assert!(map.take(&key, second).is_some());
    }

    #[test]
    fn test_new_epoch_replaces() {
        let mut map = InflightMap::<u64>::default();
        let key = query_key!["a"];
        map.enqueue(&key, 1, FetchMode::Dedupe);
        assert!(matches!(
            map.enqueue(&key, 2, FetchMode::Dedupe),
            Enqueue::Lead { superseded, .. } if superseded.len() == 1
        ));
    }
}

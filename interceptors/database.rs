/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Object-store database wrapper.
//!
//! Structural variants act on the store's indexes rather than its records:
//! an index disappears, or one nobody asked for shows up.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use faultshell_core::{FaultFamily, FaultMenu, FaultVariant, MenuDescription, corrupt_value};
use faultshell_runtime::{Database, DbError, IndexHits};
use futures_util::future::{BoxFuture, FutureExt};
use log::warn;
use serde_json::Value;

use super::{
    CleanupError, InterceptorContext, InterceptorCore, InterceptorHandle, InterceptorRegistration,
    fallback_table,
};

const CATEGORY: &str = "database";
const PUT: &str = "database.put";
const GET: &str = "database.get";
const QUERY: &str = "database.query";

const SLOW_MS: std::ops::RangeInclusive<u64> = 100..=2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseFault {
    SlowTransaction,
    TransactionAbort,
    DuplicateWrite,
    DroppedIndex,
    SpuriousIndex,
    SlowRead,
    CorruptRecord,
    MissingRecord,
    SlowQuery,
    PartialResults,
    ShuffledResults,
}

impl FaultVariant for DatabaseFault {
    fn name(self) -> &'static str {
        match self {
            Self::SlowTransaction => "slow-transaction",
            Self::TransactionAbort => "transaction-abort",
            Self::DuplicateWrite => "duplicate-write",
            Self::DroppedIndex => "dropped-index",
            Self::SpuriousIndex => "spurious-index",
            Self::SlowRead => "slow-read",
            Self::CorruptRecord => "corrupt-record",
            Self::MissingRecord => "missing-record",
            Self::SlowQuery => "slow-query",
            Self::PartialResults => "partial-results",
            Self::ShuffledResults => "shuffled-results",
        }
    }

    fn family(self) -> FaultFamily {
        match self {
            Self::SlowTransaction | Self::SlowRead | Self::SlowQuery => FaultFamily::Latency,
            Self::TransactionAbort | Self::MissingRecord => FaultFamily::Error,
            Self::DuplicateWrite => FaultFamily::Duplication,
            Self::DroppedIndex | Self::SpuriousIndex => FaultFamily::Structural,
            Self::CorruptRecord => FaultFamily::Corruption,
            Self::PartialResults => FaultFamily::Drop,
            Self::ShuffledResults => FaultFamily::Reorder,
        }
    }

    fn safe_fallback(self) -> Self {
        match self {
            Self::TransactionAbort | Self::DroppedIndex | Self::SpuriousIndex => {
                Self::SlowTransaction
            }
            Self::MissingRecord => Self::SlowRead,
            Self::PartialResults => Self::SlowQuery,
            other => other,
        }
    }
}

pub(crate) fn menu() -> FaultMenu<DatabaseFault> {
    use DatabaseFault::*;
    FaultMenu::new()
        .with(
            PUT,
            &[SlowTransaction, TransactionAbort, DuplicateWrite, DroppedIndex, SpuriousIndex],
        )
        .with(GET, &[SlowRead, CorruptRecord, MissingRecord])
        .with(QUERY, &[SlowQuery, PartialResults, ShuffledResults])
}

fn catalog() -> Vec<MenuDescription> {
    menu().describe()
}

fn fallbacks() -> Vec<(&'static str, &'static str, bool)> {
    fallback_table(&menu())
}

inventory::submit! {
    InterceptorRegistration {
        name: "database",
        categories: &[CATEGORY],
        catalog,
        fallbacks,
    }
}

pub struct ChaosDatabase {
    real: Arc<dyn Database>,
    core: Arc<InterceptorCore<DatabaseFault>>,
    spurious: AtomicU64,
}

pub fn install(ctx: &InterceptorContext, real: Arc<dyn Database>) -> Arc<ChaosDatabase> {
    Arc::new(ChaosDatabase {
        real,
        core: Arc::new(InterceptorCore::new(ctx, "database", menu())),
        spurious: AtomicU64::new(0),
    })
}

impl ChaosDatabase {
    fn slow<T: Send + 'static>(
        &self,
        variant: DatabaseFault,
        description: impl FnOnce(u64) -> String,
        work: BoxFuture<'static, T>,
    ) -> BoxFuture<'static, T> {
        let delay_ms = self.core.draw_ms(SLOW_MS);
        self.core
            .emit(CATEGORY, variant, description(delay_ms), delay_ms);
        let core = self.core.clone();
        async move {
            core.pause(delay_ms).await;
            work.await
        }
        .boxed()
    }

    fn slow_put(&self, store: &str, key: &str, value: Value) -> BoxFuture<'static, Result<(), DbError>> {
        let (real, owned_store, owned_key) = (self.real.clone(), store.to_string(), key.to_string());
        let work = async move { real.put(&owned_store, &owned_key, value).await }.boxed();
        self.slow(
            DatabaseFault::SlowTransaction,
            |delay_ms| format!("transaction on {store}/{key} held open {delay_ms}ms"),
            work,
        )
    }

    /// Delete one index of `store`. `None` when the store has none.
    fn drop_index(&self, store: &str) -> Option<String> {
        let indexes = self.real.index_names(store).ok()?;
        let index = self.core.rng().pick(&indexes)?.clone();
        match self.real.delete_index(store, &index) {
            Ok(true) => Some(index),
            _ => None,
        }
    }

    /// Create an index over a random top-level field of `value`.
    fn add_spurious_index(&self, store: &str, value: &Value) -> Option<(String, String)> {
        let fields = value.as_object()?.keys().cloned().collect::<Vec<_>>();
        let field = self.core.rng().pick(&fields)?.clone();
        let index = format!(
            "__chaos_idx_{}",
            self.spurious.fetch_add(1, Ordering::Relaxed)
        );
        self.real.create_index(store, &index, &field).ok()?;
        Some((index, field))
    }
}

impl Database for ChaosDatabase {
    fn create_store(&self, store: &str) {
        self.real.create_store(store);
    }

    fn create_index(&self, store: &str, index: &str, field: &str) -> Result<(), DbError> {
        self.real.create_index(store, index, field)
    }

    fn delete_index(&self, store: &str, index: &str) -> Result<bool, DbError> {
        self.real.delete_index(store, index)
    }

    fn index_names(&self, store: &str) -> Result<Vec<String>, DbError> {
        self.real.index_names(store)
    }

    fn put(&self, store: &str, key: &str, value: Value) -> BoxFuture<'static, Result<(), DbError>> {
        let Some(fault) = self.core.decide(CATEGORY, PUT) else {
            return self.real.put(store, key, value);
        };
        match fault {
            DatabaseFault::TransactionAbort => {
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("transaction writing {store}/{key} aborted"),
                    0,
                );
                let message = format!("write of {key:?} to {store:?} was aborted");
                async move { Err(DbError::TransactionAborted(message)) }.boxed()
            }
            DatabaseFault::DuplicateWrite => {
                let offsets = self.core.stagger(self.core.draw_copies());
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("{store}/{key} written again {} more times", offsets.len()),
                    0,
                );
                for offset in offsets {
                    let (real, store, key, value) =
                        (self.real.clone(), store.to_string(), key.to_string(), value.clone());
                    let scheduled = self.core.scheduler().schedule(offset, async move {
                        if let Err(error) = real.put(&store, &key, value).await {
                            warn!("database: replayed write of {store}/{key} failed: {error}");
                        }
                    });
                    if !scheduled {
                        break;
                    }
                }
                self.real.put(store, key, value)
            }
            DatabaseFault::DroppedIndex => match self.drop_index(store) {
                Some(index) => {
                    self.core.emit(
                        CATEGORY,
                        fault,
                        format!("index {index} of {store} dropped during write of {key}"),
                        0,
                    );
                    self.real.put(store, key, value)
                }
                None => self.slow_put(store, key, value),
            },
            DatabaseFault::SpuriousIndex => match self.add_spurious_index(store, &value) {
                Some((index, field)) => {
                    self.core.emit(
                        CATEGORY,
                        fault,
                        format!("index {index} over {field:?} appeared on {store}"),
                        0,
                    );
                    self.real.put(store, key, value)
                }
                None => self.slow_put(store, key, value),
            },
            _ => self.slow_put(store, key, value),
        }
    }

    fn get(&self, store: &str, key: &str) -> BoxFuture<'static, Result<Option<Value>, DbError>> {
        let Some(fault) = self.core.decide(CATEGORY, GET) else {
            return self.real.get(store, key);
        };
        match fault {
            DatabaseFault::MissingRecord => {
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("{store}/{key} reported as missing"),
                    0,
                );
                let error = DbError::NotFound {
                    store: store.to_string(),
                    key: key.to_string(),
                };
                async move { Err(error) }.boxed()
            }
            DatabaseFault::CorruptRecord => {
                let reading = self.real.get(store, key);
                let core = self.core.clone();
                let target = format!("{store}/{key}");
                async move {
                    let record = match reading.await {
                        Ok(record) => record,
                        Err(error) => {
                            core.emit(
                                CATEGORY,
                                DatabaseFault::CorruptRecord,
                                format!("read of {target} failed before it could be corrupted: {error}"),
                                0,
                            );
                            return Err(error);
                        }
                    };
                    let Some(mut value) = record else {
                        core.emit(
                            CATEGORY,
                            DatabaseFault::SlowRead,
                            format!("{target} absent; nothing to corrupt"),
                            0,
                        );
                        return Ok(None);
                    };
                    match core.rng().with(|rng| corrupt_value(&mut value, rng)) {
                        Some(corruption) => core.emit(
                            CATEGORY,
                            DatabaseFault::CorruptRecord,
                            format!("{target} corrupted at {corruption}"),
                            0,
                        ),
                        None => core.emit(
                            CATEGORY,
                            DatabaseFault::SlowRead,
                            format!("{target} is a scalar record; served unchanged"),
                            0,
                        ),
                    }
                    Ok(Some(value))
                }
                .boxed()
            }
            _ => {
                let reading = self.real.get(store, key);
                self.slow(
                    DatabaseFault::SlowRead,
                    |delay_ms| format!("read of {store}/{key} slowed by {delay_ms}ms"),
                    reading,
                )
            }
        }
    }

    fn delete(&self, store: &str, key: &str) -> BoxFuture<'static, Result<bool, DbError>> {
        self.real.delete(store, key)
    }

    fn query_index(
        &self,
        store: &str,
        index: &str,
        value: Value,
    ) -> BoxFuture<'static, Result<IndexHits, DbError>> {
        let Some(fault) = self.core.decide(CATEGORY, QUERY) else {
            return self.real.query_index(store, index, value);
        };
        let querying = self.real.query_index(store, index, value);
        match fault {
            DatabaseFault::PartialResults | DatabaseFault::ShuffledResults => {
                let core = self.core.clone();
                let target = format!("{store}.{index}");
                async move {
                    let mut hits = match querying.await {
                        Ok(hits) => hits,
                        Err(error) => {
                            core.emit(
                                CATEGORY,
                                fault,
                                format!("query on {target} failed before its results were altered: {error}"),
                                0,
                            );
                            return Err(error);
                        }
                    };
                    if fault == DatabaseFault::PartialResults && !hits.is_empty() {
                        let kept = core.rng().index(hits.len());
                        core.emit(
                            CATEGORY,
                            fault,
                            format!("{target} returned {kept} of {} hits", hits.len()),
                            0,
                        );
                        hits.truncate(kept);
                    } else {
                        core.rng().shuffle(&mut hits);
                        core.emit(
                            CATEGORY,
                            DatabaseFault::ShuffledResults,
                            format!("{target} returned {} hits out of key order", hits.len()),
                            0,
                        );
                    }
                    Ok(hits)
                }
                .boxed()
            }
            _ => self.slow(
                DatabaseFault::SlowQuery,
                |delay_ms| format!("query on {store}.{index} slowed by {delay_ms}ms"),
                querying,
            ),
        }
    }
}

impl InterceptorHandle for ChaosDatabase {
    fn name(&self) -> &'static str {
        "database"
    }

    fn cleanup(&self) -> Result<(), CleanupError> {
        self.core.shutdown();
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.core.is_detached()
    }

    fn active_resources(&self) -> usize {
        self.core.pending()
    }
}

/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use dupe::Dupe;
use parking_lot::Mutex;

use crate::api::cache::CacheManager;
use crate::api::cache::CacheRecord;
use crate::api::output::SharedOutput;
use crate::ctx::BuildContext;
use crate::HashMap;

/// Live combination of a node's main cache with the extra caches inherited
/// from its own and its ancestors' `cache_source` options. Loads are routed
/// to the manager whose id produced the record; the main cache is the
/// fallback and provides the combined identity.
pub struct CombinedCacheManager {
    managers: Vec<Arc<dyn CacheManager>>,
    main: Arc<dyn CacheManager>,
}

impl CombinedCacheManager {
    pub fn new(managers: Vec<Arc<dyn CacheManager>>, main: Arc<dyn CacheManager>) -> Self {
        Self { managers, main }
    }
}

#[async_trait]
impl CacheManager for CombinedCacheManager {
    fn id(&self) -> &str {
        self.main.id()
    }

    async fn load(
        &self,
        ctx: &BuildContext,
        record: &CacheRecord,
    ) -> anyhow::Result<SharedOutput> {
        for manager in &self.managers {
            if manager.id() == record.cache_id {
                return manager.load(ctx, record).await;
            }
        }
        self.main.load(ctx, record).await
    }
}

/// Default cache manager when the registry is built without one.
pub struct InMemoryCacheManager {
    id: String,
    records: Mutex<HashMap<String, SharedOutput>>,
}

impl Default for InMemoryCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCacheManager {
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Self {
            id: format!("inmem:{}", NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            records: Mutex::new(HashMap::default()),
        }
    }

    pub fn save(&self, record_id: &str, output: SharedOutput) {
        self.records.lock().insert(record_id.to_owned(), output);
    }
}

#[async_trait]
impl CacheManager for InMemoryCacheManager {
    fn id(&self) -> &str {
        &self.id
    }

    async fn load(
        &self,
        _ctx: &BuildContext,
        record: &CacheRecord,
    ) -> anyhow::Result<SharedOutput> {
        self.records
            .lock()
            .get(&record.id)
            .map(Dupe::dupe)
            .ok_or_else(|| anyhow::anyhow!("no such cache record {}", record.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::TestOutput;

    fn output(id: &str) -> SharedOutput {
        SharedOutput::new(Box::new(TestOutput::new(id)))
    }

    #[tokio::test]
    async fn combined_load_routes_by_record_cache_id() {
        let main = Arc::new(InMemoryCacheManager::new());
        let extra = Arc::new(InMemoryCacheManager::new());
        main.save("rec", output("main-out"));
        extra.save("rec", output("extra-out"));

        let combined = CombinedCacheManager::new(
            vec![
                main.dupe() as Arc<dyn CacheManager>,
                extra.dupe() as Arc<dyn CacheManager>,
            ],
            main.dupe() as Arc<dyn CacheManager>,
        );
        assert_eq!(combined.id(), main.id());

        let ctx = BuildContext::background();
        let record = CacheRecord {
            id: "rec".to_owned(),
            cache_id: extra.id().to_owned(),
        };
        assert_eq!(combined.load(&ctx, &record).await.unwrap().id(), "extra-out");

        // unknown manager id falls back to the main cache
        let record = CacheRecord {
            id: "rec".to_owned(),
            cache_id: "somewhere-else".to_owned(),
        };
        assert_eq!(combined.load(&ctx, &record).await.unwrap().id(), "main-out");
    }

    #[tokio::test]
    async fn in_memory_miss_is_an_error() {
        let cache = InMemoryCacheManager::new();
        let ctx = BuildContext::background();
        let record = CacheRecord {
            id: "missing".to_owned(),
            cache_id: cache.id().to_owned(),
        };
        assert!(cache.load(&ctx, &record).await.is_err());
    }
}

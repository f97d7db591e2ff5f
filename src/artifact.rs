//! 不可变制品缓存（进程定义、模块字节码）
//!
//! 两类数据一经部署就不会变化，因此只有 get-or-populate，没有失效路径。
//! 同一 key 的并发未命中只会触发一次远端拉取；拉取失败不会写入缓存，
//! 下次调用会重新拉取（store 内部不重试，由调用方决定）。

use crate::error::{CuError, Result};
use crate::source::{ArtifactSource, parse_process};
use crate::types::ProcessDefinition;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

type Slot<T> = Arc<OnceCell<T>>;

pub struct ArtifactStore {
    source: Arc<dyn ArtifactSource>,
    /// 允许部署进程的 owner 白名单（空 = 不限制）
    allowed_owners: Vec<String>,
    definitions: Mutex<HashMap<String, Slot<Arc<ProcessDefinition>>>>,
    modules: Mutex<HashMap<String, Slot<Arc<[u8]>>>>,
}

impl ArtifactStore {
    pub fn new(source: Arc<dyn ArtifactSource>) -> Self {
        Self {
            source,
            allowed_owners: Vec::new(),
            definitions: Mutex::new(HashMap::new()),
            modules: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_allowed_owners(mut self, owners: Vec<String>) -> Self {
        self.allowed_owners = owners;
        self
    }

    /// 返回缓存的进程定义，未命中时从远端拉取并缓存
    pub async fn get_or_fetch_process_definition(
        &self,
        process_id: &str,
    ) -> Result<Arc<ProcessDefinition>> {
        let slot = slot_for(&self.definitions, process_id);
        let def = slot
            .get_or_try_init(|| async {
                let started = Instant::now();
                let raw = self.source.fetch_process(process_id).await?;
                let def = parse_process(&raw, process_id)?;
                self.check_owner(&def)?;
                info!(
                    process_id = %process_id,
                    module_id = %def.module_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "📜 进程定义已缓存"
                );
                Ok::<_, CuError>(Arc::new(def))
            })
            .await?;
        Ok(def.clone())
    }

    /// 返回缓存的模块字节码，未命中时从远端拉取并缓存
    pub async fn get_or_fetch_module(&self, module_id: &str) -> Result<Arc<[u8]>> {
        let slot = slot_for(&self.modules, module_id);
        let module = slot
            .get_or_try_init(|| async {
                let started = Instant::now();
                let bytes = self.source.fetch_module(module_id).await?;
                info!(
                    module_id = %module_id,
                    size = bytes.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "📦 模块字节码已缓存"
                );
                Ok::<_, CuError>(Arc::<[u8]>::from(bytes))
            })
            .await?;
        Ok(module.clone())
    }

    /// 仅查询缓存，不触发拉取
    pub fn cached_process_definition(&self, process_id: &str) -> Option<Arc<ProcessDefinition>> {
        lock(&self.definitions)
            .get(process_id)
            .and_then(|slot| slot.get().cloned())
    }

    fn check_owner(&self, def: &ProcessDefinition) -> Result<()> {
        if self.allowed_owners.is_empty() || self.allowed_owners.contains(&def.owner) {
            return Ok(());
        }
        error!(process_id = %def.process_id, owner = %def.owner, "进程 owner 不在白名单内");
        Err(CuError::Other(format!(
            "process {} owned by {} is not allowed",
            def.process_id, def.owner
        )))
    }
}

fn slot_for<T>(map: &Mutex<HashMap<String, Slot<T>>>, key: &str) -> Slot<T> {
    let mut map = lock(map);
    if let Some(slot) = map.get(key) {
        return slot.clone();
    }
    debug!(key = %key, "制品缓存未命中");
    let slot = Arc::new(OnceCell::new());
    map.insert(key.to_string(), slot.clone());
    slot
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

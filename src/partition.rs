use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::compactor;
use crate::engine::{Engine, EngineOptions};
use crate::limits::*;

/// One engine per database name. Each partition has its own WAL file and
/// compactor, and shares nothing with the others.
pub struct PartitionManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    options: EngineOptions,
}

impl PartitionManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, options: EngineOptions) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            options,
        }
    }

    /// Get or lazily create the engine for database `name`.
    pub fn get_or_create(&self, name: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(name) {
            return Ok(engine.value().clone());
        }
        if name.len() > MAX_PARTITION_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "partition name too long",
            ));
        }

        // The name becomes the WAL file name as-is, so two names can never
        // share a file.
        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if name.is_empty() || !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid partition name: use ASCII letters, digits, '_' or '-'",
            ));
        }

        let len = self.engines.len();
        match self.engines.entry(name.to_string()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                if len >= MAX_PARTITIONS {
                    return Err(io::Error::other("too many partitions"));
                }
                let wal_path = self.data_dir.join(format!("{name}.wal"));
                let engine = Arc::new(Engine::new(wal_path, self.options.clone())?);
                tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
                slot.insert(engine.clone());
                metrics::gauge!(crate::observability::PARTITIONS_ACTIVE).set((len + 1) as f64);
                tracing::info!(partition = name, "partition loaded");
                Ok(engine)
            }
        }
    }
}

//! Get-or-spawn lookup of projection streams by query.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::ProjectionConfig;
use crate::dispatcher::DispatcherHandle;
use crate::error::{Error, Result};
use crate::projection::persistence::{spawn_checkpoint_writer, spawn_index_writer};
use crate::projection::query::ProjectionStreamQuery;
use crate::projection::stream::{spawn_projection_stream, ProjectionContext, ProjectionStreamHandle};
use crate::store::EventStore;
use crate::types::ProjectionStreamId;

/// Owns the shared index and checkpoint writers and one stream per query.
///
/// Two queries with the same predicates (in any order) resolve to the same
/// stream. A stream that stopped (for example after too many rebuilds) is
/// replaced on the next lookup.
pub struct ProjectionRegistry {
    ctx: ProjectionContext,
    streams: Mutex<HashMap<ProjectionStreamId, ProjectionStreamHandle>>,
}

impl ProjectionRegistry {
    /// Spawns the persistence writers and returns an empty registry.
    pub fn new(store: Arc<dyn EventStore>, dispatcher: DispatcherHandle, config: ProjectionConfig) -> Self {
        let ctx = ProjectionContext {
            index: spawn_index_writer(store.clone(), config.index_flush_delay),
            checkpoints: spawn_checkpoint_writer(store.clone(), config.checkpoint_flush_delay),
            store,
            dispatcher,
            config,
        };
        Self {
            ctx,
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ProjectionStreamId, ProjectionStreamHandle>>> {
        self.streams
            .lock()
            .map_err(|_| Error::Storage("projection registry lock poisoned".to_string()))
    }

    /// Returns the running stream for `query`, spawning it if needed.
    pub fn get_or_spawn(&self, query: ProjectionStreamQuery) -> Result<ProjectionStreamHandle> {
        let mut streams = self.lock()?;

        if let Some(handle) = streams.get(query.id()) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
            warn!(projection = %query.id(), "projection stream had stopped, respawning");
        }

        debug!(projection = %query.id(), query = %query, "spawning projection stream");
        let id = query.id().clone();
        let handle = spawn_projection_stream(query, self.ctx.clone());
        streams.insert(id, handle.clone());
        Ok(handle)
    }

    /// Returns the stream with this id, if one was spawned and is still running.
    pub fn get(&self, id: &ProjectionStreamId) -> Result<Option<ProjectionStreamHandle>> {
        let streams = self.lock()?;
        Ok(streams.get(id).filter(|h| !h.is_closed()).cloned())
    }

    /// Ids of all running streams.
    pub fn ids(&self) -> Result<Vec<ProjectionStreamId>> {
        let streams = self.lock()?;
        let mut ids: Vec<_> = streams
            .iter()
            .filter(|(_, h)| !h.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Stops every stream, then flushes and stops the writers.
    pub async fn shutdown(&self) -> Result<()> {
        let handles: Vec<ProjectionStreamHandle> = {
            let mut streams = self.lock()?;
            streams.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.shutdown().await?;
        }

        self.ctx.index.shutdown().await?;
        self.ctx.checkpoints.shutdown().await
    }
}

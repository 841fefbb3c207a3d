use super::poisoned;
use async_trait::async_trait;
use chrono::Utc;
use gantry_core::dispatch::{BuildHistory, BuilderState, DispatchType};
use gantry_core::ids::{BuildId, PipelineId};
use gantry_core::ports::DispatchBuildRepository;
use gantry_core::Result;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

type BuilderKey = (DispatchType, PipelineId, String, u32);

#[derive(Default)]
struct Tables {
    history: Vec<BuildHistory>,
    builders: HashMap<BuilderKey, BuilderState>,
}

/// In-memory [`DispatchBuildRepository`].
#[derive(Default)]
pub struct MemoryDispatchBuildRepository {
    tables: RwLock<Tables>,
}

impl MemoryDispatchBuildRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(poisoned)
    }

    fn find<'a>(
        t: &'a mut Tables,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
        builder_name: &str,
    ) -> Option<&'a mut BuilderState> {
        t.builders.values_mut().find(|b| {
            b.dispatch_type == dispatch_type
                && &b.pipeline_id == pipeline_id
                && b.vm_seq_id == vm_seq_id
                && b.builder_name == builder_name
        })
    }
}

#[async_trait]
impl DispatchBuildRepository for MemoryDispatchBuildRepository {
    async fn record_history(&self, history: &BuildHistory) -> Result<()> {
        self.write()?.history.push(history.clone());
        Ok(())
    }

    async fn history_for_build(
        &self,
        dispatch_type: DispatchType,
        build_id: BuildId,
        vm_seq_id: &str,
    ) -> Result<Option<BuildHistory>> {
        Ok(self
            .read()?
            .history
            .iter()
            .filter(|h| {
                h.dispatch_type == dispatch_type && h.build_id == build_id && h.vm_seq_id == vm_seq_id
            })
            .max_by_key(|h| h.created_at)
            .cloned())
    }

    async fn latest_history(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
    ) -> Result<Option<BuildHistory>> {
        Ok(self
            .read()?
            .history
            .iter()
            .filter(|h| {
                h.dispatch_type == dispatch_type
                    && &h.pipeline_id == pipeline_id
                    && h.vm_seq_id == vm_seq_id
            })
            .max_by_key(|h| h.created_at)
            .cloned())
    }

    async fn save_builder(&self, builder: &BuilderState) -> Result<()> {
        let key = (
            builder.dispatch_type,
            builder.pipeline_id.clone(),
            builder.vm_seq_id.clone(),
            builder.pool_no,
        );
        self.write()?.builders.insert(key, builder.clone());
        Ok(())
    }

    async fn get_builder(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
        builder_name: &str,
    ) -> Result<Option<BuilderState>> {
        let mut t = self.write()?;
        Ok(Self::find(&mut t, dispatch_type, pipeline_id, vm_seq_id, builder_name).map(|b| b.clone()))
    }

    async fn find_debugging_builder(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
    ) -> Result<Option<BuilderState>> {
        Ok(self
            .read()?
            .builders
            .values()
            .filter(|b| {
                b.dispatch_type == dispatch_type
                    && &b.pipeline_id == pipeline_id
                    && b.vm_seq_id == vm_seq_id
                    && b.debug_status
            })
            .max_by_key(|b| b.updated_at)
            .cloned())
    }

    async fn set_debug_status(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
        builder_name: &str,
        debug: bool,
    ) -> Result<()> {
        let mut t = self.write()?;
        if let Some(builder) = Self::find(&mut t, dispatch_type, pipeline_id, vm_seq_id, builder_name) {
            builder.debug_status = debug;
            builder.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn clear_debug_status(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
        builder_name: &str,
    ) -> Result<Option<BuilderState>> {
        let mut t = self.write()?;
        let Some(builder) = Self::find(&mut t, dispatch_type, pipeline_id, vm_seq_id, builder_name) else {
            return Ok(None);
        };
        let before = builder.clone();
        builder.debug_status = false;
        builder.updated_at = Utc::now();
        Ok(Some(before))
    }

    async fn delete_builder(
        &self,
        dispatch_type: DispatchType,
        pipeline_id: &PipelineId,
        vm_seq_id: &str,
        pool_no: u32,
    ) -> Result<()> {
        self.write()?.builders.remove(&(
            dispatch_type,
            pipeline_id.clone(),
            vm_seq_id.to_string(),
            pool_no,
        ));
        Ok(())
    }
}

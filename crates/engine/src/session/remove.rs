//! Remove, detach and clear

use tracing::debug;

use dormant_core::{CascadeAction, ColumnValue, Result};

use super::{EntityState, Session};
use crate::action::EntityDeleteAction;
use crate::cascade::{CascadeContext, CascadePoint};
use crate::entry::EntityStatus;
use crate::instance::{InstanceId, PropertyValue};

impl Session {
    /// Schedule a managed instance for deletion
    ///
    /// Collections cascade before the delete is scheduled, to-one
    /// associations after. Removing an instance whose insert has not been
    /// flushed just drops the insert and makes the instance transient
    /// again. A transient instance is ignored apart from the cascade.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DetachedEntity`](dormant_core::Error::DetachedEntity)
    /// for detached instances.
    pub fn remove(&mut self, id: InstanceId) -> Result<()> {
        self.ensure_open()?;
        let mut ctx = CascadeContext::new(CascadeAction::Remove);
        let result = self.remove_with(id, &mut ctx);
        self.guard(result)
    }

    pub(super) fn remove_with(&mut self, id: InstanceId, ctx: &mut CascadeContext) -> Result<()> {
        if !ctx.visit(id) {
            return Ok(());
        }
        match self.entity_state(id)? {
            EntityState::Removed => Ok(()),
            EntityState::Detached => Err(self.not_managed(id, "remove")),
            EntityState::Transient => {
                self.cascade(id, CascadePoint::Collections, ctx)?;
                self.cascade(id, CascadePoint::ToOne, ctx)
            }
            EntityState::Managed => {
                self.cascade(id, CascadePoint::Collections, ctx)?;
                self.schedule_delete(id)?;
                self.cascade(id, CascadePoint::ToOne, ctx)
            }
        }
    }

    fn schedule_delete(&mut self, id: InstanceId) -> Result<()> {
        let key = self.key_of(id)?;
        let (exists, version) = match self.context.entry(id) {
            Some(entry) => (entry.exists_in_database(), entry.version()),
            None => return Ok(()),
        };

        if !exists {
            self.actions.unschedule_all(id);
            self.context.remove_entity(id);
            self.instances.get_mut(id)?.forget_identity();
            debug!(target: "dormant::session", %key, "Unflushed insert dropped");
            return Ok(());
        }

        let state = self.deleted_columns(id)?;
        if let Some(entry) = self.context.entry_mut(id) {
            entry.set_deleted_state(Some(state));
            entry.set_status(EntityStatus::Deleted);
        }
        self.context.add_nullifiable(key.clone());
        self.actions.add_delete(EntityDeleteAction {
            instance: id,
            key: key.clone(),
            version,
        });
        debug!(target: "dormant::session", %key, "Delete scheduled");
        Ok(())
    }

    /// Column image used to order deletes. References are kept even when
    /// the target is being removed too.
    fn deleted_columns(&self, id: InstanceId) -> Result<Vec<ColumnValue>> {
        self.instances
            .get(id)?
            .state()
            .iter()
            .map(|value| {
                Ok(match value {
                    PropertyValue::Basic(v) => ColumnValue::Value(v.clone()),
                    PropertyValue::Entity(target) => {
                        let identifier = match target {
                            Some(target) => self.instances.get(*target)?.id().cloned(),
                            None => None,
                        };
                        ColumnValue::Reference(identifier)
                    }
                    PropertyValue::Collection(_) => ColumnValue::Collection,
                })
            })
            .collect()
    }

    /// Stop managing an instance without touching the store
    ///
    /// Pending changes of the instance are discarded. DETACH cascades along
    /// the associations that include it.
    pub fn detach(&mut self, id: InstanceId) -> Result<()> {
        self.ensure_open()?;
        self.instances.get(id)?;
        let mut ctx = CascadeContext::new(CascadeAction::Detach);
        self.detach_with(id, &mut ctx)
    }

    pub(super) fn detach_with(&mut self, id: InstanceId, ctx: &mut CascadeContext) -> Result<()> {
        if !ctx.visit(id) {
            return Ok(());
        }
        let Some(entry) = self.context.remove_entity(id) else {
            return Ok(());
        };
        self.actions.unschedule_all(id);
        self.context.remove_nullifiable(entry.key());
        self.version_checks.retain(|checked| *checked != id);
        if !entry.exists_in_database() {
            self.instances.get_mut(id)?.forget_identity();
        }
        debug!(target: "dormant::session", key = %entry.key(), "Entity detached");
        self.cascade(id, CascadePoint::All, ctx)
    }

    /// Detach every managed instance and drop every pending action
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.discard_context()
    }

    pub(super) fn discard_context(&mut self) -> Result<()> {
        for id in self.context.managed_instances() {
            let unflushed = self
                .context
                .entry(id)
                .map_or(false, |entry| !entry.exists_in_database());
            if unflushed {
                self.instances.get_mut(id)?.forget_identity();
            }
        }
        let detached = self.context.clear();
        self.actions.clear();
        self.version_checks.clear();
        debug!(target: "dormant::session", detached = detached.len(), "Persistence context cleared");
        Ok(())
    }
}

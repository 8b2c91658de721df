//! The instance registry: every data object, connection and user-registered
//! extension of a run. Populated once while the configuration is turned into
//! instances, read-only during execution.

use crate::connection::Connection;
use crate::dataobject::DataObject;
use crate::error::{DpoError, Result};
use crate::execmode::CustomPartitionMode;
use crate::id::{ConnectionId, DataObjectId};
use crate::secret::SecretRegistry;
use crate::transform::{ManyToManyFn, OneToOneFn};
use std::collections::HashMap;
use std::sync::Arc;

/// A user transformation registered by name so configuration files can
/// reference it.
#[derive(Clone)]
pub enum CustomTransformer {
    OneToOne(Arc<OneToOneFn>),
    ManyToMany(Arc<ManyToManyFn>),
}

#[derive(Default)]
pub struct InstanceRegistry {
    data_objects: HashMap<DataObjectId, Arc<dyn DataObject>>,
    connections: HashMap<ConnectionId, Arc<dyn Connection>>,
    transformers: HashMap<String, CustomTransformer>,
    custom_modes: HashMap<String, Arc<dyn CustomPartitionMode>>,
    secrets: SecretRegistry,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_data_object(&mut self, object: Arc<dyn DataObject>) -> Result<()> {
        let id = object.id();
        if self.data_objects.insert(id.clone(), object).is_some() {
            return Err(DpoError::config(format!("duplicate data object id '{}'", id)));
        }
        Ok(())
    }

    pub fn register_connection(&mut self, connection: Arc<dyn Connection>) -> Result<()> {
        let id = connection.id();
        if self.connections.insert(id.clone(), connection).is_some() {
            return Err(DpoError::config(format!("duplicate connection id '{}'", id)));
        }
        Ok(())
    }

    pub fn register_transformer(
        &mut self,
        name: impl Into<String>,
        transformer: CustomTransformer,
    ) {
        self.transformers.insert(name.into(), transformer);
    }

    pub fn register_custom_mode(
        &mut self,
        name: impl Into<String>,
        mode: Arc<dyn CustomPartitionMode>,
    ) {
        self.custom_modes.insert(name.into(), mode);
    }

    pub fn data_object(&self, id: &DataObjectId) -> Result<&Arc<dyn DataObject>> {
        self.data_objects
            .get(id)
            .ok_or_else(|| DpoError::config(format!("unknown data object '{}'", id)))
    }

    pub fn connection(&self, id: &ConnectionId) -> Result<&Arc<dyn Connection>> {
        self.connections
            .get(id)
            .ok_or_else(|| DpoError::config(format!("unknown connection '{}'", id)))
    }

    pub fn transformer(&self, name: &str) -> Result<&CustomTransformer> {
        self.transformers
            .get(name)
            .ok_or_else(|| DpoError::config(format!("unknown transformer '{}'", name)))
    }

    pub fn custom_mode(&self, name: &str) -> Result<&Arc<dyn CustomPartitionMode>> {
        self.custom_modes
            .get(name)
            .ok_or_else(|| DpoError::config(format!("unknown execution mode '{}'", name)))
    }

    pub fn connections(&self) -> impl Iterator<Item = &Arc<dyn Connection>> {
        self.connections.values()
    }

    pub fn secrets(&self) -> &SecretRegistry {
        &self.secrets
    }

    pub fn secrets_mut(&mut self) -> &mut SecretRegistry {
        &mut self.secrets
    }
}

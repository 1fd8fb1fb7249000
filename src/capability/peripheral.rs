//! Peripheral inventory of a node.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{NodeId, ServiceId};
use crate::rpc::method::rpc_methods;
use crate::rpc::{handle_service_request, read_method, Empty, RpcClient, RpcCodec, StreamOpener};
use crate::service::Service;
use crate::stream::ServiceStream;

use super::display_sink::DISPLAY_SINK_SERVICE;
use super::display_source::DISPLAY_SOURCE_SERVICE;

/// Service id of the peripheral repository.
pub const PERIPHERAL_REPOSITORY_SERVICE: &str = "peripheral-repository";

rpc_methods! {
    /// Methods of the peripheral repository service.
    pub enum PeripheralMethod {
        /// List every peripheral.
        GetPeripherals = "GetPeripherals",
        /// Look up one peripheral by id.
        GetPeripheral = "GetPeripheral",
    }
}

/// Identifier of a peripheral, unique within its node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Wrap an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of device a peripheral is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeripheralKind {
    /// Produces frames (a captured screen).
    DisplaySource,
    /// Consumes frames (a monitor).
    DisplaySink,
    /// Keyboard input.
    Keyboard,
    /// Mouse or other pointer input.
    Pointer,
}

/// Description of one peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralDescriptor {
    /// Peripheral id.
    pub id: PeripheralId,
    /// Human readable name.
    pub name: String,
    /// Device kind.
    pub kind: PeripheralKind,
}

impl PeripheralDescriptor {
    /// Service id that serves this peripheral, for display kinds.
    pub fn service_id(&self) -> Option<ServiceId> {
        let base = match self.kind {
            PeripheralKind::DisplaySource => DISPLAY_SOURCE_SERVICE,
            PeripheralKind::DisplaySink => DISPLAY_SINK_SERVICE,
            PeripheralKind::Keyboard | PeripheralKind::Pointer => return None,
        };
        Some(ServiceId::with_argument(base, self.id.as_str()))
    }
}

/// Inventory of peripherals on a node.
#[async_trait]
pub trait PeripheralRepository: Send + Sync + 'static {
    /// Every peripheral, ordered by id.
    async fn get_peripherals(&self) -> Result<Vec<PeripheralDescriptor>>;

    /// One peripheral.
    ///
    /// Fails with [`Error::PeripheralNotFound`] for an unknown id.
    async fn get_peripheral(&self, id: &PeripheralId) -> Result<PeripheralDescriptor>;
}

/// Fixed in-memory inventory.
#[derive(Debug, Clone, Default)]
pub struct LocalPeripheralRepository {
    peripherals: BTreeMap<PeripheralId, PeripheralDescriptor>,
}

impl LocalPeripheralRepository {
    /// Build from descriptors. A later descriptor replaces an earlier one with the same id.
    pub fn new(peripherals: impl IntoIterator<Item = PeripheralDescriptor>) -> Self {
        Self {
            peripherals: peripherals
                .into_iter()
                .map(|p| (p.id.clone(), p))
                .collect(),
        }
    }

    /// Service ids of every display peripheral held.
    pub fn display_service_ids(&self) -> Vec<ServiceId> {
        self.peripherals
            .values()
            .filter_map(PeripheralDescriptor::service_id)
            .collect()
    }
}

#[async_trait]
impl PeripheralRepository for LocalPeripheralRepository {
    async fn get_peripherals(&self) -> Result<Vec<PeripheralDescriptor>> {
        Ok(self.peripherals.values().cloned().collect())
    }

    async fn get_peripheral(&self, id: &PeripheralId) -> Result<PeripheralDescriptor> {
        self.peripherals
            .get(id)
            .cloned()
            .ok_or_else(|| Error::PeripheralNotFound(id.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GetPeripheralRequest {
    id: PeripheralId,
}

/// Exposes a [`PeripheralRepository`] over RPC.
pub struct PeripheralRepositoryService {
    repository: Arc<dyn PeripheralRepository>,
}

impl PeripheralRepositoryService {
    /// Serve `repository`.
    pub fn new(repository: Arc<dyn PeripheralRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl Service for PeripheralRepositoryService {
    fn service_id(&self) -> ServiceId {
        ServiceId::new(PERIPHERAL_REPOSITORY_SERVICE)
    }

    async fn handle(&self, stream: ServiceStream) -> Result<()> {
        let mut codec = RpcCodec::new(stream);
        let repository = &self.repository;
        match read_method::<PeripheralMethod>(&mut codec).await? {
            PeripheralMethod::GetPeripherals => {
                handle_service_request(&mut codec, |_: Empty| repository.get_peripherals()).await
            }
            PeripheralMethod::GetPeripheral => {
                handle_service_request(&mut codec, |req: GetPeripheralRequest| async move {
                    repository.get_peripheral(&req.id).await
                })
                .await
            }
        }
    }
}

/// A remote peripheral repository reached over RPC.
#[derive(Debug, Clone)]
pub struct PeripheralRepositoryClient {
    rpc: RpcClient,
}

impl PeripheralRepositoryClient {
    /// Proxy for the peripheral repository on `node_id`.
    pub fn new(opener: Arc<dyn StreamOpener>, node_id: NodeId) -> Self {
        Self {
            rpc: RpcClient::new(opener, node_id, ServiceId::new(PERIPHERAL_REPOSITORY_SERVICE)),
        }
    }
}

#[async_trait]
impl PeripheralRepository for PeripheralRepositoryClient {
    async fn get_peripherals(&self) -> Result<Vec<PeripheralDescriptor>> {
        self.rpc.call(PeripheralMethod::GetPeripherals, &Empty {}).await
    }

    async fn get_peripheral(&self, id: &PeripheralId) -> Result<PeripheralDescriptor> {
        self.rpc
            .call(
                PeripheralMethod::GetPeripheral,
                &GetPeripheralRequest { id: id.clone() },
            )
            .await
    }
}

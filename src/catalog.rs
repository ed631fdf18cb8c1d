//! Service catalog lookups. Prices are looked up per `(service, vehicle type)`
//! pair; the engine never computes them.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Debug, thiserror::Error)]
#[error("catalog unavailable: {0}")]
pub struct CatalogError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: Ulid,
    pub name: String,
    /// Minutes per unit.
    pub duration: u32,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleTypeInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePrice {
    pub service_id: Ulid,
    pub vehicle_type_id: Ulid,
    pub price: Decimal,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn service(&self, id: Ulid) -> Result<Option<ServiceInfo>, CatalogError>;
    async fn vehicle_type(&self, id: Ulid) -> Result<Option<VehicleTypeInfo>, CatalogError>;
    async fn price(
        &self,
        service_id: Ulid,
        vehicle_type_id: Ulid,
    ) -> Result<Option<Decimal>, CatalogError>;
}

#[derive(Default)]
pub struct InMemoryCatalog {
    services: DashMap<Ulid, ServiceInfo>,
    vehicle_types: DashMap<Ulid, VehicleTypeInfo>,
    prices: DashMap<(Ulid, Ulid), Decimal>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&self, service: ServiceInfo) {
        self.services.insert(service.id, service);
    }

    pub fn add_vehicle_type(&self, vehicle_type: VehicleTypeInfo) {
        self.vehicle_types.insert(vehicle_type.id, vehicle_type);
    }

    /// Insert or replace the price row for a pair.
    pub fn set_price(&self, service_id: Ulid, vehicle_type_id: Ulid, price: Decimal) {
        self.prices.insert((service_id, vehicle_type_id), price);
    }

    pub fn remove_price(&self, service_id: Ulid, vehicle_type_id: Ulid) -> Option<Decimal> {
        self.prices
            .remove(&(service_id, vehicle_type_id))
            .map(|(_, p)| p)
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn service(&self, id: Ulid) -> Result<Option<ServiceInfo>, CatalogError> {
        Ok(self.services.get(&id).map(|e| e.value().clone()))
    }

    async fn vehicle_type(&self, id: Ulid) -> Result<Option<VehicleTypeInfo>, CatalogError> {
        Ok(self.vehicle_types.get(&id).map(|e| e.value().clone()))
    }

    async fn price(
        &self,
        service_id: Ulid,
        vehicle_type_id: Ulid,
    ) -> Result<Option<Decimal>, CatalogError> {
        Ok(self
            .prices
            .get(&(service_id, vehicle_type_id))
            .map(|e| *e.value()))
    }
}

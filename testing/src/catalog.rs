use rentflow_core::error::StoreError;
use rentflow_core::ports::{PortFuture, VehicleCatalog};
use rentflow_core::types::{Money, VehicleId};
use std::collections::HashMap;

/// Fixed table of daily rates.
#[derive(Debug, Clone, Default)]
pub struct InMemoryVehicleCatalog {
    rates: HashMap<VehicleId, Money>,
}

impl InMemoryVehicleCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vehicle with its daily rate.
    #[must_use]
    pub fn with_vehicle(mut self, vehicle: VehicleId, daily_rate: Money) -> Self {
        self.rates.insert(vehicle, daily_rate);
        self
    }
}

impl VehicleCatalog for InMemoryVehicleCatalog {
    fn daily_rate(&self, vehicle: VehicleId) -> PortFuture<'_, Money> {
        let rate = self
            .rates
            .get(&vehicle)
            .copied()
            .ok_or_else(|| StoreError::not_found("vehicle", vehicle));
        Box::pin(async move { rate })
    }
}

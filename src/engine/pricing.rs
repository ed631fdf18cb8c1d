use rust_decimal::Decimal;
use ulid::Ulid;

use crate::catalog::Catalog;
use crate::limits::*;
use crate::model::*;
use crate::request::{ServiceAddition, VehicleOrder};

use super::EngineError;

/// Price one new line from the catalog. The unit price is fixed from here on.
async fn new_line(
    catalog: &dyn Catalog,
    vehicle_type_id: Ulid,
    service_id: Ulid,
    quantity: u32,
) -> Result<BookingService, EngineError> {
    let service = catalog
        .service(service_id)
        .await?
        .ok_or(EngineError::UnknownService(service_id))?;
    let unit_price = catalog
        .price(service_id, vehicle_type_id)
        .await?
        .ok_or(EngineError::UnpricedService {
            service_id,
            vehicle_type_id,
        })?;
    Ok(BookingService {
        id: Ulid::new(),
        service_id,
        quantity,
        unit_price,
        total_price: unit_price * Decimal::from(quantity),
        duration: service.duration,
    })
}

/// Resolve every line of every vehicle. Nothing is returned unless all of
/// them are priced, so a single miss aborts the whole booking.
pub async fn price_vehicles(
    catalog: &dyn Catalog,
    orders: &[VehicleOrder],
) -> Result<Vec<BookingVehicle>, EngineError> {
    let mut vehicles = Vec::with_capacity(orders.len());
    for order in orders {
        catalog
            .vehicle_type(order.vehicle_type_id)
            .await?
            .ok_or(EngineError::UnknownVehicleType(order.vehicle_type_id))?;

        let mut services = Vec::with_capacity(order.lines.len());
        for line in &order.lines {
            services.push(new_line(catalog, order.vehicle_type_id, line.service_id, line.quantity).await?);
        }
        vehicles.push(BookingVehicle {
            id: Ulid::new(),
            vehicle_type_id: order.vehicle_type_id,
            vehicle_info: order.vehicle_info.clone(),
            vehicle_notes: order.vehicle_notes.clone(),
            services,
            total_duration: 0,
            total_price: Decimal::ZERO,
        });
    }
    Ok(vehicles)
}

/// Rebuild vehicle and booking totals from the full line set, then move
/// `estimated_end` to match.
pub fn recompute_totals(booking: &mut Booking) -> Result<(), EngineError> {
    let mut booking_minutes: u64 = 0;
    let mut booking_price = Decimal::ZERO;

    for vehicle in &mut booking.vehicles {
        let mut vehicle_minutes: u64 = 0;
        let mut price = Decimal::ZERO;
        for line in &vehicle.services {
            vehicle_minutes += u64::from(line.duration) * u64::from(line.quantity);
            price += line.total_price;
        }
        if vehicle_minutes > u64::from(MAX_BOOKING_MINUTES) {
            return Err(EngineError::LimitExceeded("booking longer than one day"));
        }
        vehicle.total_duration = vehicle_minutes as u32;
        vehicle.total_price = price;
        booking_minutes += vehicle_minutes;
        booking_price += price;
    }

    if booking_minutes == 0 {
        return Err(EngineError::invalid("services", "total duration must be positive"));
    }
    if booking_minutes > u64::from(MAX_BOOKING_MINUTES) {
        return Err(EngineError::LimitExceeded("booking longer than one day"));
    }
    booking.total_duration = booking_minutes as u32;
    booking.total_price = booking_price;
    booking.estimated_end = booking.scheduled_time + minutes(booking.total_duration);
    Ok(())
}

/// Apply additions in order. A (vehicle, service) pair already on the booking
/// grows in quantity at its stored unit price; anything else becomes a new
/// line priced from the catalog. Totals are recomputed from scratch at the end.
pub async fn apply_additions(
    booking: &mut Booking,
    additions: &[ServiceAddition],
    catalog: &dyn Catalog,
) -> Result<(), EngineError> {
    for add in additions {
        let vehicle = booking
            .vehicle_mut(add.booking_vehicle_id)
            .ok_or(EngineError::UnknownBookingVehicle(add.booking_vehicle_id))?;

        if let Some(line) = vehicle.services.iter_mut().find(|l| l.service_id == add.service_id) {
            let quantity = line.quantity + add.quantity;
            if quantity > MAX_QUANTITY {
                return Err(EngineError::LimitExceeded("quantity too large"));
            }
            line.quantity = quantity;
            line.total_price = line.unit_price * Decimal::from(quantity);
            continue;
        }

        if vehicle.services.len() >= MAX_LINES_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many services on one vehicle"));
        }
        let line = new_line(catalog, vehicle.vehicle_type_id, add.service_id, add.quantity).await?;
        vehicle.services.push(line);
    }
    recompute_totals(booking)
}

//! Trip booking saga: reserve a flight, book a hotel, charge the customer.

use crate::definition::{SagaDefinition, StepDefinition};

pub const DEFINITION_NAME: &str = "TripBooking";

pub const STEP_RESERVE_FLIGHT: &str = "reserve_flight";
pub const STEP_BOOK_HOTEL: &str = "book_hotel";
pub const STEP_CHARGE_PAYMENT: &str = "charge_payment";

pub const FLIGHT_SERVICE: &str = "flight-service";
pub const HOTEL_SERVICE: &str = "hotel-service";
pub const PAYMENT_SERVICE: &str = "payment-service";

pub const ACTION_CANCEL_FLIGHT: &str = "cancel_flight";
pub const ACTION_CANCEL_HOTEL: &str = "cancel_hotel";
pub const ACTION_REFUND_PAYMENT: &str = "refund_payment";

/// Returns the trip booking definition with every step compensable.
pub fn definition() -> SagaDefinition {
    SagaDefinition {
        name: DEFINITION_NAME.to_string(),
        steps: vec![
            StepDefinition::new(STEP_RESERVE_FLIGHT, FLIGHT_SERVICE, STEP_RESERVE_FLIGHT)
                .compensated_by(FLIGHT_SERVICE, ACTION_CANCEL_FLIGHT)
                .requires(["customer_id", "flight_number"]),
            StepDefinition::new(STEP_BOOK_HOTEL, HOTEL_SERVICE, STEP_BOOK_HOTEL)
                .compensated_by(HOTEL_SERVICE, ACTION_CANCEL_HOTEL)
                .requires(["hotel_id", "nights"]),
            StepDefinition::new(STEP_CHARGE_PAYMENT, PAYMENT_SERVICE, STEP_CHARGE_PAYMENT)
                .compensated_by(PAYMENT_SERVICE, ACTION_REFUND_PAYMENT)
                .requires(["customer_id", "amount_cents"]),
        ],
    }
}

/// A payload satisfying every step of [`definition`].
pub fn sample_payload() -> serde_json::Value {
    serde_json::json!({
        "customer_id": "cust-0042",
        "flight_number": "LH-438",
        "hotel_id": "hotel-berlin-mitte",
        "nights": 3,
        "amount_cents": 129900
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_is_valid() {
        let def = definition();
        def.validate().unwrap();
        assert_eq!(
            def.step_names().collect::<Vec<_>>(),
            vec![STEP_RESERVE_FLIGHT, STEP_BOOK_HOTEL, STEP_CHARGE_PAYMENT]
        );
        assert!(def.steps.iter().all(|s| s.is_compensable()));
    }

    #[test]
    fn sample_payload_is_accepted() {
        definition().validate_payload(&sample_payload()).unwrap();
    }
}

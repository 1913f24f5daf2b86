//! Domain model: money, the payment aggregate, its lifecycle, and events.
//!
//! Everything here is a value. Aggregates are never mutated in place;
//! lifecycle "mutators" consume the current value and return the next one,
//! and the repository layer persists each new version with a compare-and-swap.

pub mod error;
pub mod events;
pub mod lifecycle;
pub mod money;
pub mod payment;

pub use error::{ErrorRecord, PaymentError};
pub use events::{PaymentEvent, PaymentEventBody, PaymentEventType};
pub use lifecycle::PaymentState;
pub use money::{Currency, Money, MoneyError};
pub use payment::{Customer, Payment, PaymentId, PaymentMethod};

//! Adapters between the engine and the outside world.

pub mod csv;
pub mod http;
pub mod mpesa;
pub mod paystack;
pub mod sms;

pub mod alerts;
pub mod api_errors;
pub mod flutterwave;
pub mod mpesa;
pub mod paystack;
pub mod redis_backend;
pub mod signature;
pub mod stripe;
pub mod webhook;

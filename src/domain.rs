pub mod alert;
pub mod cache;
pub mod clock;
pub mod error;
pub mod event;
pub mod id;
pub mod money;
pub mod payment;
pub mod provider;
pub mod publisher;
pub mod state_machine;
pub mod store;

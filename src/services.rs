pub mod dispatcher;
pub mod idempotency;
pub mod outbox;
pub mod pipeline;
pub mod supervisor;
pub mod telemetry;

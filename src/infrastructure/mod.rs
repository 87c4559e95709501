pub mod bluetooth;
pub mod event_bus;
pub mod logging;
pub mod persistence;

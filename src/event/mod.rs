// src/event/mod.rs

pub mod base;
pub mod manager;

pub use base::{extract_field_value, map_severity, Event, EventSpec, Observable, ObservableMapping};
pub use manager::{EventManager, EventPayload, EventQueue, EventSpooler, BULK_SIZE, MAX_SPOOLED_EVENTS};

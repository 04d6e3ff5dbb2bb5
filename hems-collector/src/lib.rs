//! Smart-meter collector for the Wi-SUN B-route.
//!
//! Talks to a low-voltage smart meter through a serial Wi-SUN adapter
//! (SKSTACK-IP command set), reads ECHONET Lite power and energy properties
//! on a schedule, and forwards each [`hems_common::Measurement`] to the
//! configured outputs.
//!
//! # Layers
//!
//! ```text
//! scheduler ─▶ meter ─▶ join / acquisition ─▶ transport ─▶ adapter (serial)
//!     │                        │
//!     ▼                        ▼
//! dispatch ─▶ sinks         echonet, properties
//! ```

pub mod acquisition;
pub mod adapter;
pub mod config;
pub mod cron;
pub mod dispatch;
pub mod echonet;
pub mod join;
pub mod meter;
pub mod properties;
pub mod scheduler;
pub mod shutdown;
pub mod sinks;
pub mod transport;

#[cfg(test)]
mod testing;

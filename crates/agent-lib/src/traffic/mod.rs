//! Traffic observation and attribution
//!
//! One external summarizer process per monitored interface produces
//! periodic frames; frames are parsed into [`TrafficSample`]s, their
//! local/remote sides disambiguated, and each flow classified to the
//! service that owns it.
//!
//! [`TrafficSample`]: crate::models::TrafficSample

mod classify;
mod frame;
mod sampler;

pub use classify::{FlowClassifier, WellKnownPorts};
pub use frame::{data_amount_to_bits, is_frame_boundary, parse_address_and_port, parse_frame, UNKNOWN_PORT};
pub use sampler::{NicSamplerHandle, TrafficSamplerConfig, TrafficSource, NIC_PLACEHOLDER};

//! Broker between editor processes on a local socket and the tool layer that
//! drives them.

pub mod broker;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod detector;
pub mod error;
pub mod listener;
pub mod registry;
pub mod selection;
pub mod store;

pub use broker::{
    Broker, CommandOutcome, ExitDecision, HelpLookup, InstanceListing, MacroRecording,
};
pub use config::BrokerConfig;
pub use connection::{EditorConnection, LinkStatus};
pub use error::BrokerError;
pub use registry::{InstanceRegistry, InstanceSummary};
pub use store::{BrokerStore, FileStore};

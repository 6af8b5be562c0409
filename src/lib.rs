pub mod activity;
pub mod bus;
pub mod commander;
pub mod config;
pub mod error;
pub mod executor;
pub mod identity;
pub mod message;
pub mod modules;
pub mod notifier;
pub mod registry;
pub mod response;
pub mod router;
pub mod transport;

pub use bus::{Bus, Inbound};
pub use commander::{Commander, Nested, PeerSender};
pub use config::BusConfig;
pub use error::{BusError, BusResult};
pub use message::{Envelope, Message};
pub use modules::{BusModule, ModuleCatalog, ModuleCommands, ModuleContext};
pub use registry::{CommandPolicy, Handler, HandlerResult};
pub use response::Response;

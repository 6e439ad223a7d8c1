//! sluice filter-graph runtime.
//!
//! A session composes directed graphs of independent processing units
//! (filters) connected by typed, property-carrying pipes (PIDs). The
//! runtime provides:
//!
//! - [`queue`]: bounded FIFO with free-list reuse, mutex or lock-free SPSC
//! - [`props`] / [`prop_map`]: typed property values and shared maps
//! - [`packet`]: reference-counted data units with reservoir pooling
//! - [`pid`]: output pipes and their per-consumer instances
//! - [`filter`]: filter instances and the registration descriptor
//! - [`caps`]: capability bundles and matching
//! - [`resolver`]: shortest-chain graph resolution over the registry
//! - [`events`]: upstream/downstream event propagation
//! - [`session`] / [`sched`]: the filter list and the work-stealing
//!   task pool driving everything
//!
//! Filters are written against the [`filter::FilterImpl`] trait and
//! registered through [`session::FilterSession::register`].

pub mod caps;
pub mod events;
pub mod filter;
pub mod packet;
pub mod pid;
pub mod prop_map;
pub mod props;
pub mod queue;
pub mod resolver;
pub mod sched;
pub mod session;

pub use sluice_common::{Error, FourCC, Fraction, Fraction64, Result, StreamType};

pub use caps::{CapSlot, Capability};
pub use events::{Event, EventKind, PlayFlags};
pub use filter::{Filter, FilterArgDesc, FilterImpl, FilterRegister};
pub use packet::{
    ClockType, FrameInterface, Packet, PacketRef, PckFlags, PckInfo, RetainedPacket, NO_BO, NO_TS,
};
pub use pid::{ClockInfo, Pid, PidInstStats, PidInstance};
pub use prop_map::PropMap;
pub use props::{keys, PropKey, PropValue};
pub use session::{FilterSession, FilterStats, SessionConfig, SessionStats};

//! Flow state machine: message routing (§4.3) and the flow runner (§4.4).
//!
//! A flow is driven entirely by its persisted `FlowStateRecord` and the
//! `RequestState`s it has outstanding — there is no in-process flow object
//! that survives between worker ticks. `MessageRouter` is the write path for
//! client traffic landing on a session; `FlowRunner` is what a worker calls
//! once a queue notification says a session has work ready.

pub mod registry;
pub mod router;
pub mod runner;
pub mod types;

pub use registry::{FlowCategory, FlowDescriptor, FlowRegistry, RegistryError};
pub use router::{MessageRouter, RouteOutcome, RouterError};
pub use runner::{FlowRunner, RunnerError};
pub use types::{Action, FlowContext, FlowStateRecord, Responses, StateFn};

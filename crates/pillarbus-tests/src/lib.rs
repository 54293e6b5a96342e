//! Pillarbus Test & Simulation Infrastructure
//!
//! In-process pillars that answer identify and operation requests on a
//! [`pillarbus_conversation::LocalBus`] according to a script, an event
//! recorder, and a network fixture wiring them to a client. The
//! end-to-end conversation scenarios and the state machine property
//! tests live here as well.

pub mod harness;
pub mod proptest_conversation;


pub use harness::{
    init_tracing, EventRecorder, IdentifyReply, OperationReply, PillarScript, SimulatedPillar,
    TestNetwork, TestNetworkBuilder,
};

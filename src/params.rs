//! Identifiers handed to the protocol engine by its login collaborator. The
//!  engine never performs login itself; it only consumes the results.

use uuid::Uuid;

/// Per-circuit identity: everything the outbound builders stamp into their
///  messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamParameters {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub region_id: Uuid,
    pub circuit_code: u32,
}

/// Where the simulator lives, as reported by the login service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParameters {
    pub message: String,
    pub sim_name: String,
    pub sim_ip: String,
    pub sim_port: u16,
}

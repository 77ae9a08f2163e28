pub mod hash_id;
pub mod node_id;
pub mod rate_estimator;
pub mod spawn_utils;

pub use hash_id::{Id, Id16};
pub use node_id::{
    NodeId, ScenarioId, generate_node_id, generate_request_id, generate_scenario_id,
};

use crate::hash_id::Id16;

/// 128-bit random identity generated at node startup. Stable for the process
/// lifetime; two nodes with the same identity must not coexist.
pub type NodeId = Id16;

/// Globally unique scenario identifier.
pub type ScenarioId = Id16;

pub fn generate_node_id() -> NodeId {
    let u = uuid::Uuid::new_v4();
    Id16::new(*u.as_bytes())
}

pub fn generate_scenario_id() -> ScenarioId {
    let u = uuid::Uuid::new_v4();
    Id16::new(*u.as_bytes())
}

/// Identifier for one in-flight cluster snapshot request.
pub fn generate_request_id() -> Id16 {
    let u = uuid::Uuid::new_v4();
    Id16::new(*u.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = generate_node_id();
        let b = generate_node_id();
        assert_ne!(a, b);
    }
}

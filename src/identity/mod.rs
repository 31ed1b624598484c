pub mod coordinator;
pub mod graph;

pub use coordinator::IdentityCoordinator;
pub use graph::{plan_merge, plan_split, split_actor_uuid, MergePlan, SplitPlan, SplitSeed};

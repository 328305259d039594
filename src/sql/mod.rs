pub mod plan;
pub use plan::{ExplainMode, PlanNode, ProjectItem, SqlCommand};

pub mod resource;
pub mod resource_claim;
pub mod spec;
pub mod task;
pub mod task_item;

pub mod callback_service;
pub mod dependency_service;
pub mod reconcile_service;
pub mod resource_service;
pub mod sweep_service;
pub mod task_service;

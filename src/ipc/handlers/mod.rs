pub mod admissions;
pub mod attendance;
pub mod auth;
pub mod batches;
pub mod branches;
pub mod core;
pub mod courses;
pub mod dashboard;
pub mod leads;
pub mod maintenance;
pub mod reports;
pub mod setup;
pub mod students;
pub mod trainers;
pub mod users;

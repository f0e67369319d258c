pub mod agents;
pub mod auth;
pub mod history;
pub mod knowledge;

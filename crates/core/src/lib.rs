pub mod auth;
pub mod fedavg;
pub mod ids;
pub mod job;
pub mod node;

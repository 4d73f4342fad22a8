pub mod ai_provider;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod convergence;
pub mod cost;
pub mod error;
pub mod escalation;
pub mod job;
pub mod providers;
pub mod render;

//! The validation core.
//!
//! A request becomes a [`registry::RunRecord`] and is driven by the
//! [`orchestrator::Orchestrator`] through workspace setup, clone, patch,
//! sandboxed static checks with fixer-assisted retries, optional dynamic
//! execution, and finally commit and push. External systems sit behind
//! traits: [`repo::SourceControl`], [`sandbox::SandboxProvider`] and
//! [`fixer::Fixer`].

pub mod callback;
pub mod criteria;
pub mod engine;
pub mod execution;
pub mod fixer;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod repo;
pub mod sandbox;
pub mod static_check;
pub mod workspace;

#[cfg(test)]
pub mod testing;

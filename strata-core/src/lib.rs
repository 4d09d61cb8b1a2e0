//! Strata Core
//!
//! Core library for a declarative infrastructure tool: resolves resource
//! dependencies into a graph, plans the effects needed to converge recorded
//! state with the desired configuration, and applies them through providers

pub mod config;
pub mod differ;
pub mod effect;
pub mod error;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod plan;
pub mod provider;
pub mod refresh;
pub mod resource;
pub mod snapshot;

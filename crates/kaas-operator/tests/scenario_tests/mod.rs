//! Scenario tests for the control plane
//!
//! # Test Organization
//!
//! - `workspace_lifecycle`: creating, resizing, failing and tearing down
//!   workspaces
//! - `projects`: root and child projects and the rules around deleting them
//! - `identity`: group flattening, tenant kubeconfigs and group re-parenting
//! - `tasks`: listing failed tasks and putting them back in the queue
//!
//! `fakes` holds the in-memory host and virtual clusters; `harness` wires
//! them into a control plane.

mod fakes;
mod harness;
mod identity;
mod projects;
mod tasks;
mod workspace_lifecycle;

//! End-to-end scenarios for the control plane
//!
//! These tests drive the fully assembled control plane (facade, task engine,
//! lifecycle, hierarchy and identity) against in-memory fakes of the host
//! cluster and the workspace virtual clusters. Tasks are executed one step at
//! a time with `TaskEngine::run_once`, so every intermediate state can be
//! observed.

mod scenario_tests;

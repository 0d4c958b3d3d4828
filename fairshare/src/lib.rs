/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! fairshare – flow-level resource sharing for simulators
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── lmm/        – linear max-min System and its solvers
//! ├── resource/   – actions, model plumbing, routing, factor curves
//! ├── models/     – CPU, network, disk, parallel task and stream models
//! ├── engine      – simulated clock and resource event queue
//! └── config/     – YAML solver configuration and scenario files
//! ```

pub mod config;
pub mod engine;
pub mod lmm;
pub mod models;
pub mod resource;

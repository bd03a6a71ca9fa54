// Copyright 2024-2026 CloudControl Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommands for the device-access core.
//!
//! ## Usage
//!
//! ```bash
//! cloudctl-core-cli config show        # Effective configuration
//! cloudctl-core-cli config validate    # Exit 1 on suspicious settings
//! cloudctl-core-cli simulate --devices 1200 --max-size 1000 --viewers 5
//! ```

pub mod config_cmd;
pub mod simulate_cmd;

pub use simulate_cmd::{run_simulate, simulate, SimulateOptions, SimulationReport};

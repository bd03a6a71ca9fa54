// Copyright 2024-2026 CloudControl Contributors
// SPDX-License-Identifier: Apache-2.0

//! `simulate` subcommand: capacity and coalescing scenarios on mock devices.
//!
//! Connects `--devices` mock devices into a registry capped at `--max-size`,
//! then has `--viewers` concurrent callers request the same screenshot.
//! Prints the resulting stats as JSON.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;

use crate::agent::{MockBehavior, MockConnector};
use crate::directory::{DeviceRecord, MemoryDirectory};
use crate::error::DeviceError;
use crate::pool::RegistryConfig;
use crate::scheduler::CacheStatus;
use crate::service::{DeviceService, ServiceConfig, ServiceStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulateOptions {
    pub devices: usize,
    pub max_size: usize,
    pub viewers: usize,
}

impl Default for SimulateOptions {
    fn default() -> Self {
        Self {
            devices: 1200,
            max_size: 1000,
            viewers: 5,
        }
    }
}

impl SimulateOptions {
    /// Parse `--devices N --max-size M --viewers V` (any order, all optional).
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let mut options = Self::default();
        let mut iter = args.iter();
        while let Some(flag) = iter.next() {
            let target = match flag.as_str() {
                "--devices" => &mut options.devices,
                "--max-size" => &mut options.max_size,
                "--viewers" => &mut options.viewers,
                other => return Err(format!("unknown option: {other}")),
            };
            let value = iter
                .next()
                .ok_or_else(|| format!("{flag} requires a value"))?;
            *target = value
                .parse::<usize>()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| format!("{flag}: expected a positive integer, got {value:?}"))?;
        }
        Ok(options)
    }
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub devices: usize,
    pub max_size: usize,
    pub pool_size: usize,
    pub first_device_evicted: bool,
    pub viewer_statuses: Vec<CacheStatus>,
    pub captures: usize,
    pub stats: ServiceStats,
}

pub async fn simulate(options: &SimulateOptions) -> Result<SimulationReport, DeviceError> {
    let ids: Vec<String> = (0..options.devices).map(|i| format!("sim-{i:05}")).collect();
    let directory = Arc::new(MemoryDirectory::with_records(
        ids.iter().map(|id| DeviceRecord::mock(id.clone())),
    ));
    let connector = Arc::new(MockConnector::new(MockBehavior::default()));
    let config = ServiceConfig {
        registry: RegistryConfig {
            max_size: options.max_size,
            ..RegistryConfig::default()
        },
        ..ServiceConfig::default()
    };
    let service = DeviceService::new(config, directory, connector.clone())?;

    for id in &ids {
        service.registry().acquire(id).await?;
    }
    let pool_size = service.registry().len();
    let first_device_evicted = !service.registry().contains(&ids[0]);

    let target = &ids[ids.len() - 1];
    let results = join_all((0..options.viewers).map(|_| service.screenshot(target, 40, 0.4))).await;
    let mut viewer_statuses = Vec::with_capacity(results.len());
    for result in results {
        viewer_statuses.push(result?.1);
    }
    let captures = connector.agent(target).map_or(0, |a| a.capture_count());

    let stats = service.stats();
    service.stop().await;

    Ok(SimulationReport {
        devices: options.devices,
        max_size: options.max_size,
        pool_size,
        first_device_evicted,
        viewer_statuses,
        captures,
        stats,
    })
}

/// Run the simulation and print its report. Returns the process exit code.
pub async fn run_simulate(args: &[String]) -> i32 {
    let options = match SimulateOptions::parse(args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("simulate: {e}");
            return 2;
        }
    };

    let report = match simulate(&options).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("simulate failed: {e}");
            return 1;
        }
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => {
            println!("{json}");
            0
        }
        Err(e) => {
            eprintln!("simulate: cannot render report: {e}");
            1
        }
    }
}

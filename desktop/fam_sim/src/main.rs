/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use clap::Parser;
use env_logger::{Builder, Env};
use fam_alloc::{
    modules::backing_store::BackingStoreModule, AllocationHint, ClientId, Clock, FamConfig,
    FamService, LeaseToken, RegionId, Request, Response, ServiceStats, Status, SystemClock,
};
use log::{debug, info, warn, LevelFilter};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "fam_sim",
    about = "Run simulated clients against a FAM region allocator and check that every byte comes back."
)]
struct Args {
    /// Number of client threads
    #[arg(long, default_value_t = 8)]
    clients: u64,

    /// Requests each client sends
    #[arg(long, default_value_t = 400)]
    operations: usize,

    /// Seed for all client decisions
    #[arg(long, default_value_t = 0x00fa_5eed)]
    seed: u64,

    /// Fraction of clients that vanish without releasing anything
    #[arg(long, value_name = "RATIO", default_value_t = 0.25)]
    crash_ratio: f64,

    /// Backing store size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 16 * 1024 * 1024)]
    capacity: u64,

    /// Largest region a client asks for
    #[arg(long, value_name = "BYTES", default_value_t = 256 * 1024)]
    max_region: u64,

    /// Service configuration (JSON), flags above override its capacity
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Back the store with 2 MiB pages
    #[arg(long, action = clap::ArgAction::SetTrue)]
    huge_pages: bool,

    #[arg(long, default_value_t = LevelFilter::Warn)]
    log_level: LevelFilter,
}

#[derive(Debug, Default, Serialize)]
struct ClientReport {
    crashed: bool,
    requests: usize,
    statuses: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
struct Summary {
    seed: u64,
    clients: u64,
    crashed_clients: usize,
    requests: usize,
    statuses: BTreeMap<String, usize>,
    reclaimed_after_ms: u128,
    leaked_bytes: u64,
    stats: ServiceStats,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    Builder::from_env(Env::default())
        .filter_level(args.log_level)
        .format_module_path(false)
        .init();

    let mut config = match &args.config {
        Some(path) => FamConfig::from_json_file(path)?,
        None => simulation_config(),
    };
    config.capacity = args.capacity;
    config.huge_pages |= args.huge_pages;

    if !(0.0..=1.0).contains(&args.crash_ratio) {
        bail!("--crash-ratio has to be between 0 and 1, got {}", args.crash_ratio);
    }
    if args.max_region == 0 {
        bail!("--max-region must not be zero");
    }

    #[cfg(feature = "mmap")]
    let store = fam_alloc::modules::backing_store::MmapBackingStore::new(config.capacity, config.huge_pages)
        .context("could not map the backing store")?;
    #[cfg(not(feature = "mmap"))]
    let store = fam_alloc::modules::backing_store::ExtentBackingStore::new(config.capacity);

    let summary = run(&args, config, store)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.leaked_bytes > 0 || summary.stats.engine.regions > 0 {
        bail!(
            "{} bytes in {} region(s) were not reclaimed",
            summary.leaked_bytes,
            summary.stats.engine.regions
        );
    }
    Ok(())
}

/// Short timeouts so crashed clients are reclaimed within a second
fn simulation_config() -> FamConfig {
    FamConfig {
        lease_duration_ms: 500,
        max_lease_duration_ms: 2_000,
        heartbeat_timeout_ms: 300,
        sweep_interval_ms: 20,
        expired_token_retention_ms: 1_000,
        ..Default::default()
    }
}

fn run<B: BackingStoreModule + 'static>(
    args: &Args,
    config: FamConfig,
    store: B,
) -> anyhow::Result<Summary> {
    let service = Arc::new(FamService::new(config, store).context("could not start the service")?);
    let capacity = service.engine().capacity();
    let monitor = service.spawn_monitor().context("could not start the monitor")?;
    let newest_region = AtomicU64::new(0);

    info!("running {} clients with seed {:#x}", args.clients, args.seed);

    let reports: Vec<ClientReport> = thread::scope(|s| {
        let handles: Vec<_> = (0..args.clients)
            .map(|i| {
                let service = &service;
                let newest_region = &newest_region;
                s.spawn(move || run_client(service, args, ClientId::from_raw(i + 1), newest_region))
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_default())
            .collect()
    });

    // crashed clients are only noticed once their heartbeat times out
    let started = Instant::now();
    let patience = Duration::from_millis(
        20 * (service.config().heartbeat_timeout_ms + service.config().lease_duration_ms),
    );
    loop {
        let stats = service.stats();
        if stats.engine.regions == 0 && stats.engine.free_bytes == capacity {
            break;
        }
        if started.elapsed() > patience {
            warn!("gave up waiting for reclamation: {:?}", stats);
            break;
        }
        thread::sleep(Duration::from_millis(service.config().sweep_interval_ms));
    }
    let reclaimed_after_ms = started.elapsed().as_millis();

    monitor.stop();

    let mut statuses = BTreeMap::new();
    for report in &reports {
        for (status, count) in &report.statuses {
            *statuses.entry(status.clone()).or_insert(0) += count;
        }
    }

    let stats = service.stats();
    Ok(Summary {
        seed: args.seed,
        clients: args.clients,
        crashed_clients: reports.iter().filter(|report| report.crashed).count(),
        requests: reports.iter().map(|report| report.requests).sum(),
        statuses,
        reclaimed_after_ms,
        leaked_bytes: capacity - stats.engine.free_bytes,
        stats,
    })
}

/// Sends a request the way a remote client would, encoded as JSON and back
fn call<B: BackingStoreModule>(
    service: &FamService<B>,
    request: &Request,
    report: &mut ClientReport,
) -> Response {
    let response = serde_json::to_string(request)
        .and_then(|wire| serde_json::from_str::<Request>(&wire))
        .map(|request| service.handle(request))
        .and_then(|response| serde_json::to_string(&response))
        .and_then(|wire| serde_json::from_str::<Response>(&wire));

    let response = match response {
        Ok(response) => response,
        Err(err) => Response {
            status: Status::Internal,
            region_id: None,
            lease_token: None,
            message: Some(format!("encoding failed: {}", err)),
        },
    };

    report.requests += 1;
    *report.statuses.entry(format!("{:?}", response.status)).or_insert(0) += 1;
    response
}

fn run_client<B: BackingStoreModule>(
    service: &FamService<B>,
    args: &Args,
    client: ClientId,
    newest_region: &AtomicU64,
) -> ClientReport {
    let mut rng = SmallRng::seed_from_u64(args.seed ^ client.get().wrapping_mul(0x9e37_79b9_7f4a_7c15));
    let crash_at = rng
        .gen_bool(args.crash_ratio)
        .then(|| rng.gen_range(0..args.operations.max(1)));

    let mut report = ClientReport::default();
    let mut owned: Vec<RegionId> = Vec::new();
    let mut leases: Vec<LeaseToken> = Vec::new();

    for step in 0..args.operations {
        if crash_at == Some(step) {
            debug!("client {} crashes holding {} region(s) and {} lease(s)", client, owned.len(), leases.len());
            report.crashed = true;
            return report;
        }

        let request = match rng.gen_range(0..10) {
            0..=2 => Request::Allocate {
                length: rng.gen_range(1..=args.max_region) as i64,
                client_id: client,
                hint: if rng.gen_bool(0.5) {
                    AllocationHint::SpaceEfficient
                } else {
                    AllocationHint::None
                },
            },
            3 | 4 if !owned.is_empty() => Request::Free {
                region_id: owned.swap_remove(rng.gen_range(0..owned.len())),
                client_id: client,
            },
            5 | 6 => Request::Attach {
                region_id: RegionId::from_raw(rng.gen_range(1..=newest_region.load(Ordering::Relaxed).max(1))),
                client_id: client,
            },
            7 if !leases.is_empty() => Request::Detach {
                lease_token: leases.swap_remove(rng.gen_range(0..leases.len())).to_string(),
            },
            8 if !leases.is_empty() => Request::Renew {
                lease_token: leases[rng.gen_range(0..leases.len())].to_string(),
                new_deadline: SystemClock.now_ms() + service.config().lease_duration_ms,
            },
            _ => Request::Heartbeat { client_id: client },
        };

        let response = call(service, &request, &mut report);
        match (&request, response.status) {
            (Request::Allocate { .. }, Status::Ok) => {
                if let Some(region) = response.region_id {
                    newest_region.fetch_max(region.get(), Ordering::Relaxed);
                    owned.push(region);
                }
            }
            (Request::Attach { .. }, Status::Ok) => {
                if let Some(token) = response.lease_token {
                    if !leases.contains(&token) {
                        leases.push(token);
                    }
                }
            }
            (Request::Renew { lease_token, .. }, Status::Expired | Status::NotFound) => {
                leases.retain(|token| token.to_string() != *lease_token);
            }
            _ => {}
        }

        call(service, &Request::Heartbeat { client_id: client }, &mut report);
    }

    // orderly shutdown
    for token in leases {
        call(service, &Request::Detach { lease_token: token.to_string() }, &mut report);
    }
    for region in owned {
        call(service, &Request::Free { region_id: region, client_id: client }, &mut report);
    }

    report
}

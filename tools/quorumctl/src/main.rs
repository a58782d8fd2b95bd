// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! quorumctl - operate a quorumdb replica.
//!
//! ```text
//! quorumctl format --cluster <id> --replica <index> --replica-count <n> [--standby-count <n>] <file>
//! quorumctl start  --replica <index> --cluster <id> --addresses <a:p,b:p,...> [--standby-count <n>] <file>
//! ```
//!
//! Exit codes: 0 clean shutdown, 1 invalid arguments, 2 unrecoverable
//! corruption, 3 restart requested with a different release.

use std::process::ExitCode;
use std::time::Duration;

use quorumdb::bus::{ReplicaAddresses, UdpBus};
use quorumdb::config::Options;
use quorumdb::storage::FileStorage;
use quorumdb::{Accumulator, Error, Replica};

const TICK: Duration = Duration::from_millis(10);

fn main() -> ExitCode {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        usage();
        return ExitCode::from(1);
    }
    match args[1].as_str() {
        "format" => cmd_format(&args[2..]),
        "start" => cmd_start(&args[2..]),
        other => {
            eprintln!("unknown command '{}'", other);
            usage();
            ExitCode::from(1)
        }
    }
}

fn usage() {
    eprintln!("usage:");
    eprintln!("  quorumctl format --cluster <id> --replica <i> --replica-count <n> [--standby-count <n>] <file>");
    eprintln!("  quorumctl start  --cluster <id> --replica <i> --addresses <a,b,c> [--standby-count <n>] <file>");
}

struct Parsed {
    cluster: Option<u64>,
    replica: Option<u8>,
    replica_count: Option<u8>,
    standby_count: u8,
    addresses: Option<String>,
    file: Option<String>,
}

fn parse(args: &[String]) -> Result<Parsed, String> {
    let mut parsed = Parsed {
        cluster: None,
        replica: None,
        replica_count: None,
        standby_count: 0,
        addresses: None,
        file: None,
    };
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        let mut value = |name: &str| -> Result<String, String> {
            i += 1;
            args.get(i).cloned().ok_or_else(|| format!("{} needs a value", name))
        };
        match arg.as_str() {
            "--cluster" => {
                let v = value("--cluster")?;
                parsed.cluster =
                    Some(v.parse().map_err(|_| format!("bad cluster id '{}'", v))?);
            }
            "--replica" => {
                let v = value("--replica")?;
                parsed.replica =
                    Some(v.parse().map_err(|_| format!("bad replica index '{}'", v))?);
            }
            "--replica-count" => {
                let v = value("--replica-count")?;
                parsed.replica_count =
                    Some(v.parse().map_err(|_| format!("bad replica count '{}'", v))?);
            }
            "--standby-count" => {
                let v = value("--standby-count")?;
                parsed.standby_count =
                    v.parse().map_err(|_| format!("bad standby count '{}'", v))?;
            }
            "--addresses" => parsed.addresses = Some(value("--addresses")?),
            other if other.starts_with("--") => {
                return Err(format!("unknown flag '{}'", other));
            }
            _ => {
                if parsed.file.is_some() {
                    return Err(format!("unexpected argument '{}'", arg));
                }
                parsed.file = Some(arg.clone());
            }
        }
        i += 1;
    }
    Ok(parsed)
}

fn cmd_format(args: &[String]) -> ExitCode {
    let parsed = match parse(args) {
        Ok(parsed) => parsed,
        Err(msg) => {
            eprintln!("{}", msg);
            return ExitCode::from(1);
        }
    };
    let (Some(cluster), Some(replica), Some(replica_count), Some(file)) =
        (parsed.cluster, parsed.replica, parsed.replica_count, parsed.file.as_deref())
    else {
        eprintln!("format needs --cluster, --replica, --replica-count, and a file");
        return ExitCode::from(1);
    };
    if replica_count == 0 || replica as usize >= usize::from(replica_count) + usize::from(parsed.standby_count) {
        eprintln!("replica index {} out of range", replica);
        return ExitCode::from(1);
    }

    let options = Options { cluster, replica, replica_count, standby_count: parsed.standby_count };
    let mut storage = match FileStorage::create(file) {
        Ok(storage) => storage,
        Err(err) => {
            eprintln!("cannot create {}: {}", file, err);
            return ExitCode::from(1);
        }
    };
    match Replica::<Accumulator>::format(&mut storage, &options) {
        Ok(()) => {
            println!("formatted {} for cluster {:#x} replica {}", file, cluster, replica);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("format failed: {}", err);
            ExitCode::from(2)
        }
    }
}

fn cmd_start(args: &[String]) -> ExitCode {
    let parsed = match parse(args) {
        Ok(parsed) => parsed,
        Err(msg) => {
            eprintln!("{}", msg);
            return ExitCode::from(1);
        }
    };
    let (Some(cluster), Some(replica), Some(addresses), Some(file)) =
        (parsed.cluster, parsed.replica, parsed.addresses.as_deref(), parsed.file.as_deref())
    else {
        eprintln!("start needs --cluster, --replica, --addresses, and a file");
        return ExitCode::from(1);
    };
    let addresses = match ReplicaAddresses::parse(addresses) {
        Ok(addresses) => addresses,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::from(1);
        }
    };
    let replica_count = match parsed.replica_count {
        Some(count) => count,
        // Addresses cover actives then standbys.
        None => (addresses.addresses.len() - usize::from(parsed.standby_count)) as u8,
    };

    let options = Options { cluster, replica, replica_count, standby_count: parsed.standby_count };
    let storage = match FileStorage::open(file) {
        Ok(storage) => storage,
        Err(err) => {
            eprintln!("cannot open {}: {}", file, err);
            return exit_for(&err);
        }
    };
    let mut process = match Replica::open(Box::new(storage), options, Accumulator::new()) {
        Ok(process) => process,
        Err(err) => {
            eprintln!("cannot start replica: {}", err);
            return exit_for(&err);
        }
    };
    let bus = match UdpBus::bind(cluster, replica, addresses) {
        Ok(bus) => bus,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::from(1);
        }
    };

    log::info!("replica {} running (view {})", replica, process.view());
    let err = bus.run(&mut process, TICK);
    eprintln!("replica stopped: {}", err);
    exit_for(&err)
}

fn exit_for(err: &Error) -> ExitCode {
    match err {
        Error::ReleaseNotBundled(_) => ExitCode::from(3),
        Error::SuperblockCorrupt | Error::WalCorrupt { .. } => ExitCode::from(2),
        _ => ExitCode::from(2),
    }
}

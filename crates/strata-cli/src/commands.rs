use anyhow::Context;
use colored::Colorize;
use serde_json::json;
use strata_engine::{
    ContainerOptions, Dispatch, EpochRef, LoopbackService, LoopbackTransport, RequestHandle,
    Runtime, RuntimeConfig, Submitted,
};
use strata_protocol::OpKind;
use strata_types::{IdAllocator, ObjectClass, RankInfo, Version};

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Ids(args) => cmd_ids(args, cli.format),
        Command::Config(args) => cmd_config(args, cli.format),
        Command::Simulate(args) => cmd_simulate(args, cli.format),
    }
}

fn cmd_ids(args: IdsArgs, format: OutputFormat) -> anyhow::Result<()> {
    let class: ObjectClass = args.class.parse()?;
    let mut rows = Vec::new();
    for rank in 0..args.ranks {
        let mut ids = IdAllocator::new(RankInfo::new(rank, args.ranks)?);
        for counter in 0..args.count {
            let id = ids.allocate(class)?;
            rows.push((rank, counter, id));
        }
    }
    match format {
        OutputFormat::Json => {
            let rows: Vec<_> = rows
                .iter()
                .map(|(rank, counter, id)| {
                    json!({ "rank": rank, "counter": counter, "slot": id.slot(), "id": id.to_hex() })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Text => {
            println!("{} ids across {} ranks", class.to_string().cyan(), args.ranks);
            for (rank, counter, id) in rows {
                println!(
                    "  rank {:>3}  counter {:>4}  slot {:>6}  {}",
                    rank,
                    counter,
                    id.slot(),
                    id.to_hex().yellow()
                );
            }
        }
    }
    Ok(())
}

fn cmd_config(args: ConfigArgs, format: OutputFormat) -> anyhow::Result<()> {
    let config = match &args.path {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    let rank = config.validate()?;
    if args.check {
        println!("{} rank {} of {}", "✓".green().bold(), rank.rank(), rank.rank_count());
        return Ok(());
    }
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Text => print!("{}", config.to_toml_string()?),
    }
    Ok(())
}

fn collect(rt: &mut Runtime<LoopbackTransport>, handles: &mut [RequestHandle]) -> anyhow::Result<usize> {
    let mut failed = 0;
    for h in handles.iter_mut() {
        if !rt.wait(h)?.succeeded() {
            failed += 1;
        }
    }
    Ok(failed)
}

fn pending(submitted: Submitted) -> Option<RequestHandle> {
    submitted.into_handle()
}

/// Every rank joins transaction 1 in one shared container, creates groups,
/// writes to each, and finishes. Rank 0 publishes and reads back.
fn cmd_simulate(args: SimulateArgs, format: OutputFormat) -> anyhow::Result<()> {
    anyhow::ensure!(args.ranks > 0, "at least one rank is required");
    let seed = args.seed.unwrap_or_else(rand::random);
    let base = match &args.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    let service = LoopbackService::with_seed(seed);
    let mut ranks = (0..args.ranks)
        .map(|rank| {
            let config = RuntimeConfig {
                rank,
                rank_count: args.ranks,
                ..base.clone()
            };
            Runtime::new(config, service.transport(rank))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut containers = Vec::new();
    for (rank, rt) in ranks.iter_mut().enumerate() {
        let issued = if rank == 0 {
            rt.container_create("sim", ContainerOptions::default(), Dispatch::Blocking)?
        } else {
            rt.container_open("sim", ContainerOptions::default(), Dispatch::Blocking)?
        };
        containers.push(issued.value);
    }

    let number = Version::new(1);
    let mut txns = Vec::new();
    let mut handles: Vec<Vec<RequestHandle>> = Vec::new();
    for (rank, rt) in ranks.iter_mut().enumerate() {
        let c = containers[rank];
        let root = rt.root(c)?;
        let t = rt.transaction_create(c, number)?;
        let mut mine: Vec<RequestHandle> = pending(rt.transaction_start(t, None, Dispatch::Async)?)
            .into_iter()
            .collect();
        let epoch = Some(EpochRef::Transaction(t));
        for i in 0..args.objects {
            let (g, request) = rt
                .object_create(root, OpKind::GroupCreate, &format!("r{rank}-g{i}"), t, Dispatch::Async)?
                .into_parts();
            mine.extend(pending(request));
            for w in 0..args.writes {
                let payload = format!("rank {rank} group {i} write {w}").into_bytes();
                mine.extend(pending(rt.object_op(g, OpKind::AttributeWrite, epoch, payload, Dispatch::Async)?));
            }
        }
        txns.push(t);
        handles.push(mine);
    }

    let mut published = None;
    for (rank, rt) in ranks.iter_mut().enumerate() {
        let (rc, request) = rt
            .transaction_finish(txns[rank], rank == 0, Dispatch::Async)?
            .into_parts();
        handles[rank].extend(pending(request));
        if rank == 0 {
            published = rc;
        }
    }

    let mut failed = 0;
    for (rt, mine) in ranks.iter_mut().zip(handles.iter_mut()) {
        failed += collect(rt, mine)?;
    }

    let mut visible = None;
    if let (Some(rc), Some(rt)) = (published, ranks.first_mut()) {
        visible = rt.read_context_version(rc)?;
        rt.read_context_release(rc, Dispatch::Blocking)?;
    }
    for (rank, rt) in ranks.iter_mut().enumerate() {
        rt.transaction_close(txns[rank])?;
        rt.container_close(containers[rank])?;
    }

    let stats: Vec<_> = ranks.iter().map(|rt| rt.stats()).collect();
    let executed = service.log().len();
    match format {
        OutputFormat::Json => {
            let report = json!({
                "seed": seed,
                "ranks": args.ranks,
                "executed": executed,
                "failed": failed,
                "published": visible.map(|v| v.as_u64()),
                "watermarks": service.watermarks("sim"),
                "stats": stats,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            let status = if failed == 0 { "✓".green().bold() } else { "✗".red().bold() };
            println!(
                "{} {} requests executed across {} ranks (seed {})",
                status,
                executed,
                args.ranks,
                seed.to_string().cyan()
            );
            if failed > 0 {
                println!("  {} requests failed", failed.to_string().red());
            }
            match visible {
                Some(v) => println!("  Published: {}", v.to_string().yellow()),
                None => println!("  Published: {}", "none".dimmed()),
            }
            for (rank, s) in stats.iter().enumerate() {
                println!(
                    "  rank {}: allocated {} freed {} swept {} live {} low-water {}",
                    rank, s.allocated, s.freed, s.swept, s.live_requests, s.low_water_mark
                );
            }
        }
    }
    anyhow::ensure!(failed == 0, "{failed} requests failed");
    Ok(())
}

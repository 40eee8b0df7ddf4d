use std::{collections::HashMap, env, time::Duration};

use color_eyre::eyre::{self, bail, OptionExt};
use itertools::{Itertools, MinMaxResult};
use satprop::{
    backend::{Backend, Channel, PropagateRequest, Request, Response, Subject, TaskPool},
    config::{Scenario, Settings},
    propagation::Sampling,
    satellite::{SatelliteId, TrajectorySample},
    sim::Simulation,
    soi::SoiEvent,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const USAGE: &str = "usage: satprop <scenario.ron> [--settings settings.toml] \
                     [--duration seconds] [--step seconds] [--sim wall-seconds]";

struct Args {
    scenario: String,
    settings: Option<String>,
    duration: f64,
    step: f64,
    sim: Option<f64>,
}

fn parse_args() -> eyre::Result<Args> {
    let mut args = env::args().skip(1);
    let mut out = Args {
        scenario: String::new(),
        settings: None,
        duration: 86_400.0,
        step: 60.0,
        sim: None,
    };
    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().ok_or_eyre(format!("{name} needs a value"));
        match arg.as_str() {
            "--settings" => out.settings = Some(value("--settings")?),
            "--duration" => out.duration = value("--duration")?.parse()?,
            "--step" => out.step = value("--step")?.parse()?,
            "--sim" => out.sim = Some(value("--sim")?.parse()?),
            "-h" | "--help" => bail!(USAGE),
            _ if out.scenario.is_empty() => out.scenario = arg,
            _ => bail!("unexpected argument {arg:?}\n{USAGE}"),
        }
    }
    if out.scenario.is_empty() {
        bail!(USAGE);
    }
    Ok(out)
}

#[derive(Default)]
struct Summary {
    samples: Vec<TrajectorySample>,
    transitions: Vec<SoiEvent>,
    error: Option<String>,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = parse_args()?;
    let settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let scenario = Scenario::load(&args.scenario)?;
    let (system, satellites) = scenario.build()?;
    let names = satellites
        .iter()
        .map(|s| (s.id, s.name.clone()))
        .collect::<HashMap<SatelliteId, String>>();

    let mut backend = Backend::spawn(TaskPool::new(settings.worker_count())?)?;
    backend.send(Request::Init {
        system: system.clone(),
        settings: settings.propagation.clone(),
    })?;

    let mut pending = HashMap::new();
    for sat in &satellites {
        let sequence = backend.next_sequence(sat.id);
        backend.send(Request::Propagate(PropagateRequest {
            subject: sat.id,
            satellite: sat.clone(),
            start: system.epoch,
            duration: args.duration,
            sampling: Sampling::Step(args.step),
            perturbation_scale: None,
            sequence,
            packed: true,
        }))?;
        pending.insert(Subject::new(sat.id, Channel::Trajectory), Summary::default());
    }

    let mut done = HashMap::new();
    while !pending.is_empty() {
        match backend.recv()? {
            Response::Initialized => info!("backend ready"),
            Response::Update {
                subject,
                points,
                transitions,
                done: finished,
                ..
            } => {
                let summary = pending.get_mut(&subject).ok_or_eyre("unknown subject")?;
                summary.samples.extend(points.to_samples());
                summary.transitions.extend(transitions);
                if finished {
                    if let Some(summary) = pending.remove(&subject) {
                        done.insert(subject.satellite, summary);
                    }
                }
            }
            Response::Error {
                subject: Some(subject),
                message,
                ..
            } => {
                if let Some(mut summary) = pending.remove(&subject) {
                    summary.error = Some(message);
                    done.insert(subject.satellite, summary);
                }
            }
            Response::Error { message, .. } => bail!(message),
            _ => {}
        }
    }

    for (id, summary) in done.iter().sorted_by_key(|(id, _)| **id) {
        let name = names.get(id).map_or("", String::as_str);
        println!("{id} {name}");
        if let Some(err) = &summary.error {
            println!("  failed: {err}");
        }
        let radii = summary.samples.iter().map(|s| s.position.norm());
        if let MinMaxResult::MinMax(lo, hi) | MinMaxResult::OneElement(lo @ hi) =
            radii.minmax_by(f64::total_cmp)
        {
            println!("  radius {lo:.1} .. {hi:.1} km");
        }
        if let Some(last) = summary.samples.last() {
            println!(
                "  {} samples, last at {:.0} s around body {}",
                summary.samples.len(),
                last.offset,
                last.central
            );
        }
        for t in &summary.transitions {
            println!("  {:?} {} -> {} at {:.0} s", t.kind, t.from, t.to, t.offset);
        }
    }
    backend.shutdown()?;

    if let Some(wall) = args.sim {
        let mut sim = Simulation::new(system, satellites).with_settings(settings.sim);
        sim.propagation = settings.propagation;
        let mut reported = 0.0;
        let mut simulated = 0.0;
        sim.run_for(Duration::from_secs_f64(wall), |sim, tick| {
            simulated += tick.simulated;
            for (id, event) in &tick.transitions {
                info!(satellite = %id, from = %event.from, to = %event.to, "soi change");
            }
            for failure in &tick.failures {
                warn!(satellite = %failure.satellite, error = %failure.error, "satellite dropped");
            }
            if simulated - reported >= sim.settings.warp {
                reported = simulated;
                for (id, sat) in sim.satellites.iter() {
                    println!(
                        "{} {id}: r = {:.1} km around {}",
                        sim.epoch(),
                        sat.position.norm(),
                        sat.central
                    );
                }
            }
        })?;
        if simulated == 0.0 {
            warn!("simulation did not advance");
        }
    }
    Ok(())
}

//! Launch and drive a training run.

use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Instant;

use burn::optim::AdamConfig;
use collective::{CollectiveError, Communicator, LaunchEnv, LocalGroup, LocalMember, Solo};
use placerec::backend::{device_for_rank, AutodiffTrainBackend};
use placerec::training::trainer::TrainError;
use placerec::{EpochReport, TrainingSession, TripletNet};

use crate::config::{load_experiment_toml, CliOverrides, Experiment};

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    /// Path to the experiment config TOML file.
    pub config: PathBuf,
    pub overrides: CliOverrides,
    /// Run this many ranks as threads of the current process.
    pub spawn_workers: Option<usize>,
}

/// Arguments for the `inspect-config` subcommand.
#[derive(Debug)]
pub struct InspectArgs {
    pub config: PathBuf,
    pub overrides: CliOverrides,
}

/// How the ranks of this run are brought up.
#[derive(Debug, Clone, PartialEq)]
pub enum Launch {
    /// One rank, no peers.
    Solo,
    /// This process is one rank of a launcher-started job.
    Env(LaunchEnv),
    /// `n` ranks as threads joined in process.
    Spawn(usize),
}

impl Launch {
    pub fn select(env: Option<LaunchEnv>, spawn_workers: Option<usize>) -> anyhow::Result<Self> {
        match (env, spawn_workers) {
            (Some(_), Some(_)) => anyhow::bail!(
                "--spawn-workers cannot be combined with a launcher environment (WORLD_SIZE is set)"
            ),
            (Some(env), None) => Ok(Launch::Env(env)),
            (None, Some(0)) => anyhow::bail!("--spawn-workers must be at least 1"),
            (None, Some(1)) | (None, None) => Ok(Launch::Solo),
            (None, Some(n)) => Ok(Launch::Spawn(n)),
        }
    }

    /// Index into `gpu_ids` for `rank`. A launcher job may span hosts, so its
    /// ranks pick devices by their rank on this host.
    pub fn device_slot(&self, rank: usize) -> usize {
        match self {
            Launch::Env(env) => env.local_rank,
            Launch::Solo | Launch::Spawn(_) => rank,
        }
    }
}

fn load(config: &std::path::Path, overrides: &CliOverrides) -> anyhow::Result<Experiment> {
    let mut toml = load_experiment_toml(config)?;
    overrides.apply(&mut toml);
    Experiment::resolve(toml)
}

/// Print the merged configuration as TOML.
pub fn run_inspect(args: InspectArgs) -> anyhow::Result<()> {
    let experiment = load(&args.config, &args.overrides)?;
    print!("{}", toml::to_string_pretty(&experiment.toml)?);
    println!("# embedding_dim = {}", experiment.embed.embedding_dim());
    Ok(())
}

/// Train with the configured launch mode. Returns rank 0's epoch reports.
pub fn run_train(args: TrainArgs) -> anyhow::Result<Vec<EpochReport>> {
    let start = Instant::now();
    let experiment = Arc::new(load(&args.config, &args.overrides)?);
    let launch = Launch::select(LaunchEnv::from_env()?, args.spawn_workers)?;
    tracing::info!(?launch, "Starting training");

    let reports = match launch {
        Launch::Solo => run_rank(&experiment, Arc::new(Solo), 0)?,
        Launch::Env(ref env) => {
            tracing::info!(
                rank = env.rank,
                local_rank = env.local_rank,
                world_size = env.world_size,
                master = %env.master_endpoint(),
                "Joining process group"
            );
            let comm = env.connect(experiment.connect_timeout())?;
            run_rank(&experiment, comm, launch.device_slot(env.rank))?
        }
        Launch::Spawn(n) => run_spawned(&experiment, n)?,
    };

    tracing::info!(
        epochs = reports.len(),
        elapsed_secs = format!("{:.1}", start.elapsed().as_secs_f64()),
        "Training finished"
    );
    Ok(reports)
}

fn run_spawned(experiment: &Arc<Experiment>, world_size: usize) -> anyhow::Result<Vec<EpochReport>> {
    anyhow::ensure!(
        experiment.gpu_ids().len() >= world_size,
        "{world_size} workers need {world_size} gpu ids, got {:?}",
        experiment.gpu_ids()
    );
    run_local_group(world_size, |member| {
        let slot = member.rank();
        run_rank(experiment, Arc::new(member), slot)
    })
}

/// Run `f` once per member of a fresh [`LocalGroup`], each on its own thread,
/// and return rank 0's result.
///
/// Results are taken in completion order. When a rank fails, its dropped
/// member makes its peers fail with `PeerDisconnected`; the error returned is
/// the first one that is not such a follow-on failure.
fn run_local_group<T, F>(world_size: usize, f: F) -> anyhow::Result<T>
where
    T: Send,
    F: Fn(LocalMember) -> anyhow::Result<T> + Sync,
{
    let (tx, rx) = mpsc::channel();
    std::thread::scope(|scope| {
        let f = &f;
        let mut handles = Vec::with_capacity(world_size);
        for member in LocalGroup::new(world_size) {
            let rank = member.rank();
            let tx = tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn_scoped(scope, move || {
                    let result = f(member);
                    // the receiver outlives every sender
                    let _ = tx.send((rank, result));
                })
                .map_err(|e| anyhow::anyhow!("Failed to spawn rank {rank}: {e}"))?;
            handles.push(handle);
        }
        drop(tx);

        let mut root = None;
        let mut cause: Option<anyhow::Error> = None;
        let mut follow_on: Option<anyhow::Error> = None;
        for (rank, result) in rx {
            match result {
                Ok(value) if rank == 0 => root = Some(value),
                Ok(_) => {}
                Err(e) if is_peer_disconnect(&e) => {
                    tracing::debug!(rank, error = %e, "Rank stopped after a peer failed");
                    if follow_on.is_none() {
                        follow_on = Some(e);
                    }
                }
                Err(e) => {
                    tracing::error!(rank, error = %e, "Rank failed");
                    if cause.is_none() {
                        cause = Some(e.context(format!("rank {rank} failed")));
                    }
                }
            }
        }

        // joined here so a panicking rank becomes an error instead of a scope panic
        let panicked = handles
            .into_iter()
            .map(|h| h.join())
            .filter(Result::is_err)
            .count();
        if let Some(e) = cause {
            return Err(e);
        }
        anyhow::ensure!(panicked == 0, "{panicked} of {world_size} ranks panicked");
        if let Some(e) = follow_on {
            return Err(e);
        }
        root.ok_or_else(|| anyhow::anyhow!("rank 0 produced no result"))
    })
}

fn is_peer_disconnect(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<CollectiveError>(),
            Some(CollectiveError::PeerDisconnected(_))
        ) || matches!(
            cause.downcast_ref::<TrainError>(),
            Some(TrainError::Collective(CollectiveError::PeerDisconnected(_)))
        )
    })
}

/// Run every epoch on one rank, on the device at `device_slot` of the
/// configured gpu ids. Rank 0 prints the per-epoch summary.
pub fn run_rank(
    experiment: &Experiment,
    comm: Arc<dyn Communicator>,
    device_slot: usize,
) -> anyhow::Result<Vec<EpochReport>> {
    let rank = comm.rank();
    let device = device_for_rank(experiment.gpu_ids(), device_slot)?;
    tracing::info!(rank, device_slot, device = ?device, "Rank bound to device");

    let model = experiment
        .embed
        .init_triplet::<AutodiffTrainBackend>(&device);
    let optimizer = AdamConfig::new()
        .with_epsilon(1e-8)
        .init::<AutodiffTrainBackend, TripletNet<AutodiffTrainBackend>>();

    let mut session = TrainingSession::new(
        experiment.training_config(),
        experiment.open_data()?,
        model,
        optimizer,
        comm,
        device,
    )?;

    let is_root = session.is_root();
    session.fit_with(|report| {
        if is_root {
            for line in report.console_lines() {
                println!("{line}");
            }
        }
        Ok(())
    })
}

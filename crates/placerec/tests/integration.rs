//! Integration tests for the placerec crate.
//!
//! These tests exercise cross-module interactions: place-folder dataset →
//! loader → NetVLAD model → triplet loss → data-parallel step → validation
//! and checkpoint output. All use the NdArray backend and small generated
//! images.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::optim::{adaptor::OptimizerAdaptor, Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::TensorData;
use collective::{Communicator, LocalGroup, Solo};
use image::{Rgb, RgbImage};

use placerec::data::DatasetOptions;
use placerec::model::backbone::ConvBackboneConfig;
use placerec::model::embed::{EmbedNetConfig, TripletNet};
use placerec::registry::{build_embed_config, AggregationOptions, DATASETS};
use placerec::training::loss::{pairwise_distance, TripletMarginLoss};
use placerec::training::replica::flatten_parameters;
use placerec::training::roc::RocAccumulator;
use placerec::training::trainer::{SessionData, TrainError, TrainingConfig, TrainingSession};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;
type TestOptimizer =
    OptimizerAdaptor<Adam, TripletNet<TestAutodiffBackend>, TestAutodiffBackend>;

const IMAGE_SIZE: u32 = 16;

/// Helper: `places` folders of `per_place` images; each place has its own tint.
fn write_places(root: &Path, places: usize, per_place: usize) {
    for p in 0..places {
        let dir = root.join(format!("place_{p:02}"));
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..per_place {
            let img = RgbImage::from_fn(IMAGE_SIZE + 4, IMAGE_SIZE, |x, y| {
                Rgb([
                    (p * 60 % 256) as u8,
                    ((x * 12 + i as u32 * 5) % 256) as u8,
                    ((y * 12) % 256) as u8,
                ])
            });
            img.save(dir.join(format!("{i}.png"))).unwrap();
        }
    }
}

fn tiny_model() -> EmbedNetConfig {
    EmbedNetConfig::new(ConvBackboneConfig::tiny()).with_num_clusters(4)
}

fn optimizer() -> TestOptimizer {
    AdamConfig::new()
        .with_epsilon(1e-8)
        .init::<TestAutodiffBackend, TripletNet<TestAutodiffBackend>>()
}

fn session_data(root: &Path) -> SessionData {
    let open = DATASETS.lookup("tokyo").unwrap();
    let opts = DatasetOptions::default();
    SessionData {
        train: Arc::from(open(&root.join("train"), &opts).unwrap()),
        test: Arc::from(open(&root.join("test"), &opts).unwrap()),
        image_width: IMAGE_SIZE,
        image_height: IMAGE_SIZE,
        flip_prob: 0.5,
    }
}

fn training_config(root: &Path, total_epoch: usize) -> TrainingConfig {
    TrainingConfig::new()
        .with_total_epoch(total_epoch)
        .with_batch_size(4)
        .with_learning_rate(1e-3)
        .with_backbone("tiny".to_string())
        .with_checkpoint_dir(root.join("ckpt").display().to_string())
        .with_visualization_dir(root.join("vis").display().to_string())
}

fn fixture() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    write_places(&tmp.path().join("train"), 4, 3);
    write_places(&tmp.path().join("test"), 3, 2);
    tmp
}

// ---------------------------------------------------------------------------
// Test 1: single-rank run writes checkpoints, plots and sane reports
// ---------------------------------------------------------------------------

#[test]
fn test_single_rank_fit_writes_outputs() {
    let tmp = fixture();
    let device = Default::default();
    let config = training_config(tmp.path(), 2);

    let mut session = TrainingSession::new(
        config,
        session_data(tmp.path()),
        tiny_model().init_triplet::<TestAutodiffBackend>(&device),
        optimizer(),
        Arc::new(Solo),
        device,
    )
    .unwrap();
    // 12 train triplets, batch size 4
    assert_eq!(session.train_batches(), 3);

    let mut printed = Vec::new();
    let reports = session
        .fit_with(|report| {
            printed.extend(report.console_lines());
            Ok(())
        })
        .unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(printed.len(), 10);
    assert!(printed[0].starts_with("[Epoch 1] Train loss "));
    for report in &reports {
        assert!(report.train_loss.is_finite());
        let v = &report.validation;
        assert!((0.0..=1.0).contains(&v.auc));
        assert!(v.dist_pos >= 0.0 && v.dist_neg >= 0.0);
        assert_eq!(v.curve.fpr.first(), Some(&0.0));
        assert_eq!(v.curve.tpr.last(), Some(&1.0));
    }

    let paths = session.checkpoint_paths();
    for epoch in 1..=2 {
        assert!(paths.model(epoch).exists(), "missing model for epoch {epoch}");
        assert!(paths.optimizer(epoch).exists());
        assert!(paths.meta(epoch).exists());
        assert!(session.roc_plot_path(epoch).exists());
    }
    assert!(paths
        .model(1)
        .ends_with("tiny_netvlad_checkpoint_e1.mpk"));
}

// ---------------------------------------------------------------------------
// Test 2: two in-process ranks stay in lockstep
// ---------------------------------------------------------------------------

#[test]
fn test_two_ranks_keep_identical_replicas() {
    let tmp = fixture();
    let root = tmp.path().to_path_buf();

    let handles: Vec<_> = LocalGroup::new(2)
        .into_iter()
        .map(|member| {
            let root = root.clone();
            std::thread::spawn(move || {
                let comm: Arc<dyn Communicator> = Arc::new(member);
                let rank = comm.rank();
                let device = Default::default();
                let mut config = training_config(&root, 1);
                // only rank 0 writes, but keep the directories apart anyway
                config.visualization_dir = root.join(format!("vis_{rank}")).display().to_string();

                let mut session = TrainingSession::new(
                    config,
                    session_data(&root),
                    tiny_model().init_triplet::<TestAutodiffBackend>(&device),
                    optimizer(),
                    comm,
                    device,
                )
                .unwrap();
                // 12 triplets over 2 ranks -> 6 each -> 2 batches of 4
                let batches = session.train_batches();
                session.fit().unwrap();
                (rank, batches, flatten_parameters(session.replica().module()).unwrap())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.iter().all(|(_, batches, _)| *batches == 2));
    assert_eq!(results[0].2, results[1].2, "replicas diverged");

    assert!(root.join("vis_0").join("roc_curve_e1.png").exists());
    assert!(!root.join("vis_1").exists(), "only rank 0 writes plots");
}

/// Adam that counts the steps it is asked to take.
struct CountingOptimizer {
    inner: TestOptimizer,
    steps: Arc<AtomicUsize>,
}

impl Optimizer<TripletNet<TestAutodiffBackend>, TestAutodiffBackend> for CountingOptimizer {
    type Record = <TestOptimizer as Optimizer<
        TripletNet<TestAutodiffBackend>,
        TestAutodiffBackend,
    >>::Record;

    fn step(
        &mut self,
        lr: f64,
        module: TripletNet<TestAutodiffBackend>,
        grads: GradientsParams,
    ) -> TripletNet<TestAutodiffBackend> {
        self.steps.fetch_add(1, Ordering::SeqCst);
        self.inner.step(lr, module, grads)
    }

    fn to_record(&self) -> Self::Record {
        self.inner.to_record()
    }

    fn load_record(self, record: Self::Record) -> Self {
        Self {
            inner: self.inner.load_record(record),
            steps: self.steps,
        }
    }
}

#[test]
fn test_every_rank_steps_once_per_batch_with_short_last_batch() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().to_path_buf();
    // places of 2 and 3 images -> 5 train triplets
    write_places(&root.join("train"), 2, 3);
    std::fs::remove_file(root.join("train/place_00/2.png")).unwrap();
    write_places(&root.join("test"), 2, 2);

    let handles: Vec<_> = LocalGroup::new(2)
        .into_iter()
        .map(|member| {
            let root = root.clone();
            std::thread::spawn(move || {
                let comm: Arc<dyn Communicator> = Arc::new(member);
                let rank = comm.rank();
                let device = Default::default();
                let steps = Arc::new(AtomicUsize::new(0));
                let mut config = training_config(&root, 1).with_batch_size(2);
                config.visualization_dir = root.join(format!("vis_{rank}")).display().to_string();

                let mut session = TrainingSession::new(
                    config,
                    session_data(&root),
                    tiny_model().init_triplet::<TestAutodiffBackend>(&device),
                    CountingOptimizer {
                        inner: optimizer(),
                        steps: Arc::clone(&steps),
                    },
                    comm,
                    device,
                )
                .unwrap();
                let planned = session.train_batches();
                session.set_epoch(1);
                session.train_epoch(1).unwrap();
                (planned, steps.load(Ordering::SeqCst))
            })
        })
        .collect();

    // 5 triplets pad to 3 per rank: a batch of 2, then a batch of 1
    for handle in handles {
        let (planned, taken) = handle.join().unwrap();
        assert_eq!(planned, 2);
        assert_eq!(taken, 2);
    }
}

#[test]
fn test_non_finite_loss_on_one_rank_stops_both() {
    let tmp = fixture();
    let root = tmp.path().to_path_buf();

    let handles: Vec<_> = LocalGroup::new(2)
        .into_iter()
        .map(|member| {
            let root = root.clone();
            std::thread::spawn(move || {
                let comm: Arc<dyn Communicator> = Arc::new(member);
                let rank = comm.rank();
                let device = Default::default();
                let mut config = training_config(&root, 1);
                if rank == 1 {
                    config.margin = f64::NAN;
                }
                let mut session = TrainingSession::new(
                    config,
                    session_data(&root),
                    tiny_model().init_triplet::<TestAutodiffBackend>(&device),
                    optimizer(),
                    comm,
                    device,
                )
                .unwrap();
                session.set_epoch(1);
                session.train_epoch(1).unwrap_err()
            })
        })
        .collect();

    for handle in handles {
        let err = handle.join().unwrap();
        assert!(
            matches!(
                err.downcast_ref::<TrainError>(),
                Some(TrainError::NonFiniteLoss { batch: 0, .. })
            ),
            "{err:#}"
        );
    }
}

// ---------------------------------------------------------------------------
// Test 3: resuming continues after the saved epoch
// ---------------------------------------------------------------------------

#[test]
fn test_resume_runs_remaining_epochs() {
    let tmp = fixture();
    let device: <TestAutodiffBackend as Backend>::Device = Default::default();

    let mut first = TrainingSession::new(
        training_config(tmp.path(), 1),
        session_data(tmp.path()),
        tiny_model().init_triplet::<TestAutodiffBackend>(&device),
        optimizer(),
        Arc::new(Solo),
        device,
    )
    .unwrap();
    first.fit().unwrap();
    let saved = flatten_parameters(first.replica().module()).unwrap();

    let mut resumed = TrainingSession::new(
        training_config(tmp.path(), 3).with_resume_epoch(Some(1)),
        session_data(tmp.path()),
        tiny_model().init_triplet::<TestAutodiffBackend>(&device),
        optimizer(),
        Arc::new(Solo),
        device,
    )
    .unwrap();
    assert_eq!(resumed.start_epoch(), 2);
    assert_eq!(flatten_parameters(resumed.replica().module()).unwrap(), saved);

    let reports = resumed.fit().unwrap();
    let epochs: Vec<usize> = reports.iter().map(|r| r.epoch).collect();
    assert_eq!(epochs, vec![2, 3]);
}

#[test]
fn test_resume_past_end_is_rejected() {
    let tmp = fixture();
    let device = Default::default();
    let result = TrainingSession::new(
        training_config(tmp.path(), 2).with_resume_epoch(Some(2)),
        session_data(tmp.path()),
        tiny_model().init_triplet::<TestAutodiffBackend>(&device),
        optimizer(),
        Arc::new(Solo),
        device,
    );
    assert!(result.is_err());
}

// ---------------------------------------------------------------------------
// Test 4: two-sample batch with hand-picked embeddings
// ---------------------------------------------------------------------------

#[test]
fn test_two_sample_embedding_scenario() {
    let device = Default::default();
    let rows = |r: [f32; 2]| {
        Tensor::<TestBackend, 2>::from_data(TensorData::from([r, r]), &device)
    };
    let anchor = rows([0.0, 0.0]);
    let positive = rows([0.0, 0.05]);
    let negative = rows([5.0, 5.0]);

    let d_pos: Vec<f32> = pairwise_distance(anchor.clone(), positive.clone())
        .into_data()
        .to_vec()
        .unwrap();
    let d_neg: Vec<f32> = pairwise_distance(anchor.clone(), negative.clone())
        .into_data()
        .to_vec()
        .unwrap();
    assert!(d_pos.iter().all(|d| (d - 0.05).abs() < 1e-4));
    assert!(d_neg.iter().all(|d| (d - 7.07).abs() < 1e-2));

    let loss: f32 = TripletMarginLoss::new(0.1)
        .forward(anchor, positive, negative)
        .into_scalar()
        .elem();
    assert_eq!(loss, 0.0);

    let mut roc = RocAccumulator::new();
    roc.extend_distances(
        &d_pos.iter().map(|&d| f64::from(d)).collect::<Vec<_>>(),
        &d_neg.iter().map(|&d| f64::from(d)).collect::<Vec<_>>(),
    );
    assert!((roc.curve().unwrap().auc() - 1.0).abs() < 1e-12);
}

// ---------------------------------------------------------------------------
// Test 5: registry-built network embeds generated images
// ---------------------------------------------------------------------------

#[test]
fn test_registry_model_embeds_images() {
    let opts = AggregationOptions {
        num_clusters: 5,
        alpha: 1.0,
        normalize_input: true,
    };
    let config = build_embed_config("tiny", "netvlad", &opts).unwrap();
    let device = Default::default();
    let net = config.init::<TestBackend>(&device);
    let images = Tensor::<TestBackend, 4>::ones([3, 3, IMAGE_SIZE as usize, IMAGE_SIZE as usize], &device);
    let out = net.forward(images);
    assert_eq!(out.dims(), [3, config.embedding_dim()]);
}

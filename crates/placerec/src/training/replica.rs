//! Data-parallel replica of the triplet network.
//!
//! Every rank holds a full copy of the model. [`DataParallel::new`] copies
//! rank 0's parameters to everyone, and [`DataParallel::backward`] averages
//! each parameter's gradient across ranks before it reaches the optimizer,
//! so identical updates keep the replicas identical.
//!
//! Parameters are visited in module field order, which is the same on every
//! rank; each parameter is one blocking collective call.

use std::sync::Arc;

use burn::module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use collective::{CollectiveError, Communicator};

use crate::model::embed::TripletNet;

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("failed to copy a parameter to the host: {0}")]
    HostCopy(String),
    #[error("parameter synchronization failed")]
    Collective(#[from] CollectiveError),
}

pub struct DataParallel<B: AutodiffBackend> {
    module: TripletNet<B>,
    comm: Arc<dyn Communicator>,
}

impl<B: AutodiffBackend> DataParallel<B> {
    /// Wrap a replica, overwriting its parameters with rank 0's.
    pub fn new(module: TripletNet<B>, comm: Arc<dyn Communicator>) -> Result<Self, ReplicaError> {
        let module = broadcast_module(module, comm.as_ref())?;
        tracing::debug!(
            rank = comm.rank(),
            world_size = comm.world_size(),
            checksum = parameter_checksum(&module)?,
            "Replica parameters synchronized"
        );
        Ok(Self { module, comm })
    }

    pub fn forward(
        &self,
        anchor: Tensor<B, 4>,
        positive: Tensor<B, 4>,
        negative: Tensor<B, 4>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
        self.module.forward(anchor, positive, negative)
    }

    /// Backpropagate `loss` and average the gradients across ranks.
    ///
    /// Gradients are built fresh from this loss, so nothing from an earlier
    /// step leaks in. A parameter that got no gradient on this rank joins the
    /// reduction with zeros so every rank issues the same collective calls.
    pub fn backward(&self, loss: Tensor<B, 1>) -> Result<GradientsParams, ReplicaError> {
        let mut grads = GradientsParams::from_grads(loss.backward(), &self.module);
        if self.comm.world_size() > 1 {
            let mut averager = GradientAverager::<B> {
                comm: self.comm.as_ref(),
                grads: &mut grads,
                error: None,
                _backend: std::marker::PhantomData,
            };
            self.module.visit(&mut averager);
            if let Some(e) = averager.error {
                return Err(e);
            }
        }
        Ok(grads)
    }

    /// Apply averaged gradients.
    pub fn step<O>(&mut self, optimizer: &mut O, lr: f64, grads: GradientsParams)
    where
        O: Optimizer<TripletNet<B>, B>,
    {
        self.module = optimizer.step(lr, self.module.clone(), grads);
    }

    pub fn module(&self) -> &TripletNet<B> {
        &self.module
    }

    /// Inference copy of the replica (no autodiff graph).
    pub fn valid(&self) -> TripletNet<B::InnerBackend> {
        self.module.valid()
    }

    pub fn communicator(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }
}

fn broadcast_module<B: Backend, M: Module<B>>(
    module: M,
    comm: &dyn Communicator,
) -> Result<M, ReplicaError> {
    if comm.world_size() == 1 {
        return Ok(module);
    }
    let mut broadcaster = ParameterBroadcaster {
        comm,
        error: None,
    };
    let module = module.map(&mut broadcaster);
    match broadcaster.error {
        Some(e) => Err(e),
        None => Ok(module),
    }
}

/// Replaces every float parameter with rank 0's value.
struct ParameterBroadcaster<'a> {
    comm: &'a dyn Communicator,
    error: Option<ReplicaError>,
}

impl<B: Backend> ModuleMapper<B> for ParameterBroadcaster<'_> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        if self.error.is_some() {
            return tensor;
        }
        let dims = tensor.dims();
        let device = tensor.device();
        let require_grad = tensor.is_require_grad();
        let mut values = match to_host(tensor.clone()) {
            Ok(values) => values,
            Err(e) => {
                self.error = Some(e);
                return tensor;
            }
        };
        if let Err(e) = self.comm.broadcast(&mut values, 0) {
            self.error = Some(e.into());
            return tensor;
        }
        Tensor::<B, D>::from_data(TensorData::new(values, dims), &device)
            .set_require_grad(require_grad)
    }
}

/// Replaces every gradient in `grads` with its cross-rank mean.
struct GradientAverager<'a, B: AutodiffBackend> {
    comm: &'a dyn Communicator,
    grads: &'a mut GradientsParams,
    error: Option<ReplicaError>,
    _backend: std::marker::PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientAverager<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if self.error.is_some() || !tensor.is_require_grad() {
            return;
        }
        let device = tensor.device();
        let dims = tensor.dims();
        let grad = self
            .grads
            .remove::<B::InnerBackend, D>(id)
            .unwrap_or_else(|| Tensor::zeros(dims, &device));

        let mut values = match to_host(grad) {
            Ok(values) => values,
            Err(e) => {
                self.error = Some(e);
                return;
            }
        };
        if let Err(e) = self.comm.all_reduce_mean(&mut values) {
            self.error = Some(e.into());
            return;
        }
        let averaged =
            Tensor::<B::InnerBackend, D>::from_data(TensorData::new(values, dims), &device);
        self.grads.register(id, averaged);
    }
}

fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>, ReplicaError> {
    data_to_host(tensor.into_data())
}

fn data_to_host(data: TensorData) -> Result<Vec<f32>, ReplicaError> {
    data.convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ReplicaError::HostCopy(format!("{e:?}")))
}

/// Every float parameter of `module`, flattened in visit order.
pub fn flatten_parameters<B: Backend, M: Module<B>>(module: &M) -> Result<Vec<f32>, ReplicaError> {
    struct Collect {
        values: Vec<f32>,
        error: Option<ReplicaError>,
    }
    impl<B: Backend> ModuleVisitor<B> for Collect {
        fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
            if self.error.is_some() {
                return;
            }
            match to_host(tensor.clone()) {
                Ok(values) => self.values.extend(values),
                Err(e) => self.error = Some(e),
            }
        }
    }
    let mut collect = Collect {
        values: Vec::new(),
        error: None,
    };
    module.visit(&mut collect);
    match collect.error {
        Some(e) => Err(e),
        None => Ok(collect.values),
    }
}

/// Order-sensitive sum used to compare replicas in logs.
fn parameter_checksum<B: Backend, M: Module<B>>(module: &M) -> Result<f64, ReplicaError> {
    Ok(flatten_parameters(module)?
        .iter()
        .enumerate()
        .map(|(i, v)| f64::from(*v) * ((i % 97) as f64 + 1.0))
        .sum())
}

//! Kernel registry and launch interface.
//!
//! Kernels are the compute functions tasks launch on a device. They are
//! registered by path (`module/name`) in a [`KernelRegistry`]. A task acquires
//! a [`Kernel`] handle for its node's device during init, configures the
//! launch geometry once with [`Kernel::setup_execution`], and runs it every
//! step with a positional argument list of device pointers and scalars.
//!
//! # Example
//!
//! ```ignore
//! let kernel = registry.acquire(device, "Transforms", "AbsoluteValueKernel")?;
//! kernel.setup_execution(count);
//! kernel.run(ctx, &[input.into(), output.into(), KernelArg::from(count)])?;
//! ```

use std::fmt;
use std::sync::Arc;

use brainflow_foundation::{DeviceId, Element};
use indexmap::IndexMap;
use tracing::trace;

use crate::device::{DevicePtr, ExecutionContext};
use crate::error::{Error, Result};

/// Threads per block used when a launch is configured from an element count.
pub const MAX_BLOCK_DIM: usize = 256;

/// Signature of a kernel body.
pub type KernelFn = Arc<dyn Fn(&mut KernelInvocation<'_>) -> Result<()> + Send + Sync>;

/// One positional launch argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(DevicePtr),
    Float(f32),
    Int(i64),
}

impl From<DevicePtr> for KernelArg {
    fn from(ptr: DevicePtr) -> Self {
        KernelArg::Buffer(ptr)
    }
}

impl From<f32> for KernelArg {
    fn from(value: f32) -> Self {
        KernelArg::Float(value)
    }
}

impl From<i32> for KernelArg {
    fn from(value: i32) -> Self {
        KernelArg::Int(value as i64)
    }
}

impl From<usize> for KernelArg {
    fn from(value: usize) -> Self {
        KernelArg::Int(value as i64)
    }
}

/// Launch geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchConfig {
    /// Logical threads requested.
    pub threads: usize,
    pub block_dim: usize,
    pub grid_dim: usize,
}

impl LaunchConfig {
    /// Cover `threads` work items with blocks of at most [`MAX_BLOCK_DIM`].
    pub fn for_threads(threads: usize) -> Self {
        let block_dim = threads.clamp(1, MAX_BLOCK_DIM);
        Self {
            threads,
            block_dim,
            grid_dim: threads.div_ceil(block_dim),
        }
    }
}

/// A registered kernel function.
#[derive(Clone)]
pub struct KernelDescriptor {
    /// Module the kernel belongs to, e.g. `"Transforms"`.
    pub module: String,
    pub name: String,
    pub doc: String,
    pub function: KernelFn,
}

impl KernelDescriptor {
    pub fn path(&self) -> String {
        kernel_path(&self.module, &self.name)
    }
}

impl fmt::Debug for KernelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDescriptor")
            .field("module", &self.module)
            .field("name", &self.name)
            .finish()
    }
}

fn kernel_path(module: &str, name: &str) -> String {
    format!("{module}/{name}")
}

/// Registry of kernels by `module/name` path.
#[derive(Debug, Default, Clone)]
pub struct KernelRegistry {
    kernels: IndexMap<String, KernelDescriptor>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kernel, replacing any previous one with the same path.
    pub fn register<F>(&mut self, module: &str, name: &str, doc: &str, function: F)
    where
        F: Fn(&mut KernelInvocation<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let descriptor = KernelDescriptor {
            module: module.to_string(),
            name: name.to_string(),
            doc: doc.to_string(),
            function: Arc::new(function),
        };
        self.kernels.insert(descriptor.path(), descriptor);
    }

    pub fn get(&self, module: &str, name: &str) -> Option<&KernelDescriptor> {
        self.kernels.get(&kernel_path(module, name))
    }

    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.get(module, name).is_some()
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KernelDescriptor> {
        self.kernels.values()
    }

    /// Bind a kernel to `device` for later launches.
    pub fn acquire(&self, device: DeviceId, module: &str, name: &str) -> Result<Kernel> {
        let descriptor = self
            .get(module, name)
            .ok_or_else(|| Error::KernelNotFound(kernel_path(module, name)))?;
        Ok(Kernel {
            path: descriptor.path(),
            device,
            function: Arc::clone(&descriptor.function),
            launch: LaunchConfig::default(),
        })
    }
}

/// A kernel bound to a device, with its launch geometry.
#[derive(Clone)]
pub struct Kernel {
    path: String,
    device: DeviceId,
    function: KernelFn,
    launch: LaunchConfig,
}

impl Kernel {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn launch(&self) -> LaunchConfig {
        self.launch
    }

    /// Configure the launch to cover `threads` work items.
    pub fn setup_execution(&mut self, threads: usize) {
        self.launch = LaunchConfig::for_threads(threads);
    }

    /// Launch on the bound device. Buffer arguments must live on that device.
    pub fn run(&self, ctx: &mut ExecutionContext, args: &[KernelArg]) -> Result<()> {
        for (index, arg) in args.iter().enumerate() {
            if let KernelArg::Buffer(ptr) = arg
                && ptr.device() != self.device
            {
                return Err(Error::KernelArgument {
                    kernel: self.path.clone(),
                    message: format!(
                        "argument {index} lives on {}, kernel runs on {}",
                        ptr.device(),
                        self.device
                    ),
                });
            }
        }
        ctx.record_launch(self.device)?;
        trace!(kernel = %self.path, device = %self.device, threads = self.launch.threads, "launch");

        let mut invocation = KernelInvocation {
            ctx,
            args,
            launch: self.launch,
            path: &self.path,
        };
        (self.function)(&mut invocation)
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("path", &self.path)
            .field("device", &self.device)
            .field("launch", &self.launch)
            .finish()
    }
}

/// Argument access for a running kernel body.
pub struct KernelInvocation<'a> {
    ctx: &'a mut ExecutionContext,
    args: &'a [KernelArg],
    launch: LaunchConfig,
    path: &'a str,
}

impl KernelInvocation<'_> {
    pub fn launch(&self) -> LaunchConfig {
        self.launch
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    fn arg(&self, index: usize) -> Result<KernelArg> {
        self.args.get(index).copied().ok_or_else(|| Error::KernelArgument {
            kernel: self.path.to_string(),
            message: format!("missing argument {index}"),
        })
    }

    fn wrong_kind(&self, index: usize, expected: &str) -> Error {
        Error::KernelArgument {
            kernel: self.path.to_string(),
            message: format!("argument {index} is not a {expected}"),
        }
    }

    pub fn buffer(&self, index: usize) -> Result<DevicePtr> {
        match self.arg(index)? {
            KernelArg::Buffer(ptr) => Ok(ptr),
            _ => Err(self.wrong_kind(index, "buffer")),
        }
    }

    /// Scalar argument as `f32`. Integer arguments are converted.
    pub fn float(&self, index: usize) -> Result<f32> {
        match self.arg(index)? {
            KernelArg::Float(value) => Ok(value),
            KernelArg::Int(value) => Ok(value as f32),
            KernelArg::Buffer(_) => Err(self.wrong_kind(index, "scalar")),
        }
    }

    pub fn int(&self, index: usize) -> Result<i64> {
        match self.arg(index)? {
            KernelArg::Int(value) => Ok(value),
            _ => Err(self.wrong_kind(index, "integer")),
        }
    }

    /// Integer argument used as an element count or index.
    pub fn count(&self, index: usize) -> Result<usize> {
        usize::try_from(self.int(index)?).map_err(|_| Error::KernelArgument {
            kernel: self.path.to_string(),
            message: format!("argument {index} is negative"),
        })
    }

    /// Copy `count` elements out of buffer argument `index`.
    pub fn read<T: Element>(&self, index: usize, count: usize) -> Result<Vec<T>> {
        let ptr = self.buffer(index)?;
        Ok(self.ctx.view::<T>(ptr, count)?.to_vec())
    }

    /// Overwrite the start of buffer argument `index` with `values`.
    pub fn write<T: Element>(&mut self, index: usize, values: &[T]) -> Result<()> {
        let ptr = self.buffer(index)?;
        self.ctx.view_mut::<T>(ptr, values.len())?.copy_from_slice(values);
        Ok(())
    }

    /// Mutable view of `count` elements of buffer argument `index`.
    pub fn view_mut<T: Element>(&mut self, index: usize, count: usize) -> Result<&mut [T]> {
        let ptr = self.buffer(index)?;
        self.ctx.view_mut::<T>(ptr, count)
    }
}

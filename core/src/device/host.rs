//! In-process compute devices.
//!
//! A [`HostDevice`] behaves like an accelerator attached to the host: it owns
//! a worker thread that drains an in-order command queue (a `crossbeam`
//! channel), its buffers can only be touched through queued commands, and
//! kernels are compiled from generated programs before they can be launched.
//!
//! Several host devices side by side simulate a multi-device node. Nothing
//! is shared between them except what the caller moves through the host.

use super::{
    Buffer, ContextId, Device, DeviceClass, DeviceError, KernelArg, NdRange, PendingRead, Result,
    StencilElem,
};
use crate::codegen::{ConvBody, KernelProgram, Strategy};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, trace};
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;
use std::thread::JoinHandle;
use stencil_rs_kernels::{
    cpu_stencil_generic, cpu_stencil_tiled, cpu_stencil_window, BoundaryView,
};

/// Capabilities of a simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDeviceConfig {
    pub name: String,
    pub class: DeviceClass,
    pub max_workgroup_size: usize,
    /// Local memory per workgroup, in bytes.
    pub local_mem_size: usize,
    /// Largest single allocation, in bytes.
    pub max_alloc: usize,
}

impl HostDeviceConfig {
    /// A GPU-like device: 256-wide workgroups over 32 KiB of local memory.
    pub fn gpu() -> Self {
        Self {
            name: "host-gpu".to_string(),
            class: DeviceClass::Gpu,
            max_workgroup_size: 256,
            local_mem_size: 32 * 1024,
            max_alloc: 1 << 30,
        }
    }

    /// A CPU-like device. Convolutions on it always use the generic strategy.
    pub fn cpu() -> Self {
        Self {
            name: "host-cpu".to_string(),
            class: DeviceClass::Cpu,
            max_workgroup_size: 1024,
            local_mem_size: 32 * 1024,
            max_alloc: 1 << 30,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workgroup_size(mut self, size: usize) -> Self {
        self.max_workgroup_size = size;
        self
    }

    pub fn with_local_mem_size(mut self, bytes: usize) -> Self {
        self.local_mem_size = bytes;
        self
    }

    pub fn with_max_alloc(mut self, bytes: usize) -> Self {
        self.max_alloc = bytes;
        self
    }
}

impl Default for HostDeviceConfig {
    fn default() -> Self {
        Self::gpu()
    }
}

type Task = Box<dyn FnOnce() -> Result<()> + Send>;

enum Command {
    Run(Task),
    /// Reports the first failure since the previous fence.
    Fence(Sender<Result<()>>),
}

struct HostInner {
    config: HostDeviceConfig,
    context: ContextId,
    queue: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl Drop for HostInner {
    fn drop(&mut self) {
        // Closing the queue lets the worker drain what is left and exit.
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Worker of {} panicked", self.config.name);
            }
        }
    }
}

fn worker_loop(name: String, rx: Receiver<Command>) {
    let mut failure: Option<DeviceError> = None;
    for command in rx.iter() {
        match command {
            Command::Run(task) => {
                if let Err(e) = task() {
                    error!("Queued command on {} failed: {}", name, e);
                    failure.get_or_insert(e);
                }
            }
            Command::Fence(done) => {
                let status = match failure.take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
                // The waiter may have given up; nothing to report to.
                let _ = done.send(status);
            }
        }
    }
}

/// An in-process device with its own worker thread and command queue.
///
/// Clones are handles to the same device.
#[derive(Clone)]
pub struct HostDevice {
    inner: Arc<HostInner>,
}

impl HostDevice {
    /// Starts a device in a fresh context.
    pub fn new(config: HostDeviceConfig) -> Result<Self> {
        Self::spawn(config, ContextId::fresh())
    }

    /// Starts a device in the context of `other`, so the two share compiled
    /// kernels.
    pub fn in_context(other: &HostDevice, config: HostDeviceConfig) -> Result<Self> {
        Self::spawn(config, other.context())
    }

    /// Starts `count` devices, each in its own context, named `<name>:<i>`.
    pub fn many(count: usize, config: HostDeviceConfig) -> Result<Vec<Self>> {
        (0..count)
            .map(|i| {
                let name = format!("{}:{}", config.name, i);
                Self::new(config.clone().with_name(name))
            })
            .collect()
    }

    fn spawn(config: HostDeviceConfig, context: ContextId) -> Result<Self> {
        let (tx, rx) = unbounded();
        let name = config.name.clone();
        let worker = std::thread::Builder::new()
            .name(format!("device-{}", name))
            .spawn(move || worker_loop(name, rx))
            .map_err(|e| DeviceError::Spawn {
                device: config.name.clone(),
                reason: e.to_string(),
            })?;

        debug!(
            "Started {} device {} in context {}",
            config.class,
            config.name,
            context.raw()
        );

        Ok(Self {
            inner: Arc::new(HostInner {
                config,
                context,
                queue: Some(tx),
                worker: Some(worker),
            }),
        })
    }

    pub fn config(&self) -> &HostDeviceConfig {
        &self.inner.config
    }

    fn submit(&self, command: Command) -> Result<()> {
        let closed = || DeviceError::QueueClosed(self.inner.config.name.clone());
        self.inner
            .queue
            .as_ref()
            .ok_or_else(closed)?
            .send(command)
            .map_err(|_| closed())
    }

    fn run(&self, task: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
        self.submit(Command::Run(Box::new(task)))
    }
}

impl PartialEq for HostDevice {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDevice")
            .field("name", &self.inner.config.name)
            .field("class", &self.inner.config.class)
            .field("context", &self.inner.context)
            .finish()
    }
}

/// A program compiled for a [`HostDevice`].
#[derive(Debug)]
pub struct HostKernel<T> {
    program: Arc<KernelProgram<T>>,
}

impl<T> HostKernel<T> {
    pub fn program(&self) -> &KernelProgram<T> {
        &self.program
    }
}

fn compile_error<T>(program: &KernelProgram<T>, reason: impl Into<String>) -> DeviceError {
    DeviceError::Compile {
        kernel: program.name.clone(),
        reason: reason.into(),
    }
}

fn validate<T>(program: &KernelProgram<T>) -> Result<()> {
    let entry = format!("kernel void {}(", program.name);
    if !program.source.contains(&entry) {
        return Err(compile_error(program, "entry point not found in source"));
    }
    if let Some(param) = program
        .signature
        .params()
        .iter()
        .find(|p| !program.source.contains(p.name))
    {
        return Err(compile_error(
            program,
            format!("parameter `{}` is never declared", param.name),
        ));
    }
    if let ConvBody::Expression { source, .. } = &program.body {
        if source.trim().is_empty() {
            return Err(compile_error(program, "empty operator body"));
        }
        if !source.contains("return") {
            return Err(compile_error(program, "operator body does not return a value"));
        }
        if program.strategy != Strategy::Tiled {
            return Err(compile_error(program, "operator kernels must be tiled"));
        }
    }
    Ok(())
}

/// Launch arguments resolved against a kernel signature.
struct Bound<T> {
    n: usize,
    has_left: bool,
    has_right: bool,
    lhalo: usize,
    rhalo: usize,
    coeffs: Option<Buffer<T>>,
    xloc: Buffer<T>,
    xrem: Buffer<T>,
    y: Buffer<T>,
    alpha: T,
    beta: T,
    locals: Vec<usize>,
}

fn bind<T: StencilElem>(program: &KernelProgram<T>, args: Vec<KernelArg<T>>) -> Result<Bound<T>> {
    let params = program.signature.params();
    let arg_error = |index: usize, reason: String| DeviceError::Argument {
        kernel: program.name.clone(),
        index,
        reason,
    };

    if args.len() != params.len() {
        return Err(arg_error(
            args.len().min(params.len()),
            format!("expected {} arguments, got {}", params.len(), args.len()),
        ));
    }

    let mut n = None;
    let mut has_left = None;
    let mut has_right = None;
    let mut lhalo = None;
    let mut rhalo = None;
    let mut coeffs = None;
    let mut xloc = None;
    let mut xrem = None;
    let mut y = None;
    let mut alpha = None;
    let mut beta = None;
    let mut locals = Vec::new();

    for (index, (param, arg)) in params.iter().zip(args).enumerate() {
        if !arg.binds_to(param.kind) {
            return Err(arg_error(
                index,
                format!("cannot bind {:?} to `{}` ({:?})", arg, param.name, param.kind),
            ));
        }
        match (param.name, arg) {
            ("n", KernelArg::Size(v)) => n = Some(v),
            ("has_left", KernelArg::Flag(v)) => has_left = Some(v),
            ("has_right", KernelArg::Flag(v)) => has_right = Some(v),
            ("lhalo", KernelArg::Int(v)) | ("rhalo", KernelArg::Int(v)) if v < 0 => {
                return Err(arg_error(index, format!("negative halo width {}", v)));
            }
            ("lhalo", KernelArg::Int(v)) => lhalo = Some(v as usize),
            ("rhalo", KernelArg::Int(v)) => rhalo = Some(v as usize),
            ("s", KernelArg::Global(b)) => coeffs = Some(b),
            ("xloc", KernelArg::Global(b)) => xloc = Some(b),
            ("xrem", KernelArg::Global(b)) => xrem = Some(b),
            ("y", KernelArg::Global(b)) => y = Some(b),
            ("alpha", KernelArg::Scalar(v)) => alpha = Some(v),
            ("beta", KernelArg::Scalar(v)) => beta = Some(v),
            (_, KernelArg::Local(bytes)) => locals.push(bytes),
            _ => {}
        }
    }

    let missing = |name: &str| {
        arg_error(
            params.len(),
            format!("kernel has no `{}` parameter", name),
        )
    };

    Ok(Bound {
        n: n.ok_or_else(|| missing("n"))?,
        has_left: has_left.ok_or_else(|| missing("has_left"))?,
        has_right: has_right.ok_or_else(|| missing("has_right"))?,
        lhalo: lhalo.ok_or_else(|| missing("lhalo"))?,
        rhalo: rhalo.ok_or_else(|| missing("rhalo"))?,
        coeffs,
        xloc: xloc.ok_or_else(|| missing("xloc"))?,
        xrem: xrem.ok_or_else(|| missing("xrem"))?,
        y: y.ok_or_else(|| missing("y"))?,
        alpha: alpha.ok_or_else(|| missing("alpha"))?,
        beta: beta.ok_or_else(|| missing("beta"))?,
        locals,
    })
}

impl HostDevice {
    /// Checks that the local memory handed to a launch holds the tiles the
    /// kernel stages.
    fn check_local_memory<T: StencilElem>(
        &self,
        program: &KernelProgram<T>,
        bound: &Bound<T>,
        range: NdRange,
    ) -> Result<()> {
        // Generic kernels stage nothing; their local arguments are placeholders.
        if program.strategy != Strategy::Tiled {
            return Ok(());
        }
        let total: usize = bound.locals.iter().sum();
        if total > self.local_mem_size() {
            return Err(DeviceError::OutOfLocalMemory {
                kernel: program.name.clone(),
                device: self.name().to_string(),
                needed: total,
                available: self.local_mem_size(),
            });
        }

        let width = bound.lhalo + bound.rhalo + 1;
        let tile = (range.local + width - 1) * size_of::<T>();
        let needed: Vec<usize> = match program.body {
            ConvBody::Coefficients => vec![width * size_of::<T>(), tile],
            ConvBody::Expression { .. } => vec![tile],
        };
        for (i, (&given, &need)) in bound.locals.iter().zip(&needed).enumerate() {
            if given < need {
                return Err(DeviceError::Argument {
                    kernel: program.name.clone(),
                    index: program.signature.len() - bound.locals.len() + i,
                    reason: format!("local tile of {} bytes, {} needed", given, need),
                });
            }
        }
        Ok(())
    }
}

impl Device for HostDevice {
    type Kernel<T>
        = HostKernel<T>
    where
        T: StencilElem;

    fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn class(&self) -> DeviceClass {
        self.inner.config.class
    }

    fn context(&self) -> ContextId {
        self.inner.context
    }

    fn max_workgroup_size(&self) -> usize {
        self.inner.config.max_workgroup_size
    }

    fn local_mem_size(&self) -> usize {
        self.inner.config.local_mem_size
    }

    fn alloc<T: StencilElem>(&self, len: usize) -> Result<Buffer<T>> {
        let bytes = len.saturating_mul(size_of::<T>());
        if bytes > self.inner.config.max_alloc {
            return Err(DeviceError::OutOfMemory {
                device: self.name().to_string(),
                bytes,
                limit: self.inner.config.max_alloc,
            });
        }
        Ok(Buffer::from_vec(vec![T::zero(); len]))
    }

    fn enqueue_write<T: StencilElem>(
        &self,
        buffer: &Buffer<T>,
        offset: usize,
        data: Vec<T>,
    ) -> Result<()> {
        buffer.check_range(offset, data.len())?;
        let buffer = buffer.clone();
        self.run(move || {
            let mut dst = buffer.write()?;
            dst[offset..offset + data.len()].copy_from_slice(&data);
            Ok(())
        })
    }

    fn enqueue_read<T: StencilElem>(
        &self,
        buffer: &Buffer<T>,
        offset: usize,
        len: usize,
    ) -> Result<PendingRead<T>> {
        buffer.check_range(offset, len)?;
        if len == 0 {
            return Ok(PendingRead::empty());
        }
        let (tx, rx) = bounded(1);
        let buffer = buffer.clone();
        self.run(move || {
            let data = buffer
                .read()
                .map(|src| src[offset..offset + len].to_vec());
            // A dropped PendingRead means nobody wants the data.
            let _ = tx.send(data);
            Ok(())
        })?;
        Ok(PendingRead::queued(rx))
    }

    fn compile<T: StencilElem>(&self, program: &KernelProgram<T>) -> Result<HostKernel<T>> {
        validate(program)?;
        debug!(
            "Compiled `{}` ({} strategy, {}) for {}",
            program.name,
            program.strategy,
            T::TYPE_NAME,
            self.name()
        );
        Ok(HostKernel {
            program: Arc::new(program.clone()),
        })
    }

    fn launch<T: StencilElem>(
        &self,
        kernel: &HostKernel<T>,
        args: Vec<KernelArg<T>>,
        range: NdRange,
    ) -> Result<()> {
        let program = Arc::clone(&kernel.program);
        if range.local == 0
            || range.local > self.max_workgroup_size()
            || range.global % range.local != 0
        {
            return Err(DeviceError::InvalidRange {
                global: range.global,
                local: range.local,
            });
        }

        let bound = bind(&program, args)?;
        self.check_local_memory(&program, &bound, range)?;
        bound.xloc.check_range(0, bound.n)?;
        bound.y.check_range(0, bound.n)?;

        trace!(
            "Launching `{}` on {}: n = {}, range = {:?}",
            program.name,
            self.name(),
            bound.n,
            range
        );

        self.run(move || execute(&program, bound, range.local))
    }

    fn finish(&self) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.submit(Command::Fence(tx))?;
        rx.recv()
            .map_err(|_| DeviceError::QueueClosed(self.name().to_string()))?
    }
}

/// Runs a bound launch on the worker thread.
fn execute<T: StencilElem>(program: &KernelProgram<T>, bound: Bound<T>, block: usize) -> Result<()> {
    let Bound {
        n,
        has_left,
        has_right,
        lhalo,
        rhalo,
        coeffs,
        xloc,
        xrem,
        y,
        alpha,
        beta,
        ..
    } = bound;

    let halo = xrem.snapshot()?;
    let coeffs = coeffs.map(|c| c.snapshot()).transpose()?.unwrap_or_default();

    let mut y_guard = y.write()?;
    let out = &mut y_guard[..n];

    let run = |x: &[T], out: &mut [T]| -> Result<()> {
        let view = BoundaryView::new(x, &halo, has_left, has_right, lhalo, rhalo);
        match (&program.body, program.strategy) {
            (ConvBody::Coefficients, Strategy::Generic) => {
                cpu_stencil_generic(&view, &coeffs, out, alpha, beta)?
            }
            (ConvBody::Coefficients, Strategy::Tiled) => {
                cpu_stencil_tiled(&view, &coeffs, out, alpha, beta, block)?
            }
            (ConvBody::Expression { apply, .. }, _) => {
                cpu_stencil_window(&view, *apply, out, alpha, beta, block)?
            }
        }
        Ok(())
    };

    if xloc.ptr_eq(&y) {
        let x = out.to_vec();
        run(&x, out)
    } else {
        let x_guard = xloc.read()?;
        run(&x_guard[..n], out)
    }
}

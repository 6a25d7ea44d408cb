use tracing::{debug, info};

use super::{
    backend::{AccessMode, BufferHandle, ComputeBackend, DeviceAvailability, DeviceClass, KernelArg, KernelHandle},
    kernels::{self, HostKernelFn},
};
use crate::error::BackendError;

struct HostBuffer {
    access: AccessMode,
    data: Vec<u8>,
}

#[derive(Clone)]
enum BoundArg {
    Buffer(BufferHandle),
    Bytes(Vec<u8>),
}

struct HostKernel {
    name: &'static str,
    arg_count: usize,
    run: HostKernelFn,
    args: Vec<Option<BoundArg>>,
}

enum InvocationArg {
    Buffer { handle: BufferHandle, buffer: HostBuffer },
    Bytes(Vec<u8>),
}

/**
 * Arguments of one kernel execution. Buffers are moved out of the backend for the duration of the
 * call, so a kernel owns all of its buffers exclusively.
 */
pub struct KernelInvocation {
    kernel: &'static str,
    args: Vec<InvocationArg>,
}

impl KernelInvocation {
    pub fn kernel_name(&self) -> &'static str {
        self.kernel
    }

    fn arg(&self, index: usize) -> Result<&InvocationArg, BackendError> {
        self.args.get(index).ok_or_else(|| BackendError::MissingArgument {
            kernel: self.kernel.to_string(),
            index,
        })
    }

    /// Contents of a readable buffer argument or of a by-value argument.
    pub fn bytes(&self, index: usize) -> Result<&[u8], BackendError> {
        match self.arg(index)? {
            InvocationArg::Buffer { handle, buffer } => {
                if !buffer.access.kernel_readable() {
                    return Err(BackendError::AccessViolation {
                        buffer: handle.0,
                        operation: "kernel read",
                    });
                }
                Ok(&buffer.data)
            }
            InvocationArg::Bytes(bytes) => Ok(bytes),
        }
    }

    /// Overwrites the start of a writable buffer argument.
    pub fn write(&mut self, index: usize, data: &[u8]) -> Result<(), BackendError> {
        let kernel = self.kernel;
        let arg = self.args.get_mut(index).ok_or_else(|| BackendError::MissingArgument {
            kernel: kernel.to_string(),
            index,
        })?;
        match arg {
            InvocationArg::Buffer { handle, buffer } => {
                if !buffer.access.kernel_writable() {
                    return Err(BackendError::AccessViolation {
                        buffer: handle.0,
                        operation: "kernel write",
                    });
                }
                if data.len() > buffer.data.len() {
                    return Err(BackendError::OutOfBounds {
                        buffer: handle.0,
                        offset: 0,
                        len: data.len(),
                        size: buffer.data.len(),
                    });
                }
                buffer.data[..data.len()].copy_from_slice(data);
                Ok(())
            }
            InvocationArg::Bytes(_) => Err(BackendError::ArgumentKind {
                kernel: kernel.to_string(),
                index,
            }),
        }
    }
}

/**
 * Compute device living in host memory. Buffers are byte vectors and the kernel program is the set of
 * Rust entry points in `kernels`, which execute on the rayon thread pool.
 */
pub struct HostBackend {
    availability: DeviceAvailability,
    context: Option<DeviceClass>,
    buffers: Vec<Option<HostBuffer>>,
    kernels: Vec<HostKernel>,
    executed_kernels: usize,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::with_availability(DeviceAvailability {
            has_cpu_device: true,
            has_gpu_device: false,
        })
    }

    /// A backend that reports the given devices; used to exercise the serial fallback.
    pub fn with_availability(availability: DeviceAvailability) -> Self {
        HostBackend {
            availability,
            context: None,
            buffers: Vec::new(),
            kernels: Vec::new(),
            executed_kernels: 0,
        }
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    pub fn executed_kernels(&self) -> usize {
        self.executed_kernels
    }

    fn check_context(&self) -> Result<(), BackendError> {
        match self.context {
            Some(_) => Ok(()),
            None => Err(BackendError::ContextNotInitialized),
        }
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&HostBuffer, BackendError> {
        self.buffers
            .get(handle.0 as usize)
            .and_then(|b| b.as_ref())
            .ok_or(BackendError::InvalidBuffer(handle.0))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut HostBuffer, BackendError> {
        self.buffers
            .get_mut(handle.0 as usize)
            .and_then(|b| b.as_mut())
            .ok_or(BackendError::InvalidBuffer(handle.0))
    }

    fn check_range(handle: BufferHandle, buffer: &HostBuffer, offset: usize, len: usize) -> Result<(), BackendError> {
        match offset.checked_add(len) {
            Some(end) if end <= buffer.data.len() => Ok(()),
            _ => Err(BackendError::OutOfBounds {
                buffer: handle.0,
                offset,
                len,
                size: buffer.data.len(),
            }),
        }
    }

    fn restore(&mut self, args: Vec<InvocationArg>) {
        for arg in args {
            if let InvocationArg::Buffer { handle, buffer } = arg {
                self.buffers[handle.0 as usize] = Some(buffer);
            }
        }
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn initialize(&mut self) -> DeviceAvailability {
        info!(
            "host compute backend: cpu device {}, gpu device {}",
            self.availability.has_cpu_device, self.availability.has_gpu_device
        );
        self.availability
    }

    fn reinit_context(&mut self, source: &str, device_class: DeviceClass) -> Result<(), BackendError> {
        if !self.availability.supports(device_class) {
            return Err(BackendError::NoDevice);
        }

        self.buffers.clear();
        self.kernels.clear();
        self.context = Some(device_class);

        debug!(
            "host backend context created for {:?} ({} bytes of program source)",
            device_class,
            source.len()
        );
        Ok(())
    }

    fn create_buffer(&mut self, access: AccessMode, byte_size: usize) -> Result<BufferHandle, BackendError> {
        self.check_context()?;
        let buffer = Some(HostBuffer {
            access,
            data: vec![0u8; byte_size],
        });

        // released slots are handed out again
        match self.buffers.iter().position(|b| b.is_none()) {
            Some(slot) => {
                self.buffers[slot] = buffer;
                Ok(BufferHandle(slot as u32))
            }
            None => {
                self.buffers.push(buffer);
                Ok(BufferHandle(self.buffers.len() as u32 - 1))
            }
        }
    }

    fn release_buffer(&mut self, buffer: BufferHandle) -> Result<(), BackendError> {
        self.buffer(buffer)?;
        self.buffers[buffer.0 as usize] = None;
        Ok(())
    }

    fn create_kernel(&mut self, name: &str) -> Result<KernelHandle, BackendError> {
        self.check_context()?;
        let signature = kernels::signature(name).ok_or_else(|| BackendError::UnknownKernel(name.to_string()))?;
        let run = kernels::host_entry(name).ok_or_else(|| BackendError::UnknownKernel(name.to_string()))?;

        let handle = KernelHandle(self.kernels.len() as u32);
        self.kernels.push(HostKernel {
            name: signature.name,
            arg_count: signature.args.len(),
            run,
            args: vec![None; signature.args.len()],
        });
        Ok(handle)
    }

    fn set_kernel_argument(&mut self, kernel: KernelHandle, index: usize, arg: KernelArg) -> Result<(), BackendError> {
        if let KernelArg::Buffer(buffer) = arg {
            self.buffer(buffer)?;
        }
        let host_kernel = self
            .kernels
            .get_mut(kernel.0 as usize)
            .ok_or(BackendError::InvalidKernel(kernel.0))?;
        if index >= host_kernel.arg_count {
            return Err(BackendError::ArgumentKind {
                kernel: host_kernel.name.to_string(),
                index,
            });
        }
        host_kernel.args[index] = Some(match arg {
            KernelArg::Buffer(buffer) => BoundArg::Buffer(buffer),
            KernelArg::Bytes(bytes) => BoundArg::Bytes(bytes.to_vec()),
        });
        Ok(())
    }

    fn execute_kernel(
        &mut self,
        kernel: KernelHandle,
        global_work_items: usize,
        local_work_items: Option<usize>,
    ) -> Result<(), BackendError> {
        self.check_context()?;
        let host_kernel = self
            .kernels
            .get(kernel.0 as usize)
            .ok_or(BackendError::InvalidKernel(kernel.0))?;
        let (name, run) = (host_kernel.name, host_kernel.run);

        if let Some(local) = local_work_items {
            if local == 0 || global_work_items % local != 0 {
                return Err(BackendError::Layout(format!(
                    "global work size {} of kernel `{}` is not a multiple of the local work size {}",
                    global_work_items, name, local
                )));
            }
        }

        let mut bound = Vec::with_capacity(host_kernel.arg_count);
        for (index, arg) in host_kernel.args.iter().enumerate() {
            match arg {
                Some(arg) => bound.push(arg.clone()),
                None => {
                    return Err(BackendError::MissingArgument {
                        kernel: name.to_string(),
                        index,
                    })
                }
            }
        }

        let mut args = Vec::with_capacity(bound.len());
        for arg in bound {
            match arg {
                BoundArg::Buffer(handle) => {
                    // a handle bound twice is already taken at this point
                    let taken = self.buffers.get_mut(handle.0 as usize).and_then(|b| b.take());
                    match taken {
                        Some(buffer) => args.push(InvocationArg::Buffer { handle, buffer }),
                        None => {
                            self.restore(args);
                            return Err(BackendError::InvalidBuffer(handle.0));
                        }
                    }
                }
                BoundArg::Bytes(bytes) => args.push(InvocationArg::Bytes(bytes)),
            }
        }

        let mut invocation = KernelInvocation { kernel: name, args };
        let result = run(&mut invocation);
        self.restore(invocation.args);
        self.executed_kernels += 1;
        result
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: usize, data: &[u8], _blocking: bool) -> Result<(), BackendError> {
        let host_buffer = self.buffer_mut(buffer)?;
        Self::check_range(buffer, host_buffer, offset, data.len())?;
        host_buffer.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: usize, out: &mut [u8], _blocking: bool) -> Result<(), BackendError> {
        let host_buffer = self.buffer(buffer)?;
        Self::check_range(buffer, host_buffer, offset, out.len())?;
        out.copy_from_slice(&host_buffer.data[offset..offset + out.len()]);
        Ok(())
    }

    fn fill_buffer(&mut self, buffer: BufferHandle, pattern: &[u8], offset: usize, byte_size: usize) -> Result<(), BackendError> {
        if pattern.is_empty() || byte_size % pattern.len() != 0 {
            return Err(BackendError::Layout(format!(
                "fill of {} bytes with a pattern of {} bytes",
                byte_size,
                pattern.len()
            )));
        }
        let host_buffer = self.buffer_mut(buffer)?;
        Self::check_range(buffer, host_buffer, offset, byte_size)?;
        for chunk in host_buffer.data[offset..offset + byte_size].chunks_mut(pattern.len()) {
            chunk.copy_from_slice(pattern);
        }
        Ok(())
    }

    fn wait_until_finished(&mut self) -> Result<(), BackendError> {
        // kernels run to completion inside `execute_kernel`
        self.check_context()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::layout::{self, DeviceParams},
        simulation_parameters::{SolverConfig, SolverParams},
    };

    fn ready_backend() -> HostBackend {
        let mut backend = HostBackend::new();
        assert_eq!(
            backend.initialize(),
            DeviceAvailability {
                has_cpu_device: true,
                has_gpu_device: false
            }
        );
        backend.reinit_context(&kernels::program_source(), DeviceClass::Cpu).unwrap();
        backend
    }

    #[test]
    fn context_is_required_and_gpu_is_unavailable() {
        let mut backend = HostBackend::new();
        assert_eq!(
            backend.create_buffer(AccessMode::ReadWrite, 16),
            Err(BackendError::ContextNotInitialized)
        );
        assert_eq!(backend.reinit_context("", DeviceClass::Gpu), Err(BackendError::NoDevice));
        backend.reinit_context("", DeviceClass::Cpu).unwrap();
        assert!(backend.create_buffer(AccessMode::ReadWrite, 16).is_ok());
    }

    #[test]
    fn transfers_are_bounds_checked() {
        let mut backend = ready_backend();
        let buffer = backend.create_buffer(AccessMode::ReadOnly, 8).unwrap();

        backend.write_buffer(buffer, 4, &[1, 2, 3, 4], true).unwrap();
        assert!(matches!(
            backend.write_buffer(buffer, 6, &[1, 2, 3, 4], true),
            Err(BackendError::OutOfBounds { .. })
        ));

        backend.fill_buffer(buffer, &[9, 8], 0, 4).unwrap();
        let mut out = [0u8; 8];
        backend.read_buffer(buffer, 0, &mut out, true).unwrap();
        assert_eq!(out, [9, 8, 9, 8, 1, 2, 3, 4]);
        assert!(backend.fill_buffer(buffer, &[1, 2, 3], 0, 4).is_err());

        backend.release_buffer(buffer).unwrap();
        assert_eq!(backend.release_buffer(buffer), Err(BackendError::InvalidBuffer(buffer.0)));
    }

    #[test]
    fn buffer_slots_are_reused() {
        let mut backend = ready_backend();
        let a = backend.create_buffer(AccessMode::ReadWrite, 16).unwrap();
        let b = backend.create_buffer(AccessMode::ReadWrite, 16).unwrap();
        let c = backend.create_buffer(AccessMode::ReadWrite, 16).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);

        backend.release_buffer(b).unwrap();
        assert_eq!(backend.live_buffer_count(), 2);
        let d = backend.create_buffer(AccessMode::ReadOnly, 64).unwrap();
        assert_eq!(d, b);
        let mut out = [1u8; 64];
        backend.read_buffer(d, 0, &mut out, true).unwrap();
        assert_eq!(out, [0u8; 64]);

        // growing and recreating contexts keeps the slot table at the number of live buffers
        for round in 0..50 {
            backend.reinit_context("", DeviceClass::Cpu).unwrap();
            assert_eq!(backend.live_buffer_count(), 0);
            let mut handles = Vec::new();
            for k in 0..4 {
                handles.push(backend.create_buffer(AccessMode::ReadWrite, 16 * (round + k + 1)).unwrap());
            }
            for handle in handles {
                backend.release_buffer(handle).unwrap();
                backend.create_buffer(AccessMode::ReadWrite, 32 * (round + 1)).unwrap();
            }
            assert_eq!(backend.live_buffer_count(), 4);
            assert_eq!(backend.buffers.len(), 4);
        }
    }

    #[test]
    fn kernel_arguments_are_checked() {
        let mut backend = ready_backend();
        assert!(matches!(
            backend.create_kernel("no_such_kernel"),
            Err(BackendError::UnknownKernel(_))
        ));

        let kernel = backend.create_kernel("pci_add_pressure_force").unwrap();
        assert!(matches!(
            backend.execute_kernel(kernel, 64, Some(64)),
            Err(BackendError::MissingArgument { index: 0, .. })
        ));

        let params = DeviceParams {
            solver: SolverParams::new(&SolverConfig::default(), 1., 0.1),
            particle_count: 2,
            collision_object_count: 0,
            kernel_table_entries: 0,
        };
        let params_buffer = backend.create_buffer(AccessMode::ReadOnly, layout::PARAMS_SIZE).unwrap();
        backend.write_buffer(params_buffer, 0, &layout::encode_params(&params), true).unwrap();

        let vectors = vec![crate::vec3f(1., 2., 3.), crate::vec3f(0., -1., 0.)];
        let source = backend.create_buffer(AccessMode::ReadOnly, 2 * layout::VEC_SIZE).unwrap();
        backend.write_buffer(source, 0, &layout::encode_vectors(&vectors, 2), true).unwrap();
        let target = backend.create_buffer(AccessMode::ReadWrite, 2 * layout::VEC_SIZE).unwrap();
        backend.write_buffer(target, 0, &layout::encode_vectors(&vectors, 2), true).unwrap();

        backend.set_kernel_argument(kernel, 0, KernelArg::Buffer(params_buffer)).unwrap();
        backend.set_kernel_argument(kernel, 1, KernelArg::Buffer(source)).unwrap();
        // the same buffer for input and output cannot be handed out twice
        backend.set_kernel_argument(kernel, 2, KernelArg::Buffer(source)).unwrap();
        assert_eq!(
            backend.execute_kernel(kernel, 64, Some(64)),
            Err(BackendError::InvalidBuffer(source.0))
        );
        assert_eq!(backend.live_buffer_count(), 3);

        backend.set_kernel_argument(kernel, 2, KernelArg::Buffer(target)).unwrap();
        assert!(backend.execute_kernel(kernel, 64, Some(48)).is_err());
        backend.execute_kernel(kernel, 64, Some(64)).unwrap();
        backend.wait_until_finished().unwrap();

        let mut out = vec![0u8; 2 * layout::VEC_SIZE];
        backend.read_buffer(target, 0, &mut out, true).unwrap();
        let doubled: Vec<_> = vectors.iter().map(|v| v * 2.).collect();
        assert_eq!(layout::decode_vectors(&out, 2).unwrap(), doubled);

        // kernels may not write read-only buffers
        backend.set_kernel_argument(kernel, 2, KernelArg::Buffer(source)).unwrap();
        backend.set_kernel_argument(kernel, 1, KernelArg::Buffer(target)).unwrap();
        assert!(matches!(
            backend.execute_kernel(kernel, 64, None),
            Err(BackendError::AccessViolation { .. })
        ));
    }
}

use serde::{Deserialize, Serialize};

use crate::error::BackendError;

#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    Cpu,
    Gpu,
}

/// What `ComputeBackend::initialize` found on this machine.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
pub struct DeviceAvailability {
    pub has_cpu_device: bool,
    pub has_gpu_device: bool,
}

impl DeviceAvailability {
    pub fn supports(&self, device_class: DeviceClass) -> bool {
        match device_class {
            DeviceClass::Cpu => self.has_cpu_device,
            DeviceClass::Gpu => self.has_gpu_device,
        }
    }

    /// GPU if there is one, otherwise CPU.
    pub fn preferred(&self) -> Option<DeviceClass> {
        if self.has_gpu_device {
            Some(DeviceClass::Gpu)
        } else if self.has_cpu_device {
            Some(DeviceClass::Cpu)
        } else {
            None
        }
    }
}

/// How kernels may access a buffer. The host can always transfer in both directions.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn kernel_readable(self) -> bool {
        self != AccessMode::WriteOnly
    }

    pub fn kernel_writable(self) -> bool {
        self != AccessMode::ReadOnly
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub struct BufferHandle(pub u32);

#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub struct KernelHandle(pub u32);

/// A kernel argument is either a device buffer or a small block of bytes passed by value.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    Buffer(BufferHandle),
    Bytes(&'a [u8]),
}

/**
 * The device facing half of the solver: buffers, kernels and a single in-order queue.
 *
 * Every call is blocking from the solver's point of view except where `blocking == false` is passed,
 * in which case the transfer only has to complete before the next `wait_until_finished`.
 * Implementations must execute kernels in submission order.
 */
pub trait ComputeBackend: Send {
    fn name(&self) -> &str;

    fn initialize(&mut self) -> DeviceAvailability;

    /// (Re)builds the kernel program for a device class. Invalidates every buffer and kernel handle.
    fn reinit_context(&mut self, source: &str, device_class: DeviceClass) -> Result<(), BackendError>;

    fn create_buffer(&mut self, access: AccessMode, byte_size: usize) -> Result<BufferHandle, BackendError>;

    fn release_buffer(&mut self, buffer: BufferHandle) -> Result<(), BackendError>;

    fn create_kernel(&mut self, name: &str) -> Result<KernelHandle, BackendError>;

    fn set_kernel_argument(&mut self, kernel: KernelHandle, index: usize, arg: KernelArg) -> Result<(), BackendError>;

    fn execute_kernel(
        &mut self,
        kernel: KernelHandle,
        global_work_items: usize,
        local_work_items: Option<usize>,
    ) -> Result<(), BackendError>;

    fn write_buffer(&mut self, buffer: BufferHandle, offset: usize, data: &[u8], blocking: bool) -> Result<(), BackendError>;

    fn read_buffer(&mut self, buffer: BufferHandle, offset: usize, out: &mut [u8], blocking: bool) -> Result<(), BackendError>;

    /// Repeats `pattern` over `byte_size` bytes starting at `offset`.
    fn fill_buffer(&mut self, buffer: BufferHandle, pattern: &[u8], offset: usize, byte_size: usize) -> Result<(), BackendError>;

    fn wait_until_finished(&mut self) -> Result<(), BackendError>;
}

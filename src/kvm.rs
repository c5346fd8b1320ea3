//! KVM-backed interrupt delivery.
//!
//! With an in-kernel IRQ chip (PIC + IOAPIC) created on the VM, a device
//! interrupt is just a `KVM_IRQ_LINE` ioctl on the VM file descriptor:
//!
//! ```text
//! virtio-blk completion ──► KvmIrqLine::pulse(5)
//!                               │ KVM_IRQ_LINE(5, 1)
//!                               │ KVM_IRQ_LINE(5, 0)
//!                               ▼
//!                          IOAPIC pin 5 ──► guest vCPU
//! ```
//!
//! The platform layer owns VM creation; it shares the `VmFd` with the
//! devices that need to raise interrupts.

use std::io;
use std::sync::Arc;

use crate::interrupt::InterruptLine;

/// Interrupt line backed by a KVM VM with an in-kernel IRQ chip.
pub struct KvmIrqLine {
    vm: Arc<kvm_ioctls::VmFd>,
}

impl KvmIrqLine {
    /// Wrap a VM whose IRQ chip has already been created.
    pub fn new(vm: Arc<kvm_ioctls::VmFd>) -> Self {
        Self { vm }
    }
}

impl InterruptLine for KvmIrqLine {
    fn set_level(&self, irq: u32, active: bool) -> io::Result<()> {
        self.vm
            .set_irq_line(irq, active)
            .map_err(|e| io::Error::from_raw_os_error(e.errno()))
    }
}

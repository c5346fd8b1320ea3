//! Interrupt line capability consumed from the platform layer.
//!
//! Devices never hold a raw callback into the VMM. They are handed an
//! implementation of [`InterruptLine`] at construction time; on KVM that is
//! `kvm::KvmIrqLine`.

use std::io;

/// A level-settable interrupt line.
pub trait InterruptLine: Send + Sync {
    /// Drive `irq` high (`active = true`) or low.
    fn set_level(&self, irq: u32, active: bool) -> io::Result<()>;

    /// Signal an edge on `irq`: raise it, then lower it.
    fn pulse(&self, irq: u32) -> io::Result<()> {
        self.set_level(irq, true)?;
        self.set_level(irq, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        levels: Mutex<Vec<(u32, bool)>>,
    }

    impl InterruptLine for Recorder {
        fn set_level(&self, irq: u32, active: bool) -> io::Result<()> {
            self.levels.lock().unwrap().push((irq, active));
            Ok(())
        }
    }

    #[test]
    fn test_pulse_raises_then_lowers() {
        let line = Recorder::default();
        line.pulse(5).unwrap();
        assert_eq!(*line.levels.lock().unwrap(), vec![(5, true), (5, false)]);
    }
}

//! virtio-mmio v2 transport.
//!
//! [`MmioTransport`] decodes guest register accesses into feature
//! negotiation, queue configuration and device status, and forwards
//! QUEUE_NOTIFY to the [`VirtioDevice`] it carries.
//!
//! ```text
//! 0x000 ┌────────────────────────────┐
//!       │ generic registers          │ 32-bit aligned accesses only;
//!       │ (magic .. config gen)      │ anything else is dropped
//! 0x100 ├────────────────────────────┤
//!       │ device config block        │ any size / offset
//! 0x200 └────────────────────────────┘
//! ```

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::devices::mmio::MmioDevice;
use crate::interrupt::InterruptLine;
use crate::memory::GuestMemory;

use super::queue::{RingPart, Virtqueue};
use super::{
    DeviceState, VirtioDevice, MMIO_CONFIG, MMIO_CONFIG_GENERATION, MMIO_DEVICE_FEATURES,
    MMIO_DEVICE_FEATURES_SEL, MMIO_DEVICE_ID, MMIO_DRIVER_FEATURES, MMIO_DRIVER_FEATURES_SEL,
    MMIO_INTERRUPT_ACK, MMIO_INTERRUPT_STATUS, MMIO_MAGIC_VALUE, MMIO_QUEUE_AVAIL_HIGH,
    MMIO_QUEUE_AVAIL_LOW, MMIO_QUEUE_DESC_HIGH, MMIO_QUEUE_DESC_LOW, MMIO_QUEUE_NOTIFY,
    MMIO_QUEUE_NUM, MMIO_QUEUE_NUM_MAX, MMIO_QUEUE_READY, MMIO_QUEUE_SEL, MMIO_QUEUE_USED_HIGH,
    MMIO_QUEUE_USED_LOW, MMIO_STATUS, MMIO_VENDOR_ID, MMIO_VERSION, STATUS_ACKNOWLEDGE,
    STATUS_DRIVER, STATUS_DRIVER_OK, STATUS_FEATURES_OK, VIRTIO_MMIO_MAGIC, VIRTIO_MMIO_VERSION,
    VIRTIO_VENDOR_ID,
};

/// Register machine for one virtio device behind an MMIO window.
pub struct MmioTransport {
    device: Box<dyn VirtioDevice>,
    memory: Arc<GuestMemory>,
    state: Arc<DeviceState>,
    queues: Vec<Virtqueue>,

    device_features_sel: u32,
    driver_features_sel: u32,
    driver_features: u64,
    /// May name a queue that does not exist; queue registers are then inert.
    queue_sel: u32,
}

impl MmioTransport {
    pub fn new(
        device: Box<dyn VirtioDevice>,
        memory: Arc<GuestMemory>,
        line: Arc<dyn InterruptLine>,
        irq: u32,
    ) -> Self {
        let queues = (0..device.queue_count())
            .map(|_| Virtqueue::new(device.queue_max_size()))
            .collect();
        Self {
            device,
            memory,
            state: Arc::new(DeviceState::new(line, irq)),
            queues,
            device_features_sel: 0,
            driver_features_sel: 0,
            driver_features: 0,
            queue_sel: 0,
        }
    }

    pub fn state(&self) -> &Arc<DeviceState> {
        &self.state
    }

    /// Features the driver has written so far.
    pub fn driver_features(&self) -> u64 {
        self.driver_features
    }

    pub fn queue(&self, index: usize) -> Option<&Virtqueue> {
        self.queues.get(index)
    }

    fn selected_queue(&mut self) -> Option<&mut Virtqueue> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    fn read_register(&self, offset: u64) -> u32 {
        let selected = self.queues.get(self.queue_sel as usize);
        match offset {
            MMIO_MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            MMIO_VERSION => VIRTIO_MMIO_VERSION,
            MMIO_DEVICE_ID => self.device.device_type(),
            MMIO_VENDOR_ID => VIRTIO_VENDOR_ID,
            MMIO_DEVICE_FEATURES => {
                let features = self.device.avail_features();
                match self.device_features_sel {
                    0 => features as u32,
                    1 => (features >> 32) as u32,
                    _ => 0,
                }
            }
            MMIO_QUEUE_NUM_MAX => selected.map_or(0, |q| q.max_size() as u32),
            MMIO_QUEUE_READY => selected.map_or(0, |q| q.is_ready() as u32),
            MMIO_INTERRUPT_STATUS => self.state.interrupt_status(),
            MMIO_STATUS => self.state.status(),
            // The config block never changes after attach.
            MMIO_CONFIG_GENERATION => 0,
            _ => {
                trace!(offset, "read of unknown register");
                0
            }
        }
    }

    fn write_register(&mut self, offset: u64, value: u32) {
        match offset {
            MMIO_DEVICE_FEATURES_SEL => self.device_features_sel = value,
            MMIO_DRIVER_FEATURES => match self.driver_features_sel {
                0 => {
                    self.driver_features =
                        (self.driver_features & 0xffff_ffff_0000_0000) | value as u64;
                }
                1 => {
                    self.driver_features =
                        (self.driver_features & 0x0000_0000_ffff_ffff) | ((value as u64) << 32);
                }
                sel => trace!(sel, value, "driver features write to unknown half"),
            },
            MMIO_DRIVER_FEATURES_SEL => self.driver_features_sel = value,
            MMIO_QUEUE_SEL => self.queue_sel = value,
            MMIO_QUEUE_NUM => {
                // Out-of-range sizes become 0 and are refused at READY.
                let size = u16::try_from(value).unwrap_or(0);
                if let Some(queue) = self.selected_queue() {
                    queue.set_size(size);
                }
            }
            MMIO_QUEUE_READY => self.set_queue_ready(value != 0),
            MMIO_QUEUE_DESC_LOW => self.set_queue_address(RingPart::DescTable, false, value),
            MMIO_QUEUE_DESC_HIGH => self.set_queue_address(RingPart::DescTable, true, value),
            MMIO_QUEUE_AVAIL_LOW => self.set_queue_address(RingPart::AvailRing, false, value),
            MMIO_QUEUE_AVAIL_HIGH => self.set_queue_address(RingPart::AvailRing, true, value),
            MMIO_QUEUE_USED_LOW => self.set_queue_address(RingPart::UsedRing, false, value),
            MMIO_QUEUE_USED_HIGH => self.set_queue_address(RingPart::UsedRing, true, value),
            MMIO_QUEUE_NOTIFY => self.notify(value),
            MMIO_INTERRUPT_ACK => self.state.ack_interrupt(value),
            MMIO_STATUS => self.set_status(value),
            _ => trace!(offset, value, "write to unknown register"),
        }
    }

    fn set_queue_address(&mut self, part: RingPart, high: bool, value: u32) {
        if let Some(queue) = self.selected_queue() {
            queue.set_address(part, high, value);
        }
    }

    fn set_queue_ready(&mut self, ready: bool) {
        let index = self.queue_sel;
        let Some(queue) = self.queues.get_mut(index as usize) else {
            return;
        };
        match queue.set_ready(ready, &self.memory) {
            Ok(()) => {
                if let Some(layout) = queue.layout() {
                    debug!(
                        queue = index,
                        size = layout.size,
                        desc = layout.desc_table,
                        avail = layout.avail_ring,
                        used = layout.used_ring,
                        "queue ready"
                    );
                } else {
                    debug!(queue = index, "queue not ready");
                }
            }
            Err(e) => self.fail(&e),
        }
    }

    /// Mark the device FAILED and abandon every in-flight completion, so
    /// nothing reaches guest memory until the driver resets it.
    fn fail(&self, reason: &dyn std::fmt::Display) {
        self.state.fail(reason);
        for queue in &self.queues {
            queue.abandon_in_flight();
        }
    }

    /// Drain queue `index`. A protocol violation aborts the drain and
    /// fails the device.
    fn notify(&mut self, index: u32) {
        if self.state.is_failed() {
            trace!(queue = index, "notify ignored, device failed");
            return;
        }
        let Some(queue) = self.queues.get_mut(index as usize) else {
            trace!(queue = index, "notify for unknown queue");
            return;
        };
        if !queue.is_ready() {
            trace!(queue = index, "notify for queue that is not ready");
            return;
        }
        if let Err(e) = self
            .device
            .process_queue(index as u16, queue, &self.memory, &self.state)
        {
            self.fail(&e);
        }
    }

    fn set_status(&mut self, value: u32) {
        if value == 0 {
            self.reset();
            return;
        }

        let mut value = value;
        let unoffered = self.driver_features & !self.device.avail_features();
        if value & STATUS_FEATURES_OK != 0 && unoffered != 0 {
            warn!(
                features = format_args!("{unoffered:#x}"),
                "driver accepted features that were never offered, refusing FEATURES_OK"
            );
            value &= !STATUS_FEATURES_OK;
        }
        self.state.set_status(value);

        let mut flags = Vec::new();
        if value & STATUS_ACKNOWLEDGE != 0 {
            flags.push("ACK");
        }
        if value & STATUS_DRIVER != 0 {
            flags.push("DRIVER");
        }
        if value & STATUS_FEATURES_OK != 0 {
            flags.push("FEATURES_OK");
        }
        if value & STATUS_DRIVER_OK != 0 {
            flags.push("DRIVER_OK");
        }
        debug!(status = value, "status: {}", flags.join("|"));
    }

    /// STATUS=0: every queue, selector and feature goes back to its
    /// post-attach value. In-flight completions are abandoned.
    fn reset(&mut self) {
        for queue in &mut self.queues {
            queue.reset();
        }
        self.device.reset();
        self.device_features_sel = 0;
        self.driver_features_sel = 0;
        self.driver_features = 0;
        self.queue_sel = 0;
        self.state.reset();
        debug!("device reset");
    }
}

impl MmioDevice for MmioTransport {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        if offset >= MMIO_CONFIG {
            self.device.read_config(offset - MMIO_CONFIG, data);
            return;
        }
        if data.len() != 4 || offset & 0x3 != 0 {
            trace!(offset, len = data.len(), "non-aligned register read");
            data.fill(0);
            return;
        }
        data.copy_from_slice(&self.read_register(offset).to_le_bytes());
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        if offset >= MMIO_CONFIG {
            self.device.write_config(offset - MMIO_CONFIG, data);
            return;
        }
        if data.len() != 4 || offset & 0x3 != 0 {
            trace!(offset, len = data.len(), "non-aligned register write");
            return;
        }
        let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        self.write_register(offset, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::queue::QueueError;
    use crate::devices::virtio::test_utils::RecordingLine;
    use crate::devices::virtio::{
        INTERRUPT_VRING, STATUS_FAILED, VIRTIO_DEVICE_BLOCK, VIRTIO_F_VERSION_1,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts drains; optionally fails them.
    struct CountingDevice {
        drains: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
        fail: bool,
    }

    impl VirtioDevice for CountingDevice {
        fn device_type(&self) -> u32 {
            VIRTIO_DEVICE_BLOCK
        }

        fn avail_features(&self) -> u64 {
            VIRTIO_F_VERSION_1 | 1 << 9
        }

        fn queue_max_size(&self) -> u16 {
            16
        }

        fn read_config(&self, offset: u64, data: &mut [u8]) {
            let config = [0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
            let start = offset as usize;
            if let Some(src) = config.get(start..start + data.len()) {
                data.copy_from_slice(src);
            }
        }

        fn process_queue(
            &mut self,
            _index: u16,
            _queue: &mut Virtqueue,
            _memory: &Arc<GuestMemory>,
            _state: &Arc<DeviceState>,
        ) -> Result<(), QueueError> {
            self.drains.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(QueueError::ChainTooLong { head: 0, size: 16 });
            }
            Ok(())
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        transport: MmioTransport,
        drains: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
    }

    fn fixture(fail: bool) -> Fixture {
        let drains = Arc::new(AtomicUsize::new(0));
        let resets = Arc::new(AtomicUsize::new(0));
        let device = CountingDevice {
            drains: drains.clone(),
            resets: resets.clone(),
            fail,
        };
        let memory = Arc::new(GuestMemory::new(0x10000).unwrap());
        let transport = MmioTransport::new(
            Box::new(device),
            memory,
            Arc::new(RecordingLine::default()),
            5,
        );
        Fixture {
            transport,
            drains,
            resets,
        }
    }

    fn read32(t: &mut MmioTransport, offset: u64) -> u32 {
        let mut data = [0u8; 4];
        t.read(offset, &mut data);
        u32::from_le_bytes(data)
    }

    fn write32(t: &mut MmioTransport, offset: u64, value: u32) {
        t.write(offset, &value.to_le_bytes());
    }

    fn setup_queue(t: &mut MmioTransport) {
        write32(t, MMIO_QUEUE_SEL, 0);
        write32(t, MMIO_QUEUE_NUM, 8);
        write32(t, MMIO_QUEUE_DESC_LOW, 0x1000);
        write32(t, MMIO_QUEUE_AVAIL_LOW, 0x2000);
        write32(t, MMIO_QUEUE_USED_LOW, 0x3000);
        write32(t, MMIO_QUEUE_READY, 1);
    }

    #[test]
    fn test_identity_registers() {
        let mut f = fixture(false);
        let t = &mut f.transport;
        assert_eq!(read32(t, MMIO_MAGIC_VALUE), 0x7472_6976);
        assert_eq!(read32(t, MMIO_VERSION), 2);
        assert_eq!(read32(t, MMIO_DEVICE_ID), 2);
        assert_eq!(read32(t, MMIO_VENDOR_ID), 0);
        assert_eq!(read32(t, MMIO_QUEUE_NUM_MAX), 16);
        assert_eq!(read32(t, MMIO_CONFIG_GENERATION), 0);
        assert_eq!(read32(t, 0x0f0), 0);
    }

    #[test]
    fn test_non_word_accesses_are_ignored() {
        let mut f = fixture(false);
        let t = &mut f.transport;

        let mut half = [0xaau8; 2];
        t.read(MMIO_MAGIC_VALUE, &mut half);
        assert_eq!(half, [0, 0]);
        let mut word = [0xaau8; 4];
        t.read(MMIO_MAGIC_VALUE + 1, &mut word);
        assert_eq!(word, [0; 4]);

        t.write(MMIO_STATUS, &[STATUS_ACKNOWLEDGE as u8]);
        assert_eq!(read32(t, MMIO_STATUS), 0);
        t.write(MMIO_STATUS, &STATUS_ACKNOWLEDGE.to_le_bytes()[..2]);
        assert_eq!(read32(t, MMIO_STATUS), 0);
    }

    #[test]
    fn test_config_block_any_size() {
        let mut f = fixture(false);
        let t = &mut f.transport;
        let mut byte = [0u8; 1];
        t.read(MMIO_CONFIG + 3, &mut byte);
        assert_eq!(byte, [0x44]);
        let mut quad = [0u8; 8];
        t.read(MMIO_CONFIG, &mut quad);
        assert_eq!(u64::from_le_bytes(quad), 0x8877_6655_4433_2211);
    }

    #[test]
    fn test_feature_halves() {
        let mut f = fixture(false);
        let t = &mut f.transport;
        write32(t, MMIO_DEVICE_FEATURES_SEL, 0);
        assert_eq!(read32(t, MMIO_DEVICE_FEATURES), 1 << 9);
        write32(t, MMIO_DEVICE_FEATURES_SEL, 1);
        assert_eq!(read32(t, MMIO_DEVICE_FEATURES), 1);
        write32(t, MMIO_DEVICE_FEATURES_SEL, 2);
        assert_eq!(read32(t, MMIO_DEVICE_FEATURES), 0);

        write32(t, MMIO_DRIVER_FEATURES_SEL, 1);
        write32(t, MMIO_DRIVER_FEATURES, 1);
        write32(t, MMIO_DRIVER_FEATURES_SEL, 0);
        write32(t, MMIO_DRIVER_FEATURES, 1 << 9);
        write32(t, MMIO_DRIVER_FEATURES_SEL, 7);
        write32(t, MMIO_DRIVER_FEATURES, 0xffff_ffff);
        assert_eq!(t.driver_features(), VIRTIO_F_VERSION_1 | 1 << 9);
    }

    #[test]
    fn test_features_ok_accepted() {
        let mut f = fixture(false);
        let t = &mut f.transport;
        write32(t, MMIO_DRIVER_FEATURES_SEL, 1);
        write32(t, MMIO_DRIVER_FEATURES, 1);
        let status = STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK;
        write32(t, MMIO_STATUS, status);
        assert_eq!(read32(t, MMIO_STATUS), status);
    }

    #[test]
    fn test_unoffered_feature_refuses_features_ok() {
        let mut f = fixture(false);
        let t = &mut f.transport;
        write32(t, MMIO_DRIVER_FEATURES_SEL, 0);
        write32(t, MMIO_DRIVER_FEATURES, 1 << 9 | 1 << 3);
        write32(t, MMIO_STATUS, STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK);

        assert_eq!(read32(t, MMIO_STATUS), STATUS_ACKNOWLEDGE | STATUS_DRIVER);
        // The device's own offer is unchanged by the driver's request.
        write32(t, MMIO_DEVICE_FEATURES_SEL, 0);
        assert_eq!(read32(t, MMIO_DEVICE_FEATURES), 1 << 9);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut f = fixture(false);
        let t = &mut f.transport;
        write32(t, MMIO_STATUS, STATUS_ACKNOWLEDGE | STATUS_DRIVER);
        write32(t, MMIO_DRIVER_FEATURES, 1 << 9);
        write32(t, MMIO_DEVICE_FEATURES_SEL, 1);
        setup_queue(t);
        t.state().signal_used_buffer();

        let snapshot = |t: &mut MmioTransport| {
            (
                read32(t, MMIO_STATUS),
                read32(t, MMIO_INTERRUPT_STATUS),
                read32(t, MMIO_QUEUE_READY),
                read32(t, MMIO_DEVICE_FEATURES),
                t.driver_features(),
                t.queue(0).unwrap().size(),
            )
        };

        write32(t, MMIO_STATUS, 0);
        let once = snapshot(t);
        write32(t, MMIO_STATUS, 0);
        let twice = snapshot(t);
        assert_eq!(once, twice);
        assert_eq!(once, (0, 0, 0, 1 << 9, 0, 0));
        assert_eq!(f.resets.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalid_queue_sel_is_inert() {
        let mut f = fixture(false);
        let t = &mut f.transport;
        write32(t, MMIO_QUEUE_SEL, 3);
        assert_eq!(read32(t, MMIO_QUEUE_NUM_MAX), 0);
        write32(t, MMIO_QUEUE_NUM, 8);
        write32(t, MMIO_QUEUE_READY, 1);
        assert_eq!(read32(t, MMIO_QUEUE_READY), 0);
        assert_eq!(t.queue(0).unwrap().size(), 0);
        assert_eq!(t.state().status() & STATUS_FAILED, 0);

        write32(t, MMIO_QUEUE_SEL, 0);
        assert_eq!(read32(t, MMIO_QUEUE_NUM_MAX), 16);
    }

    #[test]
    fn test_notify_drains_ready_queue_only() {
        let mut f = fixture(false);
        let t = &mut f.transport;
        write32(t, MMIO_QUEUE_NOTIFY, 0);
        assert_eq!(f.drains.load(Ordering::SeqCst), 0);

        setup_queue(t);
        assert_eq!(read32(t, MMIO_QUEUE_READY), 1);
        write32(t, MMIO_QUEUE_NOTIFY, 0);
        write32(t, MMIO_QUEUE_NOTIFY, 1);
        assert_eq!(f.drains.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drain_error_fails_device_until_reset() {
        let mut f = fixture(true);
        let t = &mut f.transport;
        write32(t, MMIO_STATUS, STATUS_ACKNOWLEDGE);
        setup_queue(t);

        write32(t, MMIO_QUEUE_NOTIFY, 0);
        assert_eq!(read32(t, MMIO_STATUS), STATUS_ACKNOWLEDGE | STATUS_FAILED);
        write32(t, MMIO_QUEUE_NOTIFY, 0);
        assert_eq!(f.drains.load(Ordering::SeqCst), 1);

        write32(t, MMIO_STATUS, 0);
        assert_eq!(read32(t, MMIO_STATUS), 0);
    }

    #[test]
    fn test_bad_queue_size_fails_device() {
        let mut f = fixture(false);
        let t = &mut f.transport;
        write32(t, MMIO_QUEUE_NUM, 6);
        write32(t, MMIO_QUEUE_READY, 1);
        assert_eq!(read32(t, MMIO_QUEUE_READY), 0);
        assert_ne!(read32(t, MMIO_STATUS) & STATUS_FAILED, 0);
    }

    #[test]
    fn test_interrupt_ack() {
        let mut f = fixture(false);
        let t = &mut f.transport;
        t.state().signal_used_buffer();
        assert_eq!(read32(t, MMIO_INTERRUPT_STATUS), INTERRUPT_VRING);
        write32(t, MMIO_INTERRUPT_ACK, INTERRUPT_VRING);
        assert_eq!(read32(t, MMIO_INTERRUPT_STATUS), 0);
    }
}

//! Timing and DMA services the host controller borrows from its platform.
//!
//! Every wait in the driver is a busy loop bounded by a [`Deadline`] taken
//! from [`Platform::now_us`], so a fake clock is enough to drive the whole
//! state machine in tests.

use dma_api::Direction;

pub trait Platform {
    /// Monotonic time in microseconds.
    fn now_us(&self) -> u64;

    /// Busy-wait for at least `us` microseconds.
    fn delay_us(&self, us: u64);

    fn delay_ms(&self, ms: u64) {
        self.delay_us(ms * 1000);
    }

    /// Bus address the controller should use for `len` bytes at `addr`.
    ///
    /// SDMA and ADMA2 only take 32-bit system addresses.
    fn dma_map(&self, addr: usize, _len: usize, _dir: Direction) -> u32 {
        addr as u32
    }

    fn dma_unmap(&self, _bus_addr: u32, _len: usize, _dir: Direction) {}
}

impl<T: Platform + ?Sized> Platform for &T {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }

    fn delay_us(&self, us: u64) {
        (**self).delay_us(us)
    }

    fn dma_map(&self, addr: usize, len: usize, dir: Direction) -> u32 {
        (**self).dma_map(addr, len, dir)
    }

    fn dma_unmap(&self, bus_addr: u32, len: usize, dir: Direction) {
        (**self).dma_unmap(bus_addr, len, dir)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end_us: u64,
}

impl Deadline {
    pub fn after_us<P: Platform + ?Sized>(platform: &P, us: u64) -> Self {
        Self {
            end_us: platform.now_us().saturating_add(us),
        }
    }

    pub fn after_ms<P: Platform + ?Sized>(platform: &P, ms: u64) -> Self {
        Self::after_us(platform, ms.saturating_mul(1000))
    }

    pub fn expired<P: Platform + ?Sized>(&self, platform: &P) -> bool {
        platform.now_us() >= self.end_us
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        use aarch64_cpu::registers::{CNTFRQ_EL0, CNTPCT_EL0, Readable};

        /// Timing service backed by the architectural generic timer.
        #[derive(Debug, Default, Clone, Copy)]
        pub struct GenericTimer;

        impl Platform for GenericTimer {
            fn now_us(&self) -> u64 {
                let freq = CNTFRQ_EL0.get();
                let cnt = CNTPCT_EL0.get();
                if freq == 0 {
                    return cnt;
                }
                ((cnt as u128 * 1_000_000) / freq as u128) as u64
            }

            fn delay_us(&self, us: u64) {
                let deadline = Deadline::after_us(self, us);
                while !deadline.expired(self) {
                    core::hint::spin_loop();
                }
            }
        }
    }
}

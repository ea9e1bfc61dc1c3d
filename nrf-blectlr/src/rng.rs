//! Hardware RNG driver behind the entropy pool.
//!
//! The RNG peripheral interrupts once per generated byte at low priority and
//! feeds the lock-free pool in `blectlr`. The generator only runs while the
//! pool is below its refill threshold or a consumer is actively waiting, it
//! is stopped the moment the pool fills up.
use core::future::poll_fn;
use core::marker::PhantomData;
use core::task::Poll;

use blectlr::rand_pool::{PushOutcome, RandPool};
use embassy_sync::waitqueue::AtomicWaker;

use crate::pac;

const RNG_INT_VALRDY: u32 = 1 << 0;

pub(crate) static POOL: RandPool = RandPool::new();
static WAKER: AtomicWaker = AtomicWaker::new();

/// Attach pool storage and start filling it.
///
/// `pool_mem` must be a power of two in length.
pub(crate) fn init(pool_mem: &'static mut [u8], threshold: usize) {
    let rng = pac::RNG;
    rng.tasks_stop().write_value(1);
    rng.intenclr().write(|w| w.0 = RNG_INT_VALRDY);
    // Bias correction trades generation speed for unbiased bits. The pool
    // feeds security-sensitive link-layer procedures, so it stays on.
    rng.config().write(|w| w.set_dercen(true));

    POOL.attach(pool_mem, threshold);

    rng.events_valrdy().write_value(0);
    rng.intenset().write(|w| w.0 = RNG_INT_VALRDY);
    rng.tasks_start().write_value(1);
}

/// Stop the generator and detach the pool. The RNG interrupt must be masked
/// before this is called.
pub(crate) fn deinit() {
    let rng = pac::RNG;
    rng.tasks_stop().write_value(1);
    rng.intenclr().write(|w| w.0 = RNG_INT_VALRDY);
    rng.config().write(|w| w.set_dercen(false));
    POOL.detach();
}

fn start() {
    let rng = pac::RNG;
    rng.events_valrdy().write_value(0);
    rng.intenset().write(|w| w.0 = RNG_INT_VALRDY);
    rng.tasks_start().write_value(1);
}

/// Service the RNG interrupt: move one byte into the pool.
pub(crate) fn on_interrupt() {
    let rng = pac::RNG;
    rng.events_valrdy().write_value(0);
    let byte = rng.value().read().value();
    match POOL.push(byte) {
        PushOutcome::More => {}
        PushOutcome::Full | PushOutcome::Detached => {
            rng.tasks_stop().write_value(1);
        }
    }
    WAKER.wake();
}

/// Take up to `dest.len()` bytes from the pool without waiting.
pub(crate) fn try_fill(dest: &mut [u8]) -> usize {
    let (n, refill) = POOL.try_fill_bytes(dest);
    if refill {
        start();
    }
    n
}

/// Fill `dest` completely, polling the peripheral directly for whatever the
/// pool cannot provide.
pub(crate) fn blocking_fill(dest: &mut [u8]) {
    let len = try_fill(dest);
    if len < dest.len() {
        let rng = pac::RNG;
        // Take the generator away from the pool while we poll it.
        rng.intenclr().write(|w| w.0 = RNG_INT_VALRDY);
        rng.tasks_start().write_value(1);
        for byte in dest[len..].iter_mut() {
            while rng.events_valrdy().read() == 0 {}
            rng.events_valrdy().write_value(0);
            *byte = rng.value().read().value();
        }
        // Hand it back and refill the pool.
        start();
    }
}

/// Fill `dest` completely, waiting for the generator as needed.
pub(crate) async fn fill(dest: &mut [u8]) {
    let mut len = 0;
    poll_fn(|cx| {
        WAKER.register(cx.waker());
        len += try_fill(&mut dest[len..]);
        if len == dest.len() {
            Poll::Ready(())
        } else {
            // Keep the generator running until we are satisfied.
            start();
            Poll::Pending
        }
    })
    .await;
}

/// A `rand_core` adapter over the controller's entropy pool.
pub struct Rng<'a> {
    _controller: PhantomData<&'a ()>,
}

impl<'a> Rng<'a> {
    pub(crate) fn new() -> Self {
        Rng { _controller: PhantomData }
    }
}

impl<'a> rand_core::RngCore for Rng<'a> {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        blocking_fill(dest);
    }

    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0; 4];
        blocking_fill(&mut bytes);
        // We don't care about the endianness, so just use the native one.
        u32::from_ne_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0; 8];
        blocking_fill(&mut bytes);
        u64::from_ne_bytes(bytes)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        blocking_fill(dest);
        Ok(())
    }
}

impl<'a> rand_core::CryptoRng for Rng<'a> {}

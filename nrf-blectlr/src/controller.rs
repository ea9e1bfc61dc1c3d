use core::cell::RefCell;
use core::cmp::Ordering as CmpOrdering;
use core::future::poll_fn;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicPtr, AtomicU16, Ordering};
use core::task::Poll;

use blectlr::clock::ClockConfig;
use blectlr::config::{Cfg, ConfigBank, HCI_QUEUE_SLOTS, RNG_POOL_SIZE};
use blectlr::hci::{cmd_packet_len, data_packet_len, HostQueue, MsgKind, MsgQueue, SLOT_SIZE};
use blectlr::lpwq::{WorkEvent, WorkQueue};
use blectlr::region::Arena;
use blectlr::sched::{Owner, Scheduler, WorkItem};
use blectlr::timeslot::{Priority as SlotPriority, Session, SessionState, Signal, SignalHandler, TimeslotRequest};
use blectlr::Error;
use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::NVIC;
use embassy_nrf::interrupt::typelevel::{Binding, Handler, Interrupt, CLOCK_POWER, RADIO, RNG, RTC0, TIMER0};
use embassy_nrf::interrupt::Priority;
use embassy_nrf::{interrupt, peripherals, Peripheral, PeripheralRef};
use embassy_sync::waitqueue::AtomicWaker;

use crate::pol::OwnershipLock;
use crate::temp::Temperature;
use crate::{hfclk, isr, lfclk, rng, temp};

static WAKER: AtomicWaker = AtomicWaker::new();
static HCI_WAKER: AtomicWaker = AtomicWaker::new();
static LOW_PRIO_IRQ: AtomicU16 = AtomicU16::new(u16::MAX);
static FAULT_HANDLER: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub(crate) static WORK_QUEUE: WorkQueue = WorkQueue::new();
pub(crate) static POL: OwnershipLock = OwnershipLock::new();

static STATE: cortex_m::interrupt::Mutex<RefCell<Option<State>>> = cortex_m::interrupt::Mutex::new(RefCell::new(None));

/// Called when the controller detects an unrecoverable internal error.
pub type FaultHandler = fn(file: &'static str, line: u32);

fn default_fault_handler(file: &'static str, line: u32) {
    panic!("BleController fault: {}:{}", file, line)
}

/// Collaborator interface for the link-layer event machinery.
///
/// The hooks run at the highest interrupt priority inside granted connection
/// event slots and must not block.
#[derive(Clone, Copy)]
pub struct LinkLayerHooks {
    /// A granted connection event slot has started.
    pub on_event_start: fn(handle: u8),
    /// RADIO interrupt inside the connection event.
    pub on_radio: fn(handle: u8),
    /// TIMER0 interrupt inside the connection event.
    pub on_timer: fn(handle: u8),
    /// The connection event's granted window is over.
    pub on_event_end: fn(handle: u8),
    /// The connection event could not be scheduled.
    pub on_event_blocked: fn(handle: u8),
}

pub(crate) struct State {
    pub scheduler: Scheduler,
    pub session: Session,
    pub hooks: Option<LinkLayerHooks>,
    pub host_queue: HostQueue<'static>,
    pub data_in: MsgQueue<'static>,
    pub link_arena: Arena<'static>,
    pub anchor_us: Option<u32>,
    pub hfclk_held: bool,
    /// The committed slot's coarse wakeup has fired: the ownership lock is
    /// held and the fine timer is ticking towards the start.
    pub slot_armed: bool,
}

/// Run `f` on the controller state with all interrupts masked.
///
/// Sections under this lock are short and bounded; it is the only way state
/// is shared between thread context and the high-priority handlers.
pub(crate) fn with_state<R>(f: impl FnOnce(&mut State) -> R) -> Option<R> {
    cortex_m::interrupt::free(|cs| STATE.borrow(cs).borrow_mut().as_mut().map(f))
}

#[derive(Clone, Copy)]
struct LowPrioIrq(u16);

unsafe impl InterruptNumber for LowPrioIrq {
    fn number(self) -> u16 {
        self.0
    }
}

fn pend_low_prio() {
    let irq = LOW_PRIO_IRQ.load(Ordering::Acquire);
    if irq != u16::MAX {
        NVIC::pend(LowPrioIrq(irq));
    }
}

fn fault(file: &'static str, line: u32) {
    RADIO::disable();
    RTC0::disable();
    TIMER0::disable();
    let handler = FAULT_HANDLER.load(Ordering::Acquire);
    let handler: FaultHandler = if handler.is_null() {
        default_fault_handler
    } else {
        unsafe { core::mem::transmute(handler) }
    };
    handler(file, line);
}

pub struct Peripherals<'d> {
    pub radio: PeripheralRef<'d, peripherals::RADIO>,
    pub rtc0: PeripheralRef<'d, peripherals::RTC0>,
    pub timer0: PeripheralRef<'d, peripherals::TIMER0>,
    pub temp: PeripheralRef<'d, peripherals::TEMP>,
    pub rng: PeripheralRef<'d, peripherals::RNG>,

    pub ppi_ch19: PeripheralRef<'d, peripherals::PPI_CH19>,
    pub ppi_ch30: PeripheralRef<'d, peripherals::PPI_CH30>,
    pub ppi_ch31: PeripheralRef<'d, peripherals::PPI_CH31>,
}

impl<'d> Peripherals<'d> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        radio: impl Peripheral<P = peripherals::RADIO> + 'd,
        rtc0: impl Peripheral<P = peripherals::RTC0> + 'd,
        timer0: impl Peripheral<P = peripherals::TIMER0> + 'd,
        temp: impl Peripheral<P = peripherals::TEMP> + 'd,
        rng: impl Peripheral<P = peripherals::RNG> + 'd,
        ppi_ch19: impl Peripheral<P = peripherals::PPI_CH19> + 'd,
        ppi_ch30: impl Peripheral<P = peripherals::PPI_CH30> + 'd,
        ppi_ch31: impl Peripheral<P = peripherals::PPI_CH31> + 'd,
    ) -> Self {
        Peripherals {
            radio: radio.into_ref(),
            rtc0: rtc0.into_ref(),
            timer0: timer0.into_ref(),
            temp: temp.into_ref(),
            rng: rng.into_ref(),
            ppi_ch19: ppi_ch19.into_ref(),
            ppi_ch30: ppi_ch30.into_ref(),
            ppi_ch31: ppi_ch31.into_ref(),
        }
    }
}

/// Configures and enables the controller.
pub struct Builder {
    bank: ConfigBank,
    clock: ClockConfig,
    hooks: Option<LinkLayerHooks>,
    fault_handler: FaultHandler,
}

impl Builder {
    pub fn new() -> Result<Self, Error> {
        Ok(Builder {
            bank: ConfigBank::new(),
            clock: ClockConfig::default(),
            hooks: None,
            fault_handler: default_fault_handler,
        })
    }

    /// Select the low-frequency clock configuration.
    pub fn clock_cfg(mut self, clock: ClockConfig) -> Result<Self, Error> {
        clock.validate()?;
        self.clock = clock;
        Ok(self)
    }

    /// Apply a resource configuration update to `tag`. Returns the memory
    /// required to enable under the updated configuration.
    pub fn cfg_set(&mut self, tag: u8, cfg: Cfg) -> Result<usize, Error> {
        self.bank.set(tag, Some(cfg))
    }

    /// The memory required to enable under the configuration stored at `tag`.
    pub fn required_memory(&mut self, tag: u8) -> Result<usize, Error> {
        self.bank.set(tag, None)
    }

    /// Install the link-layer collaborator hooks.
    pub fn link_layer_hooks(mut self, hooks: LinkLayerHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Install the fault handler. The default panics.
    pub fn fault_handler(mut self, handler: FaultHandler) -> Self {
        self.fault_handler = handler;
        self
    }

    /// Start the controller under the configuration stored at `tag`, carving
    /// its runtime memory out of `mem`.
    pub fn enable<'d, T, I>(
        mut self,
        p: Peripherals<'d>,
        _irq: I,
        tag: u8,
        mem: &'static mut [u8],
    ) -> Result<BleController<'d>, Error>
    where
        T: Interrupt,
        I: Binding<T, LowPrioInterruptHandler>
            + Binding<interrupt::typelevel::RADIO, HighPrioInterruptHandler>
            + Binding<interrupt::typelevel::TIMER0, HighPrioInterruptHandler>
            + Binding<interrupt::typelevel::RTC0, HighPrioInterruptHandler>
            + Binding<interrupt::typelevel::CLOCK_POWER, ClockInterruptHandler>
            + Binding<interrupt::typelevel::RNG, RngInterruptHandler>,
    {
        // The radio, timers and RNG are driven through their registers from
        // the interrupt handlers, so we merely take ownership here.
        let _ = p;

        if cortex_m::interrupt::free(|cs| STATE.borrow(cs).borrow().is_some()) {
            return Err(Error::EAGAIN);
        }

        let required = self.bank.set(tag, None)?;
        match mem.len().cmp(&required) {
            CmpOrdering::Less => {
                error!("Memory buffer is too small: {} bytes needed, got {}", required, mem.len());
                return Err(Error::EINVAL);
            }
            CmpOrdering::Equal => (),
            CmpOrdering::Greater => {
                warn!("Memory buffer is too large: {} bytes needed, got {}", required, mem.len());
            }
        }
        self.bank.freeze();

        let link_bytes = self.bank.get(tag)?.link_memory();
        let mut arena = Arena::new(mem);
        let host_mem = arena.alloc_bytes(HCI_QUEUE_SLOTS * SLOT_SIZE, 4)?;
        let data_mem = arena.alloc_bytes(HCI_QUEUE_SLOTS * SLOT_SIZE, 4)?;
        let pool_mem = arena.alloc_bytes(RNG_POOL_SIZE, 4)?;
        let link_mem = arena.alloc_bytes(link_bytes, 4)?;

        FAULT_HANDLER.store(self.fault_handler as *mut (), Ordering::Release);

        lfclk::init(&self.clock);
        rng::init(pool_mem, RNG_POOL_SIZE / 4);

        cortex_m::interrupt::free(|cs| {
            STATE.borrow(cs).borrow_mut().replace(State {
                scheduler: Scheduler::new(),
                session: Session::new(),
                hooks: self.hooks,
                host_queue: HostQueue::new(host_mem),
                data_in: MsgQueue::new(data_mem),
                link_arena: Arena::new(link_mem),
                anchor_us: None,
                hfclk_held: false,
                slot_armed: false,
            })
        });

        LOW_PRIO_IRQ.store(T::IRQ.number(), Ordering::Release);
        WORK_QUEUE.set_pend_hook(pend_low_prio);

        T::set_priority(Priority::P4);
        T::unpend();
        unsafe { T::enable() };

        RADIO::set_priority(Priority::P0);
        RTC0::set_priority(Priority::P0);
        TIMER0::set_priority(Priority::P0);
        CLOCK_POWER::set_priority(Priority::P4);
        RNG::set_priority(Priority::P4);
        RADIO::unpend();
        RTC0::unpend();
        TIMER0::unpend();
        CLOCK_POWER::unpend();
        RNG::unpend();
        unsafe {
            RADIO::enable();
            RTC0::enable();
            TIMER0::enable();
            CLOCK_POWER::enable();
            RNG::enable();
        }

        info!("ble controller enabled, resource cfg tag {}", tag);
        Ok(BleController { _private: PhantomData })
    }
}

/// The enabled BLE controller.
pub struct BleController<'d> {
    // Prevent Send, Sync
    _private: PhantomData<(&'d (), *mut ())>,
}

impl<'d> Drop for BleController<'d> {
    fn drop(&mut self) {
        RADIO::disable();
        RTC0::disable();
        TIMER0::disable();
        CLOCK_POWER::disable();
        RNG::disable();
        WORK_QUEUE.clear_pend_hook();
        LOW_PRIO_IRQ.store(u16::MAX, Ordering::Release);
        rng::deinit();
        lfclk::stop();
        cortex_m::interrupt::free(|cs| STATE.borrow(cs).borrow_mut().take());
        info!("ble controller disabled");
    }
}

impl<'d> BleController<'d> {
    /// Process deferred work. Must be polled for the controller to deliver
    /// session signals, transport notifications and faults.
    pub async fn run(&self) -> ! {
        poll_fn(|ctx| {
            WAKER.register(ctx.waker());
            WORK_QUEUE.drain(|event| match event {
                WorkEvent::Blocked => deliver_session_signal(Signal::Blocked),
                WorkEvent::Cancelled => deliver_session_signal(Signal::Cancelled),
                WorkEvent::InvalidReturn => deliver_session_signal(Signal::InvalidReturn),
                WorkEvent::Overstayed => deliver_session_signal(Signal::Overstayed),
                WorkEvent::SessionIdle => deliver_session_signal(Signal::SessionIdle),
                WorkEvent::SessionClosed => deliver_session_signal(Signal::Closed),
                WorkEvent::HfclkStarted => trace!("hfclk started"),
                WorkEvent::HciAvailable => HCI_WAKER.wake(),
                WorkEvent::Fault { file, line } => fault(file, line),
            });
            Poll::Pending
        })
        .await
    }

    /// Open the timeslot session with `handler` as its signal handler.
    pub fn timeslot_session_open(&self, handler: SignalHandler) -> Result<(), Error> {
        with_state(|s| s.session.open(handler)).unwrap_or(Err(Error::EPERM))
    }

    /// Close the timeslot session, discarding any pending request.
    pub fn timeslot_session_close(&self) -> Result<(), Error> {
        with_state(|s| {
            s.session.close(&WORK_QUEUE)?;
            // A committed but unstarted slot may already hold the radio
            // hardware from its coarse wakeup.
            let withdrawn = matches!(
                s.scheduler.committed(),
                Some(c) if !c.started && c.item.owner == Owner::Timeslot
            );
            if s.scheduler.cancel(Owner::Timeslot) {
                if withdrawn {
                    isr::disarm_slot(s, Owner::Timeslot);
                }
                isr::run_arbitration(s, lfclk::now_us());
            }
            s.anchor_us = None;
            Ok(())
        })
        .unwrap_or(Err(Error::EPERM))
    }

    /// Submit a timeslot request on the open session.
    ///
    /// Callable from the signal handler too: a distance-anchored request
    /// made inside a running slot is held and submitted when the slot ends.
    pub fn timeslot_request(&self, req: &'static TimeslotRequest) -> Result<(), Error> {
        with_state(|s| {
            s.session.request(req)?;
            if s.session.state() == SessionState::Requested {
                let req = unwrap!(s.session.take_pending());
                if let Err(e) = isr::submit_session_request(s, &req) {
                    s.session.rescind();
                    return Err(e);
                }
            }
            Ok(())
        })
        .unwrap_or(Err(Error::EPERM))
    }

    /// Carve per-connection memory for the link-layer collaborator out of
    /// the region reserved at enable time.
    pub fn alloc_link_memory(&self, len: usize, align: usize) -> Result<&'static mut [u8], Error> {
        with_state(|s| s.link_arena.alloc_bytes(len, align)).unwrap_or(Err(Error::EPERM))
    }

    /// Request radio time for a link-layer connection event.
    pub fn conn_event_request(
        &self,
        handle: u8,
        earliest_us: u32,
        latest_start_us: u32,
        length_us: u32,
        priority: SlotPriority,
    ) -> Result<(), Error> {
        with_state(|s| {
            let item = WorkItem {
                owner: Owner::LinkLayer(handle),
                earliest_us,
                latest_start_us,
                length_us,
                priority,
                hfclk: blectlr::timeslot::HfclkMode::XtalGuaranteed,
            };
            s.scheduler.submit(item)?;
            isr::run_arbitration(s, lfclk::now_us());
            Ok(())
        })
        .unwrap_or(Err(Error::EPERM))
    }

    /// Queue an HCI command packet from the host.
    pub fn hci_cmd_put(&self, buf: &[u8]) -> Result<(), Error> {
        cmd_packet_len(buf)?;
        let opcode = [buf[0], buf[1]];
        with_state(|s| {
            match u16::from_le_bytes(opcode) {
                // HCI Reset
                0x0C03 => {
                    let evt = [0x0E, 0x04, 0x01, opcode[0], opcode[1], 0x00];
                    s.host_queue.push(MsgKind::Event, &evt, &WORK_QUEUE)
                }
                _ => {
                    // Command Status with Unknown HCI Command.
                    let evt = [0x0F, 0x04, 0x01, 0x01, opcode[0], opcode[1]];
                    s.host_queue.push(MsgKind::Event, &evt, &WORK_QUEUE)
                }
            }
        })
        .unwrap_or(Err(Error::EPERM))
    }

    /// Queue an ACL data packet from the host.
    pub fn hci_data_put(&self, buf: &[u8]) -> Result<(), Error> {
        let len = data_packet_len(buf)?;
        with_state(|s| s.data_in.push(MsgKind::Data, &buf[..len])).unwrap_or(Err(Error::EPERM))
    }

    /// Fetch the next host-to-controller ACL packet, returning its length.
    ///
    /// This is the link-layer collaborator's side of
    /// [`BleController::hci_data_put`]. Returns [`Error::EAGAIN`] when
    /// nothing is queued.
    pub fn try_data_take(&self, buf: &mut [u8]) -> Result<usize, Error> {
        with_state(|s| s.data_in.pop(buf).map(|(_, len)| len)).unwrap_or(Err(Error::EPERM))
    }

    /// Fetch the next queued HCI message, if any.
    ///
    /// Returns [`Error::EAGAIN`] when nothing is queued. The next message is
    /// announced through [`BleController::hci_get`] waking.
    pub fn try_hci_get(&self, buf: &mut [u8]) -> Result<(MsgKind, usize), Error> {
        with_state(|s| s.host_queue.pop(buf)).unwrap_or(Err(Error::EPERM))
    }

    /// Fetch the next queued HCI message, waiting until one is available.
    pub async fn hci_get(&self, buf: &mut [u8]) -> Result<(MsgKind, usize), Error> {
        poll_fn(|ctx| match self.try_hci_get(buf) {
            Err(Error::EAGAIN) => {
                HCI_WAKER.register(ctx.waker());
                // Check again in case the queue filled before registration.
                match self.try_hci_get(buf) {
                    Err(Error::EAGAIN) => Poll::Pending,
                    res => Poll::Ready(res),
                }
            }
            res => Poll::Ready(res),
        })
        .await
    }

    /// Fill `dest` with random bytes from the entropy pool, returning the
    /// number of bytes written.
    pub fn try_rand_vector_get(&self, dest: &mut [u8]) -> usize {
        rng::try_fill(dest)
    }

    /// Fill `dest` completely with random bytes.
    pub async fn rand_vector_get(&self, dest: &mut [u8]) {
        rng::fill(dest).await
    }

    /// The current die temperature.
    pub fn get_temperature(&self) -> Temperature {
        temp::measure()
    }

    /// The controller build revision.
    pub fn build_revision(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Request the high-frequency crystal oscillator.
    pub fn request_hfclk(&self) -> Result<hfclk::Hfclk, Error> {
        hfclk::Hfclk::new()
    }

    /// A blocking `rand_core` generator over the entropy pool.
    pub fn rng(&self) -> rng::Rng<'_> {
        rng::Rng::new()
    }
}

// Low priority interrupts
pub struct LowPrioInterruptHandler;
impl<T: Interrupt> Handler<T> for LowPrioInterruptHandler {
    unsafe fn on_interrupt() {
        WAKER.wake();
    }
}

pub struct ClockInterruptHandler;
impl Handler<interrupt::typelevel::CLOCK_POWER> for ClockInterruptHandler {
    unsafe fn on_interrupt() {
        isr::power_clock_isr();
    }
}

pub struct RngInterruptHandler;
impl Handler<interrupt::typelevel::RNG> for RngInterruptHandler {
    unsafe fn on_interrupt() {
        isr::rng_isr();
    }
}

// High priority interrupts
pub struct HighPrioInterruptHandler;
impl Handler<interrupt::typelevel::RADIO> for HighPrioInterruptHandler {
    unsafe fn on_interrupt() {
        isr::radio_isr();
    }
}

impl Handler<interrupt::typelevel::TIMER0> for HighPrioInterruptHandler {
    unsafe fn on_interrupt() {
        isr::timer0_isr();
    }
}

impl Handler<interrupt::typelevel::RTC0> for HighPrioInterruptHandler {
    unsafe fn on_interrupt() {
        isr::rtc0_isr();
    }
}

fn deliver_session_signal(signal: Signal) {
    let handler = with_state(|s| {
        if s.session.wants_low_prio(signal) {
            s.session.handler()
        } else {
            None
        }
    })
    .flatten();
    // The handler runs with the state lock dropped so it may call back into
    // the controller.
    let Some(handler) = handler else { return };
    let action = handler(signal);
    with_state(|s| {
        s.session.apply_low_prio_action(action, &WORK_QUEUE);
        // A request held inside a running slot stays held until slot end.
        if s.session.state() == SessionState::Requested {
            if let Some(req) = s.session.take_pending() {
                if isr::submit_session_request(s, &req).is_err() {
                    s.session.on_blocked(&WORK_QUEUE);
                }
            }
        }
    });
}

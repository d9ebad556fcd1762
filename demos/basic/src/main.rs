//! Two cooperating tasks driven by the host simulation port, mirroring the
//! original core's `osal_main.c`: disable interrupts, initialize, register
//! tasks, kick the heap, enable interrupts, run.

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use osal::{Os, Port as _, TaskHandle, SYS_EVENT_MSG};
use osal_port_std::StdPort;

const HEAP_BYTES: usize = 8192;
const EVT_TICK: u16 = 0x0001;

static SYSTEM: Os<StdPort, HEAP_BYTES> = Os::new(8);
static PRINT_TASK: OnceLock<TaskHandle> = OnceLock::new();

fn print_task_init(me: TaskHandle) {
    PRINT_TASK.set(me).ok();
    SYSTEM.start_timer(me, EVT_TICK, 50, 50);
}

fn print_task_handler(me: TaskHandle, events: u16) -> u16 {
    if events & EVT_TICK != 0 {
        log::info!("print_task: tick at {} ms", SYSTEM.millis());
    }
    if events & SYS_EVENT_MSG != 0 {
        while let Some(msg) = SYSTEM.msg_receive(me) {
            log::info!("print_task: received {:?}", msg.as_slice());
            SYSTEM.msg_deallocate(msg);
        }
    }
    0
}

fn statistics_task_init(me: TaskHandle) {
    SYSTEM.start_timer(me, EVT_TICK, 200, 200);
}

fn statistics_task_handler(_me: TaskHandle, events: u16) -> u16 {
    if events & EVT_TICK != 0 {
        log::info!(
            "statistics_task: {} active timers, uptime {} ms",
            SYSTEM.timer_num_active(),
            SYSTEM.millis()
        );
        if let Some(target) = PRINT_TASK.get().copied() {
            if let Some(mut msg) = SYSTEM.msg_allocate(4) {
                msg.copy_from_slice(&(SYSTEM.millis()).to_ne_bytes());
                SYSTEM.msg_send(Some(target), msg);
            }
        }
    }
    0
}

fn main() {
    env_logger::init();

    StdPort::set_tick_sink(|ms| SYSTEM.on_tick(ms));

    StdPort::disable_interrupts();
    SYSTEM.init();

    SYSTEM
        .add_task(print_task_init, print_task_handler, 1)
        .expect("failed to register print_task");
    SYSTEM
        .add_task(statistics_task_init, statistics_task_handler, 2)
        .expect("failed to register statistics_task");

    SYSTEM.mem_kick();

    StdPort::enable_interrupts();

    SYSTEM.run_init();

    // A bare `SYSTEM.run()` busy-polls; here we add the idle hook the
    // scheduler's contract explicitly permits, so the demo doesn't spin a
    // host CPU core at 100%.
    loop {
        if !SYSTEM.poll() {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

//! RTIC firmware binary: hardware wiring around the host-testable core
//! (`isr`, `cmd`, `link`). Gated behind the `firmware` feature so `cargo
//! test` on a host target never needs `cortex-m`/`hal` to resolve.
//!
//! Board/MCU selection mirrors the teacher's `h7`/`g4` feature split; only
//! the clock tree and USART/timer register names differ between them.

#![no_main]
#![no_std]

use cfg_if::cfg_if;
use cortex_m::asm;
use hal::{
    clocks::Clocks,
    gpio::{Pin, PinMode, Port},
    pac,
    timer::{Timer, TimerInterrupt},
    usart::{Usart, UsartConfig},
};

use motor_link::{
    cmd::{CmdEffect, CommandProcessor},
    config::PersistedConfig,
    events::{EventKind, EventQueue},
    isr::{Channel, Uart as IsrUart},
    link::{BaudControl, LinkManager},
    ProtocolId,
};

/// The update cadence driving `Channel::tick`/`LinkManager::tick`. 100Hz is
/// comfortably faster than the fastest locked-phase cadence (Shengyi's
/// 100ms periodic heartbeat) without over-driving the TX spin budget.
const UPDATE_RATE_HZ: f32 = 100.;

/// Event-queue slot count. "Typically 32" per the queue's own doc comment.
const EVENT_QUEUE_CAPACITY: usize = 32;

static EVENTS: EventQueue<EVENT_QUEUE_CAPACITY> = EventQueue::new();

/// Thin adapter so `isr::Channel` can drive the real USART without knowing
/// about `hal`'s register-level API.
struct HalUart {
    usart: Usart<pac::USART2>,
}

impl IsrUart for HalUart {
    fn try_read(&mut self) -> Option<u8> {
        self.usart.read().ok()
    }

    fn tx_ready(&mut self) -> bool {
        self.usart.is_tx_idle()
    }

    fn write_byte(&mut self, byte: u8) {
        let _ = self.usart.write_one(byte);
    }
}

struct HalBaudControl<'a> {
    usart: &'a mut Usart<pac::USART2>,
}

impl BaudControl for HalBaudControl<'_> {
    fn disable(&mut self) {
        self.usart.disable();
    }

    fn set_brr(&mut self, brr: u32) {
        self.usart.set_brr(brr);
    }

    fn enable(&mut self) {
        self.usart.enable();
    }
}

#[rtic::app(device = pac, peripherals = false, dispatchers = [EXTI9_5])]
mod app {
    use super::*;

    #[shared]
    struct Shared {
        channel: Channel<HalUart, EVENT_QUEUE_CAPACITY>,
        cmd: CommandProcessor,
        link: LinkManager,
        cfg: PersistedConfig,
    }

    #[local]
    struct Local {
        update_timer: Timer<pac::TIM15>,
        update_isr_loop_i: u32,
        applied_baud: u32,
        clock_cfg: Clocks,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local, init::Monotonics) {
        let _cp = cx.core;
        let dp = pac::Peripherals::take().unwrap();

        cfg_if! {
            if #[cfg(feature = "h7")] {
                let clock_cfg = Clocks::full_speed();
            } else {
                let clock_cfg = Clocks::default();
            }
        }
        clock_cfg.setup().ok();

        let mut rx_pin = Pin::new(Port::A, 3, PinMode::Alt(7));
        let mut tx_pin = Pin::new(Port::A, 2, PinMode::Alt(7));
        rx_pin.output_speed(hal::gpio::OutputSpeed::High);
        tx_pin.output_speed(hal::gpio::OutputSpeed::High);

        let usart = Usart::new(dp.USART2, 9600, UsartConfig::default(), &clock_cfg);

        let mut update_timer = Timer::new_tim15(dp.TIM15, UPDATE_RATE_HZ, Default::default(), &clock_cfg);
        update_timer.enable_interrupt(TimerInterrupt::Update);
        update_timer.enable();

        let mut channel = Channel::new(HalUart { usart });
        channel.init(&EVENTS);

        (
            Shared {
                channel,
                cmd: CommandProcessor::new(),
                link: LinkManager::new(),
                cfg: PersistedConfig::default(),
            },
            Local {
                update_timer,
                update_isr_loop_i: 0,
                applied_baud: motor_link::link::BAUD_9600,
                clock_cfg,
            },
            init::Monotonics(),
        )
    }

    #[idle]
    fn idle(_cx: idle::Context) -> ! {
        loop {
            asm::nop();
        }
    }

    /// Runs on the ~100Hz `TIM15` update interrupt: drives the ISR channel's
    /// RX/TX scheduling, drains the event queue into `cmd`, and lets `link`
    /// run its probe/locked periodic encoders. A full deployment would also
    /// bind byte-level receive to the USART's own RXNE interrupt; polling it
    /// from this periodic task instead keeps the core's `tick(now_ms)`
    /// contract identical to what `cmd`/`link`'s own tests already exercise.
    #[task(
        binds = TIM1_BRK_TIM15,
        shared = [channel, cmd, link, cfg],
        local = [update_timer, update_isr_loop_i, applied_baud, clock_cfg],
        priority = 5
    )]
    fn update_isr(mut cx: update_isr::Context) {
        cx.local.update_timer.clear_interrupt(TimerInterrupt::Update);
        *cx.local.update_isr_loop_i += 1;
        let now_ms = *cx.local.update_isr_loop_i * (1000 / UPDATE_RATE_HZ as u32);

        (cx.shared.channel, cx.shared.cmd, cx.shared.link, cx.shared.cfg).lock(
            |channel, cmd, link, cfg| {
                channel.tick(now_ms);

                while let Some(event) = EVENTS.pop() {
                    let protocol_hint = matches!(event.kind, EventKind::MotorState)
                        .then(|| event.state_protocol_opcode().0);

                    if let CmdEffect::ProtocolSwitchRequested(idx) =
                        cmd.handle_event(event, channel, cfg, now_ms)
                    {
                        link.switch_protocol(idx);
                    }

                    if let Some(raw_protocol) = protocol_hint {
                        if let Ok(protocol) = ProtocolId::try_from(raw_protocol) {
                            link.on_frame_observed(protocol);
                        }
                    }
                }

                link.tick(now_ms, channel, cfg, &cmd.intent, &cmd.status, cmd.handshake_ok());

                if link.baud() != *cx.local.applied_baud {
                    *cx.local.applied_baud = link.baud();
                    let pclk_hz = cx.local.clock_cfg.hclk();
                    let mut baud_ctrl = HalBaudControl { usart: channel.uart_mut() };
                    link.sync_baud(pclk_hz, &mut baud_ctrl);
                }
            },
        );
    }
}

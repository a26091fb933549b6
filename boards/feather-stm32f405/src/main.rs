#![deny(unsafe_code)]
#![deny(warnings)]
#![no_main]
#![no_std]

use defmt_rtt as _; // global logger
use panic_probe as _;
use rtic::app;
use rtic_monotonics::stm32::prelude::*;

mod config;
mod modem;
mod radio;
mod sleep;
mod time;

stm32_tim2_monotonic!(Mono, 1_000_000);

#[app(device = embassy_stm32, peripherals = true, dispatchers = [SPI1, SPI2])]
mod app {
    use super::*;
    use cortex_m::peripheral::SCB;
    use defmt::{error, info, warn};
    use embassy_futures::select::select;
    use embassy_stm32::gpio::{Level, Output, Speed};
    use embassy_stm32::peripherals;
    use embassy_stm32::rcc::{Hse, HseMode, LsConfig, LseConfig, LseMode};
    use embassy_stm32::rtc::{Rtc, RtcConfig};
    use embassy_stm32::time::Hertz;
    use embassy_stm32::usart::{self, Uart};
    use embassy_time::Delay;
    use hub_core::{Hub, HubConfig, Inbox, RadioHandle, RadioLink, Step};
    use static_cell::{ConstStaticCell, StaticCell};

    use crate::config::{
        HubImageBuffer, IDLE_POLL_MS, IMAGE_CAPACITY, MODEM_BAUD, MODEM_RETRY_SECS, RADIO_BAUD,
        RX_RING_LEN,
    };
    use crate::modem::{ModemPort, PowerKey};
    use crate::radio::{RadioBridge, INBOX_SIGNAL};
    use crate::time::{MonoClock, RtcClock};

    type Peri<T> = embassy_stm32::Peri<'static, T>;
    type Producer = RadioHandle<'static, 'static, IMAGE_CAPACITY>;
    type Consumer = Inbox<'static, 'static, IMAGE_CAPACITY>;

    embassy_stm32::bind_interrupts!(struct Irqs {
        USART1 => usart::InterruptHandler<peripherals::USART1>;
        USART3 => usart::InterruptHandler<peripherals::USART3>;
    });

    /// Cellular modem on USART3 (Feather TX/RX pins)
    struct ModemPeripherals {
        usart: Peri<peripherals::USART3>,
        tx: Peri<peripherals::PB10>,
        rx: Peri<peripherals::PB11>,
        tx_dma: Peri<peripherals::DMA1_CH3>,
        rx_dma: Peri<peripherals::DMA1_CH1>,
        power_key: Peri<peripherals::PC6>,
    }

    /// Radio co-processor on USART1 (Feather SCL/SDA pads)
    struct RadioPeripherals {
        usart: Peri<peripherals::USART1>,
        tx: Peri<peripherals::PB6>,
        rx: Peri<peripherals::PB7>,
        tx_dma: Peri<peripherals::DMA2_CH7>,
        rx_dma: Peri<peripherals::DMA2_CH2>,
    }

    #[shared]
    struct Shared {}

    #[local]
    struct Local {
        led: Output<'static>,
        scb: SCB,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local) {
        info!("Field hub starting...");

        // Adafruit Feather STM32F405: 12 MHz HSE, 32.768 kHz LSE (PC14/PC15)
        let mut config = embassy_stm32::Config::default();
        config.rcc.hse = Some(Hse {
            freq: Hertz(12_000_000),
            mode: HseMode::Oscillator,
        });

        // HSE (12 MHz) / PREDIV(6) = 2 MHz (PLL input)
        // 2 MHz * MUL(168) = 336 MHz (VCO)
        // VCO / DIVP(4) = 84 MHz (SYSCLK)
        config.rcc.pll_src = embassy_stm32::rcc::PllSource::HSE;
        config.rcc.pll = Some(embassy_stm32::rcc::Pll {
            prediv: embassy_stm32::rcc::PllPreDiv::DIV6,
            mul: embassy_stm32::rcc::PllMul::MUL168,
            divp: Some(embassy_stm32::rcc::PllPDiv::DIV4),
            divq: None,
            divr: None,
        });
        config.rcc.sys = embassy_stm32::rcc::Sysclk::PLL1_P;
        config.rcc.ahb_pre = embassy_stm32::rcc::AHBPrescaler::DIV1; // 84 MHz
        config.rcc.apb1_pre = embassy_stm32::rcc::APBPrescaler::DIV2; // 42 MHz
        config.rcc.apb2_pre = embassy_stm32::rcc::APBPrescaler::DIV1; // 84 MHz

        // The RTC runs from the LSE so local time survives standby
        config.rcc.ls = LsConfig {
            rtc: embassy_stm32::rcc::RtcClockSource::LSE,
            lsi: false,
            lse: Some(LseConfig {
                frequency: Hertz(32_768),
                mode: LseMode::Oscillator(embassy_stm32::rcc::LseDrive::MediumHigh),
            }),
        };

        let p = embassy_stm32::init(config);

        // TIM2 on APB1: timer clock = 2*APB1 when prescaler != 1
        let timer_clock_hz = 84_000_000;
        Mono::start(timer_clock_hz);
        info!("TIM2 monotonic timer initialized at 1 MHz");

        let rtc = Rtc::new(p.RTC, RtcConfig::default());
        time::initialize_rtc(rtc);
        if sleep::clear_wakeup() {
            info!("Woke from standby");
        }

        let led = Output::new(p.PC1, Level::High, Speed::Low);

        static IMAGE_BUFFER: ConstStaticCell<HubImageBuffer> =
            ConstStaticCell::new(HubImageBuffer::new());
        static RADIO_LINK: StaticCell<RadioLink<'static, IMAGE_CAPACITY>> = StaticCell::new();

        let hub_config = config::hub_config();
        let link = RADIO_LINK.init(RadioLink::new(IMAGE_BUFFER.take(), hub_config.image));
        let (producer, inbox) = link.split();
        info!("Image buffer: {} bytes", IMAGE_CAPACITY);

        let modem_periph = ModemPeripherals {
            usart: p.USART3,
            tx: p.PB10,
            rx: p.PB11,
            tx_dma: p.DMA1_CH3,
            rx_dma: p.DMA1_CH1,
            power_key: p.PC6,
        };
        let radio_periph = RadioPeripherals {
            usart: p.USART1,
            tx: p.PB6,
            rx: p.PB7,
            tx_dma: p.DMA2_CH7,
            rx_dma: p.DMA2_CH2,
        };

        heartbeat::spawn().ok();
        radio_task::spawn(radio_periph, producer, hub_config.radio_channel).ok();
        hub_task::spawn(modem_periph, inbox, hub_config).ok();

        (Shared {}, Local { led, scb: cx.core.SCB })
    }

    /// Heartbeat task
    #[task(priority = 1, local = [led])]
    async fn heartbeat(cx: heartbeat::Context) {
        loop {
            cx.local.led.set_high();
            Mono::delay(20.millis()).await;
            cx.local.led.set_low();
            Mono::delay(4980.millis()).await;
        }
    }

    /// Radio receive task
    ///
    /// Runs above the hub task so frames keep flowing into the inbox while
    /// an upload is waiting on the modem.
    #[task(priority = 2)]
    async fn radio_task(
        _cx: radio_task::Context,
        periph: RadioPeripherals,
        radio: Producer,
        channel: u8,
    ) -> ! {
        static RX_RING: StaticCell<[u8; RX_RING_LEN]> = StaticCell::new();

        let mut uart_config = usart::Config::default();
        uart_config.baudrate = RADIO_BAUD;
        let uart = match Uart::new(
            periph.usart,
            periph.rx,
            periph.tx,
            Irqs,
            periph.tx_dma,
            periph.rx_dma,
            uart_config,
        ) {
            Ok(uart) => uart,
            Err(e) => {
                error!("Radio UART rejected its configuration: {:?}", e);
                halt().await
            }
        };
        let (tx, rx) = uart.split();
        let rx = rx.into_ring_buffered(RX_RING.init([0; RX_RING_LEN]));
        let mut bridge = RadioBridge::new(tx, rx);

        match bridge.select_channel(channel).await {
            Ok(()) => info!("Radio listening on channel {}", channel),
            Err(e) => warn!("Radio channel select failed: {:?}", e),
        }

        bridge.run(&radio, &INBOX_SIGNAL).await
    }

    /// Upload orchestrator task
    #[task(priority = 1, local = [scb])]
    async fn hub_task(
        cx: hub_task::Context,
        periph: ModemPeripherals,
        inbox: Consumer,
        hub_config: HubConfig,
    ) -> ! {
        static RX_RING: StaticCell<[u8; RX_RING_LEN]> = StaticCell::new();

        let mut uart_config = usart::Config::default();
        uart_config.baudrate = MODEM_BAUD;
        let uart = match Uart::new(
            periph.usart,
            periph.rx,
            periph.tx,
            Irqs,
            periph.tx_dma,
            periph.rx_dma,
            uart_config,
        ) {
            Ok(uart) => uart,
            Err(e) => {
                error!("Modem UART rejected its configuration: {:?}", e);
                halt().await
            }
        };
        let (tx, rx) = uart.split();
        let rx = rx.into_ring_buffered(RX_RING.init([0; RX_RING_LEN]));
        let port = ModemPort::new(tx, rx);
        let mut power_key = PowerKey::new(Output::new(periph.power_key, Level::Low, Speed::Low));

        let mut hub = match Hub::new(hub_config, inbox, port, Delay, MonoClock, RtcClock) {
            Ok(hub) => hub,
            Err(e) => {
                error!("Invalid hub configuration: {:?}", e);
                halt().await
            }
        };

        // Step 1: bring the modem up, powering it on if it stays silent
        if let Err(e) = hub.boot().await {
            warn!("Modem silent ({:?}), pulsing power key", e);
            power_key.toggle(&mut Delay).await;
            if let Err(e) = hub.boot().await {
                error!("Modem did not come up: {:?}", e);
                sleep::enter_standby(cx.local.scb, MODEM_RETRY_SECS);
            }
        }

        // Step 2: serve uploads until the scheduler calls for sleep
        loop {
            match hub.step().await {
                Step::Busy => {}
                Step::Idle => {
                    select(INBOX_SIGNAL.wait(), Mono::delay(IDLE_POLL_MS.millis())).await;
                }
                Step::Sleep { secs, .. } => sleep::enter_standby(cx.local.scb, secs),
                Step::ModemDown => {
                    info!("Powering modem back up for late radio traffic");
                    power_key.toggle(&mut Delay).await;
                    if let Err(e) = hub.boot().await {
                        error!("Modem did not come back: {:?}", e);
                        sleep::enter_standby(cx.local.scb, MODEM_RETRY_SECS);
                    }
                }
            }
        }
    }

    /// Park a task whose hardware could not be configured
    async fn halt() -> ! {
        loop {
            Mono::delay(60.secs()).await;
        }
    }

    /// RTIC idle task - WFI sleep mode when no tasks active
    #[idle]
    fn idle(_cx: idle::Context) -> ! {
        loop {
            cortex_m::asm::wfi();
        }
    }
}

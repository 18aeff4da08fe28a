use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use usbmouse::config::DriverConfig;
use usbmouse::driver::{DriverRegistration, MouseDriver};
use usbmouse::input::{EventChannelSink, InputEvent, InputSink};
use usbmouse::replay::ReplayDevice;
use usbmouse::usb::{DeviceAddress, LoopbackTransport, UsbDevice, UsbTransport};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = DriverConfig::default_path();
    let config = DriverConfig::load_or_create(&config_path).await?;
    info!("Using configuration from {}", config_path.display());

    let transport = Arc::new(LoopbackTransport::new());
    let (sink, events) = EventChannelSink::new(config.event_queue_capacity);
    let sink = Arc::new(sink);

    let printer = tokio::spawn(print_events(events));

    let driver = MouseDriver::new(
        Arc::clone(&transport) as Arc<dyn UsbTransport>,
        Arc::clone(&sink) as Arc<dyn InputSink>,
        &config,
    );
    let mut registration = DriverRegistration::register(driver);

    let device = UsbDevice::new(
        DeviceAddress { bus: 1, address: 4 },
        "0000:00:14.0",
        "1",
        config.replay.device,
    );
    let replay = ReplayDevice::new(Arc::clone(&transport), device.clone(), &config.replay);

    if !registration.device_added(&device, &replay.interface())? {
        return Err(eyre!(
            "Driver did not bind to {} ({})",
            device.id(),
            device.address()
        ));
    }

    let cancel = CancellationToken::new();
    let mut replay_task = tokio::spawn(replay.run(cancel.clone()));
    let summary = tokio::select! {
        summary = &mut replay_task => summary?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping replay");
            cancel.cancel();
            replay_task.await?
        }
    };
    info!(
        "Replay finished: {} delivered, {} missed",
        summary.delivered, summary.missed
    );

    // Detach waits for in-flight completions
    tokio::task::block_in_place(|| {
        if let Some(binding) = registration.binding(device.address()) {
            let stats = binding.stats();
            info!(
                "{}: {} report(s), {} transient error(s), channel {:?}",
                binding.path(),
                stats.reports,
                stats.transient_errors,
                binding.channel_state()
            );
        }
        registration.device_removed(device.address());
        registration.deregister();
    });

    if sink.dropped_events() > 0 {
        warn!("{} input event(s) were dropped", sink.dropped_events());
    }
    drop(sink);
    printer.await?;

    Ok(())
}

async fn print_events(mut events: mpsc::Receiver<InputEvent>) {
    while let Some(event) = events.recv().await {
        info!("{}", event);
    }
    info!("Input event stream closed");
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

mod commandline;

use anyhow::{Context, Result};
use clap::Parser;
use commandline::{CliArgs, CliCommands};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

use jbdbms_lib::serialport::SerialTransport;
use jbdbms_lib::session::BmsSession;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn print_snapshot(session: &BmsSession<SerialTransport>) {
    println!("Telemetry: {:?}", session.telemetry());
    println!("Fault counts: {:?}", session.fault_counts());
    if session.has_communication_error() {
        println!("Communication error on the last exchange");
    }
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let transport = SerialTransport::open(&args.device)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    let mut session = BmsSession::new();
    session.start(transport, args.timeout);

    match args.command {
        CliCommands::Poll => {
            session.poll();
            print_snapshot(&session);
        }
        CliCommands::Monitor { interval } => {
            info!("Starting monitor mode: interval={interval:?}");
            loop {
                session.poll();
                print_snapshot(&session);
                std::thread::sleep(interval);
            }
        }
        CliCommands::SetMosfet { charge, discharge } => {
            session.set_mosfet_control(charge, discharge);
            if session.has_communication_error() {
                anyhow::bail!("MOSFET control command was not acknowledged");
            }
            info!("MOSFET control acknowledged: charge={charge} discharge={discharge}");
        }
    }

    Ok(())
}

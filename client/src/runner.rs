use crate::cli::{Cli, LevelFilter, SubCommands};
use crate::settings::Settings;
use crate::Instrument;
use anyhow::{Context, Result};
use clap::Parser;
use instrument_scpi::block_payload;
use log::debug;
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode};

fn connect(settings: &Settings, name: &str) -> Result<Instrument> {
    let address = settings.resolve(name)?;
    let mut instrument = Instrument::default();
    instrument
        .connect_with(&address, settings.timeouts())
        .context(format!("Unable to connect to {}", address))?;
    Ok(instrument)
}

pub fn run_cli() -> Result<()> {
    let cli: Cli = Cli::parse();

    CombinedLogger::init(vec![TermLogger::new(
        match cli.log_level {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Error => log::LevelFilter::Error,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Trace => log::LevelFilter::Trace,
        },
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])
    .context("Could not configure the logger")?;

    let mut settings = Settings::read(&cli.config)?;
    if let Some(open_timeout) = cli.open_timeout {
        settings.open_timeout_ms = open_timeout;
    }
    if let Some(timeout) = cli.timeout {
        settings.command_timeout_ms = timeout;
    }
    debug!("Using settings from {}", cli.config.to_string_lossy());

    match &cli.command {
        SubCommands::ListUsb { json } => {
            let devices = Instrument::list_usb().context("Unable to list USB devices")?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("No USBTMC devices found.");
            } else {
                for device in devices {
                    println!("{}", device.to_address());
                    println!("    {}", device);
                }
            }
        }
        SubCommands::ListSerial => {
            let ports =
                Instrument::list_serial_ports().context("Unable to list serial ports")?;
            for port in ports {
                println!("{}", port);
            }
        }
        SubCommands::Idn { address } => {
            let idn = connect(&settings, address)?.idn().context("*IDN? failed")?;
            println!("Manufacturer: {}", idn.manufacturer());
            println!("Model: {}", idn.model());
            println!("Serial Number: {}", idn.serial_number());
            println!("Firmware: {}", idn.firmware_revision());
        }
        SubCommands::Send { address, command } => {
            connect(&settings, address)?
                .send(command)
                .context(format!("Unable to send '{}'", command))?;
        }
        SubCommands::Query {
            address,
            command,
            binary,
        } => {
            let response = connect(&settings, address)?
                .query_raw(command)
                .context(format!("Query '{}' failed", command))?;
            if *binary {
                match block_payload(&response)? {
                    Some(payload) => println!("{} byte block", payload.len()),
                    None => println!("Not a binary block ({} bytes)", response.len()),
                }
            } else {
                print!("{}", String::from_utf8_lossy(&response));
                if !response.ends_with(b"\n") {
                    println!();
                }
            }
        }
        SubCommands::Alias { name, resource } => {
            let address = settings.resolve(resource)?;
            settings.aliases.insert(name.clone(), address.to_string());
            settings.write(&cli.config)?;
            println!("{} => {}", name, address);
        }
    }

    Ok(())
}

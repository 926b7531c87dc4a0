use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr, bail};
use serde_json::to_string_pretty;
use tracing::{debug, info, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, prelude::*};

use orb_gsm_modem::{
    EventKind, GsmModem, ModemEvent, SmsMessage,
    config::{Cli, Command, Config},
    startup,
};

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let default_level = if cli.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::from_cli(&cli);
    debug!(port = %config.connection.port, mode = %config.sms_mode, "starting");

    let mut modem = startup::start(&config)
        .wrap_err_with(|| format!("failed to connect to '{}'", config.connection.port))?;
    if !modem.is_open() {
        startup::connect(&mut modem, &config)
            .wrap_err_with(|| format!("failed to connect to '{}'", config.connection.port))?;
    }

    let result = run(&mut modem, &config, cli.command);
    modem.close();

    result
}

fn run(modem: &mut GsmModem, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Test => print_status(modem),
        Command::SendSms { number, message } => {
            if !modem.send_sms(&number, &message) {
                bail!("modem did not accept the message to {number}");
            }
            info!(%number, "message sent");
        }
        Command::Monitor { interval } => monitor(modem, Duration::from_secs(interval)),
        Command::Inbox => {
            let inbox = modem.get_inbox();
            println!("{}", to_string_pretty(&inbox)?);
        }
        Command::At { command } => {
            let response = modem
                .execute_command(&command, config.timeouts.command)
                .wrap_err_with(|| format!("failed to run '{command}'"))?;
            println!("{}", response.trim());
        }
    }

    Ok(())
}

fn print_status(modem: &mut GsmModem) {
    match modem.get_modem_info() {
        Some(info) => {
            println!("Manufacturer: {}", info.manufacturer.as_deref().unwrap_or("-"));
            println!("Model:        {}", info.model.as_deref().unwrap_or("-"));
            println!("IMEI:         {}", info.imei.as_deref().unwrap_or("-"));
        }
        None => println!("Modem info unavailable"),
    }
    match modem.get_sim_info() {
        Some(sim) => {
            println!("IMSI:         {}", sim.imsi.as_deref().unwrap_or("-"));
            println!("SIM status:   {:?}", sim.status);
        }
        None => println!("SIM info unavailable"),
    }
    match modem.get_network_info() {
        Some(network) => println!("Network:      {} ({})", network.operator, network.mode),
        None => println!("Network:      not registered"),
    }
    match modem.get_signal_strength() {
        Some(signal) => println!("Signal:       {signal}%"),
        None => println!("Signal:       unknown"),
    }
    if let Some(number) = modem.get_own_number() {
        println!("Own number:   {number}");
    }
}

fn monitor(modem: &mut GsmModem, interval: Duration) -> ! {
    info!(?interval, "monitoring modem, press Ctrl-C to stop");
    modem.on(EventKind::IncomingCall, |event| {
        if let ModemEvent::IncomingCall { number } = event {
            info!(caller = number.as_deref().unwrap_or("unknown"), "incoming call");
        }
    });
    modem.on(EventKind::UssdResponse, |event| {
        if let ModemEvent::UssdResponse(reply) = event {
            info!(%reply, "USSD response");
        }
    });

    let mut known = 0;
    loop {
        let inbox = modem.get_inbox();
        if inbox.len() > known {
            info!(count = inbox.len() - known, "new messages received");
            inbox[known..].iter().for_each(print_message);
        }
        known = inbox.len();

        if let Some(signal) = modem.get_signal_strength() {
            info!(signal, "signal strength");
        }

        // Waiting for unsolicited codes doubles as the polling interval.
        for event in modem.poll_events(interval) {
            if let ModemEvent::NewMessage { storage, index } = event {
                debug!(%storage, index, "new message notification");
            }
        }
    }
}

fn print_message(message: &SmsMessage) {
    println!("----------------------------");
    println!("From:    {}", message.sender);
    println!("Time:    {}", message.timestamp.format("%Y-%m-%d %H:%M:%S"));
    println!("Message: {}", message.body);
    println!("----------------------------");
}

//! `legion` - CLI for legion-link
//!
//! Runs this device as a commander or a field node, and inspects
//! configuration.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use legion_link::cli::{
    Cli, Command, CommanderCommand, ConfigCommand, ConsoleCommand, FieldCommand, CONSOLE_HELP,
};
use legion_link::{
    init_logging, Clock, Config, Coordinator, DeviceRecord, LoggingCapture, NodeEvent, Role,
    SystemClock,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    let config = Config::load_from(cli.config.clone()).context("failed to load configuration")?;

    match cli.command {
        Command::Commander(cmd) => run_commander(config, &cmd).await,
        Command::Field(cmd) => run_field(config, cmd).await,
        Command::Config(cmd) => handle_config(&config, cmd),
    }
}

fn coordinator(config: Config) -> Coordinator {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let capture = Arc::new(LoggingCapture::new(Arc::clone(&clock)));
    Coordinator::new(config, capture, clock)
}

async fn run_commander(config: Config, cmd: &CommanderCommand) -> anyhow::Result<()> {
    let coordinator = coordinator(config);
    coordinator
        .initialize(Role::Commander, cmd.hint.into(), None)
        .await
        .context("failed to start commander")?;

    if let Some(addr) = coordinator.local_addr().await {
        println!("Commander listening on {addr}");
    }
    println!("Type 'help' for commands.");

    let membership = coordinator.on_membership_changed(|devices| {
        println!("{} field node(s) connected", devices.len());
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match ConsoleCommand::parse(&line) {
            Ok(None) => {}
            Ok(Some(ConsoleCommand::Start)) => match coordinator.trigger_global_start().await {
                Ok(fire_at) => {
                    let lead = fire_at - coordinator.synchronized_now().await;
                    println!("Start issued; recording begins in ~{lead} ms");
                }
                Err(e) => eprintln!("error: {e}"),
            },
            Ok(Some(ConsoleCommand::Stop)) => match coordinator.trigger_global_stop().await {
                Ok(()) => println!("Stop issued"),
                Err(e) => eprintln!("error: {e}"),
            },
            Ok(Some(ConsoleCommand::Devices)) => print_devices(&coordinator.devices().await),
            Ok(Some(ConsoleCommand::Status)) => print_status(&coordinator).await,
            Ok(Some(ConsoleCommand::Send { name, data })) => {
                if let Err(e) = coordinator.send_command(&name, data).await {
                    eprintln!("error: {e}");
                }
            }
            Ok(Some(ConsoleCommand::Help)) => println!("{CONSOLE_HELP}"),
            Ok(Some(ConsoleCommand::Quit)) => break,
            Err(message) => eprintln!("{message}"),
        }
    }

    coordinator.teardown().await;
    membership.abort();
    println!("Session ended");
    Ok(())
}

async fn run_field(mut config: Config, cmd: FieldCommand) -> anyhow::Result<()> {
    if let Some(name) = cmd.name {
        config.node.display_name = Some(name);
    }
    if let Some(lens) = cmd.lens {
        config.node.lens_label = lens;
    }
    config.validate()?;

    let coordinator = coordinator(config);
    let mut events = coordinator.subscribe();
    coordinator
        .initialize(Role::FieldNode, cmd.hint.into(), Some(&cmd.address))
        .await
        .with_context(|| format!("failed to join commander at {}", cmd.address))?;
    println!(
        "Joined commander at {} as {}",
        cmd.address,
        coordinator.config().display_name(coordinator.node_id())
    );

    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                NodeEvent::Recording { recording: true, at } => println!("Recording started at {at}"),
                NodeEvent::Recording { recording: false, at } => println!("Recording stopped at {at}"),
                NodeEvent::Message(message) => {
                    if let Some(command) = message.payload.as_ref().and_then(|p| p.command.as_deref()) {
                        println!("Command from commander: {command}");
                    }
                }
                NodeEvent::MembershipChanged(_) | NodeEvent::StateChanged(_) => {}
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    coordinator.teardown().await;
    printer.abort();
    println!("Left session");
    Ok(())
}

fn print_devices(devices: &[DeviceRecord]) {
    if devices.is_empty() {
        println!("No field nodes connected");
        return;
    }
    println!("{:<24} {:<10} {:<6} {:<10} ID", "NAME", "STATUS", "LENS", "PROTOCOL");
    for device in devices {
        println!(
            "{:<24} {:<10} {:<6} {:<10} {}",
            device.display_name,
            device.status.to_string(),
            device.current_lens_label.as_deref().unwrap_or("-"),
            device.protocol.map_or_else(|| "-".to_string(), |p| p.to_string()),
            device.id.short()
        );
    }
}

async fn print_status(coordinator: &Coordinator) {
    println!("legion status");
    println!("-------------");
    println!("Node:          {}", coordinator.node_id());
    println!("State:         {}", coordinator.state());
    if let Some(role) = coordinator.current_role().await {
        println!("Role:          {role}");
    }
    if let Some(hint) = coordinator.current_hint().await {
        println!("Protocol:      {hint}");
    }
    if let Some(addr) = coordinator.local_addr().await {
        println!("Address:       {addr}");
    }
    println!("Recording:     {}", coordinator.is_recording());
    println!("Devices:       {}", coordinator.devices().await.len());
    println!("Sync time:     {}", coordinator.synchronized_now().await);
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Node]");
                println!(
                    "  Display name:       {}",
                    config.node.display_name.as_deref().unwrap_or("(from node id)")
                );
                println!("  Lens label:         {}", config.node.lens_label);
                println!();
                println!("[Network]");
                println!("  Bind address:       {}", config.network.bind_address);
                println!("  Fast port:          {}", config.network.fast_port);
                println!("  Alternate port:     {}", config.network.alternate_port);
                println!(
                    "  Connect timeout:    {}",
                    config
                        .network
                        .connect_timeout_ms
                        .map_or_else(|| "none".to_string(), |ms| format!("{ms} ms"))
                );
                println!("  Write timeout:      {} ms", config.network.write_timeout_ms);
                println!();
                println!("[Sync]");
                println!("  Heartbeat interval: {} ms", config.sync.heartbeat_interval_ms);
                println!("  Liveness timeout:   {} ms", config.sync.liveness_timeout_ms);
                println!("  Start lead:         {} ms", config.sync.lead_ms);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}

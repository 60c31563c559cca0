use anyhow::Result;
use log::info;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use wastecam::{
    BackendKind, CameraBackend, CaptureSession, ClassifyOutcome, Config, InstructionResolver,
    RpiCameraBackend, SessionController, SessionError, StubClassifier, SyntheticBackend,
    WasteCategory,
};

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Devices,
    Switch(Option<String>),
    Classify,
    Restore,
    History,
    Instructions { category: WasteCategory, text: Option<String> },
    State,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    match word.to_lowercase().as_str() {
        "devices" | "d" => Ok(Command::Devices),
        "switch" | "s" => Ok(Command::Switch(
            (!rest.is_empty()).then(|| rest.to_string()),
        )),
        "classify" | "c" | "" => Ok(Command::Classify),
        "restore" | "r" => Ok(Command::Restore),
        "history" | "h" => Ok(Command::History),
        "instructions" | "i" => {
            let (label, text) = match rest.split_once(char::is_whitespace) {
                Some((label, text)) => (label, Some(text.trim().to_string())),
                None => (rest, None),
            };
            let category = label
                .parse::<WasteCategory>()
                .map_err(|e| e.to_string())?;
            Ok(Command::Instructions { category, text })
        }
        "state" => Ok(Command::State),
        "help" | "?" => Ok(Command::Help),
        "quit" | "q" | "exit" => Ok(Command::Quit),
        other => Err(format!("Unknown command '{}', type 'help'", other)),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  classify (or Enter)       freeze the preview and classify it");
    println!("  restore                   resume the live preview");
    println!("  devices                   list cameras");
    println!("  switch [id]               open another camera (default when no id)");
    println!("  history                   show past classifications, newest first");
    println!("  instructions <label> [t]  show or override disposal instructions");
    println!("  state                     show the session state");
    println!("  quit");
}

fn report_error(err: &SessionError) {
    if err.is_retryable_inference() {
        println!("{}. Type 'classify' to retry.", err);
    } else {
        println!("{}. Select a different camera or check permissions.", err);
    }
}

async fn run_command(controller: &SessionController, command: Command) {
    match command {
        Command::Devices => match controller.devices().await {
            Ok(devices) if devices.is_empty() => println!("No cameras found"),
            Ok(devices) => {
                let current = controller.current_device().await.map(|d| d.id);
                for device in devices {
                    let marker = if current.as_deref() == Some(device.id.as_str()) { "*" } else { " " };
                    println!("{} {:<16} {} ({:?})", marker, device.id, device.display_name(), device.facing);
                }
            }
            Err(e) => report_error(&e),
        },
        Command::Switch(id) => match controller.switch_device(id.as_deref()).await {
            Ok(device) => println!("Camera ready: {}", device.display_name()),
            Err(e) => report_error(&e),
        },
        Command::Classify => match controller.classify().await {
            Ok(ClassifyOutcome::Classified(c)) => {
                println!("This is {} ({})", c.result.label, c.entry.confidence_percent());
                println!("{}", c.instructions);
            }
            Ok(ClassifyOutcome::Ignored) => println!("Already classified. Type 'restore' to resume the preview."),
            Ok(ClassifyOutcome::Discarded) => println!("Frame changed before the result arrived."),
            Err(e) => report_error(&e),
        },
        Command::Restore => match controller.restore().await {
            Ok(()) => println!("Live preview resumed"),
            Err(e) => report_error(&e),
        },
        Command::History => {
            let history = controller.history().await;
            if history.is_empty() {
                println!("No classifications yet");
            }
            for entry in history.iter().rev() {
                println!("{}", entry);
            }
        }
        Command::Instructions { category, text: Some(text) } => {
            match controller.set_instructions(category, &text).await {
                Ok(()) => println!("Instructions for {} updated", category),
                Err(e) => println!("Could not save instructions: {:#}", e),
            }
        }
        Command::Instructions { category, text: None } => {
            println!("{}", controller.instructions_for(category).await);
        }
        Command::State => {
            let status = controller.status().await;
            println!("{:?}", status.state);
            if let (Some(device), Some(opened_at)) = (&status.device, status.stream_opened_at) {
                println!("  camera  {} since {}", device.display_name(), opened_at.format("%H:%M:%S"));
            }
            if let Some(frame) = status.frozen_frame {
                println!("  frozen  frame {}", frame);
            }
            if let Some(captured_at) = status.frame_captured_at {
                println!("  frame   captured {}", captured_at.format("%H:%M:%S%.3f"));
            }
        }
        Command::Help => print_help(),
        Command::Quit => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("♻️ Starting waste sorter camera");

    // Load configuration
    let config = Config::load()?;
    info!(
        "Configuration loaded: {:?} backend, {}x{} frames",
        config.camera.backend, config.camera.width, config.camera.height
    );

    let backend: Arc<dyn CameraBackend> = match config.camera.backend {
        BackendKind::Rpicam => Arc::new(
            RpiCameraBackend::new(&config.paths.preview_dir)
                .with_quality(config.camera.jpeg_quality)
                .with_timelapse_ms(config.camera.preview_interval_ms),
        ),
        BackendKind::Synthetic => Arc::new(SyntheticBackend::with_default_devices()),
    };

    let capture = CaptureSession::new(
        backend,
        config.camera.stream_settings(),
        config.camera.preferred_facing,
    );
    let instructions = InstructionResolver::with_overrides_file(&config.paths.instructions_file)?;
    let controller = Arc::new(SessionController::new(
        capture,
        config.camera.mirror,
        Arc::new(StubClassifier::new()),
        instructions,
    ));

    match controller.start(config.camera.device_id.as_deref()).await {
        Ok(device) => println!("Camera ready: {}", device.display_name()),
        Err(e) => report_error(&e),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    let preview = {
        let controller = Arc::clone(&controller);
        let interval = config.camera.preview_interval();
        tokio::spawn(async move { controller.run_preview(interval, shutdown_rx, error_tx).await })
    };

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(err) = error_rx.recv() => report_error(&err),
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => run_command(&controller, command).await,
                    Err(message) => println!("{}", message),
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = preview.await {
        log::warn!("Preview task ended abnormally: {}", e);
    }
    controller.shutdown().await;

    info!("Application shut down gracefully");
    Ok(())
}

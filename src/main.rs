use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use overlay_host::gpu::{HeadlessGpu, RenderGpu};
use overlay_host::persistence::{default_data_dir, ConfigStore};
use overlay_host::platform::{GameWindow, SharedScreen, WindowPlatform};
use overlay_host::{log_error, log_info, log_warn, HostBackends, OverlayHost, RenderSide, ScreenMetrics};
use parking_lot::{Condvar, Mutex};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const FRAME_INTERVAL: Duration = Duration::from_micros(16_667);
const EDIT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum AppCommand {
    SwitchMode(String),
    Hotkey(String),
    Resize(u32, u32),
    Exit,
}

struct Args {
    stream_logs: bool,
    data_dir: Option<PathBuf>,
    run_for: Option<Duration>,
    width: u32,
    height: u32,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = Args {
            stream_logs: false,
            data_dir: None,
            run_for: None,
            width: 1920,
            height: 1080,
        };
        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--stream-logs" => args.stream_logs = true,
                "--data-dir" => {
                    args.data_dir = Some(iter.next().context("--data-dir needs a path")?.into());
                }
                "--run-for" => {
                    let secs: f64 = iter.next().context("--run-for needs seconds")?.parse()?;
                    args.run_for = Some(Duration::from_secs_f64(secs));
                }
                "--size" => {
                    let size = iter.next().context("--size needs WIDTHxHEIGHT")?;
                    (args.width, args.height) = parse_size(&size).context("--size needs WIDTHxHEIGHT")?;
                }
                other => log_warn!("Ignoring unknown argument {}", other),
            }
        }
        Ok(args)
    }
}

fn parse_size(text: &str) -> Option<(u32, u32)> {
    let (w, h) = text.split_once('x')?;
    let (w, h) = (w.trim().parse().ok()?, h.trim().parse().ok()?);
    (w > 0 && h > 0).then_some((w, h))
}

fn parse_command(line: &str) -> Option<AppCommand> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "q" | "quit" | "exit" => Some(AppCommand::Exit),
        "mode" => Some(AppCommand::SwitchMode(parts.next()?.to_string())),
        "hotkey" => Some(AppCommand::Hotkey(parts.collect::<Vec<_>>().join(" "))),
        "size" => parse_size(parts.next()?).map(|(w, h)| AppCommand::Resize(w, h)),
        _ => None,
    }
}

#[cfg(windows)]
fn window_platform() -> Box<dyn WindowPlatform> {
    Box::new(overlay_host::platform_win32::Win32Windows)
}

#[cfg(not(windows))]
fn window_platform() -> Box<dyn WindowPlatform> {
    Box::new(overlay_host::platform::FakeDesktop::new(std::process::id()))
}

fn spawn_stdin_reader(commands: Sender<AppCommand>, wakeup: Arc<(Mutex<()>, Condvar)>) -> Result<()> {
    thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match parse_command(&line) {
                    Some(cmd) => {
                        let exit = matches!(cmd, AppCommand::Exit);
                        let _ = commands.send(cmd);
                        wakeup.1.notify_one();
                        if exit {
                            return;
                        }
                    }
                    None => log_warn!("Unknown command: {}", line.trim()),
                }
            }
            let _ = commands.send(AppCommand::Exit);
            wakeup.1.notify_one();
        })
        .context("Failed to spawn stdin thread")?;
    Ok(())
}

/// Stands in for the host application's render thread: presents at ~60 Hz
/// into a headless back buffer and runs the swap-buffers hook each frame.
fn spawn_render_loop(
    mut gpu: HeadlessGpu,
    mut render: RenderSide,
    screen: SharedScreen,
    size: Arc<Mutex<(u32, u32)>>,
    exit: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("render".to_string())
        .spawn(move || {
            let mut frames = 0u64;
            while !exit.load(Ordering::Acquire) {
                let start = Instant::now();

                let wanted = *size.lock();
                if gpu.backbuffer_size() != Some(wanted) {
                    gpu.resize_backbuffer(wanted.0, wanted.1);
                    screen.set(ScreenMetrics::new(wanted.0, wanted.1));
                }

                let plan = render.on_swap_buffers(&mut gpu);
                frames += 1;
                if frames % 600 == 0 {
                    log_info!(
                        "Frame {}: mode '{}' {}x{}, game frame {:?}",
                        frames,
                        plan.viewport.mode_id,
                        plan.viewport.rect.width,
                        plan.viewport.rect.height,
                        plan.game_frame.map(|f| f.frame_number)
                    );
                }

                let busy = start.elapsed();
                if busy < FRAME_INTERVAL {
                    spin_sleep::sleep(FRAME_INTERVAL - busy);
                }
            }
            render.shutdown(&mut gpu);
            log_info!("Render loop exited after {} frames", frames);
        })
        .context("Failed to spawn render thread")
}

fn main() -> Result<()> {
    let result = run_app();
    if let Err(e) = &result {
        log_error!("Fatal: {:#}", e);
    }
    let _ = overlay_host::logger::finalize_logs();
    result
}

fn run_app() -> Result<()> {
    let args = Args::parse()?;

    let data_dir = match args.data_dir.clone() {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let config_store = ConfigStore::open(&data_dir)?;
    let initial = config_store.load()?;

    if args.stream_logs {
        let _ = tracing_subscriber::fmt().with_target(false).with_thread_names(true).try_init();
    }
    overlay_host::logger::init_logger(
        config_store.logs_dir(),
        "overlay-host",
        initial.log_retention_count,
        args.stream_logs,
    )?;

    log_info!("overlay-host main() started");
    log_info!("Data directory: {}", data_dir.display());
    if let Some(log_path) = overlay_host::logger::get_log_path() {
        log_info!("Log file: {}", log_path.display());
    }
    if args.stream_logs {
        log_info!("Streaming mode enabled via --stream-logs");
    } else {
        log_info!("Buffered mode - logs will be written to file on exit");
    }

    let gpu = HeadlessGpu::new(args.width, args.height);
    let screen = SharedScreen::new(ScreenMetrics::new(args.width, args.height));
    let backends = HostBackends {
        screen: Box::new(screen.clone()),
        windows: window_platform(),
        timeline: gpu.timeline(),
        game_window: Arc::new(GameWindow::default()),
    };

    let (mut host, mut draft, render) = OverlayHost::start(initial, backends)?;

    let exit = Arc::new(AtomicBool::new(false));
    let size = Arc::new(Mutex::new((args.width, args.height)));
    let render_thread = spawn_render_loop(gpu, render, screen, Arc::clone(&size), Arc::clone(&exit))?;

    let wakeup = Arc::new((Mutex::new(()), Condvar::new()));
    let (command_tx, command_rx) = bounded(16);
    spawn_stdin_reader(command_tx, Arc::clone(&wakeup))?;

    log_info!("Entering edit loop");
    edit_loop(&host, &mut draft, &config_store, &command_rx, &size, &wakeup, args.run_for);

    exit.store(true, Ordering::Release);
    host.stop();
    if render_thread.join().is_err() {
        log_error!("Render thread panicked");
    }
    for (name, stats) in host.worker_stats() {
        log_info!("Worker '{}' final stats: {:?}", name, stats);
    }

    if let Some(snapshot) = draft.apply_requests() {
        config_store.save_snapshot(&snapshot);
    }
    config_store.save_snapshot(&host.store().snapshot());
    config_store.close();
    log_info!("=== overlay-host exiting ===");
    Ok(())
}

fn edit_loop(
    host: &OverlayHost,
    draft: &mut overlay_host::ConfigDraft,
    config_store: &ConfigStore,
    commands: &Receiver<AppCommand>,
    size: &Mutex<(u32, u32)>,
    wakeup: &(Mutex<()>, Condvar),
    run_for: Option<Duration>,
) {
    let started = Instant::now();
    loop {
        if run_for.is_some_and(|limit| started.elapsed() >= limit) {
            log_info!("Run time elapsed, exiting");
            return;
        }

        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                AppCommand::SwitchMode(mode) => {
                    log_info!("Switching to mode '{}'", mode);
                    host.switch_mode(&mode, true);
                }
                AppCommand::Hotkey(keys) => host.hotkey_pressed(&keys),
                AppCommand::Resize(w, h) => {
                    log_info!("Resizing back buffer to {}x{}", w, h);
                    *size.lock() = (w, h);
                }
                AppCommand::Exit => {
                    log_info!("Exit requested");
                    return;
                }
            }
        }

        if let Some(snapshot) = draft.apply_requests() {
            log_info!("Published configuration v{}", snapshot.version());
            config_store.save_snapshot(&snapshot);
        }

        let mut guard = wakeup.0.lock();
        wakeup.1.wait_for(&mut guard, EDIT_POLL);
    }
}

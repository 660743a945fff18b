use overlay_host::config::{Configuration, Dimension, ModeConfig, WindowOverlayConfig};
use overlay_host::derived::DerivedCaches;
use overlay_host::gpu::{HeadlessGpu, RenderGpu};
use overlay_host::logic::{LogicWorker, PendingChange};
use overlay_host::persistence::ConfigStore;
use overlay_host::platform::{FakeDesktop, GameWindow, SharedScreen};
use overlay_host::workers::Tick;
use overlay_host::{HostBackends, OverlayHost, ScreenMetrics, SnapshotStore};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn screen_change_republishes_mode_geometry() {
    let screen = SharedScreen::new(ScreenMetrics::new(1920, 1080));
    let mut cfg = Configuration::default();
    cfg.recalculate_dimensions(ScreenMetrics::new(1920, 1080));
    let (store, mut draft) = SnapshotStore::new(cfg);
    draft.publish();
    assert_eq!(store.current_version(), 1);

    let caches = Arc::new(DerivedCaches::new());
    let (_changes_tx, changes_rx) = crossbeam_channel::unbounded::<PendingChange>();
    let mut logic = LogicWorker::new(Arc::clone(&store), Arc::clone(&caches), Box::new(screen.clone()), changes_rx);

    let t0 = Instant::now();
    logic.tick(t0);
    assert!(draft.apply_requests().is_none());

    screen.set(ScreenMetrics::new(2560, 1440));
    logic.tick(t0 + Duration::from_millis(250));
    let republished = draft.apply_requests().expect("resize publishes new geometry");
    assert_eq!(republished.version(), 2);
    assert_eq!(*caches.screen.read().unwrap(), ScreenMetrics::new(2560, 1440));
    assert_eq!(store.current_version(), 2);

    logic.tick(t0 + Duration::from_millis(260));
    assert_eq!(caches.viewport.read().unwrap().rect.width, 2560);
    assert_eq!(caches.viewport.read().unwrap().config_version, 2);
}

#[test]
fn host_captures_overlays_switches_modes_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let config_store = ConfigStore::open(dir.path()).unwrap();

    let mut cfg = config_store.load().unwrap();
    let mut thin = ModeConfig::new("thin");
    thin.width = Dimension::Pixels(330);
    cfg.modes.push(thin);
    cfg.window_overlays.push(WindowOverlayConfig {
        window_title: "Chat".into(),
        ..WindowOverlayConfig::new("chat")
    });

    let desktop = FakeDesktop::new(std::process::id());
    desktop.add_window(10, "Chat", "ChatClass", "chat.exe", std::process::id() + 1);

    let mut gpu = HeadlessGpu::new(1280, 720);
    let backends = HostBackends {
        screen: Box::new(SharedScreen::new(ScreenMetrics::new(1280, 720))),
        windows: Box::new(desktop.clone()),
        timeline: gpu.timeline(),
        game_window: Arc::new(GameWindow::default()),
    };
    let (mut host, mut draft, mut render) = OverlayHost::start(cfg, backends).unwrap();

    assert!(wait_for(|| {
        render.on_swap_buffers(&mut gpu);
        render.overlay_texture("chat").is_some()
    }));
    let uploaded = render.overlay_texture("chat").unwrap();
    assert_eq!((uploaded.width, uploaded.height), (64, 48));
    assert!(!uploaded.error);
    assert!(desktop.captures_of(10) > 0);

    host.switch_mode("thin", false);
    assert!(wait_for(|| {
        let plan = render.on_swap_buffers(&mut gpu);
        plan.viewport.mode_id == "thin" && plan.viewport.rect.width == 330
    }));

    assert!(wait_for(|| draft.apply_requests().is_some() || host.store().current_version() > 0));
    assert!(config_store.save_snapshot(&host.store().snapshot()));

    host.stop();
    render.on_swap_buffers(&mut gpu);
    render.shutdown(&mut gpu);
    assert_eq!(gpu.live_textures(), 0);
    config_store.close();

    let reopened = ConfigStore::open(dir.path()).unwrap();
    let loaded = reopened.load().unwrap();
    assert_eq!(loaded.mode("thin").unwrap().width, Dimension::Pixels(330));
    assert_eq!(loaded.window_overlay("chat").unwrap().window_title, "Chat");
}

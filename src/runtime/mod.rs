pub mod tray;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{LevelFilter, debug, error, info, warn};
use thiserror::Error;
use windows::Win32::Foundation::{COLORREF, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::Graphics::Gdi::{
    GetMonitorInfoW, MONITOR_DEFAULTTOPRIMARY, MONITORINFO, MonitorFromWindow, UpdateWindow,
};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::Input::KeyboardAndMouse::{
    MOD_ALT, MOD_CONTROL, RegisterHotKey, UnregisterHotKey,
};
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GWL_EXSTYLE, GWLP_USERDATA,
    GetDesktopWindow, GetMessageW, GetWindowLongW, IDC_ARROW, LWA_ALPHA, LoadCursorW, MSG,
    PostQuitMessage, RegisterClassW, SW_HIDE, SW_SHOW, SetLayeredWindowAttributes,
    SetWindowLongPtrW, SetWindowLongW, ShowWindow, TranslateMessage, WM_DESTROY,
    WM_HOTKEY, WNDCLASSW, WS_EX_LAYERED, WS_EX_TOPMOST, WS_EX_TRANSPARENT, WS_POPUP,
    GetWindowLongPtrW,
};
use windows::core::w;
use windows_core::{Error as WinError, PCWSTR};

use crate::config::ConfigHandle;
use crate::gfx::device::PipelineOptions;
use crate::gfx::renderer::{Renderer, RendererInitError};
use crate::runtime::tray::{
    MenuCommand, MenuState, OutlinePreset, TrayIcon, WM_TRAYICON, show_menu,
};

/// Render-loop budget; presentation itself is vsync-capped below this.
pub const TARGET_FPS: u32 = 140;

const HOTKEY_CLICK_THROUGH: i32 = 1;
const HOTKEY_VISIBILITY: i32 = 2;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("overlay window creation failed: {0}")]
    WindowCreation(WinError),

    #[error("primary monitor lookup failed: {0}")]
    Monitor(WinError),

    #[error("tray icon registration failed: {0}")]
    Tray(WinError),

    #[error(transparent)]
    Renderer(#[from] RendererInitError),

    #[error("render thread exited before reporting its status")]
    RenderThreadExited,
}

/// HWND is thread-bound by convention; the render thread only ever hands it to
/// DXGI, which is safe from any thread.
#[derive(Clone, Copy)]
struct UncheckedHWND(HWND);
unsafe impl Send for UncheckedHWND {}

#[derive(Default)]
struct SharedFlags {
    running: AtomicBool,
    hidden: AtomicBool,
}

/// Event-thread state reachable from the window procedure.
struct EventState {
    hwnd: HWND,
    config: ConfigHandle,
    flags: Arc<SharedFlags>,
    tray: TrayIcon,
    click_through: bool,
    logging_enabled: bool,
}

impl EventState {
    fn toggle_click_through(&mut self) {
        self.click_through = !self.click_through;
        set_click_through(self.hwnd, self.click_through);
        info!(
            "click-through {}",
            if self.click_through { "enabled" } else { "disabled" }
        );
    }

    fn toggle_visibility(&mut self) {
        let hidden = !self.flags.hidden.load(Ordering::Relaxed);
        self.flags.hidden.store(hidden, Ordering::Relaxed);
        unsafe {
            let _ = ShowWindow(self.hwnd, if hidden { SW_HIDE } else { SW_SHOW });
        }
        info!("overlay {}", if hidden { "hidden" } else { "shown" });
    }

    fn toggle_logging(&mut self) {
        self.logging_enabled = !self.logging_enabled;
        log::set_max_level(if self.logging_enabled {
            LevelFilter::Trace
        } else {
            LevelFilter::Off
        });
        if self.logging_enabled {
            info!("logging enabled");
        }
    }

    fn apply_menu_command(&mut self, command: MenuCommand) {
        match command {
            MenuCommand::ToggleClickThrough => self.toggle_click_through(),
            MenuCommand::ToggleVisibility => self.toggle_visibility(),
            MenuCommand::ToggleParallax => {
                self.config.update(|c| c.enable_parallax ^= 1);
                info!("parallax toggled");
            }
            MenuCommand::ToggleParallaxBarrier => {
                // Barrier and lenticular are mutually exclusive.
                self.config.update(|c| {
                    c.enable_parallax_barrier ^= 1;
                    if c.enable_parallax_barrier == 1 {
                        c.enable_lenticular = 0;
                    }
                });
                info!("parallax barrier toggled");
            }
            MenuCommand::ToggleLenticular => {
                self.config.update(|c| {
                    c.enable_lenticular ^= 1;
                    if c.enable_lenticular == 1 {
                        c.enable_parallax_barrier = 0;
                    }
                });
                info!("lenticular toggled");
            }
            MenuCommand::ToggleLogging => self.toggle_logging(),
            MenuCommand::OutlineOff | MenuCommand::OutlineSubtle | MenuCommand::OutlineStrong => {
                let preset = match command {
                    MenuCommand::OutlineOff => OutlinePreset::Off,
                    MenuCommand::OutlineSubtle => OutlinePreset::Subtle,
                    _ => OutlinePreset::Strong,
                };
                let (width, intensity) = preset.values();
                self.config.update(|c| {
                    c.outline_width = width;
                    c.outline_intensity = intensity;
                });
                info!("outline preset {preset:?} applied");
            }
            MenuCommand::Exit => {
                self.tray.remove();
                unsafe { PostQuitMessage(0) };
            }
        }
    }

    fn menu_state(&self) -> MenuState {
        let snapshot = self.config.snapshot();
        let intensity = snapshot.outline_intensity;
        MenuState {
            click_through: self.click_through,
            hidden: self.flags.hidden.load(Ordering::Relaxed),
            parallax: snapshot.enable_parallax != 0,
            parallax_barrier: snapshot.enable_parallax_barrier != 0,
            lenticular: snapshot.enable_lenticular != 0,
            logging: self.logging_enabled,
            outline: OutlinePreset::classify(intensity),
        }
    }
}

/// The overlay application: one event thread (this one) running the window,
/// tray, and hotkeys, and one render thread running the frame pipeline. The
/// configuration handle is the only state the two share.
pub struct OverlayApp;

impl OverlayApp {
    pub fn run() -> Result<(), RuntimeError> {
        let config = ConfigHandle::new();
        let flags = Arc::new(SharedFlags {
            running: AtomicBool::new(true),
            hidden: AtomicBool::new(false),
        });

        let (origin, size) = primary_monitor_rect()?;
        let hwnd = create_overlay_window(origin, size)?;

        // The renderer initializes on its own thread (all GPU work stays
        // there); startup blocks until it reports in so fatal configuration
        // and device errors surface as a non-zero exit.
        let (ready_tx, ready_rx) = mpsc::channel();
        let render_thread = {
            let hwnd = UncheckedHWND(hwnd);
            let config = config.clone();
            let flags = flags.clone();
            std::thread::spawn(move || render_thread_main(hwnd, size, config, flags, ready_tx))
        };
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = render_thread.join();
                unsafe {
                    let _ = DestroyWindow(hwnd);
                }
                return Err(e.into());
            }
            Err(_) => {
                let _ = render_thread.join();
                unsafe {
                    let _ = DestroyWindow(hwnd);
                }
                return Err(RuntimeError::RenderThreadExited);
            }
        }

        let mut tray = TrayIcon::new(hwnd);
        if let Err(e) = tray.add() {
            flags.running.store(false, Ordering::Relaxed);
            let _ = render_thread.join();
            unsafe {
                let _ = DestroyWindow(hwnd);
            }
            return Err(RuntimeError::Tray(e));
        }

        let alpha = config.snapshot().alpha;
        unsafe {
            let _ = SetLayeredWindowAttributes(
                hwnd,
                COLORREF(0),
                (alpha * 255.0) as u8,
                LWA_ALPHA,
            );
        }
        set_click_through(hwnd, true);

        let state = Box::new(Mutex::new(EventState {
            hwnd,
            config,
            flags: flags.clone(),
            tray,
            click_through: true,
            logging_enabled: true,
        }));
        unsafe { SetWindowLongPtrW(hwnd, GWLP_USERDATA, Box::into_raw(state) as isize) };

        register_hotkeys(hwnd);
        unsafe {
            let _ = ShowWindow(hwnd, SW_SHOW);
            let _ = UpdateWindow(hwnd);
        }
        info!("overlay running");

        let mut msg = MSG::default();
        unsafe {
            while GetMessageW(&mut msg, None, 0, 0).into() {
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }

        // Cooperative shutdown: flip the flag, join the render thread, then
        // tear the window-side state down.
        flags.running.store(false, Ordering::Relaxed);
        if render_thread.join().is_err() {
            error!("render thread panicked during shutdown");
        }
        unsafe {
            let ptr = GetWindowLongPtrW(hwnd, GWLP_USERDATA);
            SetWindowLongPtrW(hwnd, GWLP_USERDATA, 0);
            if ptr != 0 {
                drop(Box::from_raw(ptr as *mut Mutex<EventState>));
            }
            let _ = UnregisterHotKey(Some(hwnd), HOTKEY_CLICK_THROUGH);
            let _ = UnregisterHotKey(Some(hwnd), HOTKEY_VISIBILITY);
            let _ = DestroyWindow(hwnd);
        }
        info!("overlay stopped");
        Ok(())
    }
}

fn render_thread_main(
    hwnd: UncheckedHWND,
    size: (u32, u32),
    config: ConfigHandle,
    flags: Arc<SharedFlags>,
    ready: mpsc::Sender<Result<(), RendererInitError>>,
) {
    let mut renderer =
        match Renderer::new(hwnd.0, size, config, PipelineOptions::default()) {
            Ok(renderer) => {
                let _ = ready.send(Ok(()));
                renderer
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

    let frame_budget = Duration::from_micros(1_000_000 / TARGET_FPS as u64);
    while flags.running.load(Ordering::Relaxed) {
        let started = Instant::now();
        if !flags.hidden.load(Ordering::Relaxed) {
            renderer.tick();
        }
        let elapsed = started.elapsed();
        if elapsed < frame_budget {
            std::thread::sleep(frame_budget - elapsed);
        }
    }
    debug!("render loop stopped");
}

fn primary_monitor_rect() -> Result<((i32, i32), (u32, u32)), RuntimeError> {
    unsafe {
        let monitor = MonitorFromWindow(GetDesktopWindow(), MONITOR_DEFAULTTOPRIMARY);
        let mut info = MONITORINFO {
            cbSize: size_of::<MONITORINFO>() as u32,
            ..Default::default()
        };
        GetMonitorInfoW(monitor, &mut info)
            .ok()
            .map_err(RuntimeError::Monitor)?;
        let rect = info.rcMonitor;
        Ok((
            (rect.left, rect.top),
            (
                (rect.right - rect.left) as u32,
                (rect.bottom - rect.top) as u32,
            ),
        ))
    }
}

fn create_overlay_window(origin: (i32, i32), size: (u32, u32)) -> Result<HWND, RuntimeError> {
    unsafe {
        let hinstance = GetModuleHandleW(None).map_err(RuntimeError::WindowCreation)?;
        let class_name = PCWSTR(w!("HoloDeskOverlay").as_ptr());

        let wc = WNDCLASSW {
            lpfnWndProc: Some(wndproc),
            hInstance: hinstance.into(),
            hCursor: LoadCursorW(None, IDC_ARROW).map_err(RuntimeError::WindowCreation)?,
            lpszClassName: class_name,
            ..Default::default()
        };
        RegisterClassW(&wc);

        CreateWindowExW(
            WS_EX_LAYERED | WS_EX_TRANSPARENT | WS_EX_TOPMOST,
            class_name,
            w!("HoloDesk"),
            WS_POPUP,
            origin.0,
            origin.1,
            size.0 as i32,
            size.1 as i32,
            None,
            None,
            Some(hinstance.into()),
            None,
        )
        .map_err(RuntimeError::WindowCreation)
    }
}

fn register_hotkeys(hwnd: HWND) {
    unsafe {
        if let Err(e) = RegisterHotKey(
            Some(hwnd),
            HOTKEY_CLICK_THROUGH,
            MOD_CONTROL | MOD_ALT,
            'C' as u32,
        ) {
            warn!("click-through hotkey unavailable: {e}");
        }
        if let Err(e) = RegisterHotKey(
            Some(hwnd),
            HOTKEY_VISIBILITY,
            MOD_CONTROL | MOD_ALT,
            'H' as u32,
        ) {
            warn!("visibility hotkey unavailable: {e}");
        }
    }
}

fn set_click_through(hwnd: HWND, enabled: bool) {
    unsafe {
        let style = GetWindowLongW(hwnd, GWL_EXSTYLE) as u32;
        let style = if enabled {
            style | WS_EX_TRANSPARENT.0
        } else {
            style & !WS_EX_TRANSPARENT.0
        };
        SetWindowLongW(hwnd, GWL_EXSTYLE, style as i32);
    }
}

/// Reentrancy guard: the tray menu runs a modal loop that re-enters this
/// procedure, so state access is a try-lock; contended messages fall through
/// to the default handler.
fn with_state<R>(hwnd: HWND, f: impl FnOnce(&mut EventState) -> R) -> Option<R> {
    unsafe {
        let ptr = GetWindowLongPtrW(hwnd, GWLP_USERDATA);
        if ptr == 0 {
            return None;
        }
        let mutex = &*(ptr as *const Mutex<EventState>);
        let mut guard = mutex.try_lock().ok()?;
        Some(f(&mut guard))
    }
}

extern "system" fn wndproc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    match msg {
        WM_DESTROY => {
            unsafe { PostQuitMessage(0) };
            LRESULT(0)
        }
        WM_HOTKEY => {
            match wparam.0 as i32 {
                HOTKEY_CLICK_THROUGH => {
                    with_state(hwnd, |state| state.toggle_click_through());
                }
                HOTKEY_VISIBILITY => {
                    with_state(hwnd, |state| state.toggle_visibility());
                }
                _ => {}
            }
            LRESULT(0)
        }
        WM_TRAYICON => {
            if TrayIcon::is_menu_request(lparam) {
                // Snapshot under the lock, run the modal menu without it.
                let menu_state = with_state(hwnd, |state| state.menu_state());
                if let Some(menu_state) = menu_state
                    && let Some(command) = show_menu(hwnd, &menu_state)
                {
                    with_state(hwnd, |state| state.apply_menu_command(command));
                }
            }
            LRESULT(0)
        }
        _ => unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) },
    }
}

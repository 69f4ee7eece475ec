use windows::Win32::{
    Foundation::{HWND, LPARAM, POINT},
    UI::{
        Shell::{
            NIF_ICON, NIF_MESSAGE, NIF_TIP, NIM_ADD, NIM_DELETE, NOTIFYICONDATAW,
            Shell_NotifyIconW,
        },
        WindowsAndMessaging::{
            AppendMenuW, CreatePopupMenu, DestroyMenu, GetCursorPos, HMENU, IDI_APPLICATION,
            LoadIconW, MENU_ITEM_FLAGS, MF_CHECKED, MF_SEPARATOR, MF_STRING, SetForegroundWindow,
            TPM_LEFTBUTTON, TPM_NONOTIFY, TPM_RETURNCMD, TrackPopupMenuEx, WM_RBUTTONUP, WM_USER,
        },
    },
};
use windows_core::PCWSTR;

/// Callback message the shell delivers for tray-icon interactions.
pub const WM_TRAYICON: u32 = WM_USER + 1;

const TRAY_ICON_ID: u32 = 1;
const TOOLTIP: &str = "HoloDesk";

/// Commands selectable from the tray context menu.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MenuCommand {
    ToggleClickThrough,
    ToggleVisibility,
    ToggleParallax,
    ToggleParallaxBarrier,
    ToggleLenticular,
    ToggleLogging,
    OutlineOff,
    OutlineSubtle,
    OutlineStrong,
    Exit,
}

const MENU_IDS: [(usize, MenuCommand); 10] = [
    (1, MenuCommand::ToggleClickThrough),
    (2, MenuCommand::ToggleVisibility),
    (3, MenuCommand::ToggleParallax),
    (4, MenuCommand::ToggleParallaxBarrier),
    (5, MenuCommand::ToggleLenticular),
    (6, MenuCommand::ToggleLogging),
    (7, MenuCommand::OutlineOff),
    (8, MenuCommand::OutlineSubtle),
    (9, MenuCommand::OutlineStrong),
    (10, MenuCommand::Exit),
];

/// Outline strength buckets shown as mutually exclusive menu checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutlinePreset {
    Off,
    Subtle,
    Strong,
}

impl OutlinePreset {
    pub fn classify(intensity: f32) -> Self {
        if intensity <= 0.0001 {
            Self::Off
        } else if intensity < 0.8 {
            Self::Subtle
        } else {
            Self::Strong
        }
    }

    /// (outline_width, outline_intensity) for the preset.
    pub fn values(self) -> (f32, f32) {
        match self {
            Self::Off => (0.0, 0.0),
            Self::Subtle => (1.5, 0.6),
            Self::Strong => (5.5, 1.0),
        }
    }
}

/// Check states the menu renders from.
pub struct MenuState {
    pub click_through: bool,
    pub hidden: bool,
    pub parallax: bool,
    pub parallax_barrier: bool,
    pub lenticular: bool,
    pub logging: bool,
    pub outline: OutlinePreset,
}

/// The overlay's system-tray icon; removed from the shell on drop.
pub struct TrayIcon {
    hwnd: HWND,
    added: bool,
}

impl TrayIcon {
    pub fn new(hwnd: HWND) -> Self {
        Self { hwnd, added: false }
    }

    pub fn add(&mut self) -> windows_core::Result<()> {
        if self.added {
            return Ok(());
        }
        unsafe {
            let mut nid = NOTIFYICONDATAW {
                cbSize: size_of::<NOTIFYICONDATAW>() as u32,
                hWnd: self.hwnd,
                uID: TRAY_ICON_ID,
                uFlags: NIF_ICON | NIF_MESSAGE | NIF_TIP,
                uCallbackMessage: WM_TRAYICON,
                hIcon: LoadIconW(None, IDI_APPLICATION)?,
                ..Default::default()
            };
            let tip: Vec<u16> = TOOLTIP.encode_utf16().collect();
            nid.szTip[..tip.len()].copy_from_slice(&tip);
            Shell_NotifyIconW(NIM_ADD, &nid).ok()?;
        }
        self.added = true;
        Ok(())
    }

    pub fn remove(&mut self) {
        if !self.added {
            return;
        }
        unsafe {
            let nid = NOTIFYICONDATAW {
                cbSize: size_of::<NOTIFYICONDATAW>() as u32,
                hWnd: self.hwnd,
                uID: TRAY_ICON_ID,
                ..Default::default()
            };
            let _ = Shell_NotifyIconW(NIM_DELETE, &nid);
        }
        self.added = false;
    }

    /// True when the tray message is the right-click that opens the menu.
    pub fn is_menu_request(lparam: LPARAM) -> bool {
        lparam.0 as u32 == WM_RBUTTONUP
    }
}

impl Drop for TrayIcon {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Builds and tracks the context menu at the cursor; blocks until dismissed.
pub fn show_menu(hwnd: HWND, state: &MenuState) -> Option<MenuCommand> {
    unsafe {
        let menu = CreatePopupMenu().ok()?;

        append(menu, 1, "Click-Through", state.click_through);
        append(menu, 2, "Hide Overlay", state.hidden);
        let _ = AppendMenuW(menu, MF_SEPARATOR, 0, PCWSTR::null());
        append(menu, 3, "Parallax Effect", state.parallax);
        append(menu, 4, "Parallax Barrier", state.parallax_barrier);
        append(menu, 5, "Lenticular Sheet", state.lenticular);
        append(menu, 6, "Logging", state.logging);
        let _ = AppendMenuW(menu, MF_SEPARATOR, 0, PCWSTR::null());
        append(menu, 7, "Outline: Off", state.outline == OutlinePreset::Off);
        append(menu, 8, "Outline: Subtle", state.outline == OutlinePreset::Subtle);
        append(menu, 9, "Outline: Strong", state.outline == OutlinePreset::Strong);
        let _ = AppendMenuW(menu, MF_SEPARATOR, 0, PCWSTR::null());
        append(menu, 10, "Exit", false);

        let mut cursor = POINT::default();
        GetCursorPos(&mut cursor).ok()?;
        let _ = SetForegroundWindow(hwnd);

        let selected = TrackPopupMenuEx(
            menu,
            (TPM_LEFTBUTTON | TPM_RETURNCMD | TPM_NONOTIFY).0,
            cursor.x,
            cursor.y,
            hwnd,
            None,
        );
        let _ = DestroyMenu(menu);

        if selected.0 <= 0 {
            return None;
        }
        MENU_IDS
            .iter()
            .find(|(id, _)| *id == selected.0 as usize)
            .map(|(_, command)| *command)
    }
}

unsafe fn append(menu: HMENU, id: usize, label: &str, checked: bool) {
    let mut flags: MENU_ITEM_FLAGS = MF_STRING;
    if checked {
        flags |= MF_CHECKED;
    }
    let wide: Vec<u16> = label.encode_utf16().chain(std::iter::once(0)).collect();
    let _ = unsafe { AppendMenuW(menu, flags, id, PCWSTR(wide.as_ptr())) };
}

#[cfg(test)]
mod tests {
    use super::OutlinePreset;

    #[test]
    fn outline_presets_round_trip_through_classification() {
        for preset in [
            OutlinePreset::Off,
            OutlinePreset::Subtle,
            OutlinePreset::Strong,
        ] {
            let (_, intensity) = preset.values();
            assert_eq!(OutlinePreset::classify(intensity), preset);
        }
    }
}

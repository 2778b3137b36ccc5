//! Synthetic mouse and keyboard input via Win32 `SendInput`.
//!
//! Used by the element model as the click/type fallback when a backend has
//! no native action for an element.  Events within one gesture are batched
//! into a single `SendInput` call so they cannot interleave with user
//! input.

#![cfg(windows)]

use std::mem;

use windows::Win32::UI::Input::KeyboardAndMouse::{
    SendInput, INPUT, INPUT_0, INPUT_KEYBOARD, INPUT_MOUSE, KEYBDINPUT, KEYBD_EVENT_FLAGS,
    KEYEVENTF_KEYUP, KEYEVENTF_UNICODE, MOUSEEVENTF_ABSOLUTE, MOUSEEVENTF_LEFTDOWN,
    MOUSEEVENTF_LEFTUP, MOUSEEVENTF_MIDDLEDOWN, MOUSEEVENTF_MIDDLEUP, MOUSEEVENTF_MOVE,
    MOUSEEVENTF_RIGHTDOWN, MOUSEEVENTF_RIGHTUP, MOUSEINPUT, MOUSE_EVENT_FLAGS, VIRTUAL_KEY,
};
use windows::Win32::UI::WindowsAndMessaging::{
    GetSystemMetrics, SM_CXVIRTUALSCREEN, SM_CYVIRTUALSCREEN,
};

use crate::geometry::Point;

/// Mouse button selector for [`click_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// Virtual-screen size, re-read on every call (resolution can change).
fn screen_dimensions() -> (i32, i32) {
    unsafe {
        let w = GetSystemMetrics(SM_CXVIRTUALSCREEN);
        let h = GetSystemMetrics(SM_CYVIRTUALSCREEN);
        if w > 0 && h > 0 {
            (w, h)
        } else {
            (1920, 1080)
        }
    }
}

/// Pixel coordinates to the 0..65535 normalised space `SendInput` expects.
fn normalise(p: Point) -> (i32, i32) {
    let (w, h) = screen_dimensions();
    if w <= 1 || h <= 1 {
        return (0, 0);
    }
    (
        ((p.x as i64 * 65535) / (w as i64 - 1)).clamp(0, 65535) as i32,
        ((p.y as i64 * 65535) / (h as i64 - 1)).clamp(0, 65535) as i32,
    )
}

fn mouse_input(abs_x: i32, abs_y: i32, flags: MOUSE_EVENT_FLAGS) -> INPUT {
    INPUT {
        r#type: INPUT_MOUSE,
        Anonymous: INPUT_0 {
            mi: MOUSEINPUT {
                dx: abs_x,
                dy: abs_y,
                mouseData: 0,
                dwFlags: flags,
                time: 0,
                dwExtraInfo: 0,
            },
        },
    }
}

fn unicode_key(scan: u16, key_up: bool) -> INPUT {
    let flags = if key_up {
        KEYEVENTF_UNICODE | KEYEVENTF_KEYUP
    } else {
        KEYEVENTF_UNICODE
    };
    INPUT {
        r#type: INPUT_KEYBOARD,
        Anonymous: INPUT_0 {
            ki: KEYBDINPUT {
                wVk: VIRTUAL_KEY(0),
                wScan: scan,
                dwFlags: flags,
                time: 0,
                dwExtraInfo: 0,
            },
        },
    }
}

fn virtual_key(vk: u16, key_up: bool) -> INPUT {
    let flags = if key_up { KEYEVENTF_KEYUP } else { KEYBD_EVENT_FLAGS(0) };
    INPUT {
        r#type: INPUT_KEYBOARD,
        Anonymous: INPUT_0 {
            ki: KEYBDINPUT {
                wVk: VIRTUAL_KEY(vk),
                wScan: 0,
                dwFlags: flags,
                time: 0,
                dwExtraInfo: 0,
            },
        },
    }
}

/// Click at absolute screen coordinates: move, press, release.
///
/// Returns the number of injected events (3 on success).
pub fn click_at(point: Point, button: MouseButton) -> u32 {
    let (abs_x, abs_y) = normalise(point);
    let (down, up) = match button {
        MouseButton::Left => (MOUSEEVENTF_LEFTDOWN, MOUSEEVENTF_LEFTUP),
        MouseButton::Right => (MOUSEEVENTF_RIGHTDOWN, MOUSEEVENTF_RIGHTUP),
        MouseButton::Middle => (MOUSEEVENTF_MIDDLEDOWN, MOUSEEVENTF_MIDDLEUP),
    };
    let move_flags = MOUSEEVENTF_ABSOLUTE | MOUSEEVENTF_MOVE;
    let inputs = [
        mouse_input(abs_x, abs_y, move_flags),
        mouse_input(abs_x, abs_y, move_flags | down),
        mouse_input(abs_x, abs_y, move_flags | up),
    ];
    unsafe { SendInput(&inputs, mem::size_of::<INPUT>() as i32) }
}

/// Move the cursor without clicking.
pub fn move_to(point: Point) -> u32 {
    let (abs_x, abs_y) = normalise(point);
    let input = mouse_input(abs_x, abs_y, MOUSEEVENTF_ABSOLUTE | MOUSEEVENTF_MOVE);
    unsafe { SendInput(&[input], mem::size_of::<INPUT>() as i32) }
}

/// Type text as `KEYEVENTF_UNICODE` events, one down/up pair per UTF-16
/// unit.  Returns the number of injected events.
pub fn type_text(text: &str) -> u32 {
    let units: Vec<u16> = text.encode_utf16().collect();
    if units.is_empty() {
        return 0;
    }
    let mut inputs = Vec::with_capacity(units.len() * 2);
    for &unit in &units {
        inputs.push(unicode_key(unit, false));
        inputs.push(unicode_key(unit, true));
    }
    unsafe { SendInput(&inputs, mem::size_of::<INPUT>() as i32) }
}

/// Press a key combination: all keys down in order, released in reverse,
/// in one atomic batch.
pub fn hotkey(vk_codes: &[u16]) -> u32 {
    if vk_codes.is_empty() {
        return 0;
    }
    let mut inputs = Vec::with_capacity(vk_codes.len() * 2);
    for &vk in vk_codes {
        inputs.push(virtual_key(vk, false));
    }
    for &vk in vk_codes.iter().rev() {
        inputs.push(virtual_key(vk, true));
    }
    unsafe { SendInput(&inputs, mem::size_of::<INPUT>() as i32) }
}

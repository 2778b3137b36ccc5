//! Window commands: inspect, show/hide, move, screenshot.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "winspect-window", about = "Inspect and drive a top-level window")]
struct Args {
    /// Window handle.  Defaults to the foreground window, unless --title
    /// is given.
    #[arg(long)]
    hwnd: Option<isize>,

    /// Find the window by exact title instead of a handle.
    #[arg(long)]
    title: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all visible top-level windows as JSON.
    List,
    /// Print the window's identity and geometry as JSON.
    Info,
    /// Bring the window to the foreground.
    Foreground,
    Show,
    Hide,
    Minimize,
    Maximize,
    Restore,
    /// Move and/or resize the window.
    Move {
        #[arg(long)]
        x: Option<i32>,
        #[arg(long)]
        y: Option<i32>,
        #[arg(long)]
        width: Option<i32>,
        #[arg(long)]
        height: Option<i32>,
    },
    /// Capture the window into an image file.
    Screenshot { path: std::path::PathBuf },
}

#[cfg(windows)]
fn main() {
    use winspect_core::driver::WindowHandle;
    use winspect_core::win32;

    let args = Args::parse();

    if let Command::List = args.command {
        match win32::list_windows() {
            Ok(windows) => println!("{}", serde_json::to_string_pretty(&windows).unwrap()),
            Err(e) => {
                eprintln!("window enumeration failed: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let window = match (&args.title, args.hwnd) {
        (Some(title), _) => WindowHandle::find(None, Some(title)),
        (None, Some(hwnd)) => WindowHandle::open(hwnd),
        (None, None) => WindowHandle::open(win32::foreground_window()),
    }
    .unwrap_or_else(|e| {
        eprintln!("failed to open window: {e}");
        std::process::exit(1);
    });

    match args.command {
        Command::List => unreachable!("handled above"),
        Command::Info => {
            #[derive(serde::Serialize)]
            struct Info<'a> {
                #[serde(flatten)]
                window: &'a WindowHandle,
                rectangle: Option<winspect_core::geometry::Rect>,
                minimized: bool,
                maximized: bool,
            }
            let info = Info {
                window: &window,
                rectangle: window.rectangle().ok(),
                minimized: window.is_minimized(),
                maximized: window.is_maximized(),
            };
            println!("{}", serde_json::to_string_pretty(&info).unwrap());
        }
        Command::Foreground => report(window.set_foreground()),
        Command::Show => report(window.show()),
        Command::Hide => report(window.hide()),
        Command::Minimize => report(window.minimize()),
        Command::Maximize => report(window.maximize()),
        Command::Restore => report(window.restore()),
        Command::Move { x, y, width, height } => {
            if let Err(e) = window.move_window(x, y, width, height) {
                eprintln!("move failed: {e}");
                std::process::exit(1);
            }
        }
        Command::Screenshot { path } => {
            if let Err(e) = window.screenshot(Some(&path)) {
                eprintln!("screenshot failed: {e}");
                std::process::exit(1);
            }
            eprintln!("saved {}", path.display());
        }
    }
}

#[cfg(windows)]
fn report(ok: bool) {
    if !ok {
        eprintln!("the window refused the command");
        std::process::exit(1);
    }
}

#[cfg(not(windows))]
fn main() {
    let _ = Args::parse();
    eprintln!("winspect-window only runs on Windows");
    std::process::exit(1);
}

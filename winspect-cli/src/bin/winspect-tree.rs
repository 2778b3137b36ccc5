//! Dump a window's element tree as JSON (UIA or JAB backend).

use clap::Parser;

#[derive(Parser)]
#[command(name = "winspect-tree", about = "Dump a window's UI element tree as JSON")]
struct Args {
    /// Window handle to inspect.  Defaults to the foreground window.
    #[arg(long)]
    hwnd: Option<isize>,

    /// Backend to read the tree from.
    #[arg(long, default_value = "uia")]
    backend: String,

    /// Maximum tree depth.
    #[arg(long, default_value = "50")]
    max_depth: usize,

    /// Compact JSON output (no pretty-printing).
    #[arg(long)]
    compact: bool,
}

#[cfg(windows)]
fn main() {
    use winspect_core::{jab::JabDriver, uia::UiaDriver, win32};

    let args = Args::parse();
    let handle = args.hwnd.unwrap_or_else(win32::foreground_window);

    let snapshot = match args.backend.as_str() {
        "uia" => {
            let driver = UiaDriver::new(handle).unwrap_or_else(|e| {
                eprintln!("failed to open window {handle}: {e}");
                std::process::exit(1);
            });
            driver.capture_tree(args.max_depth).unwrap_or_else(|e| {
                eprintln!("tree capture failed: {e}");
                std::process::exit(1);
            })
        }
        "jab" => {
            let driver = JabDriver::new(handle).unwrap_or_else(|e| {
                eprintln!("failed to open window {handle}: {e}");
                std::process::exit(1);
            });
            match driver.capture_tree(args.max_depth) {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => {
                    eprintln!("window {handle} is not a Java window");
                    std::process::exit(2);
                }
                Err(e) => {
                    eprintln!("tree capture failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        other => {
            eprintln!("unknown backend '{other}', expected 'uia' or 'jab'");
            std::process::exit(1);
        }
    };

    let json = if args.compact {
        serde_json::to_string(&snapshot).unwrap()
    } else {
        serde_json::to_string_pretty(&snapshot).unwrap()
    };
    println!("{json}");
}

#[cfg(not(windows))]
fn main() {
    let _ = Args::parse();
    eprintln!("winspect-tree only runs on Windows");
    std::process::exit(1);
}

//! Locate a reference image inside a window screenshot.

use clap::Parser;

#[derive(Parser)]
#[command(name = "winspect-locate", about = "Find a reference image inside a window")]
struct Args {
    /// Reference image path (PNG/JPEG).
    image: std::path::PathBuf,

    /// Window handle to search.  Defaults to the foreground window.
    #[arg(long)]
    hwnd: Option<isize>,

    /// Match threshold in (0, 1].
    #[arg(long, default_value = "0.7")]
    threshold: f32,

    /// Comma-separated matcher list (tpl, mstpl, sift, brisk, orb, brief).
    #[arg(long, default_value = "mstpl,tpl,sift,brisk")]
    strategy: String,

    /// Verify hits with the HSV colour confidence.
    #[arg(long)]
    color: bool,
}

#[cfg(windows)]
fn main() {
    use winspect_core::driver::WindowHandle;
    use winspect_core::template::Template;
    use winspect_core::win32;

    let args = Args::parse();
    let handle = args.hwnd.unwrap_or_else(win32::foreground_window);
    let names: Vec<&str> = args.strategy.split(',').map(str::trim).collect();

    let window = WindowHandle::open(handle).unwrap_or_else(|e| {
        eprintln!("failed to open window {handle}: {e}");
        std::process::exit(1);
    });
    let screen = window.screenshot(None).unwrap_or_else(|e| {
        eprintln!("screenshot failed: {e}");
        std::process::exit(1);
    });

    let template = Template::new(args.image)
        .threshold(args.threshold)
        .use_color(args.color)
        .strategy(&names);

    match template.match_rect_in(&screen) {
        Ok(Some(hit)) => {
            println!("{}", serde_json::to_string_pretty(&hit).unwrap());
        }
        Ok(None) => {
            eprintln!("no match above threshold {}", args.threshold);
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("matching failed: {e}");
            std::process::exit(1);
        }
    }
}

#[cfg(not(windows))]
fn main() {
    let _ = Args::parse();
    eprintln!("winspect-locate only runs on Windows");
    std::process::exit(1);
}

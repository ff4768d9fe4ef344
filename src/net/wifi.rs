//! Best-effort lookup of the current Wi-Fi network name.
//!
//! Only used for the status line: every failure collapses to [`UNKNOWN_SSID`].

/// Returned when the SSID cannot be determined.
pub const UNKNOWN_SSID: &str = "unknown";

/// Returns the SSID of the active Wi-Fi connection, or `"unknown"`.
///
/// Shells out to the platform tool (`ipconfig`/`networksetup` on macOS,
/// `iwgetid` on Linux, `netsh` on Windows). Blocking; call it from
/// `spawn_blocking` inside async code.
pub fn wifi_ssid() -> String {
    platform_ssid().unwrap_or_else(|| UNKNOWN_SSID.to_string())
}

#[cfg(target_os = "macos")]
fn platform_ssid() -> Option<String> {
    run(&["ipconfig", "getsummary", "en0"])
        .and_then(|out| parse_macos_summary(&out))
        .or_else(|| {
            run(&["networksetup", "-getairportnetwork", "en0"])
                .and_then(|out| parse_macos_airport(&out))
        })
}

#[cfg(target_os = "linux")]
fn platform_ssid() -> Option<String> {
    run(&["iwgetid", "-r"]).and_then(|out| non_empty(out.trim()))
}

#[cfg(target_os = "windows")]
fn platform_ssid() -> Option<String> {
    run(&["netsh", "wlan", "show", "interfaces"]).and_then(|out| parse_netsh(&out))
}

#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
fn platform_ssid() -> Option<String> {
    None
}

#[cfg(any(target_os = "macos", target_os = "linux", target_os = "windows"))]
fn run(args: &[&str]) -> Option<String> {
    let (program, rest) = args.split_first()?;
    let output = std::process::Command::new(program).args(rest).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

#[cfg(any(test, target_os = "macos", target_os = "linux", target_os = "windows"))]
fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

#[cfg(any(test, target_os = "macos"))]
fn parse_macos_summary(out: &str) -> Option<String> {
    out.lines()
        .filter_map(|line| line.trim().strip_prefix("SSID : "))
        .find_map(non_empty)
}

#[cfg(any(test, target_os = "macos"))]
fn parse_macos_airport(out: &str) -> Option<String> {
    out.trim()
        .strip_prefix("Current Wi-Fi Network: ")
        .and_then(non_empty)
}

#[cfg(any(test, target_os = "windows"))]
fn parse_netsh(out: &str) -> Option<String> {
    out.lines()
        .map(str::trim)
        .filter(|line| line.starts_with("SSID") && !line.starts_with("BSSID"))
        .find_map(|line| line.split_once(':'))
        .and_then(|(_, ssid)| non_empty(ssid.trim()))
}

//! Host CPU probing for the effort score.
//!
//! Each platform has its own way of reporting clock speed; all of them
//! degrade to [`BASELINE_GHZ`] so a weird host just gets conservative
//! timeouts instead of an error.

/// Assumed clock speed when the platform will not tell us.
pub const BASELINE_GHZ: f64 = 2.5;

/// Threads available to the encoder.
pub fn encode_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Average current clock speed from /proc/cpuinfo.
#[cfg(target_os = "linux")]
pub fn cpu_ghz() -> f64 {
    match std::fs::read_to_string("/proc/cpuinfo") {
        Ok(data) => parse_cpuinfo_mhz(&data).map_or(BASELINE_GHZ, |mhz| mhz / 1000.0),
        Err(_) => BASELINE_GHZ,
    }
}

#[cfg(target_os = "linux")]
fn parse_cpuinfo_mhz(data: &str) -> Option<f64> {
    let mut total = 0.0;
    let mut count = 0u32;
    for line in data.lines() {
        if !line.starts_with("cpu MHz") {
            continue;
        }
        let Some((_, value)) = line.split_once(':') else {
            continue;
        };
        let Ok(mhz) = value.trim().parse::<f64>() else {
            continue;
        };
        total += mhz;
        count += 1;
    }
    (count > 0).then(|| total / f64::from(count))
}

/// Maximum clock speed via sysctl.
#[cfg(target_os = "macos")]
pub fn cpu_ghz() -> f64 {
    let out = std::process::Command::new("sysctl")
        .args(["-n", "hw.cpufrequency_max"])
        .output();
    let Ok(out) = out else {
        return BASELINE_GHZ;
    };
    let hz: f64 = match String::from_utf8_lossy(&out.stdout).trim().parse() {
        Ok(hz) => hz,
        Err(_) => return BASELINE_GHZ,
    };
    if hz <= 0.0 {
        return BASELINE_GHZ;
    }
    hz / 1e9
}

/// Maximum clock speed from the registry via wmic.
#[cfg(target_os = "windows")]
pub fn cpu_ghz() -> f64 {
    let out = std::process::Command::new("wmic")
        .args(["cpu", "get", "MaxClockSpeed", "/value"])
        .output();
    let Ok(out) = out else {
        return BASELINE_GHZ;
    };
    for line in String::from_utf8_lossy(&out.stdout).lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("MaxClockSpeed=") {
            return match value.parse::<f64>() {
                Ok(mhz) if mhz > 0.0 => mhz / 1000.0,
                _ => BASELINE_GHZ,
            };
        }
    }
    BASELINE_GHZ
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub fn cpu_ghz() -> f64 {
    BASELINE_GHZ
}
